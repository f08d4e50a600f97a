//! Cloneable handle to a running worker.
//!
//! Code outside the worker's own handlers (host services, spawned tasks,
//! tests) talks to a worker only through its handle. Requests sent through a
//! handle leave the worker as that worker, so they are ordered with
//! everything else it sends.

use crate::error::ChannelError;
use crate::ids::ChannelId;
use crate::worker::context::{ReplyToken, WorkerContext};
use serde_json::Value;
use std::fmt;
use tokio::sync::{mpsc, oneshot};

/// Inspection closure run on the worker's own task.
pub(crate) type InspectFn = Box<dyn FnOnce(&mut WorkerContext) + Send>;

pub(crate) enum WorkerCommand {
    Request {
        dest: ChannelId,
        verb: String,
        payload: Value,
        reply: oneshot::Sender<Result<Value, ChannelError>>,
    },
    Push {
        dest: ChannelId,
        verb: String,
        payload: Value,
        quiet: bool,
    },
    /// Dispatch a push to this worker's own handler
    Local { verb: String, payload: Value },
    /// Answer a deferred request
    Complete {
        token: ReplyToken,
        result: Result<Value, ChannelError>,
    },
    CommitDone { success: bool },
    Inspect(InspectFn),
    Shutdown { done: oneshot::Sender<()> },
}

impl fmt::Debug for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerCommand::Request { dest, verb, .. } => {
                write!(f, "Request({dest} {verb})")
            }
            WorkerCommand::Push { dest, verb, .. } => write!(f, "Push({dest} {verb})"),
            WorkerCommand::Local { verb, .. } => write!(f, "Local({verb})"),
            WorkerCommand::Complete { token, .. } => write!(f, "Complete({})", token.id),
            WorkerCommand::CommitDone { success } => write!(f, "CommitDone({success})"),
            WorkerCommand::Inspect(_) => write!(f, "Inspect"),
            WorkerCommand::Shutdown { .. } => write!(f, "Shutdown"),
        }
    }
}

#[derive(Clone)]
pub struct WorkerHandle {
    id: ChannelId,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle").field("id", &self.id).finish()
    }
}

impl WorkerHandle {
    pub(crate) fn new(id: ChannelId, commands: mpsc::UnboundedSender<WorkerCommand>) -> Self {
        Self { id, commands }
    }

    pub fn id(&self) -> &ChannelId {
        &self.id
    }

    /// Whether the worker's task is still running.
    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }

    pub(crate) fn command(&self, command: WorkerCommand) -> Result<(), ChannelError> {
        self.commands
            .send(command)
            .map_err(|_| ChannelError::ShuttingDown)
    }

    /// Sends a request from this worker to `dest` and waits for the answer.
    pub async fn request(
        &self,
        dest: &ChannelId,
        verb: &str,
        payload: Value,
    ) -> Result<Value, ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.command(WorkerCommand::Request {
            dest: dest.clone(),
            verb: verb.to_string(),
            payload,
            reply,
        })?;
        rx.await.map_err(|_| ChannelError::ShuttingDown)?
    }

    /// Sends a one-way message from this worker to `dest`.
    pub fn push(&self, dest: &ChannelId, verb: &str, payload: Value) -> Result<(), ChannelError> {
        self.command(WorkerCommand::Push {
            dest: dest.clone(),
            verb: verb.to_string(),
            payload,
            quiet: false,
        })
    }

    pub fn push_quiet(
        &self,
        dest: &ChannelId,
        verb: &str,
        payload: Value,
    ) -> Result<(), ChannelError> {
        self.command(WorkerCommand::Push {
            dest: dest.clone(),
            verb: verb.to_string(),
            payload,
            quiet: true,
        })
    }

    /// Dispatches `verb` to the worker's own handler, in order with its
    /// other messages.
    pub fn notify_self(&self, verb: &str, payload: Value) -> Result<(), ChannelError> {
        self.command(WorkerCommand::Local {
            verb: verb.to_string(),
            payload,
        })
    }

    /// Answers a request whose handler deferred its reply.
    pub fn complete(
        &self,
        token: ReplyToken,
        result: Result<Value, ChannelError>,
    ) -> Result<(), ChannelError> {
        self.command(WorkerCommand::Complete { token, result })
    }

    /// Runs `f` on the worker's task between two messages.
    pub async fn inspect<R, F>(&self, f: F) -> Result<R, ChannelError>
    where
        R: Send + 'static,
        F: FnOnce(&mut WorkerContext) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.command(WorkerCommand::Inspect(Box::new(move |ctx| {
            let _ = tx.send(f(ctx));
        })))?;
        rx.await.map_err(|_| ChannelError::ShuttingDown)
    }

    /// Stops the worker: unregister, final commit, then exit.
    pub async fn shutdown(&self) -> Result<(), ChannelError> {
        let (done, rx) = oneshot::channel();
        self.command(WorkerCommand::Shutdown { done })?;
        rx.await.map_err(|_| ChannelError::ShuttingDown)
    }
}
