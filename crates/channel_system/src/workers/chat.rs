//! # Chattable
//!
//! Mixin adding chat to any worker type: `chat_send` validates, gates and
//! records a message, then broadcasts `chat_msg` to every subscriber;
//! `chat_get` returns recent history; the `chat_clear` admin command empties
//! it. History is a bounded ring kept under `private.chat.history` and the
//! last message number under `private.chat.last_seq`, so both persist with
//! the channel when the type persists. Numbers keep rising across a clear.
//!
//! ```ignore
//! let room = chattable(
//!     WorkerTypeBuilder::new("room").auto_destroy(true),
//!     ChatSettings::default(),
//!     Arc::new(DefaultChatPolicy),
//! )
//! .build()?;
//! ```

use crate::error::ChannelError;
use crate::worker::{Incoming, Reply, WorkerContext, WorkerTypeBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Private key holding the history ring.
pub const HISTORY_KEY: &str = "private.chat.history";
/// Private key holding the number of the last message sent.
pub const LAST_SEQ_KEY: &str = "private.chat.last_seq";
/// Verb of the broadcast carrying a new message.
pub const CHAT_MSG_VERB: &str = "chat_msg";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatSettings {
    pub history_size: usize,
    pub max_length: usize,
    /// Minimum time between two messages of one sender in one channel
    pub cooldown_ms: u64,
    pub min_account_age_secs: u64,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            history_size: 50,
            max_length: 500,
            cooldown_ms: 1000,
            min_account_age_secs: 0,
        }
    }
}

impl ChatSettings {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Body of `chat_send`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSend {
    pub user: String,
    pub text: String,
    #[serde(default)]
    pub account_age_secs: u64,
}

/// A recorded message, as stored and broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub seq: u64,
    pub user: String,
    pub text: String,
    pub beat: u64,
}

/// Gates on who may chat. Worker types override what they need.
pub trait ChatPolicy: Send + Sync {
    fn check_cooldown(
        &self,
        settings: &ChatSettings,
        last_sent: Option<Instant>,
        now: Instant,
    ) -> Result<(), ChannelError> {
        match last_sent {
            Some(last) if now.saturating_duration_since(last) < settings.cooldown() => {
                Err(ChannelError::Quiet("chat cooldown".to_string()))
            }
            _ => Ok(()),
        }
    }

    fn check_account_age(&self, settings: &ChatSettings, message: &ChatSend) -> Result<(), ChannelError> {
        if message.account_age_secs < settings.min_account_age_secs {
            return Err(ChannelError::Domain("account too new to chat".to_string()));
        }
        Ok(())
    }
}

/// The default gates, unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultChatPolicy;

impl ChatPolicy for DefaultChatPolicy {}

/// Per-instance chat state: when each sender last spoke, for the cooldown.
#[derive(Debug, Default)]
pub struct ChatState {
    last_sent: HashMap<String, Instant>,
}

impl ChatState {
    pub fn last_sent(&self, user: &str) -> Option<Instant> {
        self.last_sent.get(user).copied()
    }

    /// Records a message from `user`, forgetting senders whose cooldown has
    /// run out.
    pub fn note_sent(&mut self, user: &str, now: Instant, cooldown: Duration) {
        self.last_sent
            .retain(|_, at| now.saturating_duration_since(*at) < cooldown);
        self.last_sent.insert(user.to_string(), now);
    }

    /// Senders still inside their cooldown.
    pub fn tracked(&self) -> usize {
        self.last_sent.len()
    }
}

fn history(ctx: &WorkerContext) -> Result<Vec<ChatMessage>, ChannelError> {
    match ctx.get(HISTORY_KEY) {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Ok(Vec::new()),
    }
}

fn chat_send(
    ctx: &mut WorkerContext,
    incoming: &Incoming,
    settings: &ChatSettings,
    policy: &dyn ChatPolicy,
) -> Result<Reply, ChannelError> {
    let mut send: ChatSend = incoming.parse()?;
    send.text = send.text.trim().to_string();
    if send.text.is_empty() {
        return Err(ChannelError::Quiet("empty chat message".to_string()));
    }
    if send.text.chars().count() > settings.max_length {
        return Err(ChannelError::Domain(format!(
            "chat message longer than {} characters",
            settings.max_length
        )));
    }
    policy.check_account_age(settings, &send)?;
    let now = Instant::now();
    let last_sent = ctx
        .ext::<ChatState>()
        .and_then(|state| state.last_sent(&send.user));
    policy.check_cooldown(settings, last_sent, now)?;

    let mut ring = history(ctx)?;
    let last_seq = ctx
        .get(LAST_SEQ_KEY)
        .and_then(Value::as_u64)
        .or_else(|| ring.last().map(|m| m.seq))
        .unwrap_or(0);
    let message = ChatMessage {
        seq: last_seq + 1,
        user: send.user,
        text: send.text,
        beat: ctx.beat(),
    };
    ring.push(message.clone());
    if ring.len() > settings.history_size {
        let excess = ring.len() - settings.history_size;
        ring.drain(..excess);
    }
    ctx.set(HISTORY_KEY, Some(serde_json::to_value(&ring)?))?;
    ctx.set(LAST_SEQ_KEY, Some(json!(message.seq)))?;
    if let Some(state) = ctx.ext_mut::<ChatState>() {
        state.note_sent(&message.user, now, settings.cooldown());
    }

    info!(channel = %ctx.id(), user = %message.user, seq = message.seq, text = %message.text, "chat");
    ctx.broadcast(CHAT_MSG_VERB, serde_json::to_value(&message)?, true);
    Reply::json(&message)
}

#[derive(Debug, Default, Deserialize)]
struct ChatGet {
    /// Only messages after this sequence number
    #[serde(default)]
    since: Option<u64>,
    #[serde(default)]
    limit: Option<usize>,
}

fn chat_get(ctx: &mut WorkerContext, incoming: &Incoming) -> Result<Reply, ChannelError> {
    let query: ChatGet = if incoming.payload.is_null() {
        ChatGet::default()
    } else {
        incoming.parse()?
    };
    let mut messages: Vec<ChatMessage> = history(ctx)?
        .into_iter()
        .filter(|m| query.since.map_or(true, |since| m.seq > since))
        .collect();
    if let Some(limit) = query.limit {
        let skip = messages.len().saturating_sub(limit);
        messages.drain(..skip);
    }
    Ok(Reply::Value(json!({ "messages": messages })))
}

/// Adds chat to `builder`.
pub fn chattable(
    builder: WorkerTypeBuilder,
    settings: ChatSettings,
    policy: Arc<dyn ChatPolicy>,
) -> WorkerTypeBuilder {
    builder
        .extension::<ChatState>()
        .handler("chat_send", move |ctx, incoming| {
            chat_send(ctx, incoming, &settings, policy.as_ref())
        })
        .handler("chat_get", chat_get)
        .command("chat_clear", |ctx, _args| {
            Ok(format!("cleared {} messages", clear_history(ctx)?))
        })
}

/// Drops the history.
pub fn clear_history(ctx: &mut WorkerContext) -> Result<usize, ChannelError> {
    let cleared = history(ctx)?.len();
    ctx.set(HISTORY_KEY, Some(Value::Array(Vec::new())))?;
    Ok(cleared)
}
