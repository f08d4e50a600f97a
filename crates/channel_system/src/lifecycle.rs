//! # Worker Lifecycle
//!
//! Auto-destroy state machine of one worker:
//!
//! ```text
//! Active -> AutoDestroyPending -> LockRequested -> ShuttingDown -> Destroyed
//!   ^              |                    |
//!   +--------------+--------------------+   (activity / no longer eligible)
//! ```
//!
//! A worker is eligible when it opted in, has no subscribers, nothing
//! buffered inbound, no persistence write pending and no outstanding
//! requests of its own. Eligibility is re-checked when the master's lock
//! grant arrives; a grant that finds the worker busy is handed back.

use tokio::time::{Duration, Instant};

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Active,
    AutoDestroyPending { since: Instant },
    LockRequested,
    ShuttingDown,
    Destroyed,
}

/// Snapshot of everything that keeps a worker alive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Idleness {
    pub subscribers: usize,
    pub pending_inbound: usize,
    pub pending_write: bool,
    pub outstanding_requests: usize,
}

impl Idleness {
    pub fn is_idle(&self) -> bool {
        self.subscribers == 0
            && self.pending_inbound == 0
            && !self.pending_write
            && self.outstanding_requests == 0
    }
}

/// What the runtime must do after a lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    None,
    /// Send `master_lock` for this worker
    RequestLock,
    /// Lock held: unregister, flush, then send `master_unlock`
    Shutdown,
    /// Lock granted but the worker is busy again: send `master_unlock`
    ReleaseLock,
}

#[derive(Debug)]
pub struct Lifecycle {
    auto_destroy: bool,
    idle_grace: Duration,
    state: LifecycleState,
    activity_while_locking: bool,
}

impl Lifecycle {
    pub fn new(auto_destroy: bool, idle_grace: Duration) -> Self {
        Self {
            auto_destroy,
            idle_grace,
            state: LifecycleState::Active,
            activity_while_locking: false,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn is_shutting_down(&self) -> bool {
        matches!(
            self.state,
            LifecycleState::ShuttingDown | LifecycleState::Destroyed
        )
    }

    /// A message was handled.
    pub fn note_activity(&mut self) {
        match self.state {
            LifecycleState::AutoDestroyPending { .. } => self.state = LifecycleState::Active,
            LifecycleState::LockRequested => self.activity_while_locking = true,
            _ => {}
        }
    }

    /// Periodic eligibility check.
    pub fn poll(&mut self, idle: Idleness, now: Instant) -> LifecycleAction {
        if !self.auto_destroy {
            return LifecycleAction::None;
        }
        match self.state {
            LifecycleState::Active if idle.is_idle() => {
                self.state = LifecycleState::AutoDestroyPending { since: now };
                LifecycleAction::None
            }
            LifecycleState::AutoDestroyPending { .. } if !idle.is_idle() => {
                self.state = LifecycleState::Active;
                LifecycleAction::None
            }
            LifecycleState::AutoDestroyPending { since }
                if now.duration_since(since) >= self.idle_grace =>
            {
                self.state = LifecycleState::LockRequested;
                self.activity_while_locking = false;
                LifecycleAction::RequestLock
            }
            _ => LifecycleAction::None,
        }
    }

    /// The master answered `master_lock`.
    pub fn on_lock_result(&mut self, granted: bool, idle: Idleness) -> LifecycleAction {
        if self.state != LifecycleState::LockRequested {
            return if granted {
                LifecycleAction::ReleaseLock
            } else {
                LifecycleAction::None
            };
        }
        if !granted {
            self.state = LifecycleState::Active;
            return LifecycleAction::None;
        }
        if idle.is_idle() && !self.activity_while_locking {
            self.state = LifecycleState::ShuttingDown;
            LifecycleAction::Shutdown
        } else {
            self.state = LifecycleState::Active;
            LifecycleAction::ReleaseLock
        }
    }

    /// Shutdown requested from outside (host stopping, admin).
    pub fn begin_shutdown(&mut self) {
        self.state = LifecycleState::ShuttingDown;
    }

    pub fn finish(&mut self) {
        self.state = LifecycleState::Destroyed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(5);

    fn idle() -> Idleness {
        Idleness::default()
    }

    fn busy() -> Idleness {
        Idleness {
            subscribers: 1,
            ..Idleness::default()
        }
    }

    #[test]
    fn test_opt_out_never_requests_lock() {
        let now = Instant::now();
        let mut life = Lifecycle::new(false, GRACE);
        assert_eq!(life.poll(idle(), now), LifecycleAction::None);
        assert_eq!(life.poll(idle(), now + GRACE * 2), LifecycleAction::None);
        assert_eq!(life.state(), LifecycleState::Active);
    }

    #[test]
    fn test_idle_grace_then_lock_then_shutdown() {
        let now = Instant::now();
        let mut life = Lifecycle::new(true, GRACE);
        assert_eq!(life.poll(idle(), now), LifecycleAction::None);
        assert_eq!(life.poll(idle(), now + GRACE / 2), LifecycleAction::None);
        assert_eq!(life.poll(idle(), now + GRACE), LifecycleAction::RequestLock);
        assert_eq!(life.state(), LifecycleState::LockRequested);
        assert_eq!(life.on_lock_result(true, idle()), LifecycleAction::Shutdown);
        assert!(life.is_shutting_down());
    }

    #[test]
    fn test_activity_resets_countdown() {
        let now = Instant::now();
        let mut life = Lifecycle::new(true, GRACE);
        life.poll(idle(), now);
        life.note_activity();
        assert_eq!(life.state(), LifecycleState::Active);
        life.poll(idle(), now + GRACE);
        assert_eq!(life.poll(idle(), now + GRACE + GRACE / 2), LifecycleAction::None);
    }

    #[test]
    fn test_new_subscriber_cancels_pending() {
        let now = Instant::now();
        let mut life = Lifecycle::new(true, GRACE);
        life.poll(idle(), now);
        life.poll(busy(), now + GRACE);
        assert_eq!(life.state(), LifecycleState::Active);
    }

    #[test]
    fn test_grant_rechecks_eligibility() {
        let now = Instant::now();
        let mut life = Lifecycle::new(true, GRACE);
        life.poll(idle(), now);
        life.poll(idle(), now + GRACE);
        assert_eq!(life.on_lock_result(true, busy()), LifecycleAction::ReleaseLock);
        assert_eq!(life.state(), LifecycleState::Active);

        life.poll(idle(), now + GRACE * 2);
        life.poll(idle(), now + GRACE * 3);
        life.note_activity();
        assert_eq!(life.on_lock_result(true, idle()), LifecycleAction::ReleaseLock);
    }

    #[test]
    fn test_refused_lock_returns_to_active() {
        let now = Instant::now();
        let mut life = Lifecycle::new(true, GRACE);
        life.poll(idle(), now);
        life.poll(idle(), now + GRACE);
        assert_eq!(life.on_lock_result(false, idle()), LifecycleAction::None);
        assert_eq!(life.state(), LifecycleState::Active);
    }
}
