//! Locks the marking screen after a period with no tutor activity, so a
//! script isn't left open on an unattended machine.

use crate::utils::error::Result;
use crate::utils::validation::{validate_increasing, validate_positive_number};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InactivityPolicy {
    pub warning_after: Duration,
    pub soft_lock_after: Duration,
    pub hard_lock_after: Duration,
    pub check_interval: Duration,
}

impl Default for InactivityPolicy {
    fn default() -> Self {
        Self {
            warning_after: Duration::from_secs(10 * 60),
            soft_lock_after: Duration::from_secs(15 * 60),
            hard_lock_after: Duration::from_secs(30 * 60),
            check_interval: Duration::from_secs(30),
        }
    }
}

impl InactivityPolicy {
    pub fn new(
        warning_after: Duration,
        soft_lock_after: Duration,
        hard_lock_after: Duration,
        check_interval: Duration,
    ) -> Result<Self> {
        validate_increasing(
            "inactivity",
            &[
                ("warning", warning_after.as_millis() as u64),
                ("soft_lock", soft_lock_after.as_millis() as u64),
                ("hard_lock", hard_lock_after.as_millis() as u64),
            ],
        )?;
        validate_positive_number("inactivity.check_interval", check_interval.as_millis() as u64, 1)?;
        Ok(Self {
            warning_after,
            soft_lock_after,
            hard_lock_after,
            check_interval,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Active,
    /// Time left before the soft lock.
    Warning { remaining: Duration },
    SoftLocked,
    HardLocked,
}

impl LockState {
    pub fn is_locked(self) -> bool {
        matches!(self, LockState::SoftLocked | LockState::HardLocked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Warning { remaining: Duration },
    SoftLock,
    HardLock,
    Unlock,
}

/// The lock state machine with the clock passed in.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    policy: InactivityPolicy,
    last_activity: Instant,
    state: LockState,
}

impl ActivityTracker {
    pub fn new(policy: InactivityPolicy, now: Instant) -> Self {
        Self {
            policy,
            last_activity: now,
            state: LockState::Active,
        }
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn record_activity(&mut self, now: Instant) -> Option<LockEvent> {
        self.last_activity = now;
        if self.state == LockState::Active {
            return None;
        }
        self.state = LockState::Active;
        Some(LockEvent::Unlock)
    }

    /// Warnings repeat on every check with the updated time left; locks are
    /// reported once on entry.
    pub fn check(&mut self, now: Instant) -> Option<LockEvent> {
        let idle = now.saturating_duration_since(self.last_activity);

        if idle >= self.policy.hard_lock_after {
            if self.state == LockState::HardLocked {
                return None;
            }
            self.state = LockState::HardLocked;
            return Some(LockEvent::HardLock);
        }

        if idle >= self.policy.soft_lock_after {
            if self.state == LockState::SoftLocked {
                return None;
            }
            self.state = LockState::SoftLocked;
            return Some(LockEvent::SoftLock);
        }

        if idle >= self.policy.warning_after {
            let remaining = self.policy.soft_lock_after - idle;
            self.state = LockState::Warning { remaining };
            return Some(LockEvent::Warning { remaining });
        }

        self.state = LockState::Active;
        None
    }
}

/// Runs an [`ActivityTracker`] on a timer. Dropping the monitor stops it.
pub struct InactivityMonitor {
    tracker: Arc<Mutex<ActivityTracker>>,
    events: mpsc::UnboundedSender<LockEvent>,
    task: JoinHandle<()>,
}

fn lock(tracker: &Mutex<ActivityTracker>) -> MutexGuard<'_, ActivityTracker> {
    tracker.lock().unwrap_or_else(PoisonError::into_inner)
}

impl InactivityMonitor {
    /// Must be called from inside a tokio runtime.
    pub fn start(policy: InactivityPolicy) -> (Self, mpsc::UnboundedReceiver<LockEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Mutex::new(ActivityTracker::new(policy, Instant::now())));

        let task = {
            let tracker = Arc::clone(&tracker);
            let tx = tx.clone();
            tokio::spawn(async move {
                let start = Instant::now() + policy.check_interval;
                let mut ticks = tokio::time::interval_at(start, policy.check_interval);
                loop {
                    let now = ticks.tick().await;
                    let event = lock(&tracker).check(now);
                    if let Some(event) = event {
                        tracing::debug!("Inactivity: {:?}", event);
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                }
            })
        };

        (
            Self {
                tracker,
                events: tx,
                task,
            },
            rx,
        )
    }

    pub fn record_activity(&self) {
        let event = lock(&self.tracker).record_activity(Instant::now());
        if let Some(event) = event {
            tracing::info!("🔓 Unlocked by activity");
            let _ = self.events.send(event);
        }
    }

    pub fn state(&self) -> LockState {
        lock(&self.tracker).state()
    }

    pub fn is_locked(&self) -> bool {
        self.state().is_locked()
    }

    pub fn unlock(&self) {
        if self.is_locked() {
            self.record_activity();
        }
    }
}

impl Drop for InactivityMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
