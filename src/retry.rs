//! Capped exponential backoff for failed channels
//!
//! Every pending retry belongs to one subscription. Cancellation is
//! cooperative: the subscription's [`CancelFlag`] is checked before a timer is
//! armed and again when it fires, so a subscription cancelled while its timer
//! is in flight is never revived.

use crate::{Spawner, lock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^(attempt-1), cap)` for 1-based `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// Shared cancellation flag for one subscription.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What [`RetryController::schedule`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, delay: Duration },
    /// `attempt` is past `max_retries`, or no runtime can run the timer
    Exhausted,
    /// The subscription was cancelled before the timer could be armed
    Cancelled,
}

struct PendingRetry {
    serial: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Pending {
    next_serial: u64,
    timers: HashMap<u64, PendingRetry>,
}

/// Arms and cancels retry timers keyed by subscription id.
pub struct RetryController {
    policy: RetryPolicy,
    pending: Arc<Mutex<Pending>>,
    spawner: Spawner,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pending: Arc::new(Mutex::new(Pending::default())),
            spawner: Spawner::capture(),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Arm a timer that runs `fire` after the backoff for `attempt`.
    ///
    /// Timers run on the current runtime, or on the one the controller was
    /// created in when called from outside a runtime. Without either the retry
    /// is reported as exhausted. An earlier timer for the same subscription is
    /// replaced.
    pub fn schedule<F>(&self, id: u64, attempt: u32, flag: &CancelFlag, fire: F) -> RetryDecision
    where
        F: FnOnce() + Send + 'static,
    {
        if flag.is_cancelled() {
            trace!(subscription = id, "retry skipped, subscription cancelled");
            return RetryDecision::Cancelled;
        }
        if attempt == 0 || attempt > self.policy.max_retries {
            return RetryDecision::Exhausted;
        }

        let delay = self.policy.delay_for(attempt);
        let mut pending = lock(&self.pending);
        pending.next_serial += 1;
        let serial = pending.next_serial;

        let flag = flag.clone();
        let registry = Arc::clone(&self.pending);
        let Some(task) = self.spawner.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut pending = lock(&registry);
                if pending.timers.get(&id).is_some_and(|p| p.serial == serial) {
                    pending.timers.remove(&id);
                }
            }
            if flag.is_cancelled() {
                trace!(subscription = id, "retry timer fired after cancellation");
                return;
            }
            fire();
        }) else {
            return RetryDecision::Exhausted;
        };

        if let Some(previous) = pending.timers.insert(id, PendingRetry { serial, task }) {
            previous.task.abort();
        }
        debug!(subscription = id, attempt, ?delay, "retry scheduled");
        RetryDecision::Scheduled { attempt, delay }
    }

    /// Drop the pending timer for `id`, if any.
    pub fn cancel(&self, id: u64) -> bool {
        match lock(&self.pending).timers.remove(&id) {
            Some(retry) => {
                retry.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let timers: Vec<PendingRetry> = lock(&self.pending)
            .timers
            .drain()
            .map(|(_, retry)| retry)
            .collect();
        for retry in timers {
            retry.task.abort();
        }
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).timers.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        lock(&self.pending).timers.contains_key(&id)
    }
}

impl Drop for RetryController {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
