//! Refresh Scheduler
//!
//! A single-shot timer aimed at an absolute wall-clock instant. Arming it
//! again replaces the pending fire, so at most one fire is ever outstanding.
//!
//! The timer task never sleeps longer than `max_tick` at a time. After every
//! tick it re-reads the wall clock, so a process that was suspended past its
//! fire time fires as soon as it runs again.
//!
//! Once a fire starts, the task detaches itself from the scheduler. Arming
//! or cancelling from that point on cannot abort the work already running
//! (typically an issuance request), only a future fire.

use crate::clock::Clock;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// The one outstanding fire
struct Pending {
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Slot {
    /// Bumped on every arm; a timer task only fires if it still owns the slot
    generation: u64,
    pending: Option<Pending>,
}

/// Re-armable one-shot timer
pub struct RefreshScheduler {
    clock: Arc<dyn Clock>,
    max_tick: Duration,
    slot: Arc<Mutex<Slot>>,
}

impl RefreshScheduler {
    /// Create a scheduler reading time from `clock`
    pub fn new(clock: Arc<dyn Clock>, max_tick: Duration) -> Self {
        Self {
            clock,
            max_tick: max_tick.max(Duration::from_millis(1)),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Run `task` once at `fire_at`, replacing any pending fire
    ///
    /// An instant in the past fires as soon as the runtime gets to it.
    /// Must be called from within a tokio runtime.
    pub fn schedule_at<F>(&self, fire_at: DateTime<Utc>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = lock(&self.slot);
        slot.generation += 1;
        let generation = slot.generation;

        if let Some(previous) = slot.pending.take() {
            debug!("Replacing timer set for {}", previous.fire_at);
            previous.handle.abort();
        }

        let clock = self.clock.clone();
        let max_tick = self.max_tick;
        let owner = self.slot.clone();

        let handle = tokio::spawn(async move {
            loop {
                let now = clock.now();
                if now >= fire_at {
                    break;
                }
                let remaining = (fire_at - now).to_std().unwrap_or_default();
                trace!("Timer: {:?} to go", remaining);
                tokio::time::sleep(remaining.min(max_tick)).await;
            }

            {
                let mut slot = lock(&owner);
                if slot.generation != generation {
                    return;
                }
                slot.pending = None;
            }

            task.await;
        });

        slot.pending = Some(Pending { fire_at, handle });
    }

    /// Drop the pending fire, if any
    pub fn cancel(&self) {
        if let Some(pending) = lock(&self.slot).pending.take() {
            debug!("Cancelled timer set for {}", pending.fire_at);
            pending.handle.abort();
        }
    }

    /// Instant of the pending fire
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        lock(&self.slot).pending.as_ref().map(|p| p.fire_at)
    }

    pub fn is_pending(&self) -> bool {
        lock(&self.slot).pending.is_some()
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
