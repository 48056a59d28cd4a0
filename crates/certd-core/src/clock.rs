//! Wall clock
//!
//! Refresh instants are absolute wall-clock times. Tokio timers run on the
//! monotonic clock, which may stop while the device sleeps, so the scheduler
//! always re-reads this clock before deciding a fire time has been reached.

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
