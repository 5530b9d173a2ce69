//! Idle-time expiry checks and the clock they read.

use super::types::Session;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug, Clone)]
pub struct FakeClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Advance the clock by the given duration
    pub fn advance(&self, duration: Duration) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current += duration;
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *current = instant;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Decides whether a session has sat idle too long to be used or stored
pub trait StalenessPolicy: Send + Sync {
    fn is_stale(&self, session: &Session, now: DateTime<Utc>) -> bool;
}

/// Stale once whole idle seconds reach the session's max inactive interval.
///
/// Sub-second idle time is truncated, so a session idle for 29.9s with a 30s
/// interval is still fresh. Sessions with a non-positive interval never go stale.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleTimeoutPolicy;

impl StalenessPolicy for IdleTimeoutPolicy {
    fn is_stale(&self, session: &Session, now: DateTime<Utc>) -> bool {
        let max_inactive = session.max_inactive_interval();
        if max_inactive <= 0 {
            return false;
        }
        session.idle_time(now).num_seconds() >= max_inactive
    }
}
