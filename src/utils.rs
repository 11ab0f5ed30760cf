use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Source of wall-clock time for window calculations
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;

    /// Seconds since the Unix epoch, floored
    fn unix_now(&self) -> i64 {
        self.now_millis().div_euclid(1000)
    }
}

/// Clock backed by the system time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used to simulate window expiry.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    /// Start the clock at a whole number of seconds
    pub fn at_seconds(seconds: i64) -> Self {
        Self::new(seconds * 1000)
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance_secs(&self, seconds: i64) {
        self.millis.fetch_add(seconds * 1000, Ordering::SeqCst);
    }

    pub fn advance_millis(&self, millis: i64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Store key for one identifier's window: `{prefix}:{identifier}`
pub fn window_key(prefix: &str, identifier: &str) -> String {
    format!("{}:{}", prefix, identifier)
}

/// Identifier scoping a limit to one user and one action
pub fn composite_identifier(user_id: &str, action: &str) -> String {
    format!("{}:{}", user_id, action)
}
