//! Monotonic-enough timestamps and unique opaque IDs.
//!
//! This is the smallest leaf in the dependency graph: every other component
//! asks a [`Clock`] for "now" instead of calling `SystemTime::now()`
//! directly, so tests can freeze or advance time deterministically.

use n0_future::time::{Duration, SystemTime};
use uuid::Uuid;

/// Supplies the current time and fresh unique IDs.
///
/// `now` returns whole seconds since the Unix epoch, matching the integer
/// second timestamps used throughout the capability and audit formats.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
    fn now(&self) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(self.now_unix().max(0) as u64)
    }
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_secs() as i64
    }
}

/// A clock that can be advanced manually, for deterministic tests of
/// expiration and time-window logic.
#[derive(Debug)]
pub struct FixedClock(parking_lot::Mutex<i64>);

impl FixedClock {
    pub fn new(now_unix: i64) -> Self {
        Self(parking_lot::Mutex::new(now_unix))
    }

    pub fn advance(&self, secs: i64) {
        *self.0.lock() += secs;
    }

    pub fn set(&self, now_unix: i64) {
        *self.0.lock() = now_unix;
    }
}

impl Clock for FixedClock {
    fn now_unix(&self) -> i64 {
        *self.0.lock()
    }
}

/// Generates opaque, globally-unique-enough identifiers.
///
/// UUIDv4 carries 122 bits of randomness, comfortably under the spec's
/// required collision bound of 2^-80 within an agent's lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }

    pub fn generate_prefixed(&self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4())
    }
}
