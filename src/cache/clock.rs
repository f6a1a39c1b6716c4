//! Wall-clock source for cache timestamps.

use chrono::{DateTime, Duration, Utc};
use std::sync::Mutex;

/// Source of the current time used to stamp and validate cache entries.
///
/// Entries outlive the process in the durable tier, so this is wall-clock
/// time rather than a monotonic instant.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
  now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(start),
    }
  }

  /// Move the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    let mut now = crate::sync::lock(&self.now, "cache::clock", "advance");
    *now += by;
  }

  pub fn set(&self, to: DateTime<Utc>) {
    *crate::sync::lock(&self.now, "cache::clock", "set") = to;
  }
}

impl Default for ManualClock {
  fn default() -> Self {
    Self::new(Utc::now())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *crate::sync::lock(&self.now, "cache::clock", "now")
  }
}
