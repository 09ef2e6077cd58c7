//! Wall-clock source for admission and eviction decisions.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Mutex;
use std::time::Duration;

/// Source of "now".
pub trait Clock: Send + Sync {
  /// Returns the current instant.
  fn now(&self) -> DateTime<Utc>;
}

/// The system clock.
#[derive(Clone, Copy, Debug, Default)]
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
  /// Creates a clock frozen at `now`.
  pub fn new(now: DateTime<Utc>) -> Self {
    Self {
      now: Mutex::new(now),
    }
  }

  /// Moves the clock to `now`.
  pub fn set(&self, now: DateTime<Utc>) {
    *self.lock() = now;
  }

  /// Moves the clock forward by `by`.
  pub fn advance(&self, by: Duration) {
    let mut now = self.lock();
    if let Ok(delta) = ChronoDuration::from_std(by) {
      *now = now.checked_add_signed(delta).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, DateTime<Utc>> {
    // The guarded value is a plain timestamp, so a poisoned lock is still usable.
    self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.lock()
  }
}
