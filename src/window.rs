//! Time windows.
//!
//! A [`Window`] is the half-open interval `[start, end)` produced by bucketing
//! a timestamp at some [`Granularity`](crate::granularity::Granularity). It is
//! the key of the router's window→beam map, so it is cheap to copy, hashable
//! and totally ordered (by start, then end).

use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;

/// A time window with inclusive start and exclusive end.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
  /// Start time of the window (inclusive).
  start: DateTime<Utc>,
  /// End time of the window (exclusive).
  end: DateTime<Utc>,
}

impl Window {
  /// Creates a new window with the given start and end.
  pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
    Self { start, end }
  }

  /// Returns the start time of the window.
  pub fn start(&self) -> DateTime<Utc> {
    self.start
  }

  /// Returns the end time of the window.
  pub fn end(&self) -> DateTime<Utc> {
    self.end
  }

  /// Returns the duration of the window.
  pub fn duration(&self) -> ChronoDuration {
    self.end - self.start
  }

  /// Returns the maximum timestamp for elements in this window.
  pub fn max_timestamp(&self) -> DateTime<Utc> {
    self.end - ChronoDuration::milliseconds(1)
  }

  /// Returns true if the given timestamp falls within this window.
  pub fn contains(&self, timestamp: DateTime<Utc>) -> bool {
    timestamp >= self.start && timestamp < self.end
  }

  /// The instant from which the window no longer accepts data.
  pub fn closes_at(&self, window_period: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(window_period)
      .ok()
      .and_then(|p| self.end.checked_add_signed(p))
      .unwrap_or(DateTime::<Utc>::MAX_UTC)
  }

  /// Returns true once `now` has reached `end + window_period`.
  pub fn is_closed(&self, now: DateTime<Utc>, window_period: Duration) -> bool {
    now >= self.closes_at(window_period)
  }
}

impl PartialOrd for Window {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Window {
  fn cmp(&self, other: &Self) -> Ordering {
    self
      .start
      .cmp(&other.start)
      .then_with(|| self.end.cmp(&other.end))
  }
}

impl fmt::Display for Window {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}/{}",
      self.start.to_rfc3339_opts(SecondsFormat::Secs, true),
      self.end.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn timestamp(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    use chrono::TimeZone;
    Utc
      .with_ymd_and_hms(2024, 1, 1, hour, minute, second)
      .unwrap()
  }

  #[test]
  fn test_window_basic() {
    let start = timestamp(10, 0, 0);
    let end = timestamp(11, 0, 0);
    let window = Window::new(start, end);

    assert_eq!(window.start(), start);
    assert_eq!(window.end(), end);
    assert_eq!(window.duration(), ChronoDuration::hours(1));
    assert_eq!(window.max_timestamp(), end - ChronoDuration::milliseconds(1));
  }

  #[test]
  fn test_window_contains() {
    let window = Window::new(timestamp(10, 0, 0), timestamp(11, 0, 0));

    assert!(window.contains(timestamp(10, 0, 0))); // Start is inclusive
    assert!(window.contains(timestamp(10, 30, 0)));
    assert!(!window.contains(timestamp(11, 0, 0))); // End is exclusive
    assert!(!window.contains(timestamp(9, 59, 59)));
  }

  #[test]
  fn test_window_close_boundary() {
    let window = Window::new(timestamp(10, 0, 0), timestamp(11, 0, 0));
    let period = Duration::from_secs(600);

    assert_eq!(window.closes_at(period), timestamp(11, 10, 0));
    assert!(!window.is_closed(timestamp(11, 9, 59), period));
    assert!(window.is_closed(timestamp(11, 10, 0), period));
  }

  #[test]
  fn test_window_ordering() {
    let w1 = Window::new(timestamp(9, 0, 0), timestamp(10, 0, 0));
    let w2 = Window::new(timestamp(10, 0, 0), timestamp(11, 0, 0));
    let w3 = Window::new(timestamp(10, 0, 0), timestamp(10, 30, 0));

    assert!(w1 < w2);
    assert!(w3 < w2);
    let mut windows = vec![w2, w1, w3];
    windows.sort();
    assert_eq!(windows, vec![w1, w3, w2]);
  }

  #[test]
  fn test_window_display() {
    let window = Window::new(timestamp(10, 0, 0), timestamp(11, 0, 0));
    assert_eq!(window.to_string(), "2024-01-01T10:00:00Z/2024-01-01T11:00:00Z");
  }
}
