//! Result of one `propose` call.
//!
//! Every input record lands in exactly one bucket:
//!
//! ```text
//! accepted + dropped_too_late + dropped_too_early + unstamped + failed == input len
//! ```
//!
//! `windows` breaks `accepted` and `failed` down per window, sorted by window
//! start, with the typed failure (if any) for each slice.

use serde::Serialize;

use crate::error::WindowFailure;
use crate::window::Window;

/// What happened to one window's slice of a call.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WindowOutcome {
  /// The window.
  pub window: Window,
  /// Records of the call that fell into this window and were admitted.
  pub records: usize,
  /// Records acknowledged downstream.
  pub acknowledged: usize,
  /// Records not acknowledged (`records - acknowledged`).
  pub failed: usize,
  /// Why some or all records were not acknowledged.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<WindowFailure>,
}

impl WindowOutcome {
  /// A slice whose every record was acknowledged or not, with the reason.
  pub(crate) fn new(
    window: Window,
    records: usize,
    acknowledged: usize,
    error: Option<WindowFailure>,
  ) -> Self {
    let acknowledged = acknowledged.min(records);
    Self {
      window,
      records,
      acknowledged,
      failed: records - acknowledged,
      error,
    }
  }

  /// A slice that failed before anything was sent.
  pub(crate) fn failed(window: Window, records: usize, error: WindowFailure) -> Self {
    Self::new(window, records, 0, Some(error))
  }

  /// Whether every record of the slice was acknowledged.
  pub fn is_complete(&self) -> bool {
    self.failed == 0
  }
}

/// Per-call accounting returned by [`Router::propose`](crate::router::Router::propose).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Outcome {
  /// Records acknowledged downstream.
  pub accepted: usize,
  /// Records whose window had already closed.
  pub dropped_too_late: usize,
  /// Records whose window starts beyond the forward bound.
  pub dropped_too_early: usize,
  /// Records the timestamper could not read.
  pub unstamped: usize,
  /// Admitted records that were not acknowledged.
  pub failed: usize,
  /// Per-window detail, ordered by window.
  pub windows: Vec<WindowOutcome>,
}

impl Outcome {
  /// Sum of every bucket; equals the number of records proposed.
  pub fn total(&self) -> usize {
    self.accepted + self.dropped_too_late + self.dropped_too_early + self.unstamped + self.failed
  }

  /// Records that reached no endpoint for any reason.
  pub fn dropped(&self) -> usize {
    self.dropped_too_late + self.dropped_too_early + self.unstamped
  }

  /// Whether any window slice carries an error.
  pub fn has_failures(&self) -> bool {
    self.failed > 0 || self.windows.iter().any(|w| w.error.is_some())
  }

  /// Adds a window slice and folds its counts into the totals.
  pub(crate) fn push_window(&mut self, window: WindowOutcome) {
    self.accepted += window.acknowledged;
    self.failed += window.failed;
    self.windows.push(window);
  }

  /// Folds another outcome into this one, keeping windows ordered.
  pub fn merge(&mut self, other: Outcome) {
    self.accepted += other.accepted;
    self.dropped_too_late += other.dropped_too_late;
    self.dropped_too_early += other.dropped_too_early;
    self.unstamped += other.unstamped;
    self.failed += other.failed;
    self.windows.extend(other.windows);
    self.windows.sort_by_key(|w| w.window);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::{DiscoveryError, SerializationError};
  use crate::granularity::Granularity;
  use chrono::{TimeZone, Utc};

  fn window(hour: u32) -> Window {
    Granularity::Hour.bucket(Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap())
  }

  #[test]
  fn test_window_outcome_counts() {
    let w = WindowOutcome::new(window(10), 5, 3, None);
    assert_eq!(w.failed, 2);
    assert!(!w.is_complete());

    // Acknowledgements beyond the slice size are clamped.
    let w = WindowOutcome::new(window(10), 2, 9, None);
    assert_eq!((w.acknowledged, w.failed), (2, 0));
    assert!(w.is_complete());
  }

  #[test]
  fn test_outcome_totals() {
    let mut outcome = Outcome {
      dropped_too_late: 1,
      unstamped: 2,
      ..Outcome::default()
    };
    outcome.push_window(WindowOutcome::new(window(10), 3, 3, None));
    outcome.push_window(WindowOutcome::failed(
      window(11),
      4,
      WindowFailure::Discovery(DiscoveryError::Permanent("gone".into())),
    ));
    assert_eq!(outcome.accepted, 3);
    assert_eq!(outcome.failed, 4);
    assert_eq!(outcome.dropped(), 3);
    assert_eq!(outcome.total(), 10);
    assert!(outcome.has_failures());
  }

  #[test]
  fn test_outcome_merge_orders_windows() {
    let mut a = Outcome::default();
    a.push_window(WindowOutcome::new(window(11), 1, 1, None));
    let mut b = Outcome {
      dropped_too_early: 2,
      ..Outcome::default()
    };
    b.push_window(WindowOutcome::new(window(10), 2, 2, None));

    a.merge(b);
    assert_eq!(a.accepted, 3);
    assert_eq!(a.total(), 5);
    assert_eq!(a.windows[0].window, window(10));
    assert_eq!(a.windows[1].window, window(11));
  }

  #[test]
  fn test_outcome_serializes() {
    let mut outcome = Outcome::default();
    outcome.push_window(WindowOutcome::failed(
      window(10),
      1,
      WindowFailure::Serialization(SerializationError("bad".into())),
    ));
    let json = serde_json::to_value(&outcome).unwrap();
    assert_eq!(json["failed"], 1);
    assert_eq!(json["windows"][0]["error"], "serialization error: bad");
    assert_eq!(json["windows"][0]["window"]["start"], "2024-01-01T10:00:00Z");
  }
}
