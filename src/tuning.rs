//! Tuning configuration and the admission policy.
//!
//! [`TuningConfig`] is an immutable snapshot built through
//! [`TuningConfigBuilder`]; invalid combinations are rejected by
//! [`TuningConfigBuilder::build`], never discovered later.
//!
//! [`TuningPolicy::admit`] decides, for one window and one instant, whether a
//! record may still be sent:
//!
//! - `TooLate` when `now >= window.end + window_period`
//! - `TooEarly` when `window.start > now + forward_tolerance`
//! - `Accept` otherwise
//!
//! The close boundary is exclusive: a record proposed exactly at
//! `window.end + window_period` is too late.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::error::ConfigError;
use crate::granularity::Granularity;
use crate::window::Window;

/// Immutable router tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct TuningConfig {
  segment_granularity: Granularity,
  window_period: Duration,
  forward_tolerance: Option<Duration>,
  warming_period: Duration,
  partitions: usize,
  replicants: usize,
}

impl TuningConfig {
  /// Starts a builder with default values (hourly segments, ten minute window period).
  pub fn builder() -> TuningConfigBuilder {
    TuningConfigBuilder::default()
  }

  /// Bucket width used to derive windows.
  pub fn segment_granularity(&self) -> Granularity {
    self.segment_granularity
  }

  /// How long after its end a window keeps accepting data.
  pub fn window_period(&self) -> Duration {
    self.window_period
  }

  /// How far ahead of now a window may start and still be accepted.
  ///
  /// `None` admits windows up to and including the one after the current one.
  pub fn forward_tolerance(&self) -> Option<Duration> {
    self.forward_tolerance
  }

  /// How long before a window opens its beam is created by maintenance.
  pub fn warming_period(&self) -> Duration {
    self.warming_period
  }

  /// Number of partitions each window's beam shards records across.
  pub fn partitions(&self) -> usize {
    self.partitions
  }

  /// Number of replicas each partition is sent to.
  pub fn replicants(&self) -> usize {
    self.replicants
  }
}

impl Default for TuningConfig {
  fn default() -> Self {
    Self {
      segment_granularity: Granularity::Hour,
      window_period: Duration::from_secs(10 * 60),
      forward_tolerance: None,
      warming_period: Duration::ZERO,
      partitions: 1,
      replicants: 1,
    }
  }
}

/// Builder for [`TuningConfig`].
#[derive(Clone, Debug, Default)]
pub struct TuningConfigBuilder {
  config: TuningConfig,
}

impl TuningConfigBuilder {
  /// Sets the segment granularity.
  pub fn segment_granularity(mut self, granularity: Granularity) -> Self {
    self.config.segment_granularity = granularity;
    self
  }

  /// Sets the window period.
  pub fn window_period(mut self, period: Duration) -> Self {
    self.config.window_period = period;
    self
  }

  /// Sets the forward tolerance.
  pub fn forward_tolerance(mut self, tolerance: Duration) -> Self {
    self.config.forward_tolerance = Some(tolerance);
    self
  }

  /// Sets the warming period.
  pub fn warming_period(mut self, period: Duration) -> Self {
    self.config.warming_period = period;
    self
  }

  /// Sets the partition count.
  pub fn partitions(mut self, partitions: usize) -> Self {
    self.config.partitions = partitions;
    self
  }

  /// Sets the replica count.
  pub fn replicants(mut self, replicants: usize) -> Self {
    self.config.replicants = replicants;
    self
  }

  /// Validates and freezes the configuration.
  pub fn build(self) -> Result<TuningConfig, ConfigError> {
    let config = self.config;
    if config.partitions == 0 {
      return Err(ConfigError::Tuning("partitions must be >= 1".into()));
    }
    if config.replicants == 0 {
      return Err(ConfigError::Tuning("replicants must be >= 1".into()));
    }
    let durations = [
      ("window_period", Some(config.window_period)),
      ("forward_tolerance", config.forward_tolerance),
      ("warming_period", Some(config.warming_period)),
    ];
    for (name, value) in durations {
      if let Some(d) = value
        && ChronoDuration::from_std(d).is_err()
      {
        return Err(ConfigError::Tuning(format!("{} is out of range: {:?}", name, d)));
      }
    }
    Ok(config)
  }
}

/// Admission decision for one record.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Admission {
  /// The window is open; send the record.
  Accept,
  /// The window has closed for new data.
  TooLate,
  /// The window starts implausibly far in the future.
  TooEarly,
}

impl Admission {
  /// Short label used in logs and metrics.
  pub fn as_str(self) -> &'static str {
    match self {
      Admission::Accept => "accept",
      Admission::TooLate => "too_late",
      Admission::TooEarly => "too_early",
    }
  }
}

impl fmt::Display for Admission {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Stateless admission check derived from a [`TuningConfig`].
#[derive(Clone, Debug)]
pub struct TuningPolicy {
  granularity: Granularity,
  window_period: Duration,
  forward_tolerance: Option<ChronoDuration>,
}

impl TuningPolicy {
  /// Builds the policy for a validated configuration.
  pub fn new(config: &TuningConfig) -> Self {
    Self {
      granularity: config.segment_granularity(),
      window_period: config.window_period(),
      forward_tolerance: config
        .forward_tolerance()
        .and_then(|d| ChronoDuration::from_std(d).ok()),
    }
  }

  /// Decides whether data for `window` may be sent at `now`.
  pub fn admit(&self, window: &Window, now: DateTime<Utc>) -> Admission {
    if window.is_closed(now, self.window_period) {
      return Admission::TooLate;
    }
    if window.start() > self.latest_admissible_start(now) {
      return Admission::TooEarly;
    }
    Admission::Accept
  }

  /// Whether `window` has closed at `now`, regardless of pending sends.
  pub fn is_closed(&self, window: &Window, now: DateTime<Utc>) -> bool {
    window.is_closed(now, self.window_period)
  }

  fn latest_admissible_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
    match self.forward_tolerance {
      Some(tolerance) => now
        .checked_add_signed(tolerance)
        .unwrap_or(DateTime::<Utc>::MAX_UTC),
      None => self.granularity.bucket(now).end(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
    Utc
      .with_ymd_and_hms(2024, 1, 1, hour, minute, second)
      .unwrap()
  }

  fn hourly_policy() -> TuningPolicy {
    let config = TuningConfig::builder()
      .segment_granularity(Granularity::Hour)
      .window_period(Duration::from_secs(600))
      .build()
      .unwrap();
    TuningPolicy::new(&config)
  }

  #[test]
  fn test_builder_defaults() {
    let config = TuningConfig::builder().build().unwrap();
    assert_eq!(config.segment_granularity(), Granularity::Hour);
    assert_eq!(config.window_period(), Duration::from_secs(600));
    assert_eq!(config.forward_tolerance(), None);
    assert_eq!(config.warming_period(), Duration::ZERO);
    assert_eq!(config.partitions(), 1);
    assert_eq!(config.replicants(), 1);
  }

  #[test]
  fn test_builder_rejects_invalid() {
    assert!(TuningConfig::builder().partitions(0).build().is_err());
    assert!(TuningConfig::builder().replicants(0).build().is_err());
    assert!(
      TuningConfig::builder()
        .window_period(Duration::MAX)
        .build()
        .is_err()
    );
  }

  #[test]
  fn test_admit_accepts_open_windows() {
    let policy = hourly_policy();
    let now = at(11, 8, 0);
    // Previous window is still within its window period.
    assert_eq!(policy.admit(&Granularity::Hour.bucket(at(10, 5, 0)), now), Admission::Accept);
    // Current window.
    assert_eq!(policy.admit(&Granularity::Hour.bucket(at(11, 2, 0)), now), Admission::Accept);
    // Next window.
    assert_eq!(policy.admit(&Granularity::Hour.bucket(at(12, 30, 0)), now), Admission::Accept);
  }

  #[test]
  fn test_admit_too_late() {
    let policy = hourly_policy();
    let window = Granularity::Hour.bucket(at(9, 50, 0));
    assert_eq!(policy.admit(&window, at(11, 8, 0)), Admission::TooLate);
  }

  #[test]
  fn test_close_boundary_is_exclusive() {
    let policy = hourly_policy();
    let window = Granularity::Hour.bucket(at(10, 5, 0));
    let one_ms = ChronoDuration::milliseconds(1);

    assert_eq!(policy.admit(&window, at(11, 10, 0) - one_ms), Admission::Accept);
    assert_eq!(policy.admit(&window, at(11, 10, 0)), Admission::TooLate);
    assert_eq!(policy.admit(&window, at(11, 10, 0) + one_ms), Admission::TooLate);
  }

  #[test]
  fn test_default_forward_bound_is_next_window() {
    let policy = hourly_policy();
    let now = at(11, 8, 0);
    assert_eq!(policy.admit(&Granularity::Hour.bucket(at(12, 0, 0)), now), Admission::Accept);
    assert_eq!(policy.admit(&Granularity::Hour.bucket(at(13, 0, 0)), now), Admission::TooEarly);
  }

  #[test]
  fn test_explicit_forward_tolerance_boundary() {
    let config = TuningConfig::builder()
      .segment_granularity(Granularity::TenMinute)
      .forward_tolerance(Duration::from_secs(30 * 60))
      .build()
      .unwrap();
    let policy = TuningPolicy::new(&config);
    let now = at(10, 0, 0);

    // window.start == now + tolerance is still accepted
    let edge = Granularity::TenMinute.bucket(at(10, 30, 0));
    assert_eq!(policy.admit(&edge, now), Admission::Accept);
    let beyond = Granularity::TenMinute.bucket(at(10, 40, 0));
    assert_eq!(policy.admit(&beyond, now), Admission::TooEarly);
  }

  #[test]
  fn test_admission_labels() {
    assert_eq!(Admission::Accept.to_string(), "accept");
    assert_eq!(Admission::TooLate.as_str(), "too_late");
    assert_eq!(
      serde_json::to_string(&Admission::TooEarly).unwrap(),
      "\"too_early\""
    );
  }
}
