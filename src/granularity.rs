//! Segment granularities and the bucket function.
//!
//! A [`Granularity`] maps any instant to exactly one [`Window`]: the half-open
//! interval `[start, start + granularity)` that contains it. Bucketing is pure,
//! total and deterministic:
//!
//! - `bucket(bucket(t).start()) == bucket(t)` for every `t`
//! - `t1 <= t2` implies `bucket(t1).start() <= bucket(t2).start()`
//!
//! Fixed-width granularities are aligned to the Unix epoch (weeks to ISO
//! Mondays); [`Granularity::Month`] and [`Granularity::Year`] follow the UTC
//! calendar.
//!
//! # Example
//!
//! ```rust
//! use beamweave::granularity::Granularity;
//! use chrono::{TimeZone, Utc};
//!
//! let t = Utc.with_ymd_and_hms(2024, 1, 1, 10, 5, 0).unwrap();
//! let window = Granularity::Hour.bucket(t);
//! assert_eq!(window.start(), Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap());
//! assert_eq!(window.end(), Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap());
//! ```

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;
use crate::window::Window;

const SECOND_MS: i64 = 1_000;
const MINUTE_MS: i64 = 60 * SECOND_MS;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
/// 1970-01-05 was the first Monday after the epoch.
const WEEK_OFFSET_MS: i64 = 4 * DAY_MS;

/// Bucket width used to derive windows from timestamps.
///
/// Variants are declared from finest to coarsest, so the derived [`Ord`]
/// orders them by size.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Granularity {
  /// One second.
  Second,
  /// One minute.
  Minute,
  /// Five minutes.
  FiveMinute,
  /// Ten minutes.
  TenMinute,
  /// Fifteen minutes.
  FifteenMinute,
  /// Thirty minutes.
  ThirtyMinute,
  /// One hour.
  Hour,
  /// Six hours.
  SixHour,
  /// One day.
  Day,
  /// One ISO week, starting Monday 00:00 UTC.
  Week,
  /// One calendar month.
  Month,
  /// One calendar year.
  Year,
}

impl Granularity {
  /// Every granularity, finest first.
  pub const ALL: [Granularity; 12] = [
    Granularity::Second,
    Granularity::Minute,
    Granularity::FiveMinute,
    Granularity::TenMinute,
    Granularity::FifteenMinute,
    Granularity::ThirtyMinute,
    Granularity::Hour,
    Granularity::SixHour,
    Granularity::Day,
    Granularity::Week,
    Granularity::Month,
    Granularity::Year,
  ];

  /// Width and epoch offset in milliseconds for fixed-width granularities.
  fn fixed_width(self) -> Option<(i64, i64)> {
    match self {
      Granularity::Second => Some((SECOND_MS, 0)),
      Granularity::Minute => Some((MINUTE_MS, 0)),
      Granularity::FiveMinute => Some((5 * MINUTE_MS, 0)),
      Granularity::TenMinute => Some((10 * MINUTE_MS, 0)),
      Granularity::FifteenMinute => Some((15 * MINUTE_MS, 0)),
      Granularity::ThirtyMinute => Some((30 * MINUTE_MS, 0)),
      Granularity::Hour => Some((HOUR_MS, 0)),
      Granularity::SixHour => Some((6 * HOUR_MS, 0)),
      Granularity::Day => Some((DAY_MS, 0)),
      Granularity::Week => Some((7 * DAY_MS, WEEK_OFFSET_MS)),
      Granularity::Month | Granularity::Year => None,
    }
  }

  /// Returns the start of the bucket containing `timestamp`.
  pub fn bucket_start(self, timestamp: DateTime<Utc>) -> DateTime<Utc> {
    if let Some((width, offset)) = self.fixed_width() {
      let ms = timestamp.timestamp_millis();
      let start = (ms - offset).div_euclid(width) * width + offset;
      return DateTime::from_timestamp_millis(start).unwrap_or(timestamp);
    }

    let month = match self {
      Granularity::Year => 1,
      _ => timestamp.month(),
    };
    NaiveDate::from_ymd_opt(timestamp.year(), month, 1)
      .and_then(|d| d.and_hms_opt(0, 0, 0))
      .map(|naive| naive.and_utc())
      .unwrap_or(timestamp)
  }

  /// Returns the start of the bucket following the one starting at `start`.
  pub fn increment(self, start: DateTime<Utc>) -> DateTime<Utc> {
    let next = match self.fixed_width() {
      Some((width, _)) => start.checked_add_signed(chrono::Duration::milliseconds(width)),
      None => {
        let months = if self == Granularity::Year { 12 } else { 1 };
        start.checked_add_months(Months::new(months))
      }
    };
    next.unwrap_or(DateTime::<Utc>::MAX_UTC)
  }

  /// Maps a timestamp to its window.
  pub fn bucket(self, timestamp: DateTime<Utc>) -> Window {
    let start = self.bucket_start(timestamp);
    Window::new(start, self.increment(start))
  }

  /// Canonical upper-case name, as accepted by [`FromStr`].
  pub fn name(self) -> &'static str {
    match self {
      Granularity::Second => "SECOND",
      Granularity::Minute => "MINUTE",
      Granularity::FiveMinute => "FIVE_MINUTE",
      Granularity::TenMinute => "TEN_MINUTE",
      Granularity::FifteenMinute => "FIFTEEN_MINUTE",
      Granularity::ThirtyMinute => "THIRTY_MINUTE",
      Granularity::Hour => "HOUR",
      Granularity::SixHour => "SIX_HOUR",
      Granularity::Day => "DAY",
      Granularity::Week => "WEEK",
      Granularity::Month => "MONTH",
      Granularity::Year => "YEAR",
    }
  }

  /// ISO-8601 period describing one bucket.
  pub fn iso_period(self) -> &'static str {
    match self {
      Granularity::Second => "PT1S",
      Granularity::Minute => "PT1M",
      Granularity::FiveMinute => "PT5M",
      Granularity::TenMinute => "PT10M",
      Granularity::FifteenMinute => "PT15M",
      Granularity::ThirtyMinute => "PT30M",
      Granularity::Hour => "PT1H",
      Granularity::SixHour => "PT6H",
      Granularity::Day => "P1D",
      Granularity::Week => "P1W",
      Granularity::Month => "P1M",
      Granularity::Year => "P1Y",
    }
  }
}

impl fmt::Display for Granularity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

impl FromStr for Granularity {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
    Granularity::ALL
      .into_iter()
      .find(|g| g.name() == normalized)
      .ok_or_else(|| ConfigError::UnknownGranularity(s.to_string()))
  }
}
