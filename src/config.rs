//! JSON settings for a router deployment.
//!
//! Durations are ISO-8601 periods (`PT10M`, `PT1H30M`, `P1D`, `PT0.25S`,
//! `P1W`). Years and months are rejected because they have no fixed length.
//! Every field has a default, so `{}` is a valid settings document.
//!
//! ```json
//! {
//!   "tuning": {
//!     "segmentGranularity": "HOUR",
//!     "windowPeriod": "PT10M",
//!     "partitions": 2,
//!     "replicants": 2
//!   },
//!   "retry": { "maxAttempts": 5, "initialBackoff": "PT0.2S" },
//!   "discoveryPath": "/prod/discovery",
//!   "location": {
//!     "indexerService": "overlord",
//!     "firehosePattern": "firehose:%s",
//!     "dataSource": "events"
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::beam_factory::ClusterBeamFactory;
use crate::discovery::DiscoveryClient;
use crate::error::ConfigError;
use crate::granularity::Granularity;
use crate::location::Location;
use crate::retry::RetryPolicy;
use crate::rollup::Rollup;
use crate::tuning::TuningConfig;

/// Tuning section.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TuningSettings {
  /// Bucket width.
  #[serde(default = "defaults::granularity")]
  pub segment_granularity: Granularity,
  /// Late-arrival allowance after a window ends.
  #[serde(default = "defaults::window_period", with = "period")]
  pub window_period: Duration,
  /// How far ahead of now a window may start.
  #[serde(
    default,
    with = "optional_period",
    skip_serializing_if = "Option::is_none"
  )]
  pub forward_tolerance: Option<Duration>,
  /// How early maintenance creates the next window's beam.
  #[serde(default, with = "period")]
  pub warming_period: Duration,
  /// Partitions per beam.
  #[serde(default = "defaults::one")]
  pub partitions: usize,
  /// Replicas per partition.
  #[serde(default = "defaults::one")]
  pub replicants: usize,
}

impl Default for TuningSettings {
  fn default() -> Self {
    Self {
      segment_granularity: defaults::granularity(),
      window_period: defaults::window_period(),
      forward_tolerance: None,
      warming_period: Duration::ZERO,
      partitions: 1,
      replicants: 1,
    }
  }
}

/// Retry section, shared by discovery and endpoint pushes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RetrySettings {
  /// Attempts including the first.
  #[serde(default = "defaults::max_attempts")]
  pub max_attempts: u32,
  /// Delay before the second attempt.
  #[serde(default = "defaults::initial_backoff", with = "period")]
  pub initial_backoff: Duration,
  /// Cap on any delay.
  #[serde(default = "defaults::max_backoff", with = "period")]
  pub max_backoff: Duration,
  /// Timeout of each attempt.
  #[serde(default = "defaults::attempt_timeout", with = "period")]
  pub attempt_timeout: Duration,
  /// Randomise delays.
  #[serde(default = "defaults::jitter")]
  pub jitter: bool,
}

impl Default for RetrySettings {
  fn default() -> Self {
    let policy = RetryPolicy::default();
    Self {
      max_attempts: policy.max_attempts,
      initial_backoff: policy.initial_backoff,
      max_backoff: policy.max_backoff,
      attempt_timeout: policy.attempt_timeout,
      jitter: policy.jitter,
    }
  }
}

/// Complete router settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RouterSettings {
  /// Windowing and beam shape.
  #[serde(default)]
  pub tuning: TuningSettings,
  /// Retry behaviour.
  #[serde(default)]
  pub retry: RetrySettings,
  /// Opaque path handed to the discovery client.
  #[serde(default)]
  pub discovery_path: String,
  /// Downstream location.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub location: Option<Location>,
  /// Rollup forwarded to beams.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rollup: Option<Rollup>,
}

impl RouterSettings {
  /// Parses and validates a JSON settings document.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let settings: Self = serde_json::from_str(json)?;
    settings.validate()?;
    Ok(settings)
  }

  /// Reads, parses and validates a JSON settings file.
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    Self::from_json_str(&text)
  }

  /// Checks every section, including cross-section constraints.
  pub fn validate(&self) -> Result<(), ConfigError> {
    let tuning = self.tuning_config()?;
    self.retry_policy().validate()?;
    if let Some(location) = &self.location {
      location.validate()?;
    }
    if let Some(rollup) = &self.rollup {
      rollup.validate()?;
      rollup.validate_against(tuning.segment_granularity())?;
    }
    Ok(())
  }

  /// Builds the tuning configuration.
  pub fn tuning_config(&self) -> Result<TuningConfig, ConfigError> {
    let t = &self.tuning;
    let mut builder = TuningConfig::builder()
      .segment_granularity(t.segment_granularity)
      .window_period(t.window_period)
      .warming_period(t.warming_period)
      .partitions(t.partitions)
      .replicants(t.replicants);
    if let Some(tolerance) = t.forward_tolerance {
      builder = builder.forward_tolerance(tolerance);
    }
    builder.build()
  }

  /// Builds the retry policy.
  pub fn retry_policy(&self) -> RetryPolicy {
    let r = &self.retry;
    RetryPolicy::new(r.max_attempts)
      .with_initial_backoff(r.initial_backoff)
      .with_max_backoff(r.max_backoff)
      .with_attempt_timeout(r.attempt_timeout)
      .with_jitter(r.jitter)
  }

  /// Builds a beam factory over `discovery` with the configured location and rollup.
  pub fn beam_factory(
    &self,
    discovery: Arc<dyn DiscoveryClient>,
  ) -> Result<ClusterBeamFactory, ConfigError> {
    let tuning = self.tuning_config()?;
    let mut factory = ClusterBeamFactory::new(discovery, &tuning).with_retry(self.retry_policy());
    if let Some(location) = &self.location {
      factory = factory.with_location(location.clone());
    }
    if let Some(rollup) = &self.rollup {
      factory = factory.with_rollup(rollup.clone());
    }
    factory.validate()?;
    Ok(factory)
  }
}

mod defaults {
  use super::*;

  pub fn granularity() -> Granularity {
    TuningConfig::default().segment_granularity()
  }

  pub fn window_period() -> Duration {
    TuningConfig::default().window_period()
  }

  pub fn one() -> usize {
    1
  }

  pub fn max_attempts() -> u32 {
    RetryPolicy::default().max_attempts
  }

  pub fn initial_backoff() -> Duration {
    RetryPolicy::default().initial_backoff
  }

  pub fn max_backoff() -> Duration {
    RetryPolicy::default().max_backoff
  }

  pub fn attempt_timeout() -> Duration {
    RetryPolicy::default().attempt_timeout
  }

  pub fn jitter() -> bool {
    RetryPolicy::default().jitter
  }
}

/// Parses an ISO-8601 duration such as `PT10M`, `P1DT2H` or `PT0.5S`.
pub fn parse_period(text: &str) -> Result<Duration, ConfigError> {
  let invalid = |reason: &str| ConfigError::Period {
    value: text.to_string(),
    reason: reason.to_string(),
  };

  let body = text
    .strip_prefix('P')
    .ok_or_else(|| invalid("must start with P"))?;
  if body.is_empty() {
    return Err(invalid("no components"));
  }

  if let Some(weeks) = body.strip_suffix('W') {
    let weeks: u64 = weeks.parse().map_err(|_| invalid("bad week count"))?;
    return weeks
      .checked_mul(7 * 86_400)
      .map(Duration::from_secs)
      .ok_or_else(|| invalid("too large"));
  }

  let (date, time) = match body.split_once('T') {
    Some((_, "")) => return Err(invalid("empty time part")),
    Some((date, time)) => (date, Some(time)),
    None => (body, None),
  };

  let mut total = Duration::ZERO;
  let mut add = |d: Duration| -> Result<(), ConfigError> {
    total = total.checked_add(d).ok_or_else(|| invalid("too large"))?;
    Ok(())
  };

  for (value, unit) in components(date).map_err(|r| invalid(r))? {
    match unit {
      'D' => add(Duration::from_secs(whole(value).map_err(|r| invalid(r))?.saturating_mul(86_400)))?,
      'Y' | 'M' => return Err(invalid("years and months have no fixed length")),
      _ => return Err(invalid("unknown date unit")),
    }
  }
  if let Some(time) = time {
    for (value, unit) in components(time).map_err(|r| invalid(r))? {
      match unit {
        'H' => add(Duration::from_secs(whole(value).map_err(|r| invalid(r))?.saturating_mul(3_600)))?,
        'M' => add(Duration::from_secs(whole(value).map_err(|r| invalid(r))?.saturating_mul(60)))?,
        'S' => {
          let secs: f64 = value.parse().map_err(|_| invalid("bad seconds"))?;
          let secs = Duration::try_from_secs_f64(secs).map_err(|_| invalid("bad seconds"))?;
          add(secs)?
        }
        _ => return Err(invalid("unknown time unit")),
      }
    }
  }
  Ok(total)
}

/// Formats a duration as an ISO-8601 period.
pub fn format_period(duration: Duration) -> String {
  let mut secs = duration.as_secs();
  let nanos = duration.subsec_nanos();
  if secs == 0 && nanos == 0 {
    return "PT0S".to_string();
  }
  let days = secs / 86_400;
  secs %= 86_400;
  let mut out = String::from("P");
  if days > 0 {
    out.push_str(&format!("{}D", days));
  }
  if secs > 0 || nanos > 0 {
    out.push('T');
    let (h, m, s) = (secs / 3_600, (secs % 3_600) / 60, secs % 60);
    if h > 0 {
      out.push_str(&format!("{}H", h));
    }
    if m > 0 {
      out.push_str(&format!("{}M", m));
    }
    if nanos > 0 {
      let fraction = format!("{:09}", nanos);
      out.push_str(&format!("{}.{}S", s, fraction.trim_end_matches('0')));
    } else if s > 0 {
      out.push_str(&format!("{}S", s));
    }
  }
  out
}

fn components(text: &str) -> Result<Vec<(&str, char)>, &'static str> {
  let mut parts = Vec::new();
  let mut start = 0;
  for (i, c) in text.char_indices() {
    if c.is_ascii_alphabetic() {
      if i == start {
        return Err("unit without a number");
      }
      parts.push((&text[start..i], c));
      start = i + c.len_utf8();
    }
  }
  if start != text.len() {
    return Err("number without a unit");
  }
  Ok(parts)
}

fn whole(value: &str) -> Result<u64, &'static str> {
  value.parse().map_err(|_| "only seconds may be fractional")
}

mod period {
  use super::{format_period, parse_period};
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&format_period(*d))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let text = String::deserialize(d)?;
    parse_period(&text).map_err(serde::de::Error::custom)
  }
}

mod optional_period {
  use super::{format_period, parse_period};
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match d {
      Some(d) => s.serialize_some(&format_period(*d)),
      None => s.serialize_none(),
    }
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
    Option::<String>::deserialize(d)?
      .map(|text| parse_period(&text).map_err(serde::de::Error::custom))
      .transpose()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_parse_period() {
    assert_eq!(parse_period("PT10M").unwrap(), Duration::from_secs(600));
    assert_eq!(parse_period("PT1H30M").unwrap(), Duration::from_secs(5_400));
    assert_eq!(parse_period("P1DT2H").unwrap(), Duration::from_secs(93_600));
    assert_eq!(parse_period("P2W").unwrap(), Duration::from_secs(1_209_600));
    assert_eq!(parse_period("PT0.25S").unwrap(), Duration::from_millis(250));
    assert_eq!(parse_period("PT0S").unwrap(), Duration::ZERO);
  }

  #[test]
  fn test_parse_period_rejects() {
    for bad in ["", "10M", "P", "PT", "P1M", "P1Y", "PT1.5M", "PTM", "PT10", "PT-1S", "P1X"] {
      assert!(parse_period(bad).is_err(), "{:?} should be rejected", bad);
    }
  }

  #[test]
  fn test_format_period() {
    assert_eq!(format_period(Duration::ZERO), "PT0S");
    assert_eq!(format_period(Duration::from_secs(600)), "PT10M");
    assert_eq!(format_period(Duration::from_secs(93_600)), "P1DT2H");
    assert_eq!(format_period(Duration::from_secs(86_400)), "P1D");
    assert_eq!(format_period(Duration::from_millis(1_250)), "PT1.25S");
    for d in [600, 3_661, 90_061] {
      let d = Duration::from_secs(d);
      assert_eq!(parse_period(&format_period(d)).unwrap(), d);
    }
  }

  #[test]
  fn test_empty_document_uses_defaults() {
    let settings = RouterSettings::from_json_str("{}").unwrap();
    assert_eq!(settings, RouterSettings::default());
    let tuning = settings.tuning_config().unwrap();
    assert_eq!(tuning, TuningConfig::default());
    assert_eq!(settings.retry_policy(), RetryPolicy::default());
  }

  #[test]
  fn test_full_document() {
    let settings = RouterSettings::from_json_str(
      r#"{
        "tuning": {
          "segmentGranularity": "HOUR",
          "windowPeriod": "PT10M",
          "forwardTolerance": "PT1H",
          "warmingPeriod": "PT5M",
          "partitions": 2,
          "replicants": 3
        },
        "retry": { "maxAttempts": 5, "initialBackoff": "PT0.2S", "jitter": false },
        "discoveryPath": "/test/discovery",
        "location": {
          "indexerService": "overlord",
          "firehosePattern": "firehose:%s",
          "dataSource": "hey"
        },
        "rollup": {
          "dimensions": { "type": "specific", "dimensions": ["column"] },
          "aggregators": [{ "type": "count", "name": "cnt" }],
          "queryGranularity": "MINUTE"
        }
      }"#,
    )
    .unwrap();

    let tuning = settings.tuning_config().unwrap();
    assert_eq!(tuning.segment_granularity(), Granularity::Hour);
    assert_eq!(tuning.window_period(), Duration::from_secs(600));
    assert_eq!(tuning.forward_tolerance(), Some(Duration::from_secs(3_600)));
    assert_eq!(tuning.warming_period(), Duration::from_secs(300));
    assert_eq!((tuning.partitions(), tuning.replicants()), (2, 3));

    let retry = settings.retry_policy();
    assert_eq!(retry.max_attempts, 5);
    assert_eq!(retry.initial_backoff, Duration::from_millis(200));
    assert!(!retry.jitter);

    assert_eq!(settings.discovery_path, "/test/discovery");
    assert_eq!(settings.location.as_ref().unwrap().data_source(), "hey");
    assert_eq!(settings.rollup.as_ref().unwrap().aggregators().len(), 1);
  }

  #[test]
  fn test_invalid_documents() {
    assert!(matches!(
      RouterSettings::from_json_str(r#"{"tuning": {"windowPeriod": "10 minutes"}}"#),
      Err(ConfigError::Parse(_))
    ));
    assert!(matches!(
      RouterSettings::from_json_str(r#"{"tuning": {"partitions": 0}}"#),
      Err(ConfigError::Tuning(_))
    ));
    assert!(matches!(
      RouterSettings::from_json_str(r#"{"retry": {"maxAttempts": 0}}"#),
      Err(ConfigError::Retry(_))
    ));
    assert!(matches!(
      RouterSettings::from_json_str(
        r#"{"location": {"indexerService": "o", "firehosePattern": "none", "dataSource": "d"}}"#
      ),
      Err(ConfigError::Location(_))
    ));
    assert!(matches!(
      RouterSettings::from_json_str(
        r#"{"tuning": {"segmentGranularity": "MINUTE"},
            "rollup": {"dimensions": {"type": "schemaless"},
                       "aggregators": [{"type": "count", "name": "c"}],
                       "queryGranularity": "HOUR"}}"#
      ),
      Err(ConfigError::Rollup(_))
    ));
    assert!(matches!(
      RouterSettings::from_json_str(r#"{"tunning": {}}"#),
      Err(ConfigError::Parse(_))
    ));
  }

  #[test]
  fn test_from_path() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"tuning": {{"segmentGranularity": "DAY"}}}}"#).unwrap();
    let settings = RouterSettings::from_path(file.path()).unwrap();
    assert_eq!(settings.tuning.segment_granularity, Granularity::Day);

    assert!(matches!(
      RouterSettings::from_path("/definitely/not/here.json"),
      Err(ConfigError::Io(_))
    ));
  }

  #[test]
  fn test_settings_serialize_round_trip() {
    let settings = RouterSettings {
      tuning: TuningSettings {
        forward_tolerance: Some(Duration::from_secs(1_800)),
        ..TuningSettings::default()
      },
      ..RouterSettings::default()
    };
    let json = serde_json::to_string(&settings).unwrap();
    assert!(json.contains("\"windowPeriod\":\"PT10M\""));
    assert!(json.contains("\"forwardTolerance\":\"PT30M\""));
    assert_eq!(RouterSettings::from_json_str(&json).unwrap(), settings);
  }
}
