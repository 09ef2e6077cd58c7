//! # Error Taxonomy
//!
//! Every failure the router can observe has a typed home here. The router
//! never lets one of these abort a whole `propose` call: timestamp failures
//! are counted per record, discovery/serialization/delivery failures are
//! attached to the affected window's slice of the [`Outcome`](crate::outcome::Outcome).
//!
//! | Error | Scope | Retried by |
//! |-------|-------|------------|
//! | [`TimestampError`] | one record | nobody (caller data defect) |
//! | [`SerializationError`] | one window slice | nobody |
//! | [`DiscoveryError`] | one window slice | [`ClusterBeamFactory`](crate::beam_factory::ClusterBeamFactory) |
//! | [`EndpointError`] / [`DeliveryError`] | one shard of one window slice | [`ClusterBeam`](crate::beam::ClusterBeam) |
//! | [`ConfigError`] | construction time | nobody |
//! | [`RouterError`] | whole call | nobody |

use serde::{Serialize, Serializer};
use std::time::Duration;
use thiserror::Error;

use crate::retry::Retryable;

/// Failure to extract an event timestamp from a record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimestampError {
  /// The record does not carry the expected timestamp field.
  #[error("missing timestamp field: {0}")]
  MissingField(String),
  /// The timestamp is present but cannot be interpreted.
  #[error("invalid timestamp: {0}")]
  Invalid(String),
}

/// Failure to turn a record (or batch) into bytes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("serialization error: {0}")]
pub struct SerializationError(pub String);

impl From<serde_json::Error> for SerializationError {
  fn from(e: serde_json::Error) -> Self {
    Self(e.to_string())
  }
}

/// Failure to resolve a window to a set of live endpoints.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
  /// The coordination service could not be reached.
  #[error("coordination service unavailable: {0}")]
  Unavailable(String),
  /// The service is reachable but nothing is registered for the window yet.
  #[error("no endpoints registered for {service}")]
  NoEndpoints {
    /// Service name that was looked up.
    service: String,
  },
  /// A single discovery attempt exceeded its timeout.
  #[error("discovery attempt timed out after {0:?}")]
  Timeout(Duration),
  /// Discovery failed in a way retrying cannot fix.
  #[error("discovery failed: {0}")]
  Permanent(String),
  /// All attempts were used up.
  #[error("discovery gave up after {attempts} attempts: {last}")]
  Exhausted {
    /// Number of attempts made.
    attempts: u32,
    /// Error returned by the final attempt.
    last: Box<DiscoveryError>,
  },
}

impl Retryable for DiscoveryError {
  fn is_transient(&self) -> bool {
    matches!(
      self,
      DiscoveryError::Unavailable(_) | DiscoveryError::NoEndpoints { .. } | DiscoveryError::Timeout(_)
    )
  }

  fn timed_out(after: Duration) -> Self {
    DiscoveryError::Timeout(after)
  }

  fn exhausted(attempts: u32, last: Self) -> Self {
    DiscoveryError::Exhausted {
      attempts,
      last: Box::new(last),
    }
  }
}

/// Failure reported by a single endpoint push.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
  /// The endpoint could not be reached (connection refused, reset, ...).
  #[error("endpoint {endpoint} unreachable: {reason}")]
  Unreachable {
    /// Endpoint id.
    endpoint: String,
    /// Transport-level reason.
    reason: String,
  },
  /// The endpoint answered but refused the batch.
  #[error("endpoint {endpoint} rejected batch: {reason}")]
  Rejected {
    /// Endpoint id.
    endpoint: String,
    /// Reason given by the endpoint.
    reason: String,
  },
  /// A single push attempt exceeded its timeout.
  #[error("push timed out after {0:?}")]
  Timeout(Duration),
  /// All attempts were used up.
  #[error("push gave up after {attempts} attempts: {last}")]
  Exhausted {
    /// Number of attempts made.
    attempts: u32,
    /// Error returned by the final attempt.
    last: Box<EndpointError>,
  },
}

impl Retryable for EndpointError {
  fn is_transient(&self) -> bool {
    matches!(
      self,
      EndpointError::Unreachable { .. } | EndpointError::Timeout(_)
    )
  }

  fn timed_out(after: Duration) -> Self {
    EndpointError::Timeout(after)
  }

  fn exhausted(attempts: u32, last: Self) -> Self {
    EndpointError::Exhausted {
      attempts,
      last: Box::new(last),
    }
  }
}

/// A shard of a window batch that could not be delivered to any replica.
///
/// `records` is exactly the number of records in the failed shard; the router
/// counts them in `failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("delivery of {records} records to partition {partition} failed: {cause}")]
pub struct DeliveryError {
  /// Partition index the shard was routed to.
  pub partition: usize,
  /// Number of records in the shard.
  pub records: usize,
  /// Error from the last replica tried.
  pub cause: EndpointError,
}

/// Typed failure attached to one window's slice of an outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowFailure {
  /// The beam for the window could not be created.
  #[error("beam creation failed: {0}")]
  Discovery(#[from] DiscoveryError),
  /// Records for the window could not be serialized.
  #[error("{0}")]
  Serialization(#[from] SerializationError),
  /// One or more shards were not delivered.
  #[error("{} shard(s) undelivered: {}", .0.len(), first_cause(.0))]
  Delivery(Vec<DeliveryError>),
  /// The dispatch task for the window ended abnormally.
  #[error("dispatch aborted: {0}")]
  Aborted(String),
  /// The router was closed before the slice could be dispatched.
  #[error("router closed before dispatch")]
  Closed,
}

fn first_cause(errors: &[DeliveryError]) -> String {
  errors
    .first()
    .map(|e| e.to_string())
    .unwrap_or_default()
}

impl Serialize for WindowFailure {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(self)
  }
}

/// Invalid configuration, rejected at construction time.
#[derive(Error, Debug)]
pub enum ConfigError {
  /// Tuning values are inconsistent.
  #[error("invalid tuning: {0}")]
  Tuning(String),
  /// Retry policy values are inconsistent.
  #[error("invalid retry policy: {0}")]
  Retry(String),
  /// Rollup description is inconsistent.
  #[error("invalid rollup: {0}")]
  Rollup(String),
  /// Downstream location is incomplete.
  #[error("invalid location: {0}")]
  Location(String),
  /// A required collaborator was not supplied to a builder.
  #[error("missing {0}")]
  Missing(&'static str),
  /// A granularity name is not recognised.
  #[error("unknown granularity: {0}")]
  UnknownGranularity(String),
  /// An ISO-8601 period could not be parsed.
  #[error("invalid period {value:?}: {reason}")]
  Period {
    /// The offending text.
    value: String,
    /// What is wrong with it.
    reason: String,
  },
  /// Settings file could not be read.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// Settings document could not be parsed.
  #[error("parse error: {0}")]
  Parse(#[from] serde_json::Error),
}

/// Call-level router failure.
#[derive(Error, Debug)]
pub enum RouterError {
  /// The router has been closed.
  #[error("router is closed")]
  Closed,
}
