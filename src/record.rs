//! Caller-supplied record capabilities.
//!
//! The router never looks inside a record. It needs two things from the
//! caller: a [`Timestamper`] to place a record in time, and an
//! [`ObjectWriter`] to turn it into bytes for delivery.
//!
//! ## Usage
//!
//! ```rust
//! use beamweave::record::{JsonFieldTimestamper, JsonWriter, ObjectWriter, Timestamper};
//! use serde_json::json;
//!
//! let record = json!({"timestamp": "2024-01-01T10:05:00Z", "column": "a"});
//! let ts = JsonFieldTimestamper::new("timestamp").timestamp(&record).unwrap();
//! assert_eq!(ts.to_rfc3339(), "2024-01-01T10:05:00+00:00");
//!
//! let bytes = ObjectWriter::as_bytes(&JsonWriter, &record).unwrap();
//! assert!(bytes.starts_with(b"{"));
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::error::{SerializationError, TimestampError};

/// Extracts the event time of a record.
///
/// Must be pure for any record the caller intends to submit. Failures are
/// counted by the router and never retried.
pub trait Timestamper<T>: Send + Sync {
  /// Returns the event time of `record`.
  fn timestamp(&self, record: &T) -> Result<DateTime<Utc>, TimestampError>;
}

/// Serializes records for delivery. The output format is opaque to the router.
pub trait ObjectWriter<T>: Send + Sync {
  /// Serializes one record.
  fn as_bytes(&self, record: &T) -> Result<Bytes, SerializationError>;

  /// Serializes a batch of records.
  ///
  /// The default joins the individual encodings with newlines.
  fn batch_as_bytes(&self, records: &[T]) -> Result<Bytes, SerializationError> {
    let mut buf = BytesMut::new();
    for (i, record) in records.iter().enumerate() {
      if i > 0 {
        buf.put_u8(b'\n');
      }
      buf.extend_from_slice(&self.as_bytes(record)?);
    }
    Ok(buf.freeze())
  }
}

/// Wrapper that implements [`Timestamper`] for closures.
struct TimestamperWrapper<F> {
  function: F,
}

impl<T, F> Timestamper<T> for TimestamperWrapper<F>
where
  F: Fn(&T) -> Result<DateTime<Utc>, TimestampError> + Send + Sync,
{
  fn timestamp(&self, record: &T) -> Result<DateTime<Utc>, TimestampError> {
    (self.function)(record)
  }
}

/// Creates a [`Timestamper`] from a closure.
pub fn timestamper_fn<T, F>(function: F) -> Arc<dyn Timestamper<T>>
where
  F: Fn(&T) -> Result<DateTime<Utc>, TimestampError> + Send + Sync + 'static,
{
  Arc::new(TimestamperWrapper { function })
}

/// Writes any `Serialize` record as JSON; batches become a JSON array.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonWriter;

impl<T: Serialize> ObjectWriter<T> for JsonWriter {
  fn as_bytes(&self, record: &T) -> Result<Bytes, SerializationError> {
    Ok(Bytes::from(serde_json::to_vec(record)?))
  }

  fn batch_as_bytes(&self, records: &[T]) -> Result<Bytes, SerializationError> {
    Ok(Bytes::from(serde_json::to_vec(records)?))
  }
}

/// Reads the event time from a named field of a JSON object.
///
/// The field may hold an RFC 3339 string or integer milliseconds since the
/// Unix epoch.
#[derive(Clone, Debug)]
pub struct JsonFieldTimestamper {
  field: String,
}

impl JsonFieldTimestamper {
  /// Creates a timestamper reading `field`.
  pub fn new(field: impl Into<String>) -> Self {
    Self {
      field: field.into(),
    }
  }

  fn from_object(&self, object: &Map<String, Value>) -> Result<DateTime<Utc>, TimestampError> {
    let value = object
      .get(&self.field)
      .ok_or_else(|| TimestampError::MissingField(self.field.clone()))?;
    match value {
      Value::String(s) => DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TimestampError::Invalid(format!("{}: {}", s, e))),
      Value::Number(n) => n
        .as_i64()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| TimestampError::Invalid(format!("{} is not epoch millis", n))),
      other => Err(TimestampError::Invalid(format!(
        "{} must be a string or number, got {}",
        self.field, other
      ))),
    }
  }
}

impl Timestamper<Value> for JsonFieldTimestamper {
  fn timestamp(&self, record: &Value) -> Result<DateTime<Utc>, TimestampError> {
    match record {
      Value::Object(object) => self.from_object(object),
      _ => Err(TimestampError::Invalid("record is not a JSON object".into())),
    }
  }
}

impl Timestamper<Map<String, Value>> for JsonFieldTimestamper {
  fn timestamp(&self, record: &Map<String, Value>) -> Result<DateTime<Utc>, TimestampError> {
    self.from_object(record)
  }
}
