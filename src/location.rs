//! Downstream location descriptor.
//!
//! Names the indexing service, the firehose naming pattern and the data
//! source a beam delivers into. The router forwards it to beam construction
//! untouched; it only uses it to derive per-window service names.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::window::Window;

/// Where a window's records end up downstream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
  indexer_service: String,
  firehose_pattern: String,
  data_source: String,
}

impl Location {
  /// Creates a location; `firehose_pattern` must contain one `%s`.
  pub fn create(
    indexer_service: impl Into<String>,
    firehose_pattern: impl Into<String>,
    data_source: impl Into<String>,
  ) -> Result<Self, ConfigError> {
    let location = Self {
      indexer_service: indexer_service.into(),
      firehose_pattern: firehose_pattern.into(),
      data_source: data_source.into(),
    };
    location.validate()?;
    Ok(location)
  }

  /// Checks that every field is usable.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.indexer_service.trim().is_empty() {
      return Err(ConfigError::Location("indexer service is empty".into()));
    }
    if self.data_source.trim().is_empty() {
      return Err(ConfigError::Location("data source is empty".into()));
    }
    if self.firehose_pattern.matches("%s").count() != 1 {
      return Err(ConfigError::Location(format!(
        "firehose pattern {:?} must contain exactly one %s",
        self.firehose_pattern
      )));
    }
    Ok(())
  }

  /// Indexing service name.
  pub fn indexer_service(&self) -> &str {
    &self.indexer_service
  }

  /// Firehose naming pattern.
  pub fn firehose_pattern(&self) -> &str {
    &self.firehose_pattern
  }

  /// Data source name.
  pub fn data_source(&self) -> &str {
    &self.data_source
  }

  /// Firehose service name for one partition of one window.
  pub fn firehose_name(&self, window: &Window, partition: usize) -> String {
    let id = format!(
      "{}-{}-{:04}",
      self.data_source,
      window.start().format("%Y%m%dT%H%M%SZ"),
      partition
    );
    self.firehose_pattern.replacen("%s", &id, 1)
  }
}
