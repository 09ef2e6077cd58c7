//! Beam construction.
//!
//! The router asks a [`BeamFactory`] for a beam the first time a window is
//! touched and never again for that window until it has been evicted.
//! [`ClusterBeamFactory`] resolves the window's endpoints through discovery
//! (with bounded retry) and lays them out into a [`ClusterBeam`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::beam::{Beam, ClusterBeam};
use crate::discovery::DiscoveryClient;
use crate::error::{ConfigError, DiscoveryError};
use crate::location::Location;
use crate::metrics;
use crate::retry::{RetryPolicy, retry};
use crate::rollup::Rollup;
use crate::tuning::TuningConfig;
use crate::window::Window;

/// Creates the beam for a window.
#[async_trait]
pub trait BeamFactory: Send + Sync {
  /// Builds a ready-to-use beam bound to `window`.
  async fn make_beam(&self, window: &Window) -> Result<Arc<dyn Beam>, DiscoveryError>;
}

/// Factory producing [`ClusterBeam`]s from discovered endpoints.
pub struct ClusterBeamFactory {
  discovery: Arc<dyn DiscoveryClient>,
  retry: RetryPolicy,
  partitions: usize,
  replicants: usize,
  location: Option<Location>,
  rollup: Option<Rollup>,
}

impl ClusterBeamFactory {
  /// Creates a factory shaped by `tuning`, with the default retry policy.
  pub fn new(discovery: Arc<dyn DiscoveryClient>, tuning: &TuningConfig) -> Self {
    Self {
      discovery,
      retry: RetryPolicy::default(),
      partitions: tuning.partitions(),
      replicants: tuning.replicants(),
      location: None,
      rollup: None,
    }
  }

  /// Retry policy for discovery and for every endpoint push.
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Downstream location forwarded to each beam.
  pub fn with_location(mut self, location: Location) -> Self {
    self.location = Some(location);
    self
  }

  /// Rollup forwarded to each beam.
  pub fn with_rollup(mut self, rollup: Rollup) -> Self {
    self.rollup = Some(rollup);
    self
  }

  /// Checks everything the factory was given.
  pub fn validate(&self) -> Result<(), ConfigError> {
    self.retry.validate()?;
    if let Some(location) = &self.location {
      location.validate()?;
    }
    if let Some(rollup) = &self.rollup {
      rollup.validate()?;
    }
    Ok(())
  }
}

#[async_trait]
impl BeamFactory for ClusterBeamFactory {
  async fn make_beam(&self, window: &Window) -> Result<Arc<dyn Beam>, DiscoveryError> {
    let discovery = &self.discovery;
    let resolved = retry(&self.retry, "discover", move |attempt| {
      debug!(window = %window, attempt, "resolving endpoints");
      discovery.resolve(window)
    })
    .await;

    let endpoints = match resolved {
      Ok(endpoints) => endpoints,
      Err(e) => {
        warn!(window = %window, error = %e, "beam creation failed");
        metrics::record_discovery_failure();
        return Err(e);
      }
    };

    let mut beam = ClusterBeam::new(
      *window,
      endpoints,
      self.partitions,
      self.replicants,
      self.retry.clone(),
    );
    if let Some(location) = &self.location {
      beam = beam.with_location(location);
    }
    if let Some(rollup) = &self.rollup {
      beam = beam.with_rollup(rollup.clone());
    }

    info!(
      window = %window,
      partitions = beam.partition_count(),
      "beam created"
    );
    metrics::record_beam_created();
    Ok(Arc::new(beam))
  }
}
