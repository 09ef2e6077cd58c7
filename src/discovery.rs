//! Endpoint discovery.
//!
//! Discovery is a capability: "given a window, which endpoints are live for
//! it right now". How that is answered (a coordination service, DNS, a static
//! list) is up to the [`DiscoveryClient`] implementation. The router only
//! relies on the error kinds: transient failures are retried by the beam
//! factory, permanent ones fail the window's slice immediately.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::endpoint::Endpoint;
use crate::error::DiscoveryError;
use crate::window::Window;

/// Resolves a window to its live endpoints.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
  /// Returns the endpoints currently serving `window`.
  ///
  /// An empty set is reported as [`DiscoveryError::NoEndpoints`].
  async fn resolve(&self, window: &Window) -> Result<Vec<Arc<dyn Endpoint>>, DiscoveryError>;
}

/// Discovery backed by an in-process registry.
///
/// Endpoints registered without a window serve every window; endpoints
/// registered for a specific window take precedence for that window.
#[derive(Default)]
pub struct StaticDiscovery {
  path: String,
  defaults: RwLock<Vec<Arc<dyn Endpoint>>>,
  per_window: RwLock<HashMap<Window, Vec<Arc<dyn Endpoint>>>>,
}

impl StaticDiscovery {
  /// Creates an empty registry for the given discovery path.
  pub fn new(path: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      ..Self::default()
    }
  }

  /// Adds an endpoint serving every window.
  pub fn with_endpoint(self, endpoint: Arc<dyn Endpoint>) -> Self {
    self.register(endpoint);
    self
  }

  /// Discovery path this registry answers for.
  pub fn path(&self) -> &str {
    &self.path
  }

  /// Registers an endpoint serving every window.
  pub fn register(&self, endpoint: Arc<dyn Endpoint>) {
    self
      .defaults
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .push(endpoint);
  }

  /// Registers an endpoint serving only `window`.
  pub fn register_for(&self, window: Window, endpoint: Arc<dyn Endpoint>) {
    self
      .per_window
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .entry(window)
      .or_default()
      .push(endpoint);
  }

  /// Removes every endpoint registered for `window`.
  pub fn deregister_window(&self, window: &Window) {
    self
      .per_window
      .write()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .remove(window);
  }
}

#[async_trait]
impl DiscoveryClient for StaticDiscovery {
  async fn resolve(&self, window: &Window) -> Result<Vec<Arc<dyn Endpoint>>, DiscoveryError> {
    let specific = self
      .per_window
      .read()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .get(window)
      .cloned();
    let endpoints = match specific {
      Some(endpoints) => endpoints,
      None => self
        .defaults
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone(),
    };
    if endpoints.is_empty() {
      return Err(DiscoveryError::NoEndpoints {
        service: format!("{}/{}", self.path, window),
      });
    }
    Ok(endpoints)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::endpoint::MemoryEndpoint;
  use crate::granularity::Granularity;
  use chrono::{TimeZone, Utc};

  fn window(hour: u32) -> Window {
    Granularity::Hour.bucket(Utc.with_ymd_and_hms(2024, 1, 1, hour, 0, 0).unwrap())
  }

  #[tokio::test]
  async fn test_static_discovery_defaults() {
    let discovery = StaticDiscovery::new("/test/discovery")
      .with_endpoint(Arc::new(MemoryEndpoint::new("a")))
      .with_endpoint(Arc::new(MemoryEndpoint::new("b")));
    let endpoints = discovery.resolve(&window(10)).await.unwrap();
    let ids: Vec<&str> = endpoints.iter().map(|e| e.id()).collect();
    assert_eq!(ids, vec!["a", "b"]);
  }

  #[tokio::test]
  async fn test_static_discovery_per_window() {
    let discovery =
      StaticDiscovery::new("/test/discovery").with_endpoint(Arc::new(MemoryEndpoint::new("a")));
    discovery.register_for(window(11), Arc::new(MemoryEndpoint::new("special")));

    let endpoints = discovery.resolve(&window(11)).await.unwrap();
    assert_eq!(endpoints[0].id(), "special");
    let endpoints = discovery.resolve(&window(10)).await.unwrap();
    assert_eq!(endpoints[0].id(), "a");

    discovery.deregister_window(&window(11));
    let endpoints = discovery.resolve(&window(11)).await.unwrap();
    assert_eq!(endpoints[0].id(), "a");
  }

  #[tokio::test]
  async fn test_static_discovery_empty() {
    let discovery = StaticDiscovery::new("/test/discovery");
    assert_eq!(discovery.path(), "/test/discovery");
    match discovery.resolve(&window(10)).await {
      Err(DiscoveryError::NoEndpoints { service }) => {
        assert!(service.starts_with("/test/discovery/2024-01-01T10:00:00Z"));
      }
      other => panic!("expected NoEndpoints, got {:?}", other.map(|e| e.len())),
    }
  }
}
