//! Downstream ingestion endpoints.
//!
//! An [`Endpoint`] is a live handle obtained from discovery. The wire
//! protocol behind it is not the router's business; all the router sees is
//! "push these encoded records, get back how many were acknowledged".

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::EndpointError;

/// A live delivery endpoint for one window.
#[async_trait]
pub trait Endpoint: Send + Sync + fmt::Debug {
  /// Stable identifier, used for logging.
  fn id(&self) -> &str;

  /// Pushes encoded records and returns how many were acknowledged.
  ///
  /// The acknowledged count never exceeds `records.len()`.
  async fn push(&self, records: &[Bytes]) -> Result<usize, EndpointError>;
}

/// An endpoint that keeps everything it is sent in memory.
///
/// Useful for embedding the router without a downstream service and for
/// tests: it can be told to fail transiently, reject permanently, acknowledge
/// only part of each batch, or respond slowly.
#[derive(Debug)]
pub struct MemoryEndpoint {
  id: String,
  batches: Mutex<Vec<Vec<Bytes>>>,
  pushes: AtomicUsize,
  fail_next: AtomicU32,
  rejecting: AtomicBool,
  ack_limit: Option<usize>,
  delay: Option<Duration>,
}

impl MemoryEndpoint {
  /// Creates an endpoint that acknowledges everything.
  pub fn new(id: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      batches: Mutex::new(Vec::new()),
      pushes: AtomicUsize::new(0),
      fail_next: AtomicU32::new(0),
      rejecting: AtomicBool::new(false),
      ack_limit: None,
      delay: None,
    }
  }

  /// Acknowledges at most `limit` records per push.
  pub fn with_ack_limit(mut self, limit: usize) -> Self {
    self.ack_limit = Some(limit);
    self
  }

  /// Sleeps for `delay` before answering each push.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// Makes the next `n` pushes fail with a transient error.
  pub fn fail_next(&self, n: u32) {
    self.fail_next.store(n, Ordering::SeqCst);
  }

  /// Makes every push fail with a permanent rejection while set.
  pub fn set_rejecting(&self, rejecting: bool) {
    self.rejecting.store(rejecting, Ordering::SeqCst);
  }

  /// Batches accepted so far.
  pub fn batches(&self) -> Vec<Vec<Bytes>> {
    self.lock().clone()
  }

  /// Total records accepted so far.
  pub fn record_count(&self) -> usize {
    self.lock().iter().map(Vec::len).sum()
  }

  /// Push attempts so far, including failed ones.
  pub fn push_count(&self) -> usize {
    self.pushes.load(Ordering::SeqCst)
  }

  fn lock(&self) -> MutexGuard<'_, Vec<Vec<Bytes>>> {
    self
      .batches
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn take_failure(&self) -> bool {
    self
      .fail_next
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
  }
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
  fn id(&self) -> &str {
    &self.id
  }

  async fn push(&self, records: &[Bytes]) -> Result<usize, EndpointError> {
    self.pushes.fetch_add(1, Ordering::SeqCst);
    if let Some(delay) = self.delay {
      tokio::time::sleep(delay).await;
    }
    if self.rejecting.load(Ordering::SeqCst) {
      return Err(EndpointError::Rejected {
        endpoint: self.id.clone(),
        reason: "rejecting all batches".into(),
      });
    }
    if self.take_failure() {
      return Err(EndpointError::Unreachable {
        endpoint: self.id.clone(),
        reason: "injected failure".into(),
      });
    }

    let acked = self
      .ack_limit
      .map_or(records.len(), |limit| limit.min(records.len()));
    self.lock().push(records[..acked].to_vec());
    Ok(acked)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn batch(n: usize) -> Vec<Bytes> {
    (0..n).map(|i| Bytes::from(i.to_string())).collect()
  }

  #[tokio::test]
  async fn test_memory_endpoint_acknowledges_all() {
    let endpoint = MemoryEndpoint::new("e1");
    assert_eq!(endpoint.push(&batch(3)).await.unwrap(), 3);
    assert_eq!(endpoint.push(&batch(2)).await.unwrap(), 2);
    assert_eq!(endpoint.record_count(), 5);
    assert_eq!(endpoint.batches().len(), 2);
    assert_eq!(endpoint.id(), "e1");
  }

  #[tokio::test]
  async fn test_memory_endpoint_injected_failures() {
    let endpoint = MemoryEndpoint::new("e1");
    endpoint.fail_next(2);
    assert!(endpoint.push(&batch(1)).await.is_err());
    assert!(endpoint.push(&batch(1)).await.is_err());
    assert_eq!(endpoint.push(&batch(1)).await.unwrap(), 1);
    assert_eq!(endpoint.push_count(), 3);
    assert_eq!(endpoint.record_count(), 1);
  }

  #[tokio::test]
  async fn test_memory_endpoint_rejects() {
    let endpoint = MemoryEndpoint::new("e1");
    endpoint.set_rejecting(true);
    assert!(matches!(
      endpoint.push(&batch(1)).await,
      Err(EndpointError::Rejected { .. })
    ));
    endpoint.set_rejecting(false);
    assert!(endpoint.push(&batch(1)).await.is_ok());
  }

  #[tokio::test]
  async fn test_memory_endpoint_partial_ack() {
    let endpoint = MemoryEndpoint::new("e1").with_ack_limit(2);
    assert_eq!(endpoint.push(&batch(5)).await.unwrap(), 2);
    assert_eq!(endpoint.push(&batch(1)).await.unwrap(), 1);
    assert_eq!(endpoint.record_count(), 3);
  }
}
