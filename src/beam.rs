//! Per-window delivery channels.
//!
//! A [`Beam`] is bound to one window for its whole life. The router owns
//! beams through its window map; nothing else holds one past eviction.
//!
//! [`ClusterBeam`] is the stock implementation: a batch is split across
//! partitions by a stable hash of each record's bytes, and every shard is
//! pushed to all replicas of its partition. A shard counts as delivered when
//! any replica acknowledges it, and its acknowledged count is the best any
//! replica reported.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{DeliveryError, EndpointError, WindowFailure};
use crate::location::Location;
use crate::metrics;
use crate::retry::{RetryPolicy, retry};
use crate::rollup::Rollup;
use crate::window::Window;

/// What a beam reports back for one batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SendReport {
  /// Records acknowledged downstream.
  pub acknowledged: usize,
  /// Shards no replica accepted.
  pub failures: Vec<DeliveryError>,
}

impl SendReport {
  /// Converts shard failures into a window failure, if there are any.
  pub fn failure(&self) -> Option<WindowFailure> {
    if self.failures.is_empty() {
      None
    } else {
      Some(WindowFailure::Delivery(self.failures.clone()))
    }
  }
}

/// One partition of a beam as seen from outside.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionDescriptor {
  /// Partition index.
  pub index: usize,
  /// Firehose service name, when a location is configured.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub firehose: Option<String>,
  /// Ids of the replicas serving the partition.
  pub endpoints: Vec<String>,
}

/// Describes a beam for logs and introspection.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeamDescriptor {
  /// Window the beam serves.
  pub window: Window,
  /// Partition layout.
  pub partitions: Vec<PartitionDescriptor>,
  /// Downstream data source, when a location is configured.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data_source: Option<String>,
  /// Indexing service, when a location is configured.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub indexer_service: Option<String>,
  /// Rollup forwarded to the downstream tasks.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub rollup: Option<Rollup>,
}

/// A delivery channel for exactly one window.
///
/// `send` may be called concurrently from several `propose` calls.
#[async_trait]
pub trait Beam: Send + Sync {
  /// Delivers a batch and reports how much of it was acknowledged.
  ///
  /// Never fails as a whole; undelivered shards are listed in the report.
  async fn send(&self, records: Vec<Bytes>) -> SendReport;

  /// Releases the beam. Called once, after the last send has finished.
  async fn close(&self);

  /// Layout of the beam.
  fn descriptor(&self) -> &BeamDescriptor;
}

/// Beam that shards across partitions and replicates within each partition.
pub struct ClusterBeam {
  partitions: Vec<Vec<Arc<dyn Endpoint>>>,
  retry: RetryPolicy,
  descriptor: BeamDescriptor,
  closed: AtomicBool,
}

impl ClusterBeam {
  /// Lays `endpoints` out over at most `partitions` partitions.
  ///
  /// Endpoint `i` serves partition `i % partitions`; each partition keeps at
  /// most `replicants` endpoints. There are never more partitions than
  /// endpoints.
  pub fn new(
    window: Window,
    endpoints: Vec<Arc<dyn Endpoint>>,
    partitions: usize,
    replicants: usize,
    retry: RetryPolicy,
  ) -> Self {
    let count = partitions.max(1).min(endpoints.len());
    let mut layout: Vec<Vec<Arc<dyn Endpoint>>> = vec![Vec::new(); count];
    for (i, endpoint) in endpoints.into_iter().enumerate() {
      let replicas = &mut layout[i % count];
      if replicas.len() < replicants.max(1) {
        replicas.push(endpoint);
      }
    }

    let descriptor = BeamDescriptor {
      window,
      partitions: layout
        .iter()
        .enumerate()
        .map(|(index, replicas)| PartitionDescriptor {
          index,
          firehose: None,
          endpoints: replicas.iter().map(|e| e.id().to_string()).collect(),
        })
        .collect(),
      data_source: None,
      indexer_service: None,
      rollup: None,
    };

    Self {
      partitions: layout,
      retry,
      descriptor,
      closed: AtomicBool::new(false),
    }
  }

  /// Names each partition's firehose after `location`.
  pub fn with_location(mut self, location: &Location) -> Self {
    let window = self.descriptor.window;
    for partition in &mut self.descriptor.partitions {
      partition.firehose = Some(location.firehose_name(&window, partition.index));
    }
    self.descriptor.data_source = Some(location.data_source().to_string());
    self.descriptor.indexer_service = Some(location.indexer_service().to_string());
    self
  }

  /// Attaches the rollup forwarded downstream.
  pub fn with_rollup(mut self, rollup: Rollup) -> Self {
    self.descriptor.rollup = Some(rollup);
    self
  }

  /// Number of partitions actually in use.
  pub fn partition_count(&self) -> usize {
    self.partitions.len()
  }

  /// Partition a record is routed to.
  pub fn partition_for(&self, record: &[u8]) -> usize {
    match self.partitions.len() {
      0 => 0,
      n => (fnv1a(record) % n as u64) as usize,
    }
  }

  async fn send_shard(&self, partition: usize, shard: Vec<Bytes>) -> Result<usize, DeliveryError> {
    let records = shard.len();
    let replicas = &self.partitions[partition];
    let results = join_all(replicas.iter().map(|endpoint| {
      let shard = &shard;
      async move {
        retry(&self.retry, "push", move |_| endpoint.push(shard))
          .await
          .map(|acked| acked.min(records))
      }
    }))
    .await;

    let mut best: Option<usize> = None;
    let mut last_error = None;
    for result in results {
      match result {
        Ok(acked) => best = Some(best.map_or(acked, |b| b.max(acked))),
        Err(e) => last_error = Some(e),
      }
    }

    match (best, last_error) {
      (Some(acked), _) => Ok(acked),
      (None, Some(cause)) => Err(DeliveryError {
        partition,
        records,
        cause,
      }),
      (None, None) => Err(DeliveryError {
        partition,
        records,
        cause: no_replicas(partition),
      }),
    }
  }

  fn undeliverable(&self, records: usize, cause: EndpointError) -> SendReport {
    SendReport {
      acknowledged: 0,
      failures: vec![DeliveryError {
        partition: 0,
        records,
        cause,
      }],
    }
  }
}

#[async_trait]
impl Beam for ClusterBeam {
  async fn send(&self, records: Vec<Bytes>) -> SendReport {
    if records.is_empty() {
      return SendReport::default();
    }
    let window = self.descriptor.window;
    if self.closed.load(Ordering::SeqCst) {
      return self.undeliverable(
        records.len(),
        EndpointError::Rejected {
          endpoint: window.to_string(),
          reason: "beam closed".into(),
        },
      );
    }
    if self.partitions.is_empty() {
      return self.undeliverable(records.len(), no_replicas(0));
    }

    let mut shards: Vec<Vec<Bytes>> = vec![Vec::new(); self.partitions.len()];
    for record in records {
      let partition = self.partition_for(&record);
      shards[partition].push(record);
    }

    let results = join_all(
      shards
        .into_iter()
        .enumerate()
        .filter(|(_, shard)| !shard.is_empty())
        .map(|(partition, shard)| self.send_shard(partition, shard)),
    )
    .await;

    let mut report = SendReport::default();
    for result in results {
      match result {
        Ok(acked) => report.acknowledged += acked,
        Err(e) => {
          warn!(window = %window, partition = e.partition, records = e.records, error = %e.cause, "shard undelivered");
          metrics::record_delivery_failure(e.records as u64);
          report.failures.push(e);
        }
      }
    }
    debug!(window = %window, acknowledged = report.acknowledged, failed_shards = report.failures.len(), "batch sent");
    report
  }

  async fn close(&self) {
    if !self.closed.swap(true, Ordering::SeqCst) {
      info!(window = %self.descriptor.window, partitions = self.partitions.len(), "beam closed");
    }
  }

  fn descriptor(&self) -> &BeamDescriptor {
    &self.descriptor
  }
}

fn no_replicas(partition: usize) -> EndpointError {
  EndpointError::Unreachable {
    endpoint: format!("partition-{}", partition),
    reason: "no replicas".into(),
  }
}

/// 64-bit FNV-1a; stable across processes and platforms.
fn fnv1a(bytes: &[u8]) -> u64 {
  const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
  const PRIME: u64 = 0x0000_0100_0000_01b3;
  bytes
    .iter()
    .fold(OFFSET, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(PRIME))
}
