//! # Router
//!
//! The router accepts batches of records, buckets them into windows, applies
//! the admission policy and fans each window's slice out to that window's
//! beam. It owns the window → beam map and is the only thing that creates,
//! reuses or evicts beams.
//!
//! ## Window lifecycle
//!
//! ```text
//! (absent) --first admitted record--> ACTIVE --now >= end + period--> DRAINING
//!     ^                                                                  |
//!     +---------------- evicted once no send is pending <----------------+
//! ```
//!
//! An evicted window that is still admissible later simply gets a fresh
//! slot, and with it a fresh discovery and a fresh beam.
//!
//! ## Accounting
//!
//! Every record passed to [`Router::propose`] is counted exactly once in the
//! returned [`Outcome`]. Failures are scoped to one window's slice; the only
//! call-level error is [`RouterError::Closed`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use beamweave::beam_factory::ClusterBeamFactory;
//! use beamweave::discovery::StaticDiscovery;
//! use beamweave::endpoint::MemoryEndpoint;
//! use beamweave::record::{JsonFieldTimestamper, JsonWriter};
//! use beamweave::router::Router;
//! use beamweave::tuning::TuningConfig;
//! use serde_json::{json, Value};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let tuning = TuningConfig::default();
//! let discovery = StaticDiscovery::new("/beams/discovery")
//!   .with_endpoint(Arc::new(MemoryEndpoint::new("local")));
//! let factory = ClusterBeamFactory::new(Arc::new(discovery), &tuning);
//!
//! let router: Router<Value> = Router::builder(tuning)
//!   .with_beam_factory(Arc::new(factory))
//!   .with_timestamper(Arc::new(JsonFieldTimestamper::new("timestamp")))
//!   .with_writer(Arc::new(JsonWriter))
//!   .build()?;
//!
//! let outcome = router.propose(&[json!({"timestamp": "2024-01-01T10:05:00Z"})]).await?;
//! println!("accepted {}", outcome.accepted);
//! # Ok(())
//! # }
//! ```

use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::beam_factory::BeamFactory;
use crate::clock::{Clock, SystemClock};
use crate::error::{ConfigError, RouterError, SerializationError, WindowFailure};
use crate::metrics;
use crate::outcome::{Outcome, WindowOutcome};
use crate::record::{ObjectWriter, Timestamper};
use crate::tuning::{Admission, TuningConfig, TuningPolicy};
use crate::window::Window;
use crate::window_map::{SlotGuard, WindowInfo, WindowMap, WindowSlot};

/// Counters kept over the router's lifetime.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
  /// Windows currently holding a slot.
  pub active_windows: usize,
  /// Beams successfully created.
  pub beams_created: u64,
  /// Created beams closed by maintenance, lazy eviction or close.
  pub beams_evicted: u64,
  /// Completed `propose` calls.
  pub proposals: u64,
}

#[derive(Default)]
struct Counters {
  beams_created: AtomicU64,
  beams_evicted: AtomicU64,
  proposals: AtomicU64,
}

struct Inner<T> {
  tuning: TuningConfig,
  policy: TuningPolicy,
  clock: Arc<dyn Clock>,
  timestamper: Arc<dyn Timestamper<T>>,
  writer: Arc<dyn ObjectWriter<T>>,
  factory: Arc<dyn BeamFactory>,
  windows: WindowMap,
  closed: AtomicBool,
  counters: Arc<Counters>,
}

/// Time-partitioned router. Cloning is cheap and clones share all state.
pub struct Router<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for Router<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

/// Builder for [`Router`].
pub struct RouterBuilder<T> {
  tuning: TuningConfig,
  clock: Arc<dyn Clock>,
  timestamper: Option<Arc<dyn Timestamper<T>>>,
  writer: Option<Arc<dyn ObjectWriter<T>>>,
  factory: Option<Arc<dyn BeamFactory>>,
}

impl<T> RouterBuilder<T> {
  /// Clock used for admission and eviction. Defaults to the system clock.
  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  /// Reads event time from records.
  pub fn with_timestamper(mut self, timestamper: Arc<dyn Timestamper<T>>) -> Self {
    self.timestamper = Some(timestamper);
    self
  }

  /// Serializes records for delivery.
  pub fn with_writer(mut self, writer: Arc<dyn ObjectWriter<T>>) -> Self {
    self.writer = Some(writer);
    self
  }

  /// Creates beams for new windows.
  pub fn with_beam_factory(mut self, factory: Arc<dyn BeamFactory>) -> Self {
    self.factory = Some(factory);
    self
  }

  /// Builds the router; every collaborator except the clock is required.
  pub fn build(self) -> Result<Router<T>, ConfigError> {
    let timestamper = self.timestamper.ok_or(ConfigError::Missing("timestamper"))?;
    let writer = self.writer.ok_or(ConfigError::Missing("object writer"))?;
    let factory = self.factory.ok_or(ConfigError::Missing("beam factory"))?;
    Ok(Router {
      inner: Arc::new(Inner {
        policy: TuningPolicy::new(&self.tuning),
        tuning: self.tuning,
        clock: self.clock,
        timestamper,
        writer,
        factory,
        windows: WindowMap::new(),
        closed: AtomicBool::new(false),
        counters: Arc::new(Counters::default()),
      }),
    })
  }
}

/// A window's admitted slice after serialization.
struct Slice {
  window: Window,
  records: usize,
  encoded: Result<Vec<Bytes>, SerializationError>,
}

impl<T> Router<T> {
  /// Starts a builder for a router with the given tuning.
  pub fn builder(tuning: TuningConfig) -> RouterBuilder<T> {
    RouterBuilder {
      tuning,
      clock: Arc::new(SystemClock),
      timestamper: None,
      writer: None,
      factory: None,
    }
  }

  /// Tuning the router was built with.
  pub fn tuning(&self) -> &TuningConfig {
    &self.inner.tuning
  }

  /// Whether [`close`](Self::close) has been called.
  pub fn is_closed(&self) -> bool {
    self.inner.closed.load(Ordering::SeqCst)
  }

  /// Routes a batch of records and reports what happened to each of them.
  ///
  /// Admission is decided per record against the clock at the moment the
  /// record is examined. Admitted records are grouped by window, serialized
  /// per window and sent through each window's beam concurrently.
  ///
  /// Sends are dispatched on their own tasks: dropping the returned future
  /// does not cancel them.
  pub async fn propose(&self, records: &[T]) -> Result<Outcome, RouterError> {
    if self.is_closed() {
      return Err(RouterError::Closed);
    }

    let (mut outcome, slices) = self.partition(records);
    if slices.is_empty() {
      self.finish(&outcome, records.len());
      return Ok(outcome);
    }

    self.evict_closed().await;

    let mut failed_early = Vec::new();
    let mut dispatched = Vec::with_capacity(slices.len());
    for slice in slices {
      match slice.encoded {
        Ok(encoded) => {
          let Some(guard) = self
            .inner
            .windows
            .acquire(slice.window, self.inner.clock.now())
            .await
          else {
            debug!(window = %slice.window, records = slice.records, "router closed mid-proposal");
            failed_early.push(WindowOutcome::failed(
              slice.window,
              slice.records,
              WindowFailure::Closed,
            ));
            continue;
          };
          let task = tokio::spawn(dispatch(
            guard,
            self.inner.factory.clone(),
            self.inner.counters.clone(),
            encoded,
          ));
          dispatched.push((slice.window, slice.records, task));
        }
        Err(e) => {
          warn!(window = %slice.window, records = slice.records, error = %e, "window slice not serializable");
          failed_early.push(WindowOutcome::failed(
            slice.window,
            slice.records,
            WindowFailure::Serialization(e),
          ));
        }
      }
    }

    let (meta, tasks): (Vec<(Window, usize)>, Vec<JoinHandle<WindowOutcome>>) = dispatched
      .into_iter()
      .map(|(window, records, task)| ((window, records), task))
      .unzip();
    let results = join_all(tasks).await;

    let mut windows = failed_early;
    for ((window, records), result) in meta.into_iter().zip(results) {
      windows.push(result.unwrap_or_else(|e| {
        warn!(window = %window, error = %e, "dispatch task ended abnormally");
        WindowOutcome::failed(window, records, WindowFailure::Aborted(e.to_string()))
      }));
    }
    windows.sort_by_key(|w| w.window);
    for window in windows {
      outcome.push_window(window);
    }

    self.finish(&outcome, records.len());
    Ok(outcome)
  }

  /// Timestamps, buckets, admits and serializes; no suspension points.
  fn partition(&self, records: &[T]) -> (Outcome, Vec<Slice>) {
    let inner = &self.inner;
    let granularity = inner.tuning.segment_granularity();
    let mut outcome = Outcome::default();
    let mut admitted: BTreeMap<Window, Vec<&T>> = BTreeMap::new();

    for record in records {
      let timestamp = match inner.timestamper.timestamp(record) {
        Ok(timestamp) => timestamp,
        Err(e) => {
          debug!(error = %e, "record skipped");
          outcome.unstamped += 1;
          continue;
        }
      };
      let window = granularity.bucket(timestamp);
      match inner.policy.admit(&window, inner.clock.now()) {
        Admission::Accept => admitted.entry(window).or_default().push(record),
        Admission::TooLate => outcome.dropped_too_late += 1,
        Admission::TooEarly => outcome.dropped_too_early += 1,
      }
    }

    let slices = admitted
      .into_iter()
      .map(|(window, batch)| Slice {
        window,
        records: batch.len(),
        encoded: batch
          .into_iter()
          .map(|record| inner.writer.as_bytes(record))
          .collect(),
      })
      .collect();
    (outcome, slices)
  }

  fn finish(&self, outcome: &Outcome, input: usize) {
    debug_assert_eq!(outcome.total(), input);
    self.inner.counters.proposals.fetch_add(1, Ordering::Relaxed);
    metrics::record_outcome(outcome);
    debug!(
      records = input,
      accepted = outcome.accepted,
      too_late = outcome.dropped_too_late,
      too_early = outcome.dropped_too_early,
      unstamped = outcome.unstamped,
      failed = outcome.failed,
      "proposal complete"
    );
  }

  /// Evicts closed windows and pre-creates the next window's beam.
  ///
  /// Returns the number of windows evicted. Warming failures are logged and
  /// left for the next call.
  pub async fn maintain(&self) -> usize {
    if self.is_closed() {
      return 0;
    }
    let evicted = self.evict_closed().await;
    self.warm().await;
    metrics::set_active_windows(self.inner.windows.len().await);
    evicted
  }

  async fn evict_closed(&self) -> usize {
    let now = self.inner.clock.now();
    let policy = &self.inner.policy;
    let evicted = self
      .inner
      .windows
      .evict(|window| policy.is_closed(window, now))
      .await;
    self.close_slots(evicted, "window closed").await
  }

  /// Closes the beams of removed slots; returns the number of slots.
  async fn close_slots(&self, slots: Vec<Arc<WindowSlot>>, reason: &str) -> usize {
    let count = slots.len();
    let mut beams = 0u64;
    for slot in slots {
      if let Some(beam) = slot.existing_beam() {
        beam.close().await;
        beams += 1;
      }
      info!(window = %slot.window(), reason, "window evicted");
    }
    if beams > 0 {
      self
        .inner
        .counters
        .beams_evicted
        .fetch_add(beams, Ordering::Relaxed);
      metrics::record_beams_evicted(beams);
    }
    count
  }

  async fn warm(&self) {
    let inner = &self.inner;
    let warming = inner.tuning.warming_period();
    if warming.is_zero() {
      return;
    }
    let now = inner.clock.now();
    let Ok(ahead) = chrono::Duration::from_std(warming) else {
      return;
    };
    let Some(horizon) = now.checked_add_signed(ahead) else {
      return;
    };
    let granularity = inner.tuning.segment_granularity();
    let next = granularity.bucket(horizon);
    if next == granularity.bucket(now) || inner.policy.admit(&next, now) != Admission::Accept {
      return;
    }
    if inner.windows.has_beam(&next).await {
      return;
    }

    let Some(guard) = inner.windows.acquire(next, now).await else {
      return;
    };
    match guard.slot().beam(inner.factory.as_ref()).await {
      Ok((beam, created)) => {
        if created {
          inner.counters.beams_created.fetch_add(1, Ordering::Relaxed);
          if guard.slot().is_retired() {
            beam.close().await;
            return;
          }
          info!(window = %next, "beam warmed");
        }
      }
      Err(e) => warn!(window = %next, error = %e, "warming failed, will retry"),
    }
  }

  /// Snapshot of the windows currently in the map.
  pub async fn active_windows(&self) -> Vec<WindowInfo> {
    let now = self.inner.clock.now();
    let policy = &self.inner.policy;
    self
      .inner
      .windows
      .snapshot(|window| policy.is_closed(window, now))
      .await
  }

  /// Lifetime counters.
  pub async fn stats(&self) -> RouterStats {
    let counters = &self.inner.counters;
    RouterStats {
      active_windows: self.inner.windows.len().await,
      beams_created: counters.beams_created.load(Ordering::Relaxed),
      beams_evicted: counters.beams_evicted.load(Ordering::Relaxed),
      proposals: counters.proposals.load(Ordering::Relaxed),
    }
  }

  /// Closes the router and every beam it holds.
  ///
  /// Later `propose` calls fail with [`RouterError::Closed`]. A call already
  /// past that check reports its undispatched slices as
  /// [`WindowFailure::Closed`]. Sends already dispatched keep their beam
  /// handle but find it closed.
  pub async fn close(&self) {
    if self.inner.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    let slots = self.inner.windows.drain().await;
    let count = self.close_slots(slots, "router closed").await;
    metrics::set_active_windows(0);
    info!(windows = count, "router closed");
  }
}

impl<T: 'static> Router<T> {
  /// Runs [`maintain`](Self::maintain) every `interval` until the router is closed.
  pub fn spawn_maintenance(&self, interval: Duration) -> JoinHandle<()> {
    let router = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        if router.is_closed() {
          debug!("maintenance stopped");
          break;
        }
        let evicted = router.maintain().await;
        if evicted > 0 {
          debug!(evicted, "maintenance pass");
        }
      }
    })
  }
}

/// Sends one window's slice; runs on its own task.
async fn dispatch(
  guard: SlotGuard,
  factory: Arc<dyn BeamFactory>,
  counters: Arc<Counters>,
  encoded: Vec<Bytes>,
) -> WindowOutcome {
  let slot = guard.slot();
  let window = slot.window();
  let records = encoded.len();

  let beam = match slot.beam(factory.as_ref()).await {
    Ok((beam, created)) => {
      if created {
        counters.beams_created.fetch_add(1, Ordering::Relaxed);
        // The slot left the map while the beam was being built.
        if slot.is_retired() {
          beam.close().await;
        }
      }
      beam
    }
    Err(e) => {
      return WindowOutcome::failed(window, records, WindowFailure::Discovery(e));
    }
  };

  let report = beam.send(encoded).await;
  let failure = report.failure();
  let outcome = WindowOutcome::new(window, records, report.acknowledged, failure);
  if outcome.failed > 0 {
    debug!(window = %window, failed = outcome.failed, "window slice partly undelivered");
  }
  outcome
}
