//! # BeamWeave
//!
//! Time-partitioned event routing in pure Rust.
//!
//! BeamWeave takes a continuous stream of timestamped records, buckets them
//! into fixed time windows and fans each window's records out to a
//! per-window delivery channel (a *beam*). Beams are created lazily through
//! endpoint discovery the first time a window sees data, and torn down once
//! the window has closed for late arrivals.
//!
//! ## Key Features
//!
//! - **Windowed admission**: late and early records are dropped and counted
//! - **Lazy beams**: one beam per window, created exactly once even under races
//! - **Bounded retry**: discovery and delivery retry with capped backoff
//! - **Exact accounting**: every proposed record lands in one outcome bucket
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use beamweave::beam_factory::ClusterBeamFactory;
//! use beamweave::config::RouterSettings;
//! use beamweave::discovery::StaticDiscovery;
//! use beamweave::endpoint::MemoryEndpoint;
//! use beamweave::record::{JsonFieldTimestamper, JsonWriter};
//! use beamweave::router::Router;
//! use serde_json::Value;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = RouterSettings::from_json_str(r#"{"tuning": {"windowPeriod": "PT10M"}}"#)?;
//! let discovery = StaticDiscovery::new(settings.discovery_path.clone())
//!   .with_endpoint(Arc::new(MemoryEndpoint::new("local")));
//!
//! let router: Router<Value> = Router::builder(settings.tuning_config()?)
//!   .with_beam_factory(Arc::new(settings.beam_factory(Arc::new(discovery))?))
//!   .with_timestamper(Arc::new(JsonFieldTimestamper::new("timestamp")))
//!   .with_writer(Arc::new(JsonWriter))
//!   .build()?;
//! # let _ = router;
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Per-window delivery channels.
pub mod beam;
/// Beam construction from discovered endpoints.
pub mod beam_factory;
/// Wall-clock abstraction.
pub mod clock;
/// JSON settings and ISO-8601 periods.
pub mod config;
/// Endpoint discovery capability.
pub mod discovery;
/// Downstream ingestion endpoints.
pub mod endpoint;
/// Error types.
pub mod error;
/// Bucket granularities.
pub mod granularity;
/// Downstream location descriptor.
pub mod location;
/// Tracing subscriber helpers.
pub mod logging;
/// Operational metrics.
pub mod metrics;
/// Per-call accounting.
pub mod outcome;
/// Record timestamping and serialization capabilities.
pub mod record;
/// Bounded retry with backoff.
pub mod retry;
/// Rollup description forwarded to beams.
pub mod rollup;
/// The router.
pub mod router;
/// Tuning configuration and admission policy.
pub mod tuning;
/// Time windows.
pub mod window;
/// Window → beam map.
mod window_map;


pub use error::{ConfigError, RouterError};
pub use granularity::Granularity;
pub use outcome::{Outcome, WindowOutcome};
pub use router::{Router, RouterBuilder, RouterStats};
pub use tuning::{Admission, TuningConfig};
pub use window::Window;
pub use window_map::{WindowInfo, WindowState};
