//! Operational metrics for the router.
//!
//! Recorded through the [`metrics`](https://docs.rs/metrics) facade; nothing is
//! exported unless the host application installs a recorder (Prometheus,
//! StatsD, ...). Without one, every call here is a no-op.
//!
//! | Name | Kind | Labels |
//! |------|------|--------|
//! | `beamweave_records_total` | counter | `outcome` = accepted, too_late, too_early, unstamped, failed |
//! | `beamweave_beams_created_total` | counter | |
//! | `beamweave_beams_evicted_total` | counter | |
//! | `beamweave_discovery_failures_total` | counter | |
//! | `beamweave_undelivered_records_total` | counter | |
//! | `beamweave_active_windows` | gauge | |

use metrics::{counter, gauge};

use crate::outcome::Outcome;

/// Records the per-record results of one `propose` call.
pub fn record_outcome(outcome: &Outcome) {
  for (label, count) in [
    ("accepted", outcome.accepted),
    ("too_late", outcome.dropped_too_late),
    ("too_early", outcome.dropped_too_early),
    ("unstamped", outcome.unstamped),
    ("failed", outcome.failed),
  ] {
    if count > 0 {
      counter!("beamweave_records_total", "outcome" => label).increment(count as u64);
    }
  }
}

/// Records a successful beam creation.
pub fn record_beam_created() {
  counter!("beamweave_beams_created_total").increment(1);
}

/// Records `count` beams evicted by maintenance or close.
pub fn record_beams_evicted(count: u64) {
  counter!("beamweave_beams_evicted_total").increment(count);
}

/// Records a beam creation that gave up on discovery.
pub fn record_discovery_failure() {
  counter!("beamweave_discovery_failures_total").increment(1);
}

/// Records records in a shard no replica accepted.
pub fn record_delivery_failure(records: u64) {
  counter!("beamweave_undelivered_records_total").increment(records);
}

/// Sets the number of windows currently holding a beam slot.
pub fn set_active_windows(count: usize) {
  gauge!("beamweave_active_windows").set(count as f64);
}
