//! Bounded retry with exponential backoff.
//!
//! Discovery (inside [`ClusterBeamFactory`](crate::beam_factory::ClusterBeamFactory))
//! and endpoint pushes (inside [`ClusterBeam`](crate::beam::ClusterBeam)) both
//! run through [`retry`]. Each attempt gets its own timeout; the number of
//! attempts is capped, wall-clock waiting is not.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ConfigError;

/// Errors that can be fed through [`retry`].
pub trait Retryable: std::error::Error + Sized {
  /// Whether another attempt may succeed.
  fn is_transient(&self) -> bool;

  /// Error used when a single attempt exceeds its timeout.
  fn timed_out(after: Duration) -> Self;

  /// Wraps the last error once all attempts are used up.
  fn exhausted(attempts: u32, last: Self) -> Self;
}

/// Policy for retrying a transient operation.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
  /// Total attempts including the first one. Always >= 1.
  pub max_attempts: u32,
  /// Delay before the second attempt.
  pub initial_backoff: Duration,
  /// Upper bound on any single delay.
  pub max_backoff: Duration,
  /// Timeout applied to each attempt.
  pub attempt_timeout: Duration,
  /// Randomise each delay into `[delay/2, delay]`.
  pub jitter: bool,
}

impl RetryPolicy {
  /// Creates a policy with the given attempt cap and defaults for the rest.
  pub fn new(max_attempts: u32) -> Self {
    Self {
      max_attempts,
      ..Self::default()
    }
  }

  /// Sets the delay before the second attempt.
  pub fn with_initial_backoff(mut self, d: Duration) -> Self {
    self.initial_backoff = d;
    self
  }

  /// Sets the cap on a single delay.
  pub fn with_max_backoff(mut self, d: Duration) -> Self {
    self.max_backoff = d;
    self
  }

  /// Sets the per-attempt timeout.
  pub fn with_attempt_timeout(mut self, d: Duration) -> Self {
    self.attempt_timeout = d;
    self
  }

  /// Enables or disables jitter.
  pub fn with_jitter(mut self, jitter: bool) -> Self {
    self.jitter = jitter;
    self
  }

  /// Checks the policy for values that would make retrying meaningless.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.max_attempts == 0 {
      return Err(ConfigError::Retry("max_attempts must be >= 1".into()));
    }
    if self.attempt_timeout.is_zero() {
      return Err(ConfigError::Retry("attempt_timeout must be > 0".into()));
    }
    if self.max_backoff < self.initial_backoff {
      return Err(ConfigError::Retry(
        "max_backoff must be >= initial_backoff".into(),
      ));
    }
    Ok(())
  }

  /// Delay to wait after the given failed attempt (1-based), before jitter.
  pub fn backoff_for(&self, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    self
      .initial_backoff
      .saturating_mul(1u32 << shift)
      .min(self.max_backoff)
  }

  fn delay_for(&self, attempt: u32) -> Duration {
    let base = self.backoff_for(attempt);
    if !self.jitter || base.is_zero() {
      return base;
    }
    let millis = base.as_millis() as u64;
    let jittered = rand::thread_rng().gen_range(millis / 2..=millis);
    Duration::from_millis(jittered)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 4,
      initial_backoff: Duration::from_millis(100),
      max_backoff: Duration::from_secs(5),
      attempt_timeout: Duration::from_secs(10),
      jitter: true,
    }
  }
}

/// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
///
/// A permanent error is returned as-is. Exhausting the attempt cap returns
/// [`Retryable::exhausted`] wrapping the last error.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T, E>
where
  E: Retryable,
  F: FnMut(u32) -> Fut,
  Fut: Future<Output = Result<T, E>>,
{
  let max_attempts = policy.max_attempts.max(1);
  let mut attempt = 1;
  loop {
    let result = match tokio::time::timeout(policy.attempt_timeout, op(attempt)).await {
      Ok(result) => result,
      Err(_) => Err(E::timed_out(policy.attempt_timeout)),
    };

    let err = match result {
      Ok(value) => {
        if attempt > 1 {
          debug!(op = op_name, attempt, "succeeded after retry");
        }
        return Ok(value);
      }
      Err(err) => err,
    };

    if !err.is_transient() {
      warn!(op = op_name, attempt, error = %err, "permanent failure, not retrying");
      return Err(err);
    }
    if attempt >= max_attempts {
      warn!(op = op_name, attempts = attempt, error = %err, "retries exhausted");
      return Err(E::exhausted(attempt, err));
    }

    let delay = policy.delay_for(attempt);
    debug!(
      op = op_name,
      attempt,
      delay_ms = delay.as_millis() as u64,
      error = %err,
      "transient failure, backing off"
    );
    tokio::time::sleep(delay).await;
    attempt += 1;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::DiscoveryError;
  use std::sync::Arc;
  use std::sync::atomic::{AtomicU32, Ordering};

  fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts)
      .with_initial_backoff(Duration::from_millis(10))
      .with_max_backoff(Duration::from_millis(40))
      .with_attempt_timeout(Duration::from_millis(100))
      .with_jitter(false)
  }

  #[test]
  fn test_backoff_doubles_and_caps() {
    let policy = fast_policy(5);
    assert_eq!(policy.backoff_for(1), Duration::from_millis(10));
    assert_eq!(policy.backoff_for(2), Duration::from_millis(20));
    assert_eq!(policy.backoff_for(3), Duration::from_millis(40));
    assert_eq!(policy.backoff_for(4), Duration::from_millis(40));
  }

  #[test]
  fn test_jitter_stays_in_range() {
    let policy = fast_policy(5).with_jitter(true);
    for _ in 0..100 {
      let d = policy.delay_for(2);
      assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
    }
  }

  #[test]
  fn test_validate() {
    assert!(RetryPolicy::default().validate().is_ok());
    assert!(RetryPolicy::new(0).validate().is_err());
    assert!(
      RetryPolicy::default()
        .with_attempt_timeout(Duration::ZERO)
        .validate()
        .is_err()
    );
    assert!(
      RetryPolicy::default()
        .with_initial_backoff(Duration::from_secs(10))
        .with_max_backoff(Duration::from_secs(1))
        .validate()
        .is_err()
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_succeeds_after_transient_failures() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let result: Result<u32, DiscoveryError> = retry(&fast_policy(4), "resolve", |attempt| {
      let c = c.clone();
      async move {
        c.fetch_add(1, Ordering::SeqCst);
        if attempt < 3 {
          Err(DiscoveryError::Unavailable("down".into()))
        } else {
          Ok(attempt)
        }
      }
    })
    .await;
    assert_eq!(result.unwrap(), 3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_exhausts() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let result: Result<(), DiscoveryError> = retry(&fast_policy(3), "resolve", |_| {
      let c = c.clone();
      async move {
        c.fetch_add(1, Ordering::SeqCst);
        Err(DiscoveryError::Unavailable("down".into()))
      }
    })
    .await;
    match result {
      Err(DiscoveryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 3),
      other => panic!("expected exhaustion, got {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_stops_on_permanent_error() {
    let calls = Arc::new(AtomicU32::new(0));
    let c = calls.clone();
    let result: Result<(), DiscoveryError> = retry(&fast_policy(5), "resolve", |_| {
      let c = c.clone();
      async move {
        c.fetch_add(1, Ordering::SeqCst);
        Err(DiscoveryError::Permanent("no such path".into()))
      }
    })
    .await;
    assert_eq!(result, Err(DiscoveryError::Permanent("no such path".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_times_out_each_attempt() {
    let result: Result<(), DiscoveryError> = retry(&fast_policy(2), "resolve", |_| async {
      tokio::time::sleep(Duration::from_secs(60)).await;
      Ok(())
    })
    .await;
    match result {
      Err(DiscoveryError::Exhausted { attempts, last }) => {
        assert_eq!(attempts, 2);
        assert_eq!(*last, DiscoveryError::Timeout(Duration::from_millis(100)));
      }
      other => panic!("expected timeout exhaustion, got {:?}", other),
    }
  }
}
