//! Bounded exponential-backoff retry for backend operations.
//!
//! Only errors for which [`TenantryError::is_transient`] holds are retried.
//! Everything else is returned unchanged after the first attempt. Delays
//! grow as `base_delay * multiplier^(attempt - 1)`, capped at `max_delay`,
//! plus a uniform random jitter in `[0, jitter]`:
//!
//! | Retry after attempt | Default delay (before jitter) |
//! |---------------------|-------------------------------|
//! | 1                   | 500 ms                        |
//! | 2                   | 1 s                           |
//! | 3                   | 2 s                           |
//!
//! When the executor is attached to a [`ConnectivityStatus`] that reports
//! `Offline`, the attempt budget drops to one so callers fail fast instead
//! of stacking retries against a backend known to be down.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rand::Rng;
use tenantry_core::error::{TenantryError, TenantryResult};
use tracing::{debug, warn};

use crate::status::ConnectivityStatus;

/// Retry parameters for one class of operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    /// Delay before the second attempt (default: 500 ms).
    pub base_delay: Duration,
    /// Growth factor applied per attempt (default: 2.0).
    pub multiplier: f64,
    /// Cap on the exponential part of the delay (default: 10 s).
    pub max_delay: Duration,
    /// Upper bound of the random delay added to each backoff (default: 250 ms).
    pub jitter: Duration,
    /// Deadline for a single attempt (default: 10 s).
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// More attempts with shorter gaps, used to confirm a reconnect.
    pub fn probe() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
            jitter: Duration::from_millis(100),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    /// Backoff after the given failed attempt (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    fn jitter_sample(&self) -> Duration {
        let bound = self.jitter.as_millis() as u64;
        if bound == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=bound))
    }
}

/// Consecutive failed attempts, shared with whoever wants to watch them.
///
/// Incremented on every failed attempt and reset by the first success.
#[derive(Debug, Clone, Default)]
pub struct FailureCounter(Arc<AtomicU32>);

impl FailureCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::Release);
    }

    fn increment(&self) -> u32 {
        self.0.fetch_add(1, Ordering::AcqRel).saturating_add(1)
    }
}

/// Runs operations under a [`RetryPolicy`].
#[derive(Clone, Default)]
pub struct RetryExecutor {
    connectivity: Option<ConnectivityStatus>,
}

impl RetryExecutor {
    /// An executor that fails fast while `connectivity` reports `Offline`.
    pub fn new(connectivity: ConnectivityStatus) -> Self {
        Self {
            connectivity: Some(connectivity),
        }
    }

    /// An executor that always spends the full attempt budget.
    pub fn detached() -> Self {
        Self { connectivity: None }
    }

    fn offline(&self) -> bool {
        self.connectivity
            .as_ref()
            .is_some_and(ConnectivityStatus::is_offline)
    }

    pub async fn execute<T, F, Fut>(&self, policy: &RetryPolicy, op: F) -> TenantryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TenantryResult<T>>,
    {
        self.run(policy, None, op).await
    }

    /// Like [`execute`](Self::execute), also maintaining `failures`.
    pub async fn execute_tracked<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        failures: &FailureCounter,
        op: F,
    ) -> TenantryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TenantryResult<T>>,
    {
        self.run(policy, Some(failures), op).await
    }

    async fn run<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        failures: Option<&FailureCounter>,
        mut op: F,
    ) -> TenantryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TenantryResult<T>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = match tokio::time::timeout(policy.attempt_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(TenantryError::Timeout(policy.attempt_timeout)),
            };

            let err = match outcome {
                Ok(value) => {
                    if let Some(counter) = failures {
                        counter.reset();
                    }
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if let Some(counter) = failures {
                counter.increment();
            }
            if !err.is_transient() {
                return Err(err);
            }

            let offline = self.offline();
            if attempt >= max_attempts || offline {
                warn!(
                    attempts = attempt,
                    offline,
                    error = %err,
                    "Giving up on transient failure"
                );
                return Err(TenantryError::RetriesExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = policy.delay_for_attempt(attempt) + policy.jitter_sample();
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
