//! Retry and log-throttling helpers shared by the vendor aggregators.

use crate::error::Result;
use log::{debug, warn};
use rand::Rng;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    #[schemars(description = "Retries after the first attempt for 429/5xx/timeouts. 0 disables retrying.")]
    pub max_retries: u32,
    #[schemars(description = "Delay before the first retry in milliseconds; doubles per attempt.")]
    pub base_delay_ms: u64,
    #[schemars(description = "Upper bound for a single backoff delay in milliseconds.")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Exponential backoff for retry `attempt` (0-based) with random jitter
    /// in the upper half of the interval.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16));
        let capped = exponential.min(self.max_delay_ms);
        let half = capped / 2;
        let jitter = if half > 0 {
            rand::thread_rng().gen_range(0..=half)
        } else {
            0
        };
        Duration::from_millis(capped - half + jitter)
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's retry budget is spent.
pub async fn retry_transient<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.delay_for(attempt);
                debug!(
                    "{} failed on attempt {} ({}); retrying in {} ms",
                    operation_name,
                    attempt + 1,
                    e,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(
                        "{} gave up after {} attempts: {}",
                        operation_name,
                        attempt + 1,
                        e
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Emits a warning the first time a key is seen and stays quiet afterwards.
/// One instance is shared by every aggregator of a process; tests build
/// their own.
#[derive(Debug, Default)]
pub struct WarnOnce {
    seen: Mutex<HashSet<String>>,
}

impl WarnOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this call emitted the warning.
    pub fn warn(&self, key: &str, message: &str) -> bool {
        let first = match self.seen.lock() {
            Ok(mut seen) => seen.insert(key.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(key.to_string()),
        };

        if first {
            warn!("{}", message);
        } else {
            debug!("suppressed repeated warning [{}]: {}", key, message);
        }
        first
    }

    pub fn has_warned(&self, key: &str) -> bool {
        match self.seen.lock() {
            Ok(seen) => seen.contains(key),
            Err(poisoned) => poisoned.into_inner().contains(key),
        }
    }

    pub fn reset(&self) {
        match self.seen.lock() {
            Ok(mut seen) => seen.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KpiError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn test_delay_is_bounded() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        for attempt in 0..10 {
            let delay = policy.delay_for(attempt).as_millis() as u64;
            assert!(delay <= 1_000, "attempt {} delay {}", attempt, delay);
        }
        let first = policy.delay_for(0).as_millis() as u64;
        assert!((50..=100).contains(&first));
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_transient(&fast_policy(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(KpiError::from_status("meta", 503, "unavailable"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(&fast_policy(3), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(KpiError::from_status("paypal", 401, "")) }
        })
        .await;

        assert!(result.unwrap_err().is_authorization());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_transient(&fast_policy(2), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(KpiError::from_status("meta", 429, "rate limited")) }
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_warn_once() {
        let latch = WarnOnce::new();
        assert!(latch.warn("meta:auth", "meta credentials rejected"));
        assert!(!latch.warn("meta:auth", "meta credentials rejected"));
        assert!(latch.has_warned("meta:auth"));
        assert!(!latch.has_warned("paypal:auth"));

        latch.reset();
        assert!(latch.warn("meta:auth", "meta credentials rejected"));
    }
}
