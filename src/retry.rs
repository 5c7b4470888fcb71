//! Bounded exponential backoff for collaborator calls.
//!
//! Used by the embedding indexer and by the execution proxy's asset and
//! secrets sub-calls. Only transient errors are retried; once attempts run
//! out the last error surfaces as `upstream_error`.

use crate::types::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Upper bound on the time `with_retry` can take when each attempt is
    /// cut off at `per_attempt`: every attempt plus the longest backoffs.
    pub fn budget(&self, per_attempt: Duration) -> Duration {
        let attempts = self.max_attempts.max(1);
        (1..attempts).fold(per_attempt.saturating_mul(attempts), |total, attempt| {
            let exp = attempt.saturating_sub(1).min(16);
            let base = self
                .initial_backoff
                .saturating_mul(1u32 << exp)
                .min(self.max_backoff);
            let worst = (base + Duration::from_millis(base.as_millis() as u64 / 5))
                .min(self.max_backoff);
            total.saturating_add(worst)
        })
    }

    /// Backoff before retry number `attempt` (1-based), with up to 20% jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);
        let jitter_ms = (base.as_millis() as u64) / 5;
        if jitter_ms == 0 {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0..=jitter_ms);
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                tracing::debug!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) if err.is_transient() => {
                tracing::warn!(what, attempts, error = %err, "giving up after retries");
                return Err(Error::upstream(format!(
                    "{} failed after {} attempts: {}",
                    what, attempts, err
                )));
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_budget_covers_attempts_and_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        };
        // 3 x 1s, then 10ms and 20ms backoffs with 20% jitter each.
        assert_eq!(policy.budget(Duration::from_secs(1)), Duration::from_millis(3036));
        assert_eq!(
            RetryPolicy::none().budget(Duration::from_millis(250)),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn test_backoff_is_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };
        assert!(policy.backoff(1) >= Duration::from_millis(100));
        for attempt in 1..20 {
            assert!(policy.backoff(attempt) <= Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let out = with_retry(&fast(), "flaky", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::upstream("503"))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_upstream_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = with_retry(&fast(), "asset lookup", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::timeout("slow"))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "upstream_error");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let err = with_retry(&fast(), "lookup", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::asset_not_found("db01"))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(err.code(), "asset_not_found");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
