//! Exponential backoff around external calls.
//!
//! [`RetryPolicy::run`] retries `Err` results the classifier marks transient.
//! [`RetryPolicy::run_outcome`] applies the same schedule to outcome values
//! that carry their own failure (see [`AttemptOutcome`]).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tastebase_shared::{Result, RetryConfig, TastebaseError, is_transient_message};
use tracing::warn;

/// Upper bound of the random jitter, as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.3;

/// A call result that reports failure in-band instead of through `Err`.
pub trait AttemptOutcome {
    /// The failure message, or `None` on success.
    fn failure(&self) -> Option<&str>;
}

/// Backoff schedule shared by every retried call site.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// Jittered delay, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self.base_delay_for(attempt);
        let jitter = raw.mul_f64(rand::thread_rng().gen_range(0.0..=JITTER_FRACTION));
        (raw + jitter).min(self.max_delay)
    }

    /// Run `op`, retrying errors for which `classify` returns true.
    ///
    /// `op` receives the 1-based attempt number. Non-retryable errors and the
    /// last attempt's error are returned unchanged.
    pub async fn run<T, F, Fut, C>(&self, label: &str, op: F, classify: C) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&TastebaseError) -> bool,
    {
        self.drive(label, op, |result: &Result<T>| match result {
            Err(e) if classify(e) => Some(e.to_string()),
            _ => None,
        })
        .await
    }

    /// [`run`](Self::run) with the default transient classifier.
    pub async fn run_default<T, F, Fut>(&self, label: &str, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(label, op, TastebaseError::is_transient).await
    }

    /// Run `op`, retrying outcomes whose failure message `classify` accepts.
    pub async fn run_outcome<T, F, Fut, C>(&self, label: &str, op: F, classify: C) -> T
    where
        T: AttemptOutcome,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        C: Fn(&str) -> bool,
    {
        self.drive(label, op, |outcome: &T| {
            outcome
                .failure()
                .filter(|msg| classify(msg))
                .map(str::to_string)
        })
        .await
    }

    /// [`run_outcome`](Self::run_outcome) with the default message classifier.
    pub async fn run_outcome_default<T, F, Fut>(&self, label: &str, op: F) -> T
    where
        T: AttemptOutcome,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
    {
        self.run_outcome(label, op, is_transient_message).await
    }

    async fn drive<T, F, Fut, R>(&self, label: &str, mut op: F, retry_reason: R) -> T
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        R: Fn(&T) -> Option<String>,
    {
        let mut attempt = 1;
        loop {
            let result = op(attempt).await;
            let Some(reason) = retry_reason(&result) else {
                return result;
            };
            if attempt >= self.max_attempts {
                return result;
            }
            let delay = self.delay_for(attempt);
            warn!(
                call = label,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn delays_stay_within_bounds() {
        let p = policy();
        for attempt in 1..=12 {
            for _ in 0..20 {
                let d = p.delay_for(attempt);
                assert!(d >= p.base_delay, "attempt {attempt}: {d:?}");
                assert!(d <= p.max_delay, "attempt {attempt}: {d:?}");
            }
        }
    }

    #[test]
    fn delay_grows_exponentially_then_caps() {
        let p = policy();
        assert_eq!(p.base_delay_for(1), Duration::from_millis(1000));
        assert_eq!(p.base_delay_for(2), Duration::from_millis(2000));
        assert_eq!(p.base_delay_for(3), Duration::from_millis(4000));
        assert_eq!(p.base_delay_for(10), Duration::from_millis(30_000));
        let d = p.delay_for(2);
        assert!(d >= Duration::from_millis(2000) && d <= Duration::from_millis(2600));
    }

    #[tokio::test(start_paused = true)]
    async fn always_failing_op_runs_max_attempts() {
        let p = policy();
        let calls = Arc::new(AtomicU32::new(0));
        let started = tokio::time::Instant::now();

        let counter = calls.clone();
        let result: Result<()> = p
            .run(
                "test",
                move |_| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Err(TastebaseError::Network("boom".into()))
                    }
                },
                |_| true,
            )
            .await;

        assert!(matches!(result, Err(TastebaseError::Network(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two sleeps: ~1s and ~2s, each with up to 30% jitter.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(3000), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(3900), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_error_propagates_unchanged() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = policy()
            .run_default("test", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TastebaseError::validation("bad input"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result.unwrap_err().to_string(),
            "validation error: bad input"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success() {
        let result = policy()
            .run_default("test", |attempt| async move {
                if attempt < 2 {
                    Err(TastebaseError::RateLimited("429".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }

    struct Outcome {
        error: Option<String>,
    }

    impl AttemptOutcome for Outcome {
        fn failure(&self) -> Option<&str> {
            self.error.as_deref()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_variant_shares_schedule() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = policy()
            .run_outcome_default("test", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome {
                        error: Some("503 service unavailable".into()),
                    }
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(outcome.failure().is_some());

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = policy()
            .run_outcome_default("test", move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome {
                        error: Some("no such restaurant".into()),
                    }
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.failure(), Some("no such restaurant"));
    }
}
