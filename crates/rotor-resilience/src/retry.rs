//! Exponential backoff with jitter and a classifiable retry predicate.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use rotor_config::RetryConfig;
use rotor_core::RotorError;
use tracing::{debug, warn};

type RetryPredicate = Arc<dyn Fn(&anyhow::Error, u32) -> bool + Send + Sync>;
type RetryObserver = Arc<dyn Fn(&anyhow::Error, u32, Duration) + Send + Sync>;

/// Every [`RotorError`] in an error chain, outermost first. A `RotorError`
/// attached as context is only visible through `anyhow::Error::downcast_ref`.
fn rotor_errors(err: &anyhow::Error) -> impl Iterator<Item = &RotorError> {
    err.downcast_ref::<RotorError>()
        .into_iter()
        .chain(err.chain().filter_map(|e| e.downcast_ref::<RotorError>()))
}

/// Find the classified [`RotorError`] anywhere in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&RotorError> {
    rotor_errors(err).next()
}

/// First [`RotorError`] in the chain matching `pred`. Unlike [`classify`]
/// this looks past wrapping errors such as `AllProvidersFailed`.
pub fn find_cause(
    err: &anyhow::Error,
    pred: impl Fn(&RotorError) -> bool,
) -> Option<&RotorError> {
    rotor_errors(err).find(|&e| pred(e))
}

/// Timeouts and configuration errors are surfaced immediately; everything
/// else is worth another attempt.
fn default_should_retry(err: &anyhow::Error, _attempt: u32) -> bool {
    !matches!(
        classify(err),
        Some(RotorError::Timeout { .. } | RotorError::InvalidConfig(_))
    )
}

#[derive(Clone)]
pub struct RetryManager {
    label: String,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    should_retry: RetryPredicate,
    on_retry: Option<RetryObserver>,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("label", &self.label)
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryManager {
    pub fn new(label: impl Into<String>, config: &RetryConfig) -> Self {
        Self {
            label: label.into(),
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter.clamp(0.0, 1.0),
            should_retry: Arc::new(default_should_retry),
            on_retry: None,
        }
    }

    /// Replace the retry predicate. It receives the error and the 1-based
    /// attempt that just failed.
    pub fn with_predicate<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&anyhow::Error, u32) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Arc::new(predicate);
        self
    }

    /// Observe each retry before its delay: `(error, failed_attempt, delay)`.
    pub fn on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(&anyhow::Error, u32, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `min(base * 2^(attempt-1) + rand(0, jitter * base), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let backoff = base_ms * 2f64.powi(exponent);
        let spread = self.jitter * base_ms;
        let jitter = if spread > 0.0 {
            rand::thread_rng().gen_range(0.0..=spread)
        } else {
            0.0
        };
        let capped = (backoff + jitter).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Run `task` until it succeeds, the predicate declines, or attempts run
    /// out. The task receives the 1-based attempt number. Returns the last
    /// error on failure.
    pub async fn execute<F, Fut, T>(&self, mut task: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match task(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(label = %self.label, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if attempt >= self.max_attempts {
                        warn!(
                            label = %self.label,
                            attempts = attempt,
                            error = %err,
                            "Retry attempts exhausted"
                        );
                        return Err(err);
                    }
                    if !(self.should_retry)(&err, attempt) {
                        debug!(label = %self.label, attempt, error = %err, "Error not retryable");
                        return Err(err);
                    }
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        label = %self.label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    if let Some(observer) = &self.on_retry {
                        observer(&err, attempt, delay);
                    }
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn config(max_attempts: u32, base_ms: u64, max_ms: u64, jitter: f64) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: base_ms,
            max_delay_ms: max_ms,
            jitter,
        }
    }

    #[test]
    fn test_delay_doubles_without_jitter() {
        let retry = RetryManager::new("t", &config(5, 100, 10_000, 0.0));
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(retry.delay_for_attempt(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let retry = RetryManager::new("t", &config(50, 1_000, 5_000, 1.0));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_millis(5_000));
        assert_eq!(retry.delay_for_attempt(40), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_within_base_fraction() {
        let retry = RetryManager::new("t", &config(5, 1_000, 60_000, 0.3));
        for _ in 0..200 {
            let delay = retry.delay_for_attempt(2).as_millis();
            assert!((2_000..=2_300).contains(&delay), "delay {delay} out of range");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_retries_until_success() {
        let calls = AtomicU32::new(0);
        let retry = RetryManager::new("t", &config(3, 10, 100, 0.0));
        let result = retry
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        anyhow::bail!("flaky");
                    }
                    Ok(attempt)
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_returns_last_error() {
        let retry = RetryManager::new("t", &config(2, 10, 100, 0.0));
        let err = retry
            .execute(|attempt| async move { Err::<(), _>(anyhow::anyhow!("fail #{attempt}")) })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "fail #2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_stops_retrying() {
        let calls = AtomicU32::new(0);
        let retry = RetryManager::new("t", &config(5, 10, 100, 0.0)).with_predicate(|err, _| {
            classify(err).is_some_and(RotorError::is_exhausted)
        });
        let err = retry
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("not classified")) }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.to_string(), "not classified");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_not_retried_by_default() {
        let calls = AtomicU32::new(0);
        let retry = RetryManager::new("t", &config(5, 10, 100, 0.0));
        let err = retry
            .execute(|_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(RotorError::timeout("ping", Duration::from_secs(1)).into())
                }
            })
            .await
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(classify(&err), Some(RotorError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_on_retry_observes_attempts_and_delays() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let retry = RetryManager::new("t", &config(3, 50, 1_000, 0.0))
            .on_retry(move |_, attempt, delay| sink.lock().unwrap().push((attempt, delay)));
        let _ = retry
            .execute(|_| async { Err::<(), _>(anyhow::anyhow!("boom")) })
            .await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (1, Duration::from_millis(50)),
                (2, Duration::from_millis(100))
            ]
        );
    }

    #[test]
    fn test_classify_through_context() {
        let err = anyhow::Error::from(RotorError::KeysExhausted {
            pool: "p".into(),
            wait_ms: None,
        })
        .context("selecting key");
        assert!(classify(&err).is_some_and(RotorError::is_exhausted));
    }

    #[test]
    fn test_find_cause_looks_past_outer_error() {
        let err = anyhow::Error::from(RotorError::RateLimited {
            source_name: "vision".into(),
            message: "429".into(),
            retry_after_ms: Some(2_000),
        })
        .context(RotorError::AllProvidersFailed {
            attempted: 1,
            last_error: "vision: 429".into(),
        });
        assert!(matches!(
            classify(&err),
            Some(RotorError::AllProvidersFailed { .. })
        ));
        assert!(matches!(
            find_cause(&err, RotorError::is_rate_limited),
            Some(RotorError::RateLimited {
                retry_after_ms: Some(2_000),
                ..
            })
        ));
        assert!(find_cause(&err, RotorError::is_exhausted).is_none());
    }
}
