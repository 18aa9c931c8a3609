//! Failure classification, retry, and backoff.
//!
//! Every pipeline stage funnels its faults through [`ErrorHandler`]. The
//! handler decides retry-or-not from the error kind and attempt count,
//! sleeps an exponentially growing, capped, fully jittered delay between
//! attempts, and emits one structured record per attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::warn;

use crate::config::RetryConfig;
use crate::models::{ErrorKind, ProcessingError, Stage};

/// Backoff shape: exponential growth from a base, capped, full jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    cap: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(
            cfg.base_delay_duration(),
            cfg.max_delay_duration(),
            cfg.max_attempts,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Apply a per-service attempt ceiling (`upstream.<service>.retries`)
    /// over the global one. `None` keeps the global value.
    pub fn with_attempt_override(mut self, retries: Option<u32>) -> Self {
        if let Some(retries) = retries {
            self.max_attempts = retries.max(1);
        }
        self
    }

    /// Upper bound of the delay for an attempt (1-indexed).
    fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let scaled = self.base.as_millis().saturating_mul(1u128 << exp);
        Duration::from_millis(scaled.min(self.cap.as_millis()) as u64)
    }

    /// Full jitter: uniform in `[0, ceiling]`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt).as_millis() as u64;
        if ceiling == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }

    /// Whether another attempt is allowed after a failure of `kind` on
    /// the given attempt (1-indexed). `UpstreamProtocol` gets exactly one
    /// retry; other transient kinds get the configured ceiling.
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> bool {
        if !kind.is_retryable() {
            return false;
        }
        if kind == ErrorKind::UpstreamProtocol {
            return attempt < 2;
        }
        attempt < self.max_attempts
    }
}

/// Wraps stage operations with classification, retry, and reporting.
pub struct ErrorHandler {
    policy: RetryPolicy,
    /// Every classified failure (one per attempt) is also sent here,
    /// when wired; the Worker forwards them to the Master.
    records: Option<mpsc::UnboundedSender<ProcessingError>>,
}

impl ErrorHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            records: None,
        }
    }

    pub fn with_records(mut self, tx: mpsc::UnboundedSender<ProcessingError>) -> Self {
        self.records = Some(tx);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts the
    /// attempt budget. The operation receives the attempt number
    /// (1-indexed) and returns the classified error on failure; the
    /// error that ends the loop is returned with its final attempt count.
    pub async fn run<T, F, Fut>(&self, stage: Stage, mut op: F) -> Result<T, ProcessingError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        let mut attempt = 1u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(mut error) => {
                    error.stage = stage;
                    error.attempt = attempt;

                    let retrying = self.policy.should_retry(error.kind, attempt);
                    let delay = retrying.then(|| self.policy.backoff_delay(attempt));
                    if let Some(delay) = delay {
                        error = error.with_backoff(delay);
                    }

                    self.report(&error);

                    match delay {
                        Some(delay) => {
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => return Err(error),
                    }
                }
            }
        }
    }

    fn report(&self, error: &ProcessingError) {
        warn!(
            kind = %error.kind,
            stage = ?error.stage,
            attempt = error.attempt,
            retryable = error.retryable,
            file = error.file.as_ref().map(|p| p.display().to_string()),
            cause = %error.cause,
            "pipeline failure"
        );
        if let Some(tx) = &self.records {
            let _ = tx.send(error.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), max_attempts)
    }

    fn transient(cause: &str) -> ProcessingError {
        ProcessingError::new(ErrorKind::UpstreamUnavailable, Stage::Committing, cause)
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let handler = ErrorHandler::new(policy(3));
        let result: Result<i32, _> = handler.run(Stage::Scanning, |_| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_transient_retried_to_success() {
        let handler = ErrorHandler::new(policy(3));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let result = handler
            .run(Stage::Committing, move |_| {
                let calls = calls_in.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(transient("503"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhausted() {
        let handler = ErrorHandler::new(policy(3));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let err = handler
            .run(Stage::Committing, move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(transient("503"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.attempt, 3);
        assert_eq!(err.kind, ErrorKind::UpstreamUnavailable);
    }

    #[tokio::test]
    async fn test_permanent_not_retried() {
        let handler = ErrorHandler::new(policy(5));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let err = handler
            .run(Stage::Parsing, move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ProcessingError::new(
                        ErrorKind::Parse,
                        Stage::Parsing,
                        "bad bytes",
                    ))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.kind, ErrorKind::Parse);
    }

    #[tokio::test]
    async fn test_protocol_error_retried_once() {
        let handler = ErrorHandler::new(policy(10));
        let calls = Arc::new(AtomicU32::new(0));

        let calls_in = calls.clone();
        let err = handler
            .run(Stage::Diffing, move |_| {
                let calls = calls_in.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(ProcessingError::new(
                        ErrorKind::UpstreamProtocol,
                        Stage::Diffing,
                        "garbled reply",
                    ))
                }
            })
            .await
            .unwrap_err();

        // One initial attempt plus exactly one retry.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.attempt, 2);
    }

    #[tokio::test]
    async fn test_one_record_per_attempt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = ErrorHandler::new(policy(3)).with_records(tx);

        let _ = handler
            .run(Stage::Committing, |_| async {
                Err::<(), _>(transient("503"))
            })
            .await;

        let mut attempts = Vec::new();
        while let Ok(record) = rx.try_recv() {
            attempts.push(record.attempt);
        }
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = RetryPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(350),
            10,
        );
        assert_eq!(policy.ceiling(1), Duration::from_millis(100));
        assert_eq!(policy.ceiling(2), Duration::from_millis(200));
        assert_eq!(policy.ceiling(3), Duration::from_millis(350));
        assert_eq!(policy.ceiling(9), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_within_ceiling() {
        let policy = RetryPolicy::new(
            Duration::from_millis(50),
            Duration::from_millis(1000),
            10,
        );
        for attempt in 1..=5 {
            for _ in 0..20 {
                assert!(policy.backoff_delay(attempt) <= policy.ceiling(attempt));
            }
        }
    }
}
