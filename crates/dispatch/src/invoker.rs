//! Retrying invocation wrapper
//!
//! Runs one operation up to `max_retries + 1` times. Each failed attempt is
//! handled by class:
//! - rate-limit error: rotate the credential once per invocation and retry
//!   immediately; later rate-limit errors wait `initial_delay * 2^attempt`
//! - any other error: returned at once, never retried, never rotates
//! - unacceptable (empty) value: rotate if not yet rotated, wait
//!   `min(initial_delay * 1.5^attempt, empty_backoff_cap)`, retry
//!
//! If attempts run out on an empty value, that value is returned as
//! `RetryOutcome::ToleratedEmpty` instead of an error. Generative services
//! return blank answers often enough that one must not sink a large batch.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use completion::{
    CredentialRotator, ErrorClassification, RotationReason, classify_message, is_acceptable_text,
};
use serde::Deserialize;
use tracing::{debug, warn};

/// Growth factor for rate-limit backoff.
const RATE_LIMIT_MULTIPLIER: f64 = 2.0;

/// Growth factor for empty-result backoff.
const EMPTY_RESULT_MULTIPLIER: f64 = 1.5;

/// Retry limits and delays.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    /// Upper bound on the empty-result backoff
    pub empty_backoff_cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 2000,
            empty_backoff_cap_ms: 5000,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_empty_backoff_cap(mut self, cap: Duration) -> Self {
        self.empty_backoff_cap_ms = cap.as_millis() as u64;
        self
    }

    /// Delay before retrying a rate-limited attempt (0-indexed).
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let ms = self.initial_delay_ms as f64 * RATE_LIMIT_MULTIPLIER.powi(attempt as i32);
        Duration::from_millis(ms as u64)
    }

    /// Delay before retrying an empty result (0-indexed), capped.
    pub fn empty_result_delay(&self, attempt: u32) -> Duration {
        let ms = self.initial_delay_ms as f64 * EMPTY_RESULT_MULTIPLIER.powi(attempt as i32);
        let ms = ms.min(self.empty_backoff_cap_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// How an invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T, E> {
    /// An acceptable value
    Success(T),
    /// Retries exhausted and the last attempt returned an unacceptable value.
    /// The value is handed back as a degraded success; callers decide
    /// whether an empty answer is usable.
    ToleratedEmpty(T),
    /// A fatal error, or a rate-limit error on the last attempt
    Failure(E),
}

impl<T, E> RetryOutcome<T, E> {
    /// Collapse to a `Result`, treating tolerated-empty values as `Ok`.
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryOutcome::Success(v) | RetryOutcome::ToleratedEmpty(v) => Ok(v),
            RetryOutcome::Failure(e) => Err(e),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success(_))
    }

    pub fn is_tolerated_empty(&self) -> bool {
        matches!(self, RetryOutcome::ToleratedEmpty(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            RetryOutcome::Success(_) => "success",
            RetryOutcome::ToleratedEmpty(_) => "tolerated_empty",
            RetryOutcome::Failure(_) => "failure",
        }
    }
}

/// Per-invocation bookkeeping. Never shared between invocations.
#[derive(Debug, Default)]
struct RetryState {
    attempt: u32,
    rotated: bool,
}

/// Runs operations with classification-driven retry and at most one
/// credential rotation per invocation.
#[derive(Clone, Default)]
pub struct RetryingInvoker {
    policy: RetryPolicy,
    rotator: Option<Arc<dyn CredentialRotator>>,
}

impl RetryingInvoker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            rotator: None,
        }
    }

    /// Inject the capability used to switch credentials.
    pub fn with_rotator(mut self, rotator: Arc<dyn CredentialRotator>) -> Self {
        self.rotator = Some(rotator);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Invoke a text-producing operation; blank text is unacceptable.
    pub async fn invoke<T, E, F, Fut>(&self, operation: F) -> RetryOutcome<T, E>
    where
        T: AsRef<str>,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.invoke_with(operation, |value: &T| is_acceptable_text(value.as_ref()))
            .await
    }

    /// Invoke an operation judged by a caller-supplied acceptability check.
    pub async fn invoke_with<T, E, F, Fut, A>(
        &self,
        mut operation: F,
        is_acceptable: A,
    ) -> RetryOutcome<T, E>
    where
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        A: Fn(&T) -> bool,
    {
        let mut state = RetryState::default();
        let max_retries = self.policy.max_retries;

        let outcome = loop {
            let attempt = state.attempt;
            let attempts_remain = attempt < max_retries;

            match operation().await {
                Ok(value) if is_acceptable(&value) => break RetryOutcome::Success(value),
                Ok(value) => {
                    if !attempts_remain {
                        warn!(
                            attempts = attempt + 1,
                            "result still empty after all retries, returning it as degraded success"
                        );
                        break RetryOutcome::ToleratedEmpty(value);
                    }
                    self.rotate_once(&mut state, RotationReason::EmptyResult)
                        .await;
                    let delay = self.policy.empty_result_delay(attempt);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "empty result, retrying"
                    );
                    crate::metrics::record_retry(RotationReason::EmptyResult.label());
                    tokio::time::sleep(delay).await;
                }
                Err(err) => match classify_message(&err.to_string()) {
                    class @ ErrorClassification::Fatal => {
                        warn!(
                            attempt,
                            classification = class.label(),
                            error = %err,
                            "non-retryable error"
                        );
                        break RetryOutcome::Failure(err);
                    }
                    class @ ErrorClassification::RateLimited if !attempts_remain => {
                        warn!(
                            attempts = attempt + 1,
                            classification = class.label(),
                            error = %err,
                            "rate limited after all retries"
                        );
                        break RetryOutcome::Failure(err);
                    }
                    ErrorClassification::RateLimited => {
                        crate::metrics::record_retry(RotationReason::RateLimited.label());
                        if self
                            .rotate_once(&mut state, RotationReason::RateLimited)
                            .await
                        {
                            debug!(attempt, error = %err, "rate limited, rotated credential, retrying now");
                        } else {
                            let delay = self.policy.rate_limit_delay(attempt);
                            debug!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "rate limited, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                },
            }

            state.attempt += 1;
        };

        crate::metrics::record_invocation(outcome.label());
        outcome
    }

    /// Rotate unless this invocation already has. Returns whether it rotated.
    async fn rotate_once(&self, state: &mut RetryState, reason: RotationReason) -> bool {
        if state.rotated {
            return false;
        }
        let Some(rotator) = &self.rotator else {
            return false;
        };
        rotator.rotate(reason).await;
        state.rotated = true;
        debug!(reason = reason.label(), "requested credential rotation");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    /// Rotator that records each rotation reason.
    #[derive(Default)]
    struct RecordingRotator {
        reasons: Mutex<Vec<RotationReason>>,
    }

    impl RecordingRotator {
        fn count(&self) -> usize {
            self.reasons.lock().unwrap().len()
        }
    }

    impl CredentialRotator for RecordingRotator {
        fn rotate(&self, reason: RotationReason) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.reasons.lock().unwrap().push(reason);
            Box::pin(async {})
        }
    }

    /// Operation that replays a fixed script of results, then repeats the last.
    fn scripted(
        script: Vec<Result<&'static str, &'static str>>,
    ) -> (Arc<AtomicUsize>, impl FnMut() -> std::future::Ready<Result<String, String>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut script: VecDeque<_> = script.into();
        let mut last = None;
        let op = move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let next = script.pop_front().or(last).expect("script must not be empty");
            last = Some(next);
            std::future::ready(next.map(String::from).map_err(String::from))
        };
        (calls, op)
    }

    fn invoker(rotator: &Arc<RecordingRotator>) -> RetryingInvoker {
        RetryingInvoker::new(RetryPolicy::default()).with_rotator(rotator.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt() {
        let rotator = Arc::new(RecordingRotator::default());
        let (calls, op) = scripted(vec![Ok("a cat")]);

        let outcome = invoker(&rotator).invoke(op).await;
        assert_eq!(outcome, RetryOutcome::Success("a cat".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rotator.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_once_rotates_and_retries_without_delay() {
        let rotator = Arc::new(RecordingRotator::default());
        let (calls, op) = scripted(vec![Err("upstream returned 429: slow down"), Ok("done")]);

        let start = Instant::now();
        let outcome = invoker(&rotator).invoke(op).await;

        assert_eq!(outcome, RetryOutcome::Success("done".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*rotator.reasons.lock().unwrap(), vec![RotationReason::RateLimited]);
        assert_eq!(start.elapsed(), Duration::ZERO, "retry after rotation must not wait");
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_rate_limits_rotate_once_then_back_off() {
        let rotator = Arc::new(RecordingRotator::default());
        let (calls, op) = scripted(vec![
            Err("quota exceeded"),
            Err("quota exceeded"),
            Err("quota exceeded"),
            Ok("finally"),
        ]);

        let start = Instant::now();
        let outcome = invoker(&rotator).invoke(op).await;

        assert_eq!(outcome, RetryOutcome::Success("finally".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(rotator.count(), 1);
        // attempt 0 rotated (no wait), attempt 1 waits 2000*2, attempt 2 waits 2000*4
        assert_eq!(start.elapsed(), Duration::from_millis(4000 + 8000));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_on_every_attempt_fails_with_last_error() {
        let rotator = Arc::new(RecordingRotator::default());
        let (calls, op) = scripted(vec![Err("429 too many requests")]);

        let outcome = invoker(&rotator).invoke(op).await;

        assert_eq!(
            outcome,
            RetryOutcome::Failure("429 too many requests".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(rotator.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn always_empty_returns_empty_and_rotates_once() {
        let rotator = Arc::new(RecordingRotator::default());
        let (calls, op) = scripted(vec![Ok("")]);

        let outcome = invoker(&rotator).invoke(op).await;

        assert_eq!(outcome, RetryOutcome::ToleratedEmpty(String::new()));
        assert!(outcome.clone().into_result().is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(*rotator.reasons.lock().unwrap(), vec![RotationReason::EmptyResult]);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_results_use_capped_gentle_backoff() {
        let rotator = Arc::new(RecordingRotator::default());
        let (_calls, op) = scripted(vec![Ok("  ")]);

        let start = Instant::now();
        let outcome = invoker(&rotator).invoke(op).await;

        assert!(outcome.is_tolerated_empty());
        // 2000, 3000, then min(4500, 5000)
        assert_eq!(start.elapsed(), Duration::from_millis(2000 + 3000 + 4500));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_propagates_immediately_without_rotation() {
        let rotator = Arc::new(RecordingRotator::default());
        let (calls, op) = scripted(vec![Err("invalid request: unknown model"), Ok("never")]);

        let start = Instant::now();
        let outcome = invoker(&rotator).invoke(op).await;

        assert_eq!(
            outcome,
            RetryOutcome::Failure("invalid request: unknown model".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rotator.count(), 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_then_rate_limit_shares_single_rotation() {
        let rotator = Arc::new(RecordingRotator::default());
        let (calls, op) = scripted(vec![Ok(""), Err("rate limit"), Ok("ok")]);

        let start = Instant::now();
        let outcome = invoker(&rotator).invoke(op).await;

        assert_eq!(outcome, RetryOutcome::Success("ok".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(*rotator.reasons.lock().unwrap(), vec![RotationReason::EmptyResult]);
        // empty wait 2000, then rate-limit backoff at attempt 1: 4000
        assert_eq!(start.elapsed(), Duration::from_millis(2000 + 4000));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_then_final_rate_limit_is_failure() {
        let rotator = Arc::new(RecordingRotator::default());
        let (_calls, op) = scripted(vec![Ok(""), Ok(""), Ok(""), Err("quota")]);

        let outcome = invoker(&rotator).invoke(op).await;
        assert_eq!(outcome, RetryOutcome::Failure("quota".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn without_rotator_rate_limit_backs_off() {
        let (calls, op) = scripted(vec![Err("429"), Ok("done")]);

        let start = Instant::now();
        let outcome = RetryingInvoker::new(RetryPolicy::default()).invoke(op).await;

        assert!(outcome.is_success());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_retries_makes_a_single_attempt() {
        let rotator = Arc::new(RecordingRotator::default());
        let (calls, op) = scripted(vec![Ok("")]);

        let outcome = RetryingInvoker::new(RetryPolicy::default().with_max_retries(0))
            .with_rotator(rotator.clone())
            .invoke(op)
            .await;

        assert!(outcome.is_tolerated_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(rotator.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_acceptability_predicate() {
        let rotator = Arc::new(RecordingRotator::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<usize, String>(n))
        };

        let outcome = invoker(&rotator).invoke_with(op, |n: &usize| *n >= 2).await;

        assert_eq!(outcome, RetryOutcome::Success(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(rotator.count(), 1);
    }

    #[test]
    fn policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_delay(0), Duration::from_millis(2000));
        assert_eq!(policy.rate_limit_delay(3), Duration::from_millis(16000));
        assert_eq!(policy.empty_result_delay(0), Duration::from_millis(2000));
        assert_eq!(policy.empty_result_delay(1), Duration::from_millis(3000));
        assert_eq!(policy.empty_result_delay(5), Duration::from_millis(5000));
    }

    #[test]
    fn policy_builders() {
        let policy = RetryPolicy::default()
            .with_max_retries(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_empty_backoff_cap(Duration::from_millis(250));
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.empty_result_delay(4), Duration::from_millis(250));
        assert_eq!(policy.rate_limit_delay(1), Duration::from_millis(200));
    }

    #[test]
    fn outcome_into_result() {
        let ok: RetryOutcome<&str, &str> = RetryOutcome::ToleratedEmpty("");
        assert_eq!(ok.into_result(), Ok(""));
        let err: RetryOutcome<&str, &str> = RetryOutcome::Failure("boom");
        assert_eq!(err.into_result(), Err("boom"));
    }
}
