//! Runs one step with a per-attempt timeout, bounded retries with jittered
//! exponential backoff, and cooperative cancellation.
//!
//! Timed-out attempts are retried like other transient failures.
//! Cancellation is observed before every attempt and during backoff sleeps.
//! An attempt already in flight runs to completion or to its timeout.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use super::error::{GraphError, StepError};
use super::graph::DependencyGraph;
use super::payload::StepPayload;
use super::traits::{StepContext, StepHandler};
use super::types::*;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts per step, first call included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the computed backoff (0.0-1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if self.jitter <= 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        delay.mul_f64(1.0 + factor).min(self.max_delay)
    }
}

pub struct StepExecutor {
    handlers: HashMap<StepName, Arc<dyn StepHandler>>,
    policy: RetryPolicy,
    step_timeout: Duration,
}

impl StepExecutor {
    /// Every graph step needs exactly one handler.
    pub fn new(
        graph: &DependencyGraph,
        handlers: Vec<Arc<dyn StepHandler>>,
        policy: RetryPolicy,
        step_timeout: Duration,
    ) -> Result<Self, GraphError> {
        let mut map: HashMap<StepName, Arc<dyn StepHandler>> = HashMap::new();
        for handler in handlers {
            let step = handler.step();
            if map.insert(step, handler).is_some() {
                return Err(GraphError::DuplicateHandler(step));
            }
        }
        for step in graph.steps() {
            if !map.contains_key(&step) {
                return Err(GraphError::MissingHandler(step));
            }
        }
        Ok(Self {
            handlers: map,
            policy,
            step_timeout,
        })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn step_timeout(&self) -> Duration {
        self.step_timeout
    }

    /// Run `step` to a terminal [`StepResult`]. Never panics, never errors.
    pub async fn execute(
        &self,
        step: StepName,
        ctx: StepContext,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started = Instant::now();
        let finish = |outcome: StepOutcome, attempts: u32| StepResult {
            step,
            outcome,
            duration: started.elapsed(),
            retries: attempts.saturating_sub(1),
        };

        let Some(handler) = self.handlers.get(&step).cloned() else {
            return finish(failure(FailureKind::Internal, "no handler registered"), 0);
        };

        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            if cancel.is_cancelled() {
                tracing::debug!(step = %step, attempt, "Step cancelled before attempt");
                return finish(StepOutcome::Cancelled, attempt);
            }
            attempt += 1;

            let mut attempt_ctx = ctx.clone();
            attempt_ctx.attempt = attempt;

            let (kind, message) = match self.run_attempt(handler.as_ref(), &attempt_ctx).await {
                AttemptResult::Ok(payload) if payload.step() == step => {
                    tracing::debug!(step = %step, attempt, "Step succeeded");
                    return finish(StepOutcome::Success(payload), attempt);
                }
                AttemptResult::Ok(payload) => {
                    let message = format!("handler returned a {} payload", payload.step());
                    return finish(failure(FailureKind::Internal, message), attempt);
                }
                AttemptResult::Panicked(message) => {
                    tracing::error!(step = %step, attempt, panic = %message, "Step panicked");
                    return finish(failure(FailureKind::Internal, message), attempt);
                }
                AttemptResult::TimedOut => {
                    tracing::warn!(
                        step = %step,
                        attempt,
                        timeout_secs = self.step_timeout.as_secs_f64(),
                        "Step attempt timed out"
                    );
                    (FailureKind::Timeout, format!("step exceeded {:?}", self.step_timeout))
                }
                AttemptResult::Err(e) if !e.is_transient() => {
                    tracing::warn!(step = %step, attempt, error = %e, "Step failed validation");
                    return finish(failure(FailureKind::Validation, e.to_string()), attempt);
                }
                AttemptResult::Err(e) => (FailureKind::Transient, e.to_string()),
            };

            // Timeouts retry like any transient error; the last attempt's
            // class is what the step reports.
            if attempt >= max_attempts {
                tracing::warn!(step = %step, attempt, error = %message, "Step retries exhausted");
                return finish(failure(kind, message), attempt);
            }

            let delay = self.policy.jittered(attempt);
            tracing::info!(
                step = %step,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "Step attempt failed, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(step = %step, attempt, "Step cancelled during backoff");
                    return finish(StepOutcome::Cancelled, attempt);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_attempt(&self, handler: &dyn StepHandler, ctx: &StepContext) -> AttemptResult {
        let guarded = AssertUnwindSafe(handler.run(ctx)).catch_unwind();
        match tokio::time::timeout(self.step_timeout, guarded).await {
            Err(_) => AttemptResult::TimedOut,
            Ok(Err(panic)) => AttemptResult::Panicked(panic_message(&*panic)),
            Ok(Ok(Ok(payload))) => AttemptResult::Ok(payload),
            Ok(Ok(Err(e))) => AttemptResult::Err(e),
        }
    }
}

enum AttemptResult {
    Ok(StepPayload),
    Err(StepError),
    TimedOut,
    Panicked(String),
}

fn failure(kind: FailureKind, message: impl Into<String>) -> StepOutcome {
    StepOutcome::Failed(StepFailure {
        kind,
        message: message.into(),
    })
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: unknown payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::analysis::payload::PriorResults;
    use crate::pipeline::analysis::subjects::sample_subject;
    use crate::pipeline::analysis::testing::*;
    use crate::pipeline::reasoning::ReasoningError;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: 0.0,
        }
    }

    fn ctx() -> StepContext {
        StepContext {
            run_id: "run-1".into(),
            subject: Arc::new(sample_subject("p1")),
            request: Arc::new(RunRequest::new("p1")),
            prior: PriorResults::default(),
            attempt: 0,
        }
    }

    fn executor_with(handler: Arc<ScriptedHandler>, policy: RetryPolicy, timeout: Duration) -> StepExecutor {
        let graph = DependencyGraph::standard().unwrap();
        StepExecutor::new(&graph, handlers_with(vec![handler]), policy, timeout).unwrap()
    }

    fn transient() -> StepError {
        StepError::Reasoning(ReasoningError::Upstream {
            status: 503,
            body: "overloaded".into(),
        })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: 0.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter: 0.5,
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.jittered(1);
            assert!(d >= policy.backoff(1) && d <= policy.max_delay);
        }
    }

    #[test]
    fn missing_handler_is_config_error() {
        let graph = DependencyGraph::standard().unwrap();
        let handlers: Vec<Arc<dyn StepHandler>> =
            vec![Arc::new(ScriptedHandler::succeeding(StepName::MedicalHistory))];
        let err = StepExecutor::new(&graph, handlers, fast_policy(3), Duration::from_secs(1))
            .err()
            .unwrap();
        assert_eq!(err, GraphError::MissingHandler(StepName::Genomics));
    }

    #[test]
    fn duplicate_handler_is_config_error() {
        let graph = DependencyGraph::standard().unwrap();
        let mut handlers = handlers_with(vec![]);
        handlers.push(Arc::new(ScriptedHandler::succeeding(StepName::Evidence)));
        let err = StepExecutor::new(&graph, handlers, fast_policy(3), Duration::from_secs(1))
            .err()
            .unwrap();
        assert_eq!(err, GraphError::DuplicateHandler(StepName::Evidence));
    }

    #[tokio::test]
    async fn success_first_try() {
        let handler = Arc::new(ScriptedHandler::succeeding(StepName::Genomics));
        let exec = executor_with(handler.clone(), fast_policy(3), Duration::from_secs(1));
        let result = exec
            .execute(StepName::Genomics, ctx(), &CancellationToken::new())
            .await;
        assert!(result.is_success());
        assert_eq!(result.retries, 0);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn transient_error_retried_then_succeeds() {
        let handler = Arc::new(
            ScriptedHandler::succeeding(StepName::Genomics)
                .then(Behavior::Fail(transient()))
                .then(Behavior::Fail(StepError::Reasoning(ReasoningError::RateLimited))),
        );
        let exec = executor_with(handler.clone(), fast_policy(3), Duration::from_secs(1));
        let result = exec
            .execute(StepName::Genomics, ctx(), &CancellationToken::new())
            .await;
        assert!(result.is_success());
        assert_eq!(result.retries, 2);
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn retries_exhausted_is_transient_failure() {
        let handler = Arc::new(ScriptedHandler::new(
            StepName::Genomics,
            Behavior::Fail(transient()),
        ));
        let exec = executor_with(handler.clone(), fast_policy(3), Duration::from_secs(1));
        let result = exec
            .execute(StepName::Genomics, ctx(), &CancellationToken::new())
            .await;
        match result.outcome {
            StepOutcome::Failed(f) => {
                assert_eq!(f.kind, FailureKind::Transient);
                assert!(f.message.contains("503"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(result.retries, 2);
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn validation_error_not_retried() {
        let handler = Arc::new(ScriptedHandler::new(
            StepName::Treatment,
            Behavior::Fail(StepError::MissingPriorResult(StepName::Genomics)),
        ));
        let exec = executor_with(handler.clone(), fast_policy(3), Duration::from_secs(1));
        let result = exec
            .execute(StepName::Treatment, ctx(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result.outcome,
            StepOutcome::Failed(StepFailure { kind: FailureKind::Validation, .. })
        ));
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn timed_out_attempt_is_retried() {
        let handler = Arc::new(
            ScriptedHandler::succeeding(StepName::Genomics)
                .then(Behavior::Delay(Duration::from_secs(5))),
        );
        let exec = executor_with(handler.clone(), fast_policy(3), Duration::from_millis(50));
        let result = exec
            .execute(StepName::Genomics, ctx(), &CancellationToken::new())
            .await;
        assert!(result.is_success(), "{:?}", result.outcome);
        assert_eq!(result.retries, 1);
        assert_eq!(handler.calls(), 2);
        assert!(result.duration < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn timeouts_exhaust_retries() {
        let handler = Arc::new(ScriptedHandler::new(
            StepName::Evidence,
            Behavior::Delay(Duration::from_secs(5)),
        ));
        let exec = executor_with(handler.clone(), fast_policy(3), Duration::from_millis(30));
        let result = exec
            .execute(StepName::Evidence, ctx(), &CancellationToken::new())
            .await;
        match result.outcome {
            StepOutcome::Failed(f) => {
                assert_eq!(f.kind, FailureKind::Timeout);
                assert!(f.message.contains("step exceeded"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(result.duration < Duration::from_secs(2));
        assert_eq!(result.retries, 2);
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn timeout_after_transient_reports_timeout() {
        let handler = Arc::new(
            ScriptedHandler::new(StepName::Genomics, Behavior::Delay(Duration::from_secs(5)))
                .then(Behavior::Fail(transient())),
        );
        let exec = executor_with(handler.clone(), fast_policy(2), Duration::from_millis(30));
        let result = exec
            .execute(StepName::Genomics, ctx(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result.outcome,
            StepOutcome::Failed(StepFailure { kind: FailureKind::Timeout, .. })
        ));
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn panic_becomes_internal_failure() {
        let handler = Arc::new(ScriptedHandler::new(StepName::Genomics, Behavior::Panic));
        let exec = executor_with(handler, fast_policy(3), Duration::from_secs(1));
        let result = exec
            .execute(StepName::Genomics, ctx(), &CancellationToken::new())
            .await;
        match result.outcome {
            StepOutcome::Failed(f) => {
                assert_eq!(f.kind, FailureKind::Internal);
                assert!(f.message.contains("scripted panic"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn wrong_payload_is_internal_failure() {
        let handler = Arc::new(ScriptedHandler::new(StepName::Genomics, Behavior::WrongPayload));
        let exec = executor_with(handler, fast_policy(3), Duration::from_secs(1));
        let result = exec
            .execute(StepName::Genomics, ctx(), &CancellationToken::new())
            .await;
        assert!(matches!(
            result.outcome,
            StepOutcome::Failed(StepFailure { kind: FailureKind::Internal, .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_before_entry() {
        let handler = Arc::new(ScriptedHandler::succeeding(StepName::Genomics));
        let exec = executor_with(handler.clone(), fast_policy(3), Duration::from_secs(1));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = exec.execute(StepName::Genomics, ctx(), &cancel).await;
        assert_eq!(result.outcome, StepOutcome::Cancelled);
        assert_eq!(handler.calls(), 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_backoff() {
        let handler = Arc::new(ScriptedHandler::new(
            StepName::Genomics,
            Behavior::Fail(transient()),
        ));
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        let exec = Arc::new(executor_with(handler.clone(), policy, Duration::from_secs(1)));
        let cancel = CancellationToken::new();

        let task = {
            let exec = exec.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { exec.execute(StepName::Genomics, ctx(), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("cancel should end the backoff")
            .unwrap();
        assert_eq!(result.outcome, StepOutcome::Cancelled);
        assert_eq!(handler.calls(), 1);
    }
}
