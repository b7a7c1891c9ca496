//! Generic transactional step engine.
//!
//! A [`Workflow`] runs an ordered list of [`Step`]s against one storage
//! session. Every attempt of a step is bracketed by a savepoint, so a failed
//! attempt leaves no partial writes behind and can be retried inside the same
//! transaction. The run commits only after every step (and, in
//! [`FinalizerMode::Transactional`], the finalizer) has succeeded.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::FutureExt;
use store::{StoreError, TransactionProvider};
use thiserror::Error;

use crate::error::StepError;

/// Classifies a step error as retryable or terminal.
pub trait StepFailure: std::error::Error + From<StoreError> + Send + Sync + 'static {
    /// Returns true if running the step again may succeed.
    fn is_retryable(&self) -> bool;

    /// Builds the error reported when an attempt exceeds the step deadline.
    fn timed_out(step: &'static str, limit: Duration) -> Self;
}

/// One unit of work of a workflow.
///
/// A step receives the context produced by the previous step and returns the
/// context for the next one. It may be run several times within one
/// transaction; the writes of a failed attempt are rolled back before the
/// next attempt starts.
#[async_trait]
pub trait Step<C, S, E>: Send + Sync
where
    C: Send + 'static,
    S: Send,
    E: Send,
{
    /// Name used in logs, metrics and errors.
    fn name(&self) -> &'static str;

    async fn execute(&self, context: C, session: &mut S) -> Result<C, E>;
}

/// Hook run once after every step of a run has succeeded.
///
/// The session is `Some` in [`FinalizerMode::Transactional`] and `None` when
/// the finalizer runs after commit.
#[async_trait]
pub trait Finalizer<C, S, E>: Send + Sync
where
    C: Send + Sync + 'static,
    S: Send,
    E: Send,
{
    async fn finalize(&self, context: &C, session: Option<&mut S>) -> Result<(), E>;
}

/// When the finalizer runs relative to commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalizerMode {
    /// Before commit, inside the transaction. A finalizer failure aborts the run.
    #[default]
    Transactional,
    /// After commit, outside the transaction. Failures are logged only.
    AfterCommit,
}

/// Bounded per-step retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    step_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Retries up to `max_attempts` times without waiting in between.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            step_timeout: None,
        }
    }

    /// Doubles the delay after every failed attempt, capped at `max_backoff`.
    pub fn exponential(
        max_attempts: u32,
        initial_backoff: Duration,
        max_backoff: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: max_backoff.max(initial_backoff),
            step_timeout: None,
        }
    }

    /// Sets the deadline of a single attempt. An attempt that runs longer
    /// counts as a retryable failure.
    pub fn with_step_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.step_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout
    }

    /// Returns the delay before the attempt following `failed_attempt`.
    pub fn backoff(&self, failed_attempt: u32) -> Duration {
        if self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(failed_attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * 2f64.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(50), Duration::from_secs(2))
            .with_step_timeout(Some(Duration::from_secs(10)))
    }
}

/// Why a workflow run failed. No write of a failed run is committed.
#[derive(Debug, Error)]
pub enum WorkflowError<E = StepError> {
    /// A step failed terminally or exhausted its attempts.
    #[error("Step {index} ({step}) failed after {attempts} attempt(s): {source}")]
    StepFailed {
        /// 1-based position of the step in the workflow.
        index: usize,
        step: &'static str,
        attempts: u32,
        #[source]
        source: E,
    },

    #[error("Finalizer failed: {0}")]
    FinalizerFailed(#[source] E),

    /// A step or the finalizer panicked.
    #[error("{step} panicked: {message}")]
    Panicked { step: &'static str, message: String },

    #[error("Failed to open session: {0}")]
    Begin(#[source] StoreError),

    #[error("Failed to commit: {0}")]
    Commit(#[source] StoreError),
}

impl<E: StepFailure> WorkflowError<E> {
    /// Returns the error raised by a step or the finalizer, if any.
    pub fn step_error(&self) -> Option<&E> {
        match self {
            WorkflowError::StepFailed { source, .. } => Some(source),
            WorkflowError::FinalizerFailed(source) => Some(source),
            _ => None,
        }
    }

    /// Returns true if running the whole workflow again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::StepFailed { source, .. } => source.is_retryable(),
            WorkflowError::FinalizerFailed(source) => source.is_retryable(),
            WorkflowError::Panicked { .. } => false,
            WorkflowError::Begin(e) | WorkflowError::Commit(e) => e.is_retryable(),
        }
    }
}

type BoxedStep<P, C, E> = Box<dyn Step<C, <P as TransactionProvider>::Session, E>>;
type BoxedFinalizer<P, C, E> = Box<dyn Finalizer<C, <P as TransactionProvider>::Session, E>>;

/// Builds an immutable [`Workflow`].
pub struct WorkflowBuilder<P: TransactionProvider, C, E> {
    name: &'static str,
    provider: P,
    policy: RetryPolicy,
    mode: FinalizerMode,
    steps: Vec<BoxedStep<P, C, E>>,
    finalizer: Option<BoxedFinalizer<P, C, E>>,
}

impl<P, C, E> WorkflowBuilder<P, C, E>
where
    P: TransactionProvider,
    C: Clone + Send + Sync + 'static,
    E: StepFailure,
{
    /// Appends a step. Steps run in the order they are added.
    pub fn step(mut self, step: impl Step<C, P::Session, E> + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Registers the finalizer.
    pub fn finally(mut self, finalizer: impl Finalizer<C, P::Session, E> + 'static) -> Self {
        self.finalizer = Some(Box::new(finalizer));
        self
    }

    pub fn finalizer_mode(mut self, mode: FinalizerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> Workflow<P, C, E> {
        Workflow {
            name: self.name,
            provider: self.provider,
            policy: self.policy,
            mode: self.mode,
            steps: self.steps,
            finalizer: self.finalizer,
        }
    }
}

enum AttemptError<E> {
    /// The attempt failed and its writes were rolled back.
    Failed(E),
    /// The session could not be restored; the run cannot continue.
    Fatal(E),
    Panicked(String),
}

/// An ordered, immutable sequence of steps run under one transaction.
pub struct Workflow<P: TransactionProvider, C, E = StepError> {
    name: &'static str,
    provider: P,
    policy: RetryPolicy,
    mode: FinalizerMode,
    steps: Vec<BoxedStep<P, C, E>>,
    finalizer: Option<BoxedFinalizer<P, C, E>>,
}

impl<P, C, E> Workflow<P, C, E>
where
    P: TransactionProvider,
    C: Clone + Send + Sync + 'static,
    E: StepFailure,
{
    pub fn builder(
        name: &'static str,
        provider: P,
        policy: RetryPolicy,
    ) -> WorkflowBuilder<P, C, E> {
        WorkflowBuilder {
            name,
            provider,
            policy,
            mode: FinalizerMode::default(),
            steps: Vec::new(),
            finalizer: None,
        }
    }

    /// Runs every step against one session and commits.
    ///
    /// The session is ended on every path. On failure nothing is committed
    /// and the error names the failing step.
    #[tracing::instrument(skip_all, fields(workflow = self.name, run_id = %uuid::Uuid::new_v4()))]
    pub async fn run(&self, context: C) -> Result<C, WorkflowError<E>> {
        metrics::counter!("workflow_runs_total", "workflow" => self.name).increment(1);
        let started = Instant::now();

        let mut session = self.provider.begin().await.map_err(WorkflowError::Begin)?;

        let result = match self.drive(context, &mut session).await {
            Ok(context) => match self.provider.commit(&mut session).await {
                Ok(()) => Ok(context),
                Err(e) => {
                    tracing::error!(error = %e, "workflow commit failed");
                    Err(WorkflowError::Commit(e))
                }
            },
            Err(err) => {
                tracing::error!(error = %err, "workflow aborted");
                if let Err(e) = self.provider.abort(&mut session).await {
                    tracing::warn!(error = %e, "failed to abort session");
                }
                Err(err)
            }
        };

        self.provider.end_session(session).await;

        metrics::histogram!("workflow_duration_seconds", "workflow" => self.name)
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(context) => {
                metrics::counter!("workflow_committed_total", "workflow" => self.name).increment(1);
                tracing::info!("workflow committed");
                if self.mode == FinalizerMode::AfterCommit {
                    self.finalize_after_commit(&context).await;
                }
                Ok(context)
            }
            Err(err) => {
                metrics::counter!("workflow_aborted_total", "workflow" => self.name).increment(1);
                Err(err)
            }
        }
    }

    async fn drive(&self, mut context: C, session: &mut P::Session) -> Result<C, WorkflowError<E>> {
        for (i, step) in self.steps.iter().enumerate() {
            context = self.run_step(i + 1, step.as_ref(), context, session).await?;
        }

        if self.mode == FinalizerMode::Transactional
            && let Some(finalizer) = &self.finalizer
        {
            let outcome = AssertUnwindSafe(finalizer.finalize(&context, Some(session)))
                .catch_unwind()
                .await;
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    metrics::counter!("workflow_finalizer_failures_total", "workflow" => self.name)
                        .increment(1);
                    return Err(WorkflowError::FinalizerFailed(e));
                }
                Err(panic) => {
                    return Err(WorkflowError::Panicked {
                        step: "finalizer",
                        message: panic_message(panic.as_ref()),
                    });
                }
            }
        }

        Ok(context)
    }

    async fn run_step(
        &self,
        index: usize,
        step: &dyn Step<C, P::Session, E>,
        context: C,
        session: &mut P::Session,
    ) -> Result<C, WorkflowError<E>> {
        let name = step.name();
        let mut attempt = 0;

        loop {
            attempt += 1;
            metrics::counter!(
                "workflow_step_attempts_total",
                "workflow" => self.name,
                "step" => name
            )
            .increment(1);

            let error = match self.attempt(step, &context, session).await {
                Ok(next) => {
                    tracing::debug!(step = name, attempt, "step succeeded");
                    return Ok(next);
                }
                Err(AttemptError::Panicked(message)) => {
                    return Err(WorkflowError::Panicked { step: name, message });
                }
                Err(AttemptError::Fatal(source)) => {
                    return Err(WorkflowError::StepFailed {
                        index,
                        step: name,
                        attempts: attempt,
                        source,
                    });
                }
                Err(AttemptError::Failed(e)) => e,
            };

            if !error.is_retryable() || attempt >= self.policy.max_attempts {
                return Err(WorkflowError::StepFailed {
                    index,
                    step: name,
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.policy.backoff(attempt);
            tracing::warn!(
                step = name,
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "step failed, retrying"
            );
            metrics::counter!(
                "workflow_step_retries_total",
                "workflow" => self.name,
                "step" => name
            )
            .increment(1);

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn attempt(
        &self,
        step: &dyn Step<C, P::Session, E>,
        context: &C,
        session: &mut P::Session,
    ) -> Result<C, AttemptError<E>> {
        self.provider
            .savepoint(session)
            .await
            .map_err(|e| AttemptError::Failed(E::from(e)))?;

        let execution = AssertUnwindSafe(step.execute(context.clone(), session)).catch_unwind();
        let outcome = match self.policy.step_timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(Err(E::timed_out(step.name(), limit))),
            },
            None => execution.await,
        };

        match outcome {
            Ok(Ok(next)) => {
                self.provider
                    .release_savepoint(session)
                    .await
                    .map_err(|e| AttemptError::Fatal(E::from(e)))?;
                Ok(next)
            }
            Ok(Err(error)) => {
                if let Err(e) = self.provider.rollback_to_savepoint(session).await {
                    tracing::error!(step = step.name(), error = %e, "failed to roll back attempt");
                    return Err(AttemptError::Fatal(error));
                }
                Err(AttemptError::Failed(error))
            }
            Err(panic) => Err(AttemptError::Panicked(panic_message(panic.as_ref()))),
        }
    }

    async fn finalize_after_commit(&self, context: &C) {
        let Some(finalizer) = &self.finalizer else {
            return;
        };

        let outcome = AssertUnwindSafe(finalizer.finalize(context, None))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        metrics::counter!("workflow_finalizer_failures_total", "workflow" => self.name)
            .increment(1);
        tracing::error!(error = %failure, "finalizer failed after commit");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
