use std::{sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    backoff::BackoffStrategy,
    function::{ExecutionError, JobContext, RegisteredFunction, Resources},
    store::{Claimable, Store, StoreError},
    worker::Counters,
};

use super::{ErrorCause, JobFailure, JobId, JobRecord, Outcome};

/// Executes one claimed job and records its terminal outcome.
pub(crate) struct JobRunner<S: Store> {
    store: S,
    keep_result: TimeDelta,
    default_timeout: Duration,
    resources: Resources,
    counters: Arc<Counters>,
    store_backoff: BackoffStrategy,
}

impl<S: Store> JobRunner<S> {
    pub(crate) fn new(
        store: S,
        keep_result: TimeDelta,
        default_timeout: Duration,
        resources: Resources,
        counters: Arc<Counters>,
        store_backoff: BackoffStrategy,
    ) -> Self {
        Self {
            store,
            keep_result,
            default_timeout,
            resources,
            counters,
            store_backoff,
        }
    }

    #[instrument(skip_all, fields(job_id = %record.id, function = %record.function_name))]
    pub(crate) async fn execute_job(
        &self,
        record: JobRecord,
        function: Option<RegisteredFunction>,
        abort: CancellationToken,
    ) {
        let job_id = record.id.clone();
        self.counters.job_started();
        let outcome = self.run(record, function, abort).await;
        self.counters.job_finished(&outcome);

        match &outcome {
            Outcome::Complete(_) => tracing::debug!(%job_id, "Job {job_id} complete"),
            Outcome::Aborted => tracing::info!(%job_id, "Job {job_id} aborted"),
            Outcome::Failed(error) => tracing::error!(
                %job_id,
                ?error,
                "Job {job_id} failed: cause: {}, message: {}",
                error.cause,
                error.message
            ),
        }

        self.record(&job_id, outcome).await;
    }

    /// Write the terminal state, retrying with backoff for as long as the store is unavailable.
    async fn record(&self, job_id: &JobId, outcome: Outcome) {
        let state = outcome.state();
        let mut failures: u16 = 0;
        loop {
            match self
                .store
                .mark_terminal(job_id, outcome.clone(), self.keep_result)
                .await
            {
                Ok(()) => return,
                Err(err) if err.is_unavailable() => {
                    failures = failures.saturating_add(1);
                    let delay = self.store_backoff.delay(failures);
                    tracing::warn!(
                        ?err,
                        %job_id,
                        failures,
                        "Failed to mark job {job_id} as {state}, retrying in {delay:?}: {err}",
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err @ StoreError::InvalidTransition { .. }) => {
                    tracing::warn!(
                        ?err,
                        %job_id,
                        "Job {job_id} finished as {state} after it was already recorded: {err}",
                    );
                    return;
                }
                Err(err) => {
                    tracing::error!(
                        ?err,
                        %job_id,
                        "Failed to mark job {job_id} as {state}, error: {err:?}",
                    );
                    return;
                }
            }
        }
    }

    async fn run(
        &self,
        record: JobRecord,
        function: Option<RegisteredFunction>,
        abort: CancellationToken,
    ) -> Outcome {
        let Some(function) = function else {
            return Outcome::Failed(JobFailure {
                cause: ErrorCause::UnknownFunction,
                message: format!("function `{}` is not registered", record.function_name),
            });
        };
        if record.abort_requested || abort.is_cancelled() {
            tracing::debug!(job_id = %record.id, "Job {} aborted before it started", record.id);
            return Outcome::Aborted;
        }

        let timeout = function.timeout.unwrap_or(self.default_timeout);
        let deadline = record.deadline.unwrap_or_else(|| {
            Utc::now() + Claimable::new(&record.function_name, timeout).timeout
        });
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        let ctx = JobContext::new(
            record.id.clone(),
            record.function_name.clone(),
            record.attempt,
            record.enqueued_at,
            deadline,
            abort,
            self.resources.clone(),
        );

        tracing::debug!(
            job_id = %record.id,
            attempt = record.attempt,
            "Executing job {}",
            record.id
        );
        let mut handle = tokio::spawn((function.handler)(ctx, record.args).in_current_span());

        match tokio::time::timeout(remaining, &mut handle).await {
            Ok(Ok(Ok(value))) => Outcome::Complete(value),
            Ok(Ok(Err(ExecutionError::Aborted))) => Outcome::Aborted,
            Ok(Ok(Err(error))) => Outcome::Failed(error.into()),
            Ok(Err(error)) => Outcome::Failed(error.into()),
            Err(_elapsed) => {
                handle.abort();
                Outcome::Failed(timeout_failure(&record.id, timeout))
            }
        }
    }
}

fn timeout_failure(job_id: &JobId, timeout: Duration) -> JobFailure {
    JobFailure {
        cause: ErrorCause::Timeout,
        message: format!("Job {job_id} failed to complete within timeout: {timeout:?}"),
    }
}

impl From<JoinError> for JobFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            cause: ErrorCause::Panic,
            message,
        }
    }
}
