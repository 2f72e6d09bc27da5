//! The dispatch loop turning ready jobs into bounded concurrent executions.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    backoff::BackoffStrategy,
    config::WorkerConfig,
    function::{Registry, Resources},
    job::{runner::JobRunner, JobId, JobRecord},
    store::{Claimable, Store},
    worker::Counters,
};

/// Abort tokens of the jobs currently executing in this process.
#[derive(Clone, Default)]
pub(crate) struct InFlight {
    tokens: Arc<Mutex<HashMap<JobId, CancellationToken>>>,
}

impl InFlight {
    fn insert(&self, job_id: JobId, token: CancellationToken) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.insert(job_id, token);
        }
    }

    fn remove(&self, job_id: &JobId) {
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.remove(job_id);
        }
    }

    /// Ids of in-flight jobs not yet told to abort.
    fn abortable(&self) -> Vec<JobId> {
        self.tokens
            .lock()
            .map(|tokens| {
                tokens
                    .iter()
                    .filter(|(_, token)| !token.is_cancelled())
                    .map(|(job_id, _)| job_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn abort(&self, job_id: &JobId) -> bool {
        self.tokens
            .lock()
            .ok()
            .and_then(|tokens| tokens.get(job_id).cloned())
            .map(|token| token.cancel())
            .is_some()
    }

    fn abort_all(&self) {
        if let Ok(tokens) = self.tokens.lock() {
            tokens.values().for_each(CancellationToken::cancel);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.tokens.lock().map(|tokens| tokens.len()).unwrap_or_default()
    }
}

/// How long shutdown waits for jobs to observe an abort request.
const ABORT_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct Dispatcher<S: Store> {
    store: S,
    registry: Registry,
    config: WorkerConfig,
    resources: Resources,
    counters: Arc<Counters>,
    in_flight: InFlight,
}

impl<S: Store> Dispatcher<S> {
    pub(crate) fn new(
        store: S,
        registry: Registry,
        config: WorkerConfig,
        resources: Resources,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            resources,
            counters,
            in_flight: InFlight::default(),
        }
    }

    /// Claim and execute jobs until `shutdown` is cancelled, then wait up to
    /// `job_completion_wait` for the jobs still running.
    pub(crate) async fn run(self, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_jobs));
        let jobs = TaskTracker::new();
        let timeouts = self.registry.timeouts(self.config.job_timeout);
        let claimable: Vec<_> = timeouts
            .iter()
            .map(|&(name, timeout)| Claimable::new(name, timeout))
            .collect();
        let function_names: Vec<&str> = timeouts.iter().map(|(name, _)| *name).collect();
        let keep_result =
            TimeDelta::from_std(self.config.keep_result).unwrap_or(TimeDelta::weeks(520));
        let backoff =
            BackoffStrategy::for_store(self.config.poll_delay, self.config.max_store_backoff);
        let runner = Arc::new(JobRunner::new(
            self.store.clone(),
            keep_result,
            self.config.job_timeout,
            self.resources.clone(),
            self.counters.clone(),
            backoff,
        ));
        let stop_watcher = CancellationToken::new();
        let watcher = tokio::spawn(watch_store(
            self.store.clone(),
            self.in_flight.clone(),
            self.config.poll_delay,
            keep_result,
            stop_watcher.clone(),
        ));

        tracing::info!(
            functions = ?function_names,
            max_jobs = self.config.max_jobs,
            "Starting dispatcher for queue {}",
            self.config.queue_name
        );

        let mut failures: u16 = 0;
        loop {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.cancelled() => break,
            };

            let delay = match self.store.claim_next_ready(Utc::now(), &claimable).await {
                Ok(Some(record)) => {
                    failures = 0;
                    self.spawn_job(&jobs, &runner, record, permit);
                    continue;
                }
                Ok(None) => {
                    failures = 0;
                    drop(permit);
                    self.idle_delay(&function_names).await
                }
                Err(error) => {
                    drop(permit);
                    failures = failures.saturating_add(1);
                    let delay = backoff.delay(failures);
                    tracing::error!(
                        ?error,
                        failures,
                        "Failed to claim jobs, retrying in {delay:?}: {error}"
                    );
                    delay
                }
            };

            tokio::select! {
                _ = self.store.wait_for_jobs(delay), if failures == 0 => {},
                _ = tokio::time::sleep(delay), if failures > 0 => {},
                _ = shutdown.cancelled() => break,
            }
        }

        jobs.close();
        if !jobs.is_empty() {
            tracing::info!(
                in_flight = jobs.len(),
                "Waiting up to {:?} for in-flight jobs",
                self.config.job_completion_wait
            );
        }
        if tokio::time::timeout(self.config.job_completion_wait, jobs.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                in_flight = self.in_flight.len(),
                "In-flight jobs did not finish within {:?}, requesting abort",
                self.config.job_completion_wait
            );
            self.in_flight.abort_all();
            if tokio::time::timeout(ABORT_GRACE, jobs.wait()).await.is_err() {
                tracing::warn!(
                    in_flight = self.in_flight.len(),
                    "Jobs ignored the abort request, they fail once their deadline passes"
                );
            }
        }
        stop_watcher.cancel();
        let _ = watcher
            .await
            .inspect_err(|err| tracing::error!(?err, "Abort watcher failed: {err}"));
        tracing::debug!("Dispatcher for queue {} stopped", self.config.queue_name);
    }

    fn spawn_job(
        &self,
        jobs: &TaskTracker,
        runner: &Arc<JobRunner<S>>,
        record: JobRecord,
        permit: OwnedSemaphorePermit,
    ) {
        let job_id = record.id.clone();
        let function = self.registry.get(&record.function_name).cloned();
        let token = CancellationToken::new();
        self.in_flight.insert(job_id.clone(), token.clone());

        let runner = runner.clone();
        let in_flight = self.in_flight.clone();
        jobs.spawn(async move {
            runner.execute_job(record, function, token).await;
            in_flight.remove(&job_id);
            drop(permit);
        });
    }

    /// How long to wait for new work: until the next deferred job is due, at most `poll_delay`.
    async fn idle_delay(&self, function_names: &[&str]) -> Duration {
        match self.store.next_run_at(function_names).await {
            Ok(Some(run_at)) => (run_at - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(self.config.poll_delay),
            Ok(None) => self.config.poll_delay,
            Err(error) => {
                tracing::warn!(?error, "Failed to read next run time: {error}");
                self.config.poll_delay
            }
        }
    }
}

/// Every `interval`: fail jobs left in progress past their deadline, then cancel the tokens of
/// in-flight jobs whose abort has been requested.
async fn watch_store<S: Store>(
    store: S,
    in_flight: InFlight,
    interval: Duration,
    keep_result: TimeDelta,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = stop.cancelled() => break,
        }
        match store.fail_overdue(Utc::now(), keep_result).await {
            Ok(0) => {}
            Ok(failed) => tracing::warn!(failed, "Failed {failed} jobs past their deadline"),
            Err(error) => tracing::warn!(?error, "Failed to check for overdue jobs: {error}"),
        }
        let job_ids = in_flight.abortable();
        if job_ids.is_empty() {
            continue;
        }
        match store.abort_requested(&job_ids).await {
            Ok(requested) => requested.iter().for_each(|job_id| {
                if in_flight.abort(job_id) {
                    tracing::debug!(%job_id, "Abort requested for job {job_id}");
                }
            }),
            Err(error) => tracing::warn!(?error, "Failed to check for aborted jobs: {error}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn in_flight_tracks_abortable_jobs() {
        let in_flight = InFlight::default();
        let first = JobId::generate();
        let second = JobId::generate();
        let token = CancellationToken::new();
        in_flight.insert(first.clone(), token.clone());
        in_flight.insert(second.clone(), CancellationToken::new());

        assert!(in_flight.abort(&first));
        assert!(token.is_cancelled());
        assert_eq!(in_flight.abortable(), vec![second.clone()]);
        assert!(!in_flight.abort(&JobId::generate()));

        in_flight.remove(&first);
        in_flight.remove(&second);
        assert_eq!(in_flight.len(), 0);
    }
}
