use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use chrono::Utc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{
    client::Client,
    config::WorkerConfig,
    cron::{runner::CronRunner, CronDefinition},
    dispatcher::Dispatcher,
    function::{Lifecycle, NoopLifecycle, Registry, Resources},
    job::{JobState, Outcome},
    pruner::{runner::PrunerRunner, PrunerConfig},
    store::{Query, Store},
    DeferqError,
};

/// A worker process: the dispatch loop, the cron scheduler and the result pruner sharing one
/// store.
///
/// See the crate level documentation for an example.
pub struct Worker<S: Store> {
    store: S,
    registry: Registry,
    config: WorkerConfig,
    cron: Vec<CronDefinition>,
    lifecycle: Arc<dyn Lifecycle>,
    resources: Resources,
    pruner: Option<PrunerConfig>,
}

impl<S: Store> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .field("cron", &self.cron)
            .field("resources", &self.resources)
            .field("pruner", &self.pruner)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Worker<S> {
    pub fn new(store: S, registry: Registry, config: WorkerConfig) -> Self {
        Self {
            store,
            registry,
            config,
            cron: Vec::new(),
            lifecycle: Arc::new(NoopLifecycle),
            resources: Resources::new(),
            pruner: None,
        }
    }

    pub fn with_cron(mut self, definition: CronDefinition) -> Self {
        self.cron.push(definition);
        self
    }

    /// Hooks ran once when the worker starts and once after it stopped.
    pub fn with_lifecycle(self, lifecycle: impl Lifecycle + 'static) -> Self {
        Self {
            lifecycle: Arc::new(lifecycle),
            ..self
        }
    }

    /// Resources made available to every job through [`crate::function::JobContext::resource`].
    pub fn with_resources(self, resources: Resources) -> Self {
        Self { resources, ..self }
    }

    /// Periodically delete expired results. Without a pruner expired results are hidden from
    /// reads but stay in the store.
    pub fn with_pruner(self, config: PrunerConfig) -> Self {
        Self {
            pruner: Some(config),
            ..self
        }
    }

    /// A client accepting the functions of this worker.
    pub fn client(&self) -> Client<S> {
        Client::new(self.store.clone(), &self.registry)
    }

    /// Start the worker.
    ///
    /// Runs [`Lifecycle::on_startup`] first; if it fails nothing is started.
    pub async fn spawn(self) -> Result<WorkerHandle, DeferqError> {
        self.config.validate()?;
        if let Some(definition) = self
            .cron
            .iter()
            .find(|definition| !self.registry.contains(&definition.function_name))
        {
            return Err(DeferqError::UnknownFunction(
                definition.function_name.clone(),
            ));
        }

        self.lifecycle
            .on_startup(&self.resources)
            .await
            .map_err(|err| {
                tracing::error!(?err, "Worker startup hook failed: {err}");
                DeferqError::Startup(err)
            })?;

        let cancellation_token = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let tasks = TaskTracker::new();
        let client = self.client();

        tasks.spawn(
            Dispatcher::new(
                self.store.clone(),
                self.registry,
                self.config.clone(),
                self.resources.clone(),
                counters.clone(),
            )
            .run(cancellation_token.clone()),
        );

        if !self.cron.is_empty() {
            tasks.spawn(CronRunner::new(client, self.cron).run(cancellation_token.clone()));
        }

        if let Some(pruner) = self.pruner {
            tasks.spawn(
                PrunerRunner::new(self.store.clone(), pruner, self.config.keep_result)
                    .run(cancellation_token.clone()),
            );
        }

        tasks.spawn(health_check(
            self.store,
            self.config.clone(),
            counters.clone(),
            cancellation_token.clone(),
        ));
        tasks.close();

        tracing::info!("Worker started for queue {}", self.config.queue_name);

        Ok(WorkerHandle {
            cancellation_token,
            tasks,
            counters,
            lifecycle: self.lifecycle,
            resources: self.resources,
        })
    }
}

/// Handle to a running [`Worker`].
///
/// Dropping the handle stops the worker without waiting for it.
pub struct WorkerHandle {
    cancellation_token: CancellationToken,
    tasks: TaskTracker,
    counters: Arc<Counters>,
    lifecycle: Arc<dyn Lifecycle>,
    resources: Resources,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("stats", &self.stats())
            .field("stopped", &self.cancellation_token.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Stop claiming jobs, wait for in-flight jobs up to
    /// [`WorkerConfig::job_completion_wait`], then run [`Lifecycle::on_shutdown`].
    pub async fn graceful_shutdown(self) -> Result<(), DeferqError> {
        tracing::debug!("Shutting down worker tasks");
        self.cancellation_token.cancel();
        self.tasks.wait().await;
        self.lifecycle
            .on_shutdown(&self.resources)
            .await
            .map_err(DeferqError::Shutdown)
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

/// Counters of the jobs executed by a worker since it started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub complete: u64,
    pub failed: u64,
    pub aborted: u64,
    pub ongoing: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    complete: AtomicU64,
    failed: AtomicU64,
    aborted: AtomicU64,
    ongoing: AtomicU64,
}

impl Counters {
    pub(crate) fn job_started(&self) {
        self.ongoing.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self, outcome: &Outcome) {
        self.ongoing.fetch_sub(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Complete(_) => &self.complete,
            Outcome::Failed(_) => &self.failed,
            Outcome::Aborted => &self.aborted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            complete: self.complete.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            ongoing: self.ongoing.load(Ordering::Relaxed),
        }
    }
}

async fn health_check<S: Store>(
    store: S,
    config: WorkerConfig,
    counters: Arc<Counters>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.health_check_interval) => {},
            _ = cancellation_token.cancelled() => break,
        }
        let stats = counters.snapshot();
        let ready = Query::And(vec![
            Query::Or(vec![
                Query::StateEqual(JobState::Queued),
                Query::StateEqual(JobState::Deferred),
            ]),
            Query::Not(Box::new(Query::RunAtAfter(Utc::now()))),
        ]);
        match store.query(ready).await {
            Ok(queued) => tracing::info!(
                queue = %config.queue_name,
                "j_complete={} j_failed={} j_aborted={} j_ongoing={} queued={}",
                stats.complete,
                stats.failed,
                stats.aborted,
                stats.ongoing,
                queued.len()
            ),
            Err(error) => tracing::warn!(
                ?error,
                "j_complete={} j_failed={} j_aborted={} j_ongoing={} queued=unknown",
                stats.complete,
                stats.failed,
                stats.aborted,
                stats.ongoing
            ),
        }
    }
}
