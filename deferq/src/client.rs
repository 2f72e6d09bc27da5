//! Enqueuing jobs and reading their status.
//!
//! A [`Client`] is the producer and status side of the queue. Worker processes get one from
//! [`crate::Worker::client`]; processes that only submit jobs, such as an HTTP front end, build
//! one with [`Client::for_functions`] from the names of the functions the workers serve.
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};

use crate::{
    function::{Registry, Validator},
    job::{builder::JobBuilder, status::JobStatus, JobArgs, JobId, JobRecord},
    store::{Store, StoreError},
    DeferqError,
};

#[derive(Clone)]
pub struct Client<S: Store> {
    store: S,
    catalog: Arc<HashMap<String, Option<Validator>>>,
    poll_interval: Duration,
}

impl<S: Store> std::fmt::Debug for Client<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("functions", &self.catalog.keys().collect::<Vec<_>>())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl<S: Store> Client<S> {
    const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// A client accepting every function of `registry`, including their argument validation.
    pub fn new(store: S, registry: &Registry) -> Self {
        let catalog = registry
            .validators()
            .map(|(name, validate)| (name.to_owned(), Some(validate)))
            .collect();
        Self {
            store,
            catalog: Arc::new(catalog),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// A client accepting the given function names without argument validation.
    pub fn for_functions<I>(store: S, names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let catalog = names.into_iter().map(|name| (name.into(), None)).collect();
        Self {
            store,
            catalog: Arc::new(catalog),
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        }
    }

    /// How often [`Client::watch`] and [`Client::wait_for_result`] poll the store.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Whether jobs for `function_name` are accepted.
    pub fn accepts(&self, function_name: &str) -> bool {
        self.catalog.contains_key(function_name)
    }

    pub fn job(&self, function_name: impl Into<String>) -> JobBuilder<'_, S> {
        JobBuilder::new(self, function_name.into())
    }

    /// Enqueue `function_name` with `args`, to run after `delay` if given.
    pub async fn enqueue(
        &self,
        function_name: &str,
        args: JobArgs,
        delay: Option<Duration>,
    ) -> Result<JobId, DeferqError> {
        let builder = self.job(function_name).with_args(args);
        match delay {
            Some(delay) => builder.defer_by(delay).enqueue().await,
            None => builder.enqueue().await,
        }
    }

    #[tracing::instrument(skip(self, job_id, args, enqueued_at))]
    pub(crate) async fn enqueue_at(
        &self,
        job_id: Option<JobId>,
        function_name: &str,
        args: JobArgs,
        enqueued_at: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Result<JobId, DeferqError> {
        match self.catalog.get(function_name) {
            None => return Err(DeferqError::UnknownFunction(function_name.to_owned())),
            Some(Some(validate)) => {
                validate(&args).map_err(|source| DeferqError::InvalidArguments {
                    function: function_name.to_owned(),
                    source,
                })?
            }
            Some(None) => {}
        }

        let job_id = job_id.unwrap_or_else(JobId::generate);
        let record = JobRecord::new(job_id.clone(), function_name, args, enqueued_at, run_at);
        let state = record.state;
        self.store.put(record).await?;
        tracing::debug!(%job_id, %state, %run_at, "Enqueued job {job_id}");
        Ok(job_id)
    }

    /// The current status of a job. Unknown and expired jobs are reported as
    /// [`crate::job::JobState::NotFound`].
    pub async fn status(&self, job_id: &JobId) -> Result<JobStatus, StoreError> {
        Ok(self
            .store
            .get(job_id)
            .await?
            .map(JobStatus::from)
            .unwrap_or_else(|| JobStatus::not_found(job_id.clone())))
    }

    /// Request a cooperative abort. Returns `false` when the job is unknown or already finished.
    pub async fn abort(&self, job_id: &JobId) -> Result<bool, StoreError> {
        let requested = self.store.request_abort(job_id).await?;
        tracing::debug!(%job_id, requested, "Requested abort of job {job_id}");
        Ok(requested)
    }

    /// Stream every change of a job's status until it is final.
    pub fn watch<'a>(
        &'a self,
        job_id: &'a JobId,
    ) -> impl Stream<Item = Result<JobStatus, StoreError>> + 'a {
        try_stream! {
            let mut last_state = None;
            loop {
                let status = self.status(job_id).await?;
                let is_final = status.is_final();
                if last_state != Some(status.state) {
                    last_state = Some(status.state);
                    yield status;
                }
                if is_final {
                    break;
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    /// Wait until the job is final and return its status.
    ///
    /// Fails with [`DeferqError::ResultTimeout`] if the job is still pending or running after
    /// `timeout`.
    pub async fn wait_for_result(
        &self,
        job_id: &JobId,
        timeout: Duration,
    ) -> Result<JobStatus, DeferqError> {
        let wait = async {
            let updates = self.watch(job_id);
            futures::pin_mut!(updates);
            let mut last = JobStatus::not_found(job_id.clone());
            while let Some(status) = updates.next().await {
                last = status?;
            }
            Ok::<_, DeferqError>(last)
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| DeferqError::ResultTimeout(job_id.clone()))?
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }
}
