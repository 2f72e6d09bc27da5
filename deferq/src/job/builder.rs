use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{client::Client, store::Store, DeferqError};

use super::{JobArgs, JobId};

/// Fluent construction of a job, obtained from [`Client::job`].
///
/// ```
/// # use deferq::prelude::*;
/// # use deferq::store::memory::InMemoryStore;
/// # use std::time::Duration;
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// let client = Client::for_functions(InMemoryStore::new(), ["send_email"]);
///
/// let job_id = client
///     .job("send_email")
///     .with_arg("user@example.com")
///     .with_kwarg("subject", "Welcome")
///     .defer_by(Duration::from_secs(60))
///     .enqueue()
///     .await
///     .unwrap();
///
/// assert_eq!(client.status(&job_id).await.unwrap().state, JobState::Deferred);
/// # });
/// ```
#[must_use = "a job is only created once `enqueue` is awaited"]
pub struct JobBuilder<'a, S: Store> {
    client: &'a Client<S>,
    function_name: String,
    args: JobArgs,
    schedule: Schedule,
    job_id: Option<JobId>,
    encode_error: Option<serde_json::Error>,
}

enum Schedule {
    Now,
    DeferBy(Duration),
    DeferUntil(DateTime<Utc>),
}

impl<'a, S: Store> JobBuilder<'a, S> {
    pub(crate) fn new(client: &'a Client<S>, function_name: String) -> Self {
        Self {
            client,
            function_name,
            args: JobArgs::default(),
            schedule: Schedule::Now,
            job_id: None,
            encode_error: None,
        }
    }

    /// Append a positional argument.
    pub fn with_arg(mut self, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => self.args.args.push(value),
            Err(error) => self.encode_error = Some(error),
        }
        self
    }

    /// Set a keyword argument, replacing any previous value under `name`.
    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => {
                self.args.kwargs.insert(name.into(), value);
            }
            Err(error) => self.encode_error = Some(error),
        }
        self
    }

    /// Replace all arguments.
    pub fn with_args(self, args: JobArgs) -> Self {
        Self { args, ..self }
    }

    pub fn defer_by(self, delay: Duration) -> Self {
        Self {
            schedule: Schedule::DeferBy(delay),
            ..self
        }
    }

    pub fn defer_until(self, run_at: DateTime<Utc>) -> Self {
        Self {
            schedule: Schedule::DeferUntil(run_at),
            ..self
        }
    }

    /// Use a caller supplied id instead of a generated one.
    ///
    /// Enqueuing fails with [`crate::store::StoreError::JobExists`] while a job with this id is
    /// live, which makes it a way to enqueue a job at most once.
    pub fn with_job_id(self, job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..self
        }
    }

    pub async fn enqueue(self) -> Result<JobId, DeferqError> {
        if let Some(error) = self.encode_error {
            return Err(error.into());
        }
        let now = Utc::now();
        let run_at = match self.schedule {
            Schedule::Now => now,
            Schedule::DeferBy(delay) => chrono::TimeDelta::from_std(delay)
                .ok()
                .and_then(|delay| now.checked_add_signed(delay))
                .ok_or(DeferqError::DelayOutOfRange(delay))?,
            Schedule::DeferUntil(run_at) => run_at,
        };
        self.client
            .enqueue_at(self.job_id, &self.function_name, self.args, now, run_at)
            .await
    }
}
