//! The API for implementing a job store.
//!
//! A store holds job records, the index of records waiting for their `run_at`, and terminal
//! records until their result expires. It is the single source of truth shared by producers,
//! every worker process, and status queries.
//!
//! The crate provides [`memory::InMemoryStore`]; `deferq-sqlx` provides a durable PostgreSQL
//! implementation. Implementors can check their store against the contract with
//! [`crate::test_suite`].
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::job::{JobArgs, JobId, JobRecord, JobState, Outcome};

pub mod memory;
mod queryable;
#[doc(hidden)]
pub mod testing;

/// A function a worker is able to claim jobs for, together with the timeout used to compute the
/// claimed job's deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claimable<'a> {
    pub function_name: &'a str,
    pub timeout: TimeDelta,
}

impl<'a> Claimable<'a> {
    const MAX_TIMEOUT: TimeDelta = TimeDelta::days(365);

    pub fn new(function_name: &'a str, timeout: Duration) -> Self {
        Self {
            function_name,
            timeout: TimeDelta::from_std(timeout)
                .unwrap_or(Self::MAX_TIMEOUT)
                .min(Self::MAX_TIMEOUT),
        }
    }
}

/// A filter over job records.
#[derive(Debug, Clone, PartialEq)]
pub enum Query<'a> {
    Not(Box<Query<'a>>),
    And(Vec<Query<'a>>),
    Or(Vec<Query<'a>>),
    IdEquals(&'a JobId),
    FunctionEqual(&'a str),
    StateEqual(JobState),
    ArgsEqual(JobArgs),
    RunAtBefore(DateTime<Utc>),
    RunAtAfter(DateTime<Utc>),
    RunAtEqual(DateTime<Utc>),
}

impl Query<'_> {
    /// Matches every record.
    pub fn all() -> Self {
        Self::And(Vec::new())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Job {0} already exists")]
    JobExists(JobId),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("Error encoding or decoding data")]
    EncodeDecode(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// The durable store contract.
///
/// Every method either fully applies or fails; callers never assume partial success.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Insert a new record.
    ///
    /// Fails with [`StoreError::JobExists`] if a record with the same id exists and has not
    /// expired.
    async fn put(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Load a record. Unknown ids and expired terminal records are both absent.
    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Atomically claim the ready record with the earliest `run_at` (ties broken by
    /// `enqueued_at`) for one of the given functions, moving it to [`JobState::InProgress`].
    ///
    /// No two callers, in this or any other process, may claim the same record.
    async fn claim_next_ready(
        &self,
        now: DateTime<Utc>,
        functions: &[Claimable<'_>],
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Move an in progress record into the terminal state of `outcome`, retaining it for
    /// `keep_result`.
    ///
    /// Fails with [`StoreError::InvalidTransition`] without changing anything if the record is
    /// not in progress.
    async fn mark_terminal(
        &self,
        id: &JobId,
        outcome: Outcome,
        keep_result: TimeDelta,
    ) -> Result<(), StoreError>;

    /// Flag a record for cooperative abort. Returns `false` when the record is absent or already
    /// terminal.
    async fn request_abort(&self, id: &JobId) -> Result<bool, StoreError>;

    /// The subset of `ids` flagged for abort.
    async fn abort_requested(&self, ids: &[JobId]) -> Result<Vec<JobId>, StoreError>;

    /// Delete terminal records that finished at least `ttl` before `now`, or whose own result
    /// window has elapsed. Returns the number of records deleted.
    async fn expire_terminal_older_than(
        &self,
        ttl: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    /// Fail in progress records whose deadline is at or before `now` as timed out, retaining
    /// them for `keep_result`. Returns the number of records failed.
    ///
    /// Recovers jobs whose worker stopped before recording a result.
    async fn fail_overdue(
        &self,
        now: DateTime<Utc>,
        keep_result: TimeDelta,
    ) -> Result<u64, StoreError>;

    /// The earliest `run_at` of any pending record for the given functions.
    async fn next_run_at(&self, functions: &[&str]) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<JobRecord>, StoreError>;

    /// Check the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Wait up to `max` for new work. Stores able to signal enqueues may return early.
    async fn wait_for_jobs(&self, max: Duration) {
        tokio::time::sleep(max).await
    }
}
