//! The job record model.
//!
//! A [`JobRecord`] is the persisted representation of one unit of work. It moves through the
//! following states:
//!
//! ```text
//! deferred ─┐
//!           ├─> in_progress ─┬─> complete
//! queued ───┘                ├─> failed
//!                            └─> aborted
//! ```
//!
//! `deferred` and `queued` are equivalent to the dispatcher; the distinction only records whether
//! a delay was requested when the job was enqueued. Terminal records are kept until their
//! `keep_result` window elapses, after which they are reported as [`JobState::NotFound`].
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub mod builder;
pub(crate) mod runner;
pub mod status;

/// The unique identifier of a job.
///
/// Generated identifiers are 32 character lowercase hex encoded UUIDv4s, however any string can
/// be used via [`builder::JobBuilder::with_job_id`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a new random job id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Enqueued with a delay and waiting for its `run_at`.
    Deferred,
    /// Enqueued without a delay and waiting for a worker.
    Queued,
    /// Claimed by a worker and currently executing.
    InProgress,
    /// The function returned successfully.
    Complete,
    /// The function returned an error, panicked, or ran past its deadline.
    Failed,
    /// The job observed an abort request and stopped early.
    Aborted,
    /// No such job, or its result has expired.
    NotFound,
}

impl JobState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Deferred => "deferred",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::NotFound => "not_found",
        }
    }

    /// Whether the job is waiting to be claimed.
    pub const fn is_pending(&self) -> bool {
        matches!(self, Self::Deferred | Self::Queued)
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Aborted)
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The arguments a job is enqueued with.
///
/// Both positional and keyword arguments are opaque JSON payloads to the engine; job functions
/// extract typed values with [`JobArgs::arg`] and [`JobArgs::kwarg`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl JobArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_arg(mut self, value: impl Serialize) -> Result<Self, serde_json::Error> {
        self.args.push(serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn with_kwarg(
        mut self,
        name: impl Into<String>,
        value: impl Serialize,
    ) -> Result<Self, serde_json::Error> {
        self.kwargs.insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    /// Decode the positional argument at `index`.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, ArgumentError> {
        let value = self
            .args
            .get(index)
            .ok_or(ArgumentError::MissingPositional(index))?;
        serde_json::from_value(value.clone()).map_err(|source| ArgumentError::InvalidPositional {
            index,
            message: source.to_string(),
        })
    }

    /// Decode the keyword argument `name`, returning `None` when it was not provided.
    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, ArgumentError> {
        self.kwargs
            .get(name)
            .map(|value| {
                serde_json::from_value(value.clone()).map_err(|source| {
                    ArgumentError::InvalidKeyword {
                        name: name.to_owned(),
                        message: source.to_string(),
                    }
                })
            })
            .transpose()
    }

    /// Decode the keyword argument `name`, failing when it was not provided.
    pub fn required_kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, ArgumentError> {
        self.kwarg(name)?
            .ok_or_else(|| ArgumentError::MissingKeyword(name.to_owned()))
    }
}

/// Failure to extract an argument from [`JobArgs`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ArgumentError {
    #[error("missing positional argument {0}")]
    MissingPositional(usize),
    #[error("invalid positional argument {index}: {message}")]
    InvalidPositional { index: usize, message: String },
    #[error("missing keyword argument `{0}`")]
    MissingKeyword(String),
    #[error("invalid keyword argument `{name}`: {message}")]
    InvalidKeyword { name: String, message: String },
    #[error("{0}")]
    Other(String),
}

/// Classification of why a job failed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCause {
    /// The function returned an error; carries the error type reported by the function.
    Error(String),
    /// The function did not finish before its deadline.
    Timeout,
    /// The function panicked.
    Panic,
    /// The job named a function this worker does not know.
    UnknownFunction,
}

impl Display for ErrorCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error(error_type) => f.write_str(error_type),
            Self::Timeout => f.write_str("timeout"),
            Self::Panic => f.write_str("panic"),
            Self::UnknownFunction => f.write_str("unknown_function"),
        }
    }
}

/// The error recorded on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub cause: ErrorCause,
    pub message: String,
}

impl JobFailure {
    pub fn is_timeout(&self) -> bool {
        self.cause == ErrorCause::Timeout
    }

    /// The failure recorded on a job whose worker did not finish it before its deadline.
    pub fn overdue() -> Self {
        Self {
            cause: ErrorCause::Timeout,
            message: "Job did not record a result before its deadline".to_owned(),
        }
    }
}

impl Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.cause, self.message)
    }
}

/// The terminal outcome of an execution, written once via
/// [`crate::store::Store::mark_terminal`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Complete(Value),
    Failed(JobFailure),
    Aborted,
}

impl Outcome {
    pub fn state(&self) -> JobState {
        match self {
            Self::Complete(_) => JobState::Complete,
            Self::Failed(_) => JobState::Failed,
            Self::Aborted => JobState::Aborted,
        }
    }
}

/// The persisted representation of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub function_name: String,
    pub args: JobArgs,
    pub state: JobState,
    pub attempt: u16,
    pub enqueued_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<JobFailure>,
    pub abort_requested: bool,
}

impl JobRecord {
    /// A fresh record as written by the producer.
    ///
    /// The state is [`JobState::Deferred`] when `run_at` lies after `enqueued_at`, otherwise
    /// [`JobState::Queued`].
    pub fn new(
        id: JobId,
        function_name: impl Into<String>,
        args: JobArgs,
        enqueued_at: DateTime<Utc>,
        run_at: DateTime<Utc>,
    ) -> Self {
        let state = if run_at > enqueued_at {
            JobState::Deferred
        } else {
            JobState::Queued
        };
        Self {
            id,
            function_name: function_name.into(),
            args,
            state,
            attempt: 0,
            enqueued_at,
            run_at,
            attempt_started_at: None,
            deadline: None,
            finished_at: None,
            expires_at: None,
            result: None,
            error: None,
            abort_requested: false,
        }
    }

    /// Whether the record's result window has elapsed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }

    pub(crate) fn mark_in_progress(&mut self, now: DateTime<Utc>, deadline: DateTime<Utc>) {
        self.state = JobState::InProgress;
        self.attempt += 1;
        self.attempt_started_at = Some(now);
        self.deadline = Some(deadline);
    }

    pub(crate) fn mark_terminal(
        &mut self,
        outcome: Outcome,
        finished_at: DateTime<Utc>,
        keep_result: chrono::TimeDelta,
    ) {
        self.state = outcome.state();
        self.finished_at = Some(finished_at);
        self.expires_at = Some(finished_at + keep_result);
        match outcome {
            Outcome::Complete(value) => self.result = Some(value),
            Outcome::Failed(failure) => self.error = Some(failure),
            Outcome::Aborted => {}
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use serde_json::json;

    use super::*;

    #[test]
    fn generated_ids_are_unique_hex() {
        let id1 = JobId::generate();
        let id2 = JobId::generate();

        assert_ne!(id1, id2);
        assert_eq!(id1.as_str().len(), 32);
        assert!(id1.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn new_record_state_depends_on_delay() {
        let now = Utc::now();
        let queued = JobRecord::new(JobId::generate(), "f", JobArgs::new(), now, now);
        let deferred = JobRecord::new(
            JobId::generate(),
            "f",
            JobArgs::new(),
            now,
            now + TimeDelta::seconds(5),
        );

        assert_eq!(queued.state, JobState::Queued);
        assert_eq!(deferred.state, JobState::Deferred);
    }

    #[test]
    fn job_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(JobState::InProgress).unwrap(),
            json!("in_progress")
        );
        assert_eq!(JobState::NotFound.to_string(), "not_found");
    }

    #[test]
    fn extracting_arguments() {
        let args = JobArgs::new()
            .with_arg("to@example.com")
            .unwrap()
            .with_kwarg("duration", 3)
            .unwrap();

        assert_eq!(args.arg::<String>(0).unwrap(), "to@example.com");
        assert_eq!(args.kwarg::<u64>("duration").unwrap(), Some(3));
        assert_eq!(args.kwarg::<u64>("missing").unwrap(), None);
        assert_matches!(args.arg::<String>(1), Err(ArgumentError::MissingPositional(1)));
        assert_matches!(
            args.kwarg::<String>("duration"),
            Err(ArgumentError::InvalidKeyword { .. })
        );
        assert_matches!(
            args.required_kwarg::<u64>("data"),
            Err(ArgumentError::MissingKeyword(_))
        );
    }

    #[test]
    fn terminal_outcomes_set_exclusive_payloads() {
        let now = Utc::now();
        let mut record = JobRecord::new(JobId::generate(), "f", JobArgs::new(), now, now);
        record.mark_in_progress(now, now + TimeDelta::seconds(1));
        record.mark_terminal(
            Outcome::Failed(JobFailure {
                cause: ErrorCause::Timeout,
                message: "too slow".to_owned(),
            }),
            now,
            TimeDelta::seconds(10),
        );

        assert_eq!(record.state, JobState::Failed);
        assert_eq!(record.attempt, 1);
        assert!(record.result.is_none());
        assert!(record.error.as_ref().is_some_and(JobFailure::is_timeout));
        assert!(!record.is_expired(now + TimeDelta::seconds(9)));
        assert!(record.is_expired(now + TimeDelta::seconds(10)));
    }
}
