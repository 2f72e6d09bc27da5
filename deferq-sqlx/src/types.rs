use chrono::{DateTime, Utc};
use deferq::{
    job::{JobFailure, JobRecord},
    store::StoreError,
};
use sqlx::prelude::FromRow;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "deferq_job_state", rename_all = "snake_case")]
pub(crate) enum JobState {
    Deferred,
    Queued,
    InProgress,
    Complete,
    Failed,
    Aborted,
}

impl JobState {
    /// The stored state for `state`, [`None`] for states that are never stored.
    pub(crate) fn stored(state: deferq::job::JobState) -> Option<Self> {
        match state {
            deferq::job::JobState::Deferred => Some(Self::Deferred),
            deferq::job::JobState::Queued => Some(Self::Queued),
            deferq::job::JobState::InProgress => Some(Self::InProgress),
            deferq::job::JobState::Complete => Some(Self::Complete),
            deferq::job::JobState::Failed => Some(Self::Failed),
            deferq::job::JobState::Aborted => Some(Self::Aborted),
            deferq::job::JobState::NotFound => None,
        }
    }
}

impl From<JobState> for deferq::job::JobState {
    fn from(value: JobState) -> Self {
        match value {
            JobState::Deferred => Self::Deferred,
            JobState::Queued => Self::Queued,
            JobState::InProgress => Self::InProgress,
            JobState::Complete => Self::Complete,
            JobState::Failed => Self::Failed,
            JobState::Aborted => Self::Aborted,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: String,
    pub function_name: String,
    pub args: serde_json::Value,
    pub state: JobState,
    pub attempt: i32,
    pub enqueued_at: DateTime<Utc>,
    pub run_at: DateTime<Utc>,
    pub attempt_started_at: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub abort_requested: bool,
}

impl TryFrom<Job> for JobRecord {
    type Error = StoreError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        let args = serde_json::from_value(value.args)?;
        let error = value
            .error
            .map(serde_json::from_value::<JobFailure>)
            .transpose()?;
        Ok(Self {
            id: value.id.into(),
            function_name: value.function_name,
            args,
            state: value.state.into(),
            attempt: u16::try_from(value.attempt).unwrap_or(u16::MAX),
            enqueued_at: value.enqueued_at,
            run_at: value.run_at,
            attempt_started_at: value.attempt_started_at,
            deadline: value.deadline,
            finished_at: value.finished_at,
            expires_at: value.expires_at,
            result: value.result,
            error,
            abort_requested: value.abort_requested,
        })
    }
}

#[cfg(test)]
mod test {
    use deferq::job::{ErrorCause, JobArgs};
    use serde_json::json;

    use super::*;

    #[test]
    fn row_converts_to_record() {
        let now = Utc::now();
        let row = Job {
            id: "job".to_owned(),
            function_name: "process_data".to_owned(),
            args: json!({"args": [], "kwargs": {"data": {"x": 1}}}),
            state: JobState::Failed,
            attempt: 1,
            enqueued_at: now,
            run_at: now,
            attempt_started_at: Some(now),
            deadline: Some(now),
            finished_at: Some(now),
            expires_at: Some(now),
            result: None,
            error: Some(json!({"cause": "timeout", "message": "too slow"})),
            abort_requested: false,
        };

        let record = JobRecord::try_from(row).unwrap();

        assert_eq!(record.id.as_str(), "job");
        assert_eq!(record.state, deferq::job::JobState::Failed);
        assert_eq!(
            record.args,
            JobArgs::new().with_kwarg("data", json!({"x": 1})).unwrap()
        );
        assert_eq!(record.error.unwrap().cause, ErrorCause::Timeout);
    }

    #[test]
    fn not_found_is_never_stored() {
        assert_eq!(JobState::stored(deferq::job::JobState::NotFound), None);
        assert_eq!(
            JobState::stored(deferq::job::JobState::InProgress),
            Some(JobState::InProgress)
        );
    }
}
