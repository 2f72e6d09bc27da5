use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobFailure, JobId, JobRecord, JobState};

/// The client facing view of a job.
///
/// Only exposes the lifecycle state and the terminal payload, never scheduling internals such as
/// the deadline of the current attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,
}

impl JobStatus {
    /// The status of an unknown or expired job.
    pub fn not_found(id: JobId) -> Self {
        Self {
            id,
            state: JobState::NotFound,
            result: None,
            error: None,
        }
    }

    /// Whether the state will not change any more.
    pub fn is_final(&self) -> bool {
        self.state.is_terminal() || self.state == JobState::NotFound
    }
}

impl From<JobRecord> for JobStatus {
    fn from(record: JobRecord) -> Self {
        let (result, error) = match record.state {
            JobState::Complete => (record.result, None),
            JobState::Failed => (None, record.error),
            _ => (None, None),
        };
        Self {
            id: record.id,
            state: record.state,
            result,
            error,
        }
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeDelta, Utc};
    use serde_json::json;

    use crate::job::{ErrorCause, JobArgs, Outcome};

    use super::*;

    #[test]
    fn status_hides_payload_until_terminal() {
        let now = Utc::now();
        let mut record = JobRecord::new(JobId::generate(), "f", JobArgs::new(), now, now);
        record.mark_in_progress(now, now + TimeDelta::seconds(1));

        let status = JobStatus::from(record.clone());
        assert_eq!(status.state, JobState::InProgress);
        assert!(status.result.is_none() && status.error.is_none());
        assert!(!status.is_final());

        record.mark_terminal(Outcome::Complete(json!(3)), now, TimeDelta::seconds(1));
        let status = JobStatus::from(record);
        assert_eq!(status.result, Some(json!(3)));
        assert!(status.is_final());
    }

    #[test]
    fn serialized_view() {
        let status = JobStatus {
            id: JobId::from("abc"),
            state: JobState::Failed,
            result: None,
            error: Some(JobFailure {
                cause: ErrorCause::Timeout,
                message: "timed out".to_owned(),
            }),
        };

        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({
                "id": "abc",
                "state": "failed",
                "error": {"cause": "timeout", "message": "timed out"},
            })
        );
        assert_eq!(
            serde_json::to_value(JobStatus::not_found(JobId::from("x"))).unwrap(),
            json!({"id": "x", "state": "not_found"})
        );
    }
}
