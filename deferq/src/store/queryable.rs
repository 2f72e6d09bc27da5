use crate::job::JobRecord;

use super::Query;

pub(super) trait Queryable {
    fn matches(&self, record: &JobRecord) -> bool;
}

impl<'a> Queryable for Query<'a> {
    fn matches(&self, record: &JobRecord) -> bool {
        match self {
            Query::Not(inner) => !inner.matches(record),
            Query::And(inner) => inner.iter().all(|query| query.matches(record)),
            Query::Or(inner) => inner.iter().any(|query| query.matches(record)),
            Query::IdEquals(id) => record.id == **id,
            Query::FunctionEqual(function_name) => record.function_name == *function_name,
            Query::StateEqual(state) => record.state == *state,
            Query::ArgsEqual(args) => record.args == *args,
            Query::RunAtBefore(run_at) => record.run_at < *run_at,
            Query::RunAtAfter(run_at) => record.run_at > *run_at,
            Query::RunAtEqual(run_at) => record.run_at == *run_at,
        }
    }
}

#[cfg(test)]
mod test {
    use std::ops::{Add, Sub};

    use chrono::{TimeDelta, Utc};

    use crate::job::{JobArgs, JobId, JobState};

    use super::*;

    #[test]
    fn query_matches() {
        let now = Utc::now();
        let record = JobRecord::new(JobId::generate(), "echo", JobArgs::new(), now, now);

        let matching_queries = [
            Query::IdEquals(&record.id),
            Query::FunctionEqual("echo"),
            Query::StateEqual(JobState::Queued),
            Query::ArgsEqual(JobArgs::new()),
            Query::RunAtEqual(record.run_at),
            Query::RunAtBefore(record.run_at.add(TimeDelta::hours(1))),
            Query::RunAtAfter(record.run_at.sub(TimeDelta::hours(1))),
            Query::all(),
        ];

        matching_queries
            .clone()
            .into_iter()
            .for_each(|query| assert!(query.matches(&record)));

        matching_queries
            .clone()
            .into_iter()
            .map(|query| Query::Not(Box::new(query)))
            .for_each(|query| assert!(!query.matches(&record)));

        assert!(Query::And(matching_queries.to_vec()).matches(&record));
        assert!(Query::Or(matching_queries.to_vec()).matches(&record));

        let other_id = JobId::generate();
        let non_matching_queries = [
            Query::IdEquals(&other_id),
            Query::FunctionEqual("another_function"),
            Query::StateEqual(JobState::Complete),
            Query::RunAtEqual(record.run_at.add(TimeDelta::seconds(1))),
            Query::RunAtBefore(record.run_at),
            Query::RunAtAfter(record.run_at),
        ];

        non_matching_queries
            .clone()
            .into_iter()
            .for_each(|query| assert!(!query.matches(&record)));

        assert!(!Query::And(non_matching_queries.to_vec()).matches(&record));
        assert!(!Query::Or(non_matching_queries.to_vec()).matches(&record));
        assert!(!Query::And(vec![
            matching_queries[0].clone(),
            non_matching_queries[0].clone()
        ])
        .matches(&record));
    }
}
