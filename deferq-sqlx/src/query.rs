use chrono::{DateTime, Utc};
use deferq::store::Query;
use sqlx::{Postgres, QueryBuilder};

use crate::types::JobState;

pub(crate) const JOB_COLUMNS: &str = "id, function_name, args, state, attempt, enqueued_at, \
    run_at, attempt_started_at, deadline, finished_at, expires_at, result, error, abort_requested";

pub(crate) trait ToQuery {
    fn query<'a>(&'a self, queue: &'a str, now: DateTime<Utc>) -> QueryBuilder<'a, Postgres>;
}

impl ToQuery for Query<'_> {
    fn query<'a>(&'a self, queue: &'a str, now: DateTime<Utc>) -> QueryBuilder<'a, Postgres> {
        let mut builder = QueryBuilder::new("SELECT ");
        builder.push(JOB_COLUMNS);
        builder.push(" FROM deferq_jobs WHERE queue = ");
        builder.push_bind(queue);
        builder.push(" AND (expires_at IS NULL OR expires_at > ");
        builder.push_bind(now);
        builder.push(") AND");
        handle_query(&mut builder, self);
        builder.push(" ORDER BY enqueued_at DESC");
        builder
    }
}

fn handle_query<'a>(builder: &mut QueryBuilder<'a, Postgres>, query: &'a Query<'_>) {
    match query {
        Query::Not(inner) => {
            builder.push(" NOT");
            handle_query(builder, inner);
        }
        Query::And(queries) => join(builder, queries, " AND", " TRUE"),
        Query::Or(queries) => join(builder, queries, " OR", " FALSE"),
        Query::IdEquals(id) => {
            builder.push(" id = ");
            builder.push_bind(id.as_str());
        }
        Query::FunctionEqual(function_name) => {
            builder.push(" function_name = ");
            builder.push_bind(*function_name);
        }
        Query::StateEqual(state) => match JobState::stored(*state) {
            Some(state) => {
                builder.push(" state = ");
                builder.push_bind(state);
            }
            None => {
                builder.push(" FALSE");
            }
        },
        Query::ArgsEqual(args) => {
            builder.push(" args = ");
            builder.push_bind(sqlx::types::Json(args));
        }
        Query::RunAtBefore(run_at) => {
            builder.push(" run_at < ");
            builder.push_bind(*run_at);
        }
        Query::RunAtAfter(run_at) => {
            builder.push(" run_at > ");
            builder.push_bind(*run_at);
        }
        Query::RunAtEqual(run_at) => {
            builder.push(" run_at = ");
            builder.push_bind(*run_at);
        }
    }
}

fn join<'a>(
    builder: &mut QueryBuilder<'a, Postgres>,
    queries: &'a [Query<'_>],
    separator: &str,
    empty: &str,
) {
    let Some((last, elements)) = queries.split_last() else {
        builder.push(empty);
        return;
    };
    builder.push(" (");
    elements.iter().for_each(|query| {
        handle_query(builder, query);
        builder.push(separator);
    });
    handle_query(builder, last);
    builder.push(")");
}

#[cfg(test)]
mod test {
    use deferq::job::{JobArgs, JobId};

    use super::*;

    const SELECT: &str = "SELECT id, function_name, args, state, attempt, enqueued_at, run_at, \
        attempt_started_at, deadline, finished_at, expires_at, result, error, abort_requested \
        FROM deferq_jobs WHERE queue = $1 AND (expires_at IS NULL OR expires_at > $2) AND";

    #[test]
    fn to_query_for_query_test() {
        let query = Query::And(vec![
            Query::FunctionEqual("process_data"),
            Query::Or(vec![
                Query::StateEqual(deferq::job::JobState::Queued),
                Query::StateEqual(deferq::job::JobState::Deferred),
            ]),
            Query::Not(Box::new(Query::RunAtAfter(Utc::now()))),
        ]);

        assert_eq!(
            query.query("deferq:queue", Utc::now()).into_sql(),
            format!(
                "{SELECT} ( function_name = $3 AND ( state = $4 OR state = $5) AND NOT \
                run_at > $6) ORDER BY enqueued_at DESC"
            )
        );
    }

    #[test]
    fn empty_queries() {
        assert_eq!(
            Query::all().query("deferq:queue", Utc::now()).into_sql(),
            format!("{SELECT} TRUE ORDER BY enqueued_at DESC")
        );
        assert_eq!(
            Query::Or(vec![]).query("deferq:queue", Utc::now()).into_sql(),
            format!("{SELECT} FALSE ORDER BY enqueued_at DESC")
        );
    }

    #[test]
    fn unstored_state_matches_nothing() {
        let id = JobId::from("job");
        let query = Query::And(vec![
            Query::IdEquals(&id),
            Query::StateEqual(deferq::job::JobState::NotFound),
            Query::ArgsEqual(JobArgs::new()),
        ]);

        assert_eq!(
            query.query("deferq:queue", Utc::now()).into_sql(),
            format!("{SELECT} ( id = $3 AND FALSE AND args = $4) ORDER BY enqueued_at DESC")
        );
    }
}
