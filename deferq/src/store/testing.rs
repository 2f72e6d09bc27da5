//! Test suite for ensuring a correct implementation of a store.
use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;

use crate::job::{ErrorCause, JobArgs, JobFailure, JobId, JobRecord, JobState, Outcome};

use super::{Claimable, Query, Store, StoreError};

const DEFAULT_FUNCTION: &str = "function";
const TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_RESULT: TimeDelta = TimeDelta::hours(1);

impl JobRecord {
    #[doc(hidden)]
    pub fn mock_job() -> Self {
        let now = Utc::now();
        Self::new(
            JobId::generate(),
            DEFAULT_FUNCTION,
            JobArgs::default(),
            now,
            now,
        )
    }

    #[doc(hidden)]
    pub fn with_function(self, function_name: impl Into<String>) -> Self {
        Self {
            function_name: function_name.into(),
            ..self
        }
    }

    #[doc(hidden)]
    pub fn with_run_at(self, run_at: DateTime<Utc>) -> Self {
        let state = if run_at > self.enqueued_at {
            JobState::Deferred
        } else {
            JobState::Queued
        };
        Self {
            run_at,
            state,
            ..self
        }
    }

    #[doc(hidden)]
    pub fn with_enqueued_at(self, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            enqueued_at,
            ..self
        }
    }
}

/// Create test suite for a deferq store.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use deferq::test_suite;
/// use deferq::store::memory::InMemoryStore;
/// test_suite!(for: InMemoryStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use deferq::test_suite;
/// test_suite!(
///     attr: sqlx::test(migrations = "./migrations"),
///     args: (pool: PgPool),
///     store: StoreImplementation::from_pool(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        $crate::test_suite!(@tests attr: $attr, args: $args, store: $store, tests: [
            put_and_get,
            put_duplicate_id,
            get_unknown,
            claim_empty,
            claim_respects_run_at,
            claim_orders_by_run_at_then_enqueued_at,
            claim_only_given_functions,
            claim_sets_deadline_and_attempt,
            concurrent_claims_are_exclusive,
            mark_terminal_complete,
            mark_terminal_failed,
            mark_terminal_aborted,
            mark_terminal_is_final,
            mark_terminal_requires_in_progress,
            mark_terminal_not_found,
            request_abort,
            request_abort_terminal,
            expired_results_are_absent,
            expire_terminal_older_than,
            fail_overdue,
            next_run_at,
            query,
        ]);
    };
    (@tests attr: $attr:meta, args: $args:tt, store: $store:expr, tests: [$($test:ident),* $(,)?]) => {
        $(
            #[$attr]
            async fn $test $args {
                let store = $store;
                $crate::store::testing::$test(store).await;
            }
        )*
    };
}

fn claimable() -> [Claimable<'static>; 1] {
    [Claimable::new(DEFAULT_FUNCTION, TIMEOUT)]
}

fn complete() -> Outcome {
    Outcome::Complete(json!({"status": "completed"}))
}

fn failure() -> JobFailure {
    JobFailure {
        cause: ErrorCause::Error("custom".to_owned()),
        message: "Error Message".to_owned(),
    }
}

async fn claim_one(store: &impl Store) -> JobRecord {
    store
        .claim_next_ready(Utc::now(), &claimable())
        .await
        .unwrap()
        .expect("a job should be ready")
}

#[doc(hidden)]
pub async fn put_and_get(store: impl Store) {
    let job = JobRecord::mock_job()
        .with_function("another_function")
        .with_run_at(Utc::now() + TimeDelta::minutes(5));
    let id = job.id.clone();

    store.put(job).await.unwrap();

    let stored = store.get(&id).await.unwrap().expect("job should be stored");
    assert_eq!(stored.id, id);
    assert_eq!(stored.function_name, "another_function");
    assert_eq!(stored.state, JobState::Deferred);
    assert_eq!(stored.attempt, 0);
    assert!(stored.deadline.is_none());
    assert!(!stored.abort_requested);
}

#[doc(hidden)]
pub async fn put_duplicate_id(store: impl Store) {
    let job = JobRecord::mock_job();
    let duplicate = JobRecord::mock_job();
    let duplicate = JobRecord {
        id: job.id.clone(),
        ..duplicate
    };
    store.put(job).await.unwrap();

    assert!(matches!(
        store.put(duplicate).await,
        Err(StoreError::JobExists(_))
    ));
}

#[doc(hidden)]
pub async fn get_unknown(store: impl Store) {
    assert!(store.get(&JobId::generate()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_empty(store: impl Store) {
    assert!(store
        .claim_next_ready(Utc::now(), &claimable())
        .await
        .unwrap()
        .is_none());
}

#[doc(hidden)]
pub async fn claim_respects_run_at(store: impl Store) {
    let now = Utc::now();
    let run_at = now + TimeDelta::seconds(30);
    let job = JobRecord::mock_job().with_run_at(run_at);
    let id = job.id.clone();
    store.put(job).await.unwrap();

    assert!(store
        .claim_next_ready(run_at - TimeDelta::milliseconds(1), &claimable())
        .await
        .unwrap()
        .is_none());

    let claimed = store
        .claim_next_ready(run_at, &claimable())
        .await
        .unwrap()
        .expect("job should be ready at its run_at");
    assert_eq!(claimed.id, id);
}

#[doc(hidden)]
pub async fn claim_orders_by_run_at_then_enqueued_at(store: impl Store) {
    let now = Utc::now();
    let earlier = now - TimeDelta::seconds(10);
    let later = JobRecord::mock_job()
        .with_enqueued_at(earlier)
        .with_run_at(now - TimeDelta::seconds(1));
    let first = JobRecord::mock_job()
        .with_enqueued_at(earlier + TimeDelta::seconds(1))
        .with_run_at(now - TimeDelta::seconds(5));
    let second = JobRecord::mock_job()
        .with_enqueued_at(earlier + TimeDelta::seconds(2))
        .with_run_at(now - TimeDelta::seconds(5));
    let expected = [first.id.clone(), second.id.clone(), later.id.clone()];

    store.put(second).await.unwrap();
    store.put(later).await.unwrap();
    store.put(first).await.unwrap();

    let claimed = [
        claim_one(&store).await.id,
        claim_one(&store).await.id,
        claim_one(&store).await.id,
    ];
    assert_eq!(claimed, expected);
}

#[doc(hidden)]
pub async fn claim_only_given_functions(store: impl Store) {
    let other = JobRecord::mock_job().with_function("another_function");
    let other_id = other.id.clone();
    store.put(other).await.unwrap();

    assert!(store
        .claim_next_ready(Utc::now(), &claimable())
        .await
        .unwrap()
        .is_none());

    let claimed = store
        .claim_next_ready(
            Utc::now(),
            &[Claimable::new("another_function", TIMEOUT)],
        )
        .await
        .unwrap()
        .expect("job should be claimable for its own function");
    assert_eq!(claimed.id, other_id);
}

#[doc(hidden)]
pub async fn claim_sets_deadline_and_attempt(store: impl Store) {
    let job = JobRecord::mock_job();
    let id = job.id.clone();
    store.put(job).await.unwrap();
    let now = Utc::now();

    let claimed = store
        .claim_next_ready(
            now,
            &[Claimable::new(DEFAULT_FUNCTION, Duration::from_secs(15))],
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(claimed.state, JobState::InProgress);
    assert_eq!(claimed.attempt, 1);
    let started = claimed.attempt_started_at.unwrap();
    assert!((started - now).abs() < TimeDelta::milliseconds(1));
    let timeout = claimed.deadline.unwrap() - started;
    assert!((timeout - TimeDelta::seconds(15)).abs() < TimeDelta::milliseconds(1));

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::InProgress);
    assert!(store
        .claim_next_ready(Utc::now(), &claimable())
        .await
        .unwrap()
        .is_none());
}

#[doc(hidden)]
pub async fn concurrent_claims_are_exclusive(store: impl Store) {
    const JOBS: usize = 40;
    const CLAIMERS: usize = 8;
    for _ in 0..JOBS {
        store.put(JobRecord::mock_job()).await.unwrap();
    }

    let handles: Vec<_> = (0..CLAIMERS)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(job) = store
                    .claim_next_ready(Utc::now(), &claimable())
                    .await
                    .unwrap()
                {
                    claimed.push(job.id);
                    tokio::task::yield_now().await;
                }
                claimed
            })
        })
        .collect();

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }
    let unique: HashSet<_> = all.iter().cloned().collect();
    assert_eq!(all.len(), JOBS);
    assert_eq!(unique.len(), JOBS);
}

#[doc(hidden)]
pub async fn mark_terminal_complete(store: impl Store) {
    store.put(JobRecord::mock_job()).await.unwrap();
    let id = claim_one(&store).await.id;

    store.mark_terminal(&id, complete(), KEEP_RESULT).await.unwrap();

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Complete);
    assert_eq!(stored.result, Some(json!({"status": "completed"})));
    assert!(stored.error.is_none());
    assert!(stored.finished_at.is_some());
    assert_eq!(
        stored.expires_at.unwrap() - stored.finished_at.unwrap(),
        KEEP_RESULT
    );
}

#[doc(hidden)]
pub async fn mark_terminal_failed(store: impl Store) {
    store.put(JobRecord::mock_job()).await.unwrap();
    let id = claim_one(&store).await.id;

    store
        .mark_terminal(&id, Outcome::Failed(failure()), KEEP_RESULT)
        .await
        .unwrap();

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.error, Some(failure()));
    assert!(stored.result.is_none());
}

#[doc(hidden)]
pub async fn mark_terminal_aborted(store: impl Store) {
    store.put(JobRecord::mock_job()).await.unwrap();
    let id = claim_one(&store).await.id;

    store
        .mark_terminal(&id, Outcome::Aborted, KEEP_RESULT)
        .await
        .unwrap();

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Aborted);
    assert!(stored.result.is_none());
    assert!(stored.error.is_none());
}

#[doc(hidden)]
pub async fn mark_terminal_is_final(store: impl Store) {
    store.put(JobRecord::mock_job()).await.unwrap();
    let id = claim_one(&store).await.id;
    store.mark_terminal(&id, complete(), KEEP_RESULT).await.unwrap();

    assert!(matches!(
        store
            .mark_terminal(&id, Outcome::Failed(failure()), KEEP_RESULT)
            .await,
        Err(StoreError::InvalidTransition {
            from: JobState::Complete,
            to: JobState::Failed,
            ..
        })
    ));

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Complete);
    assert_eq!(stored.result, Some(json!({"status": "completed"})));
    assert!(stored.error.is_none());
}

#[doc(hidden)]
pub async fn mark_terminal_requires_in_progress(store: impl Store) {
    let job = JobRecord::mock_job();
    let id = job.id.clone();
    store.put(job).await.unwrap();

    assert!(matches!(
        store.mark_terminal(&id, complete(), KEEP_RESULT).await,
        Err(StoreError::InvalidTransition {
            from: JobState::Queued,
            ..
        })
    ));
    assert_eq!(store.get(&id).await.unwrap().unwrap().state, JobState::Queued);
}

#[doc(hidden)]
pub async fn mark_terminal_not_found(store: impl Store) {
    assert!(matches!(
        store
            .mark_terminal(&JobId::generate(), complete(), KEEP_RESULT)
            .await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn request_abort(store: impl Store) {
    let queued = JobRecord::mock_job();
    let queued_id = queued.id.clone();
    let untouched = JobRecord::mock_job().with_run_at(Utc::now() + TimeDelta::hours(1));
    let untouched_id = untouched.id.clone();
    store.put(queued).await.unwrap();
    store.put(untouched).await.unwrap();

    assert!(store.request_abort(&queued_id).await.unwrap());
    assert!(!store.request_abort(&JobId::generate()).await.unwrap());

    let flagged = store
        .abort_requested(&[queued_id.clone(), untouched_id, JobId::generate()])
        .await
        .unwrap();
    assert_eq!(flagged, vec![queued_id.clone()]);

    let claimed = claim_one(&store).await;
    assert_eq!(claimed.id, queued_id);
    assert!(claimed.abort_requested);
}

#[doc(hidden)]
pub async fn request_abort_terminal(store: impl Store) {
    store.put(JobRecord::mock_job()).await.unwrap();
    let id = claim_one(&store).await.id;
    store.mark_terminal(&id, complete(), KEEP_RESULT).await.unwrap();

    assert!(!store.request_abort(&id).await.unwrap());
    assert!(!store.get(&id).await.unwrap().unwrap().abort_requested);
}

#[doc(hidden)]
pub async fn expired_results_are_absent(store: impl Store) {
    store.put(JobRecord::mock_job()).await.unwrap();
    let id = claim_one(&store).await.id;

    store
        .mark_terminal(&id, complete(), TimeDelta::zero())
        .await
        .unwrap();

    assert!(store.get(&id).await.unwrap().is_none());

    let mut reused = JobRecord::mock_job();
    reused.id = id.clone();
    store.put(reused).await.unwrap();
    assert_eq!(store.get(&id).await.unwrap().unwrap().state, JobState::Queued);
}

#[doc(hidden)]
pub async fn expire_terminal_older_than(store: impl Store) {
    let pending = JobRecord::mock_job().with_run_at(Utc::now() + TimeDelta::hours(1));
    let pending_id = pending.id.clone();
    store.put(pending).await.unwrap();
    store.put(JobRecord::mock_job()).await.unwrap();
    store.put(JobRecord::mock_job()).await.unwrap();
    let first = claim_one(&store).await.id;
    let second = claim_one(&store).await.id;
    store.mark_terminal(&first, complete(), KEEP_RESULT).await.unwrap();

    let now = Utc::now();
    assert_eq!(
        store
            .expire_terminal_older_than(KEEP_RESULT, now)
            .await
            .unwrap(),
        0
    );

    let expired = store
        .expire_terminal_older_than(KEEP_RESULT, now + KEEP_RESULT + TimeDelta::seconds(1))
        .await
        .unwrap();

    assert_eq!(expired, 1);
    assert!(store.get(&first).await.unwrap().is_none());
    assert_eq!(
        store.get(&second).await.unwrap().unwrap().state,
        JobState::InProgress
    );
    assert!(store.get(&pending_id).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn fail_overdue(store: impl Store) {
    let queued = JobRecord::mock_job().with_run_at(Utc::now() + TimeDelta::hours(1));
    let queued_id = queued.id.clone();
    store.put(queued).await.unwrap();
    store.put(JobRecord::mock_job()).await.unwrap();
    store.put(JobRecord::mock_job()).await.unwrap();
    let overdue = claim_one(&store).await.id;
    let complete_id = claim_one(&store).await.id;
    store
        .mark_terminal(&complete_id, complete(), KEEP_RESULT)
        .await
        .unwrap();

    let before_deadline = Utc::now() + TimeDelta::seconds(30);
    assert_eq!(
        store.fail_overdue(before_deadline, KEEP_RESULT).await.unwrap(),
        0
    );

    let after_deadline = Utc::now() + TimeDelta::seconds(61);
    assert_eq!(
        store.fail_overdue(after_deadline, KEEP_RESULT).await.unwrap(),
        1
    );

    let stored = store.get(&overdue).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Failed);
    assert_eq!(stored.error, Some(JobFailure::overdue()));
    assert!(stored.result.is_none());
    assert!(matches!(
        store.mark_terminal(&overdue, complete(), KEEP_RESULT).await,
        Err(StoreError::InvalidTransition { .. })
    ));
    assert_eq!(
        store.get(&complete_id).await.unwrap().unwrap().state,
        JobState::Complete
    );
    assert_eq!(
        store.get(&queued_id).await.unwrap().unwrap().state,
        JobState::Deferred
    );
}

#[doc(hidden)]
pub async fn next_run_at(store: impl Store) {
    let now = Utc::now();
    assert!(store
        .next_run_at(&[DEFAULT_FUNCTION])
        .await
        .unwrap()
        .is_none());

    let soon = now + TimeDelta::seconds(5);
    store
        .put(JobRecord::mock_job().with_run_at(now + TimeDelta::minutes(5)))
        .await
        .unwrap();
    store
        .put(JobRecord::mock_job().with_run_at(soon))
        .await
        .unwrap();
    store
        .put(
            JobRecord::mock_job()
                .with_function("another_function")
                .with_run_at(now + TimeDelta::seconds(1)),
        )
        .await
        .unwrap();

    let next = store
        .next_run_at(&[DEFAULT_FUNCTION])
        .await
        .unwrap()
        .unwrap();
    assert!((next - soon).abs() < TimeDelta::milliseconds(1));
}

#[doc(hidden)]
pub async fn query(store: impl Store) {
    store
        .put(JobRecord::mock_job().with_function("another_function"))
        .await
        .unwrap();
    store.put(JobRecord::mock_job()).await.unwrap();
    store
        .put(JobRecord::mock_job().with_run_at(Utc::now() + TimeDelta::hours(1)))
        .await
        .unwrap();

    assert_eq!(store.query(Query::all()).await.unwrap().len(), 3);
    assert_eq!(
        store
            .query(Query::FunctionEqual(DEFAULT_FUNCTION))
            .await
            .unwrap()
            .len(),
        2
    );
    assert_eq!(
        store
            .query(Query::And(vec![
                Query::FunctionEqual(DEFAULT_FUNCTION),
                Query::StateEqual(JobState::Deferred),
            ]))
            .await
            .unwrap()
            .len(),
        1
    );
    assert_eq!(
        store
            .query(Query::Not(Box::new(Query::FunctionEqual(DEFAULT_FUNCTION))))
            .await
            .unwrap()
            .len(),
        1
    );
}
