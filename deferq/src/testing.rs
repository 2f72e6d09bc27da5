//! Helpers for testing code that enqueues jobs.

/// A macro for making assertions about what jobs have been enqueued.
///
/// Assertions can be based on the arguments, function, state and `run_at` of the jobs in a
/// store. Without a count the macro asserts at least one job matches.
///
/// # Example
///
/// ```
/// # use deferq::prelude::*;
/// # use deferq::assert_enqueued;
/// # use chrono::{Utc, TimeDelta};
/// # use std::time::Duration;
/// # pub(crate) struct SendEmail;
/// #
/// # #[async_trait::async_trait]
/// # impl JobFunction for SendEmail {
/// #     type Output = ();
/// #     const NAME: &'static str = "send_email";
/// #     async fn execute(_ctx: JobContext, _args: JobArgs) -> Result<(), ExecutionError> {
/// #         Ok(())
/// #     }
/// # }
/// # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
/// use deferq::store::memory::InMemoryStore;
/// let store = InMemoryStore::new().paused();
/// let registry = Registry::new().with_function::<SendEmail>().unwrap();
/// let client = Client::new(store.clone(), &registry);
///
/// client
///     .job("send_email")
///     .with_arg("user@example.com")
///     .defer_by(Duration::from_secs(300))
///     .enqueue()
///     .await
///     .unwrap();
///
/// assert_enqueued!(
///     to: store,
///     with_args: JobArgs::new().with_arg("user@example.com").unwrap(),
///     for_function: SendEmail
/// );
///
/// assert_enqueued!(
///     1 job,
///     to: store,
///     run_after: Utc::now(),
///     in_state: JobState::Deferred,
///     for_function: "send_email"
/// );
///
/// assert_enqueued!(
///     0 jobs,
///     to: store,
///     run_before: Utc::now(),
///     for_function: SendEmail
/// );
/// # });
/// ```
#[macro_export]
macro_rules! assert_enqueued {
    (1 job, to: $store:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal 1 to: $store, $($tail)*);
    };
    ($n:literal jobs, to: $store:ident, $($tail:tt)*) => {
        $crate::assert_enqueued!(@internal $n to: $store, $($tail)*);
    };
    (to: $store:ident, $($tail:tt)*) => {{
        use $crate::store::{Query, Store};
        let mut queries = Vec::new();
        $crate::assert_enqueued!(@query queries; $($tail)*);
        let jobs = $store.query(Query::And(queries)).await.unwrap();
        let all_jobs = $store.query(Query::all()).await.unwrap();
        assert!(
            !jobs.is_empty(),
            "No jobs enqueued {}\n\nAll enqueued jobs:\n{all_jobs:#?}",
            stringify!($($tail)*)
        );
    }};
    (@internal $n:literal to: $store:ident, $($tail:tt)*) => {{
        use $crate::store::{Query, Store};
        let mut queries = Vec::new();
        $crate::assert_enqueued!(@query queries; $($tail)*);
        let jobs = $store.query(Query::And(queries)).await.unwrap();
        let all_jobs = $store.query(Query::all()).await.unwrap();
        assert!(
            jobs.len() == $n,
            "Unexpected number of jobs enqueued {},\n\n\
            Expected {} jobs, found {} matching job enqueued:\n\n\
            Matching jobs:\n\
            {jobs:#?}\n\n\
            All enqueued jobs:\n\
            {all_jobs:#?}",
            stringify!($($tail)*),
            $n,
            jobs.len(),
        );
    }};
    (@query $vec:ident;) => {};
    (@query $vec:ident; with_args: $args:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::ArgsEqual($args));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; in_state: $state:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::StateEqual($state));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; run_at: $run_at:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::RunAtEqual($run_at));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; run_after: $run_after:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::RunAtAfter($run_after));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; run_before: $run_before:expr $(, $($tail:tt)*)?) => {
        $vec.push(Query::RunAtBefore($run_before));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; for_function: $function:literal $(, $($tail:tt)*)?) => {
        $vec.push(Query::FunctionEqual($function));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
    (@query $vec:ident; for_function: $function:path $(, $($tail:tt)*)?) => {
        $vec.push(Query::FunctionEqual(<$function as $crate::function::JobFunction>::NAME));
        $($crate::assert_enqueued!(@query $vec; $($tail)*))?
    };
}

#[cfg(test)]
mod test {
    use chrono::{TimeDelta, Utc};

    use crate::{
        client::Client,
        function::test::{test_registry, Echo, Scripted},
        job::{JobArgs, JobState},
        store::memory::InMemoryStore,
    };

    #[tokio::test]
    async fn assert_enqueued() {
        let store = InMemoryStore::new().paused();
        let client = Client::new(store.clone(), &test_registry());
        let run_at = Utc::now() + TimeDelta::minutes(5);

        client
            .job("echo")
            .with_arg("data")
            .defer_until(run_at)
            .enqueue()
            .await
            .unwrap();
        client
            .job("scripted")
            .with_kwarg("mode", "done")
            .enqueue()
            .await
            .unwrap();

        assert_enqueued!(
            1 job,
            to: store,
            with_args: JobArgs::new().with_arg("data").unwrap(),
            for_function: Echo
        );
        assert_enqueued!(
            to: store,
            with_args: JobArgs::new().with_arg("data").unwrap(),
            for_function: "echo",
        );
        assert_enqueued!(to: store, run_at: run_at, for_function: Echo);
        assert_enqueued!(to: store, run_after: Utc::now(), in_state: JobState::Deferred);
        assert_enqueued!(
            1 job,
            to: store,
            run_before: Utc::now() + TimeDelta::seconds(1),
            in_state: JobState::Queued,
            for_function: Scripted,
        );
        assert_enqueued!(
            0 jobs,
            to: store,
            with_args: JobArgs::new().with_arg("other").unwrap(),
            for_function: Echo
        );
    }
}
