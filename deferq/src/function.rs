//! Job functions and the registry mapping function names to them.
use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::{
    job::{ArgumentError, ErrorCause, JobArgs, JobFailure, JobId},
    DeferqError,
};

/// A unit of work that can be enqueued by name.
///
/// # Example
///
/// ```
/// # use deferq::prelude::*;
/// # use std::time::Duration;
/// struct SendEmail;
///
/// #[async_trait::async_trait]
/// impl JobFunction for SendEmail {
///     type Output = String;
///     const NAME: &'static str = "send_email";
///     const TIMEOUT: Option<Duration> = Some(Duration::from_secs(15));
///
///     async fn execute(ctx: JobContext, args: JobArgs) -> Result<String, ExecutionError> {
///         let to: String = args.arg(0)?;
///         ctx.sleep(Duration::from_millis(1)).await?;
///         Ok(format!("Email sent to {to}"))
///     }
/// }
/// ```
#[async_trait]
pub trait JobFunction {
    /// The value stored as the job's result on success.
    type Output: Serialize + Send;
    /// The name jobs are enqueued under.
    ///
    /// This should be unique within a registry, it is the key stored alongside each job in the
    /// store.
    const NAME: &'static str;
    /// The maximum duration of a single execution. When [`None`] the worker's
    /// [`crate::config::WorkerConfig::job_timeout`] applies.
    const TIMEOUT: Option<Duration> = None;

    /// Checked when the job is enqueued. Rejecting the arguments here means no job is created.
    fn validate(_args: &JobArgs) -> Result<(), ArgumentError> {
        Ok(())
    }

    async fn execute(ctx: JobContext, args: JobArgs) -> Result<Self::Output, ExecutionError>;
}

/// An error returned by a job function.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The job observed an abort request. Return this (usually via [`JobContext::checkpoint`]) to
    /// have the job recorded as aborted.
    #[error("job aborted")]
    Aborted,
    #[error(transparent)]
    Arguments(#[from] ArgumentError),
    #[error("failed to encode job output: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("{message}")]
    Failed {
        error_type: String,
        message: String,
    },
}

impl ExecutionError {
    /// A failure of the given type, e.g. `ExecutionError::new("smtp", "connection refused")`.
    pub fn new(error_type: impl Into<String>, message: impl ToString) -> Self {
        Self::Failed {
            error_type: error_type.into(),
            message: message.to_string(),
        }
    }

    pub fn error_type(&self) -> &str {
        match self {
            Self::Aborted => "aborted",
            Self::Arguments(_) => "arguments",
            Self::Encode(_) => "encode",
            Self::Failed { error_type, .. } => error_type,
        }
    }
}

impl From<ExecutionError> for JobFailure {
    fn from(value: ExecutionError) -> Self {
        Self {
            cause: ErrorCause::Error(value.error_type().to_owned()),
            message: value.to_string(),
        }
    }
}

/// A type map of resources shared by every job in a worker process.
///
/// Populated before the worker starts, or by [`Lifecycle::on_startup`], and released by
/// [`Lifecycle::on_shutdown`].
#[derive(Clone, Default)]
pub struct Resources {
    inner: Arc<RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resource, replacing any previous resource of the same type.
    pub fn insert<T: Any + Send + Sync>(&self, value: T) {
        if let Ok(mut inner) = self.inner.write() {
            inner.insert(TypeId::of::<T>(), Arc::new(value));
        }
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .read()
            .ok()?
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|value| value.downcast::<T>().ok())
    }

    pub fn remove<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner
            .write()
            .ok()?
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.read().map(|inner| inner.len()).unwrap_or_default();
        f.debug_struct("Resources").field("len", &len).finish()
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Hooks ran once per worker process.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Ran before the dispatch loop starts. Returning an error aborts the worker startup.
    async fn on_startup(&self, _resources: &Resources) -> Result<(), BoxError> {
        Ok(())
    }

    /// Ran after the dispatch loop has stopped claiming jobs and in-flight jobs have finished.
    async fn on_shutdown(&self, _resources: &Resources) -> Result<(), BoxError> {
        Ok(())
    }
}

pub(crate) struct NoopLifecycle;

impl Lifecycle for NoopLifecycle {}

/// The context handed to each execution of a job function.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub function_name: String,
    pub attempt: u16,
    pub enqueued_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    abort: CancellationToken,
    resources: Resources,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        function_name: String,
        attempt: u16,
        enqueued_at: DateTime<Utc>,
        deadline: DateTime<Utc>,
        abort: CancellationToken,
        resources: Resources,
    ) -> Self {
        Self {
            job_id,
            function_name,
            attempt,
            enqueued_at,
            deadline,
            abort,
            resources,
        }
    }

    pub fn is_abort_requested(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// A cooperative cancellation point.
    ///
    /// Aborts are advisory: a job that never reaches a checkpoint runs until it returns or its
    /// deadline passes.
    pub fn checkpoint(&self) -> Result<(), ExecutionError> {
        if self.is_abort_requested() {
            Err(ExecutionError::Aborted)
        } else {
            Ok(())
        }
    }

    /// Sleep for `duration`, returning early with [`ExecutionError::Aborted`] if the job is
    /// aborted in the meantime.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ExecutionError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.abort.cancelled() => Err(ExecutionError::Aborted),
        }
    }

    /// Resolves once an abort has been requested.
    pub async fn aborted(&self) {
        self.abort.cancelled().await
    }

    pub fn resource<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.resources.get::<T>()
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }
}

type Handler = Arc<
    dyn Fn(JobContext, JobArgs) -> BoxFuture<'static, Result<Value, ExecutionError>> + Send + Sync,
>;
pub(crate) type Validator = fn(&JobArgs) -> Result<(), ArgumentError>;

#[derive(Clone)]
pub(crate) struct RegisteredFunction {
    pub(crate) timeout: Option<Duration>,
    pub(crate) validate: Validator,
    pub(crate) handler: Handler,
}

/// The set of functions a worker can execute.
///
/// ```
/// # use deferq::prelude::*;
/// # struct Cleanup;
/// # #[async_trait::async_trait]
/// # impl JobFunction for Cleanup {
/// #     type Output = ();
/// #     const NAME: &'static str = "cleanup";
/// #     async fn execute(_ctx: JobContext, _args: JobArgs) -> Result<(), ExecutionError> {
/// #         Ok(())
/// #     }
/// # }
/// let registry = Registry::new().with_function::<Cleanup>().unwrap();
/// assert!(registry.contains("cleanup"));
/// assert!(Registry::new()
///     .with_function::<Cleanup>()
///     .unwrap()
///     .with_function::<Cleanup>()
///     .is_err());
/// ```
#[derive(Clone, Default)]
pub struct Registry {
    functions: HashMap<&'static str, RegisteredFunction>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `F` under [`JobFunction::NAME`].
    ///
    /// Fails with [`DeferqError::DuplicateFunction`] when the name is already taken.
    pub fn with_function<F>(mut self) -> Result<Self, DeferqError>
    where
        F: JobFunction + 'static,
    {
        if self.functions.contains_key(F::NAME) {
            return Err(DeferqError::DuplicateFunction(F::NAME));
        }
        let handler: Handler = Arc::new(
            |ctx: JobContext, args: JobArgs| -> BoxFuture<'static, Result<Value, ExecutionError>> {
                Box::pin(async move {
                    let output = F::execute(ctx, args).await?;
                    Ok::<_, ExecutionError>(serde_json::to_value(output)?)
                })
            },
        );
        self.functions.insert(
            F::NAME,
            RegisteredFunction {
                timeout: F::TIMEOUT,
                validate: F::validate,
                handler,
            },
        );
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.functions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&RegisteredFunction> {
        self.functions.get(name)
    }

    pub(crate) fn validators(&self) -> impl Iterator<Item = (&'static str, Validator)> + '_ {
        self.functions
            .iter()
            .map(|(name, function)| (*name, function.validate))
    }

    /// The effective timeout of every function, falling back to `default`.
    pub(crate) fn timeouts(&self, default: Duration) -> Vec<(&'static str, Duration)> {
        let mut timeouts: Vec<_> = self
            .functions
            .iter()
            .map(|(name, function)| (*name, function.timeout.unwrap_or(default)))
            .collect();
        timeouts.sort_unstable_by_key(|(name, _)| *name);
        timeouts
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use assert_matches::assert_matches;
    use serde::Deserialize;

    use super::*;

    pub(crate) struct Echo;

    #[async_trait]
    impl JobFunction for Echo {
        type Output = JobArgs;
        const NAME: &'static str = "echo";

        async fn execute(_ctx: JobContext, args: JobArgs) -> Result<JobArgs, ExecutionError> {
            Ok(args)
        }
    }

    /// Behaviour driven by the `mode` keyword argument.
    pub(crate) struct Scripted;

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub(crate) enum Mode {
        Done,
        Fail,
        Panic,
        Slow,
        LoopUntilAborted,
    }

    #[async_trait]
    impl JobFunction for Scripted {
        type Output = &'static str;
        const NAME: &'static str = "scripted";
        const TIMEOUT: Option<Duration> = Some(Duration::from_millis(200));

        fn validate(args: &JobArgs) -> Result<(), ArgumentError> {
            args.required_kwarg::<Mode>("mode").map(|_| ())
        }

        async fn execute(ctx: JobContext, args: JobArgs) -> Result<&'static str, ExecutionError> {
            match args.required_kwarg::<Mode>("mode")? {
                Mode::Done => Ok("done"),
                Mode::Fail => Err(ExecutionError::new("custom", "scripted failure")),
                Mode::Panic => panic!("scripted panic"),
                Mode::Slow => {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    Ok("finished late")
                }
                Mode::LoopUntilAborted => loop {
                    ctx.checkpoint()?;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                },
            }
        }
    }

    /// Tracks how many executions run at once through a [`Concurrency`] resource.
    pub(crate) struct Tracked;

    #[derive(Default)]
    pub(crate) struct Concurrency {
        pub(crate) current: AtomicUsize,
        pub(crate) max: AtomicUsize,
        pub(crate) total: AtomicUsize,
    }

    #[async_trait]
    impl JobFunction for Tracked {
        type Output = ();
        const NAME: &'static str = "tracked";

        async fn execute(ctx: JobContext, _args: JobArgs) -> Result<(), ExecutionError> {
            let counter = ctx
                .resource::<Concurrency>()
                .ok_or_else(|| ExecutionError::new("setup", "missing Concurrency resource"))?;
            let current = counter.current.fetch_add(1, Ordering::SeqCst) + 1;
            counter.max.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            counter.current.fetch_sub(1, Ordering::SeqCst);
            counter.total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub(crate) fn test_registry() -> Registry {
        Registry::new()
            .with_function::<Echo>()
            .and_then(Registry::with_function::<Scripted>)
            .and_then(Registry::with_function::<Tracked>)
            .unwrap()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = Registry::new()
            .with_function::<Echo>()
            .and_then(Registry::with_function::<Echo>);

        assert_matches!(result, Err(DeferqError::DuplicateFunction("echo")));
    }

    #[test]
    fn timeouts_fall_back_to_default() {
        let registry = test_registry();
        let timeouts = registry.timeouts(Duration::from_secs(300));

        assert_eq!(
            timeouts,
            vec![
                ("echo", Duration::from_secs(300)),
                ("scripted", Duration::from_millis(200)),
                ("tracked", Duration::from_secs(300)),
            ]
        );
    }

    #[test]
    fn resources_round_trip_by_type() {
        let resources = Resources::new();
        resources.insert(42_u32);
        resources.insert("name".to_owned());

        assert_eq!(resources.get::<u32>().as_deref(), Some(&42));
        assert_eq!(resources.get::<String>().as_deref().map(String::as_str), Some("name"));
        assert!(resources.get::<u64>().is_none());
        assert!(resources.remove::<u32>().is_some());
        assert!(resources.get::<u32>().is_none());
    }

    #[tokio::test]
    async fn context_sleep_returns_early_on_abort() {
        let token = CancellationToken::new();
        let ctx = JobContext::new(
            JobId::generate(),
            Echo::NAME.to_owned(),
            1,
            Utc::now(),
            Utc::now(),
            token.clone(),
            Resources::new(),
        );
        assert!(ctx.checkpoint().is_ok());

        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), ctx.sleep(Duration::from_secs(60)))
            .await
            .expect("sleep should observe the abort");
        assert_matches!(result, Err(ExecutionError::Aborted));
        assert_matches!(ctx.checkpoint(), Err(ExecutionError::Aborted));
    }

    #[tokio::test]
    async fn handler_serializes_output() {
        let registry = test_registry();
        let function = registry.get(Echo::NAME).unwrap();
        let args = JobArgs::new().with_kwarg("x", 1).unwrap();
        let ctx = JobContext::new(
            JobId::generate(),
            Echo::NAME.to_owned(),
            1,
            Utc::now(),
            Utc::now(),
            CancellationToken::new(),
            Resources::new(),
        );

        let value = (function.handler)(ctx, args).await.unwrap();

        assert_eq!(value, serde_json::json!({"args": [], "kwargs": {"x": 1}}));
    }
}
