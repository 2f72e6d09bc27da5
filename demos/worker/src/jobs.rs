use std::time::Duration;

use async_trait::async_trait;
use deferq::{
    function::BoxError,
    job::ArgumentError,
    prelude::*,
};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

/// A parameter given either by position or by name.
fn param<T: DeserializeOwned>(args: &JobArgs, index: usize, name: &str) -> Result<T, ArgumentError> {
    match args.kwarg(name)? {
        Some(value) => Ok(value),
        None => args.arg(index),
    }
}

pub struct SendEmail;

#[async_trait]
impl JobFunction for SendEmail {
    type Output = String;
    const NAME: &'static str = "send_email";
    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(15));

    fn validate(args: &JobArgs) -> Result<(), ArgumentError> {
        param::<String>(args, 0, "to")?;
        param::<String>(args, 1, "subject")?;
        param::<String>(args, 2, "body")?;
        Ok(())
    }

    async fn execute(ctx: JobContext, args: JobArgs) -> Result<String, ExecutionError> {
        let to: String = param(&args, 0, "to")?;
        let subject: String = param(&args, 1, "subject")?;
        ctx.sleep(Duration::from_secs(2)).await?;

        let result = format!("Email sent to {to} with subject '{subject}'");
        tracing::info!(job_id = %ctx.job_id, "{result}");
        Ok(result)
    }
}

pub struct ProcessData;

#[async_trait]
impl JobFunction for ProcessData {
    type Output = Value;
    const NAME: &'static str = "process_data";
    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(60));

    fn validate(args: &JobArgs) -> Result<(), ArgumentError> {
        param::<Value>(args, 0, "data").map(|_| ())
    }

    async fn execute(ctx: JobContext, args: JobArgs) -> Result<Value, ExecutionError> {
        let data: Value = param(&args, 0, "data")?;
        ctx.sleep(Duration::from_secs(1)).await?;

        tracing::info!(job_id = %ctx.job_id, "Data processed: {data}");
        Ok(json!({
            "original": data,
            "processed_at": "2025-08-31T00:00:00Z",
            "status": "completed",
        }))
    }
}

pub struct LongRunningTask;

#[async_trait]
impl JobFunction for LongRunningTask {
    type Output = String;
    const NAME: &'static str = "long_running_task";
    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(300));

    async fn execute(ctx: JobContext, args: JobArgs) -> Result<String, ExecutionError> {
        let duration: u64 = match param(&args, 0, "duration") {
            Ok(duration) => duration,
            Err(ArgumentError::MissingPositional(_)) => 10,
            Err(error) => return Err(error.into()),
        };
        tracing::info!(job_id = %ctx.job_id, "Starting long running task for {duration} seconds");

        for i in 1..=duration {
            ctx.sleep(Duration::from_secs(1)).await?;
            tracing::info!(job_id = %ctx.job_id, "Task progress: {i}/{duration}");
        }

        let result = format!("Long running task completed after {duration} seconds");
        tracing::info!(job_id = %ctx.job_id, "{result}");
        Ok(result)
    }
}

pub struct DailyCleanup;

#[async_trait]
impl JobFunction for DailyCleanup {
    type Output = ();
    const NAME: &'static str = "daily_cleanup";

    async fn execute(ctx: JobContext, _args: JobArgs) -> Result<(), ExecutionError> {
        tracing::info!("Running daily cleanup...");
        ctx.sleep(Duration::from_secs(1)).await?;
        tracing::info!("Daily cleanup completed");
        Ok(())
    }
}

pub struct Hooks;

#[async_trait]
impl Lifecycle for Hooks {
    async fn on_startup(&self, _resources: &Resources) -> Result<(), BoxError> {
        tracing::info!("Worker starting up...");
        Ok(())
    }

    async fn on_shutdown(&self, _resources: &Resources) -> Result<(), BoxError> {
        tracing::info!("Worker shutting down...");
        Ok(())
    }
}

pub fn registry() -> Result<Registry, DeferqError> {
    Registry::new()
        .with_function::<SendEmail>()?
        .with_function::<ProcessData>()?
        .with_function::<LongRunningTask>()?
        .with_function::<DailyCleanup>()
}
