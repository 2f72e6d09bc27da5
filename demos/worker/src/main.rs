use std::time::Duration;

use deferq::{
    function::BoxError,
    prelude::*,
    store::{memory::InMemoryStore, Store},
};
use deferq_sqlx::PgStore;
use serde::Deserialize;
use serde_json::json;
use tracing_subscriber::EnvFilter;

mod jobs;

const CONFIG_PATH: &str = "DEFERQ_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "deferq.toml";
const DATABASE_URL: &str = "DATABASE_URL";

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DemoConfig {
    worker: WorkerConfig,
    store: StoreConfig,
}

#[derive(Debug, Default, Deserialize)]
struct StoreConfig {
    url: Option<String>,
}

impl DemoConfig {
    fn load() -> Result<Self, BoxError> {
        let path = std::env::var(CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<Self>(&contents)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!("No configuration at {path}, using defaults");
                Self::default()
            }
            Err(error) => return Err(error.into()),
        };
        if let Ok(url) = std::env::var(DATABASE_URL) {
            config.store.url = Some(url);
        }
        config.worker.validate()?;
        Ok(config)
    }
}

#[tokio::main]
pub async fn main() -> Result<(), BoxError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = DemoConfig::load()?;
    match config.store.url.as_deref() {
        Some(url) => {
            let store = PgStore::connect(url, &config.worker.queue_name).await?;
            run(store, config.worker).await
        }
        None => run(InMemoryStore::new(), config.worker).await,
    }
}

async fn run<S: Store>(store: S, config: WorkerConfig) -> Result<(), BoxError> {
    let worker = Worker::new(store, jobs::registry()?, config)
        .with_cron(CronDefinition::daily_at::<jobs::DailyCleanup>(0, 0)?)
        .with_lifecycle(jobs::Hooks)
        .with_pruner(PrunerConfig::default());
    let client = worker.client();
    let handle = worker.spawn().await?;

    let email = client
        .job("send_email")
        .with_arg("user@example.com")
        .with_arg("Welcome")
        .with_arg("Thanks for signing up")
        .enqueue()
        .await?;
    let data = client
        .job("process_data")
        .with_kwarg("data", json!({"x": 1}))
        .defer_by(Duration::from_secs(2))
        .enqueue()
        .await?;
    let long = client
        .job("long_running_task")
        .with_kwarg("duration", 30)
        .enqueue()
        .await?;
    tracing::info!(%email, %data, %long, "Enqueued demo jobs");

    for job_id in [&email, &data] {
        let status = client.wait_for_result(job_id, Duration::from_secs(30)).await?;
        tracing::info!(%job_id, "{}", serde_json::to_string(&status)?);
    }

    tokio::time::sleep(Duration::from_secs(3)).await;
    if client.abort(&long).await? {
        let status = client.wait_for_result(&long, Duration::from_secs(10)).await?;
        tracing::info!(job_id = %long, state = %status.state, "Aborted long running task");
    }

    tracing::info!("Press Ctrl-C to stop the worker");
    tokio::signal::ctrl_c().await?;
    handle.graceful_shutdown().await?;
    Ok(())
}
