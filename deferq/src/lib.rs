//! A durable, delay capable job queue.
//!
//! Producers enqueue named units of work through a [`client::Client`], optionally deferred or
//! triggered by a [`cron::CronDefinition`]. A [`Worker`] claims ready jobs from a shared
//! [`store::Store`], runs them concurrently up to a configured limit with a per job timeout and
//! cooperative abort, and records their result for a configurable retention window.
//!
//! # Example
//!
//! ```
//! # use deferq::prelude::*;
//! # use deferq::store::memory::InMemoryStore;
//! # use std::time::Duration;
//! struct Greet;
//!
//! #[async_trait::async_trait]
//! impl JobFunction for Greet {
//!     type Output = String;
//!     const NAME: &'static str = "greet";
//!
//!     async fn execute(_ctx: JobContext, args: JobArgs) -> Result<String, ExecutionError> {
//!         let name: String = args.arg(0)?;
//!         Ok(format!("Hello {name}"))
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let registry = Registry::new().with_function::<Greet>().unwrap();
//! let worker = Worker::new(InMemoryStore::new(), registry, WorkerConfig::default());
//! let client = worker.client();
//! let handle = worker.spawn().await.unwrap();
//!
//! let job_id = client.job("greet").with_arg("world").enqueue().await.unwrap();
//! let status = client
//!     .wait_for_result(&job_id, Duration::from_secs(5))
//!     .await
//!     .unwrap();
//! assert_eq!(status.state, JobState::Complete);
//! assert_eq!(status.result, Some(serde_json::json!("Hello world")));
//!
//! handle.graceful_shutdown().await.unwrap();
//! # });
//! ```
use std::time::Duration;

use thiserror::Error;

mod backoff;
pub mod client;
pub mod config;
pub mod cron;
mod dispatcher;
pub mod function;
pub mod job;
pub mod prelude;
pub mod pruner;
pub mod store;
pub mod testing;
mod worker;

use config::ConfigError;
use function::BoxError;
use job::{ArgumentError, JobId};
use store::StoreError;

pub use worker::{Worker, WorkerHandle, WorkerStats};

#[derive(Debug, Error)]
pub enum DeferqError {
    #[error("Unknown function `{0}`")]
    UnknownFunction(String),
    #[error("Invalid arguments for `{function}`: {source}")]
    InvalidArguments {
        function: String,
        source: ArgumentError,
    },
    #[error("A function named `{0}` is already registered")]
    DuplicateFunction(&'static str),
    #[error("Delay {0:?} is out of range")]
    DelayOutOfRange(Duration),
    #[error("Timed out waiting for the result of job {0}")]
    ResultTimeout(JobId),
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Error encoding or decoding value")]
    EncodeError(#[from] serde_json::Error),
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),
    #[error("Worker startup hook failed: {0}")]
    Startup(BoxError),
    #[error("Worker shutdown hook failed: {0}")]
    Shutdown(BoxError),
}

impl DeferqError {
    /// Whether the error was caused by the caller's request rather than by the system, e.g. to
    /// pick between a 4xx and a 5xx response in a front end.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownFunction(_)
                | Self::InvalidArguments { .. }
                | Self::DelayOutOfRange(_)
                | Self::EncodeError(_)
                | Self::Store(StoreError::JobExists(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors() {
        assert!(DeferqError::UnknownFunction("unregistered_fn".to_owned()).is_client_error());
        assert!(DeferqError::Store(StoreError::JobExists(JobId::from("id"))).is_client_error());
        assert!(
            !DeferqError::Store(StoreError::Unavailable("down".to_owned())).is_client_error()
        );
        assert!(!DeferqError::Startup("cannot connect".into()).is_client_error());
    }
}
