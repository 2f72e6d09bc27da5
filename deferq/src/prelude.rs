//! The purpose of this module is to alleviate the need to import many of the `[deferq]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use deferq::prelude::*;
//! ```
pub use crate::client::Client;
pub use crate::config::WorkerConfig;
pub use crate::cron::CronDefinition;
pub use crate::function::{
    ExecutionError, JobContext, JobFunction, Lifecycle, Registry, Resources,
};
pub use crate::job::status::JobStatus;
pub use crate::job::{JobArgs, JobId, JobState};
pub use crate::pruner::PrunerConfig;
pub use crate::{DeferqError, Worker, WorkerHandle};
