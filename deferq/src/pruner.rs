//! Deleting expired results.
//!
//! Expired terminal records are already absent from every read, the pruner reclaims their
//! storage. When constructing [`PrunerConfig`] a [`cron::Schedule`] is provided to specify when
//! the pruner should run; by default it runs every minute.
//!
//! # Example
//!
//! ```
//! # use deferq::prelude::*;
//! # use std::str::FromStr;
//! let hourly = PrunerConfig::new(cron::Schedule::from_str("0 0 * * * *").unwrap());
//! # let _ = hourly;
//! ```
use std::str::FromStr;

use cron::Schedule;

pub(crate) mod runner;

#[derive(Debug, Clone)]
pub struct PrunerConfig {
    schedule: Schedule,
}

impl PrunerConfig {
    const EVERY_MINUTE: &'static str = "0 * * * * *";

    pub fn new(schedule: Schedule) -> Self {
        Self { schedule }
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }
}

impl Default for PrunerConfig {
    fn default() -> Self {
        let schedule = Schedule::from_str(Self::EVERY_MINUTE).expect("valid cron expression");
        Self::new(schedule)
    }
}
