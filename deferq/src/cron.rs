//! Recurring jobs.
//!
//! A [`CronDefinition`] pairs a registered function with a [`cron::Schedule`]. Workers given
//! definitions through [`crate::Worker::with_cron`] enqueue one job per trigger time through the
//! ordinary enqueue path, with `run_at` set to the trigger time.
//!
//! ```
//! # use deferq::prelude::*;
//! # struct DailyCleanup;
//! # #[async_trait::async_trait]
//! # impl JobFunction for DailyCleanup {
//! #     type Output = ();
//! #     const NAME: &'static str = "daily_cleanup";
//! #     async fn execute(_ctx: JobContext, _args: JobArgs) -> Result<(), ExecutionError> {
//! #         Ok(())
//! #     }
//! # }
//! let midnight = CronDefinition::daily_at::<DailyCleanup>(0, 0).unwrap();
//! assert_eq!(midnight.function_name, "daily_cleanup");
//! ```
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;

use crate::{function::JobFunction, job::JobArgs};

pub(crate) mod runner;

#[derive(Debug, Clone)]
pub struct CronDefinition {
    pub function_name: String,
    pub schedule: Schedule,
    pub args: JobArgs,
    /// Derive the job id from the trigger time so that several workers sharing a store enqueue
    /// each trigger once.
    pub unique: bool,
    pub run_at_startup: bool,
}

impl CronDefinition {
    pub fn new(function_name: impl Into<String>, schedule: Schedule) -> Self {
        Self {
            function_name: function_name.into(),
            schedule,
            args: JobArgs::new(),
            unique: true,
            run_at_startup: false,
        }
    }

    pub fn for_function<F: JobFunction>(schedule: Schedule) -> Self {
        Self::new(F::NAME, schedule)
    }

    /// Every day at `hour:minute` UTC.
    pub fn daily_at<F: JobFunction>(hour: u32, minute: u32) -> Result<Self, cron::error::Error> {
        let schedule = Schedule::from_str(&format!("0 {minute} {hour} * * *"))?;
        Ok(Self::for_function::<F>(schedule))
    }

    pub fn with_args(self, args: JobArgs) -> Self {
        Self { args, ..self }
    }

    pub fn unique(self, unique: bool) -> Self {
        Self { unique, ..self }
    }

    /// Also enqueue the job once as soon as the worker starts.
    pub fn run_at_startup(self) -> Self {
        Self {
            run_at_startup: true,
            ..self
        }
    }

    pub(crate) fn job_id(&self, trigger: DateTime<Utc>) -> String {
        format!("cron:{}:{}", self.function_name, trigger.timestamp_millis())
    }
}

struct Entry {
    definition: CronDefinition,
    last_fired: Option<DateTime<Utc>>,
}

/// Decides which definitions are due. Fired trigger times are only kept in memory.
pub(crate) struct CronScheduler {
    entries: Vec<Entry>,
    last_checked: DateTime<Utc>,
}

impl CronScheduler {
    pub(crate) fn new(definitions: Vec<CronDefinition>, now: DateTime<Utc>) -> Self {
        let entries = definitions
            .into_iter()
            .map(|definition| Entry {
                definition,
                last_fired: None,
            })
            .collect();
        Self {
            entries,
            last_checked: now,
        }
    }

    /// For each definition, the latest trigger time in `(last_checked, now]` that has not fired
    /// yet. Returned triggers are recorded as fired.
    pub(crate) fn due(&mut self, now: DateTime<Utc>) -> Vec<(CronDefinition, DateTime<Utc>)> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            let latest = entry
                .definition
                .schedule
                .after(&self.last_checked)
                .take_while(|trigger| *trigger <= now)
                .last();
            if let Some(trigger) = latest.filter(|trigger| entry.last_fired != Some(*trigger)) {
                entry.last_fired = Some(trigger);
                due.push((entry.definition.clone(), trigger));
            }
        }
        if now > self.last_checked {
            self.last_checked = now;
        }
        due
    }

    /// The earliest trigger time after the last check.
    pub(crate) fn next_fire(&self) -> Option<DateTime<Utc>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.definition.schedule.after(&self.last_checked).next())
            .min()
    }

    pub(crate) fn startup_jobs(&self, now: DateTime<Utc>) -> Vec<(CronDefinition, DateTime<Utc>)> {
        self.entries
            .iter()
            .filter(|entry| entry.definition.run_at_startup)
            .map(|entry| (entry.definition.clone(), now))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use chrono::{TimeDelta, TimeZone};

    use crate::function::test::Echo;

    use super::*;

    fn at(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 30, hour, minute, second).unwrap()
    }

    #[test]
    fn daily_at_builds_schedule() {
        let definition = CronDefinition::daily_at::<Echo>(3, 15).unwrap();
        let next = definition.schedule.after(&at(0, 0, 0)).next().unwrap();

        assert_eq!(next, at(3, 15, 0));
        assert!(definition.unique);
        assert!(!definition.run_at_startup);
        assert!(CronDefinition::daily_at::<Echo>(25, 0).is_err());
    }

    #[test]
    fn midnight_fires_exactly_once_when_crossed() {
        let definition = CronDefinition::daily_at::<Echo>(0, 0).unwrap();
        let mut scheduler = CronScheduler::new(vec![definition], at(23, 59, 0));
        let midnight = Utc.with_ymd_and_hms(2025, 8, 31, 0, 0, 0).unwrap();

        let mut fired = Vec::new();
        let mut now = at(23, 59, 0);
        while now < midnight + TimeDelta::minutes(2) {
            now += TimeDelta::milliseconds(700);
            fired.extend(scheduler.due(now));
        }

        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0.function_name, "echo");
        assert_eq!(fired[0].1, midnight);
    }

    #[test]
    fn repeated_checks_at_the_same_instant_fire_once() {
        let definition = CronDefinition::new("echo", "*/10 * * * * *".parse().unwrap());
        let mut scheduler = CronScheduler::new(vec![definition], at(12, 0, 5));

        assert_eq!(scheduler.due(at(12, 0, 10)).len(), 1);
        assert!(scheduler.due(at(12, 0, 10)).is_empty());
        assert!(scheduler.due(at(12, 0, 15)).is_empty());
        assert_eq!(scheduler.due(at(12, 0, 20)).len(), 1);
    }

    #[test]
    fn missed_triggers_collapse_to_latest() {
        let definition = CronDefinition::new("echo", "0 * * * * *".parse().unwrap());
        let mut scheduler = CronScheduler::new(vec![definition], at(12, 0, 30));

        let due = scheduler.due(at(12, 5, 30));

        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, at(12, 5, 0));
    }

    #[test]
    fn next_fire_is_earliest_across_definitions() {
        let scheduler = CronScheduler::new(
            vec![
                CronDefinition::new("hourly", "0 0 * * * *".parse().unwrap()),
                CronDefinition::new("minutely", "0 * * * * *".parse().unwrap()),
            ],
            at(12, 0, 30),
        );

        assert_eq!(scheduler.next_fire(), Some(at(12, 1, 0)));
    }

    #[test]
    fn startup_jobs_and_unique_ids() {
        let definition =
            CronDefinition::new("echo", "0 0 0 * * *".parse().unwrap()).run_at_startup();
        let scheduler = CronScheduler::new(
            vec![
                definition.clone(),
                CronDefinition::new("other", "0 0 0 * * *".parse().unwrap()),
            ],
            at(8, 0, 0),
        );

        let startup = scheduler.startup_jobs(at(8, 0, 0));

        assert_eq!(startup.len(), 1);
        assert_eq!(startup[0].0.function_name, "echo");
        assert_eq!(
            definition.job_id(at(8, 0, 0)),
            format!("cron:echo:{}", at(8, 0, 0).timestamp_millis())
        );
    }
}
