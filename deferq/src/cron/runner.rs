use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    client::Client,
    store::{Store, StoreError},
    DeferqError,
};

use super::{CronDefinition, CronScheduler};

pub(crate) struct CronRunner<S: Store> {
    client: Client<S>,
    scheduler: CronScheduler,
}

impl<S: Store> CronRunner<S> {
    pub(crate) fn new(client: Client<S>, definitions: Vec<CronDefinition>) -> Self {
        Self {
            client,
            scheduler: CronScheduler::new(definitions, Utc::now()),
        }
    }

    pub(crate) async fn run(mut self, cancellation_token: CancellationToken) {
        for (definition, trigger) in self.scheduler.startup_jobs(Utc::now()) {
            self.enqueue(&definition, trigger).await;
        }

        loop {
            let Some(next) = self.scheduler.next_fire() else {
                tracing::warn!("No future trigger time for any cron job");
                break;
            };
            let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = cancellation_token.cancelled() => break,
            }
            for (definition, trigger) in self.scheduler.due(Utc::now()) {
                self.enqueue(&definition, trigger).await;
            }
        }
        tracing::debug!("Shutting down cron scheduler");
    }

    async fn enqueue(&self, definition: &CronDefinition, trigger: DateTime<Utc>) {
        let mut builder = self
            .client
            .job(definition.function_name.as_str())
            .with_args(definition.args.clone())
            .defer_until(trigger);
        if definition.unique {
            builder = builder.with_job_id(definition.job_id(trigger));
        }

        match builder.enqueue().await {
            Ok(job_id) => tracing::info!(
                %job_id,
                %trigger,
                "Enqueued cron job {}",
                definition.function_name
            ),
            Err(DeferqError::Store(StoreError::JobExists(job_id))) => tracing::debug!(
                %job_id,
                "Cron job {} for {trigger} already enqueued",
                definition.function_name
            ),
            Err(err) => tracing::error!(
                ?err,
                "Failed to enqueue cron job {} with {err}",
                definition.function_name
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use crate::{
        function::test::test_registry,
        job::JobState,
        store::{memory::InMemoryStore, Query},
    };

    use super::*;

    #[tokio::test]
    async fn enqueues_on_each_trigger() {
        let store = InMemoryStore::new();
        let client = Client::new(store.clone(), &test_registry());
        let definition = CronDefinition::new("echo", "* * * * * *".parse().unwrap());
        let token = CancellationToken::new();

        let task = tokio::spawn(CronRunner::new(client, vec![definition]).run(token.clone()));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        token.cancel();
        task.await.unwrap();

        let jobs = store.query(Query::FunctionEqual("echo")).await.unwrap();
        assert!((2..=3).contains(&jobs.len()));
        for job in jobs {
            assert!(job.id.as_str().starts_with("cron:echo:"));
            assert_eq!(job.id.as_str(), format!("cron:echo:{}", job.run_at.timestamp_millis()));
            assert_eq!(job.state, JobState::Queued);
        }
    }

    #[tokio::test]
    async fn two_schedulers_enqueue_a_trigger_once() {
        let store = InMemoryStore::new();
        let definition = CronDefinition::new("echo", "0 0 0 * * *".parse().unwrap());
        let trigger = Utc::now();
        let first = CronRunner::new(Client::new(store.clone(), &test_registry()), vec![]);
        let second = CronRunner::new(Client::new(store.clone(), &test_registry()), vec![]);

        first.enqueue(&definition, trigger).await;
        second.enqueue(&definition, trigger).await;

        let jobs = store.query(Query::all()).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_matches!(
            store.put(crate::job::JobRecord::new(
                definition.job_id(trigger).into(),
                "echo",
                definition.args.clone(),
                trigger,
                trigger,
            )).await,
            Err(StoreError::JobExists(_))
        );
    }

    #[tokio::test]
    async fn run_at_startup_enqueues_immediately() {
        let store = InMemoryStore::new();
        let client = Client::new(store.clone(), &test_registry());
        let definition =
            CronDefinition::new("echo", "0 0 0 1 1 *".parse().unwrap()).run_at_startup();
        let token = CancellationToken::new();

        let task = tokio::spawn(CronRunner::new(client, vec![definition]).run(token.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        task.await.unwrap();

        assert_eq!(store.query(Query::all()).await.unwrap().len(), 1);
    }
}
