use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio_util::sync::CancellationToken;

use crate::store::Store;

use super::PrunerConfig;

pub(crate) struct PrunerRunner<S: Store> {
    config: PrunerConfig,
    store: S,
    keep_result: TimeDelta,
}

impl<S: Store> PrunerRunner<S> {
    pub(crate) fn new(store: S, config: PrunerConfig, keep_result: Duration) -> Self {
        Self {
            store,
            config,
            keep_result: TimeDelta::from_std(keep_result).unwrap_or(TimeDelta::weeks(520)),
        }
    }

    pub(crate) async fn run(self, cancellation_token: CancellationToken) {
        loop {
            let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                tracing::warn!("No future scheduled time for the result pruner");
                break;
            };
            let delay = next
                .sub(Utc::now())
                .sub(TimeDelta::milliseconds(10))
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    self.prune().await;
                    if let Ok(delay) = (next - Utc::now()).to_std() {
                        tokio::time::sleep(delay).await;
                    }
                }
                _ = cancellation_token.cancelled() => {
                    tracing::debug!("Shutting down the result pruner");
                    break;
                },
            }
        }
    }

    async fn prune(&self) {
        match self
            .store
            .expire_terminal_older_than(self.keep_result, Utc::now())
            .await
        {
            Ok(0) => {}
            Ok(expired) => tracing::debug!(expired, "Pruned {expired} expired job results"),
            Err(err) => tracing::error!(?err, "Failed to prune expired job results with {err}"),
        }
    }
}

#[cfg(test)]
mod test {
    use crate::{
        job::{JobArgs, JobId, JobRecord, Outcome},
        store::{memory::InMemoryStore, Claimable, Query},
    };

    use super::*;

    #[tokio::test]
    async fn prune_deletes_expired_results_only() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for _ in 0..2 {
            store
                .put(JobRecord::new(JobId::generate(), "echo", JobArgs::new(), now, now))
                .await
                .unwrap();
        }
        let claimable = [Claimable::new("echo", Duration::from_secs(60))];
        let expired = store.claim_next_ready(now, &claimable).await.unwrap().unwrap();
        store
            .mark_terminal(&expired.id, Outcome::Aborted, TimeDelta::zero())
            .await
            .unwrap();

        let runner = PrunerRunner::new(
            store.clone(),
            PrunerConfig::default(),
            Duration::from_secs(3600),
        );
        runner.prune().await;

        assert_eq!(
            store
                .expire_terminal_older_than(TimeDelta::zero(), Utc::now())
                .await
                .unwrap(),
            0
        );
        let remaining = store.query(Query::all()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].id, expired.id);
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let token = CancellationToken::new();
        let runner = PrunerRunner::new(
            InMemoryStore::new(),
            PrunerConfig::default(),
            Duration::from_secs(60),
        );
        let task = tokio::spawn(runner.run(token.clone()));

        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
