//! Provides an in memory implementation of [`Store`].
//!
//! It is not durable: every record is lost when the process exits. It is designed to be a
//! correct implementation of the store contract for tests and single process setups.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Notify;

use crate::job::{JobFailure, JobId, JobRecord, JobState, Outcome};

use super::{queryable::Queryable, Claimable, Query, Store, StoreError};

/// An in memory implementation of [`Store`].
///
/// Cloning is cheap, clones share the same records.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<HashMap<JobId, JobRecord>>>,
    notify: Arc<Notify>,
    paused: Arc<AtomicBool>,
    outage: Arc<AtomicBool>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore")
            .field("paused", &self.paused.load(Ordering::Relaxed))
            .field("outage", &self.outage.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the store in paused mode where waiting dispatchers are not woken up when jobs are
    /// inserted. They still pick jobs up on their next poll.
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake up every dispatcher waiting for work.
    pub fn notify_all(&self) {
        self.notify.notify_waiters();
    }

    /// Make every operation fail with [`StoreError::Unavailable`] until called with `false`.
    #[doc(hidden)]
    pub fn simulate_outage(&self, outage: bool) {
        self.outage.store(outage, Ordering::SeqCst);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, JobRecord>>, StoreError> {
        self.check_available()?;
        self.jobs
            .read()
            .map_err(|_| StoreError::Unavailable("poisoned lock".to_owned()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, JobRecord>>, StoreError> {
        self.check_available()?;
        self.jobs
            .write()
            .map_err(|_| StoreError::Unavailable("poisoned lock".to_owned()))
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.outage.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("simulated outage".to_owned()))
        } else {
            Ok(())
        }
    }

    fn notify_dispatchers(&self) {
        if !self.paused.load(Ordering::Relaxed) {
            self.notify.notify_waiters();
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(&self, record: JobRecord) -> Result<(), StoreError> {
        {
            let mut jobs = self.write()?;
            let now = Utc::now();
            if jobs
                .get(&record.id)
                .is_some_and(|existing| !existing.is_expired(now))
            {
                return Err(StoreError::JobExists(record.id));
            }
            jobs.insert(record.id.clone(), record);
        }
        self.notify_dispatchers();
        Ok(())
    }

    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        let now = Utc::now();
        Ok(self
            .read()?
            .get(id)
            .filter(|record| !record.is_expired(now))
            .cloned())
    }

    async fn claim_next_ready(
        &self,
        now: DateTime<Utc>,
        functions: &[Claimable<'_>],
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut jobs = self.write()?;
        let next = jobs
            .values_mut()
            .filter(|record| record.state.is_pending() && record.run_at <= now)
            .filter_map(|record| {
                functions
                    .iter()
                    .find(|function| function.function_name == record.function_name)
                    .map(|function| (record, function.timeout))
            })
            .min_by(|(a, _), (b, _)| {
                a.run_at
                    .cmp(&b.run_at)
                    .then(a.enqueued_at.cmp(&b.enqueued_at))
            });

        Ok(next.map(|(record, timeout)| {
            record.mark_in_progress(now, now + timeout);
            record.clone()
        }))
    }

    async fn mark_terminal(
        &self,
        id: &JobId,
        outcome: Outcome,
        keep_result: TimeDelta,
    ) -> Result<(), StoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();
        match jobs.get_mut(id).filter(|record| !record.is_expired(now)) {
            None => Err(StoreError::JobNotFound(id.clone())),
            Some(record) if record.state != JobState::InProgress => {
                Err(StoreError::InvalidTransition {
                    id: id.clone(),
                    from: record.state,
                    to: outcome.state(),
                })
            }
            Some(record) => {
                record.mark_terminal(outcome, now, keep_result);
                Ok(())
            }
        }
    }

    async fn request_abort(&self, id: &JobId) -> Result<bool, StoreError> {
        let mut jobs = self.write()?;
        match jobs.get_mut(id) {
            Some(record) if !record.state.is_terminal() => {
                record.abort_requested = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn abort_requested(&self, ids: &[JobId]) -> Result<Vec<JobId>, StoreError> {
        let jobs = self.read()?;
        Ok(ids
            .iter()
            .filter(|id| jobs.get(*id).is_some_and(|record| record.abort_requested))
            .cloned()
            .collect())
    }

    async fn expire_terminal_older_than(
        &self,
        ttl: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let before = jobs.len();
        jobs.retain(|_, record| {
            !(record.state.is_terminal()
                && (record.is_expired(now)
                    || record
                        .finished_at
                        .is_some_and(|finished_at| finished_at + ttl <= now)))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn fail_overdue(
        &self,
        now: DateTime<Utc>,
        keep_result: TimeDelta,
    ) -> Result<u64, StoreError> {
        let mut jobs = self.write()?;
        let mut failed = 0;
        jobs.values_mut()
            .filter(|record| {
                record.state == JobState::InProgress
                    && record.deadline.is_some_and(|deadline| deadline <= now)
            })
            .for_each(|record| {
                record.mark_terminal(Outcome::Failed(JobFailure::overdue()), now, keep_result);
                failed += 1;
            });
        Ok(failed)
    }

    async fn next_run_at(&self, functions: &[&str]) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|record| {
                record.state.is_pending() && functions.contains(&record.function_name.as_str())
            })
            .map(|record| record.run_at)
            .min())
    }

    async fn query<'a>(&self, query: Query<'a>) -> Result<Vec<JobRecord>, StoreError> {
        let now = Utc::now();
        let mut records: Vec<_> = self
            .read()?
            .values()
            .filter(|record| !record.is_expired(now) && query.matches(record))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.enqueued_at.cmp(&a.enqueued_at));
        Ok(records)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn wait_for_jobs(&self, max: Duration) {
        tokio::select! {
            _ = self.notify.notified() => {},
            _ = tokio::time::sleep(max) => {},
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use crate::{job::JobArgs, test_suite};

    use super::*;

    test_suite!(for: InMemoryStore::new());

    fn record() -> JobRecord {
        let now = Utc::now();
        JobRecord::new(JobId::generate(), "function", JobArgs::new(), now, now)
    }

    #[tokio::test]
    async fn put_wakes_waiting_dispatcher() {
        let store = InMemoryStore::new();
        let handle = tokio::spawn({
            let store = store.clone();
            async move {
                let start = tokio::time::Instant::now();
                store.wait_for_jobs(Duration::from_secs(5)).await;
                start.elapsed()
            }
        });
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.put(record()).await.unwrap();

        let waited = handle.await.unwrap();
        assert!(waited < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn put_does_not_wake_when_paused() {
        let store = InMemoryStore::new().paused();
        let handle = tokio::spawn({
            let store = store.clone();
            async move {
                let start = tokio::time::Instant::now();
                store.wait_for_jobs(Duration::from_millis(300)).await;
                start.elapsed()
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.put(record()).await.unwrap();

        let waited = handle.await.unwrap();
        assert!(waited >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn simulated_outage_fails_closed() {
        let store = InMemoryStore::new();
        let job = record();
        let id = job.id.clone();
        store.put(job).await.unwrap();

        store.simulate_outage(true);

        assert_matches!(store.ping().await, Err(StoreError::Unavailable(_)));
        assert_matches!(store.put(record()).await, Err(StoreError::Unavailable(_)));
        assert_matches!(store.get(&id).await, Err(StoreError::Unavailable(_)));
        assert_matches!(
            store.claim_next_ready(Utc::now(), &[]).await,
            Err(StoreError::Unavailable(_))
        );
        assert_matches!(store.request_abort(&id).await, Err(StoreError::Unavailable(_)));

        store.simulate_outage(false);

        assert!(store.get(&id).await.unwrap().is_some());
        assert_eq!(store.query(Query::all()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn poisoned_lock_is_reported_as_unavailable() {
        let store = InMemoryStore::new();
        tokio::task::spawn({
            let store = store.clone();
            async move {
                let _guard = store.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(store.put(record()).await, Err(StoreError::Unavailable(_)));
        assert_matches!(
            store.query(Query::all()).await,
            Err(StoreError::Unavailable(_))
        );
    }
}
