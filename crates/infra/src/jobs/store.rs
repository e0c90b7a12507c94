//! Queue store abstraction and the in-memory implementation.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use batchforge_core::ExecutionLogEntry;

use super::clock::{Clock, SystemClock};
use super::types::{QueueOptions, QueueRecord, RecordState, ResetOutcome};

/// Durable, concurrency-safe queue over one table.
///
/// Every write against a claimed record names the `worker_hostname` that
/// claimed it and only applies while that worker still holds the record.
/// `mark_*` return `false` when it does not (for example after the resetter
/// reclaimed it and another worker claimed it again); the caller's result is
/// dropped.
#[async_trait]
pub trait Store<P>: Send + Sync + 'static
where
    P: Send + Sync + 'static,
{
    fn options(&self) -> &QueueOptions;

    /// Claim the highest-priority ready record. `None` when nothing is ready.
    async fn dequeue(&self, worker_hostname: &str) -> Result<Option<QueueRecord<P>>, StoreError>;

    /// Refresh the heartbeat of records held by `worker_hostname`; returns the ids still held.
    async fn heartbeat(&self, ids: &[i64], worker_hostname: &str) -> Result<Vec<i64>, StoreError>;

    /// Put a held record back without consuming any budget.
    async fn requeue(
        &self,
        id: i64,
        worker_hostname: &str,
        after: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Append to a held record's execution log; returns the 1-based entry id.
    async fn add_execution_log_entry(
        &self,
        id: i64,
        worker_hostname: &str,
        entry: &ExecutionLogEntry,
    ) -> Result<i32, StoreError>;

    async fn update_execution_log_entry(
        &self,
        id: i64,
        worker_hostname: &str,
        entry_id: i32,
        entry: &ExecutionLogEntry,
    ) -> Result<(), StoreError>;

    async fn mark_complete(&self, id: i64, worker_hostname: &str) -> Result<bool, StoreError>;

    async fn mark_errored(
        &self,
        id: i64,
        worker_hostname: &str,
        failure_message: &str,
    ) -> Result<bool, StoreError>;

    async fn mark_failed(
        &self,
        id: i64,
        worker_hostname: &str,
        failure_message: &str,
    ) -> Result<bool, StoreError>;

    /// Requeue or escalate processing records whose heartbeat is too old.
    async fn reset_stalled(&self) -> Result<ResetOutcome, StoreError>;

    async fn queued_count(&self, include_processing: bool) -> Result<i64, StoreError>;
}

/// Store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("record not found: {0}")]
    NotFound(i64),
    #[error("record {0} is not held by this worker")]
    NotHeld(i64),
    #[error("execution log entry {entry_id} of record {id} was not updated")]
    ExecutionLogEntryNotUpdated { id: i64, entry_id: i32 },
    #[error("failed to decode record: {0}")]
    Decode(String),
    #[error("store lock poisoned")]
    Poisoned,
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Poisoned)
    }
}

type Comparator<P> = Arc<dyn Fn(&QueueRecord<P>, &QueueRecord<P>) -> Ordering + Send + Sync>;

/// In-memory queue for tests/dev.
///
/// A single mutex serializes every operation, which gives `dequeue` the same
/// exclusivity the `SKIP LOCKED` claim has in Postgres.
pub struct InMemoryStore<P> {
    options: QueueOptions,
    clock: Arc<dyn Clock>,
    order: Comparator<P>,
    records: Mutex<BTreeMap<i64, QueueRecord<P>>>,
}

impl<P> InMemoryStore<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn new(options: QueueOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    pub fn with_clock(options: QueueOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            options,
            clock,
            order: Arc::new(|_, _| Ordering::Equal),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Priority ordering; ties are broken by ascending id.
    pub fn with_order<F>(mut self, order: F) -> Self
    where
        F: Fn(&QueueRecord<P>, &QueueRecord<P>) -> Ordering + Send + Sync + 'static,
    {
        self.order = Arc::new(order);
        self
    }

    /// Insert a record as an upstream writer would.
    pub fn enqueue(&self, record: QueueRecord<P>) -> Result<i64, StoreError> {
        let id = record.id;
        self.lock()?.insert(id, record);
        Ok(id)
    }

    pub fn get(&self, id: i64) -> Result<Option<QueueRecord<P>>, StoreError> {
        Ok(self.lock()?.get(&id).cloned())
    }

    pub fn all(&self) -> Result<Vec<QueueRecord<P>>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<i64, QueueRecord<P>>>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }

    fn with_held<F>(&self, id: i64, worker_hostname: &str, f: F) -> Result<bool, StoreError>
    where
        F: FnOnce(&mut QueueRecord<P>, DateTime<Utc>),
    {
        let now = self.clock.now();
        let mut records = self.lock()?;
        match records.get_mut(&id) {
            Some(r) if r.is_held_by(worker_hostname) => {
                f(r, now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }
}

#[async_trait]
impl<P> Store<P> for InMemoryStore<P>
where
    P: Clone + Send + Sync + 'static,
{
    fn options(&self) -> &QueueOptions {
        &self.options
    }

    async fn dequeue(&self, worker_hostname: &str) -> Result<Option<QueueRecord<P>>, StoreError> {
        let now = self.clock.now();
        let mut records = self.lock()?;

        let next = records
            .values()
            .filter(|r| r.is_ready(now))
            .min_by(|a, b| (self.order)(a, b).then(a.id.cmp(&b.id)))
            .map(|r| r.id);

        Ok(next.and_then(|id| records.get_mut(&id)).map(|r| {
            r.mark_processing(worker_hostname, now);
            r.clone()
        }))
    }

    async fn heartbeat(&self, ids: &[i64], worker_hostname: &str) -> Result<Vec<i64>, StoreError> {
        let now = self.clock.now();
        let mut records = self.lock()?;

        let mut known = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = records.get_mut(id) {
                if r.is_held_by(worker_hostname) {
                    r.last_heartbeat_at = Some(now);
                    known.push(*id);
                }
            }
        }
        Ok(known)
    }

    async fn requeue(
        &self,
        id: i64,
        worker_hostname: &str,
        after: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_held(id, worker_hostname, |r, _| {
            r.state = RecordState::Queued;
            r.process_after = Some(after);
            r.last_heartbeat_at = None;
        })
        .map(|_| ())
    }

    async fn add_execution_log_entry(
        &self,
        id: i64,
        worker_hostname: &str,
        entry: &ExecutionLogEntry,
    ) -> Result<i32, StoreError> {
        let mut records = self.lock()?;
        let r = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !r.is_held_by(worker_hostname) {
            return Err(StoreError::NotHeld(id));
        }
        r.execution_logs.push(entry.clone());
        Ok(r.execution_logs.len() as i32)
    }

    async fn update_execution_log_entry(
        &self,
        id: i64,
        worker_hostname: &str,
        entry_id: i32,
        entry: &ExecutionLogEntry,
    ) -> Result<(), StoreError> {
        let mut records = self.lock()?;
        let r = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        let held = r.is_held_by(worker_hostname);
        let slot = usize::try_from(entry_id)
            .ok()
            .filter(|_| held)
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| r.execution_logs.get_mut(i))
            .ok_or(StoreError::ExecutionLogEntryNotUpdated { id, entry_id })?;
        *slot = entry.clone();
        Ok(())
    }

    async fn mark_complete(&self, id: i64, worker_hostname: &str) -> Result<bool, StoreError> {
        self.with_held(id, worker_hostname, |r, now| r.mark_completed(now))
    }

    async fn mark_errored(
        &self,
        id: i64,
        worker_hostname: &str,
        failure_message: &str,
    ) -> Result<bool, StoreError> {
        let options = &self.options;
        self.with_held(id, worker_hostname, |r, now| {
            r.mark_errored(failure_message, options, now)
        })
    }

    async fn mark_failed(
        &self,
        id: i64,
        worker_hostname: &str,
        failure_message: &str,
    ) -> Result<bool, StoreError> {
        self.with_held(id, worker_hostname, |r, now| r.mark_failed(failure_message, now))
    }

    async fn reset_stalled(&self) -> Result<ResetOutcome, StoreError> {
        let now = self.clock.now();
        let mut records = self.lock()?;
        let mut outcome = ResetOutcome::default();

        for r in records.values_mut() {
            if r.state != RecordState::Processing {
                continue;
            }
            let age = heartbeat_age(r.last_heartbeat_at, now);
            if age <= self.options.stalled_max_age {
                continue;
            }
            if r.reset(&self.options, now) {
                outcome.reset.insert(r.id, age);
            } else {
                outcome.escalated.insert(r.id, age);
            }
        }
        Ok(outcome)
    }

    async fn queued_count(&self, include_processing: bool) -> Result<i64, StoreError> {
        Ok(self
            .lock()?
            .values()
            .filter(|r| {
                r.state == RecordState::Queued
                    || (include_processing && r.state == RecordState::Processing)
            })
            .count() as i64)
    }
}

/// A processing record without a heartbeat is treated as infinitely stale.
fn heartbeat_age(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    match last {
        Some(at) => (now - at).to_std().unwrap_or(Duration::ZERO),
        None => Duration::MAX,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::clock::MockClock;
    use crate::jobs::types::DEFAULT_RESET_FAILURE_MESSAGE;
    use proptest::prelude::*;

    fn options() -> QueueOptions {
        QueueOptions::new("test", "test_jobs")
            .with_retry(3, Duration::from_secs(5))
            .with_max_num_resets(2)
            .with_stalled_max_age(Duration::from_secs(60))
    }

    fn store() -> (Arc<MockClock>, InMemoryStore<&'static str>) {
        let clock = Arc::new(MockClock::default());
        let store = InMemoryStore::with_clock(options(), clock.clone());
        (clock, store)
    }

    #[tokio::test]
    async fn dequeue_on_empty_queue_returns_none() {
        let (_, store) = store();
        assert!(store.dequeue("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_stamps_and_claims_once() {
        let (clock, store) = store();
        store.enqueue(QueueRecord::queued(1, "a")).unwrap();

        let claimed = store.dequeue("w1").await.unwrap().unwrap();
        assert_eq!(claimed.state, RecordState::Processing);
        assert_eq!(claimed.last_heartbeat_at, Some(clock.now()));
        assert_eq!(claimed.worker_hostname, "w1");

        assert!(store.dequeue("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_follows_order_then_id() {
        let clock = Arc::new(MockClock::default());
        let store = InMemoryStore::with_clock(options(), clock)
            .with_order(|a: &QueueRecord<i32>, b: &QueueRecord<i32>| b.payload.cmp(&a.payload));
        store.enqueue(QueueRecord::queued(1, 1)).unwrap();
        store.enqueue(QueueRecord::queued(3, 5)).unwrap();
        store.enqueue(QueueRecord::queued(2, 5)).unwrap();

        let order: Vec<i64> = [
            store.dequeue("w").await.unwrap().unwrap().id,
            store.dequeue("w").await.unwrap().unwrap().id,
            store.dequeue("w").await.unwrap().unwrap().id,
        ]
        .to_vec();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn dequeue_respects_process_after() {
        let (clock, store) = store();
        let mut r = QueueRecord::queued(1, "a");
        r.process_after = Some(clock.now() + chrono::Duration::seconds(10));
        store.enqueue(r).unwrap();

        assert!(store.dequeue("w").await.unwrap().is_none());
        clock.advance(Duration::from_secs(10));
        assert!(store.dequeue("w").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn heartbeat_reports_only_processing_ids() {
        let (_, store) = store();
        store.enqueue(QueueRecord::queued(1, "a")).unwrap();
        store.enqueue(QueueRecord::queued(2, "b")).unwrap();
        store.dequeue("w").await.unwrap();

        assert_eq!(store.heartbeat(&[1, 2, 3], "w").await.unwrap(), vec![1]);
        assert!(store.heartbeat(&[1], "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retry_budget_ends_in_failed() {
        let (clock, store) = store();
        store.enqueue(QueueRecord::queued(1, "a")).unwrap();

        for attempt in 1..=2 {
            store.dequeue("w").await.unwrap().unwrap();
            assert!(store.mark_errored(1, "w", "boom").await.unwrap());
            let r = store.get(1).unwrap().unwrap();
            assert_eq!(r.state, RecordState::Queued);
            assert_eq!(r.attempts, attempt);
            assert_eq!(r.process_after, Some(clock.now() + chrono::Duration::seconds(5)));
            clock.advance(Duration::from_secs(5));
        }

        store.dequeue("w").await.unwrap().unwrap();
        store.mark_errored(1, "w", "boom").await.unwrap();
        let r = store.get(1).unwrap().unwrap();
        assert_eq!(r.state, RecordState::Failed);
        assert_eq!(r.attempts, 3);
        assert!(store.dequeue("w").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn marks_are_ignored_once_record_left_processing() {
        let (_, store) = store();
        store.enqueue(QueueRecord::queued(1, "a")).unwrap();

        assert!(!store.mark_complete(1, "w").await.unwrap());
        assert!(matches!(store.mark_failed(9, "w", "x").await, Err(StoreError::NotFound(9))));
    }

    #[tokio::test]
    async fn stale_worker_cannot_touch_a_reclaimed_record() {
        let (clock, store) = store();
        store.enqueue(QueueRecord::queued(1, "a")).unwrap();

        store.dequeue("worker-a").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(61));
        assert_eq!(store.reset_stalled().await.unwrap().reset.len(), 1);
        store.dequeue("worker-b").await.unwrap().unwrap();
        let claimed_by_b = store.get(1).unwrap().unwrap();

        clock.advance(Duration::from_secs(30));
        let entry = ExecutionLogEntry::new("step.src.0", vec![], clock.now());
        assert!(store.heartbeat(&[1], "worker-a").await.unwrap().is_empty());
        assert!(matches!(
            store.add_execution_log_entry(1, "worker-a", &entry).await,
            Err(StoreError::NotHeld(1))
        ));
        assert!(!store.mark_complete(1, "worker-a").await.unwrap());
        assert!(!store.mark_errored(1, "worker-a", "late").await.unwrap());
        assert!(!store.mark_failed(1, "worker-a", "late").await.unwrap());
        store.requeue(1, "worker-a", clock.now()).await.unwrap();
        assert_eq!(store.get(1).unwrap().unwrap(), claimed_by_b);

        assert_eq!(store.heartbeat(&[1], "worker-b").await.unwrap(), vec![1]);
        assert!(store.mark_complete(1, "worker-b").await.unwrap());
        let r = store.get(1).unwrap().unwrap();
        assert_eq!((r.state, r.worker_hostname.as_str()), (RecordState::Completed, "worker-b"));
    }

    #[tokio::test]
    async fn execution_log_ids_are_sequential() {
        let (clock, store) = store();
        store.enqueue(QueueRecord::queued(1, "a")).unwrap();
        store.dequeue("w").await.unwrap().unwrap();

        let entry = ExecutionLogEntry::new("step.src.0", vec![], clock.now());
        assert_eq!(store.add_execution_log_entry(1, "w", &entry).await.unwrap(), 1);
        assert_eq!(store.add_execution_log_entry(1, "w", &entry).await.unwrap(), 2);

        let done = entry.clone().finish(0, "stdout: ok", 10);
        store.update_execution_log_entry(1, "w", 2, &done).await.unwrap();
        assert_eq!(store.get(1).unwrap().unwrap().execution_logs[1], done);

        assert!(matches!(
            store.update_execution_log_entry(1, "w", 3, &done).await,
            Err(StoreError::ExecutionLogEntryNotUpdated { id: 1, entry_id: 3 })
        ));
        assert!(matches!(
            store.update_execution_log_entry(1, "w", 0, &done).await,
            Err(StoreError::ExecutionLogEntryNotUpdated { .. })
        ));
        assert!(matches!(
            store.update_execution_log_entry(1, "other", 1, &done).await,
            Err(StoreError::ExecutionLogEntryNotUpdated { .. })
        ));
    }

    #[tokio::test]
    async fn reset_requeues_then_escalates() {
        let (clock, store) = store();
        store.enqueue(QueueRecord::queued(1, "a")).unwrap();

        for n in 1..=2 {
            store.dequeue("w").await.unwrap().unwrap();
            clock.advance(Duration::from_secs(61));
            let outcome = store.reset_stalled().await.unwrap();
            assert_eq!(outcome.reset.get(&1), Some(&Duration::from_secs(61)));
            let r = store.get(1).unwrap().unwrap();
            assert_eq!((r.state, r.num_resets), (RecordState::Queued, n));
            assert_eq!(r.last_heartbeat_at, None);
        }

        store.dequeue("w").await.unwrap().unwrap();
        clock.advance(Duration::from_secs(61));
        let outcome = store.reset_stalled().await.unwrap();
        assert!(outcome.escalated.contains_key(&1));

        let r = store.get(1).unwrap().unwrap();
        assert_eq!(r.state, RecordState::Errored);
        assert_eq!(r.num_resets, 2);
        assert_eq!(r.failure_message.as_deref(), Some(DEFAULT_RESET_FAILURE_MESSAGE));
    }

    #[tokio::test]
    async fn fresh_heartbeat_is_not_reset_and_reset_is_idempotent() {
        let (clock, store) = store();
        store.enqueue(QueueRecord::queued(1, "a")).unwrap();
        store.dequeue("w").await.unwrap();

        clock.advance(Duration::from_secs(60));
        assert!(store.reset_stalled().await.unwrap().is_empty());

        clock.advance(Duration::from_secs(1));
        assert_eq!(store.reset_stalled().await.unwrap().reset.len(), 1);
        assert!(store.reset_stalled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_claims_are_exclusive() {
        let store = Arc::new(InMemoryStore::new(options()));
        for id in 1..=50 {
            store.enqueue(QueueRecord::queued(id, "a")).unwrap();
        }

        let mut tasks = Vec::new();
        for w in 0..8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let mut claimed = Vec::new();
                while let Some(r) = store.dequeue(&format!("w{w}")).await.unwrap() {
                    claimed.push(r.id);
                }
                claimed
            }));
        }

        let mut all = Vec::new();
        for t in tasks {
            all.extend(t.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (1..=50).collect::<Vec<_>>());
    }

    proptest! {
        #[test]
        fn stalls_escalate_exactly_after_budget(max_resets in 0i32..6, stalls in 1usize..10) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let clock = Arc::new(MockClock::default());
                let opts = options().with_max_num_resets(max_resets);
                let store = InMemoryStore::with_clock(opts, clock.clone());
                store.enqueue(QueueRecord::queued(1, ())).unwrap();

                for stall in 1..=stalls {
                    if store.dequeue("w").await.unwrap().is_none() {
                        break;
                    }
                    clock.advance(Duration::from_secs(61));
                    store.reset_stalled().await.unwrap();

                    let r = store.get(1).unwrap().unwrap();
                    if (stall as i32) <= max_resets {
                        assert_eq!(r.state, RecordState::Queued);
                        assert_eq!(r.num_resets, stall as i32);
                    } else {
                        assert_eq!(r.state, RecordState::Errored);
                        assert_eq!(r.num_resets, max_resets);
                    }
                }
            });
        }
    }
}
