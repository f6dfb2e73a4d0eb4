//! Persistence coordinator.
//!
//! Loads the store from a [`StorageAdapter`] at startup, then mirrors store
//! events back to the adapter. Adds and edits are coalesced into per-id dirty
//! sets and written by a debounced flush; deletes and bulk edits are written
//! immediately.

use std::collections::HashSet;
use std::future::Future;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::history::core::config::PersistenceConfig;
use crate::history::core::errors::{HistoryError, HistoryResult};
use crate::history::core::ids::{PairId, TopicId};
use crate::history::core::pair::MessagePair;
use crate::history::persistence::adapter::{MetaRecord, SCHEMA_VERSION_KEY, StorageAdapter};
use crate::history::persistence::migration::{
    ReconcileReport, Reconciled, migrate_pair, needs_pair_migration, reconcile_legacy_roots,
};
use crate::history::store::{ConversationStore, EventKind, StoreEvent, Subscription};

/// Store events the coordinator subscribes to.
const WATCHED: [EventKind; 8] = [
    EventKind::TopicAdded,
    EventKind::TopicUpdated,
    EventKind::TopicMoved,
    EventKind::TopicDeleted,
    EventKind::PairAdded,
    EventKind::PairUpdated,
    EventKind::PairDeleted,
    EventKind::PairsBulkUpdated,
];

/// Lifecycle of a coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Created, `init` not called yet.
    Uninitialized,
    /// `init` is reading storage.
    Loading,
    /// Loaded and subscribed to store events.
    Wired,
}

/// Summary of a startup load.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Topic rows imported, stale roots excluded.
    pub topics_loaded: usize,
    /// Pair rows imported.
    pub pairs_loaded: usize,
    /// Pair rows that needed the color flag migration.
    pub migrated_pairs: usize,
    /// Topic rows that could not be decoded and were left in storage.
    pub skipped_topics: usize,
    /// Pair rows that could not be decoded and were left in storage.
    pub skipped_pairs: usize,
    /// Whether the schema version marker was written by this load.
    pub schema_version_written: bool,
    /// Legacy root reconciliation summary.
    pub reconcile: ReconcileReport,
}

/// Result of one flush.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Topics written.
    pub topics_written: usize,
    /// Pairs written.
    pub pairs_written: usize,
    /// Dirty ids no longer present in the store.
    pub skipped: usize,
    /// Writes that failed and were re-enqueued.
    pub failed: usize,
}

impl FlushReport {
    /// Whether the flush found nothing to do.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.topics_written == 0 && self.pairs_written == 0 && self.skipped == 0 && self.failed == 0
    }
}

/// Running totals since the coordinator was created.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistenceStats {
    /// Flushes that had work to do.
    pub flushes: u64,
    /// Topic upserts that succeeded.
    pub topics_written: u64,
    /// Pair upserts that succeeded.
    pub pairs_written: u64,
    /// Bulk pair writes that succeeded.
    pub bulk_writes: u64,
    /// Deletes that succeeded.
    pub deletes_written: u64,
    /// Upserts and bulk writes that failed.
    pub failed_writes: u64,
    /// Deletes that failed. These are not retried.
    pub failed_deletes: u64,
    /// Retry flushes armed after a failure.
    pub retries_scheduled: u64,
}

#[derive(Default)]
struct Pending {
    topics: HashSet<TopicId>,
    pairs: HashSet<PairId>,
    timer_armed: bool,
    retry_armed: bool,
    closed: bool,
}

struct Inner {
    store: Arc<ConversationStore>,
    adapter: Arc<dyn StorageAdapter>,
    config: PersistenceConfig,
    state: Mutex<CoordinatorState>,
    pending: Mutex<Pending>,
    stats: Mutex<PersistenceStats>,
    tasks: Mutex<JoinSet<()>>,
    subscriptions: Mutex<Vec<Subscription>>,
    runtime: OnceLock<Handle>,
    flush_lock: tokio::sync::Mutex<()>,
    shutdown: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn current_runtime() -> HistoryResult<Handle> {
    Handle::try_current().map_err(|err| {
        HistoryError::InvalidState(format!("init() must run inside a tokio runtime: {err}"))
    })
}

/// Write-back bridge between a [`ConversationStore`] and a [`StorageAdapter`].
///
/// Cloning yields another handle to the same coordinator.
#[derive(Clone)]
pub struct PersistenceCoordinator {
    inner: Arc<Inner>,
}

impl PersistenceCoordinator {
    /// Create a coordinator. Nothing is read or subscribed until [`init`].
    ///
    /// [`init`]: Self::init
    #[must_use]
    pub fn new(
        store: Arc<ConversationStore>,
        adapter: Arc<dyn StorageAdapter>,
        config: PersistenceConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                adapter,
                config,
                state: Mutex::new(CoordinatorState::Uninitialized),
                pending: Mutex::new(Pending::default()),
                stats: Mutex::new(PersistenceStats::default()),
                tasks: Mutex::new(JoinSet::new()),
                subscriptions: Mutex::new(Vec::new()),
                runtime: OnceLock::new(),
                flush_lock: tokio::sync::Mutex::new(()),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Load storage into the store, then start mirroring store events.
    ///
    /// Runs the schema marker check, legacy root reconciliation and the pair
    /// color migration, rebuilds aggregates (best effort), subscribes, and
    /// enqueues every topic and pair for an initial write-back.
    ///
    /// # Errors
    /// Returns `HistoryError::InvalidState` if called more than once or outside
    /// a tokio runtime, or any adapter error raised while loading. A failed
    /// load leaves the coordinator uninitialized.
    pub async fn init(&self) -> HistoryResult<LoadReport> {
        let runtime = current_runtime()?;
        {
            let mut state = lock(&self.inner.state);
            if *state != CoordinatorState::Uninitialized {
                return Err(HistoryError::InvalidState(format!(
                    "coordinator already initialized ({:?})",
                    *state
                )));
            }
            *state = CoordinatorState::Loading;
        }
        if self.inner.runtime.set(runtime).is_err() {
            debug!("Runtime already captured by an earlier init");
        }

        let report = match self.inner.load().await {
            Ok(report) => report,
            Err(err) => {
                *lock(&self.inner.state) = CoordinatorState::Uninitialized;
                return Err(err);
            }
        };

        *lock(&self.inner.state) = CoordinatorState::Wired;
        self.wire()?;
        self.inner.seed();

        info!(
            topics = report.topics_loaded,
            pairs = report.pairs_loaded,
            migrated = report.migrated_pairs,
            skipped = report.skipped_topics + report.skipped_pairs,
            stale_roots = report.reconcile.stale_roots.len(),
            "Conversation history loaded"
        );
        Ok(report)
    }

    /// Subscribe to store events. Calling it again is a no-op.
    ///
    /// # Errors
    /// Returns `HistoryError::InvalidState` before [`init`](Self::init) has
    /// captured a runtime.
    pub fn wire(&self) -> HistoryResult<()> {
        if self.inner.runtime.get().is_none() {
            return Err(HistoryError::InvalidState(
                "wire() needs a runtime; call init() first".to_string(),
            ));
        }

        let mut subscriptions = lock(&self.inner.subscriptions);
        if !subscriptions.is_empty() {
            return Ok(());
        }
        for kind in WATCHED {
            let weak: Weak<Inner> = Arc::downgrade(&self.inner);
            subscriptions.push(self.inner.store.on(kind, move |event| {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_event(event);
                }
            }));
        }
        debug!(listeners = subscriptions.len(), "Persistence wired");
        Ok(())
    }

    /// Arm the debounce timer, or flush right away when the debounce is zero.
    pub fn schedule(&self) {
        self.inner.schedule();
    }

    /// Write every dirty topic, then every dirty pair.
    pub async fn flush(&self) -> FlushReport {
        self.inner.flush().await
    }

    /// Wait until every spawned flush, delete and bulk write has finished.
    ///
    /// Armed debounce timers count as outstanding. Retry timers do not.
    pub async fn settle(&self) {
        loop {
            let mut batch = mem::take(&mut *lock(&self.inner.tasks));
            if batch.is_empty() {
                return;
            }
            while let Some(joined) = batch.join_next().await {
                if let Err(err) = joined {
                    warn!(%err, "Persistence task ended abnormally");
                }
            }
        }
    }

    /// Stop mirroring events and write what is left.
    ///
    /// An armed debounce timer fires early; a pending retry is dropped.
    pub async fn shutdown(&self) {
        let subscriptions = mem::take(&mut *lock(&self.inner.subscriptions));
        for subscription in subscriptions {
            subscription.cancel();
        }
        self.inner.pending().closed = true;
        self.inner.shutdown.notify_waiters();
        self.settle().await;
        self.inner.flush().await;

        let stats = self.stats();
        info!(
            flushes = stats.flushes,
            failed = stats.failed_writes + stats.failed_deletes,
            pending = self.pending_len(),
            "Persistence shut down"
        );
    }

    /// Number of dirty ids waiting for a flush.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        let pending = lock(&self.inner.pending);
        pending.topics.len() + pending.pairs.len()
    }

    /// Running totals.
    #[must_use]
    pub fn stats(&self) -> PersistenceStats {
        lock(&self.inner.stats).clone()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *lock(&self.inner.state)
    }
}

impl Inner {
    async fn load(&self) -> HistoryResult<LoadReport> {
        self.adapter.init().await?;

        let schema_version_written = if self.adapter.get_meta(SCHEMA_VERSION_KEY).await?.is_some() {
            false
        } else {
            self.adapter.save_meta(MetaRecord::schema_version()).await?;
            true
        };

        let topic_rows = self.adapter.get_all_topics().await?;
        let pair_rows = self.adapter.get_all_pairs().await?;
        let migrated_pairs = pair_rows
            .rows
            .iter()
            .filter(|row| needs_pair_migration(row))
            .count();
        let pairs: Vec<MessagePair> = pair_rows.rows.into_iter().map(migrate_pair).collect();

        let Reconciled {
            topics,
            pairs,
            report: reconcile,
        } = reconcile_legacy_roots(topic_rows.rows, pairs);

        let report = LoadReport {
            topics_loaded: topics.len(),
            pairs_loaded: pairs.len(),
            migrated_pairs,
            skipped_topics: topic_rows.skipped,
            skipped_pairs: pair_rows.skipped,
            schema_version_written,
            reconcile,
        };

        for topic in topics {
            self.store.import_topic(topic);
        }
        for pair in pairs {
            self.store.import_pair(pair);
        }
        self.store.rebuild_children_index();
        if let Err(err) = self.store.rebuild_aggregates() {
            warn!(%err, "Aggregate rebuild after load failed");
        }

        for id in &report.reconcile.stale_roots {
            if let Err(err) = self.adapter.delete_topic(*id).await {
                warn!(topic = %id, %err, "Failed to remove stale root row");
            }
        }

        Ok(report)
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        lock(&self.pending)
    }

    fn record(&self, update: impl FnOnce(&mut PersistenceStats)) {
        update(&mut lock(&self.stats));
    }

    fn seed(self: &Arc<Self>) {
        let topics: Vec<TopicId> = self.store.get_all_topics().iter().map(|t| t.id).collect();
        let pairs: Vec<PairId> = self.store.get_all_pairs().iter().map(|p| p.id).collect();
        {
            let mut pending = self.pending();
            pending.topics.extend(topics);
            pending.pairs.extend(pairs);
        }
        self.schedule();
    }

    fn handle_event(self: &Arc<Self>, event: &StoreEvent) {
        match event {
            StoreEvent::TopicAdded(id)
            | StoreEvent::TopicUpdated(id)
            | StoreEvent::TopicMoved { id, .. } => {
                self.pending().topics.insert(*id);
                self.schedule();
            }
            StoreEvent::PairAdded(id) | StoreEvent::PairUpdated(id) => {
                self.pending().pairs.insert(*id);
                self.schedule();
            }
            StoreEvent::TopicDeleted(id) => {
                let id = *id;
                self.pending().topics.remove(&id);
                let inner = Arc::clone(self);
                self.spawn(async move {
                    let _flushing = inner.flush_lock.lock().await;
                    let result = inner.adapter.delete_topic(id).await;
                    inner.finish_delete("topic", &id.to_string(), result);
                });
            }
            StoreEvent::PairDeleted(id) => {
                let id = *id;
                self.pending().pairs.remove(&id);
                let inner = Arc::clone(self);
                self.spawn(async move {
                    let _flushing = inner.flush_lock.lock().await;
                    let result = inner.adapter.delete_pair(id).await;
                    inner.finish_delete("pair", &id.to_string(), result);
                });
            }
            StoreEvent::PairsBulkUpdated(pairs) => {
                let ids: Vec<PairId> = pairs.iter().map(|pair| pair.id).collect();
                let inner = Arc::clone(self);
                self.spawn(async move { inner.write_bulk(ids).await });
            }
            StoreEvent::TopicCountsChanged(_) => {}
        }
    }

    fn finish_delete(&self, entity: &str, id: &str, result: HistoryResult<()>) {
        match result {
            Ok(()) => {
                self.record(|stats| stats.deletes_written += 1);
                debug!(entity, id, "Delete written");
            }
            Err(err) => {
                self.record(|stats| stats.failed_deletes += 1);
                warn!(entity, id, %err, "Delete failed");
            }
        }
    }

    /// Write the current state of `ids` in one batch.
    ///
    /// Pairs are read from the store once the flush lock is held, so a flush
    /// that ran first is never overwritten by older data. Deleted ids are
    /// left out.
    async fn write_bulk(self: Arc<Self>, ids: Vec<PairId>) {
        let _flushing = self.flush_lock.lock().await;
        let pairs: Vec<MessagePair> = ids
            .into_iter()
            .filter_map(|id| self.store.get_pair(id))
            .collect();
        if pairs.is_empty() {
            return;
        }
        let written: Vec<PairId> = pairs.iter().map(|pair| pair.id).collect();
        match self.adapter.save_pairs_bulk(pairs).await {
            Ok(()) => {
                self.record(|stats| stats.bulk_writes += 1);
                debug!(count = written.len(), "Bulk pair write done");
            }
            Err(err) => {
                warn!(count = written.len(), %err, "Bulk pair write failed, re-enqueueing");
                self.record(|stats| stats.failed_writes += 1);
                self.pending().pairs.extend(written);
                self.arm_retry();
            }
        }
    }

    /// Sleep for `delay`. Returns `false` if shutdown cut the wait short.
    async fn sleep_unless_closed(&self, delay: Duration) -> bool {
        let stop = self.shutdown.notified();
        if self.pending().closed {
            return false;
        }
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = stop => false,
        }
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(handle) = self.runtime.get() else {
            warn!("No runtime captured, dropping persistence task");
            return;
        };
        let mut tasks = lock(&self.tasks);
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(task, handle);
    }

    fn schedule(self: &Arc<Self>) {
        if self.config.debounce_ms == 0 {
            let inner = Arc::clone(self);
            self.spawn(async move {
                inner.flush().await;
            });
            return;
        }

        {
            let mut pending = self.pending();
            if pending.timer_armed {
                return;
            }
            pending.timer_armed = true;
        }

        let inner = Arc::clone(self);
        let delay = self.config.debounce();
        self.spawn(async move {
            inner.sleep_unless_closed(delay).await;
            inner.pending().timer_armed = false;
            inner.flush().await;
        });
    }

    fn arm_retry(self: &Arc<Self>) {
        {
            let mut pending = self.pending();
            if pending.retry_armed {
                return;
            }
            pending.retry_armed = true;
        }
        self.record(|stats| stats.retries_scheduled += 1);

        let Some(handle) = self.runtime.get() else {
            return;
        };
        let inner = Arc::clone(self);
        let delay = self.config.retry_delay();
        handle.spawn(async move {
            let elapsed = inner.sleep_unless_closed(delay).await;
            inner.pending().retry_armed = false;
            if elapsed {
                let again = Arc::clone(&inner);
                inner.spawn(async move {
                    again.flush().await;
                });
            }
        });
    }

    async fn flush(self: &Arc<Self>) -> FlushReport {
        let _flushing = self.flush_lock.lock().await;
        let (topic_ids, pair_ids) = {
            let mut pending = self.pending();
            (mem::take(&mut pending.topics), mem::take(&mut pending.pairs))
        };

        let mut report = FlushReport::default();

        for id in topic_ids {
            let Some(topic) = self.store.get_topic(id) else {
                report.skipped += 1;
                continue;
            };
            match self.adapter.save_topic(topic).await {
                Ok(()) => report.topics_written += 1,
                Err(err) => {
                    warn!(topic = %id, %err, "Topic write failed, re-enqueueing");
                    report.failed += 1;
                    self.pending().topics.insert(id);
                }
            }
        }

        for id in pair_ids {
            let Some(pair) = self.store.get_pair(id) else {
                report.skipped += 1;
                continue;
            };
            match self.adapter.save_pair(pair).await {
                Ok(()) => report.pairs_written += 1,
                Err(err) => {
                    warn!(pair = %id, %err, "Pair write failed, re-enqueueing");
                    report.failed += 1;
                    self.pending().pairs.insert(id);
                }
            }
        }

        if report.is_empty() {
            return report;
        }

        self.record(|stats| {
            stats.flushes += 1;
            stats.topics_written += report.topics_written as u64;
            stats.pairs_written += report.pairs_written as u64;
            stats.failed_writes += report.failed as u64;
        });
        debug!(
            topics = report.topics_written,
            pairs = report.pairs_written,
            skipped = report.skipped,
            failed = report.failed,
            "Flush done"
        );
        if report.failed > 0 {
            self.arm_retry();
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::history::core::pair::{ColorFlag, NewPair, PairPatch};
    use crate::history::core::topic::Topic;
    use crate::history::persistence::memory_adapter::{MemoryStorageAdapter, WriteOp};

    fn config(debounce_ms: u64) -> PersistenceConfig {
        PersistenceConfig {
            debounce_ms,
            ..PersistenceConfig::default()
        }
    }

    async fn started(
        adapter: &Arc<MemoryStorageAdapter>,
        debounce_ms: u64,
    ) -> (Arc<ConversationStore>, PersistenceCoordinator) {
        let store = Arc::new(ConversationStore::new());
        let coordinator = PersistenceCoordinator::new(
            Arc::clone(&store),
            Arc::clone(adapter) as Arc<dyn StorageAdapter>,
            config(debounce_ms),
        );
        coordinator.init().await.unwrap();
        coordinator.settle().await;
        adapter.clear_writes();
        (store, coordinator)
    }

    fn pair_writes(writes: &[WriteOp]) -> Vec<PairId> {
        writes
            .iter()
            .filter_map(|op| match op {
                WriteOp::SavePair(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_runtime_required_for_init() {
        assert!(matches!(current_runtime(), Err(HistoryError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_init_twice_is_rejected() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (_store, coordinator) = started(&adapter, 0).await;
        assert_eq!(coordinator.state(), CoordinatorState::Wired);
        assert_eq!(adapter.init_calls(), 1);
        assert!(matches!(
            coordinator.init().await,
            Err(HistoryError::InvalidState(_))
        ));
        assert!(coordinator.wire().is_ok());
    }

    #[tokio::test]
    async fn test_wire_before_init_is_rejected() {
        let coordinator = PersistenceCoordinator::new(
            Arc::new(ConversationStore::new()),
            Arc::new(MemoryStorageAdapter::new()),
            PersistenceConfig::default(),
        );
        assert!(matches!(coordinator.wire(), Err(HistoryError::InvalidState(_))));
        assert_eq!(coordinator.state(), CoordinatorState::Uninitialized);
    }

    #[tokio::test]
    async fn test_failed_load_leaves_uninitialized() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        adapter.set_failing(true);
        let coordinator = PersistenceCoordinator::new(
            Arc::new(ConversationStore::new()),
            Arc::clone(&adapter) as Arc<dyn StorageAdapter>,
            PersistenceConfig::default(),
        );
        assert!(matches!(coordinator.init().await, Err(HistoryError::Storage(_))));
        assert_eq!(coordinator.state(), CoordinatorState::Uninitialized);

        adapter.set_failing(false);
        assert!(coordinator.init().await.is_ok());
    }

    #[tokio::test]
    async fn test_initial_seeding_writes_everything() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let work = Topic::new("Work", TopicId::ROOT);
        adapter.seed_topic(&work).unwrap();
        let pair = NewPair::new(work.id, "m", "q", "a").into_pair();
        adapter
            .seed_pair_json(serde_json::to_value(&pair).unwrap())
            .unwrap();

        let store = Arc::new(ConversationStore::new());
        let coordinator = PersistenceCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&adapter) as Arc<dyn StorageAdapter>,
            config(0),
        );
        let report = coordinator.init().await.unwrap();
        coordinator.settle().await;

        assert_eq!(report.topics_loaded, 1);
        assert_eq!(report.pairs_loaded, 1);
        assert!(report.schema_version_written);
        let writes = adapter.writes();
        assert!(writes.contains(&WriteOp::SaveTopic(TopicId::ROOT)));
        assert!(writes.contains(&WriteOp::SaveTopic(work.id)));
        assert!(writes.contains(&WriteOp::SavePair(pair.id)));
        assert_eq!(coordinator.pending_len(), 0);
        assert_eq!(store.get_topic(work.id).unwrap().total_count, 1);
        assert_eq!(store.get_topic(TopicId::ROOT).unwrap().total_count, 1);
    }

    #[tokio::test]
    async fn test_schema_version_kept_when_present() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        adapter.seed_meta(MetaRecord {
            name: SCHEMA_VERSION_KEY.to_string(),
            value: json!(7),
        });
        let coordinator = PersistenceCoordinator::new(
            Arc::new(ConversationStore::new()),
            Arc::clone(&adapter) as Arc<dyn StorageAdapter>,
            config(0),
        );
        let report = coordinator.init().await.unwrap();
        coordinator.settle().await;

        assert!(!report.schema_version_written);
        assert_eq!(adapter.meta(SCHEMA_VERSION_KEY).unwrap().value, json!(7));
        assert!(
            !adapter
                .writes()
                .iter()
                .any(|op| matches!(op, WriteOp::SaveMeta(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_coalesce_into_one_write() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 400).await;

        let id = store.add_message_pair(NewPair::new(TopicId::ROOT, "m", "q", ""));
        for n in 1..=5 {
            store.update_pair(id, &PairPatch::new().with_assistant_text(format!("part {n}")));
        }
        assert_eq!(coordinator.pending_len(), 1);

        coordinator.settle().await;
        assert_eq!(adapter.writes(), vec![WriteOp::SavePair(id)]);
        let stored = adapter.pair_json(id).unwrap();
        assert_eq!(stored["assistantText"], json!("part 5"));
        assert_eq!(coordinator.stats().pairs_written, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_window_starts_at_first_mutation() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 400).await;

        let first = store.add_topic("A", TopicId::ROOT).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        let second = store.add_topic("B", TopicId::ROOT).unwrap();
        tokio::time::sleep(Duration::from_millis(99)).await;
        assert!(adapter.writes().is_empty());

        tokio::time::sleep(Duration::from_millis(2)).await;
        coordinator.settle().await;
        let writes = adapter.writes();
        assert_eq!(writes.len(), 2);
        assert!(writes.contains(&WriteOp::SaveTopic(first)));
        assert!(writes.contains(&WriteOp::SaveTopic(second)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deletes_bypass_debounce() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 60_000).await;

        let doomed = store.add_topic("Doomed", TopicId::ROOT).unwrap();
        let kept = store.add_message_pair(NewPair::new(TopicId::ROOT, "m", "q", "a"));
        coordinator.flush().await;
        adapter.clear_writes();

        store.update_pair(kept, &PairPatch::new().with_star(2));
        assert!(store.delete_topic(doomed));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(adapter.writes(), vec![WriteOp::DeleteTopic(doomed)]);
        assert!(adapter.topic(doomed).is_none());
        assert_eq!(coordinator.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_delete_bypasses_debounce() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 60_000).await;

        let doomed = store.add_message_pair(NewPair::new(TopicId::ROOT, "m", "q1", "a"));
        let kept = store.add_message_pair(NewPair::new(TopicId::ROOT, "m", "q2", "a"));
        coordinator.flush().await;
        adapter.clear_writes();

        store.update_pair(kept, &PairPatch::new().with_star(1));
        assert!(store.delete_pair(doomed));
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(adapter.writes(), vec![WriteOp::DeletePair(doomed)]);
        assert!(adapter.pair_json(doomed).is_none());
        assert_eq!(coordinator.pending_len(), 1);
        assert_eq!(coordinator.stats().deletes_written, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deleted_before_flush_is_skipped() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 60_000).await;

        let id = store.add_message_pair(NewPair::new(TopicId::ROOT, "m", "q", "a"));
        assert!(store.delete_pair(id));
        let report = coordinator.flush().await;
        coordinator.settle().await;

        assert_eq!(report.pairs_written, 0);
        assert!(pair_writes(&adapter.writes()).is_empty());
        assert!(adapter.pair_json(id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_update_written_immediately() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 60_000).await;

        let ids: Vec<PairId> = (0..3)
            .map(|n| store.add_message_pair(NewPair::new(TopicId::ROOT, "m", format!("q{n}"), "a")))
            .collect();
        coordinator.flush().await;
        adapter.clear_writes();

        let updated = store.bulk_update_pairs(&ids, &PairPatch::new().with_color(ColorFlag::Grey));
        assert_eq!(updated, 3);
        tokio::time::sleep(Duration::from_millis(1)).await;

        let writes = adapter.writes();
        assert_eq!(writes.len(), 1);
        let WriteOp::SavePairsBulk(written) = &writes[0] else {
            panic!("expected a bulk write, got {writes:?}");
        };
        assert_eq!(written.len(), 3);
        for id in &ids {
            assert_eq!(adapter.pair_json(*id).unwrap()["colorFlag"], json!("grey"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_write_does_not_overwrite_newer_flush() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 60_000).await;

        let id = store.add_message_pair(NewPair::new(TopicId::ROOT, "m", "q", "a"));
        coordinator.flush().await;

        store.bulk_update_pairs(&[id], &PairPatch::new().with_color(ColorFlag::Grey));
        store.update_pair(id, &PairPatch::new().with_assistant_text("latest"));
        coordinator.flush().await;
        coordinator.settle().await;

        let stored = adapter.pair_json(id).unwrap();
        assert_eq!(stored["assistantText"], json!("latest"));
        assert_eq!(stored["colorFlag"], json!("grey"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bulk_write_leaves_out_deleted_pairs() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 60_000).await;

        let gone = store.add_message_pair(NewPair::new(TopicId::ROOT, "m", "q1", "a"));
        let kept = store.add_message_pair(NewPair::new(TopicId::ROOT, "m", "q2", "a"));
        coordinator.flush().await;
        adapter.clear_writes();

        store.bulk_update_pairs(&[gone, kept], &PairPatch::new().with_color(ColorFlag::Grey));
        assert!(store.delete_pair(gone));
        coordinator.settle().await;

        assert_eq!(
            adapter.writes(),
            vec![WriteOp::SavePairsBulk(vec![kept]), WriteOp::DeletePair(gone)]
        );
        assert!(adapter.pair_json(gone).is_none());
    }

    #[tokio::test]
    async fn test_undecodable_rows_are_skipped_on_load() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        adapter
            .seed_topic_json(json!({ "id": TopicId::new(), "parentId": 5 }))
            .unwrap();
        let broken = adapter
            .seed_pair_json(json!({
                "id": PairId::new(),
                "createdAt": "2024-01-01T00:00:00Z",
                "topicId": TopicId::ROOT,
            }))
            .unwrap();
        let loud = adapter
            .seed_pair_json(json!({
                "id": PairId::new(),
                "createdAt": 10,
                "topicId": TopicId::ROOT,
                "userText": "q",
                "assistantText": "a",
                "star": 300,
            }))
            .unwrap();

        let store = Arc::new(ConversationStore::new());
        let coordinator = PersistenceCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&adapter) as Arc<dyn StorageAdapter>,
            config(0),
        );
        let report = coordinator.init().await.unwrap();
        coordinator.settle().await;

        assert_eq!(report.skipped_topics, 1);
        assert_eq!(report.skipped_pairs, 1);
        assert_eq!(report.pairs_loaded, 1);
        assert!(store.get_pair(broken).is_none());
        assert_eq!(store.get_pair(loud).unwrap().star, 3);
        assert_eq!(adapter.pair_json(loud).unwrap()["star"], json!(3));
        assert_eq!(adapter.pair_rows(), 2);
        assert_eq!(adapter.topic_rows(), 2);
    }

    #[tokio::test]
    async fn test_topic_move_is_persisted() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 0).await;

        let a = store.add_topic("A", TopicId::ROOT).unwrap();
        let b = store.add_topic("B", TopicId::ROOT).unwrap();
        coordinator.settle().await;
        assert!(store.move_topic(b, a));
        coordinator.settle().await;

        assert_eq!(adapter.topic(b).unwrap().parent_id, Some(a));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_retried() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 0).await;

        adapter.set_failing(true);
        let id = store.add_topic("Flaky", TopicId::ROOT).unwrap();
        coordinator.settle().await;

        let stats = coordinator.stats();
        assert_eq!(stats.failed_writes, 1);
        assert_eq!(stats.retries_scheduled, 1);
        assert_eq!(coordinator.pending_len(), 1);
        assert!(adapter.topic(id).is_none());

        adapter.set_failing(false);
        tokio::time::sleep(PersistenceConfig::default().retry_delay() + Duration::from_millis(1))
            .await;
        coordinator.settle().await;

        assert_eq!(coordinator.pending_len(), 0);
        assert_eq!(adapter.topic(id).unwrap().name, "Flaky");
    }

    #[tokio::test]
    async fn test_failed_delete_is_counted_not_retried() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 0).await;

        let id = store.add_message_pair(NewPair::new(TopicId::ROOT, "m", "q", "a"));
        coordinator.settle().await;
        adapter.set_failing(true);
        assert!(store.delete_pair(id));
        coordinator.settle().await;

        let stats = coordinator.stats();
        assert_eq!(stats.failed_deletes, 1);
        assert_eq!(stats.retries_scheduled, 0);
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_legacy_flags_and_roots_migrate_on_load() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let mut stale = Topic::root();
        stale.id = TopicId::new();
        let child = Topic::new("Work", stale.id);
        adapter.seed_topic(&stale).unwrap();
        adapter.seed_topic(&child).unwrap();

        let excluded = adapter
            .seed_pair_json(json!({
                "id": PairId::new(),
                "createdAt": 10,
                "topicId": child.id,
                "userText": "q1",
                "assistantText": "a1",
                "includeInContext": false,
            }))
            .unwrap();
        let included = adapter
            .seed_pair_json(json!({
                "id": PairId::new(),
                "createdAt": 20,
                "topicId": stale.id,
                "userText": "q2",
                "assistantText": "a2",
                "includeContext": true,
            }))
            .unwrap();

        let store = Arc::new(ConversationStore::new());
        let coordinator = PersistenceCoordinator::new(
            Arc::clone(&store),
            Arc::clone(&adapter) as Arc<dyn StorageAdapter>,
            config(0),
        );
        let report = coordinator.init().await.unwrap();
        coordinator.settle().await;

        assert_eq!(report.migrated_pairs, 2);
        assert_eq!(report.reconcile.stale_roots, vec![stale.id]);
        assert!(store.get_topic(stale.id).is_none());
        assert_eq!(store.get_topic(child.id).unwrap().parent_id, Some(TopicId::ROOT));
        assert_eq!(store.get_pair(excluded).unwrap().color_flag, ColorFlag::Grey);
        let moved = store.get_pair(included).unwrap();
        assert_eq!(moved.color_flag, ColorFlag::Blue);
        assert_eq!(moved.topic_id, TopicId::ROOT);
        assert_eq!(store.get_topic(TopicId::ROOT).unwrap().total_count, 2);

        assert!(adapter.topic(stale.id).is_none());
        let row = adapter.pair_json(excluded).unwrap();
        assert_eq!(row["colorFlag"], json!("grey"));
        assert!(row.get("includeInContext").is_none());

        let restarted = PersistenceCoordinator::new(
            Arc::new(ConversationStore::new()),
            Arc::clone(&adapter) as Arc<dyn StorageAdapter>,
            config(0),
        );
        let again = restarted.init().await.unwrap();
        restarted.settle().await;
        assert_eq!(again.migrated_pairs, 0);
        assert!(again.reconcile.is_noop());
        assert!(!again.schema_version_written);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_mirroring() {
        let adapter = Arc::new(MemoryStorageAdapter::new());
        let (store, coordinator) = started(&adapter, 60_000).await;

        let id = store.add_topic("Last", TopicId::ROOT).unwrap();
        coordinator.shutdown().await;
        assert_eq!(adapter.writes(), vec![WriteOp::SaveTopic(id)]);
        assert_eq!(coordinator.pending_len(), 0);

        adapter.clear_writes();
        store.add_topic("Ignored", TopicId::ROOT).unwrap();
        coordinator.settle().await;
        assert!(adapter.writes().is_empty());
    }
}
