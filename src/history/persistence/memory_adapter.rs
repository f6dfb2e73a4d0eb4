//! In-memory storage adapter.
//!
//! Keeps rows as JSON documents in concurrent maps, the same shape a
//! key-value object store would hold. Used for ephemeral sessions and tests;
//! it records every successful write and can simulate a backend outage.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;

use crate::history::core::errors::{HistoryError, HistoryResult};
use crate::history::core::ids::{PairId, TopicId};
use crate::history::core::pair::MessagePair;
use crate::history::core::topic::Topic;
use crate::history::persistence::adapter::{
    LoadedRows, MetaRecord, StorageAdapter, StoreFuture, StoredPair, decode_rows,
};

/// A write that reached the adapter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    /// `save_topic`.
    SaveTopic(TopicId),
    /// `save_pair`.
    SavePair(PairId),
    /// `save_pairs_bulk`.
    SavePairsBulk(Vec<PairId>),
    /// `delete_topic`.
    DeleteTopic(TopicId),
    /// `delete_pair`.
    DeletePair(PairId),
    /// `save_meta`.
    SaveMeta(String),
}

/// Storage adapter backed by in-process maps.
#[derive(Default)]
pub struct MemoryStorageAdapter {
    topics: DashMap<TopicId, serde_json::Value>,
    pairs: DashMap<PairId, serde_json::Value>,
    meta: DashMap<String, MetaRecord>,
    writes: Mutex<Vec<WriteOp>>,
    failing: AtomicBool,
    init_calls: AtomicUsize,
}

impl MemoryStorageAdapter {
    /// Create an empty adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self) -> MutexGuard<'_, Vec<WriteOp>> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> HistoryResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HistoryError::Storage("memory adapter unavailable".to_string()));
        }
        Ok(())
    }

    /// Insert a topic row directly, bypassing the write log.
    ///
    /// # Errors
    /// Returns an error if the topic cannot be serialized.
    pub fn seed_topic(&self, topic: &Topic) -> HistoryResult<()> {
        self.topics.insert(topic.id, serde_json::to_value(topic)?);
        Ok(())
    }

    /// Insert a raw pair document directly, bypassing the write log.
    ///
    /// The document may use any historical row shape. Only its `id` has to
    /// be readable; the rest is decoded at load time.
    ///
    /// # Errors
    /// Returns an error if the document has no valid `id`.
    pub fn seed_pair_json(&self, document: serde_json::Value) -> HistoryResult<PairId> {
        let id: PairId = serde_json::from_value(document.get("id").cloned().unwrap_or_default())?;
        self.pairs.insert(id, document);
        Ok(id)
    }

    /// Insert a raw topic document directly, bypassing the write log.
    ///
    /// # Errors
    /// Returns an error if the document has no valid `id`.
    pub fn seed_topic_json(&self, document: serde_json::Value) -> HistoryResult<TopicId> {
        let id: TopicId = serde_json::from_value(document.get("id").cloned().unwrap_or_default())?;
        self.topics.insert(id, document);
        Ok(id)
    }

    /// Insert a metadata row directly, bypassing the write log.
    pub fn seed_meta(&self, record: MetaRecord) {
        self.meta.insert(record.name.clone(), record);
    }

    /// Make every subsequent operation fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Writes that succeeded so far, oldest first.
    #[must_use]
    pub fn writes(&self) -> Vec<WriteOp> {
        self.log().clone()
    }

    /// Forget the recorded writes.
    pub fn clear_writes(&self) {
        self.log().clear();
    }

    /// Number of `init` calls.
    #[must_use]
    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    /// Stored topic row.
    #[must_use]
    pub fn topic(&self, id: TopicId) -> Option<Topic> {
        self.topics
            .get(&id)
            .and_then(|doc| serde_json::from_value(doc.value().clone()).ok())
    }

    /// Stored pair document, as written.
    #[must_use]
    pub fn pair_json(&self, id: PairId) -> Option<serde_json::Value> {
        self.pairs.get(&id).map(|doc| doc.value().clone())
    }

    /// Stored metadata row.
    #[must_use]
    pub fn meta(&self, name: &str) -> Option<MetaRecord> {
        self.meta.get(name).map(|record| record.value().clone())
    }

    /// Number of stored topic rows.
    #[must_use]
    pub fn topic_rows(&self) -> usize {
        self.topics.len()
    }

    /// Number of stored pair rows.
    #[must_use]
    pub fn pair_rows(&self) -> usize {
        self.pairs.len()
    }

    fn put_pair(&self, pair: &MessagePair) -> HistoryResult<()> {
        self.pairs.insert(pair.id, serde_json::to_value(pair)?);
        Ok(())
    }
}

impl StorageAdapter for MemoryStorageAdapter {
    fn init(&self) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.init_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn get_all_topics(&self) -> StoreFuture<'_, HistoryResult<LoadedRows<Topic>>> {
        Box::pin(async move {
            self.check_available()?;
            let docs: Vec<serde_json::Value> =
                self.topics.iter().map(|doc| doc.value().clone()).collect();
            Ok(decode_rows("topics", docs, serde_json::from_value))
        })
    }

    fn get_all_pairs(&self) -> StoreFuture<'_, HistoryResult<LoadedRows<StoredPair>>> {
        Box::pin(async move {
            self.check_available()?;
            let docs: Vec<serde_json::Value> =
                self.pairs.iter().map(|doc| doc.value().clone()).collect();
            Ok(decode_rows("pairs", docs, serde_json::from_value))
        })
    }

    fn save_topic(&self, topic: Topic) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.topics.insert(topic.id, serde_json::to_value(&topic)?);
            self.log().push(WriteOp::SaveTopic(topic.id));
            Ok(())
        })
    }

    fn save_pair(&self, pair: MessagePair) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.put_pair(&pair)?;
            self.log().push(WriteOp::SavePair(pair.id));
            Ok(())
        })
    }

    fn save_pairs_bulk(&self, pairs: Vec<MessagePair>) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            for pair in &pairs {
                self.put_pair(pair)?;
            }
            self.log()
                .push(WriteOp::SavePairsBulk(pairs.iter().map(|pair| pair.id).collect()));
            Ok(())
        })
    }

    fn delete_topic(&self, id: TopicId) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.topics.remove(&id);
            self.log().push(WriteOp::DeleteTopic(id));
            Ok(())
        })
    }

    fn delete_pair(&self, id: PairId) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            self.pairs.remove(&id);
            self.log().push(WriteOp::DeletePair(id));
            Ok(())
        })
    }

    fn get_meta(&self, name: &str) -> StoreFuture<'_, HistoryResult<Option<MetaRecord>>> {
        let name = name.to_string();
        Box::pin(async move {
            self.check_available()?;
            Ok(self.meta(&name))
        })
    }

    fn save_meta(&self, record: MetaRecord) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            self.check_available()?;
            let name = record.name.clone();
            self.meta.insert(name.clone(), record);
            self.log().push(WriteOp::SaveMeta(name));
            Ok(())
        })
    }
}
