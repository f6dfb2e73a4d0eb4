//! Conversation history for a chat client.
//!
//! - `core`: configuration, errors, ids, topics and message pairs
//! - `store`: the in-memory topic tree with rollup counts and its event channel
//! - `persistence`: storage adapters, load-time migration and debounced write-back

pub mod core;
pub mod persistence;
pub mod store;

pub use self::core::{
    ColorFlag, HistoryConfig, HistoryError, HistoryResult, LifecycleState, MessagePair, NewPair,
    PairId, PairPatch, PersistenceConfig, StorageConfig, Topic, TopicId,
};
pub use persistence::{
    MemoryStorageAdapter, PersistenceCoordinator, SqliteStorageAdapter, StorageAdapter,
};
pub use store::{ConversationStore, EventKind, StoreEvent, Subscription};
