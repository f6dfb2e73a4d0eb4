//! Error types for the conversation history.

use thiserror::Error;

use crate::history::core::ids::TopicId;

/// Conversation history error type.
///
/// Invariant rejections (deleting the root, moving a topic under its own
/// descendant, updating an unknown id) are not errors: the store reports them
/// as `false`. This type is for faults.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A topic id that does not exist in the store.
    #[error("unknown topic: {0}")]
    UnknownTopic(TopicId),
    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// Topic tree is not a rooted tree (cycle or dangling parent).
    #[error("corrupt topic tree: {0}")]
    CorruptTree(String),
    /// Storage backend failure not covered by a more specific variant.
    #[error("storage error: {0}")]
    Storage(String),
    /// `SQLite` storage error (async).
    #[error("tokio-rusqlite error: {0}")]
    TokioSqlite(#[from] tokio_rusqlite::Error),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result alias for history operations.
pub type HistoryResult<T> = Result<T, HistoryError>;
