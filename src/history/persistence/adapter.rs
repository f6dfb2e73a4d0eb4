//! Storage adapter contract and the record shapes that cross it.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::history::core::errors::HistoryResult;
use crate::history::core::ids::{PairId, TopicId};
use crate::history::core::pair::{ColorFlag, LifecycleState, MessagePair};
use crate::history::core::topic::Topic;

/// Boxed future type for storage adapter operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Meta key holding the schema version marker.
pub const SCHEMA_VERSION_KEY: &str = "schemaVersion";

/// Schema version written on first start.
pub const SCHEMA_VERSION: i64 = 1;

/// A single key/value metadata row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    /// Key.
    pub name: String,
    /// Value.
    pub value: serde_json::Value,
}

impl MetaRecord {
    /// The schema version marker for the current version.
    #[must_use]
    pub fn schema_version() -> Self {
        Self {
            name: SCHEMA_VERSION_KEY.to_string(),
            value: serde_json::Value::from(SCHEMA_VERSION),
        }
    }
}

/// A pair row as read back from storage.
///
/// Rows written by older versions may lack `colorFlag` and carry one of the
/// legacy include flags instead; `migration::migrate_pair` turns this into a
/// [`MessagePair`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPair {
    /// Unique identifier.
    pub id: PairId,
    /// Creation time in milliseconds since Unix epoch.
    #[serde(default)]
    pub created_at: i64,
    /// Owning topic.
    pub topic_id: TopicId,
    /// Model identifier.
    #[serde(default)]
    pub model: String,
    /// Rating as stored. Older rows may hold values outside `0..=MAX_STAR`.
    #[serde(default)]
    pub star: i64,
    /// Color marker, absent on legacy rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_flag: Option<ColorFlag>,
    /// User message body.
    #[serde(default)]
    pub user_text: String,
    /// Assistant reply body.
    #[serde(default)]
    pub assistant_text: String,
    /// Request status.
    #[serde(default)]
    pub lifecycle_state: LifecycleState,
    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Cached token estimate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_length: Option<u32>,
    /// Legacy include flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_in_context: Option<bool>,
    /// Older spelling of the legacy include flag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_context: Option<bool>,
}

impl From<MessagePair> for StoredPair {
    fn from(pair: MessagePair) -> Self {
        Self {
            id: pair.id,
            created_at: pair.created_at,
            topic_id: pair.topic_id,
            model: pair.model,
            star: i64::from(pair.star),
            color_flag: Some(pair.color_flag),
            user_text: pair.user_text,
            assistant_text: pair.assistant_text,
            lifecycle_state: pair.lifecycle_state,
            error_message: pair.error_message,
            token_length: pair.token_length,
            include_in_context: None,
            include_context: None,
        }
    }
}

/// Rows read back from one table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadedRows<T> {
    /// Rows that decoded.
    pub rows: Vec<T>,
    /// Documents that failed to decode. They stay in storage untouched.
    pub skipped: usize,
}

/// Decode stored documents one at a time.
///
/// A document that fails to decode is logged and counted instead of failing
/// the whole load.
#[must_use]
pub fn decode_rows<D, T>(
    table: &str,
    docs: impl IntoIterator<Item = D>,
    decode: impl Fn(D) -> serde_json::Result<T>,
) -> LoadedRows<T> {
    let mut loaded = LoadedRows {
        rows: Vec::new(),
        skipped: 0,
    };
    for doc in docs {
        match decode(doc) {
            Ok(row) => loaded.rows.push(row),
            Err(err) => {
                warn!(table, %err, "Skipping undecodable row");
                loaded.skipped += 1;
            }
        }
    }
    loaded
}

/// Async key-value backend for topics, pairs and metadata.
///
/// Saves are upserts by primary id. Deleting an absent id is not an error.
pub trait StorageAdapter: Send + Sync {
    /// Prepare the backend. Safe to call more than once.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn init(&self) -> StoreFuture<'_, HistoryResult<()>>;

    /// Load every topic row. Rows that fail to decode are skipped.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get_all_topics(&self) -> StoreFuture<'_, HistoryResult<LoadedRows<Topic>>>;

    /// Load every pair row. Rows that fail to decode are skipped.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get_all_pairs(&self) -> StoreFuture<'_, HistoryResult<LoadedRows<StoredPair>>>;

    /// Upsert one topic.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn save_topic(&self, topic: Topic) -> StoreFuture<'_, HistoryResult<()>>;

    /// Upsert one pair.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn save_pair(&self, pair: MessagePair) -> StoreFuture<'_, HistoryResult<()>>;

    /// Upsert many pairs as one logical batch.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn save_pairs_bulk(&self, pairs: Vec<MessagePair>) -> StoreFuture<'_, HistoryResult<()>>;

    /// Remove a topic row.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete_topic(&self, id: TopicId) -> StoreFuture<'_, HistoryResult<()>>;

    /// Remove a pair row.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn delete_pair(&self, id: PairId) -> StoreFuture<'_, HistoryResult<()>>;

    /// Read a metadata row.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn get_meta(&self, name: &str) -> StoreFuture<'_, HistoryResult<Option<MetaRecord>>>;

    /// Upsert a metadata row.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    fn save_meta(&self, record: MetaRecord) -> StoreFuture<'_, HistoryResult<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stored_pair_reads_legacy_row() {
        let json = format!(
            r#"{{"id":"{}","topicId":"{}","createdAt":7,"userText":"q","assistantText":"a","includeInContext":false}}"#,
            PairId::new(),
            TopicId::ROOT
        );
        let row: StoredPair = serde_json::from_str(&json).unwrap();
        assert_eq!(row.color_flag, None);
        assert_eq!(row.include_in_context, Some(false));
        assert_eq!(row.lifecycle_state, LifecycleState::Idle);
        assert_eq!(row.star, 0);
    }

    #[test]
    fn test_decode_rows_skips_bad_documents() {
        let good = serde_json::to_string(&Topic::root()).unwrap();
        let docs = vec![
            good.clone(),
            "not json".to_string(),
            r#"{"id":"00000000-0000-4000-8000-000000000001","name":"Root","createdAt":"2024-01-01T00:00:00Z"}"#
                .to_string(),
            good,
        ];
        let loaded: LoadedRows<Topic> =
            decode_rows("topics", docs, |doc: String| serde_json::from_str(&doc));
        assert_eq!(loaded.rows.len(), 2);
        assert_eq!(loaded.skipped, 2);
    }

    #[test]
    fn test_out_of_range_star_still_decodes() {
        let json = format!(
            r#"{{"id":"{}","topicId":"{}","star":300}}"#,
            PairId::new(),
            TopicId::ROOT
        );
        let row: StoredPair = serde_json::from_str(&json).unwrap();
        assert_eq!(row.star, 300);
    }

    #[test]
    fn test_schema_version_record() {
        let record = MetaRecord::schema_version();
        assert_eq!(record.name, "schemaVersion");
        assert_eq!(record.value.as_i64(), Some(SCHEMA_VERSION));
    }
}
