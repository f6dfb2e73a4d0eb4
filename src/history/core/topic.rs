//! Topic model: a node in the conversation classification tree.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::history::core::ids::TopicId;

/// Display name given to the root topic.
pub const ROOT_NAME: &str = "Root";

/// Name carried by root records written before the root id was fixed.
///
/// A parentless topic with this name and a non-root id is a stale former root.
pub const LEGACY_ROOT_NAME: &str = ROOT_NAME;

/// A topic node.
///
/// `direct_count`, `total_count` and `last_active_at` are derived aggregates
/// owned by the store; values read from storage are only a starting point and
/// get recomputed on load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    /// Unique identifier.
    pub id: TopicId,
    /// Display label, not required to be unique.
    pub name: String,
    /// Parent topic, `None` only for the root.
    #[serde(default)]
    pub parent_id: Option<TopicId>,
    /// Creation time in milliseconds since Unix epoch.
    pub created_at: i64,
    /// Number of pairs assigned directly to this topic.
    #[serde(default)]
    pub direct_count: u64,
    /// `direct_count` plus the `total_count` of every child.
    #[serde(default)]
    pub total_count: u64,
    /// Manual ordering among siblings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort_index: Option<i64>,
    /// Newest pair creation time in this topic's subtree.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<i64>,
}

impl Topic {
    /// Build a new topic under `parent_id` with zeroed counts.
    #[must_use]
    pub fn new(name: impl Into<String>, parent_id: TopicId) -> Self {
        Self {
            id: TopicId::new(),
            name: name.into(),
            parent_id: Some(parent_id),
            created_at: Utc::now().timestamp_millis(),
            direct_count: 0,
            total_count: 0,
            sort_index: None,
            last_active_at: None,
        }
    }

    /// Build the root topic.
    #[must_use]
    pub fn root() -> Self {
        Self {
            id: TopicId::ROOT,
            name: ROOT_NAME.to_string(),
            parent_id: None,
            created_at: Utc::now().timestamp_millis(),
            direct_count: 0,
            total_count: 0,
            sort_index: None,
            last_active_at: None,
        }
    }

    /// Whether this record looks like a root left over from the old id scheme.
    #[must_use]
    pub fn is_legacy_root(&self) -> bool {
        self.parent_id.is_none() && !self.id.is_root() && self.name == LEGACY_ROOT_NAME
    }
}
