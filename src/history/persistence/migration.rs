//! Load-time repairs applied to rows read back from storage.
//!
//! Both passes are pure and idempotent: feeding their output back in changes
//! nothing.

use std::collections::HashSet;

use tracing::warn;

use crate::history::core::ids::TopicId;
use crate::history::core::pair::{ColorFlag, MAX_STAR, MessagePair};
use crate::history::core::topic::Topic;
use crate::history::persistence::adapter::StoredPair;

/// What [`reconcile_legacy_roots`] changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Ids of stale root rows that were dropped.
    pub stale_roots: Vec<TopicId>,
    /// Topics whose parent was a stale root.
    pub reparented_topics: usize,
    /// Pairs whose topic was a stale root.
    pub reparented_pairs: usize,
    /// Topics with no parent or a missing parent, attached under the root.
    pub orphan_topics: usize,
    /// Pairs pointing at a missing topic, moved to the root.
    pub orphan_pairs: usize,
}

impl ReconcileReport {
    /// Whether the pass left its input untouched.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.stale_roots.is_empty()
            && self.reparented_topics == 0
            && self.reparented_pairs == 0
            && self.orphan_topics == 0
            && self.orphan_pairs == 0
    }
}

/// Output of [`reconcile_legacy_roots`].
#[derive(Clone, Debug, Default)]
pub struct Reconciled {
    /// Topics to import, stale roots excluded.
    pub topics: Vec<Topic>,
    /// Pairs to import.
    pub pairs: Vec<MessagePair>,
    /// Summary of the changes.
    pub report: ReconcileReport,
}

/// Fold roots left by the old id scheme into the fixed root.
///
/// A parentless topic named like the root but carrying another id is stale:
/// it is dropped and everything that pointed at it now points at
/// [`TopicId::ROOT`]. Any other topic without a reachable parent record, and
/// any pair whose topic is missing, is attached to the root as well.
#[must_use]
pub fn reconcile_legacy_roots(topics: Vec<Topic>, pairs: Vec<MessagePair>) -> Reconciled {
    let stale: HashSet<TopicId> = topics
        .iter()
        .filter(|topic| topic.is_legacy_root())
        .map(|topic| topic.id)
        .collect();
    let known: HashSet<TopicId> = topics
        .iter()
        .map(|topic| topic.id)
        .filter(|id| !stale.contains(id))
        .chain(std::iter::once(TopicId::ROOT))
        .collect();

    let mut report = ReconcileReport::default();
    let mut kept = Vec::with_capacity(topics.len());

    for mut topic in topics {
        if stale.contains(&topic.id) {
            report.stale_roots.push(topic.id);
            continue;
        }
        if topic.id.is_root() {
            kept.push(topic);
            continue;
        }
        match topic.parent_id {
            Some(parent) if stale.contains(&parent) => {
                topic.parent_id = Some(TopicId::ROOT);
                report.reparented_topics += 1;
            }
            Some(parent) if known.contains(&parent) => {}
            Some(parent) => {
                warn!(topic = %topic.id, parent = %parent, "Topic parent missing, attaching under root");
                topic.parent_id = Some(TopicId::ROOT);
                report.orphan_topics += 1;
            }
            None => {
                warn!(topic = %topic.id, name = %topic.name, "Parentless topic, attaching under root");
                topic.parent_id = Some(TopicId::ROOT);
                report.orphan_topics += 1;
            }
        }
        kept.push(topic);
    }

    let pairs = pairs
        .into_iter()
        .map(|mut pair| {
            if stale.contains(&pair.topic_id) {
                pair.topic_id = TopicId::ROOT;
                report.reparented_pairs += 1;
            } else if !known.contains(&pair.topic_id) {
                warn!(pair = %pair.id, topic = %pair.topic_id, "Pair topic missing, moving to root");
                pair.topic_id = TopicId::ROOT;
                report.orphan_pairs += 1;
            }
            pair
        })
        .collect();

    report.stale_roots.sort_unstable();
    Reconciled {
        topics: kept,
        pairs,
        report,
    }
}

/// Whether a stored row predates the color flag or still carries a legacy
/// include flag.
#[must_use]
pub fn needs_pair_migration(row: &StoredPair) -> bool {
    row.color_flag.is_none() || row.include_in_context.is_some() || row.include_context.is_some()
}

/// Turn a stored row into a current pair.
///
/// A row without `colorFlag` takes it from `includeInContext`, falling back
/// to `includeContext`: included is blue, anything else grey. Legacy fields
/// are dropped and the rating is clamped.
#[must_use]
pub fn migrate_pair(row: StoredPair) -> MessagePair {
    let color_flag = row.color_flag.unwrap_or_else(|| {
        let included = row.include_in_context.or(row.include_context).unwrap_or(false);
        ColorFlag::from_included(included)
    });

    MessagePair {
        id: row.id,
        created_at: row.created_at,
        topic_id: row.topic_id,
        model: row.model,
        star: u8::try_from(row.star.clamp(0, i64::from(MAX_STAR))).unwrap_or(MAX_STAR),
        color_flag,
        user_text: row.user_text,
        assistant_text: row.assistant_text,
        lifecycle_state: row.lifecycle_state,
        error_message: row.error_message,
        token_length: row.token_length,
    }
}
