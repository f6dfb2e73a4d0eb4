//! In-memory conversation store: the topic tree and the flat pair collection.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::history::core::errors::{HistoryError, HistoryResult};
use crate::history::core::ids::{PairId, TopicId};
use crate::history::core::pair::{MessagePair, NewPair, PairPatch};
use crate::history::core::topic::Topic;
use crate::history::store::events::{EventBus, EventKind, StoreEvent, Subscription};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Step {
    Up,
    Down,
}

/// Topic → ancestors walk result.
struct Chain {
    /// The starting topic followed by its ancestors, nearest first.
    ids: Vec<TopicId>,
    /// Whether the walk ended at the root.
    reaches_root: bool,
}

#[derive(Default)]
struct StoreState {
    topics: HashMap<TopicId, Topic>,
    pairs: HashMap<PairId, MessagePair>,
    children: HashMap<TopicId, HashSet<TopicId>>,
}

impl StoreState {
    fn with_root() -> Self {
        let mut state = Self::default();
        state.topics.insert(TopicId::ROOT, Topic::root());
        state
    }

    /// Walk from `id` towards the root.
    ///
    /// Stops at the first revisited topic, so a cycle in imported data ends
    /// the walk instead of looping.
    fn chain(&self, id: TopicId) -> Chain {
        let mut ids = Vec::new();
        let mut cursor = Some(id);

        while let Some(current) = cursor {
            if ids.contains(&current) {
                return Chain {
                    ids,
                    reaches_root: false,
                };
            }
            let Some(topic) = self.topics.get(&current) else {
                return Chain {
                    ids,
                    reaches_root: false,
                };
            };
            ids.push(current);
            cursor = topic.parent_id;
        }

        let reaches_root = ids.last().is_some_and(|last| last.is_root());
        Chain { ids, reaches_root }
    }

    /// Whether `candidate` is `ancestor` or lies below it.
    fn is_within(&self, candidate: TopicId, ancestor: TopicId) -> bool {
        self.chain(candidate).ids.contains(&ancestor)
    }

    /// Point `id` at `new_parent`, keeping the children index in step.
    ///
    /// The only code path that changes `parent_id` on a stored topic.
    fn reparent(&mut self, id: TopicId, new_parent: Option<TopicId>) {
        let Some(topic) = self.topics.get_mut(&id) else {
            return;
        };
        let old_parent = std::mem::replace(&mut topic.parent_id, new_parent);

        if let Some(old) = old_parent {
            if let Some(siblings) = self.children.get_mut(&old) {
                siblings.remove(&id);
                if siblings.is_empty() {
                    self.children.remove(&old);
                }
            }
        }
        if let Some(parent) = new_parent {
            self.children.entry(parent).or_default().insert(id);
        }
    }

    fn insert_topic(&mut self, topic: Topic) {
        let id = topic.id;
        let parent = topic.parent_id;
        if self.topics.contains_key(&id) {
            // Detach from the previous parent before the record is replaced.
            self.reparent(id, None);
        }
        self.topics.insert(id, topic);
        if let Some(parent) = parent {
            self.children.entry(parent).or_default().insert(id);
        }
    }

    fn remove_topic(&mut self, id: TopicId) -> Option<Topic> {
        self.reparent(id, None);
        self.children.remove(&id);
        self.topics.remove(&id)
    }

    fn rebuild_children(&mut self) {
        self.children.clear();
        for topic in self.topics.values() {
            if let Some(parent) = topic.parent_id {
                self.children.entry(parent).or_default().insert(topic.id);
            }
        }
    }

    /// Apply one pair arriving in or leaving `topic_id` to its ancestor chain.
    fn step_counts(&mut self, topic_id: TopicId, step: Step, created_at: i64) -> Vec<TopicId> {
        let chain = self.chain(topic_id).ids;
        for (depth, id) in chain.iter().enumerate() {
            let Some(topic) = self.topics.get_mut(id) else {
                continue;
            };
            match step {
                Step::Up => {
                    if depth == 0 {
                        topic.direct_count += 1;
                    }
                    topic.total_count += 1;
                    topic.last_active_at = Some(
                        topic
                            .last_active_at
                            .map_or(created_at, |seen| seen.max(created_at)),
                    );
                }
                Step::Down => {
                    if depth == 0 {
                        topic.direct_count = topic.direct_count.saturating_sub(1);
                    }
                    topic.total_count = topic.total_count.saturating_sub(1);
                }
            }
        }
        chain
    }

    /// Full recount; returns the topics whose counts changed.
    fn recount(&mut self) -> Vec<TopicId> {
        let before: HashMap<TopicId, (u64, u64)> = self
            .topics
            .values()
            .map(|topic| (topic.id, (topic.direct_count, topic.total_count)))
            .collect();

        for topic in self.topics.values_mut() {
            topic.direct_count = 0;
            topic.total_count = 0;
        }
        for pair in self.pairs.values() {
            if let Some(topic) = self.topics.get_mut(&pair.topic_id) {
                topic.direct_count += 1;
            }
        }

        let direct: Vec<(TopicId, u64)> = self
            .topics
            .values()
            .filter(|topic| topic.direct_count > 0)
            .map(|topic| (topic.id, topic.direct_count))
            .collect();
        for (id, count) in direct {
            for ancestor in self.chain(id).ids {
                if let Some(topic) = self.topics.get_mut(&ancestor) {
                    topic.total_count += count;
                }
            }
        }

        let mut changed: Vec<TopicId> = self
            .topics
            .values()
            .filter(|topic| {
                before.get(&topic.id) != Some(&(topic.direct_count, topic.total_count))
            })
            .map(|topic| topic.id)
            .collect();
        changed.sort_unstable();
        changed
    }

    fn rebuild_last_active(&mut self) {
        for topic in self.topics.values_mut() {
            topic.last_active_at = None;
        }

        let mut newest: HashMap<TopicId, i64> = HashMap::new();
        for pair in self.pairs.values() {
            for id in self.chain(pair.topic_id).ids {
                let entry = newest.entry(id).or_insert(pair.created_at);
                *entry = (*entry).max(pair.created_at);
            }
        }
        for (id, at) in newest {
            if let Some(topic) = self.topics.get_mut(&id) {
                topic.last_active_at = Some(at);
            }
        }
    }

    fn unreachable_topics(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self
            .topics
            .keys()
            .copied()
            .filter(|id| !self.chain(*id).reaches_root)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// Authoritative in-memory model of topics and message pairs.
///
/// Mutations run synchronously to completion under an internal lock, keep
/// the tree and rollup invariants, then emit their events once the lock is
/// released, so a listener may read or mutate the store from its callback.
///
/// Invariant rejections (unknown id, root protection, cycles) return `false`.
pub struct ConversationStore {
    state: RwLock<StoreState>,
    events: EventBus,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    /// Create a store holding only the root topic.
    ///
    /// The root's `TopicAdded` event is emitted here, before any listener can
    /// be attached.
    #[must_use]
    pub fn new() -> Self {
        let store = Self {
            state: RwLock::new(StoreState::with_root()),
            events: EventBus::new(),
        };
        store.events.emit(&StoreEvent::TopicAdded(TopicId::ROOT));
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the write lock, then emit the events it queued.
    fn mutate<R>(&self, f: impl FnOnce(&mut StoreState, &mut Vec<StoreEvent>) -> R) -> R {
        let mut queued = Vec::new();
        let result = {
            let mut state = self.write();
            f(&mut state, &mut queued)
        };
        for event in &queued {
            self.events.emit(event);
        }
        result
    }

    /// Subscribe to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, listener)
    }

    /// Identifier of the root topic.
    #[must_use]
    pub const fn root_id(&self) -> TopicId {
        TopicId::ROOT
    }

    // ===== Topics ===========================================================

    /// Create a topic under `parent_id`.
    ///
    /// # Errors
    /// Returns `HistoryError::UnknownTopic` if the parent does not exist.
    pub fn add_topic(&self, name: impl Into<String>, parent_id: TopicId) -> HistoryResult<TopicId> {
        let name = name.into();
        self.mutate(|state, events| {
            if !state.topics.contains_key(&parent_id) {
                return Err(HistoryError::UnknownTopic(parent_id));
            }
            let topic = Topic::new(name, parent_id);
            let id = topic.id;
            state.insert_topic(topic);
            events.push(StoreEvent::TopicAdded(id));
            debug!(topic = %id, parent = %parent_id, "Topic added");
            Ok(id)
        })
    }

    /// Rename a topic. Returns `false` if the id is unknown.
    pub fn rename_topic(&self, id: TopicId, name: impl Into<String>) -> bool {
        let name = name.into();
        self.mutate(|state, events| {
            let Some(topic) = state.topics.get_mut(&id) else {
                return false;
            };
            topic.name = name;
            events.push(StoreEvent::TopicUpdated(id));
            true
        })
    }

    /// Set the manual sibling order of a topic. Returns `false` if unknown.
    pub fn set_topic_sort_index(&self, id: TopicId, sort_index: Option<i64>) -> bool {
        self.mutate(|state, events| {
            let Some(topic) = state.topics.get_mut(&id) else {
                return false;
            };
            topic.sort_index = sort_index;
            events.push(StoreEvent::TopicUpdated(id));
            true
        })
    }

    /// Delete a topic.
    ///
    /// Refused for the root, unknown ids, topics with children and topics
    /// that still own pairs directly. Triggers a full recount.
    pub fn delete_topic(&self, id: TopicId) -> bool {
        self.mutate(|state, events| {
            if id.is_root() || !state.topics.contains_key(&id) {
                return false;
            }
            if state.children.get(&id).is_some_and(|kids| !kids.is_empty()) {
                return false;
            }
            if state.pairs.values().any(|pair| pair.topic_id == id) {
                return false;
            }

            state.remove_topic(id);
            events.push(StoreEvent::TopicDeleted(id));
            let changed = state.recount();
            if !changed.is_empty() {
                events.push(StoreEvent::TopicCountsChanged(changed));
            }
            debug!(topic = %id, "Topic deleted");
            true
        })
    }

    /// Move a topic under `new_parent_id`.
    ///
    /// Refused for the root, unknown ids, and any target inside the moved
    /// subtree (including the topic itself). Moving to the current parent is
    /// a successful no-op. Triggers a full recount.
    pub fn move_topic(&self, id: TopicId, new_parent_id: TopicId) -> bool {
        self.mutate(|state, events| {
            if id.is_root() {
                return false;
            }
            let Some(topic) = state.topics.get(&id) else {
                return false;
            };
            let old_parent = topic.parent_id;
            if !state.topics.contains_key(&new_parent_id) {
                return false;
            }
            if old_parent == Some(new_parent_id) {
                return true;
            }
            if state.is_within(new_parent_id, id) {
                return false;
            }

            state.reparent(id, Some(new_parent_id));
            events.push(StoreEvent::TopicMoved {
                id,
                from: old_parent,
                to: new_parent_id,
            });
            let changed = state.recount();
            if !changed.is_empty() {
                events.push(StoreEvent::TopicCountsChanged(changed));
            }
            debug!(topic = %id, parent = %new_parent_id, "Topic moved");
            true
        })
    }

    /// Recompute `direct_count` and `total_count` for every topic from scratch.
    pub fn recalculate_topic_counts(&self) {
        self.mutate(|state, events| {
            let changed = state.recount();
            if !changed.is_empty() {
                events.push(StoreEvent::TopicCountsChanged(changed));
            }
        });
    }

    /// Rebuild every derived aggregate: rollup counts and `last_active_at`.
    ///
    /// # Errors
    /// Returns `HistoryError::CorruptTree` if some topics cannot reach the
    /// root. The aggregates are still rebuilt for everything reachable.
    pub fn rebuild_aggregates(&self) -> HistoryResult<()> {
        self.mutate(|state, events| {
            let changed = state.recount();
            state.rebuild_last_active();
            if !changed.is_empty() {
                events.push(StoreEvent::TopicCountsChanged(changed));
            }

            let unreachable = state.unreachable_topics();
            if unreachable.is_empty() {
                return Ok(());
            }
            let listed: Vec<String> = unreachable.iter().map(ToString::to_string).collect();
            Err(HistoryError::CorruptTree(format!(
                "{} topic(s) cannot reach the root: {}",
                unreachable.len(),
                listed.join(", ")
            )))
        })
    }

    /// Names from the root down to `topic_id`. Empty if the id is unknown.
    #[must_use]
    pub fn get_topic_path(&self, topic_id: TopicId) -> Vec<String> {
        let state = self.read();
        let mut names: Vec<String> = state
            .chain(topic_id)
            .ids
            .iter()
            .filter_map(|id| state.topics.get(id).map(|topic| topic.name.clone()))
            .collect();
        names.reverse();
        names
    }

    /// Look up a topic.
    #[must_use]
    pub fn get_topic(&self, id: TopicId) -> Option<Topic> {
        self.read().topics.get(&id).cloned()
    }

    /// All topics, in no particular order.
    #[must_use]
    pub fn get_all_topics(&self) -> Vec<Topic> {
        self.read().topics.values().cloned().collect()
    }

    /// Number of topics, root included.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.read().topics.len()
    }

    /// Direct children of a topic, ordered by `sort_index` then creation time.
    #[must_use]
    pub fn children_of(&self, id: TopicId) -> Vec<TopicId> {
        let state = self.read();
        let mut kids: Vec<&Topic> = state
            .children
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|child| state.topics.get(child))
            .collect();
        kids.sort_by_key(|topic| (topic.sort_index.unwrap_or(i64::MAX), topic.created_at));
        kids.into_iter().map(|topic| topic.id).collect()
    }

    /// Snapshot of the `parent → children` index.
    #[must_use]
    pub fn children_index(&self) -> HashMap<TopicId, HashSet<TopicId>> {
        self.read().children.clone()
    }

    // ===== Pairs ============================================================

    /// Create a pair. Counts along the topic's ancestor chain are bumped
    /// incrementally.
    pub fn add_message_pair(&self, new_pair: NewPair) -> PairId {
        let pair = new_pair.into_pair();
        self.mutate(|state, events| {
            let id = pair.id;
            let topic_id = pair.topic_id;
            let created_at = pair.created_at;
            state.pairs.insert(id, pair);
            events.push(StoreEvent::PairAdded(id));

            let changed = state.step_counts(topic_id, Step::Up, created_at);
            if changed.is_empty() {
                warn!(pair = %id, topic = %topic_id, "Pair added to unknown topic");
            } else {
                events.push(StoreEvent::TopicCountsChanged(changed));
            }
            id
        })
    }

    /// Shallow-merge `patch` into a pair. Returns `false` if the id is unknown.
    ///
    /// A `topic_id` change moves one pair between ancestor chains
    /// incrementally, without a full recount.
    pub fn update_pair(&self, id: PairId, patch: &PairPatch) -> bool {
        self.mutate(|state, events| {
            let Some(pair) = state.pairs.get_mut(&id) else {
                return false;
            };
            let old_topic = pair.topic_id;
            patch.apply_to(pair);
            let new_topic = pair.topic_id;
            let created_at = pair.created_at;
            events.push(StoreEvent::PairUpdated(id));

            if old_topic != new_topic {
                let changed = move_pair_counts(state, old_topic, new_topic, created_at);
                if !changed.is_empty() {
                    events.push(StoreEvent::TopicCountsChanged(changed));
                }
            }
            true
        })
    }

    /// Apply one patch to many pairs and emit a single bulk event.
    ///
    /// Unknown ids are skipped. Returns the number of pairs updated.
    pub fn bulk_update_pairs(&self, ids: &[PairId], patch: &PairPatch) -> usize {
        self.mutate(|state, events| {
            let mut updated = Vec::with_capacity(ids.len());
            let mut changed: HashSet<TopicId> = HashSet::new();

            for id in ids {
                let Some(pair) = state.pairs.get_mut(id) else {
                    continue;
                };
                let old_topic = pair.topic_id;
                patch.apply_to(pair);
                let new_topic = pair.topic_id;
                let created_at = pair.created_at;
                updated.push(pair.clone());

                if old_topic != new_topic {
                    changed.extend(move_pair_counts(state, old_topic, new_topic, created_at));
                }
            }

            let count = updated.len();
            if count > 0 {
                events.push(StoreEvent::PairsBulkUpdated(updated));
            }
            if !changed.is_empty() {
                let mut changed: Vec<TopicId> = changed.into_iter().collect();
                changed.sort_unstable();
                events.push(StoreEvent::TopicCountsChanged(changed));
            }
            count
        })
    }

    /// Delete a pair. Returns `false` if the id is unknown.
    pub fn delete_pair(&self, id: PairId) -> bool {
        self.mutate(|state, events| {
            let Some(pair) = state.pairs.remove(&id) else {
                return false;
            };
            events.push(StoreEvent::PairDeleted(id));
            let changed = state.step_counts(pair.topic_id, Step::Down, pair.created_at);
            if !changed.is_empty() {
                events.push(StoreEvent::TopicCountsChanged(changed));
            }
            true
        })
    }

    /// Look up a pair.
    #[must_use]
    pub fn get_pair(&self, id: PairId) -> Option<MessagePair> {
        self.read().pairs.get(&id).cloned()
    }

    /// All pairs, in no particular order.
    #[must_use]
    pub fn get_all_pairs(&self) -> Vec<MessagePair> {
        self.read().pairs.values().cloned().collect()
    }

    /// Number of pairs.
    #[must_use]
    pub fn pair_count(&self) -> usize {
        self.read().pairs.len()
    }

    /// Pairs assigned directly to a topic, oldest first.
    #[must_use]
    pub fn pairs_in_topic(&self, topic_id: TopicId) -> Vec<MessagePair> {
        let mut pairs: Vec<MessagePair> = self
            .read()
            .pairs
            .values()
            .filter(|pair| pair.topic_id == topic_id)
            .cloned()
            .collect();
        pairs.sort_by_key(|pair| pair.created_at);
        pairs
    }

    // ===== Import ===========================================================

    /// Insert a loaded topic as-is, without events or count maintenance.
    ///
    /// A record for the root id only refreshes the root's name, creation
    /// time and sort index; the root always stays parentless.
    pub fn import_topic(&self, topic: Topic) {
        let mut state = self.write();
        if topic.id.is_root() {
            if let Some(root) = state.topics.get_mut(&TopicId::ROOT) {
                root.name = topic.name;
                root.created_at = topic.created_at;
                root.sort_index = topic.sort_index;
            }
            return;
        }
        state.insert_topic(topic);
    }

    /// Insert a loaded pair as-is, without events or count maintenance.
    pub fn import_pair(&self, pair: MessagePair) {
        self.write().pairs.insert(pair.id, pair);
    }

    /// Rebuild the children index from every topic's `parent_id`.
    pub fn rebuild_children_index(&self) {
        self.write().rebuild_children();
    }
}

fn move_pair_counts(
    state: &mut StoreState,
    from: TopicId,
    to: TopicId,
    created_at: i64,
) -> Vec<TopicId> {
    let mut changed = state.step_counts(from, Step::Down, created_at);
    for id in state.step_counts(to, Step::Up, created_at) {
        if !changed.contains(&id) {
            changed.push(id);
        }
    }
    changed
}
