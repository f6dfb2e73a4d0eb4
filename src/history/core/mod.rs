//! Core history types and identifiers.

pub mod config;
pub mod errors;
pub mod ids;
pub mod pair;
pub mod topic;

pub use config::{HistoryConfig, PersistenceConfig, StorageConfig};
pub use errors::{HistoryError, HistoryResult};
pub use ids::{PairId, TopicId};
pub use pair::{ColorFlag, LifecycleState, MAX_STAR, MessagePair, NewPair, PairPatch};
pub use topic::{LEGACY_ROOT_NAME, ROOT_NAME, Topic};
