//! Write-back persistence: the storage adapter contract, its backends,
//! load-time migration and the coordinator that ties them to the store.

pub mod adapter;
pub mod coordinator;
pub mod memory_adapter;
pub mod migration;
pub mod sqlite_adapter;

pub use adapter::{
    LoadedRows, MetaRecord, SCHEMA_VERSION, SCHEMA_VERSION_KEY, StorageAdapter, StoreFuture,
    StoredPair, decode_rows,
};
pub use coordinator::{
    CoordinatorState, FlushReport, LoadReport, PersistenceCoordinator, PersistenceStats,
};
pub use memory_adapter::{MemoryStorageAdapter, WriteOp};
pub use migration::{ReconcileReport, Reconciled, migrate_pair, reconcile_legacy_roots};
pub use sqlite_adapter::SqliteStorageAdapter;
