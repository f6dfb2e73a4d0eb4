//! Startup helpers for the `chat-history` binary.
//!
//! Opens the `SQLite` database, runs the startup load (migrations included),
//! logs the resulting topic tree and writes back anything the load changed.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use crate::history::core::config::HistoryConfig;
use crate::history::core::errors::HistoryResult;
use crate::history::core::ids::TopicId;
use crate::history::persistence::{PersistenceCoordinator, SqliteStorageAdapter, StorageAdapter};
use crate::history::store::ConversationStore;

/// Initialize tracing from `RUST_LOG`, defaulting to `info`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}

/// Run the binary: `chat-history [db-path]`.
///
/// # Returns
/// `ExitCode::SUCCESS` once the history was loaded and written back, `1` on failure.
#[must_use]
pub fn run() -> ExitCode {
    init_tracing();

    tracing::info!("Starting chat-history v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match HistoryConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            return ExitCode::from(1);
        }
    };
    if let Some(path) = std::env::args_os().nth(1) {
        config.storage.sqlite_path = PathBuf::from(path);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("Failed to create runtime: {e}");
            return ExitCode::from(1);
        }
    };

    if let Err(e) = rt.block_on(load_and_report(&config)) {
        tracing::error!("History load failed: {e}");
        return ExitCode::from(1);
    }

    ExitCode::SUCCESS
}

/// Load the configured database into a fresh store and log its topic tree.
///
/// # Errors
/// Returns an error if the database cannot be opened or read.
pub async fn load_and_report(config: &HistoryConfig) -> HistoryResult<Arc<ConversationStore>> {
    tracing::info!(path = %config.storage.sqlite_path.display(), "Opening history database");
    let adapter: Arc<dyn StorageAdapter> =
        Arc::new(SqliteStorageAdapter::open(&config.storage).await?);
    let store = Arc::new(ConversationStore::new());
    let coordinator =
        PersistenceCoordinator::new(Arc::clone(&store), adapter, config.persistence.clone());

    let report = coordinator.init().await?;
    if !report.reconcile.is_noop() || report.migrated_pairs > 0 {
        tracing::info!(
            migrated_pairs = report.migrated_pairs,
            stale_roots = report.reconcile.stale_roots.len(),
            orphan_topics = report.reconcile.orphan_topics,
            orphan_pairs = report.reconcile.orphan_pairs,
            "Legacy data migrated"
        );
    }
    if report.skipped_topics + report.skipped_pairs > 0 {
        tracing::warn!(
            topics = report.skipped_topics,
            pairs = report.skipped_pairs,
            "Undecodable rows left in storage"
        );
    }

    log_tree(&store, store.root_id(), 0);
    coordinator.shutdown().await;
    Ok(store)
}

fn log_tree(store: &ConversationStore, id: TopicId, depth: usize) {
    let Some(topic) = store.get_topic(id) else {
        return;
    };
    tracing::info!(
        "{:indent$}{} ({} direct, {} total)",
        "",
        topic.name,
        topic.direct_count,
        topic.total_count,
        indent = depth * 2
    );
    for child in store.children_of(id) {
        log_tree(store, child, depth + 1);
    }
}
