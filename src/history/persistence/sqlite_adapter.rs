//! `SQLite` storage adapter.
//!
//! Each logical table is a `(id TEXT PRIMARY KEY, data TEXT)` document table
//! holding the JSON form of the record, so rows written by older versions
//! keep whatever fields they had until migration rewrites them.

use tokio_rusqlite::Connection;

use crate::history::core::config::StorageConfig;
use crate::history::core::errors::HistoryResult;
use crate::history::core::ids::{PairId, TopicId};
use crate::history::core::pair::MessagePair;
use crate::history::core::topic::Topic;
use crate::history::persistence::adapter::{
    LoadedRows, MetaRecord, StorageAdapter, StoreFuture, StoredPair, decode_rows,
};

/// `SQLite` implementation of the storage adapter.
pub struct SqliteStorageAdapter {
    conn: Connection,
    topics_table: String,
    pairs_table: String,
    meta_table: String,
}

impl SqliteStorageAdapter {
    /// Open the database file named in `config`.
    ///
    /// Tables are created by [`StorageAdapter::init`].
    ///
    /// # Errors
    /// Returns an error if a table name is invalid or the database cannot be
    /// opened.
    pub async fn open(config: &StorageConfig) -> HistoryResult<Self> {
        config.validate()?;
        let conn = Connection::open(&config.sqlite_path).await?;
        Ok(Self::with_connection(conn, config))
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if a table name is invalid or the database cannot be
    /// opened.
    pub async fn open_in_memory(config: &StorageConfig) -> HistoryResult<Self> {
        config.validate()?;
        let conn = Connection::open_in_memory().await?;
        Ok(Self::with_connection(conn, config))
    }

    fn with_connection(conn: Connection, config: &StorageConfig) -> Self {
        Self {
            conn,
            topics_table: config.topics_table.clone(),
            pairs_table: config.pairs_table.clone(),
            meta_table: config.meta_table.clone(),
        }
    }

    async fn load_documents(&self, table: &str) -> HistoryResult<Vec<String>> {
        let table = table.to_string();
        let rows = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!("SELECT data FROM {table}"))?;
                let rows = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<Vec<_>, rusqlite::Error>>()?;
                Ok(rows)
            })
            .await?;
        Ok(rows)
    }

    async fn upsert(&self, table: &str, id: String, data: String) -> HistoryResult<()> {
        let table = table.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "INSERT INTO {table} (id, data) VALUES (?1, ?2)
                         ON CONFLICT(id) DO UPDATE SET data = excluded.data"
                    ),
                    rusqlite::params![id, data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn remove(&self, table: &str, id: String) -> HistoryResult<()> {
        let table = table.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!("DELETE FROM {table} WHERE id = ?1"),
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

impl StorageAdapter for SqliteStorageAdapter {
    fn init(&self) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            let topics = self.topics_table.clone();
            let pairs = self.pairs_table.clone();
            let meta = self.meta_table.clone();
            self.conn
                .call(move |conn| {
                    conn.execute_batch(&format!(
                        "CREATE TABLE IF NOT EXISTS {topics} (
                            id TEXT PRIMARY KEY,
                            data TEXT NOT NULL
                        );
                        CREATE TABLE IF NOT EXISTS {pairs} (
                            id TEXT PRIMARY KEY,
                            data TEXT NOT NULL
                        );
                        CREATE TABLE IF NOT EXISTS {meta} (
                            name TEXT PRIMARY KEY,
                            value TEXT NOT NULL
                        );"
                    ))?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn get_all_topics(&self) -> StoreFuture<'_, HistoryResult<LoadedRows<Topic>>> {
        Box::pin(async move {
            let docs = self.load_documents(&self.topics_table).await?;
            Ok(decode_rows(&self.topics_table, docs, |doc: String| {
                serde_json::from_str(&doc)
            }))
        })
    }

    fn get_all_pairs(&self) -> StoreFuture<'_, HistoryResult<LoadedRows<StoredPair>>> {
        Box::pin(async move {
            let docs = self.load_documents(&self.pairs_table).await?;
            Ok(decode_rows(&self.pairs_table, docs, |doc: String| {
                serde_json::from_str(&doc)
            }))
        })
    }

    fn save_topic(&self, topic: Topic) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            let data = serde_json::to_string(&topic)?;
            self.upsert(&self.topics_table, topic.id.to_string(), data)
                .await
        })
    }

    fn save_pair(&self, pair: MessagePair) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            let data = serde_json::to_string(&pair)?;
            self.upsert(&self.pairs_table, pair.id.to_string(), data)
                .await
        })
    }

    fn save_pairs_bulk(&self, pairs: Vec<MessagePair>) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            if pairs.is_empty() {
                return Ok(());
            }

            let rows = pairs
                .iter()
                .map(|pair| Ok((pair.id.to_string(), serde_json::to_string(pair)?)))
                .collect::<HistoryResult<Vec<(String, String)>>>()?;
            let table = self.pairs_table.clone();
            self.conn
                .call(move |conn| {
                    let tx = conn.transaction()?;
                    {
                        let mut stmt = tx.prepare(&format!(
                            "INSERT INTO {table} (id, data) VALUES (?1, ?2)
                             ON CONFLICT(id) DO UPDATE SET data = excluded.data"
                        ))?;
                        for (id, data) in rows {
                            stmt.execute(rusqlite::params![id, data])?;
                        }
                    }
                    tx.commit()?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }

    fn delete_topic(&self, id: TopicId) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move { self.remove(&self.topics_table, id.to_string()).await })
    }

    fn delete_pair(&self, id: PairId) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move { self.remove(&self.pairs_table, id.to_string()).await })
    }

    fn get_meta(&self, name: &str) -> StoreFuture<'_, HistoryResult<Option<MetaRecord>>> {
        let name = name.to_string();
        Box::pin(async move {
            let table = self.meta_table.clone();
            let key = name.clone();
            let raw = self
                .conn
                .call(move |conn| {
                    let mut stmt =
                        conn.prepare(&format!("SELECT value FROM {table} WHERE name = ?1"))?;
                    let mut rows = stmt.query_map([&key], |row| row.get::<_, String>(0))?;
                    let value = rows.next().transpose()?;
                    Ok(value)
                })
                .await?;

            match raw {
                Some(raw) => Ok(Some(MetaRecord {
                    name,
                    value: serde_json::from_str(&raw)?,
                })),
                None => Ok(None),
            }
        })
    }

    fn save_meta(&self, record: MetaRecord) -> StoreFuture<'_, HistoryResult<()>> {
        Box::pin(async move {
            let table = self.meta_table.clone();
            let value = serde_json::to_string(&record.value)?;
            let name = record.name;
            self.conn
                .call(move |conn| {
                    conn.execute(
                        &format!(
                            "INSERT INTO {table} (name, value) VALUES (?1, ?2)
                             ON CONFLICT(name) DO UPDATE SET value = excluded.value"
                        ),
                        rusqlite::params![name, value],
                    )?;
                    Ok(())
                })
                .await?;
            Ok(())
        })
    }
}
