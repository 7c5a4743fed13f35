//! Optional, disabled-by-default persistence of the last known root
//! reference (SPEC_FULL.md §4.8). Grounded on
//! `storage::AgentStorage`/`SqliteAgentStorage`: an async trait seam plus a
//! `sqlx` SQLite implementation. Never consulted by the live get/put/commit
//! path — the KVS engine itself is always memory-resident per spec.md §5/§7.

use super::types::RootRef;
use crate::error::{BrokerError, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;

/// A sink for a single rank's last known root reference, used only to carry
/// a debugging breadcrumb across restarts of one rank's process.
#[async_trait]
pub trait KvsCheckpointStore: Send + Sync {
    /// Persists `root` as the most recent checkpoint.
    async fn save_root(&self, root: &RootRef) -> Result<()>;

    /// Returns the most recently saved root reference, if any.
    async fn load_latest_root(&self) -> Result<Option<RootRef>>;
}

/// `sqlx::SqlitePool`-backed [`KvsCheckpointStore`].
pub struct SqliteKvsCheckpointStore {
    pool: SqlitePool,
}

impl SqliteKvsCheckpointStore {
    /// Connects to `database_url`, running pending migrations.
    ///
    /// # Errors
    /// Returns [`BrokerError::TransportError`] if the pool cannot connect or
    /// migrations fail to apply.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(|e| BrokerError::TransportError(format!("kvs checkpoint store: {e}")))?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| BrokerError::TransportError(format!("kvs checkpoint migration: {e}")))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl KvsCheckpointStore for SqliteKvsCheckpointStore {
    async fn save_root(&self, root: &RootRef) -> Result<()> {
        sqlx::query("INSERT INTO kvs_checkpoints (seq, hash) VALUES (?, ?)")
            .bind(i64::try_from(root.seq).unwrap_or(i64::MAX))
            .bind(root.hash.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerError::TransportError(format!("save_root: {e}")))?;
        Ok(())
    }

    async fn load_latest_root(&self) -> Result<Option<RootRef>> {
        let row: Option<(i64, String)> =
            sqlx::query_as("SELECT seq, hash FROM kvs_checkpoints ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BrokerError::TransportError(format!("load_latest_root: {e}")))?;
        Ok(match row {
            Some((seq, hash)) => Some(format!("{seq}.{hash}").parse()?),
            None => None,
        })
    }
}
