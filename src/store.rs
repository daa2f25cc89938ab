use std::time::Duration;

use sqlx::{
    pool::PoolConnection,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};

use crate::{config::Config, error::Error};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the database backing the outbox.
///
/// Cheap to clone: every clone shares the same connection pool. Distinct
/// transactions may be used concurrently; isolation is left to SQLite.
#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn open(config: &Config) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(BUSY_TIMEOUT)
            .optimize_on_close(true, None);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections())
            .connect_with(opts)
            .await
            .map_err(Error::store_unavailable)?;

        Ok(Self { pool })
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begins a transaction on a pooled connection.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, Error> {
        self.pool
            .begin()
            .await
            .map_err(|e| Error::from_store("BEGIN", e))
    }

    /// Checks out a connection for statements that run outside any transaction.
    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, Error> {
        self.pool.acquire().await.map_err(Error::store_unavailable)
    }

    pub async fn close(&self) {
        self.pool.close().await
    }
}
