//! The SQLite handle shared by the event log, the snapshot store and the
//! migration runner.

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::instrument;

use crate::{Result, to_store_error};

/// A single logical connection to an embedded SQLite database.
///
/// The pool is capped at one connection that never expires, so every store
/// built from [`Database::pool`] talks to the same connection and writers are
/// serialized by SQLite itself. For `:memory:` databases this also keeps the
/// data alive for as long as the handle is.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the database at `url`, creating the file if it does not exist.
    ///
    /// File databases use WAL journaling. Foreign keys are enforced.
    #[instrument]
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(to_store_error)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);
        Self::open(options).await
    }

    /// Opens a fresh, private in-memory database.
    ///
    /// Every call returns an independent database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(to_store_error)?
            .foreign_keys(true);
        Self::open(options).await
    }

    async fn open(options: SqliteConnectOptions) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(to_store_error)?;
        Ok(Self { pool })
    }

    /// Returns the underlying pool, to hand to a store.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the connection. Stores built from this handle stop working.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
