//! The snapshot module contains the store for cached aggregate state.
//!
//! Snapshots are an optimization to reduce the time it takes to rehydrate an
//! aggregate. Instead of replaying all events from the beginning, an
//! aggregate can be restored from a recent snapshot and then only replay the
//! events that occurred after it. A snapshot that cannot be read is worth
//! exactly as much as no snapshot, so [`SnapshotStore::load`] reports it as
//! absent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::instrument;

use crate::{Result, to_serde_error, to_store_error};

/// SQL creating the `snapshots` table.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS snapshots (
    aggregate_type TEXT NOT NULL,
    aggregate_id   TEXT NOT NULL,
    version        INTEGER NOT NULL,
    state          TEXT NOT NULL,
    created_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (aggregate_type, aggregate_id)
);
";

/// Represents a stored snapshot, including metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// The type of the aggregate this snapshot belongs to.
    pub aggregate_type: String,
    /// The ID of the aggregate this snapshot belongs to.
    pub aggregate_id: String,
    /// The last event version folded into `state`.
    pub version: i64,
    /// The folded state.
    pub state: Value,
    /// When the snapshot was written.
    pub created_at: DateTime<Utc>,
}

/// A SQLite-backed snapshot store holding one snapshot per aggregate.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    pool: SqlitePool,
}

impl SnapshotStore {
    /// Creates a new `SnapshotStore` on the given connection.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensures the `snapshots` table exists.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    /// Saves a snapshot, replacing any existing one for the same aggregate.
    ///
    /// `version` must be the version of the last event folded into `state`;
    /// the store takes the caller's word for it.
    #[instrument(skip(self, state))]
    pub async fn save<S: Serialize + ?Sized>(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        version: i64,
        state: &S,
    ) -> Result<()> {
        let state = serde_json::to_string(state).map_err(to_serde_error)?;

        sqlx::query(
            r"
            INSERT INTO snapshots (aggregate_type, aggregate_id, version, state, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (aggregate_type, aggregate_id) DO UPDATE
            SET version = excluded.version,
                state = excluded.state,
                created_at = excluded.created_at
            ",
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(version)
        .bind(state)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(to_store_error)?;

        tracing::debug!("Saved snapshot");
        Ok(())
    }

    /// Loads the snapshot for an aggregate.
    ///
    /// Returns `None` when there is no snapshot, and also when the stored
    /// state is not valid JSON; the latter is logged as a warning so callers
    /// fall back to a full replay.
    #[instrument(skip(self))]
    pub async fn load(&self, aggregate_type: &str, aggregate_id: &str) -> Result<Option<Snapshot>> {
        let row: Option<(i64, String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT version, state, created_at FROM snapshots WHERE aggregate_type = ?1 AND aggregate_id = ?2",
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_store_error)?;

        let Some((version, state, created_at)) = row else {
            return Ok(None);
        };

        match serde_json::from_str(&state) {
            Ok(state) => Ok(Some(Snapshot {
                aggregate_type: aggregate_type.to_owned(),
                aggregate_id: aggregate_id.to_owned(),
                version,
                state,
                created_at,
            })),
            Err(error) => {
                tracing::warn!(%error, version, "Corrupted snapshot, ignoring it");
                Ok(None)
            }
        }
    }

    /// Removes the snapshot for an aggregate. Returns whether one existed.
    #[instrument(skip(self))]
    pub async fn delete(&self, aggregate_type: &str, aggregate_id: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM snapshots WHERE aggregate_type = ?1 AND aggregate_id = ?2")
                .bind(aggregate_type)
                .bind(aggregate_id)
                .execute(&self.pool)
                .await
                .map_err(to_store_error)?;

        Ok(result.rows_affected() > 0)
    }
}
