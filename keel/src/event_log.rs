//! The append-only event log.
//!
//! Events are stored in a single `events` table. Each aggregate's events are
//! numbered by a caller-supplied `version`; a `UNIQUE (aggregate_type,
//! aggregate_id, version)` constraint is the only arbiter between concurrent
//! writers. There is no lock and no retry here: the losing append fails with
//! [`Error::Conflict`].

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::instrument;

use crate::{Error, NewEvent, Result, StoredEvent, to_serde_error, to_store_error};

/// SQL creating the `events` table and its indexes.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS events (
    sequence       INTEGER PRIMARY KEY AUTOINCREMENT,
    id             TEXT NOT NULL UNIQUE,
    scope_id       TEXT,
    aggregate_type TEXT NOT NULL,
    aggregate_id   TEXT NOT NULL,
    event_type     TEXT NOT NULL,
    version        INTEGER NOT NULL,
    payload        TEXT NOT NULL,
    metadata       TEXT,
    created_at     TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE (aggregate_type, aggregate_id, version)
);

CREATE INDEX IF NOT EXISTS idx_events_aggregate ON events (aggregate_type, aggregate_id, version);
CREATE INDEX IF NOT EXISTS idx_events_scope ON events (scope_id, sequence);
CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type, created_at);
";

/// A row from the `events` table. Payload and metadata are JSON text.
#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    sequence: i64,
    id: String,
    scope_id: Option<String>,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    version: i64,
    payload: String,
    metadata: Option<String>,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn into_event(self) -> Result<StoredEvent> {
        let payload = serde_json::from_str(&self.payload).map_err(to_serde_error)?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(to_serde_error)?;

        Ok(StoredEvent::new(
            self.sequence,
            self.id,
            self.scope_id,
            self.aggregate_type,
            self.aggregate_id,
            self.event_type,
            self.version,
            payload,
            metadata,
            self.created_at,
        ))
    }
}

fn into_events(rows: Vec<EventRow>) -> Result<Vec<StoredEvent>> {
    rows.into_iter().map(EventRow::into_event).collect()
}

/// `LIMIT -1` means "no limit" to SQLite.
fn sql_limit(limit: Option<u32>) -> i64 {
    limit.map_or(-1, i64::from)
}

/// Turns a unique-constraint violation on insert into the matching domain
/// error; everything else is a store error.
fn classify_insert_error(e: sqlx::Error, event: &NewEvent) -> Error {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() {
            let message = db_err.message();
            if message.contains("events.version") {
                return Error::Conflict {
                    aggregate_type: event.aggregate_type.clone(),
                    aggregate_id: event.aggregate_id.clone(),
                    version: event.version,
                };
            }
            if message.contains("events.id") {
                return Error::DuplicateEventId(event.id.clone());
            }
        }
    }
    to_store_error(e)
}

/// A SQLite-backed, append-only event log.
#[derive(Debug, Clone)]
pub struct EventLog {
    pool: SqlitePool,
}

impl EventLog {
    /// Creates a new `EventLog` on the given connection.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Ensures the `events` table exists.
    #[instrument(skip(self))]
    pub async fn setup(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    /// Appends one event and returns it with its sequence and timestamp.
    ///
    /// Fails with [`Error::Conflict`] if the aggregate already has an event at
    /// `event.version`, and with [`Error::DuplicateEventId`] if the id was
    /// used before. Either way nothing is written.
    #[instrument(skip(self, event), fields(
        aggregate_type = %event.aggregate_type,
        aggregate_id = %event.aggregate_id,
        version = event.version,
    ))]
    pub async fn append(&self, event: NewEvent) -> Result<StoredEvent> {
        if event.version < 1 {
            return Err(Error::Validation(format!(
                "event version must be positive, got {}",
                event.version
            )));
        }

        let payload = serde_json::to_string(&event.payload).map_err(to_serde_error)?;
        let metadata = event
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(to_serde_error)?;

        let row: EventRow = sqlx::query_as(
            r"
            INSERT INTO events (id, scope_id, aggregate_type, aggregate_id, event_type, version, payload, metadata, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            RETURNING sequence, id, scope_id, aggregate_type, aggregate_id, event_type, version, payload, metadata, created_at
            ",
        )
        .bind(&event.id)
        .bind(&event.scope_id)
        .bind(&event.aggregate_type)
        .bind(&event.aggregate_id)
        .bind(&event.event_type)
        .bind(event.version)
        .bind(payload)
        .bind(metadata)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| classify_insert_error(e, &event))?;

        tracing::debug!(sequence = row.sequence, event_type = %row.event_type, "Appended event");
        row.into_event()
    }

    /// Loads an aggregate's events with `version > from_version`, ascending by
    /// version.
    #[instrument(skip(self))]
    pub async fn events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        from_version: i64,
    ) -> Result<Vec<StoredEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r"
            SELECT sequence, id, scope_id, aggregate_type, aggregate_id, event_type, version, payload, metadata, created_at
            FROM events
            WHERE aggregate_type = ?1 AND aggregate_id = ?2 AND version > ?3
            ORDER BY version ASC
            ",
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(from_version)
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        into_events(rows)
    }

    /// Loads events of one type across all aggregates.
    ///
    /// Ordered by per-aggregate `version`, then by `sequence`. Versions of
    /// different aggregates are unrelated, so this is not a global order; use
    /// [`EventLog::events_after`] for that.
    #[instrument(skip(self))]
    pub async fn events_by_type(
        &self,
        event_type: &str,
        limit: Option<u32>,
    ) -> Result<Vec<StoredEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r"
            SELECT sequence, id, scope_id, aggregate_type, aggregate_id, event_type, version, payload, metadata, created_at
            FROM events
            WHERE event_type = ?1
            ORDER BY version ASC, sequence ASC
            LIMIT ?2
            ",
        )
        .bind(event_type)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        into_events(rows)
    }

    /// Loads the global feed of events appended after `sequence`, in append
    /// order. Pass `0` to read from the beginning.
    #[instrument(skip(self))]
    pub async fn events_after(&self, sequence: i64, limit: Option<u32>) -> Result<Vec<StoredEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r"
            SELECT sequence, id, scope_id, aggregate_type, aggregate_id, event_type, version, payload, metadata, created_at
            FROM events
            WHERE sequence > ?1
            ORDER BY sequence ASC
            LIMIT ?2
            ",
        )
        .bind(sequence)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        into_events(rows)
    }

    /// Like [`EventLog::events_after`], restricted to one scope.
    #[instrument(skip(self))]
    pub async fn events_for_scope(
        &self,
        scope_id: &str,
        after_sequence: i64,
        limit: Option<u32>,
    ) -> Result<Vec<StoredEvent>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r"
            SELECT sequence, id, scope_id, aggregate_type, aggregate_id, event_type, version, payload, metadata, created_at
            FROM events
            WHERE scope_id = ?1 AND sequence > ?2
            ORDER BY sequence ASC
            LIMIT ?3
            ",
        )
        .bind(scope_id)
        .bind(after_sequence)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(to_store_error)?;

        into_events(rows)
    }

    /// Returns the version the next event of this aggregate should use.
    ///
    /// This is only a hint. Another writer may take the version between this
    /// read and the append; [`EventLog::append`] then reports a conflict.
    #[instrument(skip(self))]
    pub async fn next_version(&self, aggregate_type: &str, aggregate_id: &str) -> Result<i64> {
        let next: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM events WHERE aggregate_type = ?1 AND aggregate_id = ?2",
        )
        .bind(aggregate_type)
        .bind(aggregate_id)
        .fetch_one(&self.pool)
        .await
        .map_err(to_store_error)?;

        Ok(next)
    }
}
