//! # Event log and schema migrations on SQLite
//!
//! `keel` persists two co-located concerns on top of an embedded SQLite
//! database: an append-only event log for event-sourced aggregates, with
//! snapshot-accelerated replay, and a schema migration runner that evolves the
//! relational schema one transaction per unit.
//!
//! ## Core Concepts
//!
//! - **[`Database`]**: The single logical SQLite connection. It is handed to
//!   every store explicitly, so independent in-memory instances isolate tests.
//! - **[`EventLog`]**: Durable, ordered storage of events keyed by aggregate
//!   identity and a per-aggregate version. A uniqueness constraint on
//!   `(aggregate_type, aggregate_id, version)` is the only concurrency
//!   control: a losing writer gets [`Error::Conflict`] and retries on its own.
//! - **[`SnapshotStore`]**: One cached fold result per aggregate. A corrupt
//!   snapshot is reported as absent, never as an error.
//! - **[`Rehydrator`]**: Folds a snapshot (if any) and the events after it
//!   into the current state of an aggregate.
//! - **[`Migrator`]**: Applies and rolls back SQL migration units found on
//!   disk, records their checksums and reports drift.
//!
//! ## Example
//!
//! ```rust,no_run
//! use keel::{Database, EventLog, NewEvent, Rehydrator, SnapshotStore, StoredEvent};
//! use serde_json::{Map, Value, json};
//!
//! fn merge(mut state: Map<String, Value>, event: &StoredEvent) -> Map<String, Value> {
//!     if let Value::Object(fields) = event.payload() {
//!         state.extend(fields.clone());
//!     }
//!     state
//! }
//!
//! # async fn example() -> keel::Result<()> {
//! let db = Database::in_memory().await?;
//! let events = EventLog::new(db.pool().clone());
//! let snapshots = SnapshotStore::new(db.pool().clone());
//! events.setup().await?;
//! snapshots.setup().await?;
//!
//! events
//!     .append(NewEvent::new("Page", "home", "PageCreated", 1, json!({ "title": "Home" })))
//!     .await?;
//!
//! let rehydrator = Rehydrator::new(&events, &snapshots);
//! let page = rehydrator.rehydrate("Page", "home", Map::new(), merge).await?;
//! assert_eq!(page.version, 1);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

pub mod db;
pub mod event_log;
pub mod migrate;
pub mod rehydrate;
pub mod snapshot;

pub use db::Database;
pub use event_log::EventLog;
pub use migrate::{
    Migration, MigrationFile, MigrationOutcome, MigrationRecord, MigrationResult,
    MigrationStatus, Migrator,
};
pub use rehydrate::{Rehydrated, Rehydrator};
pub use snapshot::{Snapshot, SnapshotStore};

/// The error type for this crate.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// The aggregate already has an event at this version. The caller must
    /// recompute the version and retry if it still wants to proceed.
    #[error("version conflict: {aggregate_type}/{aggregate_id} already has version {version}")]
    Conflict {
        /// Type of the contested aggregate.
        aggregate_type: String,
        /// Identity of the contested aggregate.
        aggregate_id: String,
        /// The version that was already taken.
        version: i64,
    },
    /// An event with the same caller-assigned id has already been appended.
    #[error("duplicate event id: {0}")]
    DuplicateEventId(String),
    /// Input was rejected before reaching the store, e.g. a malformed
    /// migration unit.
    #[error("validation error: {0}")]
    Validation(String),
    /// A migration transition failed while running; its transaction was
    /// rolled back.
    #[error("migration {name} failed: {message}")]
    Migration {
        /// Name of the failed unit.
        name: String,
        /// The underlying failure.
        message: String,
    },
    /// A recorded migration cannot be rolled back because its file is gone.
    #[error("migration file not found: {0}")]
    MigrationFileNotFound(String),
    /// Wraps an error from the underlying SQLite store.
    #[error("store error: {0}")]
    Store(String),
    /// A payload, state or metadata value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A filesystem operation failed.
    #[error("io error: {0}")]
    Io(String),
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Maps `sqlx::Error` into this crate's `Error`.
pub(crate) fn to_store_error(e: sqlx::Error) -> Error {
    Error::Store(e.to_string())
}

/// Maps `serde_json::Error` into this crate's `Error`.
pub(crate) fn to_serde_error(e: serde_json::Error) -> Error {
    Error::Serialization(e.to_string())
}

/// Maps `std::io::Error` into this crate's `Error`, naming the path involved.
pub(crate) fn to_io_error(path: &std::path::Path, e: std::io::Error) -> Error {
    Error::Io(format!("{}: {e}", path.display()))
}

/// A typed domain event that can be encoded into the log.
///
/// The `DomainEvent` derive macro from `keel-derive` implements this trait
/// for enums, using the variant name as the event type.
pub trait DomainEvent: Serialize + Debug + Send + Sync {
    /// Returns the event type recorded in the `event_type` column.
    fn event_type(&self) -> &'static str;
}

/// An aggregate whose state is derived by folding its events.
///
/// `apply` must be pure: it may only look at the current state and the event,
/// so that replaying the same events always yields the same state.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The `aggregate_type` under which this aggregate's events are stored.
    const AGGREGATE_TYPE: &'static str;

    /// Applies an event to the aggregate, changing its state.
    fn apply(&mut self, event: &StoredEvent);
}

/// An event that has not been appended yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub(crate) id: String,
    pub(crate) scope_id: Option<String>,
    pub(crate) aggregate_type: String,
    pub(crate) aggregate_id: String,
    pub(crate) event_type: String,
    pub(crate) version: i64,
    pub(crate) payload: Value,
    pub(crate) metadata: Option<Value>,
}

impl NewEvent {
    /// Creates a new event with a random id.
    ///
    /// `version` is the version this event will occupy, usually the last
    /// known version plus one.
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        version: i64,
        payload: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            scope_id: None,
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            version,
            payload,
            metadata: None,
        }
    }

    /// Encodes a typed domain event as the payload of a new event.
    pub fn from_domain<E: DomainEvent>(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        version: i64,
        event: &E,
    ) -> Result<Self> {
        let payload = serde_json::to_value(event).map_err(to_serde_error)?;
        Ok(Self::new(
            aggregate_type,
            aggregate_id,
            event.event_type(),
            version,
            payload,
        ))
    }

    /// Replaces the generated id with a caller-assigned one.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attaches the event to a tenant or namespace.
    #[must_use]
    pub fn with_scope(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Attaches metadata such as correlation ids or the acting user.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Returns the caller-assigned event id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the version this event will occupy.
    pub fn version(&self) -> i64 {
        self.version
    }
}

/// Represents a stored event, including the fields assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEvent {
    /// Global, store-assigned position in the log.
    sequence: i64,
    id: String,
    scope_id: Option<String>,
    aggregate_type: String,
    aggregate_id: String,
    event_type: String,
    /// The version of the aggregate after this event was applied.
    version: i64,
    payload: Value,
    metadata: Option<Value>,
    created_at: DateTime<Utc>,
}

impl StoredEvent {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        sequence: i64,
        id: String,
        scope_id: Option<String>,
        aggregate_type: String,
        aggregate_id: String,
        event_type: String,
        version: i64,
        payload: Value,
        metadata: Option<Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            sequence,
            id,
            scope_id,
            aggregate_type,
            aggregate_id,
            event_type,
            version,
            payload,
            metadata,
            created_at,
        }
    }

    /// Returns the global sequence number assigned on append.
    pub fn sequence(&self) -> i64 {
        self.sequence
    }
    /// Returns the caller-assigned event id.
    pub fn id(&self) -> &str {
        &self.id
    }
    /// Returns the tenant or namespace, if any.
    pub fn scope_id(&self) -> Option<&str> {
        self.scope_id.as_deref()
    }
    /// Returns the type of the aggregate this event belongs to.
    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }
    /// Returns the ID of the aggregate this event belongs to.
    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }
    /// Returns the type of the event.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }
    /// Returns the version of the aggregate after this event was applied.
    pub fn version(&self) -> i64 {
        self.version
    }
    /// Returns the event payload.
    pub fn payload(&self) -> &Value {
        &self.payload
    }
    /// Returns the event metadata, if any.
    pub fn metadata(&self) -> Option<&Value> {
        self.metadata.as_ref()
    }
    /// Returns when the event was appended.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Decodes the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone()).map_err(to_serde_error)
    }
}
