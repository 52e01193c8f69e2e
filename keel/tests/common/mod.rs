#![allow(dead_code, missing_docs)]

use std::path::Path;

use keel::{Database, EventLog, SnapshotStore};

/// A fresh in-memory database with the event and snapshot tables created.
pub async fn stores() -> (Database, EventLog, SnapshotStore) {
    let db = Database::in_memory().await.expect("open in-memory database");
    let events = EventLog::new(db.pool().clone());
    let snapshots = SnapshotStore::new(db.pool().clone());
    events.setup().await.expect("create events table");
    snapshots.setup().await.expect("create snapshots table");
    (db, events, snapshots)
}

/// Writes a migration unit with the given sections.
pub fn write_unit(dir: &Path, name: &str, up: &str, down: &str) {
    std::fs::write(
        dir.join(format!("{name}.sql")),
        format!("-- migrate:up\n{up}\n-- migrate:down\n{down}\n"),
    )
    .expect("write migration file");
}

/// Names of user tables and indexes, sorted.
pub async fn schema_objects(db: &Database) -> Vec<String> {
    sqlx::query_scalar(
        "SELECT name FROM sqlite_master WHERE type IN ('table', 'index') AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(db.pool())
    .await
    .expect("introspect schema")
}
