//! Schema migrations.
//!
//! A migration unit is a `.sql` file in a migrations directory, named
//! `<sortable-prefix>_<description>.sql` so that lexical order is apply
//! order. Each file carries two sections:
//!
//! ```sql
//! -- migrate:up
//! CREATE TABLE pages (id TEXT PRIMARY KEY, title TEXT NOT NULL);
//!
//! -- migrate:down
//! DROP TABLE pages;
//! ```
//!
//! The [`Migrator`] applies pending units one transaction per unit, records
//! `(name, checksum, applied_at)` in its `migrations` table, and rolls units
//! back in reverse order. A failed unit stops the batch; units committed
//! before it stay applied.
//!
//! # Modules
//!
//! - [`loader`] -- directory discovery, checksums and section parsing
//! - [`runner`] -- the [`Migrator`] and its bookkeeping table
//! - [`scaffold`] -- creation of new, empty units

use std::fmt::Debug;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::{Error, Result};

pub mod loader;
pub mod runner;
pub mod scaffold;

pub use loader::SqlMigration;
pub use runner::Migrator;
pub use scaffold::scaffold;

/// A reversible schema change.
///
/// Both transitions receive the connection of the transaction the runner
/// opened for this unit; they must not commit or roll back themselves.
///
/// The returned futures are not `Send`, so [`Migrator::up`] and
/// [`Migrator::down`] cannot be handed to `tokio::spawn`.
#[async_trait(?Send)]
pub trait Migration: Debug + Send + Sync {
    /// Applies the change.
    async fn up(&self, conn: &mut SqliteConnection) -> Result<()>;

    /// Reverts the change.
    async fn down(&self, conn: &mut SqliteConnection) -> Result<()>;
}

/// A migration unit discovered on disk.
#[derive(Debug)]
pub struct MigrationFile {
    /// File name without the `.sql` extension.
    pub name: String,
    /// Path of the file.
    pub path: PathBuf,
    /// SHA-256 of the current file content, hex encoded.
    pub checksum: String,
    /// The loaded transitions.
    pub migration: Box<dyn Migration>,
}

/// A row of the `migrations` bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MigrationRecord {
    /// Name of the applied unit.
    pub name: String,
    /// Checksum of the unit when it was applied.
    pub checksum: String,
    /// When the unit was applied.
    pub applied_at: DateTime<Utc>,
}

/// What happened to one unit during [`Migrator::up`] or [`Migrator::down`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The unit was applied and recorded.
    Applied,
    /// The unit was rolled back and its record removed.
    RolledBack,
    /// The attempt failed and was rolled back; processing stopped here.
    Failed(Error),
}

/// Result of one attempted unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationResult {
    /// Name of the unit.
    pub name: String,
    /// What happened to it.
    pub outcome: MigrationOutcome,
}

impl MigrationResult {
    pub(crate) fn new(name: impl Into<String>, outcome: MigrationOutcome) -> Self {
        Self {
            name: name.into(),
            outcome,
        }
    }

    /// Returns the error if the attempt failed.
    pub fn error(&self) -> Option<&Error> {
        match &self.outcome {
            MigrationOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Returns `true` if the attempt failed.
    pub fn is_failed(&self) -> bool {
        self.error().is_some()
    }
}

/// Status of one discovered unit, as reported by [`Migrator::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Name of the unit.
    pub name: String,
    /// When the unit was applied, or `None` if it is pending.
    pub applied_at: Option<DateTime<Utc>>,
    /// Checksum of the file as it is now.
    pub checksum: String,
    /// `false` if the file changed after it was applied. Always `true` for
    /// pending units.
    pub checksum_match: bool,
}
