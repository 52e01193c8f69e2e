//! Applies and rolls back migration units, one transaction per unit.
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::instrument;

use super::{
    MigrationFile, MigrationOutcome, MigrationRecord, MigrationResult, MigrationStatus, loader,
};
use crate::{Error, Result, to_store_error};

/// SQL creating the `migrations` bookkeeping table.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS migrations (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    checksum   TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
";

/// Runs the migration units of one directory against one database.
#[derive(Debug, Clone)]
pub struct Migrator {
    pool: SqlitePool,
    dir: PathBuf,
}

impl Migrator {
    /// Creates a new `Migrator` for the units in `dir`.
    pub fn new(pool: SqlitePool, dir: impl Into<PathBuf>) -> Self {
        Self {
            pool,
            dir: dir.into(),
        }
    }

    /// Returns the migrations directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_table(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    /// Returns the applied units, oldest first.
    pub async fn applied(&self) -> Result<Vec<MigrationRecord>> {
        self.ensure_table().await?;
        sqlx::query_as("SELECT name, checksum, applied_at FROM migrations ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(to_store_error)
    }

    /// Loads and validates every unit on disk.
    pub fn files(&self) -> Result<Vec<MigrationFile>> {
        loader::load_dir(&self.dir)
    }

    /// Applies pending units in name order, at most `steps` of them.
    ///
    /// Stops at the first failure; that unit's transaction is rolled back and
    /// it is the last entry of the result. Units before it stay applied. An
    /// invalid unit anywhere in the directory fails the call before anything
    /// runs.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn up(&self, steps: Option<usize>) -> Result<Vec<MigrationResult>> {
        let applied = self.applied().await?;
        let applied_names: HashSet<&str> = applied.iter().map(|r| r.name.as_str()).collect();
        let files = self.files()?;

        let pending = files
            .iter()
            .filter(|file| !applied_names.contains(file.name.as_str()))
            .take(steps.unwrap_or(usize::MAX));

        let mut results = Vec::new();
        for file in pending {
            match self.apply(file).await {
                Ok(()) => {
                    tracing::info!(migration = %file.name, "Applied migration");
                    results.push(MigrationResult::new(&file.name, MigrationOutcome::Applied));
                }
                Err(error) => {
                    tracing::error!(migration = %file.name, %error, "Migration failed, stopping");
                    results.push(MigrationResult::new(
                        &file.name,
                        MigrationOutcome::Failed(error),
                    ));
                    break;
                }
            }
        }

        Ok(results)
    }

    /// Rolls back the `steps` most recently applied units, newest first.
    ///
    /// A unit whose file is gone cannot be rolled back; processing stops there
    /// and its record is kept. Otherwise behaves like [`Migrator::up`] on
    /// failure.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn down(&self, steps: usize) -> Result<Vec<MigrationResult>> {
        let applied = self.applied().await?;
        let files = self.files()?;
        let by_name: HashMap<&str, &MigrationFile> =
            files.iter().map(|file| (file.name.as_str(), file)).collect();

        let mut results = Vec::new();
        for record in applied.iter().rev().take(steps) {
            let Some(file) = by_name.get(record.name.as_str()) else {
                tracing::error!(migration = %record.name, "Migration file not found, stopping");
                results.push(MigrationResult::new(
                    &record.name,
                    MigrationOutcome::Failed(Error::MigrationFileNotFound(record.name.clone())),
                ));
                break;
            };

            match self.revert(file).await {
                Ok(()) => {
                    tracing::info!(migration = %file.name, "Rolled back migration");
                    results.push(MigrationResult::new(&file.name, MigrationOutcome::RolledBack));
                }
                Err(error) => {
                    tracing::error!(migration = %file.name, %error, "Rollback failed, stopping");
                    results.push(MigrationResult::new(
                        &file.name,
                        MigrationOutcome::Failed(error),
                    ));
                    break;
                }
            }
        }

        Ok(results)
    }

    /// Reports every unit on disk with its applied time and whether its
    /// content still matches the checksum recorded when it was applied.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        let applied = self.applied().await?;
        let by_name: HashMap<&str, &MigrationRecord> =
            applied.iter().map(|r| (r.name.as_str(), r)).collect();
        let files = self.files()?;

        Ok(files
            .into_iter()
            .map(|file| {
                let record = by_name.get(file.name.as_str());
                let checksum_match = record.is_none_or(|r| r.checksum == file.checksum);
                if !checksum_match {
                    tracing::warn!(migration = %file.name, "Migration changed after it was applied");
                }
                MigrationStatus {
                    applied_at: record.map(|r| r.applied_at),
                    checksum_match,
                    name: file.name,
                    checksum: file.checksum,
                }
            })
            .collect())
    }

    /// Returns applied units whose file no longer exists. These can never be
    /// rolled back by [`Migrator::down`].
    pub async fn orphaned(&self) -> Result<Vec<MigrationRecord>> {
        let applied = self.applied().await?;
        let files = self.files()?;
        let names: HashSet<&str> = files.iter().map(|file| file.name.as_str()).collect();

        Ok(applied
            .into_iter()
            .filter(|record| !names.contains(record.name.as_str()))
            .collect())
    }

    async fn apply(&self, file: &MigrationFile) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(to_store_error)?;
        match Self::apply_in(&mut tx, file).await {
            Ok(()) => tx.commit().await.map_err(to_store_error),
            Err(error) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(migration = %file.name, error = %e, "Rollback of failed migration errored");
                }
                Err(error)
            }
        }
    }

    async fn apply_in(conn: &mut SqliteConnection, file: &MigrationFile) -> Result<()> {
        file.migration
            .up(conn)
            .await
            .map_err(|e| transition_error(&file.name, &e))?;

        sqlx::query("INSERT INTO migrations (name, checksum, applied_at) VALUES (?1, ?2, ?3)")
            .bind(&file.name)
            .bind(&file.checksum)
            .bind(Utc::now())
            .execute(&mut *conn)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }

    async fn revert(&self, file: &MigrationFile) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(to_store_error)?;
        match Self::revert_in(&mut tx, file).await {
            Ok(()) => tx.commit().await.map_err(to_store_error),
            Err(error) => {
                if let Err(e) = tx.rollback().await {
                    tracing::warn!(migration = %file.name, error = %e, "Rollback of failed revert errored");
                }
                Err(error)
            }
        }
    }

    async fn revert_in(conn: &mut SqliteConnection, file: &MigrationFile) -> Result<()> {
        file.migration
            .down(conn)
            .await
            .map_err(|e| transition_error(&file.name, &e))?;

        sqlx::query("DELETE FROM migrations WHERE name = ?1")
            .bind(&file.name)
            .execute(&mut *conn)
            .await
            .map_err(to_store_error)?;
        Ok(())
    }
}

fn transition_error(name: &str, error: &Error) -> Error {
    Error::Migration {
        name: name.to_owned(),
        message: error.to_string(),
    }
}
