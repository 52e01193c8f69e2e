//! Discovers migration units in a directory.
//!
//! Every `*.sql` file directly inside the directory is a unit, except hidden
//! files and `*.d.sql` declaration files. Each unit is checksummed and parsed
//! before anything runs: one malformed unit rejects the whole directory.

use std::path::Path;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::SqliteConnection;
use walkdir::WalkDir;

use super::{Migration, MigrationFile};
use crate::{Error, Result, to_io_error, to_store_error};

/// Extension of migration units.
pub const EXTENSION: &str = ".sql";

/// Marker line opening the `up` section.
pub const UP_MARKER: &str = "-- migrate:up";

/// Marker line opening the `down` section.
pub const DOWN_MARKER: &str = "-- migrate:down";

/// A migration unit written as one SQL file with `up` and `down` sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlMigration {
    up: String,
    down: String,
}

#[derive(Clone, Copy)]
enum Section {
    Up,
    Down,
}

impl SqlMigration {
    /// Splits `source` into its `up` and `down` sections.
    ///
    /// Fails if a marker is missing or repeated, or if a statement appears
    /// before the first marker. Empty sections are allowed.
    pub fn parse(name: &str, source: &str) -> Result<Self> {
        let mut up: Option<String> = None;
        let mut down: Option<String> = None;
        let mut current: Option<Section> = None;

        for line in source.lines() {
            let trimmed = line.trim();

            if trimmed == UP_MARKER {
                if up.replace(String::new()).is_some() {
                    return Err(repeated_marker(name, UP_MARKER));
                }
                current = Some(Section::Up);
                continue;
            }
            if trimmed == DOWN_MARKER {
                if down.replace(String::new()).is_some() {
                    return Err(repeated_marker(name, DOWN_MARKER));
                }
                current = Some(Section::Down);
                continue;
            }

            let body = match current {
                Some(Section::Up) => up.as_mut(),
                Some(Section::Down) => down.as_mut(),
                None => None,
            };
            match body {
                Some(body) => {
                    body.push_str(line);
                    body.push('\n');
                }
                None if is_blank_line(trimmed) => {}
                None => {
                    return Err(Error::Validation(format!(
                        "migration {name} has statements before its first section marker"
                    )));
                }
            }
        }

        match (up, down) {
            (Some(up), Some(down)) => Ok(Self { up, down }),
            _ => Err(Error::Validation(format!(
                "migration {name} must define both '{UP_MARKER}' and '{DOWN_MARKER}' sections"
            ))),
        }
    }

    /// Returns the SQL of the `up` section.
    pub fn up_sql(&self) -> &str {
        &self.up
    }

    /// Returns the SQL of the `down` section.
    pub fn down_sql(&self) -> &str {
        &self.down
    }
}

#[async_trait(?Send)]
impl Migration for SqlMigration {
    async fn up(&self, conn: &mut SqliteConnection) -> Result<()> {
        execute_script(conn, &self.up).await
    }

    async fn down(&self, conn: &mut SqliteConnection) -> Result<()> {
        execute_script(conn, &self.down).await
    }
}

fn repeated_marker(name: &str, marker: &str) -> Error {
    Error::Validation(format!("migration {name} repeats '{marker}'"))
}

fn is_blank_line(trimmed: &str) -> bool {
    trimmed.is_empty() || trimmed.starts_with("--")
}

async fn execute_script(conn: &mut SqliteConnection, script: &str) -> Result<()> {
    // Comment-only sections are no-ops.
    if script.lines().all(|line| is_blank_line(line.trim())) {
        return Ok(());
    }
    sqlx::raw_sql(script)
        .execute(&mut *conn)
        .await
        .map_err(to_store_error)?;
    Ok(())
}

/// SHA-256 of `content`, lowercase hex.
pub fn checksum(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Returns the unit name for a file name, or `None` if the file is not a unit.
fn unit_name(file_name: &str) -> Option<&str> {
    if file_name.starts_with('.') || file_name.ends_with(".d.sql") {
        return None;
    }
    file_name.strip_suffix(EXTENSION).filter(|name| !name.is_empty())
}

/// Loads every unit in `dir`, sorted lexically by name.
pub fn load_dir(dir: &Path) -> Result<Vec<MigrationFile>> {
    if !dir.is_dir() {
        return Err(Error::Io(format!(
            "migrations directory not found: {}",
            dir.display()
        )));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| Error::Io(e.to_string()))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str() else {
            let bytes = entry.file_name().as_encoded_bytes();
            if bytes.ends_with(EXTENSION.as_bytes()) && !bytes.starts_with(b".") {
                return Err(Error::Validation(format!(
                    "migration file name is not valid UTF-8: {}",
                    path.display()
                )));
            }
            continue;
        };
        let Some(name) = unit_name(file_name) else {
            continue;
        };

        let content = std::fs::read(path).map_err(|e| to_io_error(path, e))?;
        let checksum = checksum(&content);
        let source = std::str::from_utf8(&content)
            .map_err(|_| Error::Validation(format!("migration {name} is not valid UTF-8")))?;
        let migration = SqlMigration::parse(name, source)?;

        files.push(MigrationFile {
            name: name.to_owned(),
            path: path.to_path_buf(),
            checksum,
            migration: Box::new(migration),
        });
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::debug!(dir = %dir.display(), count = files.len(), "Loaded migration files");
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_sections() {
        let migration = SqlMigration::parse(
            "001_pages",
            "-- migrate:up\nCREATE TABLE pages (id TEXT);\n-- migrate:down\nDROP TABLE pages;\n",
        )
        .expect("valid unit");

        assert_eq!(migration.up_sql(), "CREATE TABLE pages (id TEXT);\n");
        assert_eq!(migration.down_sql(), "DROP TABLE pages;\n");
    }

    #[test]
    fn sections_may_come_in_any_order_and_be_empty() {
        let migration = SqlMigration::parse("001_noop", "-- header\n\n-- migrate:down\n-- migrate:up\n")
            .expect("valid unit");

        assert_eq!(migration.up_sql(), "");
        assert_eq!(migration.down_sql(), "");
    }

    #[test]
    fn missing_down_section_is_rejected() {
        let err = SqlMigration::parse("001_pages", "-- migrate:up\nCREATE TABLE pages (id TEXT);\n")
            .expect_err("down is missing");
        assert!(matches!(err, Error::Validation(msg) if msg.contains("001_pages")));
    }

    #[test]
    fn repeated_marker_is_rejected() {
        let err = SqlMigration::parse("001_pages", "-- migrate:up\n-- migrate:down\n-- migrate:up\n")
            .expect_err("up is repeated");
        assert!(matches!(err, Error::Validation(msg) if msg.contains("repeats")));
    }

    #[test]
    fn statement_before_first_marker_is_rejected() {
        let err = SqlMigration::parse("001_pages", "DROP TABLE x;\n-- migrate:up\n-- migrate:down\n")
            .expect_err("statement outside a section");
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_unit_name_is_rejected() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(OsStr::from_bytes(b"001_\xffpages.sql")),
            "-- migrate:up\n-- migrate:down\n",
        )
        .unwrap();

        let err = load_dir(dir.path()).expect_err("unit must not be skipped");
        assert!(matches!(err, Error::Validation(msg) if msg.contains("UTF-8")));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn non_utf8_non_unit_is_ignored() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(OsStr::from_bytes(b"notes\xff.txt")), "x").unwrap();

        assert!(load_dir(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn unit_names() {
        assert_eq!(unit_name("20260101000000_pages.sql"), Some("20260101000000_pages"));
        assert_eq!(unit_name("types.d.sql"), None);
        assert_eq!(unit_name(".hidden.sql"), None);
        assert_eq!(unit_name("README.md"), None);
        assert_eq!(unit_name(".sql"), None);
    }
}
