//! Creates new, empty migration units.
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::loader::{DOWN_MARKER, EXTENSION, UP_MARKER};
use crate::{Error, Result, to_io_error};

/// Writes `<YYYYMMDDHHMMSS>_<name>.sql` into `dir` with empty `up` and `down`
/// sections, creating `dir` if needed. Returns the path of the new file.
///
/// `name` may only contain ASCII letters, digits, `_` and `-`. An existing
/// file is never overwritten.
pub fn scaffold(dir: &Path, name: &str, now: DateTime<Utc>) -> Result<PathBuf> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if !valid {
        return Err(Error::Validation(format!(
            "invalid migration name '{name}': use ASCII letters, digits, '_' or '-'"
        )));
    }

    std::fs::create_dir_all(dir).map_err(|e| to_io_error(dir, e))?;

    let path = dir.join(format!("{}_{name}{EXTENSION}", now.format("%Y%m%d%H%M%S")));
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => {
                Error::Validation(format!("migration file already exists: {}", path.display()))
            }
            _ => to_io_error(&path, e),
        })?;

    write!(file, "{UP_MARKER}\n\n{DOWN_MARKER}\n\n").map_err(|e| to_io_error(&path, e))?;

    tracing::info!(path = %path.display(), "Created migration");
    Ok(path)
}
