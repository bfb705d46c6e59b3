//! File helpers for the job store: atomic JSON records and append-only logs.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// Serialize `value` and replace `path` with it atomically (temp file in the
/// same directory, fsync, rename).
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize record for {}", path.display()))?;

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create job directory {}", dir.display()))?;

    let stem = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("job.json");
    let staging = dir.join(format!(".{stem}.{}.tmp", uuid::Uuid::new_v4()));

    let mut file = File::create(&staging)
        .with_context(|| format!("failed to create staging file {}", staging.display()))?;
    file.write_all(body.as_bytes())
        .and_then(|()| file.sync_all())
        .with_context(|| format!("failed to write staging file {}", staging.display()))?;

    std::fs::rename(&staging, path).with_context(|| {
        format!(
            "failed to move {} into place at {}",
            staging.display(),
            path.display()
        )
    })
}

/// Append one line to a log file, creating it (and its directory) on demand.
pub(crate) fn append_line(path: &Path, line: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log {}", path.display()))?;
    writeln!(file, "{line}").with_context(|| format!("failed to append to {}", path.display()))
}

/// All lines of a log file; a missing file reads as empty.
pub(crate) fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to open log {}", path.display()));
        }
    };
    BufReader::new(file)
        .lines()
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read log {}", path.display()))
}

/// Delete `path`; already-missing files are fine.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error).with_context(|| format!("failed to delete {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_leaves_no_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs").join("a.json");
        write_json_atomic(&path, &serde_json::json!({"id": "a"})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"id": "b"})).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("\"b\""));
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn log_lines_append_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("a.log");
        assert!(read_lines(&path).unwrap().is_empty());
        append_line(&path, "first").unwrap();
        append_line(&path, "second").unwrap();
        assert_eq!(read_lines(&path).unwrap(), vec!["first", "second"]);
        remove_if_exists(&path).unwrap();
        remove_if_exists(&path).unwrap();
        assert!(!path.exists());
    }
}
