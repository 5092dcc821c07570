//! Audit logger for writing grant entries to file.
//!
//! Writes one JSON object per line for easy parsing by log analysis tools.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::KnockResult;

use super::entry::GrantEntry;

/// Append-only JSON lines log of completed knocks.
///
/// Owned by the knock worker, so writes need no locking.
pub struct AuditLogger {
    file: File,
    path: PathBuf,
}

impl AuditLogger {
    /// Open `path` for appending, creating parent directories if needed.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the audit log file
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Parent directory cannot be created
    /// - File cannot be opened for appending
    pub fn new(path: &Path) -> KnockResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                debug!(path = %parent.display(), "Creating audit log directory");
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;

        debug!(path = %path.display(), "Audit logger initialized");

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Serialize `entry` as a single line and sync it to disk.
    pub fn log(&mut self, entry: &GrantEntry) -> KnockResult<()> {
        let json = serde_json::to_string(entry)?;
        writeln!(self.file, "{}", json)?;

        if let Err(e) = self.file.sync_data() {
            warn!(error = %e, "Failed to sync audit log");
        }

        debug!(
            grant_id = %entry.grant_id,
            identity = %entry.identity,
            "Audit entry logged"
        );

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;
    use tempfile::TempDir;

    fn entry(identity: &str) -> GrantEntry {
        GrantEntry::new(
            SystemTime::now(),
            identity,
            "192.0.2.33".parse().unwrap(),
            20001,
            42,
        )
    }

    #[test]
    fn test_logger_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("subdir/grants.log");

        let logger = AuditLogger::new(&log_path).unwrap();
        assert!(log_path.parent().unwrap().exists());
        assert_eq!(logger.path(), log_path);
    }

    #[test]
    fn test_logger_writes_json_lines() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("grants.log");

        let mut logger = AuditLogger::new(&log_path).unwrap();
        logger.log(&entry("alice")).unwrap();
        logger.log(&entry("bob")).unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["identity"], "alice");
        assert_eq!(first["source"], "192.0.2.33");
        assert_eq!(first["port"], 20001);

        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["identity"], "bob");
    }

    #[test]
    fn test_logger_appends_to_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let log_path = temp_dir.path().join("grants.log");

        {
            let mut logger = AuditLogger::new(&log_path).unwrap();
            logger.log(&entry("alice")).unwrap();
        }
        {
            let mut logger = AuditLogger::new(&log_path).unwrap();
            logger.log(&entry("alice")).unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
