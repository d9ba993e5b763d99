use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tempfile::NamedTempFile;

use super::types::FileResolution;
use crate::shared::StateLayout;

/// History cap. The log is read on every history request, so it is pruned
/// on append rather than allowed to grow without bound.
pub const AUDIT_LOG_CAP: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeAuditEntry {
    pub session_id: String,
    pub started: DateTime<Utc>,
    pub completed: DateTime<Utc>,
    pub resolutions: Vec<FileResolution>,
    pub commit_count: usize,
}

/// Append-only, bounded merge audit log, most recent entries last.
pub struct AuditLog {
    path: PathBuf,
    cap: usize,
}

impl AuditLog {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            path: layout.merge_history_file(),
            cap: AUDIT_LOG_CAP,
        }
    }

    #[cfg(test)]
    pub fn with_cap(layout: &StateLayout, cap: usize) -> Self {
        Self {
            path: layout.merge_history_file(),
            cap,
        }
    }

    /// A missing or corrupt log reads as empty; history is advisory.
    pub fn read(&self) -> Vec<MergeAuditEntry> {
        let Ok(body) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        match serde_json::from_str(&body) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Ignoring corrupt merge history at {}: {e}", self.path.display());
                Vec::new()
            }
        }
    }

    pub fn append(&self, entry: MergeAuditEntry) -> Result<()> {
        let mut entries = self.read();
        entries.push(entry);
        if entries.len() > self.cap {
            let drop = entries.len() - self.cap;
            entries.drain(..drop);
        }

        let dir = self
            .path
            .parent()
            .context("Merge history file has no parent directory")?;
        std::fs::create_dir_all(dir)?;
        let tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&tmp, &entries)?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to persist merge history to {}", self.path.display()))?;
        Ok(())
    }
}
