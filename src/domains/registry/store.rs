use anyhow::{Context, Result};
use log::debug;
use std::fs;
use std::path::PathBuf;
use tempfile::NamedTempFile;

use super::entity::Registry;
use crate::shared::StateLayout;

/// Durable store for the registry document. Multiple OS processes write
/// concurrently with no cross-process lock; each mutation is a full
/// read-modify-write of a small JSON document, and the save is atomic
/// (write to a temp file in the same directory, then rename) so a crash
/// mid-write can never corrupt the store.
#[derive(Clone)]
pub struct RegistryStore {
    registry_file: PathBuf,
    project_name: String,
}

impl RegistryStore {
    pub fn new(layout: &StateLayout) -> Self {
        let project_name = layout
            .trunk()
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "project".to_string());
        Self {
            registry_file: layout.registry_file(),
            project_name,
        }
    }

    /// Loads the registry, creating a default empty document (with the id
    /// counter at 1) on first use. The result must never be cached across
    /// process boundaries; callers hold it for one command invocation only.
    pub fn load(&self) -> Result<Registry> {
        if !self.registry_file.exists() {
            debug!(
                "Registry file {} does not exist yet, starting empty",
                self.registry_file.display()
            );
            return Ok(Registry::empty(&self.project_name));
        }

        let body = fs::read_to_string(&self.registry_file).with_context(|| {
            format!("Failed to read registry {}", self.registry_file.display())
        })?;
        serde_json::from_str(&body).with_context(|| {
            format!(
                "Registry file {} is not valid JSON",
                self.registry_file.display()
            )
        })
    }

    pub fn save(&self, registry: &Registry) -> Result<()> {
        let dir = self
            .registry_file
            .parent()
            .context("Registry file has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state dir {}", dir.display()))?;

        // The temp file must live in the same directory as the target so the
        // rename stays on one filesystem and is atomic.
        let tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&tmp, registry).context("Failed to serialize registry")?;
        tmp.persist(&self.registry_file).with_context(|| {
            format!(
                "Failed to persist registry to {}",
                self.registry_file.display()
            )
        })?;
        Ok(())
    }
}
