use std::path::{Path, PathBuf};

/// Name of the coordination directory under the trunk root. It holds the
/// registry, lock files and the merge audit log, and is symlinked into every
/// worktree so all sessions observe the same state.
pub const STATE_DIR_NAME: &str = ".gleiswerk";

/// Shared documentation/status directory. Linked into worktrees alongside
/// the state directory when it exists in trunk.
pub const DOCS_DIR_NAME: &str = "docs";

/// On-disk layout of all coordination state for one trunk repository.
#[derive(Debug, Clone)]
pub struct StateLayout {
    trunk: PathBuf,
}

impl StateLayout {
    pub fn new(trunk: impl Into<PathBuf>) -> Self {
        Self {
            trunk: trunk.into(),
        }
    }

    pub fn trunk(&self) -> &Path {
        &self.trunk
    }

    pub fn state_dir(&self) -> PathBuf {
        self.trunk.join(STATE_DIR_NAME)
    }

    pub fn registry_file(&self) -> PathBuf {
        self.state_dir().join("registry.json")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir().join("locks")
    }

    pub fn lock_file(&self, session_id: &str) -> PathBuf {
        self.locks_dir().join(format!("{session_id}.json"))
    }

    pub fn merge_history_file(&self) -> PathBuf {
        self.state_dir().join("merge_history.json")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.state_dir().join("worktrees")
    }

    pub fn worktree_path(&self, name: &str) -> PathBuf {
        self.worktrees_dir().join(name)
    }

    pub fn docs_dir(&self) -> PathBuf {
        self.trunk.join(DOCS_DIR_NAME)
    }

    /// Path of the shared status file consumed for the advisory `story`
    /// field on registration. Read-only collaborator interface.
    pub fn status_file(&self) -> PathBuf {
        self.docs_dir().join("status.json")
    }
}
