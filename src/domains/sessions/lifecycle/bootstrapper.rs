use anyhow::{Context, Result};
use log::{info, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::timeout;
use walkdir::WalkDir;

use crate::domains::git::GitAdapter;
use crate::errors::GleisError;
use crate::shared::StateLayout;
use crate::shared::paths::{DOCS_DIR_NAME, STATE_DIR_NAME};

/// Grace period between SIGTERM and SIGKILL when a worktree-add subprocess
/// overruns its timeout.
const TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// Config directories copied wholesale into new worktrees.
const CONFIG_DIRS: [&str; 3] = [".vscode", ".idea", "config"];

pub struct CreateWorktreeConfig<'a> {
    pub branch: &'a str,
    pub worktree_path: &'a Path,
    pub timeout: Duration,
}

/// Creates and tears down isolated workspace checkouts. The creation
/// subprocess is hard-bounded by a timeout with graceful-then-forceful
/// termination, and every failure path ends in best-effort cleanup of the
/// partial state it left behind.
pub struct WorktreeBootstrapper<'a> {
    layout: &'a StateLayout,
    git: &'a GitAdapter,
}

impl<'a> WorktreeBootstrapper<'a> {
    pub fn new(layout: &'a StateLayout, git: &'a GitAdapter) -> Self {
        Self { layout, git }
    }

    pub async fn create_worktree(&self, config: CreateWorktreeConfig<'a>) -> Result<()> {
        let trunk = self.layout.trunk();
        let branch_was_created = !self.git.branch_exists(trunk, config.branch)?;

        info!(
            "Creating worktree at {} on branch '{}' (timeout {:?})",
            config.worktree_path.display(),
            config.branch,
            config.timeout
        );

        if let Some(parent) = config.worktree_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create worktree parent dir {}", parent.display())
            })?;
        }

        let path_arg = config.worktree_path.to_string_lossy().to_string();
        let mut cmd = Command::new("git");
        cmd.current_dir(trunk)
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if branch_was_created {
            cmd.args(["worktree", "add", "-b", config.branch, &path_arg]);
        } else {
            cmd.args(["worktree", "add", &path_arg, config.branch]);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| GleisError::git("worktree add", e))?;
        let mut stderr_pipe = child.stderr.take();

        let status = match timeout(config.timeout, child.wait()).await {
            Ok(wait_result) => {
                wait_result.map_err(|e| GleisError::git("worktree add", e))?
            }
            Err(_) => {
                self.terminate(&mut child).await;
                self.cleanup_partial(config.worktree_path, config.branch, branch_was_created);
                return Err(GleisError::WorktreeTimeout {
                    path: config.worktree_path.display().to_string(),
                    timeout_ms: config.timeout.as_millis() as u64,
                }
                .into());
            }
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_string(&mut stderr).await.ok();
            }
            self.cleanup_partial(config.worktree_path, config.branch, branch_was_created);
            return Err(GleisError::git("worktree add", stderr.trim()).into());
        }

        self.copy_env_files(config.worktree_path);
        self.copy_config_dirs(config.worktree_path);
        self.link_shared_state(config.worktree_path);

        info!(
            "Worktree ready at {}",
            config.worktree_path.display()
        );
        Ok(())
    }

    /// SIGTERM first, SIGKILL after the grace period.
    async fn terminate(&self, child: &mut tokio::process::Child) {
        if let Some(pid) = child.id() {
            warn!("Worktree creation timed out, sending SIGTERM to {pid}");
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        if timeout(TERMINATION_GRACE, child.wait()).await.is_err() {
            warn!("Worktree subprocess ignored SIGTERM, killing");
            child.kill().await.ok();
        }
    }

    /// Best-effort rollback of a failed creation: the partial directory, the
    /// git worktree registration, and (only when this call created it and it
    /// carries no unique commits) the branch. Errors are logged, not raised.
    pub fn cleanup_partial(&self, worktree_path: &Path, branch: &str, branch_was_created: bool) {
        let trunk = self.layout.trunk();

        if worktree_path.exists()
            && let Err(e) = std::fs::remove_dir_all(worktree_path)
        {
            warn!(
                "Failed to remove partial worktree {}: {e}",
                worktree_path.display()
            );
        }

        self.git.prune_worktrees(trunk);

        if branch_was_created {
            match self.git.unique_commit_count(trunk, "HEAD", branch) {
                Ok(0) => {
                    if let Err(e) = self.git.delete_branch(trunk, branch) {
                        warn!("Failed to delete partially created branch '{branch}': {e}");
                    }
                }
                Ok(n) => {
                    info!("Keeping branch '{branch}' with {n} unique commit(s) after failed creation");
                }
                Err(e) => {
                    warn!("Could not inspect branch '{branch}' during cleanup: {e}");
                }
            }
        }
    }

    /// Copies `.env*` files present in trunk but absent from the worktree.
    fn copy_env_files(&self, worktree_path: &Path) {
        let Ok(entries) = std::fs::read_dir(self.layout.trunk()) else {
            return;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(".env") {
                continue;
            }
            let dest = worktree_path.join(&name);
            if dest.exists() {
                continue;
            }
            match std::fs::copy(&path, &dest) {
                Ok(_) => info!("Copied {name} into new worktree"),
                Err(e) => warn!("Failed to copy {name} into worktree: {e}"),
            }
        }
    }

    fn copy_config_dirs(&self, worktree_path: &Path) {
        for dir_name in CONFIG_DIRS {
            let source = self.layout.trunk().join(dir_name);
            let dest = worktree_path.join(dir_name);
            if !source.is_dir() || dest.exists() {
                continue;
            }
            if let Err(e) = copy_dir_recursive(&source, &dest) {
                warn!("Failed to copy config dir {dir_name} into worktree: {e}");
            }
        }
    }

    /// Symlinks the coordination-state directories into the worktree so every
    /// session observes one registry and one shared docs tree. A platform
    /// that refuses the symlink gets a one-time copy and a warning.
    fn link_shared_state(&self, worktree_path: &Path) {
        let shared = [
            (self.layout.state_dir(), STATE_DIR_NAME),
            (self.layout.docs_dir(), DOCS_DIR_NAME),
        ];
        for (source, name) in shared {
            if !source.exists() {
                continue;
            }
            let dest = worktree_path.join(name);
            if dest.exists() || dest.is_symlink() {
                continue;
            }
            if let Err(e) = std::os::unix::fs::symlink(&source, &dest) {
                warn!(
                    "Could not symlink {name} into worktree ({e}), falling back to a one-time copy; \
                     this worktree will not observe live registry updates through {name}"
                );
                if let Err(copy_err) = copy_dir_recursive(&source, &dest) {
                    warn!("Fallback copy of {name} failed too: {copy_err}");
                }
            }
        }
    }
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .context("WalkDir produced a path outside its root")?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy to {}", target.display()))?;
        }
    }
    Ok(())
}
