use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fs;
use std::path::Path;

use super::adapter::GitAdapter;
use super::command::{git_stdout, run_git};
use crate::errors::GleisError;

/// Outcome of starting a merge with `--no-commit --no-ff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAttempt {
    Clean,
    Conflicted(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveSide {
    Ours,
    Theirs,
}

impl GitAdapter {
    pub fn checkout_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        git_stdout(repo, &["checkout", branch], "checkout")?;
        self.cache.invalidate_repo(repo);
        Ok(())
    }

    /// Attempts to merge `branch` into the current branch without committing.
    /// A nonzero exit with unmerged paths is a conflict report, not an error;
    /// a nonzero exit with no unmerged paths is a real tool failure.
    pub fn begin_merge_no_commit(&self, repo: &Path, branch: &str) -> Result<MergeAttempt> {
        self.cache.invalidate_repo(repo);
        let out = run_git(repo, &["merge", "--no-commit", "--no-ff", branch])?;
        if out.success {
            return Ok(MergeAttempt::Clean);
        }
        let conflicts = self.conflicted_files(repo)?;
        if conflicts.is_empty() {
            self.abort_merge(repo);
            return Err(GleisError::git("merge --no-commit", out.stderr.trim()).into());
        }
        Ok(MergeAttempt::Conflicted(conflicts))
    }

    /// Best-effort: there may be no merge in progress, which is fine.
    pub fn abort_merge(&self, repo: &Path) {
        match run_git(repo, &["merge", "--abort"]) {
            Ok(out) if !out.success => {
                debug!("merge --abort reported: {}", out.stderr.trim());
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to spawn merge --abort: {e}"),
        }
        self.cache.invalidate_repo(repo);
    }

    /// Reverts whatever a failed merge attempt left behind. A normal merge
    /// leaves `MERGE_HEAD` and `merge --abort` handles it; a conflicted
    /// squash merge leaves no `MERGE_HEAD`, so `reset --merge` is the
    /// fallback that clears the conflicted index and working tree.
    pub fn rollback_merge(&self, repo: &Path) {
        let aborted = run_git(repo, &["merge", "--abort"])
            .map(|out| out.success)
            .unwrap_or(false);
        if !aborted {
            match run_git(repo, &["reset", "--merge"]) {
                Ok(out) if !out.success => {
                    warn!("reset --merge reported: {}", out.stderr.trim());
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to spawn reset --merge: {e}"),
            }
        }
        self.cache.invalidate_repo(repo);
    }

    pub fn resolve_with_side(&self, repo: &Path, file: &str, side: ResolveSide) -> Result<()> {
        let flag = match side {
            ResolveSide::Ours => "--ours",
            ResolveSide::Theirs => "--theirs",
        };
        git_stdout(repo, &["checkout", flag, "--", file], "checkout side")?;
        Ok(())
    }

    /// Textual three-way union merge of a conflicted file: both sides'
    /// additions survive. Stages `:1` (base), `:2` (ours) and `:3` (theirs)
    /// are extracted from the index; a side missing its stage (file added on
    /// both branches) is treated as empty.
    pub fn union_merge_file(&self, repo: &Path, file: &str) -> Result<()> {
        let dir = tempfile::tempdir().context("Failed to create temp dir for union merge")?;
        let base = dir.path().join("base");
        let ours = dir.path().join("ours");
        let theirs = dir.path().join("theirs");

        for (stage, path) in [(1, &base), (2, &ours), (3, &theirs)] {
            let spec = format!(":{stage}:{file}");
            let out = run_git(repo, &["show", &spec])?;
            let body = if out.success { out.stdout } else { String::new() };
            fs::write(path, body)
                .with_context(|| format!("Failed to write merge stage {stage} for {file}"))?;
        }

        let ours_str = ours.to_string_lossy().to_string();
        let base_str = base.to_string_lossy().to_string();
        let theirs_str = theirs.to_string_lossy().to_string();
        let out = run_git(
            repo,
            &["merge-file", "--union", "-p", &ours_str, &base_str, &theirs_str],
        )?;
        // merge-file exits with the number of (suppressed) conflicts on
        // success and negative on real trouble; with --union any non-negative
        // code still produced a full union body.
        if out.code.is_none_or(|c| c < 0) {
            return Err(GleisError::git("merge-file --union", out.stderr.trim()).into());
        }
        fs::write(repo.join(file), out.stdout)
            .with_context(|| format!("Failed to write union-merged content to {file}"))?;
        Ok(())
    }

    pub fn stage(&self, repo: &Path, file: &str) -> Result<()> {
        git_stdout(repo, &["add", "--", file], "add")?;
        Ok(())
    }

    pub fn commit(&self, repo: &Path, message: &str) -> Result<()> {
        git_stdout(repo, &["commit", "-m", message], "commit")?;
        self.cache.invalidate_repo(repo);
        Ok(())
    }

    /// Squash merge: applies `branch` to the index without committing.
    pub fn squash_merge(&self, repo: &Path, branch: &str) -> Result<()> {
        self.cache.invalidate_repo(repo);
        let out = run_git(repo, &["merge", "--squash", branch])?;
        if !out.success {
            return Err(GleisError::git("merge --squash", out.stderr.trim()).into());
        }
        Ok(())
    }

    pub fn merge_no_ff(&self, repo: &Path, branch: &str, message: &str) -> Result<()> {
        self.cache.invalidate_repo(repo);
        let out = run_git(repo, &["merge", "--no-ff", "-m", message, branch])?;
        if !out.success {
            return Err(GleisError::git("merge --no-ff", out.stderr.trim()).into());
        }
        Ok(())
    }

    /// Local fast-forward against the configured upstream, when one exists.
    /// Never fetches; failure is advisory only.
    pub fn try_fast_forward(&self, repo: &Path) {
        match run_git(repo, &["merge", "--ff-only", "@{upstream}"]) {
            Ok(out) if out.success => {
                self.cache.invalidate_repo(repo);
                info!("Fast-forwarded trunk branch to its upstream");
            }
            Ok(out) => debug!("Skipping fast-forward: {}", out.stderr.trim()),
            Err(e) => debug!("Skipping fast-forward: {e}"),
        }
    }

    /// Normal delete first, forced delete as fallback.
    pub fn delete_branch(&self, repo: &Path, branch: &str) -> Result<()> {
        self.cache.invalidate_repo(repo);
        let out = run_git(repo, &["branch", "-d", branch])?;
        if out.success {
            return Ok(());
        }
        debug!(
            "Normal delete of branch '{branch}' failed ({}), forcing",
            out.stderr.trim()
        );
        let forced = run_git(repo, &["branch", "-D", branch])?;
        if !forced.success {
            return Err(GleisError::git("branch -D", forced.stderr.trim()).into());
        }
        Ok(())
    }

    /// Clean removal first, forced removal as fallback.
    pub fn remove_worktree(&self, repo: &Path, worktree: &Path) -> Result<()> {
        self.cache.invalidate_repo(repo);
        let wt = worktree.to_string_lossy().to_string();
        let out = run_git(repo, &["worktree", "remove", &wt])?;
        if out.success {
            return Ok(());
        }
        debug!(
            "Clean worktree removal of {} failed ({}), forcing",
            worktree.display(),
            out.stderr.trim()
        );
        let forced = run_git(repo, &["worktree", "remove", "--force", &wt])?;
        if !forced.success {
            return Err(GleisError::git("worktree remove --force", forced.stderr.trim()).into());
        }
        Ok(())
    }

    pub fn prune_worktrees(&self, repo: &Path) {
        match run_git(repo, &["worktree", "prune"]) {
            Ok(out) if !out.success => {
                warn!("worktree prune reported: {}", out.stderr.trim());
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to spawn worktree prune: {e}"),
        }
        self.cache.invalidate_repo(repo);
    }
}

/// Branch names reach subprocess argument lists, so the character set is a
/// hard boundary: letters, digits, `-`, `_` and `/` only, with no leading
/// dash or dot segments.
pub fn is_valid_branch_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 200 {
        return false;
    }
    if name.starts_with('-') || name.starts_with('/') || name.ends_with('/') {
        return false;
    }
    if name.contains("..") || name.contains("//") {
        return false;
    }
    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '/'))
}

/// Nicknames share the branch rules minus path separators.
pub fn is_valid_nickname(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
}
