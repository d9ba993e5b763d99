use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::cache::QueryCache;
use super::command::{git_stdout, git_succeeds, run_git};

/// Subprocess-backed git adapter. Owns the short-TTL cache for read-only
/// queries; one instance is constructed per CLI invocation and threaded
/// through the services that need it, never held as a process-wide global.
pub struct GitAdapter {
    pub(super) cache: QueryCache,
}

impl GitAdapter {
    pub fn new() -> Self {
        Self {
            cache: QueryCache::default(),
        }
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: QueryCache::new(ttl),
        }
    }

    fn cached_query(&self, op: &str, repo: &Path, args: &[&str]) -> Result<String> {
        let key = QueryCache::key(op, repo, args);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }
        let value = git_stdout(repo, args, op)?;
        self.cache.put(key, value.clone());
        Ok(value)
    }

    pub fn current_branch(&self, repo: &Path) -> Result<String> {
        self.cached_query("current_branch", repo, &["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn branch_exists(&self, repo: &Path, branch: &str) -> Result<bool> {
        let key = QueryCache::key("branch_exists", repo, &[branch]);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit == "true");
        }
        let refname = format!("refs/heads/{branch}");
        let exists = git_succeeds(repo, &["show-ref", "--verify", "--quiet", &refname])?;
        self.cache.put(key, exists.to_string());
        Ok(exists)
    }

    /// Commit counts `(ahead, behind)` of `branch` relative to `base`.
    pub fn ahead_behind(&self, repo: &Path, base: &str, branch: &str) -> Result<(usize, usize)> {
        let range = format!("{base}...{branch}");
        let counts = self.cached_query(
            "ahead_behind",
            repo,
            &["rev-list", "--left-right", "--count", &range],
        )?;
        let mut parts = counts.split_whitespace();
        let behind: usize = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| anyhow!("Unexpected rev-list output: '{counts}'"))?;
        let ahead: usize = parts
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| anyhow!("Unexpected rev-list output: '{counts}'"))?;
        Ok((ahead, behind))
    }

    /// Not cached: the working tree can change between any two commands.
    pub fn has_uncommitted_changes(&self, repo: &Path) -> Result<bool> {
        let out = git_stdout(
            repo,
            &["status", "--porcelain"],
            "status",
        )?;
        Ok(!out.is_empty())
    }

    pub fn merge_base(&self, repo: &Path, a: &str, b: &str) -> Result<String> {
        self.cached_query("merge_base", repo, &["merge-base", a, b])
    }

    /// Files changed on `branch` since `base` (a commit hash or ref).
    pub fn changed_files_since(&self, repo: &Path, base: &str, branch: &str) -> Result<Vec<String>> {
        let out = self.cached_query("changed_files", repo, &["diff", "--name-only", base, branch])?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    /// Whether `workspace` is a secondary (linked) checkout rather than the
    /// repository that owns the object store. This is the single capability
    /// query that distinguishes the main session from worktree sessions.
    pub fn is_linked_worktree(&self, workspace: &Path) -> Result<bool> {
        let key = QueryCache::key("is_linked_worktree", workspace, &[]);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit == "true");
        }
        let git_dir = git_stdout(
            workspace,
            &["rev-parse", "--path-format=absolute", "--git-dir"],
            "rev-parse --git-dir",
        )?;
        let common_dir = git_stdout(
            workspace,
            &["rev-parse", "--path-format=absolute", "--git-common-dir"],
            "rev-parse --git-common-dir",
        )?;
        let linked = git_dir != common_dir;
        self.cache.put(key, linked.to_string());
        Ok(linked)
    }

    /// Root of the workspace the given path lives in (trunk or a worktree).
    pub fn toplevel(&self, path: &Path) -> Result<PathBuf> {
        let out = self.cached_query("toplevel", path, &["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out))
    }

    /// Root of the trunk checkout, resolved from anywhere inside the trunk
    /// or any of its linked worktrees via the shared common dir.
    pub fn trunk_root(&self, path: &Path) -> Result<PathBuf> {
        let common = git_stdout(
            path,
            &["rev-parse", "--path-format=absolute", "--git-common-dir"],
            "rev-parse --git-common-dir",
        )?;
        let common = PathBuf::from(common);
        common
            .parent()
            .map(|p| p.to_path_buf())
            .with_context(|| format!("Git common dir {} has no parent", common.display()))
    }

    /// Conflicted (unmerged) paths of an in-progress merge. Never cached.
    pub fn conflicted_files(&self, repo: &Path) -> Result<Vec<String>> {
        let out = git_stdout(
            repo,
            &["diff", "--name-only", "--diff-filter=U"],
            "list conflicts",
        )?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    /// Number of commits on `branch` that are not reachable from `base`.
    /// A missing branch counts as zero, which is meaningful data for
    /// best-effort branch cleanup.
    pub fn unique_commit_count(&self, repo: &Path, base: &str, branch: &str) -> Result<usize> {
        let range = format!("{base}..{branch}");
        let out = run_git(repo, &["rev-list", "--count", &range])?;
        if !out.success {
            return Ok(0);
        }
        Ok(out.stdout_trimmed().parse().unwrap_or(0))
    }
}

impl Default for GitAdapter {
    fn default() -> Self {
        Self::new()
    }
}
