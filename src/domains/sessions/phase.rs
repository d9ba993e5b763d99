use anyhow::Result;
use dashmap::DashMap;
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::domains::git::GitAdapter;
use crate::domains::registry::Session;

const DEFAULT_PHASE_TTL: Duration = Duration::from_secs(10);

/// Lifecycle phase of a session, derived from git state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Todo,
    Coding,
    Review,
    Merged,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Todo => "todo",
            Self::Coding => "coding",
            Self::Review => "review",
            Self::Merged => "merged",
        }
    }
}

struct CachedPhase {
    phase: Phase,
    computed: Instant,
}

/// Derives a phase per session workspace with a short-TTL cache, so a
/// dashboard rendering N sessions does not spawn N fresh git queries per
/// refresh. Entries age out by TTL only; there are no explicit invalidation
/// hooks.
pub struct PhaseDetector {
    cache: DashMap<PathBuf, CachedPhase>,
    ttl: Duration,
}

impl PhaseDetector {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_PHASE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            cache: DashMap::new(),
            ttl,
        }
    }

    pub fn detect(&self, git: &GitAdapter, session: &Session, main_branch: &str) -> Result<Phase> {
        if session.merged_at.is_some() || session.is_main {
            return Ok(Phase::Merged);
        }

        if let Some(cached) = self.cache.get(&session.path)
            && cached.computed.elapsed() <= self.ttl
        {
            return Ok(cached.phase);
        }

        let (ahead, _behind) = git.ahead_behind(&session.path, main_branch, &session.branch)?;
        let phase = if ahead == 0 {
            Phase::Todo
        } else if git.has_uncommitted_changes(&session.path)? {
            Phase::Coding
        } else {
            Phase::Review
        };

        self.cache.insert(
            session.path.clone(),
            CachedPhase {
                phase,
                computed: Instant::now(),
            },
        );
        Ok(phase)
    }
}

impl Default for PhaseDetector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::registry::ThreadType;
    use chrono::Utc;
    use std::path::Path;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git(repo: &Path, args: &[&str]) {
        let out = StdCommand::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .unwrap();
        assert!(out.status.success());
    }

    fn init_repo() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().to_path_buf();
        git(&repo, &["init", "-b", "main"]);
        git(&repo, &["config", "user.email", "test@example.com"]);
        git(&repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "init\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "init"]);
        (tmp, repo)
    }

    fn session_at(path: &Path, branch: &str) -> Session {
        Session {
            id: "2".to_string(),
            path: path.to_path_buf(),
            branch: branch.to_string(),
            nickname: None,
            story: None,
            thread_type: ThreadType::Parallel,
            is_main: false,
            created: Utc::now(),
            last_active: Utc::now(),
            merged_at: None,
        }
    }

    #[test]
    fn main_session_is_always_merged() {
        let (_tmp, repo) = init_repo();
        let detector = PhaseDetector::new();
        let adapter = GitAdapter::new();
        let mut session = session_at(&repo, "main");
        session.is_main = true;
        assert_eq!(
            detector.detect(&adapter, &session, "main").unwrap(),
            Phase::Merged
        );
    }

    #[test]
    fn phase_follows_commits_and_dirtiness() {
        let (_tmp, repo) = init_repo();
        let detector = PhaseDetector::with_ttl(Duration::ZERO);
        let adapter = GitAdapter::with_ttl(Duration::ZERO);

        let wt = repo.join(".gleiswerk/worktrees/w");
        git(
            &repo,
            &["worktree", "add", "-b", "feature/w", wt.to_str().unwrap(), "main"],
        );
        let session = session_at(&wt, "feature/w");

        // No commits ahead of main yet.
        assert_eq!(
            detector.detect(&adapter, &session, "main").unwrap(),
            Phase::Todo
        );

        // One commit ahead, clean tree.
        std::fs::write(wt.join("work.txt"), "done\n").unwrap();
        git(&wt, &["add", "."]);
        git(&wt, &["commit", "-m", "work"]);
        assert_eq!(
            detector.detect(&adapter, &session, "main").unwrap(),
            Phase::Review
        );

        // One commit ahead, dirty tree.
        std::fs::write(wt.join("wip.txt"), "wip\n").unwrap();
        assert_eq!(
            detector.detect(&adapter, &session, "main").unwrap(),
            Phase::Coding
        );
    }

    #[test]
    fn merged_marker_wins_over_git_state() {
        let (_tmp, repo) = init_repo();
        let detector = PhaseDetector::new();
        let adapter = GitAdapter::new();
        let mut session = session_at(&repo, "main");
        session.merged_at = Some(Utc::now());
        assert_eq!(
            detector.detect(&adapter, &session, "main").unwrap(),
            Phase::Merged
        );
    }

    #[test]
    fn cache_serves_within_ttl() {
        let (_tmp, repo) = init_repo();
        let detector = PhaseDetector::with_ttl(Duration::from_secs(60));
        let adapter = GitAdapter::with_ttl(Duration::ZERO);

        let wt = repo.join(".gleiswerk/worktrees/c");
        git(
            &repo,
            &["worktree", "add", "-b", "feature/c", wt.to_str().unwrap(), "main"],
        );
        let session = session_at(&wt, "feature/c");
        assert_eq!(
            detector.detect(&adapter, &session, "main").unwrap(),
            Phase::Todo
        );

        // The workspace moved ahead, but the cached phase is still served.
        std::fs::write(wt.join("work.txt"), "x\n").unwrap();
        git(&wt, &["add", "."]);
        git(&wt, &["commit", "-m", "work"]);
        assert_eq!(
            detector.detect(&adapter, &session, "main").unwrap(),
            Phase::Todo
        );
    }
}
