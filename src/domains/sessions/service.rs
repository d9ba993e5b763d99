use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use log::{debug, info, warn};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domains::git::{GitAdapter, is_valid_branch_name, is_valid_nickname};
use crate::domains::locks::{LockManager, is_alive};
use crate::domains::registry::{Registry, RegistryStore, Session, ThreadType};
use crate::domains::sessions::lifecycle::{CreateWorktreeConfig, WorktreeBootstrapper};
use crate::domains::sessions::phase::{Phase, PhaseDetector};
use crate::errors::GleisError;
use crate::shared::StateLayout;

const DEFAULT_STALE_DAYS: i64 = 7;

/// Session record annotated with per-invocation liveness and locality.
#[derive(Debug, Clone, Serialize)]
pub struct AnnotatedSession {
    #[serde(flatten)]
    pub session: Session,
    pub active: bool,
    pub current: bool,
    pub phase: Phase,
}

#[derive(Debug, Serialize)]
pub struct ListOutcome {
    pub sessions: Vec<AnnotatedSession>,
    pub reclaimed: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterOutcome {
    pub session: Session,
    pub created: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub stale_sessions: Vec<String>,
    pub orphaned_locks: Vec<String>,
    pub missing_worktrees: Vec<String>,
    pub active_count: usize,
    pub total_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Vec<AnnotatedSession>>,
}

/// Register/list/delete and friends. One instance per CLI invocation; the
/// registry is read-modify-written at most once per operation.
pub struct SessionService {
    layout: StateLayout,
    store: RegistryStore,
    locks: LockManager,
    git: GitAdapter,
    phases: PhaseDetector,
}

impl SessionService {
    pub fn new(layout: StateLayout, git: GitAdapter) -> Self {
        let store = RegistryStore::new(&layout);
        let locks = LockManager::new(&layout);
        Self {
            layout,
            store,
            locks,
            git,
            phases: PhaseDetector::new(),
        }
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn git(&self) -> &GitAdapter {
        &self.git
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Idempotent on workspace path: a re-register refreshes the existing
    /// record and its lock; it never allocates a second id.
    pub fn register(
        &self,
        workspace: &Path,
        nickname: Option<&str>,
        thread_type: Option<ThreadType>,
    ) -> Result<RegisterOutcome> {
        let mut registry = self.store.load()?;
        let outcome = self.register_in(&mut registry, workspace, nickname, thread_type)?;
        self.store.save(&registry)?;
        Ok(outcome)
    }

    fn register_in(
        &self,
        registry: &mut Registry,
        workspace: &Path,
        nickname: Option<&str>,
        thread_type: Option<ThreadType>,
    ) -> Result<RegisterOutcome> {
        if let Some(nick) = nickname
            && !is_valid_nickname(nick)
        {
            return Err(GleisError::invalid_input(
                "nickname",
                format!("'{nick}' contains characters outside [A-Za-z0-9_-]"),
            )
            .into());
        }

        let workspace = normalize_path(workspace);
        let branch = self.git.current_branch(&workspace)?;
        let pid = std::process::id() as i32;
        let now = Utc::now();

        if let Some(existing) = registry.find_by_path_mut(&workspace) {
            existing.branch = branch;
            existing.last_active = now;
            if let Some(nick) = nickname {
                existing.nickname = Some(nick.to_string());
            }
            if let Some(tt) = thread_type {
                validate_thread_type(tt, existing.is_main)?;
                existing.thread_type = tt;
            }
            if let Some(story) = self.read_current_story() {
                existing.story = Some(story);
            }
            let session = existing.clone();
            self.locks.write_lock(&session.id, pid)?;
            debug!("Refreshed existing session '{}' for {}", session.id, workspace.display());
            return Ok(RegisterOutcome {
                session,
                created: false,
            });
        }

        let trunk = normalize_path(self.layout.trunk());
        let is_main = workspace == trunk && !self.git.is_linked_worktree(&workspace)?;
        if is_main && registry.main_session().is_some() {
            return Err(GleisError::registry(format!(
                "A main session already exists; refusing a second one at {}",
                workspace.display()
            ))
            .into());
        }

        let thread_type = match thread_type {
            Some(tt) => {
                validate_thread_type(tt, is_main)?;
                tt
            }
            None if is_main => ThreadType::Base,
            None => ThreadType::Parallel,
        };

        let id = registry.allocate_id();
        let session = Session {
            id: id.clone(),
            path: workspace.clone(),
            branch,
            nickname: nickname.map(|n| n.to_string()),
            story: self.read_current_story(),
            thread_type,
            is_main,
            created: now,
            last_active: now,
            merged_at: None,
        };
        registry.insert(session.clone());
        self.locks.write_lock(&id, pid)?;
        info!(
            "Registered session '{id}' at {} (main: {is_main})",
            workspace.display()
        );
        Ok(RegisterOutcome {
            session,
            created: true,
        })
    }

    /// Lists all sessions annotated with `active` and `current`, reclaiming
    /// stale locks (dead PID) along the way. Records are never deleted here,
    /// only their dead liveness claims.
    pub async fn list(&self, current_workspace: &Path) -> Result<ListOutcome> {
        let registry = self.store.load()?;
        self.annotate_all(&registry, current_workspace).await
    }

    /// Register + list + reclaim in a single read-modify-write cycle. The
    /// lock refresh for the caller happens before reclamation runs, so a
    /// session can never reclaim its own just-written lock.
    pub async fn full_status(
        &self,
        workspace: &Path,
        nickname: Option<&str>,
        thread_type: Option<ThreadType>,
    ) -> Result<(RegisterOutcome, ListOutcome)> {
        let mut registry = self.store.load()?;
        let registered = self.register_in(&mut registry, workspace, nickname, thread_type)?;
        self.store.save(&registry)?;
        let listed = self.annotate_all(&registry, workspace).await?;
        Ok((registered, listed))
    }

    async fn annotate_all(
        &self,
        registry: &Registry,
        current_workspace: &Path,
    ) -> Result<ListOutcome> {
        let current_workspace = normalize_path(current_workspace);
        let main_branch = self.main_branch(registry)?;

        // Liveness probes run in parallel purely for latency; each branch is
        // pure and results are reduced sequentially below.
        let probes = registry.sessions.values().map(|session| {
            let locks = self.locks.clone();
            let id = session.id.clone();
            async move {
                let lock = locks.read_lock(&id);
                let alive = lock.as_ref().map(|l| is_alive(l.pid)).unwrap_or(false);
                (id, lock.is_some(), alive)
            }
        });
        let probe_results = futures::future::join_all(probes).await;

        let mut reclaimed = Vec::new();
        let mut liveness = std::collections::HashMap::new();
        for (id, had_lock, alive) in probe_results {
            if had_lock && !alive {
                self.locks.remove_lock(&id);
                info!("Reclaimed stale lock for session '{id}'");
                reclaimed.push(id.clone());
            }
            liveness.insert(id, alive);
        }

        let mut sessions = Vec::new();
        for session in registry.sessions.values() {
            let phase = self
                .phases
                .detect(&self.git, session, &main_branch)
                .unwrap_or_else(|e| {
                    warn!("Phase detection failed for session '{}': {e}", session.id);
                    Phase::Todo
                });
            sessions.push(AnnotatedSession {
                active: liveness.get(&session.id).copied().unwrap_or(false),
                current: normalize_path(&session.path) == current_workspace,
                phase,
                session: session.clone(),
            });
        }
        sessions.sort_by_key(|s| s.session.id.parse::<u64>().unwrap_or(u64::MAX));

        Ok(ListOutcome {
            sessions,
            reclaimed,
        })
    }

    pub async fn get(&self, id: &str, current_workspace: &Path) -> Result<AnnotatedSession> {
        let listed = self.list(current_workspace).await?;
        listed
            .sessions
            .into_iter()
            .find(|s| s.session.id == id)
            .ok_or_else(|| {
                GleisError::SessionNotFound {
                    session_id: id.to_string(),
                }
                .into()
            })
    }

    /// Creates a new worktree-backed session. The record lands in the
    /// registry without a lock; the worker claims it when it registers from
    /// inside the worktree.
    pub async fn create(
        &self,
        nickname: &str,
        branch: &str,
        timeout: Duration,
    ) -> Result<Session> {
        if !is_valid_nickname(nickname) {
            return Err(GleisError::invalid_input(
                "nickname",
                format!("'{nickname}' contains characters outside [A-Za-z0-9_-]"),
            )
            .into());
        }
        if !is_valid_branch_name(branch) {
            return Err(GleisError::invalid_input(
                "branch",
                format!("'{branch}' is not a safe branch name"),
            )
            .into());
        }

        let worktree_path = self.layout.worktree_path(nickname);
        if worktree_path.exists() {
            return Err(GleisError::invalid_input(
                "nickname",
                format!("worktree already exists at {}", worktree_path.display()),
            )
            .into());
        }
        {
            let registry = self.store.load()?;
            if registry.find_by_path(&normalize_path(&worktree_path)).is_some() {
                return Err(GleisError::registry(format!(
                    "A session already owns {}",
                    worktree_path.display()
                ))
                .into());
            }
        }

        let bootstrapper = WorktreeBootstrapper::new(&self.layout, &self.git);
        bootstrapper
            .create_worktree(CreateWorktreeConfig {
                branch,
                worktree_path: &worktree_path,
                timeout,
            })
            .await?;

        // Fresh read-modify-write after the (potentially slow) creation so
        // concurrent registrations are not clobbered.
        let mut registry = self.store.load()?;
        let now = Utc::now();
        let id = registry.allocate_id();
        let session = Session {
            id: id.clone(),
            path: normalize_path(&worktree_path),
            branch: branch.to_string(),
            nickname: Some(nickname.to_string()),
            story: self.read_current_story(),
            thread_type: ThreadType::Parallel,
            is_main: false,
            created: now,
            last_active: now,
            merged_at: None,
        };
        registry.insert(session.clone());
        self.store.save(&registry)?;
        info!("Created session '{id}' with worktree {}", worktree_path.display());
        Ok(session)
    }

    /// Removes a session: lock first, then (optionally) the worktree, and
    /// the registry record last, so a failed worktree removal never leaves
    /// an orphaned half-deleted record.
    pub fn delete(&self, id: &str, remove_worktree: bool) -> Result<Session> {
        let mut registry = self.store.load()?;
        let session = registry
            .get(id)
            .cloned()
            .ok_or_else(|| GleisError::SessionNotFound {
                session_id: id.to_string(),
            })?;

        if session.is_main {
            return Err(GleisError::MainSessionProtected {
                session_id: id.to_string(),
            }
            .into());
        }

        self.locks.remove_lock(id);

        if remove_worktree && session.path.exists() {
            self.git
                .remove_worktree(self.layout.trunk(), &session.path)
                .with_context(|| {
                    format!("Failed to remove worktree {}", session.path.display())
                })?;
        }

        registry.remove(id);
        self.store.save(&registry)?;
        info!("Deleted session '{id}'");
        Ok(session)
    }

    pub fn thread_type(&self, id: &str) -> Result<ThreadType> {
        let registry = self.store.load()?;
        registry
            .get(id)
            .map(|s| s.thread_type)
            .ok_or_else(|| {
                GleisError::SessionNotFound {
                    session_id: id.to_string(),
                }
                .into()
            })
    }

    pub fn set_thread_type(&self, id: &str, thread_type: ThreadType) -> Result<Session> {
        let mut registry = self.store.load()?;
        let session = registry
            .get_mut(id)
            .ok_or_else(|| GleisError::SessionNotFound {
                session_id: id.to_string(),
            })?;
        validate_thread_type(thread_type, session.is_main)?;
        session.thread_type = thread_type;
        session.last_active = Utc::now();
        let updated = session.clone();
        self.store.save(&registry)?;
        Ok(updated)
    }

    /// Advisory health sweep. Nothing here aborts; broken pieces are
    /// reported, stale locks are reclaimed as in `list`.
    pub async fn health(
        &self,
        stale_days: Option<i64>,
        detailed: bool,
        current_workspace: &Path,
    ) -> Result<HealthReport> {
        let stale_days = stale_days.unwrap_or(DEFAULT_STALE_DAYS);
        let listed = self.list(current_workspace).await?;
        let now = Utc::now();

        let mut stale_sessions = Vec::new();
        let mut missing_worktrees = Vec::new();
        let mut active_count = 0;
        for annotated in &listed.sessions {
            if annotated.active {
                active_count += 1;
            } else if (now - annotated.session.last_active).num_days() >= stale_days {
                stale_sessions.push(annotated.session.id.clone());
            }
            if !annotated.session.path.exists() {
                missing_worktrees.push(annotated.session.id.clone());
            }
        }

        let known: std::collections::HashSet<&str> = listed
            .sessions
            .iter()
            .map(|s| s.session.id.as_str())
            .collect();
        let mut orphaned_locks = Vec::new();
        if let Ok(entries) = std::fs::read_dir(self.layout.locks_dir()) {
            for entry in entries.filter_map(Result::ok) {
                let name = entry.file_name().to_string_lossy().to_string();
                if let Some(id) = name.strip_suffix(".json")
                    && !known.contains(id)
                {
                    orphaned_locks.push(id.to_string());
                }
            }
        }

        Ok(HealthReport {
            stale_sessions,
            orphaned_locks,
            missing_worktrees,
            active_count,
            total_count: listed.sessions.len(),
            detail: detailed.then_some(listed.sessions),
        })
    }

    fn main_branch(&self, registry: &Registry) -> Result<String> {
        if let Some(main) = registry.main_session() {
            return Ok(main.branch.clone());
        }
        self.git.current_branch(self.layout.trunk())
    }

    /// Best-effort read of the shared status store feeding the advisory
    /// `story` field. Never fails registration.
    fn read_current_story(&self) -> Option<String> {
        let body = std::fs::read_to_string(self.layout.status_file()).ok()?;
        let value: serde_json::Value = serde_json::from_str(&body).ok()?;
        value
            .get("current_story")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

fn validate_thread_type(thread_type: ThreadType, is_main: bool) -> Result<()> {
    if thread_type == ThreadType::Base && !is_main {
        return Err(GleisError::invalid_input(
            "thread_type",
            "'base' is reserved for the main session",
        )
        .into());
    }
    if is_main && thread_type != ThreadType::Base {
        return Err(GleisError::invalid_input(
            "thread_type",
            "the main session is always 'base'",
        )
        .into());
    }
    Ok(())
}

fn normalize_path(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Resolves the trunk root for the workspace containing `cwd` and builds the
/// per-invocation service around it.
pub fn service_for_cwd(cwd: &Path) -> Result<(SessionService, PathBuf)> {
    let git = GitAdapter::new();
    let workspace = git
        .toplevel(cwd)
        .map_err(|e| anyhow!("Not inside a git repository: {e}"))?;
    let trunk = git.trunk_root(cwd)?;
    let layout = StateLayout::new(normalize_path(&trunk));
    Ok((SessionService::new(layout, git), normalize_path(&workspace)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command as StdCommand;
    use tempfile::TempDir;

    fn git(repo: &Path, args: &[&str]) {
        let out = StdCommand::new("git")
            .args(args)
            .current_dir(repo)
            .output()
            .unwrap();
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
    }

    fn init_repo() -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let repo = tmp.path().canonicalize().unwrap();
        git(&repo, &["init", "-b", "main"]);
        git(&repo, &["config", "user.email", "test@example.com"]);
        git(&repo, &["config", "user.name", "Test"]);
        std::fs::write(repo.join("README.md"), "init\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-m", "init"]);
        (tmp, repo)
    }

    fn service(repo: &Path) -> SessionService {
        SessionService::new(StateLayout::new(repo), GitAdapter::new())
    }

    #[test]
    fn registering_trunk_yields_main_base_session() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        let outcome = svc.register(&repo, None, None).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.session.id, "1");
        assert!(outcome.session.is_main);
        assert_eq!(outcome.session.thread_type, ThreadType::Base);
        assert_eq!(outcome.session.branch, "main");
    }

    #[test]
    fn register_is_idempotent_on_path() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        let first = svc.register(&repo, None, None).unwrap();
        let second = svc.register(&repo, Some("root"), None).unwrap();
        assert!(!second.created);
        assert_eq!(first.session.id, second.session.id);
        assert_eq!(second.session.nickname.as_deref(), Some("root"));
        assert!(second.session.last_active >= first.session.last_active);

        let registry = svc.store.load().unwrap();
        assert_eq!(registry.sessions.len(), 1);
        assert_eq!(registry.next_id, 2);
    }

    #[test]
    fn worktree_session_is_not_main() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        svc.register(&repo, None, None).unwrap();

        let wt = repo.join(".gleiswerk/worktrees/auth");
        git(
            &repo,
            &["worktree", "add", "-b", "feature/auth", wt.to_str().unwrap(), "main"],
        );
        let outcome = svc.register(&wt, Some("auth"), None).unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.session.id, "2");
        assert!(!outcome.session.is_main);
        assert_eq!(outcome.session.thread_type, ThreadType::Parallel);
        assert_eq!(outcome.session.branch, "feature/auth");
    }

    #[test]
    fn main_session_cannot_be_deleted() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        let outcome = svc.register(&repo, None, None).unwrap();
        let err = svc.delete(&outcome.session.id, false).unwrap_err();
        assert!(err.to_string().contains("Cannot delete main session"));
        assert!(svc.store.load().unwrap().get("1").is_some());
    }

    #[test]
    fn delete_removes_record_and_lock() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        svc.register(&repo, None, None).unwrap();
        let wt = repo.join(".gleiswerk/worktrees/w");
        git(
            &repo,
            &["worktree", "add", "-b", "feature/w", wt.to_str().unwrap(), "main"],
        );
        let session = svc.register(&wt, None, None).unwrap().session;
        assert!(svc.locks().read_lock(&session.id).is_some());

        svc.delete(&session.id, true).unwrap();
        assert!(svc.store.load().unwrap().get(&session.id).is_none());
        assert!(svc.locks().read_lock(&session.id).is_none());
        assert!(!wt.exists());
    }

    #[test]
    fn unknown_session_is_reported_without_side_effects() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        svc.register(&repo, None, None).unwrap();
        let err = svc.delete("99", false).unwrap_err();
        assert!(err.to_string().contains("not found"));
        assert_eq!(svc.store.load().unwrap().sessions.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn list_reclaims_dead_locks_but_keeps_records() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        let session = svc.register(&repo, None, None).unwrap().session;

        // Fake a dead owner.
        svc.locks().write_lock(&session.id, i32::MAX - 1).unwrap();
        let listed = svc.list(&repo).await.unwrap();
        assert_eq!(listed.reclaimed, vec![session.id.clone()]);
        assert!(!listed.sessions[0].active);
        assert!(listed.sessions[0].current);
        assert!(svc.store.load().unwrap().get(&session.id).is_some());
        assert!(svc.locks().read_lock(&session.id).is_none());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn full_status_does_not_reclaim_its_own_fresh_lock() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        let (registered, listed) = svc.full_status(&repo, None, None).await.unwrap();
        assert!(registered.created);
        assert!(listed.reclaimed.is_empty());
        let own = listed
            .sessions
            .iter()
            .find(|s| s.session.id == registered.session.id)
            .unwrap();
        assert!(own.active);
        assert!(own.current);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn create_builds_worktree_and_allocates_id() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        svc.register(&repo, None, None).unwrap();

        let session = svc
            .create("auth", "feature/auth", Duration::from_secs(30))
            .await
            .unwrap_or_else(|e| panic!("create failed: {e}"));
        assert_eq!(session.id, "2");
        assert!(!session.is_main);
        assert_eq!(session.thread_type, ThreadType::Parallel);
        assert!(session.path.exists());
        assert!(session.path.starts_with(repo.join(".gleiswerk/worktrees")));
    }

    #[test]
    fn invalid_names_are_rejected_before_any_mutation() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        let err = svc.register(&repo, Some("bad nick!"), None).unwrap_err();
        assert!(err.to_string().contains("nickname"));
        assert!(svc.store.load().unwrap().sessions.is_empty());
    }

    #[test]
    fn base_thread_type_is_reserved_for_main() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        svc.register(&repo, None, None).unwrap();
        let wt = repo.join(".gleiswerk/worktrees/t");
        git(
            &repo,
            &["worktree", "add", "-b", "feature/t", wt.to_str().unwrap(), "main"],
        );
        let session = svc.register(&wt, None, None).unwrap().session;
        assert!(svc.set_thread_type(&session.id, ThreadType::Base).is_err());
        let updated = svc.set_thread_type(&session.id, ThreadType::Big).unwrap();
        assert_eq!(updated.thread_type, ThreadType::Big);
        assert_eq!(svc.thread_type(&session.id).unwrap(), ThreadType::Big);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn health_reports_stale_and_orphans() {
        let (_tmp, repo) = init_repo();
        let svc = service(&repo);
        let session = svc.register(&repo, None, None).unwrap().session;
        svc.locks().remove_lock(&session.id);

        // Orphaned lock with no matching record.
        svc.locks().write_lock("777", std::process::id() as i32).unwrap();

        let report = svc.health(Some(0), false, &repo).await.unwrap();
        assert_eq!(report.total_count, 1);
        assert_eq!(report.active_count, 0);
        assert!(report.stale_sessions.contains(&session.id));
        assert!(report.orphaned_locks.contains(&"777".to_string()));
        assert!(report.detail.is_none());
    }
}
