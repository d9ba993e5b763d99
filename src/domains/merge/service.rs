use anyhow::{Result, anyhow};
use chrono::Utc;
use log::{info, warn};
use std::collections::HashSet;

use super::audit::{AuditLog, MergeAuditEntry};
use super::types::{
    FileResolution, IntegrateOptions, MergeCheck, MergeOutcome, MergePreview, MergeStrategy,
    NotMergeableReason, ResolutionPolicy,
};
use crate::domains::git::{GitAdapter, MergeAttempt, ResolveSide};
use crate::domains::locks::LockManager;
use crate::domains::registry::{RegistryStore, Session};
use crate::errors::GleisError;
use crate::shared::StateLayout;

struct MergeContext {
    session: Session,
    main_branch: String,
}

/// Mergeability analysis, integration and smart auto-resolution for one
/// session against trunk. The only component (together with the worktree
/// bootstrapper) allowed to hold the filesystem in an intermediate state
/// mid-operation; every path out of here ends fully applied or fully
/// reverted.
pub struct MergeService {
    layout: StateLayout,
    store: RegistryStore,
    locks: LockManager,
    git: GitAdapter,
    audit: AuditLog,
}

impl MergeService {
    pub fn new(layout: StateLayout, git: GitAdapter) -> Self {
        let store = RegistryStore::new(&layout);
        let locks = LockManager::new(&layout);
        let audit = AuditLog::new(&layout);
        Self {
            layout,
            store,
            locks,
            git,
            audit,
        }
    }

    fn context(&self, session_id: &str) -> Result<MergeContext> {
        let registry = self.store.load()?;
        let session = registry
            .get(session_id)
            .cloned()
            .ok_or_else(|| GleisError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        if session.is_main {
            return Err(GleisError::invalid_input(
                "session",
                "the main session is the merge target, not a merge source",
            )
            .into());
        }
        let main_branch = match registry.main_session() {
            Some(main) => main.branch.clone(),
            None => self.git.current_branch(self.layout.trunk())?,
        };
        Ok(MergeContext {
            session,
            main_branch,
        })
    }

    /// Classifies a session as mergeable / conflicted / not-mergeable. The
    /// dry run always aborts and restores whatever branch the trunk checkout
    /// was on, regardless of outcome.
    pub fn check_mergeability(&self, session_id: &str) -> Result<MergeCheck> {
        let ctx = self.context(session_id)?;
        let trunk = self.layout.trunk();
        let (ahead, behind) =
            self.git
                .ahead_behind(trunk, &ctx.main_branch, &ctx.session.branch)?;

        if self.git.has_uncommitted_changes(&ctx.session.path)? {
            return Ok(MergeCheck {
                session_id: session_id.to_string(),
                mergeable: false,
                has_conflicts: false,
                reason: Some(NotMergeableReason::UncommittedChanges),
                ahead,
                behind,
            });
        }

        if ahead == 0 {
            return Ok(MergeCheck {
                session_id: session_id.to_string(),
                mergeable: false,
                has_conflicts: false,
                reason: Some(NotMergeableReason::NoChanges),
                ahead,
                behind,
            });
        }

        let has_conflicts = self.dry_run_has_conflicts(&ctx)?;
        Ok(MergeCheck {
            session_id: session_id.to_string(),
            mergeable: !has_conflicts,
            has_conflicts,
            reason: None,
            ahead,
            behind,
        })
    }

    fn dry_run_has_conflicts(&self, ctx: &MergeContext) -> Result<bool> {
        let trunk = self.layout.trunk();
        let prior = self.git.current_branch(trunk)?;
        if prior != ctx.main_branch {
            self.git.checkout_branch(trunk, &ctx.main_branch)?;
        }

        let attempt = self.git.begin_merge_no_commit(trunk, &ctx.session.branch);
        self.git.abort_merge(trunk);

        if prior != ctx.main_branch
            && let Err(e) = self.git.checkout_branch(trunk, &prior)
        {
            warn!("Failed to restore trunk checkout to '{prior}' after dry run: {e}");
        }

        Ok(matches!(attempt?, MergeAttempt::Conflicted(_)))
    }

    /// Dry analysis of what a smart merge would do, including the per-file
    /// resolution plan for paths changed on both sides since the merge base.
    pub fn preview(&self, session_id: &str) -> Result<MergePreview> {
        let check = self.check_mergeability(session_id)?;
        let ctx = self.context(session_id)?;
        let trunk = self.layout.trunk();

        let planned_resolutions = if check.has_conflicts {
            let base = self
                .git
                .merge_base(trunk, &ctx.main_branch, &ctx.session.branch)?;
            let ours: HashSet<String> = self
                .git
                .changed_files_since(trunk, &base, &ctx.main_branch)?
                .into_iter()
                .collect();
            self.git
                .changed_files_since(trunk, &base, &ctx.session.branch)?
                .into_iter()
                .filter(|file| ours.contains(file))
                .map(|file| FileResolution::planned(&file))
                .collect()
        } else {
            Vec::new()
        };

        Ok(MergePreview {
            session_id: session_id.to_string(),
            branch: ctx.session.branch,
            main_branch: ctx.main_branch,
            mergeable: check.mergeable,
            has_conflicts: check.has_conflicts,
            reason: check.reason,
            ahead: check.ahead,
            behind: check.behind,
            planned_resolutions,
        })
    }

    /// Straight integration of a session's branch into trunk. Any merge
    /// failure aborts the in-progress merge and returns without touching
    /// the registry; cleanup runs only after the merge landed.
    pub fn integrate(&self, session_id: &str, opts: &IntegrateOptions) -> Result<MergeOutcome> {
        let ctx = self.context(session_id)?;
        let trunk = self.layout.trunk();

        if self.git.has_uncommitted_changes(&ctx.session.path)? {
            return Err(anyhow!(
                "Session '{session_id}' has uncommitted changes; commit or discard them before integrating"
            ));
        }
        let (ahead, _behind) =
            self.git
                .ahead_behind(trunk, &ctx.main_branch, &ctx.session.branch)?;
        if ahead == 0 {
            return Err(anyhow!(
                "Session '{session_id}' has no commits to merge into '{}'",
                ctx.main_branch
            ));
        }

        self.git.checkout_branch(trunk, &ctx.main_branch)?;
        self.git.try_fast_forward(trunk);

        let message = opts
            .message
            .clone()
            .unwrap_or_else(|| default_message(&ctx));
        let merge_result = match opts.strategy {
            MergeStrategy::Squash => self
                .git
                .squash_merge(trunk, &ctx.session.branch)
                .and_then(|_| self.git.commit(trunk, &message)),
            MergeStrategy::Merge => self.git.merge_no_ff(trunk, &ctx.session.branch, &message),
        };
        if let Err(e) = merge_result {
            // A conflicted squash leaves no MERGE_HEAD, so plain
            // merge --abort would not restore the trunk checkout here.
            self.git.rollback_merge(trunk);
            return Err(e);
        }

        info!(
            "Integrated session '{session_id}' ({}) into '{}'",
            ctx.session.branch, ctx.main_branch
        );
        self.cleanup_after_merge(&ctx, opts, ahead, Vec::new())
    }

    /// Auto-resolving merge. Either every conflicting file resolves by its
    /// category's policy and one commit lands, or the merge is aborted with
    /// zero persistent change and the full resolved/unresolved split is
    /// reported.
    pub fn smart_merge(&self, session_id: &str, opts: &IntegrateOptions) -> Result<MergeOutcome> {
        let started = Utc::now();
        let check = self.check_mergeability(session_id)?;
        match check.reason {
            Some(NotMergeableReason::UncommittedChanges) => {
                return Err(anyhow!(
                    "Session '{session_id}' has uncommitted changes; commit or discard them before merging"
                ));
            }
            Some(NotMergeableReason::NoChanges) => {
                return Err(anyhow!(
                    "Session '{session_id}' has no commits to merge"
                ));
            }
            None => {}
        }

        if !check.has_conflicts {
            return self.integrate(session_id, opts);
        }

        let ctx = self.context(session_id)?;
        let trunk = self.layout.trunk();
        self.git.checkout_branch(trunk, &ctx.main_branch)?;

        let conflicts = match self.git.begin_merge_no_commit(trunk, &ctx.session.branch)? {
            MergeAttempt::Conflicted(files) => files,
            // The conflict disappeared between check and merge (another
            // process moved trunk); the staged clean merge is committed below.
            MergeAttempt::Clean => Vec::new(),
        };

        let mut resolved: Vec<FileResolution> = Vec::new();
        let mut unresolved: Vec<String> = Vec::new();
        for file in &conflicts {
            let plan = FileResolution::planned(file);
            let applied = self
                .resolve_file(&plan)
                .and_then(|_| self.git.stage(trunk, file));
            match applied {
                Ok(()) => {
                    info!(
                        "Auto-resolved '{file}' as {:?} via {:?}",
                        plan.category, plan.policy
                    );
                    resolved.push(plan);
                }
                Err(e) => {
                    warn!("Could not auto-resolve '{file}': {e}");
                    unresolved.push(file.clone());
                }
            }
        }

        if !unresolved.is_empty() {
            self.git.abort_merge(trunk);
            return Err(GleisError::MergeConflict {
                resolved: resolved.into_iter().map(|r| r.file).collect(),
                unresolved,
                message: "auto-resolution incomplete; nothing was committed".to_string(),
            }
            .into());
        }

        let message = opts.message.clone().unwrap_or_else(|| {
            format!(
                "{} [auto-resolved {} conflict(s)]",
                default_message(&ctx),
                resolved.len()
            )
        });
        if let Err(e) = self.git.commit(trunk, &message) {
            self.git.abort_merge(trunk);
            return Err(e);
        }

        let entry = MergeAuditEntry {
            session_id: session_id.to_string(),
            started,
            completed: Utc::now(),
            resolutions: resolved.clone(),
            commit_count: check.ahead,
        };
        if let Err(e) = self.audit.append(entry) {
            warn!("Failed to persist merge audit entry for '{session_id}': {e}");
        }

        info!(
            "Smart-merged session '{session_id}' with {} auto-resolved file(s)",
            resolved.len()
        );
        // A conflicted merge always lands as a merge commit; only the
        // conflict-free path above can honor a squash request.
        let applied = IntegrateOptions {
            strategy: MergeStrategy::Merge,
            ..opts.clone()
        };
        self.cleanup_after_merge(&ctx, &applied, check.ahead, resolved)
    }

    fn resolve_file(&self, plan: &FileResolution) -> Result<()> {
        let trunk = self.layout.trunk();
        match plan.policy {
            ResolutionPolicy::AcceptBoth => {
                self.git.union_merge_file(trunk, &plan.file).or_else(|e| {
                    warn!(
                        "Union merge unavailable for '{}' ({e}), accepting the worker's version",
                        plan.file
                    );
                    self.git
                        .resolve_with_side(trunk, &plan.file, ResolveSide::Theirs)
                })
            }
            ResolutionPolicy::TakeTheirs | ResolutionPolicy::Recursive => self
                .git
                .resolve_with_side(trunk, &plan.file, ResolveSide::Theirs),
            ResolutionPolicy::KeepOurs => self
                .git
                .resolve_with_side(trunk, &plan.file, ResolveSide::Ours),
        }
    }

    /// Post-merge cleanup. Failures here are advisory (the merge itself has
    /// landed); the registry record is removed only when its worktree is
    /// actually gone, otherwise the terminal `merged_at` marker is set.
    fn cleanup_after_merge(
        &self,
        ctx: &MergeContext,
        opts: &IntegrateOptions,
        commits_merged: usize,
        resolutions: Vec<FileResolution>,
    ) -> Result<MergeOutcome> {
        let trunk = self.layout.trunk();
        let id = &ctx.session.id;
        let mut worktree_removed = false;
        let mut branch_deleted = false;

        if opts.delete_worktree {
            self.locks.remove_lock(id);
            if ctx.session.path.exists() {
                match self.git.remove_worktree(trunk, &ctx.session.path) {
                    Ok(()) => worktree_removed = true,
                    Err(e) => warn!(
                        "Failed to remove worktree {} after merge: {e}",
                        ctx.session.path.display()
                    ),
                }
            } else {
                worktree_removed = true;
            }
        }

        if opts.delete_branch {
            match self.git.delete_branch(trunk, &ctx.session.branch) {
                Ok(()) => branch_deleted = true,
                Err(e) => warn!(
                    "Failed to delete branch '{}' after merge: {e}",
                    ctx.session.branch
                ),
            }
        }

        let mut registry = self.store.load()?;
        let record_removed = if worktree_removed {
            registry.remove(id).is_some()
        } else {
            if let Some(session) = registry.get_mut(id) {
                session.merged_at = Some(Utc::now());
                session.last_active = Utc::now();
            }
            false
        };
        self.store.save(&registry)?;

        Ok(MergeOutcome {
            session_id: id.clone(),
            strategy: opts.strategy,
            commits_merged,
            resolutions,
            worktree_removed,
            branch_deleted,
            record_removed,
        })
    }

    pub fn history(&self) -> Vec<MergeAuditEntry> {
        self.audit.read()
    }
}

fn default_message(ctx: &MergeContext) -> String {
    format!(
        "Merge session {} ({}) into {}",
        ctx.session.id, ctx.session.branch, ctx.main_branch
    )
}
