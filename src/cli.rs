use anyhow::{Context, Result, anyhow};
use clap::{ArgAction, Parser, Subcommand};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domains::git::GitAdapter;
use crate::domains::merge::{IntegrateOptions, MergeService, MergeStrategy};
use crate::domains::registry::ThreadType;
use crate::domains::sessions::{AnnotatedSession, SessionService, service_for_cwd};
use crate::errors::GleisError;

const DEFAULT_CREATE_TIMEOUT_MS: u64 = 30_000;

/// Session registry and worktree merge engine for parallel workers.
///
/// Every command prints one JSON object on stdout: `{"success": true,
/// "result": ...}` on success, `{"success": false, "error": ...}` on failure.
/// Logs go to stderr.
#[derive(Parser)]
#[command(name = "gleiswerk", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Register the current workspace as a session (idempotent on path)
    Register {
        /// Human-readable session name
        nickname: Option<String>,
        /// Thread type to record (parallel, chained, fusion, big, long)
        #[arg(long)]
        thread_type: Option<String>,
    },
    /// Create a new worktree-backed session under .gleiswerk/worktrees
    Create {
        #[arg(long)]
        nickname: String,
        #[arg(long)]
        branch: String,
        /// Abort worktree creation after this many milliseconds
        #[arg(long, default_value_t = DEFAULT_CREATE_TIMEOUT_MS)]
        timeout_ms: u64,
    },
    /// List sessions with liveness, locality and phase annotations
    List {
        /// Flat JSON list (the default)
        #[arg(long, conflicts_with = "kanban")]
        json: bool,
        /// Group sessions by phase instead of a flat list
        #[arg(long)]
        kanban: bool,
    },
    /// Remove a session record, its lock and optionally its worktree
    Delete {
        id: String,
        #[arg(long)]
        remove_worktree: bool,
    },
    /// Show a single annotated session
    Get { id: String },
    /// List sessions without registering the caller
    Status,
    /// Register, reclaim stale locks and list in one registry cycle
    FullStatus {
        nickname: Option<String>,
        #[arg(long)]
        thread_type: Option<String>,
    },
    /// Advisory sweep for stale sessions, orphaned locks, missing worktrees
    Health {
        /// Days of inactivity before an inactive session counts as stale
        stale_days: Option<i64>,
        #[arg(long)]
        detailed: bool,
    },
    /// Dry-run mergeability classification (never mutates)
    CheckMerge { id: String },
    /// Mergeability plus the per-file plan a smart merge would apply
    MergePreview { id: String },
    /// Merge a session's branch into trunk
    Integrate {
        id: String,
        /// squash or merge
        #[arg(long, default_value = "squash")]
        strategy: String,
        #[arg(long, action = ArgAction::Set, default_value_t = true,
              num_args = 0..=1, default_missing_value = "true")]
        delete_branch: bool,
        #[arg(long, action = ArgAction::Set, default_value_t = true,
              num_args = 0..=1, default_missing_value = "true")]
        delete_worktree: bool,
        /// Commit message override
        #[arg(long)]
        message: Option<String>,
    },
    /// Integrate with per-category conflict auto-resolution
    SmartMerge {
        id: String,
        #[arg(long, default_value = "squash")]
        strategy: String,
        #[arg(long, action = ArgAction::Set, default_value_t = true,
              num_args = 0..=1, default_missing_value = "true")]
        delete_branch: bool,
        #[arg(long, action = ArgAction::Set, default_value_t = true,
              num_args = 0..=1, default_missing_value = "true")]
        delete_worktree: bool,
        #[arg(long)]
        message: Option<String>,
    },
    /// Show the bounded merge audit log
    MergeHistory,
    /// Show or set a session's thread type
    #[command(args_conflicts_with_subcommands = true)]
    ThreadType {
        /// Session id to inspect (defaults to the current workspace's session)
        id: Option<String>,
        #[command(subcommand)]
        command: Option<ThreadTypeCommand>,
    },
}

#[derive(Subcommand)]
pub enum ThreadTypeCommand {
    /// Set a session's thread type
    Set { id: String, value: String },
}

pub async fn run(cli: Cli) -> Result<Value> {
    let cwd = std::env::current_dir().context("Failed to resolve current directory")?;
    let (sessions, workspace) = service_for_cwd(&cwd)?;

    match cli.command {
        Command::Register {
            nickname,
            thread_type,
        } => {
            let thread_type = parse_thread_type(thread_type.as_deref())?;
            let outcome = sessions.register(&workspace, nickname.as_deref(), thread_type)?;
            Ok(serde_json::to_value(outcome)?)
        }
        Command::Create {
            nickname,
            branch,
            timeout_ms,
        } => {
            let session = sessions
                .create(&nickname, &branch, Duration::from_millis(timeout_ms))
                .await?;
            Ok(serde_json::to_value(session)?)
        }
        Command::List { json: _, kanban } => {
            let listed = sessions.list(&workspace).await?;
            if kanban {
                Ok(json!({
                    "phases": group_by_phase(&listed.sessions),
                    "reclaimed": listed.reclaimed,
                }))
            } else {
                Ok(serde_json::to_value(listed)?)
            }
        }
        Command::Delete {
            id,
            remove_worktree,
        } => {
            let removed = sessions.delete(&id, remove_worktree)?;
            Ok(serde_json::to_value(removed)?)
        }
        Command::Get { id } => {
            let session = sessions.get(&id, &workspace).await?;
            Ok(serde_json::to_value(session)?)
        }
        Command::Status => {
            let listed = sessions.list(&workspace).await?;
            Ok(serde_json::to_value(listed)?)
        }
        Command::FullStatus {
            nickname,
            thread_type,
        } => {
            let thread_type = parse_thread_type(thread_type.as_deref())?;
            let (registered, listed) = sessions
                .full_status(&workspace, nickname.as_deref(), thread_type)
                .await?;
            Ok(json!({
                "session": registered.session,
                "created": registered.created,
                "sessions": listed.sessions,
                "reclaimed": listed.reclaimed,
            }))
        }
        Command::Health {
            stale_days,
            detailed,
        } => {
            let report = sessions.health(stale_days, detailed, &workspace).await?;
            Ok(serde_json::to_value(report)?)
        }
        Command::CheckMerge { id } => {
            let check = merge_service(&sessions).check_mergeability(&id)?;
            Ok(serde_json::to_value(check)?)
        }
        Command::MergePreview { id } => {
            let preview = merge_service(&sessions).preview(&id)?;
            Ok(serde_json::to_value(preview)?)
        }
        Command::Integrate {
            id,
            strategy,
            delete_branch,
            delete_worktree,
            message,
        } => {
            let opts = integrate_options(&strategy, delete_branch, delete_worktree, message)?;
            let outcome = merge_service(&sessions).integrate(&id, &opts)?;
            Ok(serde_json::to_value(outcome)?)
        }
        Command::SmartMerge {
            id,
            strategy,
            delete_branch,
            delete_worktree,
            message,
        } => {
            let opts = integrate_options(&strategy, delete_branch, delete_worktree, message)?;
            let outcome = merge_service(&sessions).smart_merge(&id, &opts)?;
            Ok(serde_json::to_value(outcome)?)
        }
        Command::MergeHistory => {
            let history = merge_service(&sessions).history();
            Ok(serde_json::to_value(history)?)
        }
        Command::ThreadType { id, command } => match command {
            Some(ThreadTypeCommand::Set { id, value }) => {
                let thread_type = ThreadType::parse(&value).ok_or_else(|| {
                    GleisError::invalid_input(
                        "thread_type",
                        format!("'{value}' is not one of base, parallel, chained, fusion, big, long"),
                    )
                })?;
                let session = sessions.set_thread_type(&id, thread_type)?;
                Ok(serde_json::to_value(session)?)
            }
            None => {
                let id = match id {
                    Some(id) => id,
                    None => current_session_id(&sessions, &workspace).await?,
                };
                let thread_type = sessions.thread_type(&id)?;
                Ok(json!({ "id": id, "thread_type": thread_type }))
            }
        },
    }
}

fn merge_service(sessions: &SessionService) -> MergeService {
    MergeService::new(sessions.layout().clone(), GitAdapter::new())
}

fn parse_thread_type(value: Option<&str>) -> Result<Option<ThreadType>> {
    match value {
        None => Ok(None),
        Some(raw) => ThreadType::parse(raw).map(Some).ok_or_else(|| {
            GleisError::invalid_input(
                "thread_type",
                format!("'{raw}' is not one of base, parallel, chained, fusion, big, long"),
            )
            .into()
        }),
    }
}

fn integrate_options(
    strategy: &str,
    delete_branch: bool,
    delete_worktree: bool,
    message: Option<String>,
) -> Result<IntegrateOptions> {
    let strategy = MergeStrategy::parse(strategy).ok_or_else(|| {
        GleisError::invalid_input("strategy", format!("'{strategy}' is not squash or merge"))
    })?;
    Ok(IntegrateOptions {
        strategy,
        delete_branch,
        delete_worktree,
        message,
    })
}

fn group_by_phase(sessions: &[AnnotatedSession]) -> Value {
    let mut groups: BTreeMap<&str, Vec<&AnnotatedSession>> = BTreeMap::new();
    for phase in ["todo", "coding", "review", "merged"] {
        groups.insert(phase, Vec::new());
    }
    for session in sessions {
        groups.entry(session.phase.as_str()).or_default().push(session);
    }
    json!(groups)
}

async fn current_session_id(
    sessions: &SessionService,
    workspace: &std::path::Path,
) -> Result<String> {
    let listed = sessions.list(workspace).await?;
    listed
        .sessions
        .into_iter()
        .find(|s| s.current)
        .map(|s| s.session.id)
        .ok_or_else(|| anyhow!("The current workspace is not a registered session"))
}
