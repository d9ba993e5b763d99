use serde::{Deserialize, Serialize};

/// Category of a changed file, computed from path and extension patterns.
/// The enum is exhaustive so every category is forced to carry a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileCategory {
    Docs,
    Test,
    Schema,
    Config,
    Source,
}

/// How a conflicting file of a given category is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Textual three-way union so both sides' additions survive.
    AcceptBoth,
    /// The worker's version wins outright.
    TakeTheirs,
    /// Trunk's version is kept and the file is flagged for human review.
    KeepOurs,
    /// Source code default: the worker's version is the active work.
    Recursive,
}

impl FileCategory {
    pub fn classify(path: &str) -> Self {
        let lower = path.to_ascii_lowercase();
        let file_name = lower.rsplit('/').next().unwrap_or(&lower);

        if lower.ends_with(".md") || file_name.starts_with("readme") {
            return Self::Docs;
        }
        if lower.contains("test") || lower.contains("spec") {
            return Self::Test;
        }
        if lower.ends_with(".sql") || lower.contains("schema") || lower.contains("migration") {
            return Self::Schema;
        }
        if lower.ends_with(".json")
            || lower.ends_with(".yaml")
            || lower.ends_with(".yml")
            || file_name.starts_with('.')
        {
            return Self::Config;
        }
        Self::Source
    }

    pub fn policy(&self) -> ResolutionPolicy {
        match self {
            Self::Docs => ResolutionPolicy::AcceptBoth,
            Self::Test => ResolutionPolicy::AcceptBoth,
            Self::Schema => ResolutionPolicy::TakeTheirs,
            Self::Config => ResolutionPolicy::KeepOurs,
            Self::Source => ResolutionPolicy::Recursive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    Squash,
    Merge,
}

impl MergeStrategy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "squash" => Some(Self::Squash),
            "merge" => Some(Self::Merge),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IntegrateOptions {
    pub strategy: MergeStrategy,
    pub delete_branch: bool,
    pub delete_worktree: bool,
    pub message: Option<String>,
}

impl Default for IntegrateOptions {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::Squash,
            delete_branch: true,
            delete_worktree: true,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotMergeableReason {
    UncommittedChanges,
    NoChanges,
}

/// Result of a mergeability analysis. `has_conflicts` is only meaningful
/// when the dry-run ran, i.e. `reason` is `None`.
#[derive(Debug, Clone, Serialize)]
pub struct MergeCheck {
    pub session_id: String,
    pub mergeable: bool,
    pub has_conflicts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NotMergeableReason>,
    pub ahead: usize,
    pub behind: usize,
}

/// A single per-file resolution applied (or planned) by the smart merge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileResolution {
    pub file: String,
    pub category: FileCategory,
    pub policy: ResolutionPolicy,
    /// Set for `keep_ours` files, which keep trunk's content but must not
    /// silently drop the worker's intent.
    pub needs_review: bool,
}

impl FileResolution {
    pub fn planned(file: &str) -> Self {
        let category = FileCategory::classify(file);
        let policy = category.policy();
        Self {
            file: file.to_string(),
            category,
            policy,
            needs_review: policy == ResolutionPolicy::KeepOurs,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub session_id: String,
    pub strategy: MergeStrategy,
    pub commits_merged: usize,
    pub resolutions: Vec<FileResolution>,
    pub worktree_removed: bool,
    pub branch_deleted: bool,
    pub record_removed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergePreview {
    pub session_id: String,
    pub branch: String,
    pub main_branch: String,
    pub mergeable: bool,
    pub has_conflicts: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<NotMergeableReason>,
    pub ahead: usize,
    pub behind: usize,
    /// Files changed on both sides since the merge base, with the resolution
    /// the smart merge would apply to each.
    pub planned_resolutions: Vec<FileResolution>,
}
