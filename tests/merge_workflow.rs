use gleiswerk::domains::git::GitAdapter;
use gleiswerk::domains::merge::{
    IntegrateOptions, MergeService, NotMergeableReason, ResolutionPolicy,
};
use gleiswerk::domains::registry::RegistryStore;
use gleiswerk::domains::sessions::SessionService;
use gleiswerk::errors::GleisError;
use gleiswerk::shared::StateLayout;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

fn git(repo: &Path, args: &[&str]) {
    let out = Command::new("git")
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

fn commit_file(repo: &Path, file: &str, content: &str, message: &str) {
    std::fs::write(repo.join(file), content).unwrap();
    git(repo, &["add", "."]);
    git(repo, &["commit", "-m", message]);
}

fn init_repo() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().canonicalize().unwrap();
    git(&repo, &["init", "-b", "main"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test"]);
    commit_file(&repo, "README.md", "# project\n", "init");
    (tmp, repo)
}

fn services(repo: &Path) -> (SessionService, MergeService) {
    let sessions = SessionService::new(StateLayout::new(repo), GitAdapter::new());
    let merges = MergeService::new(StateLayout::new(repo), GitAdapter::new());
    (sessions, merges)
}

#[tokio::test(flavor = "current_thread")]
async fn full_lifecycle_from_create_to_smart_merge() {
    let (_tmp, repo) = init_repo();
    let (sessions, merges) = services(&repo);
    sessions.register(&repo, None, None).unwrap();

    let session = sessions
        .create("auth", "feature/auth", Duration::from_secs(30))
        .await
        .unwrap();
    let wt = session.path.clone();

    // Worker edits README, trunk edits it too, on different lines.
    commit_file(&wt, "README.md", "# project\n\nAuth module docs.\n", "auth docs");
    commit_file(
        &repo,
        "README.md",
        "Release notes.\n# project\n",
        "trunk docs",
    );

    let check = merges.check_mergeability(&session.id).unwrap();
    assert!(check.has_conflicts);
    assert!(!check.mergeable);
    assert_eq!(check.ahead, 1);

    let preview = merges.preview(&session.id).unwrap();
    assert_eq!(preview.planned_resolutions.len(), 1);
    assert_eq!(
        preview.planned_resolutions[0].policy,
        ResolutionPolicy::AcceptBoth
    );

    let outcome = merges
        .smart_merge(&session.id, &IntegrateOptions::default())
        .unwrap();
    assert!(outcome.worktree_removed);
    assert!(outcome.branch_deleted);
    assert!(outcome.record_removed);

    let merged = std::fs::read_to_string(repo.join("README.md")).unwrap();
    assert!(merged.contains("Auth module docs."));
    assert!(merged.contains("Release notes."));

    let history = merges.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].resolutions[0].file, "README.md");

    let registry = RegistryStore::new(&StateLayout::new(&repo)).load().unwrap();
    assert!(registry.get(&session.id).is_none());
    assert!(!wt.exists());
}

#[tokio::test(flavor = "current_thread")]
async fn dirty_worker_blocks_merging_without_a_dry_run() {
    let (_tmp, repo) = init_repo();
    let (sessions, merges) = services(&repo);
    sessions.register(&repo, None, None).unwrap();

    let session = sessions
        .create("wip", "feature/wip", Duration::from_secs(30))
        .await
        .unwrap();
    commit_file(&session.path, "work.txt", "done\n", "work");
    std::fs::write(session.path.join("scratch.txt"), "uncommitted\n").unwrap();

    let check = merges.check_mergeability(&session.id).unwrap();
    assert_eq!(check.reason, Some(NotMergeableReason::UncommittedChanges));

    let err = merges
        .smart_merge(&session.id, &IntegrateOptions::default())
        .unwrap_err();
    assert!(err.to_string().contains("uncommitted"));
}

#[tokio::test(flavor = "current_thread")]
async fn unresolvable_conflict_aborts_with_zero_persistent_change() {
    let (_tmp, repo) = init_repo();
    let (sessions, merges) = services(&repo);
    sessions.register(&repo, None, None).unwrap();
    commit_file(&repo, "app.rs", "fn main() {}\n", "base source");

    let session = sessions
        .create("del", "feature/del", Duration::from_secs(30))
        .await
        .unwrap();
    // Worker deletes the file, trunk modifies it: a delete/modify conflict
    // that side-checkout cannot resolve.
    std::fs::remove_file(session.path.join("app.rs")).unwrap();
    git(&session.path, &["add", "."]);
    git(&session.path, &["commit", "-m", "drop app"]);
    commit_file(&repo, "app.rs", "fn main() { trunk(); }\n", "trunk source");

    let adapter = GitAdapter::new();
    let head_before = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(&repo)
        .output()
        .unwrap()
        .stdout;

    let err = merges
        .smart_merge(&session.id, &IntegrateOptions::default())
        .unwrap_err();
    let gleis = err.downcast_ref::<GleisError>().expect("typed merge error");
    match gleis {
        GleisError::MergeConflict { unresolved, .. } => {
            assert_eq!(unresolved, &vec!["app.rs".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    // Trunk HEAD, working tree, worktree and registry are all untouched.
    let head_after = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(&repo)
        .output()
        .unwrap()
        .stdout;
    assert_eq!(head_before, head_after);
    assert!(!adapter.has_uncommitted_changes(&repo).unwrap());
    assert!(session.path.exists());

    let registry = RegistryStore::new(&StateLayout::new(&repo)).load().unwrap();
    let record = registry.get(&session.id).unwrap();
    assert!(record.merged_at.is_none());
    assert!(merges.history().is_empty());
}

#[tokio::test(flavor = "current_thread")]
async fn integrate_merge_commit_keeps_branch_when_asked() {
    let (_tmp, repo) = init_repo();
    let (sessions, merges) = services(&repo);
    sessions.register(&repo, None, None).unwrap();

    let session = sessions
        .create("keep", "feature/keep", Duration::from_secs(30))
        .await
        .unwrap();
    commit_file(&session.path, "keep.rs", "pub fn keep() {}\n", "keep work");

    let opts = IntegrateOptions {
        delete_branch: false,
        delete_worktree: false,
        ..Default::default()
    };
    let outcome = merges.integrate(&session.id, &opts).unwrap();
    assert!(!outcome.branch_deleted);
    assert!(!outcome.worktree_removed);
    assert!(!outcome.record_removed);
    assert!(repo.join("keep.rs").exists());

    let adapter = GitAdapter::new();
    assert!(adapter.branch_exists(&repo, "feature/keep").unwrap());

    let registry = RegistryStore::new(&StateLayout::new(&repo)).load().unwrap();
    assert!(registry.get(&session.id).unwrap().merged_at.is_some());
}
