use clap::Parser;
use gleiswerk::cli::{self, Cli, Command};
use serial_test::serial;
use std::path::Path;
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

#[test]
fn integrate_defaults_to_squash_with_cleanup() {
    let cli = Cli::try_parse_from(["gleiswerk", "integrate", "2"]).unwrap();
    match cli.command {
        Command::Integrate {
            id,
            strategy,
            delete_branch,
            delete_worktree,
            message,
        } => {
            assert_eq!(id, "2");
            assert_eq!(strategy, "squash");
            assert!(delete_branch);
            assert!(delete_worktree);
            assert!(message.is_none());
        }
        _ => panic!("expected integrate"),
    }
}

#[test]
fn cleanup_flags_can_be_disabled_inline() {
    let cli = Cli::try_parse_from([
        "gleiswerk",
        "integrate",
        "2",
        "--strategy",
        "merge",
        "--delete-branch=false",
        "--delete-worktree=false",
    ])
    .unwrap();
    match cli.command {
        Command::Integrate {
            strategy,
            delete_branch,
            delete_worktree,
            ..
        } => {
            assert_eq!(strategy, "merge");
            assert!(!delete_branch);
            assert!(!delete_worktree);
        }
        _ => panic!("expected integrate"),
    }
}

#[test]
fn thread_type_accepts_bare_set_and_inspect_forms() {
    let cli = Cli::try_parse_from(["gleiswerk", "thread-type", "3"]).unwrap();
    assert!(matches!(
        cli.command,
        Command::ThreadType { id: Some(_), command: None }
    ));

    let cli = Cli::try_parse_from(["gleiswerk", "thread-type", "set", "3", "big"]).unwrap();
    assert!(matches!(
        cli.command,
        Command::ThreadType { command: Some(_), .. }
    ));
}

#[tokio::test(flavor = "current_thread")]
#[serial]
async fn register_round_trips_through_the_cli_layer() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().canonicalize().unwrap();
    git(&repo, &["init", "-b", "main"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test"]);
    std::fs::write(repo.join("README.md"), "# project\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "init"]);

    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&repo).unwrap();
    let cli = Cli::try_parse_from(["gleiswerk", "register", "trunk"]).unwrap();
    let result = cli::run(cli).await;
    std::env::set_current_dir(prev).unwrap();

    let value = result.unwrap();
    assert_eq!(value["created"], true);
    assert_eq!(value["session"]["id"], "1");
    assert_eq!(value["session"]["is_main"], true);
    assert_eq!(value["session"]["nickname"], "trunk");
}

#[tokio::test(flavor = "current_thread")]
#[serial]
async fn unknown_session_surfaces_a_typed_error() {
    let tmp = TempDir::new().unwrap();
    let repo = tmp.path().canonicalize().unwrap();
    git(&repo, &["init", "-b", "main"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test"]);
    std::fs::write(repo.join("README.md"), "# project\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "init"]);

    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&repo).unwrap();
    let cli = Cli::try_parse_from(["gleiswerk", "check-merge", "42"]).unwrap();
    let result = cli::run(cli).await;
    std::env::set_current_dir(prev).unwrap();

    let err = result.unwrap_err();
    let gleis = err
        .downcast_ref::<gleiswerk::errors::GleisError>()
        .expect("typed error");
    assert!(matches!(
        gleis,
        gleiswerk::errors::GleisError::SessionNotFound { .. }
    ));
}
