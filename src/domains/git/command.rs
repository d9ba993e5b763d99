use anyhow::Result;
use log::debug;
use std::path::Path;
use std::process::Command;

use crate::errors::GleisError;

/// Captured result of one git invocation. A nonzero exit is data here, not
/// an error; callers decide whether it is meaningful (e.g. "branch does not
/// exist") or must surface as a tagged failure.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn stdout_trimmed(&self) -> String {
        self.stdout.trim().to_string()
    }
}

/// Runs git with the given arguments in `cwd`. Only a spawn failure (git
/// missing, cwd gone) is an `Err`; the subprocess exit status is reported in
/// the returned output.
pub fn run_git(cwd: &Path, args: &[&str]) -> Result<GitOutput> {
    debug!("git {} (in {})", args.join(" "), cwd.display());
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(|e| GleisError::git(&format!("git {}", args.join(" ")), e))?;

    Ok(GitOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Runs git and returns trimmed stdout, turning a nonzero exit into a tagged
/// error carrying the raw stderr for diagnosis.
pub fn git_stdout(cwd: &Path, args: &[&str], operation: &str) -> Result<String> {
    let out = run_git(cwd, args)?;
    if !out.success {
        return Err(GleisError::git(operation, out.stderr.trim()).into());
    }
    Ok(out.stdout_trimmed())
}

/// Runs git where the exit status itself is the answer.
pub fn git_succeeds(cwd: &Path, args: &[&str]) -> Result<bool> {
    Ok(run_git(cwd, args)?.success)
}
