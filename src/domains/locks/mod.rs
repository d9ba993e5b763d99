use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::shared::StateLayout;

/// Ephemeral liveness claim for one session: the owning process id and when
/// it started. A session is active while a lock exists and its PID is alive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionLock {
    pub pid: i32,
    pub started: DateTime<Utc>,
}

#[derive(Clone)]
pub struct LockManager {
    locks_dir: PathBuf,
}

impl LockManager {
    pub fn new(layout: &StateLayout) -> Self {
        Self {
            locks_dir: layout.locks_dir(),
        }
    }

    pub fn write_lock(&self, session_id: &str, pid: i32) -> Result<()> {
        fs::create_dir_all(&self.locks_dir).with_context(|| {
            format!("Failed to create locks dir {}", self.locks_dir.display())
        })?;
        let lock = SessionLock {
            pid,
            started: Utc::now(),
        };
        let path = self.lock_path(session_id);
        let body = serde_json::to_string_pretty(&lock)?;
        fs::write(&path, body)
            .with_context(|| format!("Failed to write lock file {}", path.display()))?;
        Ok(())
    }

    /// A missing or corrupt lock file reads as absent, never as an error.
    pub fn read_lock(&self, session_id: &str) -> Option<SessionLock> {
        let path = self.lock_path(session_id);
        let body = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&body) {
            Ok(lock) => Some(lock),
            Err(e) => {
                debug!("Ignoring corrupt lock file {}: {e}", path.display());
                None
            }
        }
    }

    pub fn remove_lock(&self, session_id: &str) {
        let path = self.lock_path(session_id);
        if path.exists()
            && let Err(e) = fs::remove_file(&path)
        {
            warn!("Failed to remove lock file {}: {e}", path.display());
        }
    }

    pub fn is_session_active(&self, session_id: &str) -> bool {
        self.read_lock(session_id)
            .map(|lock| is_alive(lock.pid))
            .unwrap_or(false)
    }

    fn lock_path(&self, session_id: &str) -> PathBuf {
        self.locks_dir.join(format!("{session_id}.json"))
    }
}

/// Zero-effect probe of the OS process table. Permission denied means the
/// process exists but belongs to someone else, so it counts as alive.
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> LockManager {
        LockManager::new(&StateLayout::new(tmp.path()))
    }

    #[test]
    fn own_pid_counts_as_alive() {
        assert!(is_alive(std::process::id() as i32));
    }

    #[test]
    fn nonexistent_pid_is_dead() {
        // PID_MAX on Linux defaults to 4194304; anything above it never exists.
        assert!(!is_alive(i32::MAX - 1));
        assert!(!is_alive(0));
        assert!(!is_alive(-4));
    }

    #[test]
    fn lock_round_trip() {
        let tmp = TempDir::new().unwrap();
        let locks = manager(&tmp);
        locks.write_lock("1", 4242).unwrap();
        let lock = locks.read_lock("1").expect("lock should exist");
        assert_eq!(lock.pid, 4242);
        locks.remove_lock("1");
        assert!(locks.read_lock("1").is_none());
    }

    #[test]
    fn corrupt_lock_reads_as_absent() {
        let tmp = TempDir::new().unwrap();
        let locks = manager(&tmp);
        locks.write_lock("2", 1).unwrap();
        let path = tmp.path().join(".gleiswerk/locks/2.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(locks.read_lock("2").is_none());
        assert!(!locks.is_session_active("2"));
    }

    #[test]
    fn session_with_live_pid_is_active() {
        let tmp = TempDir::new().unwrap();
        let locks = manager(&tmp);
        locks.write_lock("3", std::process::id() as i32).unwrap();
        assert!(locks.is_session_active("3"));
        locks.write_lock("4", i32::MAX - 1).unwrap();
        assert!(!locks.is_session_active("4"));
    }

    #[test]
    fn missing_lock_is_inactive_not_error() {
        let tmp = TempDir::new().unwrap();
        let locks = manager(&tmp);
        assert!(!locks.is_session_active("does-not-exist"));
        locks.remove_lock("does-not-exist");
    }
}
