use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Kind of work a session carries. `Base` is reserved for the main session;
/// worktree-backed sessions default to `Parallel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadType {
    Base,
    Parallel,
    Chained,
    Fusion,
    Big,
    Long,
}

impl ThreadType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "base" => Some(Self::Base),
            "parallel" => Some(Self::Parallel),
            "chained" => Some(Self::Chained),
            "fusion" => Some(Self::Fusion),
            "big" => Some(Self::Big),
            "long" => Some(Self::Long),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Parallel => "parallel",
            Self::Chained => "chained",
            Self::Fusion => "fusion",
            Self::Big => "big",
            Self::Long => "long",
        }
    }
}

/// One worker's registry record. Ids come from the registry-wide counter and
/// are never reused; `path` is unique across records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub path: PathBuf,
    pub branch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story: Option<String>,
    pub thread_type: ThreadType,
    pub is_main: bool,
    pub created: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_at: Option<DateTime<Utc>>,
}

/// The full registry document as persisted in `registry.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Registry {
    pub next_id: u64,
    pub project_name: String,
    pub sessions: BTreeMap<String, Session>,
}

impl Registry {
    pub fn empty(project_name: impl Into<String>) -> Self {
        Self {
            next_id: 1,
            project_name: project_name.into(),
            sessions: BTreeMap::new(),
        }
    }

    /// Allocates the next session id. Ids are monotonic and never reassigned.
    pub fn allocate_id(&mut self) -> String {
        let id = self.next_id.to_string();
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(id)
    }

    pub fn find_by_path(&self, path: &Path) -> Option<&Session> {
        self.sessions.values().find(|s| s.path == path)
    }

    pub fn find_by_path_mut(&mut self, path: &Path) -> Option<&mut Session> {
        self.sessions.values_mut().find(|s| s.path == path)
    }

    pub fn main_session(&self) -> Option<&Session> {
        self.sessions.values().find(|s| s.is_main)
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn remove(&mut self, id: &str) -> Option<Session> {
        self.sessions.remove(id)
    }
}
