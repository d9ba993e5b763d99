use serde::Serialize;
use std::fmt;

#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", content = "data")]
pub enum GleisError {
    SessionNotFound {
        session_id: String,
    },
    MainSessionProtected {
        session_id: String,
    },
    GitOperationFailed {
        operation: String,
        message: String,
    },
    WorktreeTimeout {
        path: String,
        timeout_ms: u64,
    },
    InvalidInput {
        field: String,
        message: String,
    },
    IoError {
        operation: String,
        path: String,
        message: String,
    },
    MergeConflict {
        resolved: Vec<String>,
        unresolved: Vec<String>,
        message: String,
    },
    RegistryError {
        message: String,
    },
}

impl GleisError {
    pub fn git(operation: &str, error: impl ToString) -> Self {
        GleisError::GitOperationFailed {
            operation: operation.to_string(),
            message: error.to_string(),
        }
    }

    pub fn io(operation: &str, path: impl ToString, error: impl ToString) -> Self {
        GleisError::IoError {
            operation: operation.to_string(),
            path: path.to_string(),
            message: error.to_string(),
        }
    }

    pub fn invalid_input(field: &str, message: impl ToString) -> Self {
        GleisError::InvalidInput {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn registry(message: impl ToString) -> Self {
        GleisError::RegistryError {
            message: message.to_string(),
        }
    }
}

impl fmt::Display for GleisError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SessionNotFound { session_id } => {
                write!(f, "Session '{session_id}' not found")
            }
            Self::MainSessionProtected { session_id } => {
                write!(f, "Cannot delete main session '{session_id}'")
            }
            Self::GitOperationFailed { operation, message } => {
                write!(f, "Git operation '{operation}' failed: {message}")
            }
            Self::WorktreeTimeout { path, timeout_ms } => {
                write!(
                    f,
                    "Worktree creation at '{path}' exceeded {timeout_ms}ms; retry with a longer timeout"
                )
            }
            Self::InvalidInput { field, message } => {
                write!(f, "Invalid input for field '{field}': {message}")
            }
            Self::IoError {
                operation,
                path,
                message,
            } => {
                write!(f, "I/O error during '{operation}' on '{path}': {message}")
            }
            Self::MergeConflict {
                resolved,
                unresolved,
                message,
            } => {
                write!(
                    f,
                    "Merge conflict ({} resolved, {} unresolved): {message}",
                    resolved.len(),
                    unresolved.len()
                )
            }
            Self::RegistryError { message } => {
                write!(f, "Registry error: {message}")
            }
        }
    }
}

impl std::error::Error for GleisError {}

impl From<GleisError> for String {
    fn from(error: GleisError) -> Self {
        error.to_string()
    }
}
