use std::path::PathBuf;
use std::process::ExitCode;

use crate::dag::ProjectStatus;
use crate::transition::DispatchStatus;

/// Errors surfaced by store and engine operations.
///
/// `Conflict`, `NotFound`, and `InvalidTransition` are distinguishable so
/// callers can decide whether to re-read and retry (health monitor), render
/// a precise message (operator commands), or abandon.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("conflict on {id}: expected status {expected}, found {actual}")]
    Conflict {
        id: String,
        expected: DispatchStatus,
        actual: DispatchStatus,
    },

    #[error("dispatch not found: {id}")]
    NotFound { id: String },

    #[error("cannot {operation} {id}: status is {status}")]
    InvalidTransition {
        id: String,
        status: DispatchStatus,
        operation: String,
    },

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("project {id} already has a batch in flight (status {status})")]
    ProjectActive { id: String, status: ProjectStatus },

    #[error("unreadable store at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DispatchError {
    /// Whether this is an expected CAS race rather than a fault.
    ///
    /// The health monitor logs these at debug and moves on; anything else
    /// in a sweep is a warning.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            Self::NotFound { .. } | Self::ProjectNotFound(_) => ExitCode::from(2),
            Self::InvalidTransition { .. } | Self::ProjectActive { .. } => ExitCode::from(3),
            Self::Conflict { .. } => ExitCode::from(4),
            Self::Corrupt { .. } | Self::Io(_) => ExitCode::from(5),
        }
    }
}
