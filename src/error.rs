use std::path::PathBuf;

use thiserror::Error;

use crate::cleanup::CleanupReport;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Unreadable source {}: {reason}", path.display())]
    UnreadableSource { path: PathBuf, reason: String },

    #[error("Failed to materialize overlay for {}: {reason}", path.display())]
    MaterializationFailed { path: PathBuf, reason: String },

    #[error("Isolation runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    #[error("Failed to launch sandboxed command: {0}")]
    LaunchFailed(String),

    #[error("Cleanup incomplete: {0}")]
    CleanupIncomplete(CleanupReport),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("{error} (cleanup incomplete: {residue})")]
    WithResidue {
        error: Box<SandboxError>,
        residue: CleanupReport,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

impl SandboxError {
    pub fn unreadable(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::UnreadableSource {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn materialization(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::MaterializationFailed {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Attach teardown residue to a fatal error without replacing it.
    pub fn with_residue(self, residue: Option<CleanupReport>) -> Self {
        match residue {
            Some(residue) if !residue.is_empty() => Self::WithResidue {
                error: Box::new(self),
                residue,
            },
            _ => self,
        }
    }

    /// The first fatal condition, looking through any attached residue.
    pub fn root(&self) -> &SandboxError {
        match self {
            Self::WithResidue { error, .. } => error.root(),
            other => other,
        }
    }

    pub fn residue(&self) -> Option<&CleanupReport> {
        match self {
            Self::WithResidue { residue, .. } => Some(residue),
            Self::CleanupIncomplete(report) => Some(report),
            _ => None,
        }
    }
}

pub type SandboxResult<T> = Result<T, SandboxError>;
