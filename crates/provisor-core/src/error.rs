//! Error types for Provisor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("Strategy '{strategy}' timed out after {}s", .after.as_secs())]
    StrategyTimedOut { strategy: String, after: Duration },

    #[error("Content unresolved: all {attempts} source(s) exhausted")]
    ContentUnresolved { attempts: usize },

    #[error("Structural warning: {0}")]
    StructuralWarning(String),

    #[error("Permission apply failed: {0}")]
    PermissionApplyFailed(String),

    #[error("All strategies exhausted for {action} ({attempts} attempted)")]
    StrategiesExhausted { action: String, attempts: usize },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Content hash {actual} does not match pinned {expected}")]
    PinMismatch { expected: String, actual: String },

    #[error("Invalid desired state: {0}")]
    InvalidSpec(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Serializable classification of an [`Error`], used in action results and run logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    EnvironmentUnavailable,
    StrategyTimedOut,
    ContentUnresolved,
    StructuralWarning,
    PermissionApplyFailed,
    StrategiesExhausted,
    Transfer,
    ArtifactNotFound,
    Network,
    PinMismatch,
    InvalidSpec,
    Cancelled,
    Io,
    Json,
    Archive,
    Internal,
}

/// How a failure affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Aborts the run.
    Fatal,
    /// Consumed by the strategy fallback; the next strategy is tried.
    Recoverable,
    /// Logged and reported, never aborts.
    Warning,
}

impl ErrorKind {
    pub fn severity(self) -> Severity {
        match self {
            Self::StrategyTimedOut
            | Self::ArtifactNotFound
            | Self::Network
            | Self::PinMismatch => Severity::Recoverable,
            Self::StructuralWarning => Severity::Warning,
            _ => Severity::Fatal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::EnvironmentUnavailable => "EnvironmentUnavailable",
            Self::StrategyTimedOut => "StrategyTimedOut",
            Self::ContentUnresolved => "ContentUnresolved",
            Self::StructuralWarning => "StructuralWarning",
            Self::PermissionApplyFailed => "PermissionApplyFailed",
            Self::StrategiesExhausted => "StrategiesExhausted",
            Self::Transfer => "Transfer",
            Self::ArtifactNotFound => "ArtifactNotFound",
            Self::Network => "Network",
            Self::PinMismatch => "PinMismatch",
            Self::InvalidSpec => "InvalidSpec",
            Self::Cancelled => "Cancelled",
            Self::Io => "Io",
            Self::Json => "Json",
            Self::Archive => "Archive",
            Self::Internal => "Internal",
        };
        f.write_str(name)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EnvironmentUnavailable(_) => ErrorKind::EnvironmentUnavailable,
            Self::StrategyTimedOut { .. } => ErrorKind::StrategyTimedOut,
            Self::ContentUnresolved { .. } => ErrorKind::ContentUnresolved,
            Self::StructuralWarning(_) => ErrorKind::StructuralWarning,
            Self::PermissionApplyFailed(_) => ErrorKind::PermissionApplyFailed,
            Self::StrategiesExhausted { .. } => ErrorKind::StrategiesExhausted,
            Self::Transfer(_) => ErrorKind::Transfer,
            Self::ArtifactNotFound(_) => ErrorKind::ArtifactNotFound,
            Self::Network(_) => ErrorKind::Network,
            Self::PinMismatch { .. } => ErrorKind::PinMismatch,
            Self::InvalidSpec(_) => ErrorKind::InvalidSpec,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
            Self::Archive(_) => ErrorKind::Archive,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn severity(&self) -> Severity {
        self.kind().severity()
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}
