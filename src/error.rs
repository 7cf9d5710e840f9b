//! Error taxonomy for archstage
//!
//! Phase-internal failures are carried as `anyhow::Error` with context; the
//! orchestrator wraps them into [`PhaseError`] according to the lifecycle
//! stage that failed, and into [`OrchestratorError`] for the caller.

use thiserror::Error;

use crate::phase::PhaseStatus;

/// Failure of one lifecycle stage of a phase.
///
/// Every variant keeps the underlying cause as `source` so callers can walk
/// the chain; the `Display` text carries the stage prefix plus the cause.
#[derive(Error, Debug)]
pub enum PhaseError {
    /// Pre-check rejected the phase. No rollback was attempted.
    #[error("pre-check failed: {0:#}")]
    PreCheck(#[source] anyhow::Error),

    /// Execute failed and rollback succeeded.
    #[error("execution failed: {0:#}")]
    Execution(#[source] anyhow::Error),

    /// Execute failed and rollback failed too. Both messages are kept.
    #[error("execution failed: {cause:#}, rollback failed: {rollback:#}")]
    Rollback {
        #[source]
        cause: anyhow::Error,
        rollback: anyhow::Error,
    },

    /// Post-check rejected the phase's effects. No rollback was attempted.
    #[error("post-check failed: {0:#}")]
    PostCheck(#[source] anyhow::Error),
}

impl PhaseError {
    /// Whether rollback ran for this failure
    pub fn rolled_back(&self) -> bool {
        matches!(self, Self::Execution(_) | Self::Rollback { .. })
    }
}

/// Errors returned by the orchestrator API
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Phase has no usable identity (blank name)
    #[error("invalid phase: name must not be empty")]
    InvalidPhase,

    #[error("phase '{0}' is already registered")]
    DuplicatePhase(String),

    #[error("phase '{0}' is not registered")]
    UnknownPhase(String),

    #[error("no pending phases")]
    NoPendingPhases,

    #[error("phase '{0}' cannot be skipped")]
    CannotSkip(String),

    /// Only a pending phase can be skipped
    #[error("phase '{phase}' is {status}, not pending")]
    NotPending { phase: String, status: PhaseStatus },

    /// A phase failed in one of its lifecycle stages
    #[error("phase '{phase}' {source}")]
    Phase {
        phase: String,
        #[source]
        source: PhaseError,
    },
}

impl OrchestratorError {
    /// Name of the failing phase, if this error came from a phase run
    pub fn phase_name(&self) -> Option<&str> {
        match self {
            Self::Phase { phase, .. } => Some(phase),
            _ => None,
        }
    }
}

/// Returned when a batched operation and every per-item fallback failed.
#[derive(Error, Debug)]
#[error("all {} items failed: {}", .failed.len(), summarize(.failed))]
pub struct BatchError {
    /// Each item with the reason its individual attempt failed
    pub failed: Vec<(String, String)>,
}

fn summarize(failed: &[(String, String)]) -> String {
    failed
        .iter()
        .map(|(item, reason)| format!("{} ({})", item, reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Main error type for crate-level operations (config, state, CLI)
#[derive(Error, Debug)]
pub enum InstallError {
    /// IO errors (file operations, log files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors (loading, parsing)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (user supplied values)
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

/// Result type alias for crate-level operations
pub type Result<T> = std::result::Result<T, InstallError>;

impl InstallError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
