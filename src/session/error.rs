//! Coordinator errors

use crate::ledger::LedgerError;
use crate::types::{OwnerId, ResourceId};

/// Reasons a generate request is rejected before a stream is handed out
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("insufficient credits: {owner} needs {required}")]
    InsufficientCredits { owner: OwnerId, required: u64 },

    #[error("previous generation for {resource} is still shutting down after {waited_ms} ms, retry shortly")]
    ShutdownTimeout { resource: ResourceId, waited_ms: u64 },

    #[error("generation engine failed to start: {0}")]
    EngineStartFailure(String),

    #[error("generation for {resource} was stopped before the engine started")]
    StartCancelled { resource: ResourceId },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl CoordinatorError {
    /// HTTP status the endpoint surfaces for this error
    pub fn status_code(&self) -> u16 {
        match self {
            CoordinatorError::InsufficientCredits { .. } => 402,
            CoordinatorError::ShutdownTimeout { .. } => 429,
            CoordinatorError::StartCancelled { .. } => 409,
            CoordinatorError::EngineStartFailure(_)
            | CoordinatorError::Internal(_)
            | CoordinatorError::Ledger(_) => 500,
        }
    }

    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorError::InsufficientCredits { .. } => "insufficient_credits",
            CoordinatorError::ShutdownTimeout { .. } => "shutdown_timeout",
            CoordinatorError::EngineStartFailure(_) => "engine_start_failure",
            CoordinatorError::StartCancelled { .. } => "start_cancelled",
            CoordinatorError::Internal(_) => "internal",
            CoordinatorError::Ledger(_) => "ledger_unavailable",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::ShutdownTimeout { .. })
    }
}
