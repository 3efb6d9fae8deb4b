//! Error types for evalboard core
//!
//! Provides error handling for:
//! - Missing runs and datasets
//! - Illegal status transitions
//! - Store (persistence) failures
//! - Response generation failures

use crate::types::{DatasetId, RunId, RunStatus};

/// Main evalboard error type
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// Run does not exist
    #[error("run not found: {0}")]
    RunNotFound(RunId),

    /// Dataset does not exist
    #[error("dataset not found: {0}")]
    DatasetNotFound(DatasetId),

    /// Dataset has nothing to run
    #[error("dataset {0} has no items")]
    EmptyDataset(DatasetId),

    /// Status change not allowed by the lifecycle
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: RunStatus,
        /// Requested status
        to: RunStatus,
    },

    /// Persistence failure
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Response generation failure
    #[error("generation failed: {0}")]
    Generation(#[from] GenerationError),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Worker task panicked or was aborted
    #[error("worker join error: {0}")]
    Join(String),
}

impl EvalError {
    /// Check if error denotes a missing entity
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RunNotFound(_)
                | Self::DatasetNotFound(_)
                | Self::Store(StoreError::NotFound { .. })
        )
    }

    /// Check if error is retryable
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Generation(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Lift a store error, naming the run when the run itself is missing
    #[must_use]
    pub fn for_run(run_id: RunId, error: StoreError) -> Self {
        match error {
            StoreError::NotFound { entity: "run", .. } => Self::RunNotFound(run_id),
            StoreError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            other => Self::Store(other),
        }
    }
}

/// Persistence errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Entity not found
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind ("run", "result", "dataset")
        entity: &'static str,
        /// Requested id
        id: String,
    },

    /// Status write rejected by the lifecycle table
    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status
        from: RunStatus,
        /// Requested status
        to: RunStatus,
    },

    /// Write conflicts with current state (duplicate id, run not running)
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend failure (I/O, SQL, lock)
    #[error("backend error: {0}")]
    Backend(String),

    /// Stored data could not be decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Run not found
    #[inline]
    pub fn run_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "run",
            id: id.to_string(),
        }
    }

    /// Result not found
    #[inline]
    pub fn result_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "result",
            id: id.to_string(),
        }
    }

    /// Dataset not found
    #[inline]
    pub fn dataset_not_found(id: impl ToString) -> Self {
        Self::NotFound {
            entity: "dataset",
            id: id.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}

/// Response generation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Provider rejected or failed the request
    #[error("provider error: {0}")]
    Provider(String),

    /// Non-success HTTP status
    #[error("http {status}: {body}")]
    Http {
        /// Status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// Network-level failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Call exceeded the per-item timeout
    #[error("timed out after {timeout_ms}ms")]
    Timeout {
        /// Configured timeout
        timeout_ms: u64,
    },

    /// No generator configured for the provider id
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// Response could not be interpreted
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl GenerationError {
    /// Check if a retry may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } => true,
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Provider(_) | Self::UnknownProvider(_) | Self::InvalidResponse(_) => false,
        }
    }
}
