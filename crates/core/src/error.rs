//! Error taxonomy shared by every layer of the engine.

use thiserror::Error;

use crate::codec::CodecError;
use crate::id::Uid;

/// Result type used across the engine.
pub type TetherResult<T> = Result<T, TetherError>;

/// Engine-level error.
///
/// Validation and not-found failures abort a mutation before any opposite-side
/// write. Propagation failures are reported after the primary write has
/// already happened and never roll it back.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TetherError {
    /// Malformed subscribe or mutation input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing record or collection schema.
    #[error("not found: {0}")]
    NotFound(String),

    /// One or more opposite-side updates failed.
    #[error(transparent)]
    Propagation(#[from] PropagationFailure),

    /// Push to a dead connection.
    #[error("transport failure: {0}")]
    Transport(String),

    /// Type mismatch while encoding or decoding a cached field.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Collaborator failure that is none of the above (backend down, lock poisoned).
    #[error("store failure: {0}")]
    Store(String),
}

impl TetherError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Stable name used in outbound error payloads (`error.name`).
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationFailure",
            Self::NotFound(_) => "NotFoundFailure",
            Self::Propagation(_) => "PropagationFailure",
            Self::Transport(_) => "TransportFailure",
            Self::Codec(_) => "CodecFailure",
            Self::Store(_) => "StoreFailure",
        }
    }
}

/// A single opposite-side update that failed after all retry attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropagationStepFailure {
    pub collection: String,
    pub target: Uid,
    pub field: String,
    pub error: String,
}

impl core::fmt::Display for PropagationStepFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}:{}.{}: {}",
            self.collection, self.target, self.field, self.error
        )
    }
}

/// Aggregate failure of a propagation run.
///
/// Sibling updates that completed are not rolled back; `succeeded` counts them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("propagation failed for {} of {} opposite-side updates", .failures.len(), .failures.len() + .succeeded)]
pub struct PropagationFailure {
    pub failures: Vec<PropagationStepFailure>,
    pub succeeded: usize,
}

impl PropagationFailure {
    pub fn new(failures: Vec<PropagationStepFailure>, succeeded: usize) -> Self {
        Self {
            failures,
            succeeded,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.succeeded > 0
    }
}
