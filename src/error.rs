//! Error types for the swarm-pgo library.
//!
//! All errors use the `thiserror` crate for automatic trait implementations.
//! The g2o loader has its own error enum (`crate::io::GraphIoError`) which
//! converts into [`PgoError`] at the crate boundary.

use thiserror::Error;

/// Main result type used throughout the swarm-pgo library.
pub type PgoResult<T> = Result<T, PgoError>;

/// Main error type for the swarm-pgo library.
#[derive(Debug, Error)]
pub enum PgoError {
    /// Invalid input parameters (programmer error on the public API).
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// An operation was attempted in the wrong agent state.
    #[error("Invalid agent state: {0}")]
    InvalidState(String),

    /// Matrix or vector dimensions do not match what the operation requires.
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    /// The lifting matrix is required but has not been provided.
    #[error("Lifting matrix has not been set")]
    LiftingMatrixUnset,

    /// Construction of the quadratic data matrices failed.
    #[error("Data matrix construction failed: {0}")]
    DataMatrix(String),

    /// A sparse factorization or solve failed.
    #[error("Sparse linear solve failed: {0}")]
    LinearSolve(String),

    /// The background optimization executor could not be started or stopped.
    #[error("Optimization executor error: {0}")]
    Executor(String),

    /// Graph file loading errors.
    #[error("Graph IO error: {0}")]
    Io(#[from] crate::io::GraphIoError),
}

impl PgoError {
    pub(crate) fn dims(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        PgoError::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}
