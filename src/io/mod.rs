//! Graph file loading.

use thiserror::Error;

pub mod g2o;

pub use g2o::load_g2o;

/// Errors that can occur while loading a pose graph file.
#[derive(Error, Debug)]
pub enum GraphIoError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid number at line {line}: {value}")]
    InvalidNumber { line: usize, value: String },

    #[error("Missing required fields at line {line}")]
    MissingFields { line: usize },

    #[error("Unsupported token at line {line}: {token}")]
    UnsupportedToken { line: usize, token: String },

    #[error("Pose ids must form a consecutive range: gap between {prev} and {next}")]
    NonConsecutiveIds { prev: usize, next: usize },

    #[error("File contains no measurements")]
    Empty,
}
