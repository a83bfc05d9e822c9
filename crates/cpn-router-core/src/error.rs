//! Error types for the policy module

use std::path::PathBuf;
use thiserror::Error;

/// Policy error types
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A signal table could not be read
    #[error("Failed to read signal table {path}: {source}")]
    SignalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A signal table is not a name -> number JSON object
    #[error("Malformed signal table: {0}")]
    SignalParse(#[from] serde_json::Error),

    /// Signal values cannot form a distribution
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// Matrix or vector dimensions disagree
    #[error("Shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Policy has no ingress rows or no instance columns
    #[error("Empty pool: {0}")]
    EmptyPool(String),

    /// Matrix has negative or non-finite entries
    #[error("Invalid matrix: {0}")]
    InvalidMatrix(String),
}

pub type PolicyResult<T> = Result<T, PolicyError>;
