//! Error types for the controller node

use cpn_core::ConfigError;
use cpn_router::AnycastError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Anycast setup failed: {0}")]
    Anycast(#[from] AnycastError),

    #[error("Bridge I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bridge codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// Utilization probe command failed
    #[error("Probe failed: {0}")]
    Probe(String),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
