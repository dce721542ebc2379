//! Driver errors

use thiserror::Error;

/// Failures that stop the driver outright. Inputs that merely cannot be optimized are reported
/// through [`crate::pipeline::OptimizationResult::Skipped`] instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] sieve_core::Error),

    #[error(transparent)]
    Analysis(#[from] sieve_analysis::Error),

    #[error("file error: {0}")]
    File(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The pipeline thread could not be started or did not finish.
    #[error("pipeline thread: {0}")]
    Thread(String),
}

pub type Result<T> = std::result::Result<T, Error>;
