//! Analysis results and error types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why an input cannot be optimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    PathSearchTimeout,
    PathExplosion,
    CyclicCallChain,
    ComputedJump,
    FunctionSpanMismatch,
    IncompleteJumpCoverage,
}

impl AbortReason {
    /// User-facing reason string.
    pub fn message(self) -> &'static str {
        match self {
            AbortReason::PathSearchTimeout => "path search timeout",
            AbortReason::PathExplosion => "path explosion (max-paths exceeded)",
            AbortReason::CyclicCallChain => "cyclic function-call chain detected",
            AbortReason::ComputedJump => "computed jump-destination rejects optimization",
            AbortReason::FunctionSpanMismatch => "function span mismatch",
            AbortReason::IncompleteJumpCoverage => "incomplete jump-edge coverage",
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Main error type for control-flow analysis.
#[derive(Debug, Error)]
pub enum Error {
    /// An internal consistency check failed.
    #[error("structural impossibility: {0}")]
    Structural(String),

    /// The input is well formed but cannot be optimized.
    #[error("{reason}: {detail}")]
    Abort { reason: AbortReason, detail: String },

    #[error(transparent)]
    Core(#[from] sieve_core::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn abort(reason: AbortReason, detail: impl Into<String>) -> Self {
        Error::Abort {
            reason,
            detail: detail.into(),
        }
    }

    /// The abort reason, if this is an optimization abort.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Error::Abort { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

/// Result type for analysis operations
pub type Result<T> = std::result::Result<T, Error>;
