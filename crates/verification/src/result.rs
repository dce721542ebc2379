//! Verification results and error types

use thiserror::Error;

/// Main error type for symbolic execution and reachability checks
#[derive(Error, Debug)]
pub enum Error {
    #[error("symbolic stack underflow at pc 0x{pc:x} ({op})")]
    StackUnderflow { pc: usize, op: String },
    #[error("unsupported symbolic state: {0}")]
    Unsupported(String),
    #[error("SMT solver error: {0}")]
    SmtSolver(String),
    #[error(transparent)]
    Core(#[from] sieve_core::Error),
}

/// Result type for verification operations
pub type Result<T> = std::result::Result<T, Error>;
