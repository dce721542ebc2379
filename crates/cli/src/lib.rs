//! Driver for the sieve optimizer: configuration, the end-to-end pipeline, reports and graph
//! rendering. The `sieve` binary is a thin wrapper around [`commands::optimize`].

pub mod commands;
pub mod config;
pub mod pipeline;
pub mod render;
pub mod report;
pub mod result;

pub use config::OptimizerConfig;
pub use pipeline::{Optimization, OptimizationResult, SkipReason, optimize, optimize_cfg};
pub use result::{Error, Result};
