//! Control-flow recovery for EVM runtime code.
//!
//! The passes run in order on a disassembled [`Cfg`]: [`repair`] restores jump edges the
//! disassembler could not resolve, [`identify_functions`] recovers internal functions from
//! matched call/return jumps, [`analyze_loops`] collapses cycles, and [`generate_paths`]
//! enumerates every path to an `INVALID` block.

pub mod functions;
pub mod jump_edge;
pub mod paths;
pub mod program;
pub mod repair;
pub mod result;
pub mod scc;

#[cfg(test)]
mod test_support;

pub use functions::identify_functions;
pub use jump_edge::{CallPair, EdgeRole, JumpEdge};
pub use paths::{Path, PathConfig, PathSet, generate_paths};
pub use program::{CallSite, Function, Program, ProgramSnapshot, TOP_LEVEL};
pub use repair::{RepairReport, repair};
pub use result::{AbortReason, Error, Result};
pub use scc::{FunctionGraph, LoopInfo, analyze_loops, compress};

use sieve_core::cfg_ir::Cfg;
use std::time::Duration;

/// Limits for the analysis passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisConfig {
    pub path_search_timeout: Duration,
    pub max_paths: usize,
    /// Block visits the repair walk may spend.
    pub repair_visit_budget: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        let paths = PathConfig::default();
        Self {
            path_search_timeout: paths.timeout,
            max_paths: paths.max_paths,
            repair_visit_budget: 200_000,
        }
    }
}

/// Output of [`analyze`].
#[derive(Debug, Clone)]
pub struct Analysis {
    pub program: Program,
    pub repair: RepairReport,
    pub loops: LoopInfo,
    pub paths: PathSet,
}

/// Runs repair, function identification, loop analysis and path generation.
pub fn analyze(mut cfg: Cfg, config: &AnalysisConfig) -> Result<Analysis> {
    let repair = repair::repair(&mut cfg, config.repair_visit_budget)?;
    let mut program = identify_functions(cfg)?;
    let loops = analyze_loops(&mut program);
    let paths = generate_paths(
        &program,
        &loops,
        PathConfig {
            timeout: config.path_search_timeout,
            max_paths: config.max_paths,
        },
    )?;
    Ok(Analysis {
        program,
        repair,
        loops,
        paths,
    })
}
