//! Per-path feasibility of `INVALID` blocks.
//!
//! Every recorded path is replayed through a fresh [`SymbolicExecutor`] with its own z3
//! context. Branch conditions along the path become constraints; an unsatisfiable conjunction
//! means the path can never execute. An `INVALID` is optimizable only when every path to it,
//! in every call context, is infeasible.

use crate::symbolic::SymbolicExecutor;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sieve_analysis::{Analysis, Path, Program};
use sieve_core::cfg_ir::JumpType;
use std::collections::BTreeMap;
use std::rc::Rc;
use z3::ast::Bool;
use z3::{Config, Context, SatResult, Solver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachabilityConfig {
    /// Per-path solver budget. An `unknown` answer counts as reachable.
    pub solver_timeout_ms: u64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            solver_timeout_ms: 10_000,
        }
    }
}

/// Verdict for a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PathOutcome {
    /// The branch constraints are unsatisfiable.
    Unreachable,
    /// A branch on the path has a constant condition that points the other way.
    Artifact,
    Reachable,
    /// The solver gave up.
    Unknown,
    /// Symbolic execution failed; treated as reachable.
    Error,
}

impl PathOutcome {
    pub fn is_infeasible(self) -> bool {
        matches!(self, PathOutcome::Unreachable | PathOutcome::Artifact)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InvalidStatus {
    /// Every path is infeasible; the block can be removed.
    Optimizable,
    Reachable,
    /// Some path crosses a loop or a function called from one.
    LoopRelated,
    /// Some path crosses a recursive function.
    Recursive,
    /// The search never reached the block.
    NoPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidVerdict {
    pub offset: usize,
    pub status: InvalidStatus,
    /// Paths recorded for the block.
    pub paths: usize,
    /// Distinct call contexts among those paths.
    pub contexts: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReachabilityReport {
    pub verdicts: Vec<InvalidVerdict>,
    /// Outcome of every path that reached the solver stage, by path id.
    pub path_outcomes: BTreeMap<usize, PathOutcome>,
}

impl ReachabilityReport {
    /// Offsets of the `INVALID` blocks that can be removed.
    pub fn optimizable(&self) -> impl Iterator<Item = usize> + '_ {
        self.verdicts
            .iter()
            .filter(|v| v.status == InvalidStatus::Optimizable)
            .map(|v| v.offset)
    }
}

/// Replays `path` symbolically and decides whether it can execute.
pub fn check_path(
    program: &Program,
    path: &Path,
    code: Rc<[u8]>,
    timeout_ms: u64,
) -> Result<PathOutcome> {
    let mut cfg = Config::new();
    cfg.set_timeout_msec(timeout_ms);
    let ctx = Context::new(&cfg);
    let mut exec = SymbolicExecutor::new(&ctx, code);
    let mut constraints: Vec<Bool<'_>> = Vec::new();

    let Some((_, prefix)) = path.nodes.split_last() else {
        return Ok(PathOutcome::Unreachable);
    };
    for (idx, &node) in prefix.iter().enumerate() {
        let block = program.cfg.block(node).ok_or_else(|| {
            Error::Unsupported(format!("path {} names unknown block 0x{node:x}", path.id))
        })?;
        exec.execute_block(block)?;
        if block.jump_type != JumpType::Conditional {
            continue;
        }

        let next = path.nodes[idx + 1];
        let fallthrough = block.fallthrough();
        let target = block.jumpi_dest.and_then(|t| t.true_target);
        if target == Some(fallthrough) {
            continue;
        }
        let taken = next != fallthrough;
        let Some(cond) = exec.jump_cond().cloned() else {
            return Err(Error::Unsupported(format!(
                "conditional block 0x{node:x} left no jump condition"
            )));
        };
        match cond.simplify().as_bool() {
            Some(value) if value == taken => {}
            Some(_) => {
                tracing::debug!(
                    path = path.id,
                    block = format_args!("0x{node:x}"),
                    "constant branch disagrees with the path"
                );
                return Ok(PathOutcome::Artifact);
            }
            None if taken => constraints.push(cond),
            None => constraints.push(cond.not()),
        }
    }

    let solver = Solver::new(&ctx);
    for constraint in &constraints {
        solver.assert(constraint);
    }
    let outcome = match solver.check() {
        SatResult::Unsat => PathOutcome::Unreachable,
        SatResult::Sat => PathOutcome::Reachable,
        SatResult::Unknown => {
            tracing::warn!(
                path = path.id,
                constraints = constraints.len(),
                reason = solver.get_reason_unknown().unwrap_or_default(),
                "solver returned unknown, keeping path"
            );
            PathOutcome::Unknown
        }
    };
    tracing::trace!(path = path.id, constraints = constraints.len(), ?outcome, "path checked");
    Ok(outcome)
}

/// Classifies every `INVALID` block of the analysed program.
pub fn analyze_reachability(
    analysis: &Analysis,
    config: ReachabilityConfig,
) -> ReachabilityReport {
    let program = &analysis.program;
    let paths = &analysis.paths;
    let code: Rc<[u8]> = program.cfg.runtime_bytes().into();
    let mut report = ReachabilityReport::default();

    for block in program.cfg.blocks().filter(|b| b.is_invalid) {
        let offset = block.offset;
        let contexts = paths.by_invalid.get(&offset).map_or(0, BTreeMap::len);
        let recorded: Vec<&Path> = paths.paths_to(offset).collect();
        let status = classify(analysis, &recorded, &code, config, &mut report.path_outcomes);
        tracing::debug!(
            invalid = format_args!("0x{offset:x}"),
            paths = recorded.len(),
            contexts,
            ?status,
            "invalid classified"
        );
        report.verdicts.push(InvalidVerdict {
            offset,
            status,
            paths: recorded.len(),
            contexts,
        });
    }

    tracing::info!(
        invalids = report.verdicts.len(),
        optimizable = report.optimizable().count(),
        "reachability analysis finished"
    );
    report
}

fn classify(
    analysis: &Analysis,
    recorded: &[&Path],
    code: &Rc<[u8]>,
    config: ReachabilityConfig,
    outcomes: &mut BTreeMap<usize, PathOutcome>,
) -> InvalidStatus {
    if recorded.is_empty() {
        return InvalidStatus::NoPath;
    }
    let program = &analysis.program;
    if let Some(path) = recorded.iter().find(|p| analysis.paths.is_excluded(p)) {
        let recursive = analysis.loops.recursive.iter().any(|id| {
            program
                .function(*id)
                .is_some_and(|f| path.nodes.iter().any(|n| f.contains(*n)))
        });
        return if recursive {
            InvalidStatus::Recursive
        } else {
            InvalidStatus::LoopRelated
        };
    }

    for path in recorded {
        let outcome = match check_path(program, path, Rc::clone(code), config.solver_timeout_ms) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(path = path.id, %err, "symbolic execution failed, keeping path");
                PathOutcome::Error
            }
        };
        outcomes.insert(path.id, outcome);
        if !outcome.is_infeasible() {
            return InvalidStatus::Reachable;
        }
    }
    InvalidStatus::Optimizable
}
