//! End-to-end driver: disassembly, analysis, reachability and rewriting.
//!
//! Inputs that cannot be optimized do not produce errors. They come back as
//! [`OptimizationResult::Skipped`] with a [`SkipReason`], and the binary turns the reason into
//! an exit code. Errors are reserved for broken input and internal failures.

use crate::config::OptimizerConfig;
use crate::render::{self, DotGraph};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sieve_analysis::{AbortReason, analyze};
use sieve_core::cfg_ir::Cfg;
use sieve_core::disasm::DisassemblyReport;
use sieve_core::rewrite::{RewritePlan, rewrite};
use sieve_verification::{InvalidVerdict, analyze_reachability};
use std::collections::BTreeSet;
use std::fmt;

/// Why an input was left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    PathSearchTimeout,
    PathExplosion,
    CyclicCallChain,
    ComputedJump,
    DisassemblerFailure,
    FunctionSpanMismatch,
    IncompleteJumpCoverage,
    UnpatchableCodeCopy,
}

impl SkipReason {
    pub fn message(self) -> &'static str {
        match self {
            SkipReason::DisassemblerFailure => "disassembler failure",
            SkipReason::UnpatchableCodeCopy => "unpatchable code copy rejects optimization",
            SkipReason::PathSearchTimeout => AbortReason::PathSearchTimeout.message(),
            SkipReason::PathExplosion => AbortReason::PathExplosion.message(),
            SkipReason::CyclicCallChain => AbortReason::CyclicCallChain.message(),
            SkipReason::ComputedJump => AbortReason::ComputedJump.message(),
            SkipReason::FunctionSpanMismatch => AbortReason::FunctionSpanMismatch.message(),
            SkipReason::IncompleteJumpCoverage => AbortReason::IncompleteJumpCoverage.message(),
        }
    }

    /// Process exit code for the reason.
    pub fn exit_code(self) -> u8 {
        match self {
            SkipReason::PathSearchTimeout => 10,
            SkipReason::PathExplosion => 11,
            SkipReason::CyclicCallChain => 12,
            SkipReason::ComputedJump => 13,
            SkipReason::DisassemblerFailure => 14,
            SkipReason::FunctionSpanMismatch | SkipReason::IncompleteJumpCoverage => 15,
            SkipReason::UnpatchableCodeCopy => 16,
        }
    }
}

impl From<AbortReason> for SkipReason {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::PathSearchTimeout => SkipReason::PathSearchTimeout,
            AbortReason::PathExplosion => SkipReason::PathExplosion,
            AbortReason::CyclicCallChain => SkipReason::CyclicCallChain,
            AbortReason::ComputedJump => SkipReason::ComputedJump,
            AbortReason::FunctionSpanMismatch => SkipReason::FunctionSpanMismatch,
            AbortReason::IncompleteJumpCoverage => SkipReason::IncompleteJumpCoverage,
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OptimizationResult {
    /// The full payload after elision. Equal to the input when nothing was elided.
    Rewritten {
        #[serde(with = "hex::serde")]
        bytecode: Vec<u8>,
        /// Runtime offsets of the removed `INVALID` blocks.
        elided: Vec<usize>,
        removed_bytes: usize,
    },
    Skipped { reason: SkipReason, detail: String },
}

impl OptimizationResult {
    pub fn exit_code(&self) -> u8 {
        match self {
            OptimizationResult::Rewritten { .. } => 0,
            OptimizationResult::Skipped { reason, .. } => reason.exit_code(),
        }
    }

    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            OptimizationResult::Skipped { reason, .. } => Some(*reason),
            OptimizationResult::Rewritten { .. } => None,
        }
    }
}

/// Everything a run produced.
#[derive(Debug, Clone)]
pub struct Optimization {
    pub result: OptimizationResult,
    /// Per-`INVALID` verdicts. Empty when the run stopped before reachability.
    pub invalids: Vec<InvalidVerdict>,
    /// Rendered graphs, when requested.
    pub graphs: Vec<DotGraph>,
}

impl Optimization {
    fn skipped(reason: SkipReason, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        tracing::warn!(%reason, detail = %detail, "optimization skipped");
        Self {
            result: OptimizationResult::Skipped { reason, detail },
            invalids: Vec::new(),
            graphs: Vec::new(),
        }
    }
}

fn is_disassembler_failure(err: &sieve_core::Error) -> bool {
    matches!(
        err,
        sieve_core::Error::Disassembler(_)
            | sieve_core::Error::DisassemblerTimeout(_)
            | sieve_core::Error::MalformedDisassembly(_)
    )
}

/// Optimizes a deployment payload (or a bare runtime).
///
/// With `precomputed` set the disassembler is not run. The analysis itself runs on a dedicated
/// thread whose stack is sized by [`OptimizerConfig::stack_size_mb`], since path enumeration
/// recurses once per block on a path.
pub async fn optimize(
    original: Vec<u8>,
    precomputed: Option<DisassemblyReport>,
    config: &OptimizerConfig,
    render: bool,
) -> Result<Optimization> {
    let report = match precomputed {
        Some(report) => report,
        None => {
            let disassembler = config.disassembler()?;
            tracing::info!(
                disassembler = disassembler.name(),
                bytes = original.len(),
                "disassembling"
            );
            match disassembler.disassemble(&original).await {
                Ok(report) => report,
                Err(err) if is_disassembler_failure(&err) => {
                    return Ok(Optimization::skipped(
                        SkipReason::DisassemblerFailure,
                        err.to_string(),
                    ));
                }
                Err(err) => return Err(err.into()),
            }
        }
    };
    let cfg = report.runtime_cfg.into_cfg()?;

    let config = config.clone();
    let handle = std::thread::Builder::new()
        .name("sieve-pipeline".into())
        .stack_size(config.stack_size_bytes())
        .spawn(move || optimize_cfg(&original, cfg, &config, render))
        .map_err(|e| Error::Thread(e.to_string()))?;
    tokio::task::spawn_blocking(move || handle.join())
        .await
        .map_err(|e| Error::Thread(e.to_string()))?
        .map_err(|_| Error::Thread("pipeline thread panicked".into()))?
}

/// Runs analysis, reachability and rewriting on the current thread.
pub fn optimize_cfg(
    original: &[u8],
    cfg: Cfg,
    config: &OptimizerConfig,
    render: bool,
) -> Result<Optimization> {
    let analysis = match analyze(cfg, &config.analysis()) {
        Ok(analysis) => analysis,
        Err(err) => {
            return match err.abort_reason() {
                Some(reason) => Ok(Optimization::skipped(reason.into(), err.to_string())),
                None => Err(err.into()),
            };
        }
    };
    let graphs = if render {
        render::render_all(&analysis.program, analysis.loops.graphs.values().cloned())
    } else {
        Vec::new()
    };

    let reachability = analyze_reachability(&analysis, config.reachability());
    let elide: BTreeSet<usize> = reachability.optimizable().collect();
    let plan = RewritePlan {
        elide: elide.clone(),
        jumps: analysis.paths.jumps.iter().cloned().collect(),
        code_copies: analysis.paths.code_copies.iter().cloned().collect(),
    };

    let mut optimization = match rewrite(original, &analysis.program.cfg, &plan) {
        Ok(outcome) => Optimization {
            result: OptimizationResult::Rewritten {
                bytecode: outcome.bytecode,
                elided: elide.into_iter().collect(),
                removed_bytes: outcome.removed_bytes,
            },
            invalids: Vec::new(),
            graphs: Vec::new(),
        },
        Err(err @ sieve_core::Error::ComputedJump { .. }) => {
            Optimization::skipped(SkipReason::ComputedJump, err.to_string())
        }
        Err(err @ sieve_core::Error::UnpatchableCodeCopy { .. }) => {
            Optimization::skipped(SkipReason::UnpatchableCodeCopy, err.to_string())
        }
        Err(err) => return Err(err.into()),
    };
    optimization.invalids = reachability.verdicts;
    optimization.graphs = graphs;
    Ok(optimization)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_core::disasm::build_cfg_json;

    #[test]
    fn every_abort_has_a_distinct_message_and_code() {
        let reasons = [
            AbortReason::PathSearchTimeout,
            AbortReason::PathExplosion,
            AbortReason::CyclicCallChain,
            AbortReason::ComputedJump,
        ];
        let codes: BTreeSet<u8> = reasons
            .iter()
            .map(|r| SkipReason::from(*r).exit_code())
            .collect();
        assert_eq!(codes, BTreeSet::from([10, 11, 12, 13]));
        assert_eq!(
            SkipReason::from(AbortReason::CyclicCallChain).to_string(),
            "cyclic function-call chain detected"
        );
        assert_eq!(SkipReason::DisassemblerFailure.exit_code(), 14);
    }

    #[test]
    fn elides_dead_assert() {
        // PUSH1 0 PUSH1 0 EQ PUSH1 09 JUMPI INVALID JUMPDEST STOP
        let code = vec![0x60, 0x00, 0x60, 0x00, 0x14, 0x60, 0x09, 0x57, 0xfe, 0x5b, 0x00];
        let cfg = build_cfg_json(&code).into_cfg().unwrap();
        let out = optimize_cfg(&code, cfg, &OptimizerConfig::default(), false).unwrap();
        assert_eq!(
            out.result,
            OptimizationResult::Rewritten {
                bytecode: vec![0x60, 0x00, 0x60, 0x00, 0x14, 0x60, 0x08, 0x57, 0x5b, 0x00],
                elided: vec![8],
                removed_bytes: 1,
            }
        );
        assert_eq!(out.invalids.len(), 1);
        assert_eq!(out.result.exit_code(), 0);
    }

    #[test]
    fn path_cap_becomes_skip() {
        let code = vec![0x60, 0x00, 0x35, 0x60, 0x07, 0x57, 0xfe, 0x5b, 0xfe];
        let cfg = build_cfg_json(&code).into_cfg().unwrap();
        let config = OptimizerConfig {
            max_paths: 1,
            ..OptimizerConfig::default()
        };
        let out = optimize_cfg(&code, cfg, &config, false).unwrap();
        assert_eq!(out.result.skip_reason(), Some(SkipReason::PathExplosion));
        assert_eq!(out.result.exit_code(), 11);
        assert!(out.invalids.is_empty());
    }

    #[tokio::test]
    async fn runs_on_the_pipeline_thread() {
        let code = vec![0x60, 0x01, 0x60, 0x00, 0x14, 0x60, 0x09, 0x57, 0xfe, 0x5b, 0x00];
        let config = OptimizerConfig {
            stack_size_mb: 8,
            ..OptimizerConfig::default()
        };
        let out = optimize(code.clone(), None, &config, true).await.unwrap();
        match out.result {
            OptimizationResult::Rewritten {
                bytecode, elided, ..
            } => {
                assert_eq!(bytecode, code);
                assert!(elided.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!out.graphs.is_empty());
    }
}
