//! Path enumeration.
//!
//! Depth-first walk from the entry block to every `INVALID`, following calls and returns with a
//! shadow return-address stack. Each frame owns a [`TagStack`], a [`SimplifiedExecutor`], the
//! return-address stack, the call chain and the path so far. All of them are persistent stacks,
//! so descending into a successor is a handful of reference-count bumps.

use crate::jump_edge::EdgeRole;
use crate::program::Program;
use crate::scc::LoopInfo;
use crate::{AbortReason, Error, Result};
use serde::{Deserialize, Serialize};
use sieve_core::cfg_ir::JumpType;
use sieve_core::decoder::Instruction;
use sieve_core::interp::{PStack, SimplifiedExecutor, TagItem, TagStack};
use sieve_core::rewrite::{CodeCopyPatch, JumpPatch};
use sieve_core::Opcode;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Guards for the search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathConfig {
    pub timeout: Duration,
    pub max_paths: usize,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(600),
            max_paths: 400_000,
        }
    }
}

/// One entry-to-`INVALID` path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Path {
    pub id: usize,
    pub nodes: Vec<usize>,
    /// Ids of the functions entered along the path, in call order.
    pub call_chain: Vec<usize>,
}

impl Path {
    /// The `INVALID` block the path ends in.
    pub fn invalid(&self) -> usize {
        self.nodes.last().copied().unwrap_or_default()
    }

    /// Bucket key for the path's call context.
    pub fn chain_key(&self) -> String {
        let ids: Vec<String> = self.call_chain.iter().map(ToString::to_string).collect();
        format!("[{}]", ids.join(","))
    }
}

/// Everything the search collected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathSet {
    pub paths: Vec<Path>,
    /// `INVALID` offset to call-context key to path ids.
    pub by_invalid: BTreeMap<usize, BTreeMap<String, Vec<usize>>>,
    pub jumps: BTreeSet<JumpPatch>,
    pub code_copies: BTreeSet<CodeCopyPatch>,
    pub visited: BTreeSet<usize>,
    /// Blocks whose paths cannot be optimized.
    pub excluded: BTreeSet<usize>,
    /// Blocks found on a cycle that loop analysis did not report.
    pub unexpected_cycles: BTreeSet<usize>,
}

impl PathSet {
    pub fn path(&self, id: usize) -> Option<&Path> {
        self.paths.get(id)
    }

    /// True if the path crosses a loop-related block.
    pub fn is_excluded(&self, path: &Path) -> bool {
        path.nodes.iter().any(|n| self.excluded.contains(n))
    }

    /// Paths ending in `invalid`, across all call contexts.
    pub fn paths_to(&self, invalid: usize) -> impl Iterator<Item = &Path> + '_ {
        self.by_invalid
            .get(&invalid)
            .into_iter()
            .flat_map(|buckets| buckets.values().flatten())
            .filter_map(|&id| self.path(id))
    }
}

#[derive(Clone)]
struct Frame {
    tags: TagStack,
    exec: SimplifiedExecutor,
    returns: PStack<usize>,
    chain: PStack<usize>,
    path: PStack<usize>,
}

struct Search<'a> {
    program: &'a Program,
    config: PathConfig,
    started: Instant,
    loop_nodes: &'a BTreeSet<usize>,
    /// Blocks on the current DFS stack, per return-address context.
    marks: HashMap<String, HashSet<usize>>,
    out: PathSet,
}

/// Enumerates every path from the entry block to an `INVALID` block.
pub fn generate_paths(program: &Program, loops: &LoopInfo, config: PathConfig) -> Result<PathSet> {
    let jumpdests = Rc::new(program.cfg.jumpdests());
    let mut search = Search {
        program,
        config,
        started: Instant::now(),
        loop_nodes: &loops.loop_nodes,
        marks: HashMap::new(),
        out: PathSet::default(),
    };
    let root = Frame {
        tags: TagStack::new(jumpdests),
        exec: SimplifiedExecutor::new(),
        returns: PStack::new(),
        chain: PStack::new(),
        path: PStack::new(),
    };
    search.visit(program.cfg.init, root)?;
    search.check_coverage()?;

    let mut out = search.out;
    for path in &out.paths {
        out.by_invalid
            .entry(path.invalid())
            .or_default()
            .entry(path.chain_key())
            .or_default()
            .push(path.id);
    }
    out.excluded = loops.excluded.clone();
    out.excluded.extend(out.unexpected_cycles.iter().copied());

    tracing::info!(
        paths = out.paths.len(),
        invalids = out.by_invalid.len(),
        jumps = out.jumps.len(),
        code_copies = out.code_copies.len(),
        elapsed_ms = search.started.elapsed().as_millis() as u64,
        "path search finished"
    );
    Ok(out)
}

impl<'a> Search<'a> {
    fn visit(&mut self, node: usize, frame: Frame) -> Result<()> {
        if self.started.elapsed() >= self.config.timeout {
            return Err(Error::abort(
                AbortReason::PathSearchTimeout,
                format!("gave up after {}s", self.config.timeout.as_secs()),
            ));
        }
        if node == self.program.cfg.exit {
            return Ok(());
        }

        let context = frame.returns.key();
        if !self.marks.entry(context.clone()).or_default().insert(node) {
            if !self.loop_nodes.contains(&node) && self.out.unexpected_cycles.insert(node) {
                tracing::warn!(
                    node = format_args!("0x{node:x}"),
                    context = %context,
                    "cycle outside loop analysis, paths through it are excluded"
                );
            }
            return Ok(());
        }

        let result = self.explore(node, frame);

        if let Some(marks) = self.marks.get_mut(&context) {
            marks.remove(&node);
        }
        result
    }

    fn explore(&mut self, node: usize, mut frame: Frame) -> Result<()> {
        let program = self.program;
        let block = program.cfg.block(node).ok_or_else(|| {
            Error::Structural(format!("path reached unknown block 0x{node:x}"))
        })?;
        frame.path.push(node);
        self.out.visited.insert(node);

        let Some((last, body)) = block.instructions.split_last() else {
            return Ok(());
        };
        for ins in body {
            self.step(node, ins, &mut frame);
        }

        if block.is_invalid {
            return self.record(frame);
        }

        match block.jump_type {
            JumpType::Terminal => Ok(()),
            JumpType::Fall => {
                self.step(node, last, &mut frame);
                self.visit(block.fallthrough(), frame)
            }
            JumpType::Conditional => {
                let target = self.jump_target(node, last, &frame)?;
                self.step(node, last, &mut frame);
                self.visit(target, frame.clone())?;
                self.visit(block.fallthrough(), frame)
            }
            JumpType::Unconditional => {
                let target = self.jump_target(node, last, &frame)?;
                self.step(node, last, &mut frame);
                match program.role(node, target) {
                    EdgeRole::Plain => self.visit(target, frame),
                    EdgeRole::Call => {
                        let ret = last.pc + 1;
                        if frame.returns.contains(&ret) {
                            return Err(Error::abort(
                                AbortReason::CyclicCallChain,
                                format!(
                                    "call at 0x{:x} re-enters 0x{target:x} with return address 0x{ret:x} pending",
                                    last.pc
                                ),
                            ));
                        }
                        let callee = program.function_at(target).map_or(0, |f| f.id);
                        frame.returns.push(ret);
                        frame.chain.push(callee);
                        self.visit(target, frame)
                    }
                    EdgeRole::Return => match frame.returns.pop() {
                        Some(ret) if ret == target => self.visit(target, frame),
                        top => Err(Error::Structural(format!(
                            "return from 0x{node:x} to 0x{target:x} but the pending return address is {top:?}"
                        ))),
                    },
                }
            }
        }
    }

    /// Advances both interpreters, recording `CODECOPY` operands first.
    fn step(&mut self, node: usize, ins: &Instruction, frame: &mut Frame) {
        if ins.op == Opcode::CODECOPY {
            let offset = frame.tags.peek(1).cloned().unwrap_or_else(TagItem::unknown);
            let size = frame
                .tags
                .peek(2)
                .and_then(TagItem::as_offset)
                .or_else(|| frame.exec.peek(2).and_then(|v| usize::try_from(v).ok()));
            self.out.code_copies.insert(CodeCopyPatch {
                block: node,
                pc: ins.pc,
                offset: offset
                    .as_offset()
                    .or_else(|| frame.exec.peek(1).and_then(|v| usize::try_from(v).ok())),
                offset_push_pc: offset.push_instr_addr,
                size,
            });
        }
        frame.tags.step(ins, node);
        frame.exec.step(ins);
    }

    /// Resolves the destination of the jump ending `node` and records where it was pushed.
    fn jump_target(&mut self, node: usize, jump: &Instruction, frame: &Frame) -> Result<usize> {
        let cfg = &self.program.cfg;
        let tag = frame.tags.top().cloned().unwrap_or_else(TagItem::unknown);
        if let (Some(tagged), Some(concrete)) = (tag.push_value, frame.exec.top()) {
            if tagged != concrete {
                return Err(Error::Structural(format!(
                    "jump at 0x{:x}: tag stack says {tagged:#x}, executor says {concrete:#x}",
                    jump.pc
                )));
            }
        }

        let Some(target) = tag.as_offset() else {
            return Err(Error::abort(
                AbortReason::ComputedJump,
                format!("jump at 0x{:x} has no constant destination", jump.pc),
            ));
        };
        if !cfg.contains(target) || target == cfg.exit {
            return Err(Error::abort(
                AbortReason::ComputedJump,
                format!("jump at 0x{:x} targets 0x{target:x}, which starts no block", jump.pc),
            ));
        }
        if !cfg.has_edge(node, target) {
            return Err(Error::abort(
                AbortReason::IncompleteJumpCoverage,
                format!("jump 0x{node:x} -> 0x{target:x} is missing from the CFG"),
            ));
        }

        self.out.jumps.insert(JumpPatch {
            block: node,
            target,
            push_pc: tag.push_instr_addr,
        });
        Ok(target)
    }

    fn record(&mut self, frame: Frame) -> Result<()> {
        if self.out.paths.len() >= self.config.max_paths {
            return Err(Error::abort(
                AbortReason::PathExplosion,
                format!("more than {} paths", self.config.max_paths),
            ));
        }
        let mut nodes: Vec<usize> = frame.path.iter().copied().collect();
        nodes.reverse();
        let mut call_chain: Vec<usize> = frame.chain.iter().copied().collect();
        call_chain.reverse();
        let id = self.out.paths.len();
        tracing::trace!(id, invalid = ?nodes.last(), len = nodes.len(), "recorded path");
        self.out.paths.push(Path {
            id,
            nodes,
            call_chain,
        });
        Ok(())
    }

    /// Every jump edge out of a visited block must have been taken by some path.
    fn check_coverage(&self) -> Result<()> {
        let cfg = &self.program.cfg;
        let mut expected = 0usize;
        for &node in &self.out.visited {
            let Some(block) = cfg.block(node) else {
                continue;
            };
            if block.is_invalid {
                continue;
            }
            expected += match block.jump_type {
                JumpType::Unconditional => cfg
                    .successors(node)
                    .into_iter()
                    .filter(|&s| s != cfg.exit)
                    .count(),
                JumpType::Conditional => 1,
                JumpType::Fall | JumpType::Terminal => 0,
            };
        }
        let taken: BTreeSet<(usize, usize)> =
            self.out.jumps.iter().map(|j| (j.block, j.target)).collect();
        if taken.len() != expected {
            return Err(Error::abort(
                AbortReason::IncompleteJumpCoverage,
                format!(
                    "paths took {} jump edges, the CFG has {expected}",
                    taken.len()
                ),
            ));
        }
        Ok(())
    }
}
