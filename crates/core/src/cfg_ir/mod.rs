//! Control Flow Graph Intermediate Representation
//!
//! Basic blocks are keyed by their byte offset. The graph is a `StableDiGraph` so that edges can be
//! added during repair and removed again after function identification without invalidating node
//! indices held by later passes.

use crate::decoder::{Instruction, decode_bytes};
use crate::result::Error;
use crate::{HexBytes, Opcode, OpcodeExt, is_terminal_opcode};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableDiGraph;
use petgraph::Direction;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

mod snapshot;

pub use snapshot::{CfgSnapshot, EdgeSnapshot};

/// Block kind reported for the synthetic exit node.
pub const EXIT_KIND: &str = "exit";

/// How control leaves a basic block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JumpType {
    /// Ends with `JUMP`.
    #[serde(alias = "UNCONDITIONAL", alias = "jump")]
    Unconditional,
    /// Ends with `JUMPI`.
    #[serde(alias = "CONDITIONAL", alias = "jumpi")]
    Conditional,
    /// Runs into the next block.
    #[serde(alias = "FALL", alias = "fallthrough")]
    Fall,
    /// Halts execution.
    #[serde(alias = "TERMINAL", alias = "terminate")]
    Terminal,
}

/// Successors of a conditional block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchTargets {
    /// Taken-branch successor, `None` while the destination is unresolved.
    pub true_target: Option<usize>,
    /// Fall-through successor (`offset + length`).
    pub false_target: usize,
}

/// A basic block of the runtime bytecode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicBlock {
    /// Byte address of the first instruction.
    pub offset: usize,
    /// Length in bytes.
    pub length: usize,
    /// Raw bytes of the block.
    pub bytecode: HexBytes,
    /// Disassembler classification (`dispatcher`, `common`, `exit`, ...).
    pub kind: String,
    /// Net stack effect reported by the disassembler.
    pub stack_balance: i64,
    pub jump_type: JumpType,
    /// Resolved successors of an unconditional jump.
    pub jump_dest: Vec<usize>,
    /// Resolved successors of a conditional jump.
    pub jumpi_dest: Option<BranchTargets>,
    /// True iff the last opcode is `INVALID` (0xfe).
    pub is_invalid: bool,
    /// True iff the block ends with `PUSH` immediately followed by `JUMP`.
    pub could_be_caller: bool,
    /// Decoded instructions with absolute PCs.
    pub instructions: Vec<Instruction>,
}

impl BasicBlock {
    /// Decodes `bytecode` at `offset` and derives the block flags.
    ///
    /// `jump_type` overrides the classification inferred from the last opcode when the
    /// disassembler reports one.
    pub fn new(
        offset: usize,
        bytecode: Vec<u8>,
        kind: impl Into<String>,
        stack_balance: i64,
        jump_type: Option<JumpType>,
    ) -> Self {
        let (instructions, _) = decode_bytes(&bytecode, offset);
        let last_op = instructions.last().map(|ins| ins.op);
        let inferred = match last_op {
            Some(Opcode::JUMP) => JumpType::Unconditional,
            Some(Opcode::JUMPI) => JumpType::Conditional,
            Some(op) if is_terminal_opcode(op) => JumpType::Terminal,
            Some(_) => JumpType::Fall,
            None => JumpType::Terminal,
        };
        let could_be_caller = last_op == Some(Opcode::JUMP)
            && instructions.len() >= 2
            && instructions[instructions.len() - 2].op.is_push();

        Self {
            offset,
            length: bytecode.len(),
            bytecode: HexBytes(bytecode),
            kind: kind.into(),
            stack_balance,
            jump_type: jump_type.unwrap_or(inferred),
            jump_dest: Vec::new(),
            jumpi_dest: None,
            is_invalid: last_op == Some(Opcode::INVALID),
            could_be_caller,
            instructions,
        }
    }

    /// Creates the synthetic exit block at `offset`.
    pub fn exit(offset: usize) -> Self {
        Self::new(offset, Vec::new(), EXIT_KIND, 0, Some(JumpType::Terminal))
    }

    /// Offset of the block that follows this one in the byte stream.
    #[inline]
    pub fn fallthrough(&self) -> usize {
        self.offset + self.length
    }

    /// Returns true for the synthetic exit node.
    #[inline]
    pub fn is_exit(&self) -> bool {
        self.length == 0 && self.kind == EXIT_KIND
    }

    /// Returns true when the block begins with `JUMPDEST`.
    pub fn starts_with_jumpdest(&self) -> bool {
        self.instructions.first().map(|ins| ins.op) == Some(Opcode::JUMPDEST)
    }

    /// The block's final instruction.
    pub fn last_instruction(&self) -> Option<&Instruction> {
        self.instructions.last()
    }
}

/// Edge labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EdgeType {
    Fallthrough,
    Jump,
    BranchTrue,
    BranchFalse,
    /// Edge from a halting block to the exit node.
    Exit,
    /// Edge restored by the repair pass.
    Repaired,
    /// Temporary caller-to-return-site edge used while identifying function bodies.
    Shortcut,
}

/// Runtime control-flow graph keyed by block offset.
#[derive(Debug, Clone)]
pub struct Cfg {
    pub graph: StableDiGraph<BasicBlock, EdgeType>,
    pub offset_to_node: HashMap<usize, NodeIndex>,
    /// Entry offset, always 0.
    pub init: usize,
    /// Offset of the exit node, the largest offset in the graph.
    pub exit: usize,
}

impl Cfg {
    /// Builds a CFG from blocks and `(from, to)` successor pairs.
    ///
    /// A synthetic exit block is appended when none of the blocks is an exit node. Edges leaving
    /// the exit node and edges to unknown offsets are dropped with a warning.
    pub fn from_blocks(
        mut blocks: Vec<BasicBlock>,
        successors: &[(usize, usize)],
    ) -> Result<Self, Error> {
        blocks.sort_by_key(|b| b.offset);
        if blocks.is_empty() {
            return Err(Error::InvalidBlockStructure("no blocks".into()));
        }
        if blocks[0].offset != 0 {
            return Err(Error::InvalidBlockStructure(format!(
                "first block starts at 0x{:x}, expected 0",
                blocks[0].offset
            )));
        }
        for pair in blocks.windows(2) {
            if pair[0].offset == pair[1].offset {
                return Err(Error::InvalidBlockStructure(format!(
                    "duplicate block at offset 0x{:x}",
                    pair[0].offset
                )));
            }
        }

        let has_exit = blocks.last().is_some_and(|b| b.is_exit());
        if !has_exit {
            let end = blocks.iter().map(|b| b.fallthrough()).max().unwrap_or(0);
            blocks.push(BasicBlock::exit(end));
        }
        let exit = blocks.last().map(|b| b.offset).unwrap_or(0);

        let mut graph = StableDiGraph::new();
        let mut offset_to_node = HashMap::new();
        for block in blocks {
            let offset = block.offset;
            let node = graph.add_node(block);
            offset_to_node.insert(offset, node);
        }

        let mut cfg = Self {
            graph,
            offset_to_node,
            init: 0,
            exit,
        };

        for &(from, to) in successors {
            if from == cfg.exit {
                tracing::warn!(from, to, "dropping edge that leaves the exit node");
                continue;
            }
            if !cfg.contains(from) || !cfg.contains(to) {
                tracing::warn!(from, to, "dropping edge with unknown endpoint");
                continue;
            }
            let kind = cfg.classify_edge(from, to);
            cfg.add_edge(from, to, kind)?;
        }

        tracing::debug!(
            blocks = cfg.graph.node_count(),
            edges = cfg.graph.edge_count(),
            exit = format_args!("0x{:x}", cfg.exit),
            "built runtime CFG"
        );
        Ok(cfg)
    }

    /// Label for a disassembler-provided edge.
    fn classify_edge(&self, from: usize, to: usize) -> EdgeType {
        let Some(block) = self.block(from) else {
            return EdgeType::Jump;
        };
        match block.jump_type {
            JumpType::Unconditional => EdgeType::Jump,
            JumpType::Conditional if to == block.fallthrough() => EdgeType::BranchFalse,
            JumpType::Conditional => EdgeType::BranchTrue,
            JumpType::Fall => EdgeType::Fallthrough,
            JumpType::Terminal => EdgeType::Exit,
        }
    }

    /// Returns true if a block starts at `offset`.
    #[inline]
    pub fn contains(&self, offset: usize) -> bool {
        self.offset_to_node.contains_key(&offset)
    }

    /// Block starting at `offset`.
    pub fn block(&self, offset: usize) -> Option<&BasicBlock> {
        self.offset_to_node
            .get(&offset)
            .and_then(|node| self.graph.node_weight(*node))
    }

    /// Block offsets in ascending order, exit included.
    pub fn offsets(&self) -> Vec<usize> {
        let mut offsets: Vec<usize> = self.offset_to_node.keys().copied().collect();
        offsets.sort_unstable();
        offsets
    }

    /// Blocks in ascending offset order, exit included.
    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> + '_ {
        self.offsets().into_iter().filter_map(move |o| self.block(o))
    }

    /// Largest block offset (the exit node).
    #[inline]
    pub fn max_offset(&self) -> usize {
        self.exit
    }

    /// Successor offsets of `offset`, ascending.
    pub fn successors(&self, offset: usize) -> Vec<usize> {
        self.neighbors(offset, Direction::Outgoing)
    }

    /// Predecessor offsets of `offset`, ascending.
    pub fn predecessors(&self, offset: usize) -> Vec<usize> {
        self.neighbors(offset, Direction::Incoming)
    }

    fn neighbors(&self, offset: usize, direction: Direction) -> Vec<usize> {
        let Some(&node) = self.offset_to_node.get(&offset) else {
            return Vec::new();
        };
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(node, direction)
            .filter_map(|n| self.graph.node_weight(n).map(|b| b.offset))
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Label of the edge `from -> to`, if present.
    pub fn edge_kind(&self, from: usize, to: usize) -> Option<EdgeType> {
        let (&a, &b) = (self.offset_to_node.get(&from)?, self.offset_to_node.get(&to)?);
        self.graph.find_edge(a, b).and_then(|e| self.graph.edge_weight(e)).copied()
    }

    #[inline]
    pub fn has_edge(&self, from: usize, to: usize) -> bool {
        self.edge_kind(from, to).is_some()
    }

    /// Adds `from -> to`. Returns false if the edge already exists.
    pub fn add_edge(&mut self, from: usize, to: usize, kind: EdgeType) -> Result<bool, Error> {
        if from == self.exit {
            return Err(Error::InvalidBlockStructure(format!(
                "exit node 0x{from:x} cannot have successors"
            )));
        }
        let (Some(&a), Some(&b)) = (self.offset_to_node.get(&from), self.offset_to_node.get(&to))
        else {
            return Err(Error::InvalidBlockStructure(format!(
                "edge 0x{from:x} -> 0x{to:x} references an unknown block"
            )));
        };
        if self.graph.find_edge(a, b).is_some() {
            return Ok(false);
        }
        self.graph.add_edge(a, b, kind);
        self.sync_destinations(from);
        Ok(true)
    }

    /// Removes `from -> to`. Returns false if the edge did not exist.
    pub fn remove_edge(&mut self, from: usize, to: usize) -> bool {
        let (Some(&a), Some(&b)) = (self.offset_to_node.get(&from), self.offset_to_node.get(&to))
        else {
            return false;
        };
        let Some(edge) = self.graph.find_edge(a, b) else {
            return false;
        };
        self.graph.remove_edge(edge);
        self.sync_destinations(from);
        true
    }

    /// Refreshes `jump_dest`/`jumpi_dest` of the block at `offset` from its current edges.
    fn sync_destinations(&mut self, offset: usize) {
        let successors = self.successors(offset);
        let exit = self.exit;
        let Some(&node) = self.offset_to_node.get(&offset) else {
            return;
        };
        let Some(block) = self.graph.node_weight_mut(node) else {
            return;
        };
        match block.jump_type {
            JumpType::Unconditional => {
                block.jump_dest = successors.into_iter().filter(|s| *s != exit).collect();
            }
            JumpType::Conditional => {
                let fallthrough = block.fallthrough();
                let true_target = successors
                    .iter()
                    .copied()
                    .find(|s| *s != fallthrough && *s != exit);
                block.jumpi_dest = Some(BranchTargets {
                    true_target,
                    false_target: fallthrough,
                });
            }
            JumpType::Fall | JumpType::Terminal => {}
        }
    }

    /// Every edge as `(from, to, kind)`, ordered by endpoints.
    pub fn edges(&self) -> Vec<(usize, usize, EdgeType)> {
        let mut edges: Vec<(usize, usize, EdgeType)> = self
            .graph
            .edge_references()
            .filter_map(|e| {
                let from = self.graph.node_weight(e.source())?.offset;
                let to = self.graph.node_weight(e.target())?.offset;
                Some((from, to, *e.weight()))
            })
            .collect();
        edges.sort_unstable();
        edges
    }

    /// Blocks other than init and exit that have no inbound edge.
    pub fn orphans(&self) -> Vec<usize> {
        self.offsets()
            .into_iter()
            .filter(|&o| o != self.init && o != self.exit && self.predecessors(o).is_empty())
            .collect()
    }

    /// Offsets of blocks that begin with `JUMPDEST`.
    pub fn jumpdests(&self) -> BTreeSet<usize> {
        self.blocks()
            .filter(|b| b.starts_with_jumpdest())
            .map(|b| b.offset)
            .collect()
    }

    /// Concatenated bytes of every block, which is the runtime code the graph was built from.
    pub fn runtime_bytes(&self) -> Vec<u8> {
        self.blocks()
            .flat_map(|b| b.bytecode.iter().copied())
            .collect()
    }

    /// Checks that blocks tile the code without gaps or overlaps.
    pub fn check_contiguous(&self) -> Result<(), Error> {
        let mut expected = 0usize;
        for block in self.blocks() {
            if block.offset != expected {
                return Err(Error::InvalidBlockStructure(format!(
                    "block at 0x{:x} does not follow previous block ending at 0x{:x}",
                    block.offset, expected
                )));
            }
            expected = block.fallthrough();
        }
        Ok(())
    }
}
