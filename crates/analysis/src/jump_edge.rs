//! Call/return recognition for unconditional jumps.
//!
//! A Solidity internal call is `PUSH ret; PUSH f; JUMP` with `ret` placed right after the
//! `JUMP`. The callee later returns with a bare `JUMP` to `ret`. Each candidate edge gets a
//! four-slot key: call candidates fill the first two slots with the `JUMP` address and the
//! address after it, return candidates fill the last two with the address before their target
//! and the target itself. A call and a return match when the two halves agree.

use sieve_core::cfg_ir::{Cfg, JumpType};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Matching key: `(call_addr, call_addr + 1, return_target - 1, return_target)`.
pub type Tetrad = [Option<usize>; 4];

/// What an unconditional edge means once calls and returns are matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeRole {
    Plain,
    Call,
    Return,
}

/// An edge leaving an unconditional-jump block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JumpEdge {
    pub begin_node: usize,
    pub target_node: usize,
    /// PC of the `JUMP`.
    pub begin_addr: usize,
    pub target_addr: usize,
    pub tetrad: Tetrad,
    pub is_caller_edge: bool,
    pub is_return_edge: bool,
}

impl JumpEdge {
    pub fn role(&self) -> EdgeRole {
        match (self.is_caller_edge, self.is_return_edge) {
            (true, _) => EdgeRole::Call,
            (_, true) => EdgeRole::Return,
            _ => EdgeRole::Plain,
        }
    }

    #[inline]
    pub fn key(&self) -> (usize, usize) {
        (self.begin_node, self.target_node)
    }

    /// Address control resumes at after a call through this edge.
    #[inline]
    pub fn return_address(&self) -> usize {
        self.begin_addr + 1
    }
}

/// A matched call edge and return edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallPair {
    /// `(caller block, callee entry)`.
    pub call: (usize, usize),
    /// `(callee return block, return site)`.
    pub ret: (usize, usize),
}

impl CallPair {
    pub fn entry(&self) -> usize {
        self.call.1
    }

    pub fn exit_block(&self) -> usize {
        self.ret.0
    }
}

/// Every edge out of an unconditional-jump block, exit edges excluded.
pub fn collect_candidates(cfg: &Cfg) -> Vec<JumpEdge> {
    let mut edges = Vec::new();
    for block in cfg.blocks() {
        if block.jump_type != JumpType::Unconditional {
            continue;
        }
        let Some(jump) = block.last_instruction() else {
            continue;
        };
        for target in cfg.successors(block.offset) {
            if target == cfg.exit {
                continue;
            }
            let tetrad = if block.could_be_caller {
                [Some(jump.pc), Some(jump.pc + 1), None, None]
            } else {
                [None, None, target.checked_sub(1), Some(target)]
            };
            edges.push(JumpEdge {
                begin_node: block.offset,
                target_node: target,
                begin_addr: jump.pc,
                target_addr: target,
                tetrad,
                is_caller_edge: false,
                is_return_edge: false,
            });
        }
    }
    edges
}

/// Pairs call candidates with return candidates and flags both sides.
pub fn match_pairs(edges: &mut [JumpEdge]) -> Vec<CallPair> {
    let mut returns: HashMap<(usize, usize), Vec<usize>> = HashMap::new();
    for (idx, edge) in edges.iter().enumerate() {
        if let [None, None, Some(before), Some(target)] = edge.tetrad {
            returns.entry((before, target)).or_default().push(idx);
        }
    }

    let mut pairs = Vec::new();
    for call_idx in 0..edges.len() {
        let [Some(addr), Some(next), None, None] = edges[call_idx].tetrad else {
            continue;
        };
        let Some(matches) = returns.get(&(addr, next)) else {
            continue;
        };
        for &ret_idx in matches {
            edges[call_idx].is_caller_edge = true;
            edges[ret_idx].is_return_edge = true;
            pairs.push(CallPair {
                call: edges[call_idx].key(),
                ret: edges[ret_idx].key(),
            });
        }
    }

    pairs.sort_unstable();
    pairs.dedup();
    tracing::debug!(
        candidates = edges.len(),
        pairs = pairs.len(),
        "matched call/return edges"
    );
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TWO_CALLS, repaired};

    #[test]
    fn matches_each_call_with_its_return() {
        let cfg = repaired(TWO_CALLS);
        let mut edges = collect_candidates(&cfg);
        let keys: Vec<(usize, usize)> = edges.iter().map(JumpEdge::key).collect();
        assert_eq!(keys, vec![(0, 0x0d), (5, 0x0d), (0x0d, 5), (0x0d, 0x0b)]);
        assert_eq!(edges[0].tetrad, [Some(4), Some(5), None, None]);
        assert_eq!(edges[3].tetrad, [None, None, Some(0x0a), Some(0x0b)]);

        let pairs = match_pairs(&mut edges);
        assert_eq!(
            pairs,
            vec![
                CallPair { call: (0, 0x0d), ret: (0x0d, 5) },
                CallPair { call: (5, 0x0d), ret: (0x0d, 0x0b) },
            ]
        );
        assert!(edges.iter().all(|e| e.role() != EdgeRole::Plain));
        assert!(edges.iter().all(|e| !(e.is_caller_edge && e.is_return_edge)));
        assert_eq!(edges[1].return_address(), 0x0b);
    }

    #[test]
    fn plain_jump_has_no_partner() {
        // 0: PUSH1 04 JUMP | 3: INVALID | 4: JUMPDEST STOP
        let cfg = repaired(&[0x60, 0x04, 0x56, 0xfe, 0x5b, 0x00]);
        let mut edges = collect_candidates(&cfg);
        assert_eq!(edges.len(), 1);
        assert!(match_pairs(&mut edges).is_empty());
        assert_eq!(edges[0].role(), EdgeRole::Plain);
    }
}
