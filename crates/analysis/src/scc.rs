//! Loop detection by SCC compression.
//!
//! Each function body is collapsed into a DAG: every non-trivial strongly connected component
//! (two or more blocks, or one block with a self-loop) becomes a synthetic node. Blocks that
//! took part in an SCC are loop related, and so is every function called from a loop, from a
//! recursive function, or from another such function.

use crate::program::{Function, Program};
use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A function body as a graph of (possibly synthetic) nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionGraph {
    pub func_id: usize,
    pub head: usize,
    pub nodes: BTreeSet<usize>,
    pub edges: BTreeSet<(usize, usize)>,
    /// Members of each synthetic node.
    pub members: BTreeMap<usize, BTreeSet<usize>>,
    /// Synthetic nodes.
    pub loop_related: BTreeSet<usize>,
    /// Nodes holding the function entry.
    pub heads: BTreeSet<usize>,
}

impl FunctionGraph {
    pub fn from_function(function: &Function) -> Self {
        Self {
            func_id: function.id,
            head: function.first,
            nodes: function.body.clone(),
            edges: function.intra_edges.clone(),
            members: BTreeMap::new(),
            loop_related: BTreeSet::new(),
            heads: BTreeSet::from([function.first]),
        }
    }

    /// True when the entry block sits inside a cycle.
    pub fn is_recursive(&self) -> bool {
        self.heads.iter().any(|h| self.loop_related.contains(h))
    }

    /// Original blocks behind `node`.
    pub fn expand(&self, node: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            match self.members.get(&n) {
                Some(inner) => stack.extend(inner.iter().copied()),
                None => {
                    out.insert(n);
                }
            }
        }
        out
    }

    /// Every original block that belongs to a cycle.
    pub fn loop_blocks(&self) -> BTreeSet<usize> {
        self.loop_related
            .iter()
            .flat_map(|&n| self.expand(n))
            .collect()
    }
}

/// Collapses every non-trivial SCC of `graph` into a fresh node taken from `next_id`.
///
/// The result is acyclic, so compressing it again changes nothing.
pub fn compress(graph: &FunctionGraph, next_id: &mut usize) -> FunctionGraph {
    let mut g: DiGraphMap<usize, ()> = DiGraphMap::new();
    for &node in &graph.nodes {
        g.add_node(node);
    }
    for &(from, to) in &graph.edges {
        if graph.nodes.contains(&from) && graph.nodes.contains(&to) {
            g.add_edge(from, to, ());
        }
    }

    let mut out = graph.clone();
    let mut rep: BTreeMap<usize, usize> = BTreeMap::new();
    let mut components = tarjan_scc(&g);
    for component in &mut components {
        component.sort_unstable();
    }
    components.sort();

    for component in components {
        let trivial = match component.as_slice() {
            [single] => !graph.edges.contains(&(*single, *single)),
            _ => false,
        };
        if trivial {
            continue;
        }

        let id = *next_id;
        *next_id += 1;
        let members: BTreeSet<usize> = component.iter().copied().collect();
        tracing::trace!(
            func = graph.func_id,
            synthetic = id,
            members = members.len(),
            "collapsed strongly connected component"
        );
        for &member in &members {
            rep.insert(member, id);
            out.nodes.remove(&member);
            if out.heads.remove(&member) {
                out.heads.insert(id);
            }
        }
        out.nodes.insert(id);
        out.loop_related.insert(id);
        out.members.insert(id, members);
    }

    if rep.is_empty() {
        return out;
    }
    let lift = |n: usize| rep.get(&n).copied().unwrap_or(n);
    out.edges = graph
        .edges
        .iter()
        .map(|&(from, to)| (lift(from), lift(to)))
        .filter(|(from, to)| from != to)
        .collect();
    out
}

/// Loop facts for the whole program.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopInfo {
    pub graphs: BTreeMap<usize, FunctionGraph>,
    /// Blocks inside a cycle of some function body.
    pub loop_nodes: BTreeSet<usize>,
    /// Ids of functions whose entry is inside a cycle.
    pub recursive: BTreeSet<usize>,
    /// Ids of functions reachable through calls made from loops or recursive functions.
    pub func_call_loop_related: BTreeSet<usize>,
    /// Blocks whose paths are excluded from optimization.
    pub excluded: BTreeSet<usize>,
}

impl LoopInfo {
    #[inline]
    pub fn is_excluded(&self, offset: usize) -> bool {
        self.excluded.contains(&offset)
    }
}

/// Compresses every function and marks recursive functions on `program`.
pub fn analyze_loops(program: &mut Program) -> LoopInfo {
    let mut next_id = program.cfg.max_offset() + 1;
    let mut info = LoopInfo::default();

    for function in program.functions.values() {
        let graph = compress(&FunctionGraph::from_function(function), &mut next_id);
        info.loop_nodes.extend(graph.loop_blocks());
        if function.id != crate::program::TOP_LEVEL && graph.is_recursive() {
            tracing::warn!(
                func = function.id,
                entry = format_args!("0x{:x}", function.first),
                "recursive function detected"
            );
            info.recursive.insert(function.id);
        }
        info.graphs.insert(function.id, graph);
    }
    for id in &info.recursive {
        if let Some(function) = program.functions.get_mut(id) {
            function.recursive = true;
        }
    }

    let mut pending: Vec<usize> = program
        .callees_where(|caller| {
            info.loop_nodes.contains(&caller) || info.recursive.contains(&program.func_of(caller))
        })
        .collect();
    while let Some(id) = pending.pop() {
        if !info.func_call_loop_related.insert(id) {
            continue;
        }
        if let Some(function) = program.function(id) {
            pending.extend(program.callees_where(|caller| function.contains(caller)));
        }
    }

    info.excluded = info.loop_nodes.clone();
    for id in info.recursive.iter().chain(&info.func_call_loop_related) {
        if let Some(function) = program.function(*id) {
            info.excluded.extend(function.body.iter().copied());
        }
    }

    tracing::info!(
        loop_blocks = info.loop_nodes.len(),
        recursive = info.recursive.len(),
        called_from_loops = info.func_call_loop_related.len(),
        "loop analysis finished"
    );
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::identify_functions;
    use crate::test_support::{TWO_CALLS, repaired};

    fn graph(nodes: &[usize], edges: &[(usize, usize)], head: usize) -> FunctionGraph {
        FunctionGraph {
            func_id: 1,
            head,
            nodes: nodes.iter().copied().collect(),
            edges: edges.iter().copied().collect(),
            members: BTreeMap::new(),
            loop_related: BTreeSet::new(),
            heads: BTreeSet::from([head]),
        }
    }

    #[test]
    fn collapses_cycle_and_self_loop() {
        let g = graph(
            &[1, 2, 3, 4, 5],
            &[(1, 2), (2, 3), (3, 2), (3, 4), (4, 4), (4, 5)],
            1,
        );
        let mut next = 100;
        let out = compress(&g, &mut next);
        assert_eq!(next, 102);
        assert_eq!(out.nodes, BTreeSet::from([1, 5, 100, 101]));
        assert_eq!(out.edges, BTreeSet::from([(1, 100), (100, 101), (101, 5)]));
        assert_eq!(out.members[&100], BTreeSet::from([2, 3]));
        assert_eq!(out.members[&101], BTreeSet::from([4]));
        assert_eq!(out.loop_blocks(), BTreeSet::from([2, 3, 4]));
        assert!(!out.is_recursive());
    }

    #[test]
    fn compression_is_idempotent() {
        let g = graph(&[1, 2, 3], &[(1, 2), (2, 1), (2, 3)], 1);
        let mut next = 10;
        let once = compress(&g, &mut next);
        let twice = compress(&once, &mut next);
        assert_eq!(once, twice);
        assert_eq!(next, 11);
        assert!(once.is_recursive());
        assert_eq!(once.heads, BTreeSet::from([10]));
    }

    #[test]
    fn acyclic_program_has_no_loops() {
        let mut program = identify_functions(repaired(TWO_CALLS)).expect("functions");
        let info = analyze_loops(&mut program);
        assert!(info.loop_nodes.is_empty());
        assert!(info.recursive.is_empty());
        assert!(info.excluded.is_empty());
        assert_eq!(info.graphs.len(), 2);
    }

    #[test]
    fn callee_of_loop_is_excluded() {
        // 00: JUMPDEST PUSH1 06 PUSH1 0c JUMP   call f
        // 06: JUMPDEST PUSH1 00 JUMP             back to 00
        // 0a: INVALID INVALID
        // 0c: JUMPDEST JUMP                      f returns
        let code = [
            0x5b, 0x60, 0x06, 0x60, 0x0c, 0x56, // 00
            0x5b, 0x60, 0x00, 0x56, // 06
            0xfe, 0xfe, // 0a
            0x5b, 0x56, // 0c
        ];
        let mut program = identify_functions(repaired(&code)).expect("functions");
        let info = analyze_loops(&mut program);
        assert_eq!(info.loop_nodes, BTreeSet::from([0, 6]));
        assert_eq!(info.func_call_loop_related, BTreeSet::from([1]));
        assert_eq!(info.excluded, BTreeSet::from([0, 6, 0x0c]));
    }
}
