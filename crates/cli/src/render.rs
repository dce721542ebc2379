//! Graphviz export of the repaired CFG and of the compressed function graphs.

use sieve_analysis::{FunctionGraph, Program};
use sieve_core::cfg_ir::{Cfg, EdgeType};

/// A rendered graph and the file stem it should be written under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DotGraph {
    pub name: String,
    pub dot: String,
}

fn edge_label(kind: EdgeType) -> &'static str {
    match kind {
        EdgeType::Fallthrough => "Fallthrough",
        EdgeType::Jump => "Jump",
        EdgeType::BranchTrue => "BranchTrue",
        EdgeType::BranchFalse => "BranchFalse",
        EdgeType::Exit => "Exit",
        EdgeType::Repaired => "Repaired",
        EdgeType::Shortcut => "Shortcut",
    }
}

/// Renders every block with its instructions, and every edge labelled with its kind.
pub fn cfg_dot(cfg: &Cfg) -> String {
    let mut dot = String::from("digraph CFG {\n    node [shape=box fontname=monospace];\n");
    for block in cfg.blocks() {
        let label = if block.is_exit() {
            "Exit".to_string()
        } else {
            let instrs: Vec<String> = block.instructions.iter().map(|i| i.to_string()).collect();
            format!("Block_0x{:x}\\l{}\\l", block.offset, instrs.join("\\l"))
        };
        let style = if block.is_invalid { " color=red" } else { "" };
        dot.push_str(&format!("    n{} [label=\"{label}\"{style}];\n", block.offset));
    }
    for (from, to, kind) in cfg.edges() {
        dot.push_str(&format!("    n{from} -> n{to} [label=\"{}\"];\n", edge_label(kind)));
    }
    dot.push_str("}\n");
    dot
}

/// Renders a compressed function graph. Synthetic loop nodes list the blocks they absorbed.
pub fn function_dot(graph: &FunctionGraph) -> String {
    let mut dot = format!("digraph F{} {{\n    node [shape=box];\n", graph.func_id);
    for &node in &graph.nodes {
        let label = match graph.members.get(&node) {
            Some(_) => {
                let blocks: Vec<String> = graph
                    .expand(node)
                    .iter()
                    .map(|b| format!("0x{b:x}"))
                    .collect();
                format!("loop {node}\\n{}", blocks.join(" "))
            }
            None => format!("0x{node:x}"),
        };
        let mut attrs = String::new();
        if graph.loop_related.contains(&node) {
            attrs.push_str(" style=dashed");
        }
        if graph.heads.contains(&node) {
            attrs.push_str(" peripheries=2");
        }
        dot.push_str(&format!("    n{node} [label=\"{label}\"{attrs}];\n"));
    }
    for (from, to) in &graph.edges {
        dot.push_str(&format!("    n{from} -> n{to};\n"));
    }
    dot.push_str("}\n");
    dot
}

/// The repaired CFG plus one graph per function.
pub fn render_all(program: &Program, graphs: impl IntoIterator<Item = FunctionGraph>) -> Vec<DotGraph> {
    let mut out = vec![DotGraph {
        name: "cfg".into(),
        dot: cfg_dot(&program.cfg),
    }];
    out.extend(graphs.into_iter().map(|graph| DotGraph {
        name: format!("func_{}", graph.func_id),
        dot: function_dot(&graph),
    }));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use sieve_analysis::{AnalysisConfig, analyze};
    use sieve_core::disasm::build_cfg_json;

    #[test]
    fn labels_edges_and_invalid_blocks() {
        // PUSH1 04 JUMP INVALID JUMPDEST STOP
        let cfg = build_cfg_json(&[0x60, 0x04, 0x56, 0xfe, 0x5b, 0x00])
            .into_cfg()
            .unwrap();
        let dot = cfg_dot(&cfg);
        assert!(dot.starts_with("digraph CFG {"));
        assert!(dot.contains("n0 -> n4 [label=\"Jump\"]"));
        assert!(dot.contains("n3 [label=\"Block_0x3"));
        assert!(dot.contains("color=red"));
        assert!(dot.contains("[label=\"Exit\"]"));
        // One statement per line, closed by the brace.
        assert!(dot.lines().skip(2).all(|l| l.ends_with(';') || l == "}"));
        assert!(dot.ends_with("}\n"));
    }

    #[test]
    fn loop_nodes_are_expanded() {
        // 00: JUMPDEST PUSH1 00 JUMP
        let cfg = build_cfg_json(&[0x5b, 0x60, 0x00, 0x56]).into_cfg().unwrap();
        let analysis = analyze(cfg, &AnalysisConfig::default()).unwrap();
        let graphs = render_all(&analysis.program, analysis.loops.graphs.into_values());
        assert_eq!(graphs.len(), 2);
        assert_eq!(graphs[1].name, "func_0");
        assert!(graphs[1].dot.contains("loop 5\\n0x0"));
        assert!(graphs[1].dot.contains("style=dashed peripheries=2"));
    }
}
