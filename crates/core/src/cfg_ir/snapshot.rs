//! Serializable view of a [`Cfg`].

use super::{BasicBlock, Cfg, EdgeType};
use crate::result::Error;
use petgraph::stable_graph::StableDiGraph;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Serializable edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeSnapshot {
    pub from: usize,
    pub to: usize,
    pub kind: EdgeType,
}

/// Owned snapshot of every block and edge of a [`Cfg`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CfgSnapshot {
    pub init: usize,
    pub exit: usize,
    pub blocks: Vec<BasicBlock>,
    pub edges: Vec<EdgeSnapshot>,
}

impl Cfg {
    /// Captures blocks and edges in offset order.
    pub fn snapshot(&self) -> CfgSnapshot {
        CfgSnapshot {
            init: self.init,
            exit: self.exit,
            blocks: self.blocks().cloned().collect(),
            edges: self
                .edges()
                .into_iter()
                .map(|(from, to, kind)| EdgeSnapshot { from, to, kind })
                .collect(),
        }
    }

    /// Rebuilds a graph from a snapshot, preserving edge labels and block flags exactly.
    pub fn from_snapshot(snapshot: CfgSnapshot) -> Result<Self, Error> {
        let mut graph = StableDiGraph::new();
        let mut offset_to_node = HashMap::new();
        for block in snapshot.blocks {
            let offset = block.offset;
            if offset_to_node.insert(offset, graph.add_node(block)).is_some() {
                return Err(Error::InvalidBlockStructure(format!(
                    "duplicate block at offset 0x{offset:x} in snapshot"
                )));
            }
        }

        for edge in &snapshot.edges {
            let (Some(&a), Some(&b)) = (offset_to_node.get(&edge.from), offset_to_node.get(&edge.to))
            else {
                return Err(Error::InvalidBlockStructure(format!(
                    "snapshot edge 0x{:x} -> 0x{:x} references an unknown block",
                    edge.from, edge.to
                )));
            };
            graph.add_edge(a, b, edge.kind);
        }

        Ok(Self {
            graph,
            offset_to_node,
            init: snapshot.init,
            exit: snapshot.exit,
        })
    }
}
