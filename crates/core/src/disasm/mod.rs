//! Disassembler interface.
//!
//! A disassembler turns a deployment payload into block-level CFGs for the constructor and the
//! runtime. The JSON shape below is the exchange format of the external tool; the built-in
//! splitter produces the same shape so both paths share one loader.

mod builtin;
mod external;

pub use builtin::{BuiltinDisassembler, build_cfg_json};
pub use external::ExternalDisassembler;

use crate::HexBytes;
use crate::cfg_ir::{BasicBlock, Cfg, EXIT_KIND, JumpType};
use crate::result::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Top-level disassembler document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisassemblyReport {
    #[serde(default)]
    pub constructor_cfg: Option<CfgJson>,
    pub runtime_cfg: CfgJson,
}

/// Blocks and successor lists of one code section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgJson {
    pub nodes: Vec<NodeJson>,
    #[serde(default)]
    pub successors: Vec<SuccessorsJson>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeJson {
    pub offset: usize,
    pub length: usize,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub stack_balance: i64,
    #[serde(default)]
    pub bytecode_hex: HexBytes,
    #[serde(default)]
    pub jump_type: Option<JumpType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessorsJson {
    pub from: usize,
    pub to: Vec<usize>,
}

impl DisassemblyReport {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl CfgJson {
    /// Concatenated bytes of the non-exit nodes in offset order.
    pub fn code_bytes(&self) -> Vec<u8> {
        let mut nodes: Vec<&NodeJson> = self.nodes.iter().filter(|n| !n.is_exit()).collect();
        nodes.sort_by_key(|n| n.offset);
        nodes
            .into_iter()
            .flat_map(|n| n.bytecode_hex.iter().copied())
            .collect()
    }

    /// Builds the in-memory CFG.
    pub fn into_cfg(self) -> Result<Cfg> {
        let mut blocks = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            if node.is_exit() {
                blocks.push(BasicBlock::exit(node.offset));
                continue;
            }
            if node.bytecode_hex.len() != node.length {
                return Err(Error::InvalidBlockStructure(format!(
                    "node 0x{:x} declares length {} but carries {} bytes",
                    node.offset,
                    node.length,
                    node.bytecode_hex.len()
                )));
            }
            blocks.push(BasicBlock::new(
                node.offset,
                node.bytecode_hex.into_inner(),
                node.kind.to_ascii_lowercase(),
                node.stack_balance,
                node.jump_type,
            ));
        }

        let edges: Vec<(usize, usize)> = self
            .successors
            .iter()
            .flat_map(|s| s.to.iter().map(move |&to| (s.from, to)))
            .collect();
        let cfg = Cfg::from_blocks(blocks, &edges)?;
        cfg.check_contiguous()?;
        Ok(cfg)
    }
}

impl NodeJson {
    pub fn is_exit(&self) -> bool {
        self.kind.eq_ignore_ascii_case(EXIT_KIND)
    }
}

/// Source of block-level CFGs.
#[async_trait]
pub trait Disassembler: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Disassembles a full deployment payload (or a bare runtime).
    async fn disassemble(&self, bytecode: &[u8]) -> Result<DisassemblyReport>;
}
