//! Function-level view of a repaired CFG.

use crate::jump_edge::{CallPair, EdgeRole, JumpEdge};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sieve_core::cfg_ir::{Cfg, CfgSnapshot};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Id of the top-level code reachable from the entry block.
pub const TOP_LEVEL: usize = 0;

/// An internal function, or the top-level code when `id` is [`TOP_LEVEL`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub id: usize,
    /// Entry block offset.
    pub first: usize,
    /// Offset of the block holding the return jump.
    pub last: usize,
    pub body: BTreeSet<usize>,
    /// Edges between body blocks, call and return edges excluded.
    pub intra_edges: BTreeSet<(usize, usize)>,
    pub recursive: bool,
}

impl Function {
    #[inline]
    pub fn contains(&self, offset: usize) -> bool {
        self.body.contains(&offset)
    }

    #[inline]
    pub fn span(&self) -> usize {
        self.last.saturating_sub(self.first)
    }
}

/// A call edge together with the block control returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSite {
    pub caller: usize,
    pub return_site: usize,
    /// Function id.
    pub callee: usize,
}

/// Repaired CFG plus everything function identification learned about it.
#[derive(Debug, Clone)]
pub struct Program {
    pub cfg: Cfg,
    pub functions: BTreeMap<usize, Function>,
    pub jump_edges: Vec<JumpEdge>,
    pub pairs: Vec<CallPair>,
    pub call_sites: BTreeSet<CallSite>,
    func_of: BTreeMap<usize, usize>,
    roles: HashMap<(usize, usize), EdgeRole>,
}

impl Program {
    pub fn new(
        cfg: Cfg,
        functions: BTreeMap<usize, Function>,
        jump_edges: Vec<JumpEdge>,
        pairs: Vec<CallPair>,
        call_sites: BTreeSet<CallSite>,
    ) -> Self {
        let roles = jump_edges.iter().map(|e| (e.key(), e.role())).collect();

        // Smallest enclosing function wins.
        let mut by_span: Vec<&Function> = functions.values().collect();
        by_span.sort_by_key(|f| std::cmp::Reverse((f.span(), f.body.len())));
        let mut func_of = BTreeMap::new();
        for function in by_span {
            for &node in &function.body {
                func_of.insert(node, function.id);
            }
        }

        Self {
            cfg,
            functions,
            jump_edges,
            pairs,
            call_sites,
            func_of,
            roles,
        }
    }

    /// Function a block belongs to, [`TOP_LEVEL`] for blocks outside every body.
    pub fn func_of(&self, offset: usize) -> usize {
        self.func_of.get(&offset).copied().unwrap_or(TOP_LEVEL)
    }

    /// How the jump `from -> to` is taken.
    pub fn role(&self, from: usize, to: usize) -> EdgeRole {
        self.roles.get(&(from, to)).copied().unwrap_or(EdgeRole::Plain)
    }

    pub fn function(&self, id: usize) -> Option<&Function> {
        self.functions.get(&id)
    }

    /// The internal function entered at `entry`.
    pub fn function_at(&self, entry: usize) -> Option<&Function> {
        self.functions
            .values()
            .find(|f| f.id != TOP_LEVEL && f.first == entry)
    }

    /// Internal functions, top-level code excluded.
    pub fn internal_functions(&self) -> impl Iterator<Item = &Function> + '_ {
        self.functions.values().filter(|f| f.id != TOP_LEVEL)
    }

    /// Callees of call sites whose caller block satisfies `pred`.
    pub fn callees_where<'a>(
        &'a self,
        pred: impl Fn(usize) -> bool + 'a,
    ) -> impl Iterator<Item = usize> + 'a {
        self.call_sites
            .iter()
            .filter(move |site| pred(site.caller))
            .map(|site| site.callee)
    }

    pub fn snapshot(&self) -> ProgramSnapshot {
        ProgramSnapshot {
            cfg: self.cfg.snapshot(),
            functions: self.functions.values().cloned().collect(),
            jump_edges: self.jump_edges.clone(),
            pairs: self.pairs.clone(),
            call_sites: self.call_sites.iter().copied().collect(),
        }
    }

    pub fn from_snapshot(snapshot: ProgramSnapshot) -> Result<Self> {
        let cfg = Cfg::from_snapshot(snapshot.cfg)?;
        let mut functions = BTreeMap::new();
        for function in snapshot.functions {
            let id = function.id;
            if functions.insert(id, function).is_some() {
                return Err(Error::Structural(format!(
                    "duplicate function id {id} in snapshot"
                )));
            }
        }
        Ok(Self::new(
            cfg,
            functions,
            snapshot.jump_edges,
            snapshot.pairs,
            snapshot.call_sites.into_iter().collect(),
        ))
    }
}

/// Serializable form of a [`Program`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgramSnapshot {
    pub cfg: CfgSnapshot,
    pub functions: Vec<Function>,
    pub jump_edges: Vec<JumpEdge>,
    pub pairs: Vec<CallPair>,
    pub call_sites: Vec<CallSite>,
}
