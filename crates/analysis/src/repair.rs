//! CFG repair.
//!
//! Disassemblers resolve only jumps whose destination is pushed right before the jump. Jumps
//! through return addresses or function pointers are left dangling: the target block has no
//! predecessor, and the jumping block points at the exit node. This pass walks the graph from
//! the entry with a [`TagStack`] and reconnects such jumps to the destinations the stack
//! resolves.

use crate::Result;
use sieve_core::cfg_ir::{Cfg, EdgeType, JumpType};
use sieve_core::interp::TagStack;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::rc::Rc;

/// Outcome of [`repair`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// Edges added, in discovery order.
    pub added: Vec<(usize, usize)>,
    /// Blocks whose spurious edge to the exit node was removed.
    pub healed: Vec<usize>,
    pub orphans_before: Vec<usize>,
    pub orphans_after: Vec<usize>,
    pub visits: usize,
    pub budget_exhausted: bool,
}

impl RepairReport {
    /// True if every orphan gained an inbound edge.
    pub fn all_healed(&self) -> bool {
        self.orphans_after.is_empty()
    }
}

/// Restores missing jump edges. Best effort: orphans that stay unreachable are reported, not
/// rejected.
pub fn repair(cfg: &mut Cfg, visit_budget: usize) -> Result<RepairReport> {
    let mut report = RepairReport {
        orphans_before: cfg.orphans(),
        ..Default::default()
    };
    let jumpdests = Rc::new(cfg.jumpdests());
    let mut orphans: BTreeSet<usize> = report.orphans_before.iter().copied().collect();
    let unresolved: BTreeSet<usize> = cfg
        .blocks()
        .filter(|b| matches!(b.jump_type, JumpType::Unconditional | JumpType::Conditional))
        .filter(|b| cfg.has_edge(b.offset, cfg.exit))
        .map(|b| b.offset)
        .collect();

    let mut seen: HashSet<(usize, Vec<usize>)> = HashSet::new();
    let mut work = vec![(cfg.init, TagStack::new(jumpdests.clone()))];

    while let Some((node, mut tags)) = work.pop() {
        if node == cfg.exit || !seen.insert((node, visit_key(&tags))) {
            continue;
        }
        if report.visits >= visit_budget {
            report.budget_exhausted = true;
            tracing::warn!(
                budget = visit_budget,
                "repair visit budget exhausted, remaining blocks are left as disassembled"
            );
            break;
        }
        report.visits += 1;

        let Some(block) = cfg.block(node) else {
            continue;
        };
        let jump_type = block.jump_type;
        let fallthrough = block.fallthrough();
        let instructions = block.instructions.clone();

        let Some((last, body)) = instructions.split_last() else {
            continue;
        };
        for ins in body {
            tags.step(ins, node);
        }
        let target = tags.top().and_then(|item| item.as_offset());
        tags.step(last, node);

        match jump_type {
            JumpType::Unconditional | JumpType::Conditional => {
                if let Some(target) = target.filter(|t| jumpdests.contains(t)) {
                    let open = unresolved.contains(&node);
                    connect(cfg, node, target, open, &mut orphans, &mut report)?;
                    work.push((target, tags.clone()));
                }
                if jump_type == JumpType::Conditional {
                    work.push((fallthrough, tags));
                }
            }
            JumpType::Fall => work.push((fallthrough, tags)),
            JumpType::Terminal => {}
        }
    }

    report.orphans_after = cfg.orphans();
    if report.orphans_after.is_empty() {
        tracing::info!(added = report.added.len(), "CFG repair healed every orphan");
    } else {
        tracing::warn!(
            added = report.added.len(),
            remaining = report.orphans_after.len(),
            "orphan blocks remain after CFG repair"
        );
    }
    Ok(report)
}

/// Jump addresses on the stack, top first, each kept once. Recursive call chains push the same
/// return addresses over and over; collapsing repeats keeps the walk finite.
fn visit_key(tags: &TagStack) -> Vec<usize> {
    let mut seen = HashSet::new();
    tags.fingerprint()
        .into_iter()
        .filter(|addr| seen.insert(*addr))
        .collect()
}

/// Adds `node -> target` when the jump was unresolved or `target` is still an orphan.
fn connect(
    cfg: &mut Cfg,
    node: usize,
    target: usize,
    unresolved: bool,
    orphans: &mut BTreeSet<usize>,
    report: &mut RepairReport,
) -> Result<()> {
    if cfg.has_edge(node, target) {
        return Ok(());
    }
    if !unresolved && !orphans.contains(&target) {
        return Ok(());
    }

    cfg.add_edge(node, target, EdgeType::Repaired)?;
    orphans.remove(&target);
    report.added.push((node, target));
    tracing::debug!(
        from = format_args!("0x{node:x}"),
        to = format_args!("0x{target:x}"),
        "repaired jump edge"
    );

    let exit = cfg.exit;
    if unresolved && cfg.remove_edge(node, exit) {
        report.healed.push(node);
    }
    Ok(())
}
