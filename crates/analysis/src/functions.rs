//! Function identification.
//!
//! Every matched call/return pair delimits a function: it starts at the call target and ends
//! at the block holding the return jump. While bodies are collected, each caller gets a
//! temporary shortcut edge to its return site so the walk steps over nested calls instead of
//! into them. The shortcuts are removed before the program is returned.

use crate::jump_edge::{CallPair, collect_candidates, match_pairs};
use crate::program::{CallSite, Function, Program, TOP_LEVEL};
use crate::{AbortReason, Error, Result};
use sieve_core::cfg_ir::{Cfg, EdgeType};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Identifies internal functions in a repaired CFG.
pub fn identify_functions(mut cfg: Cfg) -> Result<Program> {
    let mut jump_edges = collect_candidates(&cfg);
    let pairs = match_pairs(&mut jump_edges);

    let skipped: HashSet<(usize, usize)> = jump_edges
        .iter()
        .filter(|e| e.is_caller_edge || e.is_return_edge)
        .map(|e| e.key())
        .collect();

    let mut shortcuts = Vec::new();
    for pair in &pairs {
        let (caller, _) = pair.call;
        let (_, return_site) = pair.ret;
        if cfg.add_edge(caller, return_site, EdgeType::Shortcut)? {
            shortcuts.push((caller, return_site));
        }
    }

    let result = collect_functions(&cfg, &pairs, &skipped);

    for (from, to) in shortcuts {
        cfg.remove_edge(from, to);
    }
    let (functions, call_sites) = result?;

    tracing::info!(
        functions = functions.len() - 1,
        call_sites = call_sites.len(),
        "identified internal functions"
    );
    Ok(Program::new(cfg, functions, jump_edges, pairs, call_sites))
}

fn collect_functions(
    cfg: &Cfg,
    pairs: &[CallPair],
    skipped: &HashSet<(usize, usize)>,
) -> Result<(BTreeMap<usize, Function>, BTreeSet<CallSite>)> {
    // One function per entry; its span ends at the furthest return block.
    let mut spans: BTreeMap<usize, usize> = BTreeMap::new();
    for pair in pairs {
        let (first, last) = (pair.entry(), pair.exit_block());
        if last < first {
            return Err(Error::abort(
                AbortReason::FunctionSpanMismatch,
                format!("function at 0x{first:x} returns from 0x{last:x}, before its entry"),
            ));
        }
        let end = spans.entry(first).or_insert(last);
        *end = (*end).max(last);
    }

    let mut functions = BTreeMap::new();
    let mut ids = BTreeMap::new();
    for (idx, (&first, &last)) in spans.iter().enumerate() {
        let id = idx + 1;
        let body = walk(cfg, first, skipped, Some((first, last)));
        check_span(cfg, id, first, last, &body)?;
        let intra_edges = intra_edges(cfg, &body, skipped);
        tracing::debug!(
            id,
            first = format_args!("0x{first:x}"),
            last = format_args!("0x{last:x}"),
            blocks = body.len(),
            "function body"
        );
        ids.insert(first, id);
        functions.insert(
            id,
            Function {
                id,
                first,
                last,
                body,
                intra_edges,
                recursive: false,
            },
        );
    }

    let body = walk(cfg, cfg.init, skipped, None);
    let intra_edges = intra_edges(cfg, &body, skipped);
    functions.insert(
        TOP_LEVEL,
        Function {
            id: TOP_LEVEL,
            first: cfg.init,
            last: body.iter().next_back().copied().unwrap_or(cfg.init),
            body,
            intra_edges,
            recursive: false,
        },
    );

    let call_sites = pairs
        .iter()
        .filter_map(|pair| {
            ids.get(&pair.entry()).map(|&callee| CallSite {
                caller: pair.call.0,
                return_site: pair.ret.1,
                callee,
            })
        })
        .collect();

    Ok((functions, call_sites))
}

/// Blocks reachable from `start` without crossing call or return edges, optionally pruned to
/// offsets inside `bounds`.
fn walk(
    cfg: &Cfg,
    start: usize,
    skipped: &HashSet<(usize, usize)>,
    bounds: Option<(usize, usize)>,
) -> BTreeSet<usize> {
    let inside = |offset: usize| bounds.is_none_or(|(lo, hi)| (lo..=hi).contains(&offset));
    let mut body = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if node == cfg.exit || !inside(node) || !body.insert(node) {
            continue;
        }
        for next in cfg.successors(node) {
            if !skipped.contains(&(node, next)) {
                stack.push(next);
            }
        }
    }
    body
}

/// The body must tile `[first, last]` exactly.
fn check_span(cfg: &Cfg, id: usize, first: usize, last: usize, body: &BTreeSet<usize>) -> Result<()> {
    let covered: usize = body
        .iter()
        .filter_map(|&offset| cfg.block(offset))
        .map(|block| block.length)
        .sum();
    let expected = cfg
        .block(last)
        .map(|block| block.fallthrough() - first)
        .unwrap_or(0);
    if covered != expected || !body.contains(&last) {
        return Err(Error::abort(
            AbortReason::FunctionSpanMismatch,
            format!(
                "function {id} spans 0x{first:x}..=0x{last:x} ({expected} bytes) but its body covers {covered} bytes"
            ),
        ));
    }
    Ok(())
}

fn intra_edges(
    cfg: &Cfg,
    body: &BTreeSet<usize>,
    skipped: &HashSet<(usize, usize)>,
) -> BTreeSet<(usize, usize)> {
    body.iter()
        .flat_map(|&from| cfg.successors(from).into_iter().map(move |to| (from, to)))
        .filter(|&(from, to)| body.contains(&to) && !skipped.contains(&(from, to)))
        .collect()
}
