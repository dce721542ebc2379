//! Whole-pipeline scenarios on hand-assembled runtimes: one contract per control-flow shape the
//! optimizer has to get right.

use color_eyre::Result;
use sieve_analysis::{
    AbortReason, Analysis, AnalysisConfig, EdgeRole, PathConfig, analyze, generate_paths,
};
use sieve_cli::{Optimization, OptimizationResult, OptimizerConfig, SkipReason, optimize_cfg};
use sieve_core::Opcode::*;
use sieve_core::disasm::build_cfg_json;
use sieve_tests::Asm;
use sieve_verification::{InvalidStatus, InvalidVerdict};

fn analyzed(code: &[u8]) -> Result<Analysis> {
    let cfg = build_cfg_json(code).into_cfg()?;
    Ok(analyze(cfg, &AnalysisConfig::default())?)
}

fn optimized(code: &[u8]) -> Result<Optimization> {
    let cfg = build_cfg_json(code).into_cfg()?;
    Ok(optimize_cfg(code, cfg, &OptimizerConfig::default(), false)?)
}

fn verdict(out: &Optimization, offset: usize) -> &InvalidVerdict {
    out.invalids
        .iter()
        .find(|v| v.offset == offset)
        .unwrap_or_else(|| panic!("no verdict for 0x{offset:x}"))
}

/// `f` asserts `4 == 4` before returning, so its `INVALID` is dead.
fn constant_assert() -> Asm {
    Asm::new()
        .push_label("r")
        .push_label("f")
        .op(JUMP)
        .label("r")
        .op(STOP)
        .label("f")
        .push(4)
        .push(4)
        .op(EQ)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(JUMP)
}

#[test]
fn constant_assert_is_elided() -> Result<()> {
    let asm = constant_assert();
    let code = asm.assemble();
    let invalid = asm.offset("ok") - 1;

    let out = optimized(&code)?;
    assert_eq!(verdict(&out, invalid).status, InvalidStatus::Optimizable);
    let OptimizationResult::Rewritten {
        bytecode,
        elided,
        removed_bytes,
    } = out.result
    else {
        panic!("expected a rewrite, got {:?}", out.result);
    };
    assert_eq!(elided, vec![invalid]);
    assert_eq!(removed_bytes, 1);
    assert_eq!(bytecode.len(), code.len() - 1);
    assert!(!bytecode.contains(&INVALID.to_byte()));

    // The rewritten runtime is still well formed and has nothing left to remove.
    let again = analyzed(&bytecode)?;
    assert!(again.paths.paths.is_empty());
    assert!(again.repair.all_healed());
    Ok(())
}

#[test]
fn calldata_guard_keeps_invalid() -> Result<()> {
    let asm = Asm::new()
        .push(0)
        .op(CALLDATALOAD)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(STOP);
    let code = asm.assemble();

    let out = optimized(&code)?;
    let v = verdict(&out, asm.offset("ok") - 1);
    assert_eq!(v.status, InvalidStatus::Reachable);
    assert_eq!(v.paths, 1);
    assert_eq!(
        out.result,
        OptimizationResult::Rewritten {
            bytecode: code,
            elided: Vec::new(),
            removed_bytes: 0,
        }
    );
    Ok(())
}

/// `f` is called from two sites and halts on `INVALID` unless calldata is non-zero.
fn shared_callee() -> Asm {
    Asm::new()
        .push_label("r1")
        .push_label("f")
        .op(JUMP)
        .label("r1")
        .push_label("r2")
        .push_label("f")
        .op(JUMP)
        .label("r2")
        .op(STOP)
        .label("f")
        .push(0)
        .op(CALLDATALOAD)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(JUMP)
}

#[test]
fn shared_callee_has_one_context_per_call_site() -> Result<()> {
    let asm = shared_callee();
    let code = asm.assemble();
    let invalid = asm.offset("ok") - 1;

    let analysis = analyzed(&code)?;
    assert_eq!(analysis.program.internal_functions().count(), 1);
    assert_eq!(analysis.program.call_sites.len(), 2);
    assert_eq!(analysis.paths.paths_to(invalid).count(), 2);
    let contexts: Vec<&String> = analysis.paths.by_invalid[&invalid].keys().collect();
    assert_eq!(contexts, vec!["[1,1]", "[1]"]);

    let out = optimized(&code)?;
    let v = verdict(&out, invalid);
    assert_eq!(v.status, InvalidStatus::Reachable);
    assert_eq!((v.paths, v.contexts), (2, 2));
    Ok(())
}

#[test]
fn invalid_behind_loop_is_kept() -> Result<()> {
    let asm = Asm::new()
        .push_label("r")
        .push_label("f")
        .op(JUMP)
        .label("r")
        .op(STOP)
        .label("f")
        .label("l")
        .push(0)
        .op(CALLDATALOAD)
        .push_label("l")
        .op(JUMPI)
        .push(0x20)
        .op(CALLDATALOAD)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(JUMP);
    let code = asm.assemble();
    let invalid = asm.offset("ok") - 1;

    let analysis = analyzed(&code)?;
    assert!(analysis.loops.loop_nodes.contains(&asm.offset("l")));
    assert!(analysis.loops.recursive.is_empty());

    let out = optimized(&code)?;
    assert_eq!(verdict(&out, invalid).status, InvalidStatus::LoopRelated);
    match out.result {
        OptimizationResult::Rewritten { elided, .. } => assert!(elided.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[test]
fn self_recursive_function_is_kept() -> Result<()> {
    let asm = Asm::new()
        .push_label("r")
        .push_label("f")
        .op(JUMP)
        .label("r")
        .op(STOP)
        .label("f")
        .push(0)
        .op(CALLDATALOAD)
        .push_label("g")
        .op(JUMPI)
        .push_label("f")
        .op(JUMP)
        .label("g")
        .push(4)
        .push(4)
        .op(EQ)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(JUMP);
    let code = asm.assemble();
    let invalid = asm.offset("ok") - 1;

    let analysis = analyzed(&code)?;
    assert_eq!(analysis.loops.recursive.iter().copied().collect::<Vec<_>>(), vec![1]);
    assert!(analysis.loops.is_excluded(invalid));

    // The assert is constant, but recursion rules the block out before any solving.
    let out = optimized(&code)?;
    assert_eq!(verdict(&out, invalid).status, InvalidStatus::Recursive);
    assert_eq!(out.result.exit_code(), 0);
    Ok(())
}

/// `a` calls `b` and `b` may call `a` again.
fn mutual_recursion() -> Asm {
    Asm::new()
        .push_label("r")
        .push_label("a")
        .op(JUMP)
        .label("r")
        .op(STOP)
        .label("a")
        .push_label("ra")
        .push_label("b")
        .op(JUMP)
        .label("ra")
        .op(JUMP)
        .label("b")
        .push(0)
        .op(CALLDATALOAD)
        .push_label("rb")
        .op(JUMPI)
        .push_label("rb")
        .push_label("a")
        .op(JUMP)
        .label("rb")
        .op(JUMP)
}

#[test]
fn mutual_recursion_is_skipped() -> Result<()> {
    let asm = mutual_recursion();
    let code = asm.assemble();

    let mut cfg = build_cfg_json(&code).into_cfg()?;
    let report = sieve_analysis::repair(&mut cfg, 10_000)?;
    assert!(!report.budget_exhausted);
    assert!(report.all_healed());
    assert!(cfg.has_edge(asm.offset("ra"), asm.offset("rb")));

    let err = analyze(cfg, &AnalysisConfig::default()).expect_err("cyclic call chain");
    assert_eq!(err.abort_reason(), Some(AbortReason::CyclicCallChain));

    let out = optimized(&code)?;
    assert_eq!(out.result.skip_reason(), Some(SkipReason::CyclicCallChain));
    assert_eq!(out.result.exit_code(), 12);
    assert!(out.invalids.is_empty());
    Ok(())
}

#[test]
fn contract_without_invalid_is_unchanged() -> Result<()> {
    let code = Asm::new()
        .push(1)
        .push(0)
        .op(SSTORE)
        .op(STOP)
        .assemble();

    let analysis = analyzed(&code)?;
    assert!(analysis.paths.paths.is_empty());

    let out = optimized(&code)?;
    assert!(out.invalids.is_empty());
    assert_eq!(
        out.result,
        OptimizationResult::Rewritten {
            bytecode: code,
            elided: Vec::new(),
            removed_bytes: 0,
        }
    );
    Ok(())
}

#[test]
fn only_dead_asserts_are_removed() -> Result<()> {
    // A constant assert next to a guarded one: exactly one block goes.
    let asm = Asm::new()
        .push(1)
        .push_label("a")
        .op(JUMPI)
        .op(INVALID)
        .label("a")
        .push(0)
        .op(CALLDATALOAD)
        .push_label("b")
        .op(JUMPI)
        .op(INVALID)
        .label("b")
        .op(STOP);
    let code = asm.assemble();
    let dead = asm.offset("a") - 1;
    let live = asm.offset("b") - 1;

    let out = optimized(&code)?;
    assert_eq!(verdict(&out, dead).status, InvalidStatus::Optimizable);
    assert_eq!(verdict(&out, live).status, InvalidStatus::Reachable);
    let OptimizationResult::Rewritten { bytecode, elided, .. } = out.result else {
        panic!("expected a rewrite");
    };
    assert_eq!(elided, vec![dead]);
    assert_eq!(
        bytecode.iter().filter(|b| **b == INVALID.to_byte()).count(),
        1
    );
    Ok(())
}

/// `f` is called twice from top level before a guarded `INVALID`, so every path to it crosses
/// both returns.
fn two_calls_then_guard() -> Asm {
    Asm::new()
        .push_label("r1")
        .push_label("f")
        .op(JUMP)
        .label("r1")
        .push_label("r2")
        .push_label("f")
        .op(JUMP)
        .label("r2")
        .push(0)
        .op(CALLDATALOAD)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(STOP)
        .label("f")
        .op(JUMP)
}

/// Replays each path's call and return edges: every return lands on the address its matching
/// call pushed.
fn assert_returns_balanced(analysis: &Analysis) {
    let program = &analysis.program;
    for path in &analysis.paths.paths {
        let mut pending = Vec::new();
        for hop in path.nodes.windows(2) {
            let (from, to) = (hop[0], hop[1]);
            match program.role(from, to) {
                EdgeRole::Call => {
                    let edge = program
                        .jump_edges
                        .iter()
                        .find(|e| e.key() == (from, to))
                        .unwrap_or_else(|| panic!("no jump edge 0x{from:x} -> 0x{to:x}"));
                    pending.push(edge.return_address());
                }
                EdgeRole::Return => {
                    assert_eq!(pending.pop(), Some(to), "path {} returns to 0x{to:x}", path.id)
                }
                EdgeRole::Plain => {}
            }
        }
    }
}

#[test]
fn returns_match_their_calls() -> Result<()> {
    let asm = two_calls_then_guard();
    let code = asm.assemble();
    let invalid = asm.offset("ok") - 1;

    let analysis = analyzed(&code)?;
    assert_eq!(analysis.program.call_sites.len(), 2);
    // Only the path through r1 then r2 exists, no return ever crosses over.
    let paths: Vec<_> = analysis.paths.paths_to(invalid).collect();
    assert_eq!(paths.len(), 1);
    let f = asm.offset("f");
    assert_eq!(paths[0].nodes.iter().filter(|n| **n == f).count(), 2);
    assert_returns_balanced(&analysis);

    let shared = analyzed(&shared_callee().assemble())?;
    assert_eq!(shared.paths.paths.len(), 2);
    assert_returns_balanced(&shared);

    let out = optimized(&code)?;
    assert_eq!(verdict(&out, invalid).status, InvalidStatus::Reachable);
    Ok(())
}

#[test]
fn path_generation_is_deterministic() -> Result<()> {
    for code in [
        two_calls_then_guard().assemble(),
        shared_callee().assemble(),
        constant_assert().assemble(),
    ] {
        let first = analyzed(&code)?;
        let second = analyzed(&code)?;
        assert_eq!(first.paths, second.paths);

        let again = generate_paths(&first.program, &first.loops, PathConfig::default())?;
        assert_eq!(again.paths, first.paths.paths);
        assert_eq!(again.by_invalid, first.paths.by_invalid);
    }
    Ok(())
}

#[test]
fn memory_reread_after_partial_overwrite_keeps_invalid() -> Result<()> {
    // The second read of mem[0..32] sees calldata in its low half.
    let asm = Asm::new()
        .push(0)
        .op(MLOAD)
        .push(0)
        .op(CALLDATALOAD)
        .push(0x10)
        .op(MSTORE)
        .push(0)
        .op(MLOAD)
        .op(EQ)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(STOP);
    let code = asm.assemble();

    let out = optimized(&code)?;
    assert_eq!(verdict(&out, asm.offset("ok") - 1).status, InvalidStatus::Reachable);
    assert_eq!(out.result.exit_code(), 0);
    match out.result {
        OptimizationResult::Rewritten { elided, .. } => assert!(elided.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}

#[test]
fn storage_reread_after_possible_alias_keeps_invalid() -> Result<()> {
    // storage[x] is read, slot 1 is written, storage[x] is read again; x may be 1.
    let asm = Asm::new()
        .push(0)
        .op(CALLDATALOAD)
        .op(SLOAD)
        .push(5)
        .push(1)
        .op(SSTORE)
        .push(0)
        .op(CALLDATALOAD)
        .op(SLOAD)
        .op(EQ)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(STOP);
    let code = asm.assemble();

    let out = optimized(&code)?;
    assert_eq!(verdict(&out, asm.offset("ok") - 1).status, InvalidStatus::Reachable);
    match out.result {
        OptimizationResult::Rewritten { elided, .. } => assert!(elided.is_empty()),
        other => panic!("unexpected {other:?}"),
    }
    Ok(())
}
