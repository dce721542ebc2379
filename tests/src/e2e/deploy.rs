use super::{Chain, word};
use color_eyre::Result;
use color_eyre::eyre::eyre;
use sieve_cli::{OptimizationResult, OptimizerConfig, optimize};
use sieve_core::Opcode::*;
use sieve_tests::{Asm, CONSTRUCTOR_LEN, deployment};

/// Returns `calldata[0..32] + 1`, computed by an internal function that asserts `1 != 0`.
fn increment() -> Asm {
    Asm::new()
        .push_label("r")
        .push(0)
        .op(CALLDATALOAD)
        .push_label("f")
        .op(JUMP)
        .label("r")
        .push(0)
        .op(MSTORE)
        .push(0x20)
        .push(0)
        .op(RETURN)
        .label("f")
        .push(1)
        .op(ADD)
        .push(1)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(SWAP(1))
        .op(JUMP)
}

#[tokio::test]
async fn optimized_contract_behaves_like_original() -> Result<()> {
    color_eyre::install().ok();
    let runtime = increment().assemble();
    let original = deployment(&runtime);

    let out = optimize(original.clone(), None, &OptimizerConfig::default(), false).await?;
    let OptimizationResult::Rewritten {
        bytecode, elided, ..
    } = out.result
    else {
        return Err(eyre!("optimization skipped: {:?}", out.result));
    };
    assert_eq!(elided.len(), 1);
    assert_eq!(bytecode.len(), original.len() - 1);
    // The constructor's copy length and return size follow the shorter runtime.
    assert_eq!(bytecode[1] as usize, runtime.len() - 1);
    assert_eq!(bytecode[CONSTRUCTOR_LEN..].len(), runtime.len() - 1);

    let mut chain = Chain::new();
    let (before, before_code) = chain.deploy(original)?;
    let (after, after_code) = chain.deploy(bytecode)?;
    assert_eq!(&before_code[..], runtime.as_slice());
    assert_eq!(after_code.len(), runtime.len() - 1);
    assert!(!after_code.contains(&INVALID.to_byte()));

    for input in [0u64, 41, u64::MAX] {
        let expected = chain.call(before, word(input))?;
        let actual = chain.call(after, word(input))?;
        assert_eq!(actual, expected, "input {input}");
    }
    assert_eq!(&chain.call(after, word(41))?[..], word(42).as_slice());
    Ok(())
}

#[tokio::test]
async fn reachable_assert_survives_deployment() -> Result<()> {
    // Halts on INVALID whenever the first calldata word is zero.
    let runtime = Asm::new()
        .push(0)
        .op(CALLDATALOAD)
        .push_label("ok")
        .op(JUMPI)
        .op(INVALID)
        .label("ok")
        .op(STOP)
        .assemble();
    let original = deployment(&runtime);

    let out = optimize(original.clone(), None, &OptimizerConfig::default(), false).await?;
    assert_eq!(
        out.result,
        OptimizationResult::Rewritten {
            bytecode: original.clone(),
            elided: Vec::new(),
            removed_bytes: 0,
        }
    );

    let mut chain = Chain::new();
    let (address, _) = chain.deploy(original)?;
    assert!(chain.call(address, word(0)).is_err());
    assert!(chain.call(address, word(1))?.is_empty());
    Ok(())
}
