//! Shared fixtures for unit tests.

use sieve_core::cfg_ir::Cfg;
use sieve_core::disasm::build_cfg_json;

/// One function called from two sites.
///
/// ```text
/// 00: PUSH1 05 PUSH1 0d JUMP        call f, return to 05
/// 05: JUMPDEST PUSH1 0b PUSH1 0d JUMP call f, return to 0b
/// 0b: JUMPDEST INVALID
/// 0d: JUMPDEST JUMP                 f: return
/// ```
pub(crate) const TWO_CALLS: &[u8] = &[
    0x60, 0x05, 0x60, 0x0d, 0x56, // 00
    0x5b, 0x60, 0x0b, 0x60, 0x0d, 0x56, // 05
    0x5b, 0xfe, // 0b
    0x5b, 0x56, // 0d
];

/// Disassembles `code` with the built-in splitter and runs the repair pass.
pub(crate) fn repaired(code: &[u8]) -> Cfg {
    let mut cfg = build_cfg_json(code).into_cfg().expect("cfg");
    crate::repair::repair(&mut cfg, 10_000).expect("repair");
    cfg
}
