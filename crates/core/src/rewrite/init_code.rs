//! Constructor analysis: locate the runtime `CODECOPY`/`RETURN` pair and patch its operands.
//!
//! The constructor is simulated with a concrete stack whose entries remember the PUSH that
//! produced them, so a length change of the runtime can be written back into the exact
//! immediates the constructor uses.

use crate::{Opcode, OpcodeExt};
use crate::decoder::{Instruction, decode_bytes};
use crate::encoder::{encode, encode_immediate};
use crate::result::Error;
use revm::primitives::U256;
use std::collections::BTreeSet;

/// Stack entry tracked while simulating the constructor.
#[derive(Clone, Debug)]
struct StackEntry {
    /// Index of the PUSH that produced the value, if it was pushed verbatim.
    origin: Option<usize>,
    value: Option<U256>,
}

impl StackEntry {
    fn unknown() -> Self {
        Self {
            origin: None,
            value: None,
        }
    }

    fn as_usize(&self) -> Option<usize> {
        self.value.and_then(|v| usize::try_from(v).ok())
    }
}

/// A `CODECOPY` with resolved operands.
#[derive(Debug)]
struct CodeCopySite {
    index: usize,
    offset: StackEntry,
    size: StackEntry,
    stack_after: Vec<StackEntry>,
}

/// Parser that walks init bytecode and records rewrite points.
struct InitCodeParser {
    instructions: Vec<Instruction>,
}

impl InitCodeParser {
    fn new(bytes: &[u8]) -> Self {
        let (instructions, _) = decode_bytes(bytes, 0);
        Self { instructions }
    }

    /// Every `CODECOPY`, simulated from the closest preceding `JUMPDEST`.
    fn code_copies(&self) -> Vec<CodeCopySite> {
        let mut sites = Vec::new();
        let mut block_start = 0usize;
        for (idx, inst) in self.instructions.iter().enumerate() {
            match inst.op {
                Opcode::JUMPDEST => block_start = idx + 1,
                Opcode::CODECOPY => {
                    if let Some(site) = self.resolve_codecopy(block_start, idx) {
                        sites.push(site);
                    }
                }
                _ => {}
            }
        }
        sites
    }

    fn resolve_codecopy(&self, start: usize, target: usize) -> Option<CodeCopySite> {
        let mut stack = Vec::new();
        for idx in start..target {
            self.apply(&mut stack, idx);
        }
        let _dest = stack.pop()?;
        let offset = stack.pop()?;
        let size = stack.pop()?;
        Some(CodeCopySite {
            index: target,
            offset,
            size,
            stack_after: stack,
        })
    }

    /// Walks forward from a `CODECOPY` to the `RETURN` and collects the PUSHes feeding its size.
    fn return_size_sources(&self, site: &CodeCopySite) -> Option<BTreeSet<usize>> {
        let mut stack = site.stack_after.clone();
        for idx in site.index + 1..self.instructions.len() {
            let inst = &self.instructions[idx];
            match inst.op {
                Opcode::RETURN => {
                    let _offset = stack.pop()?;
                    let size = stack.pop()?;
                    tracing::debug!(
                        "RETURN at pc 0x{:x}: size origin={:?}",
                        inst.pc,
                        size.origin
                    );
                    return Some(size.origin.into_iter().collect());
                }
                Opcode::JUMP | Opcode::JUMPI | Opcode::JUMPDEST => return None,
                op if crate::is_terminal_opcode(op) => return None,
                _ => self.apply(&mut stack, idx),
            }
        }
        None
    }

    /// Apply a single opcode to the simulated stack.
    fn apply(&self, stack: &mut Vec<StackEntry>, idx: usize) {
        let inst = &self.instructions[idx];
        match inst.op {
            Opcode::PUSH0 | Opcode::PUSH(_) => stack.push(StackEntry {
                origin: Some(idx),
                value: inst.push_value(),
            }),
            Opcode::DUP(n) => {
                let depth = n as usize;
                let entry = stack
                    .len()
                    .checked_sub(depth)
                    .and_then(|i| stack.get(i).cloned())
                    .unwrap_or_else(StackEntry::unknown);
                stack.push(entry);
            }
            Opcode::SWAP(n) => {
                let depth = n as usize;
                if stack.len() > depth {
                    let top = stack.len() - 1;
                    stack.swap(top, top - depth);
                }
            }
            Opcode::RETURNDATASIZE => stack.push(StackEntry {
                origin: None,
                value: Some(U256::ZERO),
            }),
            op => {
                let (inputs, outputs) = op.stack_io();
                for _ in 0..inputs {
                    stack.pop();
                }
                for _ in 0..outputs {
                    stack.push(StackEntry::unknown());
                }
            }
        }
    }

    /// Replace the immediate bytes for a PUSH with `new_value`, keeping its width.
    fn patch_push_value(&mut self, idx: usize, new_value: usize) -> Result<(), Error> {
        let inst = self
            .instructions
            .get_mut(idx)
            .ok_or_else(|| Error::InitCode(format!("instruction index {idx} out of bounds")))?;

        match inst.op {
            Opcode::PUSH0 if new_value == 0 => {}
            Opcode::PUSH(width) => {
                let data = encode_immediate(new_value, width as usize)?;
                inst.imm = Some(hex::encode(data));
            }
            _ => {
                return Err(Error::InitCode(format!(
                    "cannot encode {} into {} at pc 0x{:x}",
                    new_value, inst.op, inst.pc
                )));
            }
        }

        tracing::debug!(
            "Patched constructor PUSH at pc 0x{:x} to value {}",
            inst.pc,
            new_value
        );
        Ok(())
    }
}

/// Returns `(offset, size)` of the first constant-operand `CODECOPY` that is followed by a
/// `RETURN` in the same block.
pub fn find_runtime_copy(bytes: &[u8]) -> Option<(usize, usize)> {
    let parser = InitCodeParser::new(bytes);
    parser.code_copies().into_iter().find_map(|site| {
        let offset = site.offset.as_usize()?;
        let size = site.size.as_usize()?;
        parser.return_size_sources(&site)?;
        Some((offset, size))
    })
}

/// Update CODECOPY/RETURN immediates so the constructor deploys `new_copy_len` bytes copied
/// from `runtime_offset`.
pub fn rewrite_init_code(
    init_code: &[u8],
    runtime_offset: usize,
    new_copy_len: usize,
) -> Result<Vec<u8>, Error> {
    let mut parser = InitCodeParser::new(init_code);

    let site = parser
        .code_copies()
        .into_iter()
        .find(|site| site.offset.as_usize() == Some(runtime_offset))
        .ok_or_else(|| Error::InitCode("no CODECOPY matched the runtime offset".into()))?;

    let size_origin = site
        .size
        .origin
        .ok_or_else(|| Error::InitCode("CODECOPY size does not originate from a PUSH".into()))?;
    let return_sources = parser
        .return_size_sources(&site)
        .ok_or_else(|| Error::InitCode("RETURN not found after CODECOPY".into()))?;
    if return_sources.is_empty() {
        return Err(Error::InitCode(
            "RETURN size does not originate from a PUSH".into(),
        ));
    }

    parser.patch_push_value(size_origin, new_copy_len)?;
    for idx in return_sources {
        parser.patch_push_value(idx, new_copy_len)?;
    }

    let patched = encode(&parser.instructions)?;
    if patched.len() != init_code.len() {
        return Err(Error::InitCode(format!(
            "constructor length changed from {} to {}",
            init_code.len(),
            patched.len()
        )));
    }
    Ok(patched)
}

#[cfg(test)]
mod tests {
    use super::{find_runtime_copy, rewrite_init_code};

    // PUSH1 0x0a DUP1 PUSH1 0x0c PUSH0 CODECOPY PUSH0 RETURN INVALID | runtime...
    const CONSTRUCTOR: [u8; 11] = [
        0x60, 0x0a, 0x80, 0x60, 0x0c, 0x5f, 0x39, 0x5f, 0xf3, 0xfe, 0x00,
    ];

    fn deployment() -> Vec<u8> {
        let mut bytes = CONSTRUCTOR.to_vec();
        bytes.push(0x00);
        bytes.extend_from_slice(&[0x5b; 10]);
        bytes
    }

    #[test]
    fn finds_runtime_copy_operands() {
        assert_eq!(find_runtime_copy(&deployment()), Some((0x0c, 0x0a)));
        assert_eq!(find_runtime_copy(&[0x60, 0x00, 0x56]), None);
    }

    #[test]
    fn patches_copy_and_return_size() {
        let init = &deployment()[..12];
        let patched = rewrite_init_code(init, 0x0c, 0x08).expect("patch");
        assert_eq!(patched[1], 0x08);
        assert_eq!(patched.len(), init.len());
        assert_eq!(find_runtime_copy(&patched), Some((0x0c, 0x08)));
    }

    #[test]
    fn rejects_unknown_offset() {
        let init = &deployment()[..12];
        assert!(rewrite_init_code(init, 0x20, 0x08).is_err());
    }
}
