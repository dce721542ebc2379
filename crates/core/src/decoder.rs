//! Linear-sweep decoding of raw bytes into an instruction stream.

use crate::result::Error;
use crate::{Opcode, OpcodeExt};
use revm::primitives::U256;
use serde::{Deserialize, Serialize};
use std::fmt;
use tiny_keccak::{Hasher, Keccak};

/// Single disassembled EVM instruction with PC, opcode, and optional immediate data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Program counter (byte offset)
    pub pc: usize,
    /// Parsed opcode
    pub op: Opcode,
    /// Immediate data (hex string without 0x prefix)
    pub imm: Option<String>,
}

/// Decoded bytecode metadata (length, hash, truncation).
#[derive(Debug, Clone)]
pub struct DecodeInfo {
    /// Bytecode length in bytes
    pub byte_length: usize,
    /// Keccak-256 hash
    pub keccak_hash: [u8; 32],
    /// PC of a trailing PUSH whose immediate runs past the end of the code.
    pub truncated_push: Option<usize>,
}

/// Decodes `bytes` into instructions, numbering PCs from `base_pc`.
///
/// A trailing PUSH whose immediate is cut off is kept with its immediate zero-padded on the
/// right, matching how the EVM reads past the end of code.
pub fn decode_bytes(bytes: &[u8], base_pc: usize) -> (Vec<Instruction>, DecodeInfo) {
    let mut instructions = Vec::with_capacity(bytes.len());
    let mut truncated_push = None;
    let mut idx = 0usize;

    while idx < bytes.len() {
        let op = Opcode::parse(bytes[idx]).0;
        let width = op.immediate_size();
        let imm = if width > 0 {
            let start = idx + 1;
            let end = (start + width).min(bytes.len());
            let mut data = bytes[start..end].to_vec();
            if data.len() < width {
                tracing::warn!(
                    pc = format_args!("0x{:x}", base_pc + idx),
                    have = data.len(),
                    need = width,
                    "truncated PUSH immediate at end of code"
                );
                truncated_push = Some(base_pc + idx);
                data.resize(width, 0);
            }
            Some(hex::encode(data))
        } else {
            None
        };

        if let Opcode::UNKNOWN(byte) = op {
            tracing::debug!(
                "Unknown opcode byte 0x{:02x} at PC 0x{:x}",
                byte,
                base_pc + idx
            );
        }

        instructions.push(Instruction {
            pc: base_pc + idx,
            op,
            imm,
        });
        idx += 1 + width;
    }

    let mut keccak = Keccak::v256();
    keccak.update(bytes);
    let mut hash = [0u8; 32];
    keccak.finalize(&mut hash);

    (
        instructions,
        DecodeInfo {
            byte_length: bytes.len(),
            keccak_hash: hash,
            truncated_push,
        },
    )
}

/// Decodes a hex string (with or without `0x`) starting at PC 0.
pub fn decode_hex(input: &str) -> Result<(Vec<Instruction>, DecodeInfo, Vec<u8>), Error> {
    let normalized = crate::normalize_hex_string(input)?;
    let bytes = hex::decode(&normalized)?;
    let (instructions, info) = decode_bytes(&bytes, 0);
    Ok((instructions, info, bytes))
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // pc: six-digit hex, opcode left-padded to 8 chars, then optional imm
        if let Some(immediate) = &self.imm {
            write!(f, "{:06x}  {:<8} {}", self.pc, self.op, immediate)
        } else {
            write!(f, "{:06x}  {}", self.pc, self.op)
        }
    }
}

impl Instruction {
    /// Returns the byte size of this instruction (1 for most opcodes, 1+N for PUSH(N)).
    #[inline]
    pub fn byte_size(&self) -> usize {
        1 + self.op.immediate_size()
    }

    /// Value pushed by a PUSH instruction, `None` for anything else.
    pub fn push_value(&self) -> Option<U256> {
        match self.op {
            Opcode::PUSH0 => Some(U256::ZERO),
            Opcode::PUSH(_) => {
                let bytes = hex::decode(self.imm.as_deref()?).ok()?;
                Some(U256::from_be_slice(&bytes))
            }
            _ => None,
        }
    }

    /// Raw immediate bytes, empty when the instruction has none.
    pub fn immediate_bytes(&self) -> Vec<u8> {
        self.imm
            .as_deref()
            .and_then(|imm| hex::decode(imm).ok())
            .unwrap_or_default()
    }
}
