pub mod cfg_ir;
pub mod decoder;
pub mod detection;
pub mod disasm;
pub mod encoder;
pub mod hex_bytes;
pub mod interp;
pub mod opcode;
pub mod result;
pub mod rewrite;

pub use hex_bytes::HexBytes;
pub use opcode::{Opcode, OpcodeExt};
pub use result::{Error, Result};

use std::path::Path;

/// Returns true if the opcode terminates execution.
///
/// Terminal opcodes are those that end the execution of a program or transaction,
/// such as STOP, RETURN, REVERT, SELFDESTRUCT, and INVALID. Unassigned bytes halt like
/// INVALID and are terminal as well.
#[inline]
pub fn is_terminal_opcode(opcode: Opcode) -> bool {
    matches!(
        opcode,
        Opcode::STOP | Opcode::RETURN | Opcode::REVERT | Opcode::SELFDESTRUCT | Opcode::INVALID
    ) || opcode.is_unassigned()
}

/// Returns true if the opcode ends a basic block.
///
/// Block-ending opcodes include terminal opcodes as well as control flow opcodes
/// like JUMP and JUMPI that transfer control to different parts of the program.
#[inline]
pub fn is_block_ending_opcode(opcode: Opcode) -> bool {
    is_terminal_opcode(opcode) || matches!(opcode, Opcode::JUMP | Opcode::JUMPI)
}

/// Strips an optional `0x` prefix and whitespace, lowercases, and rejects odd lengths.
pub fn normalize_hex_string(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let normalized: String = body
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if normalized.len() % 2 != 0 {
        return Err(Error::OddLength(normalized.len()));
    }
    Ok(normalized)
}

/// Reads bytecode from a hex string or, when `is_file` is set, from a file holding hex.
pub fn input_to_bytes(input: &str, is_file: bool) -> Result<Vec<u8>> {
    let text = if is_file {
        std::fs::read_to_string(Path::new(input)).map_err(|source| Error::FileRead {
            path: input.to_string(),
            source,
        })?
    } else {
        input.to_string()
    };
    let normalized = normalize_hex_string(&text)?;
    Ok(hex::decode(normalized)?)
}

#[cfg(test)]
mod tests {
    use super::{Opcode, is_block_ending_opcode, normalize_hex_string};
    use crate::Error;

    #[test]
    fn normalizes_prefix_case_and_whitespace() {
        assert_eq!(normalize_hex_string(" 0xAB cd\n").unwrap(), "abcd");
        assert!(matches!(normalize_hex_string("abc"), Err(Error::OddLength(3))));
    }

    #[test]
    fn block_enders() {
        assert!(is_block_ending_opcode(Opcode::JUMPI));
        assert!(is_block_ending_opcode(Opcode::UNKNOWN(0x0c)));
        assert!(!is_block_ending_opcode(Opcode::JUMPDEST));
    }
}
