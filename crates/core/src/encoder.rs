//! Module for encoding EVM instructions back into bytecode.

use crate::OpcodeExt;
use crate::decoder::Instruction;
use crate::result::Error;

/// Encodes a sequence of EVM instructions into bytecode.
///
/// Immediates must match the width of their PUSH opcode; a mismatch is reported as
/// [`Error::InvalidImmediate`] rather than silently re-sized.
///
/// # Examples
/// ```rust,ignore
/// use sieve_core::Opcode;
/// let ins = Instruction {
///     pc: 0,
///     op: Opcode::PUSH(1),
///     imm: Some("aa".to_string()),
/// };
/// let bytes = encode(&[ins]).unwrap();
/// assert_eq!(bytes, vec![0x60, 0xaa]);
/// ```
pub fn encode(instructions: &[Instruction]) -> Result<Vec<u8>, Error> {
    let mut bytes = Vec::with_capacity(instructions.len() * 3);

    for ins in instructions {
        bytes.push(ins.op.to_byte());

        let width = ins.op.immediate_size();
        if width == 0 {
            continue;
        }

        let immediate = ins.imm.as_deref().ok_or_else(|| {
            Error::InvalidImmediate(format!("{} at pc 0x{:x} has no immediate", ins.op, ins.pc))
        })?;
        let data = hex::decode(immediate)?;
        if data.len() != width {
            return Err(Error::InvalidImmediate(format!(
                "{} at pc 0x{:x} carries {} bytes, expected {}",
                ins.op,
                ins.pc,
                data.len(),
                width
            )));
        }
        bytes.extend_from_slice(&data);
    }

    tracing::debug!(
        instructions = instructions.len(),
        bytes = bytes.len(),
        "encoded instruction stream"
    );
    Ok(bytes)
}

/// Writes `value` into a `width`-byte big-endian immediate.
///
/// Fails when the value needs more than `width` bytes.
pub fn encode_immediate(value: usize, width: usize) -> Result<Vec<u8>, Error> {
    let full = (value as u128).to_be_bytes();
    let significant = full.iter().skip_while(|b| **b == 0).count();
    if significant > width {
        return Err(Error::InvalidImmediate(format!(
            "value 0x{value:x} does not fit in {width} bytes"
        )));
    }
    let mut out = vec![0u8; width];
    let copy = width.min(full.len());
    out[width - copy..].copy_from_slice(&full[full.len() - copy..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::{encode, encode_immediate};
    use crate::decoder::decode_bytes;

    #[test]
    fn decode_then_encode_is_identity() {
        let code = [0x60, 0x80, 0x60, 0x40, 0x52, 0x61, 0x01, 0x00, 0x56, 0x5b, 0xfe, 0x0c];
        let (instructions, _) = decode_bytes(&code, 0);
        assert_eq!(encode(&instructions).expect("encodes"), code.to_vec());
    }

    #[test]
    fn immediates_keep_their_width() {
        assert_eq!(encode_immediate(0x12, 2).unwrap(), vec![0x00, 0x12]);
        assert_eq!(encode_immediate(0x1234, 2).unwrap(), vec![0x12, 0x34]);
        assert!(encode_immediate(0x12345, 2).is_err());
        assert_eq!(encode_immediate(0, 1).unwrap(), vec![0x00]);
    }
}
