//! Opcode table.
//!
//! The opcode set itself comes from `eot`. Bytes it does not assign decode to
//! [`Opcode::UNKNOWN`] and keep their original byte so the rewriter can re-emit them unchanged.
//! [`OpcodeExt`] adds the stack and immediate metadata the analyses need.

pub use eot::UnifiedOpcode as Opcode;

/// Stack and immediate metadata for [`Opcode`].
pub trait OpcodeExt: Copy {
    /// Number of immediate bytes following the opcode.
    fn immediate_size(self) -> usize;

    /// Returns true for `PUSH0` and `PUSH1`..=`PUSH32`.
    fn is_push(self) -> bool;

    /// `(inputs, outputs)` for opcodes assigned on Cancun, `None` for everything else.
    fn arity(self) -> Option<(usize, usize)>;

    /// Returns `(inputs, outputs)`: how many words the opcode pops and pushes. Unassigned
    /// opcodes halt without touching the stack.
    fn stack_io(self) -> (usize, usize) {
        self.arity().unwrap_or((0, 0))
    }

    /// Unassigned opcodes halt like `INVALID`.
    fn is_unassigned(self) -> bool {
        self.arity().is_none()
    }

    /// Returns true for the four external message-call opcodes.
    fn is_call(self) -> bool;
}

impl OpcodeExt for Opcode {
    #[inline]
    fn immediate_size(self) -> usize {
        match self {
            Opcode::PUSH(n) => n as usize,
            _ => 0,
        }
    }

    #[inline]
    fn is_push(self) -> bool {
        matches!(self, Opcode::PUSH0 | Opcode::PUSH(_))
    }

    fn arity(self) -> Option<(usize, usize)> {
        use Opcode::*;
        let io = match self {
            STOP | JUMPDEST | INVALID => (0, 0),
            ADD | MUL | SUB | DIV | SDIV | MOD | SMOD | EXP | SIGNEXTEND => (2, 1),
            ADDMOD | MULMOD => (3, 1),
            LT | GT | SLT | SGT | EQ | AND | OR | XOR | BYTE | SHL | SHR | SAR | KECCAK256 => (2, 1),
            ISZERO | NOT => (1, 1),
            ADDRESS | ORIGIN | CALLER | CALLVALUE | CALLDATASIZE | CODESIZE | GASPRICE
            | RETURNDATASIZE | COINBASE | TIMESTAMP | NUMBER | DIFFICULTY | GASLIMIT
            | CHAINID | SELFBALANCE | BASEFEE | BLOBBASEFEE | PC | MSIZE | GAS => (0, 1),
            BALANCE | CALLDATALOAD | EXTCODESIZE | EXTCODEHASH | BLOCKHASH | BLOBHASH
            | MLOAD | SLOAD | TLOAD => (1, 1),
            CALLDATACOPY | CODECOPY | RETURNDATACOPY | MCOPY => (3, 0),
            EXTCODECOPY => (4, 0),
            POP | JUMP | SELFDESTRUCT => (1, 0),
            MSTORE | MSTORE8 | SSTORE | TSTORE | JUMPI | RETURN | REVERT => (2, 0),
            PUSH0 | PUSH(_) => (0, 1),
            DUP(n) => (n as usize, n as usize + 1),
            SWAP(n) => (n as usize + 1, n as usize + 1),
            LOG0 => (2, 0),
            LOG1 => (3, 0),
            LOG2 => (4, 0),
            LOG3 => (5, 0),
            LOG4 => (6, 0),
            CREATE => (3, 1),
            CREATE2 => (4, 1),
            CALL | CALLCODE => (7, 1),
            DELEGATECALL | STATICCALL => (6, 1),
            _ => return None,
        };
        Some(io)
    }

    #[inline]
    fn is_call(self) -> bool {
        matches!(
            self,
            Opcode::CALL | Opcode::CALLCODE | Opcode::DELEGATECALL | Opcode::STATICCALL
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Opcode, OpcodeExt};

    #[test]
    fn every_byte_round_trips() {
        for byte in 0u8..=0xff {
            assert_eq!(Opcode::parse(byte).0.to_byte(), byte, "byte 0x{byte:02x}");
        }
    }

    #[test]
    fn push_family_widths() {
        assert_eq!(Opcode::parse(0x60).0, Opcode::PUSH(1));
        assert_eq!(Opcode::parse(0x7f).0, Opcode::PUSH(32));
        assert_eq!(Opcode::PUSH(4).immediate_size(), 4);
        assert_eq!(Opcode::PUSH0.immediate_size(), 0);
        assert!(Opcode::PUSH0.is_push());
        assert!(!Opcode::DUP(1).is_push());
    }

    #[test]
    fn stack_arity_of_calls() {
        assert_eq!(Opcode::CALL.stack_io(), (7, 1));
        assert_eq!(Opcode::STATICCALL.stack_io(), (6, 1));
        assert_eq!(Opcode::DUP(2).stack_io(), (2, 3));
        assert_eq!(Opcode::SWAP(1).stack_io(), (2, 2));
        assert_eq!(Opcode::LOG2.stack_io(), (4, 0));
        assert!(Opcode::DELEGATECALL.is_call());
        assert!(!Opcode::CREATE2.is_call());
    }

    #[test]
    fn unassigned_bytes_halt() {
        assert_eq!(Opcode::parse(0x0c).0, Opcode::UNKNOWN(0x0c));
        assert!(Opcode::UNKNOWN(0x0c).is_unassigned());
        assert_eq!(Opcode::UNKNOWN(0x0c).stack_io(), (0, 0));
        assert!(!Opcode::INVALID.is_unassigned());
    }
}
