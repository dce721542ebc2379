//! Concrete EVM word arithmetic.
//!
//! Operand order follows the stack: `a` is the first word popped (the top), `b` the second.

use crate::Opcode;
use revm::primitives::U256;

const WORD_BITS: u64 = 256;

#[inline]
fn bool_word(b: bool) -> U256 {
    if b { U256::from(1u8) } else { U256::ZERO }
}

#[inline]
fn is_negative(x: U256) -> bool {
    x.bit(255)
}

#[inline]
fn negate(x: U256) -> U256 {
    (!x).wrapping_add(U256::from(1u8))
}

#[inline]
fn abs(x: U256) -> U256 {
    if is_negative(x) { negate(x) } else { x }
}

/// Shift amount as `usize`, `None` when it is at least 256.
#[inline]
fn shift_amount(x: U256) -> Option<usize> {
    if x >= U256::from(WORD_BITS) {
        None
    } else {
        usize::try_from(x).ok()
    }
}

pub fn sdiv(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::ZERO;
    }
    let quotient = abs(a) / abs(b);
    if is_negative(a) != is_negative(b) {
        negate(quotient)
    } else {
        quotient
    }
}

pub fn smod(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::ZERO;
    }
    let remainder = abs(a) % abs(b);
    if is_negative(a) { negate(remainder) } else { remainder }
}

pub fn slt(a: U256, b: U256) -> bool {
    match (is_negative(a), is_negative(b)) {
        (true, false) => true,
        (false, true) => false,
        _ => a < b,
    }
}

/// `SAR`: arithmetic shift of `value` right by `shift`.
pub fn sar(shift: U256, value: U256) -> U256 {
    let negative = is_negative(value);
    match shift_amount(shift) {
        Some(s) if negative => !((!value) >> s),
        Some(s) => value >> s,
        None if negative => U256::MAX,
        None => U256::ZERO,
    }
}

/// `BYTE`: the `index`-th most significant byte of `value`.
pub fn byte(index: U256, value: U256) -> U256 {
    match usize::try_from(index) {
        Ok(i) if i < 32 => U256::from(value.to_be_bytes::<32>()[i]),
        _ => U256::ZERO,
    }
}

/// `SIGNEXTEND`: extends the sign of the `(size + 1)`-byte integer in `value`.
pub fn signextend(size: U256, value: U256) -> U256 {
    let Ok(size) = usize::try_from(size) else {
        return value;
    };
    if size >= 31 {
        return value;
    }
    let sign_bit = size * 8 + 7;
    let mask = (U256::from(1u8) << (sign_bit + 1)).wrapping_sub(U256::from(1u8));
    if value.bit(sign_bit) {
        value | !mask
    } else {
        value & mask
    }
}

/// Folds a two-operand opcode. Returns `None` for opcodes that are not pure word functions.
pub fn binary(op: Opcode, a: U256, b: U256) -> Option<U256> {
    let value = match op {
        Opcode::ADD => a.wrapping_add(b),
        Opcode::MUL => a.wrapping_mul(b),
        Opcode::SUB => a.wrapping_sub(b),
        Opcode::DIV => {
            if b.is_zero() {
                U256::ZERO
            } else {
                a / b
            }
        }
        Opcode::SDIV => sdiv(a, b),
        Opcode::MOD => {
            if b.is_zero() {
                U256::ZERO
            } else {
                a % b
            }
        }
        Opcode::SMOD => smod(a, b),
        Opcode::EXP => a.wrapping_pow(b),
        Opcode::SIGNEXTEND => signextend(a, b),
        Opcode::LT => bool_word(a < b),
        Opcode::GT => bool_word(a > b),
        Opcode::SLT => bool_word(slt(a, b)),
        Opcode::SGT => bool_word(slt(b, a)),
        Opcode::EQ => bool_word(a == b),
        Opcode::AND => a & b,
        Opcode::OR => a | b,
        Opcode::XOR => a ^ b,
        Opcode::BYTE => byte(a, b),
        Opcode::SHL => shift_amount(a).map_or(U256::ZERO, |s| b << s),
        Opcode::SHR => shift_amount(a).map_or(U256::ZERO, |s| b >> s),
        Opcode::SAR => sar(a, b),
        _ => return None,
    };
    Some(value)
}

pub fn unary(op: Opcode, a: U256) -> Option<U256> {
    match op {
        Opcode::NOT => Some(!a),
        Opcode::ISZERO => Some(bool_word(a.is_zero())),
        _ => None,
    }
}

pub fn ternary(op: Opcode, a: U256, b: U256, n: U256) -> Option<U256> {
    match op {
        Opcode::ADDMOD => Some(a.add_mod(b, n)),
        Opcode::MULMOD => Some(a.mul_mod(b, n)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(v: u64) -> U256 {
        U256::from(v)
    }

    #[test]
    fn signed_division_and_modulo() {
        let minus_eight = negate(w(8));
        assert_eq!(sdiv(minus_eight, w(3)), negate(w(2)));
        assert_eq!(smod(minus_eight, w(3)), negate(w(2)));
        assert_eq!(sdiv(w(7), U256::ZERO), U256::ZERO);
        let min = U256::from(1u8) << 255;
        assert_eq!(sdiv(min, U256::MAX), min);
    }

    #[test]
    fn shifts_and_bytes() {
        assert_eq!(binary(Opcode::SHL, w(4), w(1)), Some(w(16)));
        assert_eq!(binary(Opcode::SHR, w(300), w(1)), Some(U256::ZERO));
        assert_eq!(sar(w(4), negate(w(32))), negate(w(2)));
        assert_eq!(sar(w(999), negate(w(1))), U256::MAX);
        assert_eq!(byte(w(31), w(0xabcd)), w(0xcd));
        assert_eq!(byte(w(32), w(0xabcd)), U256::ZERO);
    }

    #[test]
    fn sign_extension() {
        assert_eq!(signextend(U256::ZERO, w(0xff)), U256::MAX);
        assert_eq!(signextend(U256::ZERO, w(0x7f)), w(0x7f));
        assert_eq!(signextend(w(40), w(0xff)), w(0xff));
    }

    #[test]
    fn comparisons_and_modular_ops() {
        assert_eq!(binary(Opcode::SLT, U256::MAX, w(0)), Some(w(1)));
        assert_eq!(binary(Opcode::SGT, U256::MAX, w(0)), Some(w(0)));
        assert_eq!(binary(Opcode::SUB, w(0), w(1)), Some(U256::MAX));
        assert_eq!(ternary(Opcode::ADDMOD, U256::MAX, w(2), w(10)), Some(w(7)));
        assert_eq!(ternary(Opcode::MULMOD, w(5), w(5), U256::ZERO), Some(U256::ZERO));
        assert_eq!(binary(Opcode::EXP, w(2), w(10)), Some(w(1024)));
        assert_eq!(unary(Opcode::ISZERO, U256::ZERO), Some(w(1)));
        assert_eq!(binary(Opcode::MLOAD, w(0), w(0)), None);
    }
}
