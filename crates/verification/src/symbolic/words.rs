//! 256-bit word helpers over z3 bitvectors.

use revm::primitives::U256;
use z3::ast::{Ast, BV, Bool};
use z3::{AstKind, Context};

/// Width of an EVM word in bits.
pub const WORD_BITS: u32 = 256;

/// Bitvector constant for `value`.
pub fn constant(ctx: &Context, value: U256) -> BV<'_> {
    let limbs = value.as_limbs();
    if limbs[1..].iter().all(|limb| *limb == 0) {
        return BV::from_u64(ctx, limbs[0], WORD_BITS);
    }
    let mut out = BV::from_u64(ctx, limbs[3], 64);
    for limb in limbs[..3].iter().rev() {
        out = out.concat(&BV::from_u64(ctx, *limb, 64));
    }
    out
}

#[inline]
pub fn small(ctx: &Context, value: u64) -> BV<'_> {
    BV::from_u64(ctx, value, WORD_BITS)
}

/// Concrete value of `bv`, if it simplifies to a numeral.
pub fn concrete(bv: &BV<'_>) -> Option<U256> {
    let size = bv.get_size();
    let mut limbs = [0u64; 4];
    for (idx, limb) in limbs.iter_mut().enumerate() {
        let lo = 64 * idx as u32;
        if lo >= size {
            break;
        }
        let hi = (lo + 63).min(size - 1);
        let part = bv.extract(hi, lo).simplify();
        if part.kind() != AstKind::Numeral {
            return None;
        }
        *limb = part.as_u64()?;
    }
    Some(U256::from_limbs(limbs))
}

/// Concrete value that fits a `usize`.
pub fn concrete_usize(bv: &BV<'_>) -> Option<usize> {
    concrete(bv).and_then(|v| usize::try_from(v).ok())
}

/// Stable textual key: decimal for numerals, the simplified term otherwise.
pub fn key(bv: &BV<'_>) -> String {
    match concrete(bv) {
        Some(value) => value.to_string(),
        None => bv.simplify().to_string(),
    }
}

/// Whether `key` names a concrete word, as produced by [`key`].
pub fn is_concrete_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_digit())
}

pub fn bool_to_word<'ctx>(cond: &Bool<'ctx>) -> BV<'ctx> {
    let ctx = cond.get_ctx();
    cond.ite(&small(ctx, 1), &small(ctx, 0))
}

pub fn word_to_bool<'ctx>(word: &BV<'ctx>) -> Bool<'ctx> {
    word._eq(&small(word.get_ctx(), 0)).not()
}

fn zero_guard<'ctx>(divisor: &BV<'ctx>, result: BV<'ctx>) -> BV<'ctx> {
    let zero = small(divisor.get_ctx(), 0);
    divisor._eq(&zero).ite(&zero, &result)
}

pub fn div<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>) -> BV<'ctx> {
    zero_guard(b, a.bvudiv(b))
}

pub fn sdiv<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>) -> BV<'ctx> {
    zero_guard(b, a.bvsdiv(b))
}

pub fn rem<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>) -> BV<'ctx> {
    zero_guard(b, a.bvurem(b))
}

/// Signed remainder; the sign follows the dividend.
pub fn smod<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>) -> BV<'ctx> {
    zero_guard(b, a.bvsrem(b))
}

/// `(a + b) % n` computed over 257 bits.
pub fn addmod<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>, n: &BV<'ctx>) -> BV<'ctx> {
    let sum = a.zero_ext(1).bvadd(&b.zero_ext(1));
    zero_guard(n, sum.bvurem(&n.zero_ext(1)).extract(WORD_BITS - 1, 0))
}

/// `(a * b) % n` computed over 512 bits.
pub fn mulmod<'ctx>(a: &BV<'ctx>, b: &BV<'ctx>, n: &BV<'ctx>) -> BV<'ctx> {
    let product = a.zero_ext(WORD_BITS).bvmul(&b.zero_ext(WORD_BITS));
    zero_guard(
        n,
        product
            .bvurem(&n.zero_ext(WORD_BITS))
            .extract(WORD_BITS - 1, 0),
    )
}

/// `BYTE(i, x)`: byte `i` of `x`, counting from the most significant.
pub fn byte<'ctx>(index: &BV<'ctx>, value: &BV<'ctx>) -> BV<'ctx> {
    let ctx = value.get_ctx();
    let shift = small(ctx, 31).bvsub(index).bvmul(&small(ctx, 8));
    let picked = value.bvlshr(&shift).bvand(&small(ctx, 0xff));
    index.bvult(&small(ctx, 32)).ite(&picked, &small(ctx, 0))
}

fn extend_from<'ctx>(value: &BV<'ctx>, size: u64) -> BV<'ctx> {
    let bits = 8 * (size as u32 + 1);
    value.extract(bits - 1, 0).sign_ext(WORD_BITS - bits)
}

/// `SIGNEXTEND(b, x)`.
pub fn signextend<'ctx>(size: &BV<'ctx>, value: &BV<'ctx>) -> BV<'ctx> {
    match concrete(size) {
        Some(b) if b < U256::from(31) => extend_from(value, b.to::<u64>()),
        Some(_) => value.clone(),
        None => {
            let ctx = value.get_ctx();
            (0..31u64).rev().fold(value.clone(), |acc, b| {
                size._eq(&small(ctx, b)).ite(&extend_from(value, b), &acc)
            })
        }
    }
}

/// `EXP(a, b)`: exact when both are known, an opaque `exp#a#b` term otherwise.
pub fn exp<'ctx>(base: &BV<'ctx>, exponent: &BV<'ctx>) -> BV<'ctx> {
    let ctx = base.get_ctx();
    match (concrete(base), concrete(exponent)) {
        (Some(a), Some(b)) => constant(ctx, a.pow(b)),
        _ => BV::new_const(
            ctx,
            format!("exp#{}#{}", key(base), key(exponent)),
            WORD_BITS,
        ),
    }
}
