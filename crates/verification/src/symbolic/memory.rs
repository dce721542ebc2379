//! Word-slot memory model.
//!
//! Memory is a map from slot keys to 256-bit values. A 32-byte slot at `a` is keyed
//! `"<a>$<a+32>"`, a single byte written by `MSTORE8` is keyed `"$<a>$<a+1>"`. Slots at concrete
//! addresses also remember their byte range so that overlapping writes can evict them. A write
//! that evicts anything, or whose extent is unknown, starts a new epoch: symbols read afterwards
//! never alias symbols read before, even at the same address.

use super::words::{WORD_BITS, concrete, key, small};
use revm::primitives::U256;
use std::collections::BTreeMap;
use z3::Context;
use z3::ast::{Ast, BV};

#[derive(Debug, Clone)]
struct Slot<'ctx> {
    /// `[start, end)` when the address is concrete.
    range: Option<(U256, U256)>,
    value: BV<'ctx>,
}

#[derive(Debug, Clone, Default)]
pub struct Memory<'ctx> {
    slots: BTreeMap<String, Slot<'ctx>>,
    epoch: usize,
}

impl<'ctx> Memory<'ctx> {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            epoch: 0,
        }
    }

    #[inline]
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `MLOAD`. Unwritten slots read as a fresh `MLOAD_<addr>` symbol that later loads reuse.
    pub fn load(&mut self, ctx: &'ctx Context, addr: &BV<'ctx>) -> BV<'ctx> {
        let (slot_key, range) = word_slot(addr);
        if let Some(slot) = self.slots.get(&slot_key) {
            return slot.value.clone();
        }
        let name = match self.epoch {
            0 => format!("MLOAD_{}", key(addr)),
            epoch => format!("MLOAD_{}_e{epoch}", key(addr)),
        };
        let value = BV::new_const(ctx, name, WORD_BITS);
        self.slots.insert(
            slot_key,
            Slot {
                range,
                value: value.clone(),
            },
        );
        value
    }

    /// `MSTORE`.
    pub fn store(&mut self, addr: &BV<'ctx>, value: BV<'ctx>) {
        let (slot_key, range) = word_slot(addr);
        match range {
            Some((start, end)) => self.evict_and_advance(start, end),
            None => self.clobber(),
        }
        self.slots.insert(slot_key, Slot { range, value });
    }

    /// `MSTORE8`: keeps the low byte of `value`.
    pub fn store_byte(&mut self, addr: &BV<'ctx>, value: &BV<'ctx>) {
        let start = concrete(addr);
        let slot_key = match start {
            Some(a) => format!("${a}${}", a.saturating_add(U256::from(1))),
            None => format!("${}${}", key(addr), key(&addr.bvadd(&small(addr.get_ctx(), 1)))),
        };
        let range = start.map(|a| (a, a.saturating_add(U256::from(1))));
        match range {
            Some((s, e)) => self.evict_and_advance(s, e),
            None => self.clobber(),
        }
        let byte = value.extract(7, 0).zero_ext(WORD_BITS - 8);
        self.slots.insert(slot_key, Slot { range, value: byte });
    }

    /// Writes a concrete word at a concrete address.
    pub fn write_word(&mut self, start: U256, value: BV<'ctx>) {
        let end = start.saturating_add(U256::from(32));
        self.evict_and_advance(start, end);
        self.slots.insert(
            format!("{start}${end}"),
            Slot {
                range: Some((start, end)),
                value,
            },
        );
    }

    /// Forgets `[start, start + len)`. Unknown bounds forget everything.
    pub fn invalidate(&mut self, start: Option<U256>, len: Option<U256>) {
        match (start, len) {
            (_, Some(len)) if len.is_zero() => {}
            (Some(start), Some(len)) => {
                self.evict(start, start.saturating_add(len));
                self.epoch += 1;
            }
            _ => self.clobber(),
        }
    }

    /// Drops slots overlapping `[start, end)` and every slot at a symbolic address. Returns
    /// whether anything was dropped.
    fn evict(&mut self, start: U256, end: U256) -> bool {
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot.range {
            Some((s, e)) => e <= start || end <= s,
            None => false,
        });
        self.slots.len() != before
    }

    /// Evicts, then starts a new epoch if any slot went.
    fn evict_and_advance(&mut self, start: U256, end: U256) {
        if self.evict(start, end) {
            self.epoch += 1;
        }
    }

    fn clobber(&mut self) {
        self.slots.clear();
        self.epoch += 1;
        tracing::trace!(epoch = self.epoch, "memory clobbered by write of unknown extent");
    }
}

fn word_slot(addr: &BV<'_>) -> (String, Option<(U256, U256)>) {
    match concrete(addr) {
        Some(start) => {
            let end = start.saturating_add(U256::from(32));
            (format!("{start}${end}"), Some((start, end)))
        }
        None => {
            let end = addr.bvadd(&small(addr.get_ctx(), 32));
            (format!("{}${}", key(addr), key(&end)), None)
        }
    }
}
