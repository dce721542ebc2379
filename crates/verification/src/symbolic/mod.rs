//! Symbolic EVM executor over z3 bitvectors.
//!
//! The executor runs straight-line instruction sequences. Control flow is the caller's business:
//! on `JUMPI` the popped condition is kept as [`SymbolicExecutor::jump_cond`] and the caller
//! decides which side the path takes.
//!
//! Anything the contract cannot know statically (environment, storage it never wrote, external
//! calls, hashes) becomes an unconstrained symbol. Symbols that model a non-deterministic
//! result carry a counter (`GAS_0`, `CALL_1`, ...) so two occurrences are never equal by
//! accident.

mod memory;
pub mod words;

pub use memory::Memory;

use crate::{Error, Result};
use revm::primitives::U256;
use sieve_core::{Opcode, OpcodeExt};
use sieve_core::cfg_ir::BasicBlock;
use sieve_core::decoder::Instruction;
use std::collections::BTreeMap;
use std::rc::Rc;
use words::{WORD_BITS, concrete, is_concrete_key, key, small};
use z3::Context;
use z3::ast::{Ast, BV, Bool};

/// An operand-stack entry. Comparisons push booleans; they are coerced where a word is needed.
#[derive(Debug, Clone)]
pub enum StackItem<'ctx> {
    Word(BV<'ctx>),
    Cond(Bool<'ctx>),
}

impl<'ctx> StackItem<'ctx> {
    pub fn word(&self) -> BV<'ctx> {
        match self {
            StackItem::Word(w) => w.clone(),
            StackItem::Cond(c) => words::bool_to_word(c),
        }
    }

    pub fn cond(&self) -> Bool<'ctx> {
        match self {
            StackItem::Word(w) => words::word_to_bool(w),
            StackItem::Cond(c) => c.clone(),
        }
    }

    /// Concrete value, if known.
    pub fn concrete(&self) -> Option<U256> {
        concrete(&self.word())
    }
}

/// Counters behind fresh-symbol names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub gas: usize,
    pub msize: usize,
    pub call: usize,
    pub sha3: usize,
    pub create: usize,
    /// Bumped whenever storage is forgotten, so reloads do not alias older reads.
    pub storage_epoch: usize,
}

/// Everything the executor mutates. Cloning it is a snapshot.
#[derive(Debug, Clone)]
pub struct SymbolicState<'ctx> {
    pub pc: usize,
    pub stack: Vec<StackItem<'ctx>>,
    pub storage: BTreeMap<String, BV<'ctx>>,
    pub transient: BTreeMap<String, BV<'ctx>>,
    pub memory: Memory<'ctx>,
    pub counters: Counters,
    pub jump_cond: Option<Bool<'ctx>>,
    pub return_data_size: BV<'ctx>,
}

impl<'ctx> SymbolicState<'ctx> {
    pub fn new(ctx: &'ctx Context) -> Self {
        Self {
            pc: 0,
            stack: Vec::new(),
            storage: BTreeMap::new(),
            transient: BTreeMap::new(),
            memory: Memory::new(),
            counters: Counters::default(),
            jump_cond: None,
            return_data_size: small(ctx, 0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Fresh {
    Gas,
    Msize,
    Call,
    Sha3,
    Create,
}

pub struct SymbolicExecutor<'ctx> {
    ctx: &'ctx Context,
    /// Runtime code, read by `CODECOPY`.
    code: Rc<[u8]>,
    state: SymbolicState<'ctx>,
}

impl<'ctx> SymbolicExecutor<'ctx> {
    pub fn new(ctx: &'ctx Context, code: Rc<[u8]>) -> Self {
        Self {
            ctx,
            code,
            state: SymbolicState::new(ctx),
        }
    }

    pub fn get_state(&self) -> SymbolicState<'ctx> {
        self.state.clone()
    }

    pub fn set_state(&mut self, state: SymbolicState<'ctx>) {
        self.state = state;
    }

    /// Condition popped by the last `JUMPI`.
    pub fn jump_cond(&self) -> Option<&Bool<'ctx>> {
        self.state.jump_cond.as_ref()
    }

    pub fn stack(&self) -> &[StackItem<'ctx>] {
        &self.state.stack
    }

    /// Item `depth` below the top.
    pub fn peek(&self, depth: usize) -> Option<&StackItem<'ctx>> {
        self.state.stack.iter().rev().nth(depth)
    }

    /// Runs every instruction of `block`.
    pub fn execute_block(&mut self, block: &BasicBlock) -> Result<()> {
        self.state.jump_cond = None;
        for ins in &block.instructions {
            self.step(ins)?;
        }
        Ok(())
    }

    fn word(&self, value: u64) -> BV<'ctx> {
        small(self.ctx, value)
    }

    fn symbol(&self, name: impl Into<String>) -> BV<'ctx> {
        BV::new_const(self.ctx, name.into(), WORD_BITS)
    }

    fn fresh(&mut self, kind: Fresh) -> BV<'ctx> {
        let counters = &mut self.state.counters;
        let (prefix, slot) = match kind {
            Fresh::Gas => ("GAS", &mut counters.gas),
            Fresh::Msize => ("MSIZE", &mut counters.msize),
            Fresh::Call => ("CALL", &mut counters.call),
            Fresh::Sha3 => ("SHA3", &mut counters.sha3),
            Fresh::Create => ("CREATE", &mut counters.create),
        };
        let name = format!("{prefix}_{slot}");
        *slot += 1;
        self.symbol(name)
    }

    fn pop(&mut self, ins: &Instruction) -> Result<StackItem<'ctx>> {
        self.state.stack.pop().ok_or_else(|| Error::StackUnderflow {
            pc: ins.pc,
            op: ins.op.to_string(),
        })
    }

    fn pop_word(&mut self, ins: &Instruction) -> Result<BV<'ctx>> {
        self.pop(ins).map(|item| item.word())
    }

    fn pop_words<const N: usize>(&mut self, ins: &Instruction) -> Result<[BV<'ctx>; N]> {
        let mut out = Vec::with_capacity(N);
        for _ in 0..N {
            out.push(self.pop_word(ins)?);
        }
        out.try_into()
            .map_err(|_| Error::Unsupported(format!("arity mismatch at pc 0x{:x}", ins.pc)))
    }

    fn push(&mut self, word: BV<'ctx>) {
        self.state.stack.push(StackItem::Word(word.simplify()));
    }

    fn push_cond(&mut self, cond: Bool<'ctx>) {
        self.state.stack.push(StackItem::Cond(cond.simplify()));
    }

    /// Executes one instruction.
    pub fn step(&mut self, ins: &Instruction) -> Result<()> {
        use Opcode::*;
        self.state.pc = ins.pc;
        match ins.op {
            STOP | RETURN | REVERT | INVALID | SELFDESTRUCT => {
                let (inputs, _) = ins.op.stack_io();
                for _ in 0..inputs {
                    self.pop(ins)?;
                }
            }
            JUMPDEST => {}
            PUSH0 | PUSH(_) => {
                let value = ins.push_value().unwrap_or_default();
                self.push(words::constant(self.ctx, value));
            }
            DUP(n) => {
                let item = self
                    .peek(n as usize - 1)
                    .cloned()
                    .ok_or_else(|| Error::StackUnderflow {
                        pc: ins.pc,
                        op: ins.op.to_string(),
                    })?;
                self.state.stack.push(item);
            }
            SWAP(n) => {
                let len = self.state.stack.len();
                if len <= n as usize {
                    return Err(Error::StackUnderflow {
                        pc: ins.pc,
                        op: ins.op.to_string(),
                    });
                }
                self.state.stack.swap(len - 1, len - 1 - n as usize);
            }
            POP => {
                self.pop(ins)?;
            }

            ADD | MUL | SUB | DIV | SDIV | MOD | SMOD | EXP | SIGNEXTEND | AND | OR | XOR | BYTE
            | SHL | SHR | SAR => {
                let [a, b] = self.pop_words::<2>(ins)?;
                let result = match ins.op {
                    ADD => a.bvadd(&b),
                    MUL => a.bvmul(&b),
                    SUB => a.bvsub(&b),
                    DIV => words::div(&a, &b),
                    SDIV => words::sdiv(&a, &b),
                    MOD => words::rem(&a, &b),
                    SMOD => words::smod(&a, &b),
                    EXP => words::exp(&a, &b),
                    SIGNEXTEND => words::signextend(&a, &b),
                    AND => a.bvand(&b),
                    OR => a.bvor(&b),
                    XOR => a.bvxor(&b),
                    BYTE => words::byte(&a, &b),
                    // Shift amount is on top.
                    SHL => b.bvshl(&a),
                    SHR => b.bvlshr(&a),
                    _ => b.bvashr(&a),
                };
                self.push(result);
            }
            ADDMOD | MULMOD => {
                let [a, b, n] = self.pop_words::<3>(ins)?;
                let result = if ins.op == ADDMOD {
                    words::addmod(&a, &b, &n)
                } else {
                    words::mulmod(&a, &b, &n)
                };
                self.push(result);
            }
            LT | GT | SLT | SGT | EQ => {
                let [a, b] = self.pop_words::<2>(ins)?;
                let cond = match ins.op {
                    LT => a.bvult(&b),
                    GT => a.bvugt(&b),
                    SLT => a.bvslt(&b),
                    SGT => a.bvsgt(&b),
                    _ => a._eq(&b),
                };
                self.push_cond(cond);
            }
            ISZERO => {
                let item = self.pop(ins)?;
                self.push_cond(item.cond().not());
            }
            NOT => {
                let a = self.pop_word(ins)?;
                self.push(a.bvnot());
            }

            KECCAK256 => {
                self.pop_words::<2>(ins)?;
                let hash = self.fresh(Fresh::Sha3);
                self.push(hash);
            }
            GAS | MSIZE => {
                let kind = if ins.op == GAS { Fresh::Gas } else { Fresh::Msize };
                let value = self.fresh(kind);
                self.push(value);
            }
            PC => self.push(self.word(ins.pc as u64)),
            ADDRESS | ORIGIN | CALLER | CALLVALUE | CALLDATASIZE | CODESIZE | GASPRICE
            | COINBASE | TIMESTAMP | NUMBER | DIFFICULTY | GASLIMIT | CHAINID | SELFBALANCE
            | BASEFEE | BLOBBASEFEE => {
                let value = self.symbol(ins.op.to_string());
                self.push(value);
            }
            RETURNDATASIZE => self.push(self.state.return_data_size.clone()),
            BALANCE | CALLDATALOAD | EXTCODESIZE | EXTCODEHASH | BLOCKHASH | BLOBHASH => {
                let arg = self.pop_word(ins)?;
                let value = self.symbol(format!("{}_{}", ins.op, key(&arg)));
                self.push(value);
            }

            MLOAD => {
                let addr = self.pop_word(ins)?;
                let value = self.state.memory.load(self.ctx, &addr);
                self.push(value);
            }
            MSTORE => {
                let [addr, value] = self.pop_words::<2>(ins)?;
                self.state.memory.store(&addr, value.simplify());
            }
            MSTORE8 => {
                let [addr, value] = self.pop_words::<2>(ins)?;
                self.state.memory.store_byte(&addr, &value);
            }
            CALLDATACOPY | RETURNDATACOPY | MCOPY => {
                let [dest, _src, len] = self.pop_words::<3>(ins)?;
                self.state.memory.invalidate(concrete(&dest), concrete(&len));
            }
            EXTCODECOPY => {
                let [_addr, dest, _src, len] = self.pop_words::<4>(ins)?;
                self.state.memory.invalidate(concrete(&dest), concrete(&len));
            }
            CODECOPY => {
                let [dest, offset, len] = self.pop_words::<3>(ins)?;
                self.code_copy(&dest, &offset, &len);
            }

            SLOAD | TLOAD => {
                let slot = key(&self.pop_word(ins)?);
                let (map, prefix) = if ins.op == SLOAD {
                    (&self.state.storage, "SLOAD")
                } else {
                    (&self.state.transient, "TLOAD")
                };
                let value = match (map.get(&slot), self.state.counters.storage_epoch) {
                    (Some(value), _) => value.clone(),
                    (None, 0) => self.symbol(format!("{prefix}_{slot}")),
                    (None, epoch) => self.symbol(format!("{prefix}_{slot}_r{epoch}")),
                };
                let map = if ins.op == SLOAD {
                    &mut self.state.storage
                } else {
                    &mut self.state.transient
                };
                map.insert(slot, value.clone());
                self.push(value);
            }
            SSTORE | TSTORE => {
                let [slot, value] = self.pop_words::<2>(ins)?;
                let map = if ins.op == SSTORE {
                    &mut self.state.storage
                } else {
                    &mut self.state.transient
                };
                // A symbolic slot may alias any other. A concrete one may alias any cached
                // read at a symbolic slot.
                let aliased = if concrete(&slot).is_none() {
                    map.clear();
                    true
                } else {
                    let before = map.len();
                    map.retain(|k, _| is_concrete_key(k));
                    map.len() != before
                };
                if aliased {
                    self.state.counters.storage_epoch += 1;
                }
                map.insert(key(&slot), value.simplify());
            }

            JUMP => {
                self.pop(ins)?;
            }
            JUMPI => {
                self.pop(ins)?;
                let cond = self.pop(ins)?.cond().simplify();
                self.state.jump_cond = Some(cond);
            }
            LOG0 | LOG1 | LOG2 | LOG3 | LOG4 => {
                let (inputs, _) = ins.op.stack_io();
                for _ in 0..inputs {
                    self.pop(ins)?;
                }
            }

            CALL | CALLCODE | DELEGATECALL | STATICCALL => self.call(ins)?,
            CREATE | CREATE2 => {
                let (inputs, _) = ins.op.stack_io();
                for _ in 0..inputs {
                    self.pop(ins)?;
                }
                self.reentered();
                let address = self.fresh(Fresh::Create);
                self.push(address);
            }
            // Unassigned bytes halt like INVALID.
            _ => {}
        }
        Ok(())
    }

    fn code_copy(&mut self, dest: &BV<'ctx>, offset: &BV<'ctx>, len: &BV<'ctx>) {
        let (start, size) = (concrete(dest), concrete(len));
        self.state.memory.invalidate(start, size);
        let (Some(start), Some(offset), Some(size)) = (
            start,
            words::concrete_usize(offset),
            size.and_then(|s| usize::try_from(s).ok()),
        ) else {
            return;
        };
        for chunk in 0..size / 32 {
            let from = offset.saturating_add(chunk * 32);
            let mut bytes = [0u8; 32];
            for (idx, byte) in bytes.iter_mut().enumerate() {
                *byte = from
                    .checked_add(idx)
                    .and_then(|at| self.code.get(at))
                    .copied()
                    .unwrap_or(0);
            }
            let value = words::constant(self.ctx, U256::from_be_bytes(bytes));
            self.state
                .memory
                .write_word(start.saturating_add(U256::from(chunk * 32)), value);
        }
    }

    fn call(&mut self, ins: &Instruction) -> Result<()> {
        let with_value = matches!(ins.op, Opcode::CALL | Opcode::CALLCODE);
        let _gas = self.pop_word(ins)?;
        let _addr = self.pop_word(ins)?;
        if with_value {
            self.pop_word(ins)?;
        }
        let [_args_offset, _args_len, ret_offset, ret_len] = self.pop_words::<4>(ins)?;

        let id = self.state.counters.call;
        let success = self.fresh(Fresh::Call);
        if ins.op != Opcode::STATICCALL {
            self.reentered();
        }

        let (start, len) = (concrete(&ret_offset), concrete(&ret_len));
        self.state.memory.invalidate(start, len);
        if let (Some(start), Some(len)) = (start, len) {
            let slots = len.saturating_add(U256::from(31)) / U256::from(32);
            for idx in 0..usize::try_from(slots).unwrap_or(0) {
                let at = start.saturating_add(U256::from(idx * 32));
                let data = self.symbol(format!("return_{id}_data_{at}"));
                self.state.memory.write_word(at, data);
            }
        }
        self.state.return_data_size = match len {
            Some(len) => words::constant(self.ctx, len),
            None => self.symbol(format!("RETURNDATASIZE_{id}")),
        };
        self.push(success);
        Ok(())
    }

    /// External code may have run and written this contract's storage.
    fn reentered(&mut self) {
        self.state.storage.clear();
        self.state.transient.clear();
        self.state.counters.storage_epoch += 1;
    }
}
