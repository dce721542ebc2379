use super::{PStack, eval};
use crate::{Opcode, OpcodeExt};
use crate::decoder::Instruction;
use revm::primitives::U256;
use std::collections::BTreeSet;
use std::rc::Rc;

/// Provenance of one operand-stack word.
///
/// A word pushed verbatim by a PUSH carries the push site. Arithmetic that preserves addresses
/// keeps it; anything else clears the push fields. A word is a *tag* when its value is the offset
/// of a `JUMPDEST` block and its push site is known.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagItem {
    pub push_value: Option<U256>,
    pub push_byte_count: Option<u8>,
    pub push_instr_addr: Option<usize>,
    pub push_block_offset: Option<usize>,
    pub could_be_jumpdest: bool,
}

impl TagItem {
    /// An unknown word.
    pub fn unknown() -> Self {
        Self::default()
    }

    /// A known word with no push site.
    pub fn constant(value: U256) -> Self {
        Self {
            push_value: Some(value),
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_tag(&self) -> bool {
        self.could_be_jumpdest && self.push_instr_addr.is_some()
    }

    /// Value as a code offset, if known and small enough.
    pub fn as_offset(&self) -> Option<usize> {
        self.push_value.and_then(|v| usize::try_from(v).ok())
    }
}

/// Operand stack that tracks where jump addresses come from.
///
/// Only concrete values are tracked; anything unknown becomes [`TagItem::unknown`].
#[derive(Debug, Clone)]
pub struct TagStack {
    stack: PStack<TagItem>,
    jumpdests: Rc<BTreeSet<usize>>,
}

impl TagStack {
    pub fn new(jumpdests: Rc<BTreeSet<usize>>) -> Self {
        Self {
            stack: PStack::new(),
            jumpdests,
        }
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn top(&self) -> Option<&TagItem> {
        self.stack.peek(0)
    }

    pub fn peek(&self, depth: usize) -> Option<&TagItem> {
        self.stack.peek(depth)
    }

    /// Values of every item that could be a jump destination, top first.
    pub fn fingerprint(&self) -> Vec<usize> {
        self.stack
            .iter()
            .filter(|item| item.could_be_jumpdest)
            .filter_map(TagItem::as_offset)
            .collect()
    }

    fn pop(&mut self) -> TagItem {
        self.stack.pop().unwrap_or_default()
    }

    fn is_jumpdest(&self, value: U256) -> bool {
        usize::try_from(value).is_ok_and(|v| self.jumpdests.contains(&v))
    }

    /// Applies one instruction. `block_offset` is the block the instruction belongs to.
    pub fn step(&mut self, ins: &Instruction, block_offset: usize) {
        match ins.op {
            Opcode::PUSH0 | Opcode::PUSH(_) => {
                let value = ins.push_value().unwrap_or_default();
                let item = TagItem {
                    push_value: Some(value),
                    push_byte_count: Some(ins.op.immediate_size() as u8),
                    push_instr_addr: Some(ins.pc),
                    push_block_offset: Some(block_offset),
                    could_be_jumpdest: self.is_jumpdest(value),
                };
                self.stack.push(item);
            }
            Opcode::DUP(n) => {
                if !self.stack.dup(n as usize) {
                    self.stack.push(TagItem::unknown());
                }
            }
            Opcode::SWAP(n) => {
                if !self.stack.swap(n as usize) {
                    tracing::debug!(pc = ins.pc, "SWAP{} underflows the tag stack", n);
                }
            }
            Opcode::PC => self.stack.push(TagItem::constant(U256::from(ins.pc))),
            Opcode::NOT => {
                let a = self.pop();
                let result = if a.is_tag() {
                    a
                } else {
                    fold(a.push_value.and_then(|v| eval::unary(ins.op, v)))
                };
                self.stack.push(result);
            }
            Opcode::SUB
            | Opcode::DIV
            | Opcode::SDIV
            | Opcode::MOD
            | Opcode::SMOD
            | Opcode::AND
            | Opcode::OR
            | Opcode::XOR
            | Opcode::SHL
            | Opcode::SHR
            | Opcode::SAR
            | Opcode::BYTE
            | Opcode::SIGNEXTEND
            | Opcode::EXP => {
                let a = self.pop();
                let b = self.pop();
                let result = match (a.is_tag(), b.is_tag()) {
                    (true, false) => a,
                    (false, true) => b,
                    (true, true) => TagItem::unknown(),
                    (false, false) => fold(concrete(ins.op, &a, &b)),
                };
                self.stack.push(result);
            }
            Opcode::ADD | Opcode::MUL => {
                let a = self.pop();
                let b = self.pop();
                let result = match (a.is_tag(), b.is_tag()) {
                    (true, false) => self.offset_tag(ins, a, &b),
                    (false, true) => self.offset_tag(ins, b, &a),
                    (true, true) => TagItem::unknown(),
                    (false, false) => fold(concrete(ins.op, &a, &b)),
                };
                self.stack.push(result);
            }
            op => {
                let (inputs, outputs) = op.stack_io();
                for _ in 0..inputs {
                    self.pop();
                }
                for _ in 0..outputs {
                    self.stack.push(TagItem::unknown());
                }
            }
        }
    }

    /// `ADD`/`MUL` of a tag with a plain word: known plain words keep the tag.
    fn offset_tag(&self, ins: &Instruction, tag: TagItem, other: &TagItem) -> TagItem {
        let (Some(t), Some(o)) = (tag.push_value, other.push_value) else {
            tracing::warn!(
                pc = format_args!("0x{:x}", ins.pc),
                op = %ins.op,
                "jump address combined with an unknown value"
            );
            return TagItem::unknown();
        };
        let Some(value) = eval::binary(ins.op, t, o) else {
            return TagItem::unknown();
        };
        TagItem {
            push_value: Some(value),
            could_be_jumpdest: self.is_jumpdest(value),
            ..tag
        }
    }
}

fn concrete(op: Opcode, a: &TagItem, b: &TagItem) -> Option<U256> {
    eval::binary(op, a.push_value?, b.push_value?)
}

fn fold(value: Option<U256>) -> TagItem {
    value.map(TagItem::constant).unwrap_or_default()
}
