use super::{PStack, eval};
use crate::{Opcode, OpcodeExt};
use crate::decoder::Instruction;
use revm::primitives::U256;

/// Concrete interpreter over `Option<U256>` words.
///
/// It ignores memory, storage and the environment: every value that depends on them is `None`.
/// Path generation runs it next to [`super::TagStack`] and compares the two at every jump.
#[derive(Debug, Clone, Default)]
pub struct SimplifiedExecutor {
    stack: PStack<Option<U256>>,
}

impl SimplifiedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Word `depth` positions below the top; `None` when unknown or missing.
    pub fn peek(&self, depth: usize) -> Option<U256> {
        self.stack.peek(depth).copied().flatten()
    }

    pub fn top(&self) -> Option<U256> {
        self.peek(0)
    }

    fn pop(&mut self) -> Option<U256> {
        self.stack.pop().flatten()
    }

    pub fn step(&mut self, ins: &Instruction) {
        let op = ins.op;
        match op {
            Opcode::PUSH0 | Opcode::PUSH(_) => self.stack.push(ins.push_value()),
            Opcode::DUP(n) => {
                if !self.stack.dup(n as usize) {
                    self.stack.push(None);
                }
            }
            Opcode::SWAP(n) => {
                self.stack.swap(n as usize);
            }
            Opcode::PC => self.stack.push(Some(U256::from(ins.pc))),
            _ => match op.stack_io() {
                (1, 1) => {
                    let a = self.pop();
                    self.stack.push(a.and_then(|a| eval::unary(op, a)));
                }
                (2, 1) => {
                    let a = self.pop();
                    let b = self.pop();
                    let value = match (a, b) {
                        (Some(a), Some(b)) => eval::binary(op, a, b),
                        _ => None,
                    };
                    self.stack.push(value);
                }
                (3, 1) => {
                    let a = self.pop();
                    let b = self.pop();
                    let n = self.pop();
                    let value = match (a, b, n) {
                        (Some(a), Some(b), Some(n)) => eval::ternary(op, a, b, n),
                        _ => None,
                    };
                    self.stack.push(value);
                }
                (inputs, outputs) => {
                    for _ in 0..inputs {
                        self.pop();
                    }
                    for _ in 0..outputs {
                        self.stack.push(None);
                    }
                }
            },
        }
    }
}
