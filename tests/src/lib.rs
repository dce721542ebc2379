//! Shared helpers for the integration tests: a label-aware assembler for hand-written
//! contracts and a minimal deployment wrapper.

use sieve_core::Opcode;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Item {
    Op(Opcode),
    Push(Vec<u8>),
    PushLabel(&'static str),
    Label(&'static str),
}

impl Item {
    fn size(&self) -> usize {
        match self {
            Item::Op(_) | Item::Label(_) => 1,
            Item::Push(bytes) => 1 + bytes.len(),
            Item::PushLabel(_) => 2,
        }
    }
}

/// Two-pass assembler. Labels emit a `JUMPDEST`; label references are `PUSH1`, so programs
/// must stay under 256 bytes.
#[derive(Debug, Clone, Default)]
pub struct Asm {
    items: Vec<Item>,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn op(mut self, op: Opcode) -> Self {
        self.items.push(Item::Op(op));
        self
    }

    pub fn ops(mut self, ops: &[Opcode]) -> Self {
        self.items.extend(ops.iter().copied().map(Item::Op));
        self
    }

    /// Shortest `PUSHn` for `value` (at least one byte).
    pub fn push(mut self, value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count().min(7);
        self.items.push(Item::Push(bytes[skip..].to_vec()));
        self
    }

    pub fn push_label(mut self, label: &'static str) -> Self {
        self.items.push(Item::PushLabel(label));
        self
    }

    /// Marks the next byte with `label` and emits `JUMPDEST` there.
    pub fn label(mut self, label: &'static str) -> Self {
        self.items.push(Item::Label(label));
        self
    }

    fn labels(&self) -> HashMap<&'static str, usize> {
        let mut pc = 0;
        let mut labels = HashMap::new();
        for item in &self.items {
            if let Item::Label(name) = item {
                assert!(labels.insert(*name, pc).is_none(), "duplicate label {name}");
            }
            pc += item.size();
        }
        labels
    }

    /// Offset of `label`.
    pub fn offset(&self, label: &str) -> usize {
        self.labels()[label]
    }

    pub fn assemble(&self) -> Vec<u8> {
        let labels = self.labels();
        let mut out = Vec::new();
        for item in &self.items {
            match item {
                Item::Op(op) => out.push(op.to_byte()),
                Item::Label(_) => out.push(Opcode::JUMPDEST.to_byte()),
                Item::Push(bytes) => {
                    out.push(Opcode::PUSH(bytes.len() as u8).to_byte());
                    out.extend_from_slice(bytes);
                }
                Item::PushLabel(name) => {
                    let target = *labels
                        .get(name)
                        .unwrap_or_else(|| panic!("unknown label {name}"));
                    let target = u8::try_from(target).expect("label beyond PUSH1 range");
                    out.push(Opcode::PUSH(1).to_byte());
                    out.push(target);
                }
            }
        }
        out
    }
}

/// Length of the constructor emitted by [`deployment`].
pub const CONSTRUCTOR_LEN: usize = 10;

/// `PUSH1 len DUP1 PUSH1 10 PUSH0 CODECOPY PUSH0 RETURN INVALID` followed by `runtime`.
pub fn deployment(runtime: &[u8]) -> Vec<u8> {
    let len = u8::try_from(runtime.len()).expect("runtime too long for PUSH1");
    let mut out = vec![
        0x60,
        len,
        0x80,
        0x60,
        CONSTRUCTOR_LEN as u8,
        0x5f,
        0x39,
        0x5f,
        0xf3,
        0xfe,
    ];
    out.extend_from_slice(runtime);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use Opcode::*;

    #[test]
    fn resolves_forward_labels() {
        let asm = Asm::new()
            .push_label("end")
            .op(JUMP)
            .op(INVALID)
            .label("end")
            .op(STOP);
        assert_eq!(asm.assemble(), vec![0x60, 0x04, 0x56, 0xfe, 0x5b, 0x00]);
        assert_eq!(asm.offset("end"), 4);
    }

    #[test]
    fn push_uses_shortest_width() {
        let code = Asm::new().push(0).push(0x1234).assemble();
        assert_eq!(code, vec![0x60, 0x00, 0x61, 0x12, 0x34]);
    }
}
