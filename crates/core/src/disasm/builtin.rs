use super::{CfgJson, Disassembler, DisassemblyReport, NodeJson, SuccessorsJson};
use crate::cfg_ir::{EXIT_KIND, JumpType};
use crate::decoder::{Instruction, decode_bytes};
use crate::detection::{detect_auxdata, detect_deployment};
use crate::result::Result;
use crate::{HexBytes, Opcode, OpcodeExt, is_block_ending_opcode, is_terminal_opcode};
use async_trait::async_trait;
use std::collections::BTreeSet;

/// Linear-sweep block splitter.
///
/// Direct `PUSH x; JUMP(I)` pairs resolve to `x` when `x` starts a `JUMPDEST` block. Every other
/// jump keeps an edge to the exit node and is left for the repair pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinDisassembler;

#[async_trait]
impl Disassembler for BuiltinDisassembler {
    fn name(&self) -> &str {
        "builtin"
    }

    async fn disassemble(&self, bytecode: &[u8]) -> Result<DisassemblyReport> {
        let (constructor, runtime) = match detect_deployment(bytecode) {
            Some(split) => {
                let start = split.runtime_offset;
                (
                    Some(&bytecode[..start]),
                    &bytecode[start..start + split.code_len],
                )
            }
            None => {
                let end = detect_auxdata(bytecode)
                    .map(|(offset, _)| offset)
                    .unwrap_or(bytecode.len());
                (None, &bytecode[..end])
            }
        };

        tracing::debug!(
            constructor = constructor.map_or(0, <[u8]>::len),
            runtime = runtime.len(),
            "built-in disassembly"
        );

        Ok(DisassemblyReport {
            constructor_cfg: constructor.map(build_cfg_json),
            runtime_cfg: build_cfg_json(runtime),
        })
    }
}

struct RawBlock<'a> {
    offset: usize,
    instructions: &'a [Instruction],
}

/// Splits `code` into blocks and derives successor lists.
pub fn build_cfg_json(code: &[u8]) -> CfgJson {
    let (instructions, _) = decode_bytes(code, 0);
    let raw = split_blocks(&instructions);
    let exit = code.len();
    let jumpdests: BTreeSet<usize> = raw
        .iter()
        .filter(|b| b.instructions.first().map(|i| i.op) == Some(Opcode::JUMPDEST))
        .map(|b| b.offset)
        .collect();

    let mut nodes = Vec::with_capacity(raw.len() + 1);
    let mut successors = Vec::with_capacity(raw.len());
    for (idx, block) in raw.iter().enumerate() {
        let end = raw.get(idx + 1).map_or(exit, |next| next.offset);
        let last = block.instructions.last();
        let jump_type = match last.map(|i| i.op) {
            Some(Opcode::JUMP) => JumpType::Unconditional,
            Some(Opcode::JUMPI) => JumpType::Conditional,
            Some(op) if is_terminal_opcode(op) => JumpType::Terminal,
            _ => JumpType::Fall,
        };

        let direct = direct_target(block.instructions).filter(|t| jumpdests.contains(t));
        let to = match jump_type {
            JumpType::Unconditional => vec![direct.unwrap_or(exit)],
            JumpType::Conditional => {
                let mut to = vec![end, direct.unwrap_or(exit)];
                to.dedup();
                to
            }
            JumpType::Fall => vec![end],
            JumpType::Terminal => vec![exit],
        };

        nodes.push(NodeJson {
            offset: block.offset,
            length: end - block.offset,
            kind: if block.offset == 0 { "dispatcher" } else { "common" }.to_string(),
            stack_balance: stack_balance(block.instructions),
            bytecode_hex: HexBytes(code[block.offset..end].to_vec()),
            jump_type: Some(jump_type),
        });
        successors.push(SuccessorsJson {
            from: block.offset,
            to,
        });
    }

    nodes.push(NodeJson {
        offset: exit,
        length: 0,
        kind: EXIT_KIND.to_string(),
        stack_balance: 0,
        bytecode_hex: HexBytes::default(),
        jump_type: Some(JumpType::Terminal),
    });

    CfgJson { nodes, successors }
}

/// Blocks start at offset 0, at every `JUMPDEST`, and after every block-ending opcode.
fn split_blocks(instructions: &[Instruction]) -> Vec<RawBlock<'_>> {
    let mut blocks = Vec::new();
    let mut start = 0usize;
    for (idx, ins) in instructions.iter().enumerate() {
        if ins.op == Opcode::JUMPDEST && idx > start {
            blocks.push(RawBlock {
                offset: instructions[start].pc,
                instructions: &instructions[start..idx],
            });
            start = idx;
        }
        if is_block_ending_opcode(ins.op) {
            blocks.push(RawBlock {
                offset: instructions[start].pc,
                instructions: &instructions[start..=idx],
            });
            start = idx + 1;
        }
    }
    if start < instructions.len() {
        blocks.push(RawBlock {
            offset: instructions[start].pc,
            instructions: &instructions[start..],
        });
    }
    blocks
}

/// Destination of a `PUSH x; JUMP(I)` ending.
fn direct_target(instructions: &[Instruction]) -> Option<usize> {
    let [.., push, jump] = instructions else {
        return None;
    };
    if !matches!(jump.op, Opcode::JUMP | Opcode::JUMPI) {
        return None;
    }
    push.push_value().and_then(|v| usize::try_from(v).ok())
}

fn stack_balance(instructions: &[Instruction]) -> i64 {
    instructions
        .iter()
        .map(|ins| {
            let (inputs, outputs) = ins.op.stack_io();
            outputs as i64 - inputs as i64
        })
        .sum()
}
