//! Bytecode rewriter: removes dead `INVALID` blocks and relocates every code address that
//! refers past a removed byte.
//!
//! The runtime is rebuilt block by block. PUSH immediates that feed a jump or a runtime
//! `CODECOPY` keep their width and receive the relocated value. When the input carries a
//! constructor, its runtime `CODECOPY`/`RETURN` size is patched to the new runtime length.

pub mod init_code;

use crate::cfg_ir::Cfg;
use crate::detection::{Section, SectionKind, detect_deployment, locate_sections};
use crate::encoder::encode_immediate;
use crate::result::Error;
use crate::{Opcode, OpcodeExt};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A PUSH observed feeding a jump.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JumpPatch {
    /// Block that ends with the jump.
    pub block: usize,
    /// Jump destination (old offset).
    pub target: usize,
    /// PC of the PUSH that introduced the destination, `None` if it was computed.
    pub push_pc: Option<usize>,
}

/// A runtime `CODECOPY` and what is known about its code-offset operand.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeCopyPatch {
    /// Block containing the copy.
    pub block: usize,
    /// PC of the `CODECOPY` instruction.
    pub pc: usize,
    /// Concrete code offset, if known.
    pub offset: Option<usize>,
    /// PC of the PUSH that introduced the offset.
    pub offset_push_pc: Option<usize>,
    /// Concrete copy length, if known.
    pub size: Option<usize>,
}

/// Everything the rewriter needs besides the original bytes and the runtime CFG.
#[derive(Debug, Clone, Default)]
pub struct RewritePlan {
    /// Offsets of the `INVALID` blocks to remove.
    pub elide: BTreeSet<usize>,
    pub jumps: Vec<JumpPatch>,
    pub code_copies: Vec<CodeCopyPatch>,
}

/// Rewritten bytecode plus bookkeeping for the report.
#[derive(Debug, Clone)]
pub struct RewriteOutcome {
    pub bytecode: Vec<u8>,
    pub sections: Vec<Section>,
    pub removed_bytes: usize,
    /// PCs (old runtime offsets) of every PUSH whose immediate changed.
    pub patched_pushes: Vec<usize>,
}

/// Maps old runtime offsets to new ones once the elided ranges are gone.
#[derive(Debug, Clone)]
pub struct OffsetMap {
    /// Elided `(start, len)` ranges in ascending order.
    removed: Vec<(usize, usize)>,
}

impl OffsetMap {
    pub fn new(cfg: &Cfg, elide: &BTreeSet<usize>) -> Self {
        let removed = elide
            .iter()
            .filter_map(|&offset| cfg.block(offset).map(|b| (b.offset, b.length)))
            .collect();
        Self { removed }
    }

    /// Total number of removed bytes.
    pub fn removed_bytes(&self) -> usize {
        self.removed.iter().map(|(_, len)| len).sum()
    }

    /// New address of `offset`. Addresses inside a removed range collapse onto its start.
    pub fn remap(&self, offset: usize) -> usize {
        let mut shift = 0;
        for &(start, len) in &self.removed {
            if offset >= start + len {
                shift += len;
            } else if offset > start {
                return start - shift;
            } else {
                break;
            }
        }
        offset - shift
    }

    /// Returns true if `[start, start + len)` touches a removed byte.
    pub fn overlaps(&self, start: usize, len: usize) -> bool {
        self.removed
            .iter()
            .any(|&(s, l)| start < s + l && s < start + len)
    }

    /// Returns true if `pc` lies inside a removed range.
    pub fn is_removed(&self, pc: usize) -> bool {
        self.overlaps(pc, 1)
    }
}

/// Rewrites `original` (constructor ‖ runtime ‖ trailer) according to `plan`.
///
/// The runtime is located by searching for the CFG's bytes. With nothing to elide the input is
/// returned unchanged.
pub fn rewrite(original: &[u8], cfg: &Cfg, plan: &RewritePlan) -> Result<RewriteOutcome, Error> {
    let runtime = cfg.runtime_bytes();
    let sections = locate_sections(original, &runtime)?;
    let runtime_section = sections
        .iter()
        .find(|s| s.kind == SectionKind::Runtime)
        .copied()
        .ok_or(Error::NoRuntimeFound)?;

    if plan.elide.is_empty() {
        return Ok(RewriteOutcome {
            bytecode: original.to_vec(),
            sections,
            removed_bytes: 0,
            patched_pushes: Vec::new(),
        });
    }

    for &offset in &plan.elide {
        let block = cfg.block(offset).ok_or_else(|| {
            Error::InvalidBlockStructure(format!("elided block 0x{offset:x} is not in the CFG"))
        })?;
        if !block.is_invalid {
            return Err(Error::InvalidBlockStructure(format!(
                "elided block 0x{offset:x} does not end with INVALID"
            )));
        }
    }

    let map = OffsetMap::new(cfg, &plan.elide);
    let updates = collect_updates(&runtime, &map, plan)?;

    let mut patched_runtime = runtime.clone();
    for (&pc, &value) in &updates {
        write_immediate(&mut patched_runtime, pc, value)?;
    }

    let mut new_runtime = Vec::with_capacity(runtime.len() - map.removed_bytes());
    for block in cfg.blocks() {
        if block.is_exit() || plan.elide.contains(&block.offset) {
            continue;
        }
        new_runtime.extend_from_slice(&patched_runtime[block.offset..block.fallthrough()]);
    }

    let removed_bytes = map.removed_bytes();
    let constructor = &original[..runtime_section.offset];
    let trailer = &original[runtime_section.end()..];
    let new_constructor = if constructor.is_empty() {
        Vec::new()
    } else {
        patch_constructor(original, constructor, runtime_section, removed_bytes)?
    };

    let mut bytecode = new_constructor;
    bytecode.extend_from_slice(&new_runtime);
    bytecode.extend_from_slice(trailer);

    tracing::info!(
        removed_bytes,
        elided_blocks = plan.elide.len(),
        patched_pushes = updates.len(),
        "rewrote runtime bytecode"
    );

    Ok(RewriteOutcome {
        bytecode,
        sections,
        removed_bytes,
        patched_pushes: updates.keys().copied().collect(),
    })
}

/// Computes the new value of every PUSH immediate that must change.
fn collect_updates(
    runtime: &[u8],
    map: &OffsetMap,
    plan: &RewritePlan,
) -> Result<BTreeMap<usize, usize>, Error> {
    let mut updates: BTreeMap<usize, usize> = BTreeMap::new();

    for jump in &plan.jumps {
        if map.is_removed(jump.block) {
            continue;
        }
        let computed = |detail: String| Error::ComputedJump {
            pc: jump.push_pc.unwrap_or(jump.block),
            detail,
        };
        let push_pc = jump
            .push_pc
            .ok_or_else(|| computed(format!("jump from block 0x{:x} has no PUSH origin", jump.block)))?;
        let immediate = read_immediate(runtime, push_pc)?;
        if immediate != Some(jump.target) {
            return Err(computed(format!(
                "PUSH immediate {immediate:?} does not equal the jump destination 0x{:x}",
                jump.target
            )));
        }
        let new_target = map.remap(jump.target);
        if new_target != jump.target {
            record_update(&mut updates, push_pc, new_target).map_err(computed)?;
        }
    }

    for copy in &plan.code_copies {
        if map.is_removed(copy.block) {
            continue;
        }
        let unpatchable = |detail: String| Error::UnpatchableCodeCopy {
            pc: copy.offset_push_pc.unwrap_or(copy.pc),
            detail,
        };
        let offset = copy
            .offset
            .ok_or_else(|| unpatchable("code offset is not a constant".into()))?;
        let new_offset = if offset >= runtime.len() {
            offset - map.removed_bytes()
        } else {
            let size = copy
                .size
                .ok_or_else(|| unpatchable("copy of runtime code with unknown length".into()))?;
            if map.overlaps(offset, size) {
                return Err(unpatchable(format!(
                    "copied range 0x{offset:x}..0x{:x} contains removed code",
                    offset + size
                )));
            }
            map.remap(offset)
        };
        if new_offset == offset {
            continue;
        }
        let push_pc = copy
            .offset_push_pc
            .ok_or_else(|| unpatchable("code offset has no PUSH origin".into()))?;
        if read_immediate(runtime, push_pc)? != Some(offset) {
            return Err(unpatchable(format!(
                "PUSH immediate does not equal the code offset 0x{offset:x}"
            )));
        }
        record_update(&mut updates, push_pc, new_offset).map_err(unpatchable)?;
    }

    Ok(updates)
}

/// Records a new immediate for `pc`; one PUSH cannot be relocated to two different values.
fn record_update(
    updates: &mut BTreeMap<usize, usize>,
    pc: usize,
    value: usize,
) -> Result<(), String> {
    match updates.insert(pc, value) {
        Some(previous) if previous != value => Err(format!(
            "PUSH feeds addresses relocated to both 0x{previous:x} and 0x{value:x}"
        )),
        _ => Ok(()),
    }
}

/// Value of the PUSH at `pc`, `None` if it does not fit a `usize`.
fn read_immediate(runtime: &[u8], pc: usize) -> Result<Option<usize>, Error> {
    let (start, width) = immediate_range(runtime, pc)?;
    let bytes = &runtime[start..start + width];
    let leading = bytes.iter().take_while(|b| **b == 0).count();
    let significant = &bytes[leading..];
    if significant.len() > std::mem::size_of::<usize>() {
        return Ok(None);
    }
    Ok(Some(
        significant
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize),
    ))
}

fn write_immediate(runtime: &mut [u8], pc: usize, value: usize) -> Result<(), Error> {
    let (start, width) = immediate_range(runtime, pc)?;
    let data = encode_immediate(value, width)?;
    runtime[start..start + width].copy_from_slice(&data);
    tracing::debug!(
        pc = format_args!("0x{pc:x}"),
        value = format_args!("0x{value:x}"),
        "patched PUSH immediate"
    );
    Ok(())
}

fn immediate_range(runtime: &[u8], pc: usize) -> Result<(usize, usize), Error> {
    let byte = *runtime.get(pc).ok_or_else(|| {
        Error::InvalidImmediate(format!("PUSH pc 0x{pc:x} is outside the runtime"))
    })?;
    let op = Opcode::parse(byte).0;
    if !op.is_push() {
        return Err(Error::InvalidImmediate(format!(
            "expected PUSH at pc 0x{pc:x}, found {op}"
        )));
    }
    let width = op.immediate_size();
    if pc + 1 + width > runtime.len() {
        return Err(Error::InvalidImmediate(format!(
            "{op} at pc 0x{pc:x} runs past the end of the runtime"
        )));
    }
    Ok((pc + 1, width))
}

/// Patches the constructor so that it deploys the shortened runtime.
fn patch_constructor(
    original: &[u8],
    constructor: &[u8],
    runtime: Section,
    removed: usize,
) -> Result<Vec<u8>, Error> {
    let split = detect_deployment(original)
        .ok_or_else(|| Error::InitCode("constructor has no runtime CODECOPY".into()))?;
    if split.runtime_offset != runtime.offset {
        return Err(Error::InitCode(format!(
            "constructor copies from 0x{:x}, runtime starts at 0x{:x}",
            split.runtime_offset, runtime.offset
        )));
    }
    if split.copy_len < removed {
        return Err(Error::InitCode(format!(
            "constructor copies {} bytes, {} would be removed",
            split.copy_len, removed
        )));
    }
    init_code::rewrite_init_code(constructor, split.runtime_offset, split.copy_len - removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cfg_ir::BasicBlock;

    // 0: PUSH1 06 PUSH1 01 JUMPI | 5: INVALID | 6: JUMPDEST PUSH1 0c JUMP | a: INVALID
    // b: INVALID | c: JUMPDEST STOP
    fn runtime_cfg() -> Cfg {
        let blocks = vec![
            BasicBlock::new(0, vec![0x60, 0x06, 0x60, 0x01, 0x57], "dispatcher", -2, None),
            BasicBlock::new(5, vec![0xfe], "common", 0, None),
            BasicBlock::new(6, vec![0x5b, 0x60, 0x0c, 0x56], "common", 0, None),
            BasicBlock::new(10, vec![0xfe], "common", 0, None),
            BasicBlock::new(11, vec![0xfe], "common", 0, None),
            BasicBlock::new(12, vec![0x5b, 0x00], "common", 0, None),
        ];
        Cfg::from_blocks(blocks, &[(0, 5), (0, 6), (6, 12)]).expect("cfg")
    }

    fn jumps() -> Vec<JumpPatch> {
        vec![
            JumpPatch { block: 0, target: 6, push_pc: Some(0) },
            JumpPatch { block: 6, target: 12, push_pc: Some(7) },
        ]
    }

    #[test]
    fn offset_map_collapses_removed_ranges() {
        let cfg = runtime_cfg();
        let map = OffsetMap::new(&cfg, &BTreeSet::from([5, 10]));
        assert_eq!(map.removed_bytes(), 2);
        assert_eq!(map.remap(0), 0);
        assert_eq!(map.remap(6), 5);
        assert_eq!(map.remap(12), 10);
        assert!(map.overlaps(4, 2));
        assert!(!map.overlaps(6, 4));
    }

    #[test]
    fn elides_blocks_and_patches_jumps() {
        let cfg = runtime_cfg();
        let original = cfg.runtime_bytes();
        let plan = RewritePlan {
            elide: BTreeSet::from([5, 10]),
            jumps: jumps(),
            code_copies: Vec::new(),
        };
        let outcome = rewrite(&original, &cfg, &plan).expect("rewrite");
        assert_eq!(
            outcome.bytecode,
            vec![0x60, 0x05, 0x60, 0x01, 0x57, 0x5b, 0x60, 0x0a, 0x56, 0xfe, 0x5b, 0x00]
        );
        assert_eq!(outcome.removed_bytes, 2);
        assert_eq!(outcome.patched_pushes, vec![0, 7]);
    }

    #[test]
    fn nothing_to_elide_is_identity() {
        let cfg = runtime_cfg();
        let original = cfg.runtime_bytes();
        let outcome = rewrite(&original, &cfg, &RewritePlan::default()).expect("rewrite");
        assert_eq!(outcome.bytecode, original);
    }

    #[test]
    fn computed_jump_rejects_rewrite() {
        let cfg = runtime_cfg();
        let original = cfg.runtime_bytes();
        let mut plan = RewritePlan {
            elide: BTreeSet::from([5]),
            jumps: jumps(),
            code_copies: Vec::new(),
        };
        plan.jumps[1].push_pc = None;
        assert!(matches!(
            rewrite(&original, &cfg, &plan),
            Err(Error::ComputedJump { .. })
        ));

        plan.jumps[1] = JumpPatch { block: 6, target: 13, push_pc: Some(7) };
        assert!(matches!(
            rewrite(&original, &cfg, &plan),
            Err(Error::ComputedJump { .. })
        ));
    }

    #[test]
    fn trailer_code_copy_needs_push_origin() {
        let cfg = runtime_cfg();
        let original = cfg.runtime_bytes();
        let plan = RewritePlan {
            elide: BTreeSet::from([5]),
            jumps: jumps(),
            code_copies: vec![CodeCopyPatch {
                block: 6,
                pc: 9,
                offset: Some(14),
                offset_push_pc: None,
                size: Some(4),
            }],
        };
        assert!(matches!(
            rewrite(&original, &cfg, &plan),
            Err(Error::UnpatchableCodeCopy { .. })
        ));
    }

    #[test]
    fn constructor_size_follows_runtime() {
        let cfg = runtime_cfg();
        let runtime = cfg.runtime_bytes();
        // PUSH1 0e DUP1 PUSH1 0c PUSH0 CODECOPY PUSH0 RETURN INVALID 00 00 | runtime | a1 62
        let mut original = vec![
            0x60, 0x0e, 0x80, 0x60, 0x0c, 0x5f, 0x39, 0x5f, 0xf3, 0xfe, 0x00, 0x00,
        ];
        original.extend_from_slice(&runtime);
        original.extend_from_slice(&[0xa1, 0x62]);

        let plan = RewritePlan {
            elide: BTreeSet::from([5, 10]),
            jumps: jumps(),
            code_copies: Vec::new(),
        };
        let outcome = rewrite(&original, &cfg, &plan).expect("rewrite");
        assert_eq!(outcome.bytecode[1], 0x0c);
        assert_eq!(outcome.bytecode.len(), original.len() - 2);
        assert_eq!(&outcome.bytecode[outcome.bytecode.len() - 2..], &[0xa1, 0x62]);
        assert_eq!(outcome.sections.len(), 3);
    }
}
