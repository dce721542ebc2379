use crate::result::Error;
use crate::rewrite::init_code::find_runtime_copy;
use serde::{Deserialize, Serialize};

/// Represents the type of a bytecode section.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SectionKind {
    /// Constructor code plus any deployment data placed before the runtime.
    Init,
    /// Executable code stored and executed on-chain.
    Runtime,
    /// Everything after the runtime: CBOR metadata, constructor arguments.
    Auxdata,
}

/// Represents a detected section with its kind, starting offset, and length.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub kind: SectionKind,
    pub offset: usize, // Start position in raw bytes
    pub len: usize,    // Byte-length of the section
}

impl Section {
    /// Returns the end offset of the section (offset + len).
    pub fn end(self) -> usize {
        self.offset + self.len
    }
}

/// Where the runtime lives inside a deployment payload, as seen from the constructor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeploymentSplit {
    /// Offset the constructor copies the runtime from.
    pub runtime_offset: usize,
    /// Bytes copied by the constructor (code plus metadata).
    pub copy_len: usize,
    /// Length of the executable part, metadata excluded.
    pub code_len: usize,
}

/// Splits `bytes` around the single occurrence of `runtime`.
///
/// The runtime is the byte string the disassembler reported for the runtime CFG. It must occur
/// exactly once; the prefix becomes [`SectionKind::Init`] and the suffix
/// [`SectionKind::Auxdata`]. Empty sections are omitted.
pub fn locate_sections(bytes: &[u8], runtime: &[u8]) -> Result<Vec<Section>, Error> {
    if runtime.is_empty() || runtime.len() > bytes.len() {
        return Err(Error::NoRuntimeFound);
    }

    let hits: Vec<usize> = bytes
        .windows(runtime.len())
        .enumerate()
        .filter(|(_, window)| *window == runtime)
        .map(|(idx, _)| idx)
        .collect();

    let offset = match hits.as_slice() {
        [] => return Err(Error::NoRuntimeFound),
        [single] => *single,
        many => return Err(Error::AmbiguousRuntime(many.len())),
    };

    tracing::debug!(
        runtime_offset = offset,
        runtime_len = runtime.len(),
        total = bytes.len(),
        "located runtime inside input"
    );

    let mut sections = Vec::with_capacity(3);
    if offset > 0 {
        sections.push(Section {
            kind: SectionKind::Init,
            offset: 0,
            len: offset,
        });
    }
    sections.push(Section {
        kind: SectionKind::Runtime,
        offset,
        len: runtime.len(),
    });
    let end = offset + runtime.len();
    if end < bytes.len() {
        sections.push(Section {
            kind: SectionKind::Auxdata,
            offset: end,
            len: bytes.len() - end,
        });
    }

    validate_sections(&sections, bytes.len())?;
    Ok(sections)
}

/// Finds the constructor's runtime copy and the executable length of the copied runtime.
///
/// Returns `None` for runtime-only input, i.e. when no `CODECOPY` with constant operands is
/// followed by a `RETURN`.
pub fn detect_deployment(bytes: &[u8]) -> Option<DeploymentSplit> {
    let (runtime_offset, copy_len) = find_runtime_copy(bytes)?;
    if runtime_offset == 0 || runtime_offset + copy_len > bytes.len() {
        tracing::debug!(
            runtime_offset,
            copy_len,
            total = bytes.len(),
            "runtime copy operands out of range, treating input as runtime-only"
        );
        return None;
    }

    let copied = &bytes[runtime_offset..runtime_offset + copy_len];
    let code_len = detect_auxdata(copied).map(|(off, _)| off).unwrap_or(copy_len);
    Some(DeploymentSplit {
        runtime_offset,
        copy_len,
        code_len,
    })
}

/// Validates sections for overlaps, gaps, and bounds
pub fn validate_sections(sections: &[Section], total_len: usize) -> Result<(), Error> {
    let mut current_offset = 0;
    for section in sections {
        if section.offset != current_offset || section.end() > total_len {
            return Err(Error::InvalidBlockStructure(format!(
                "section {:?} at {}..{} breaks the layout (expected start {}, total {})",
                section.kind,
                section.offset,
                section.end(),
                current_offset,
                total_len
            )));
        }
        current_offset = section.end();
    }

    if current_offset != total_len {
        return Err(Error::InvalidBlockStructure(format!(
            "sections end at {current_offset}, input has {total_len} bytes"
        )));
    }
    Ok(())
}

/// Detects the CBOR metadata trailer emitted by solc and vyper.
///
/// The last two bytes hold the big-endian CBOR length. The candidate region must start with a
/// CBOR map header (`0xa1`..=`0xa7`) whose first key is a short text string.
///
/// # Returns
/// Optional tuple of (offset, length) of the trailer including the length suffix.
pub fn detect_auxdata(bytes: &[u8]) -> Option<(usize, usize)> {
    let len = bytes.len();
    if len < 4 {
        return None;
    }

    let cbor_len = u16::from_be_bytes([bytes[len - 2], bytes[len - 1]]) as usize;
    if cbor_len < 2 || cbor_len + 2 > len {
        return None;
    }

    let start = len - 2 - cbor_len;
    let map_header = bytes[start];
    let first_key = bytes[start + 1];
    if (0xa1..=0xa7).contains(&map_header) && (0x61..=0x77).contains(&first_key) {
        tracing::debug!(offset = start, len = cbor_len + 2, "metadata trailer detected");
        Some((start, cbor_len + 2))
    } else {
        None
    }
}
