//! Core results and error types

use thiserror::Error;

/// Core error type encompassing all core module errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The runtime bytecode occurs more than once inside the input.
    #[error("runtime bytecode occurs {0} times in the input, expected exactly one")]
    AmbiguousRuntime(usize),

    /// External disassembler could not be started or exited unsuccessfully.
    #[error("disassembler failed: {0}")]
    Disassembler(String),

    /// External disassembler did not finish within its deadline.
    #[error("disassembler timed out after {0} seconds")]
    DisassemblerTimeout(u64),

    /// Failed to read file at the specified path.
    #[error("could not read file '{path}': {source}")]
    FileRead {
        /// The path to the file that could not be read.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to decode hex string.
    #[error("hex decode failed: {0}")]
    HexDecode(#[from] hex::FromHexError),

    /// Block structure is malformed or inconsistent.
    #[error("invalid block structure: {0}")]
    InvalidBlockStructure(String),

    /// The immediate data for a PUSH opcode is invalid.
    #[error("invalid immediate: {0}")]
    InvalidImmediate(String),

    /// The disassembler JSON could not be parsed.
    #[error("malformed disassembly: {0}")]
    MalformedDisassembly(#[from] serde_json::Error),

    /// No runtime section was found in the bytecode.
    #[error("no runtime found")]
    NoRuntimeFound,

    /// The hex string has an odd number of digits.
    #[error("hex string has odd length: {0}")]
    OddLength(usize),

    /// A jump destination was not pushed verbatim by a PUSH instruction.
    #[error("computed jump destination at pc 0x{pc:x}: {detail}")]
    ComputedJump {
        /// PC of the offending PUSH or jump.
        pc: usize,
        /// What made the operand unusable.
        detail: String,
    },

    /// A code-copy operand could not be relocated.
    #[error("unpatchable code copy at pc 0x{pc:x}: {detail}")]
    UnpatchableCodeCopy {
        /// PC of the operand's PUSH, or of the copy itself when the operand is unknown.
        pc: usize,
        /// What made the operand unusable.
        detail: String,
    },

    /// The constructor could not be adjusted to the new runtime length.
    #[error("init code rewrite failed: {0}")]
    InitCode(String),
}

/// Core result type
pub type Result<T> = std::result::Result<T, Error>;
