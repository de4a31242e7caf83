//! Error types for the Uniflex shader patcher

use thiserror::Error;

/// Main error type for the patcher
#[derive(Error, Debug)]
pub enum UspError {
    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Finalise error: {0}")]
    Finalise(#[from] FinaliseError),

    #[error("Out of memory reserving {0} elements")]
    OutOfMemory(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(String),
}

/// Malformed or incompatible pre-compiled shader containers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("Bad container tag: 0x{0:08x}")]
    BadTag(u32),

    #[error("Unsupported container version 0x{found:08x} (expected 0x{expected:08x})")]
    BadVersion { found: u32, expected: u32 },

    #[error("Unknown block tag {tag} at offset 0x{offset:x}")]
    UnknownBlock { tag: u32, offset: usize },

    #[error("Truncated input at offset 0x{offset:x}: need {needed} more bytes")]
    Truncated { offset: usize, needed: usize },

    #[error("Payload size mismatch: header declares {declared} bytes, blocks consumed {consumed}")]
    SizeMismatch { declared: usize, consumed: usize },

    #[error("Program descriptor size mismatch: measured {measured} bytes, wrote {written}")]
    DescriptorSize { measured: usize, written: usize },

    #[error("First block must be the program descriptor")]
    MissingDescriptor,

    #[error("Block stream is not terminated by an end block")]
    MissingEnd,

    #[error("Duplicate program descriptor at offset 0x{0:x}")]
    DuplicateDescriptor(usize),

    #[error("Container exceeds the 32-bit size field ({0} bytes)")]
    TooLarge(usize),
}

/// Instruction and descriptor field decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Unknown opcode 0x{opcode:02x} in instruction 0x{word1:08x}_{word0:08x}")]
    UnknownOpcode { opcode: u8, word0: u32, word1: u32 },

    #[error("Expected {expected} instruction, found opcode 0x{opcode:02x}")]
    WrongClass { expected: &'static str, opcode: u8 },

    #[error("Invalid {field} value {value}")]
    InvalidEnum { field: &'static str, value: u32 },

    #[error("{field} value {value} exceeds maximum {max}")]
    OutOfRange { field: &'static str, value: u32, max: u32 },

    #[error("Constant load {index}: component {component} out of range")]
    ConstComponent { index: usize, component: u8 },

    #[error("Constant load {index}: invalid format {format}")]
    ConstFormat { index: usize, format: u8 },

    #[error("Constant load {index}: shift {shift} invalid for format {format}")]
    ConstShift { index: usize, shift: u8, format: u8 },
}

/// Shader graph construction failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate label id {0}")]
    DuplicateLabel(u32),

    #[error("Branch to undefined label {0}")]
    UnresolvedBranch(u32),

    #[error("Duplicate sample id {0}")]
    DuplicateSample(u32),

    #[error("Sample unpack references unknown sample {0}")]
    UnknownSample(u32),

    #[error("Sample unpack references dependent sample {0}")]
    UnpackOfDependent(u32),

    #[error("Result operand r{num} lies below the result base r{base}")]
    ResultOperand { num: u16, base: u16 },
}

/// Failures while producing hardware-ready code
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FinaliseError {
    #[error("No format set for texture {0}")]
    MissingTextureFormat(u16),

    #[error("Texture unit {unit} out of range (max {max})")]
    TextureUnit { unit: u16, max: u16 },

    #[error("Prologue needs {needed} instructions, budget is {budget}")]
    PrologueBudget { needed: usize, budget: usize },

    #[error("Texture write {id} needs {needed} temporaries, {available} available")]
    TempBudget { id: u32, needed: u16, available: u16 },

    #[error("Register {bank}:{num} cannot be encoded")]
    Register { bank: &'static str, num: u32 },

    #[error("Branch target offset {0} cannot be encoded")]
    BranchTarget(u32),
}

/// Result type alias for patcher operations
pub type Result<T> = std::result::Result<T, UspError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ContainerError::BadTag(0x12345678);
        assert_eq!(format!("{}", err), "Bad container tag: 0x12345678");

        let err = DecodeError::UnknownOpcode {
            opcode: 0x15,
            word0: 0xDEADBEEF,
            word1: 0xA8000000,
        };
        assert_eq!(
            format!("{}", err),
            "Unknown opcode 0x15 in instruction 0xa8000000_deadbeef"
        );
    }

    #[test]
    fn test_error_conversion() {
        let graph_err = GraphError::DuplicateLabel(7);
        let usp_err: UspError = graph_err.into();
        assert!(matches!(usp_err, UspError::Graph(GraphError::DuplicateLabel(7))));
        assert_eq!(format!("{}", usp_err), "Graph error: Duplicate label id 7");
    }
}
