//! Instruction blocks
//!
//! A block is a run of instructions over which the addressing-mode state stays
//! constant; any control instructions that change it sit at the tail of the
//! block. Blocks are the spine of the shader graph and every other node owns
//! exactly one of them.

use crate::codec::{ByteReader, Sink};
use crate::hw::{HwInst, Operand};
use crate::ids::{BranchId, LabelId, SampleId, TexWriteId, UnpackId};
use crate::moe::MoeState;
use bitflags::bitflags;
use std::mem;
use usp_core::error::Result;

/// Wire size of one instruction with its flags
pub const INST_WITH_FLAGS_SIZE: usize = 12;

bitflags! {
    /// Per-instruction flags carried alongside the encoding
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InstFlags: u32 {
        /// Internal registers hold live data before this instruction
        const ILR_LIVE_BEFORE = 0x01;
        /// The destination is the shader result
        const RESULT_DEST = 0x02;
        const RESULT_SRC0 = 0x04;
        const RESULT_SRC1 = 0x08;
        const RESULT_SRC2 = 0x10;
    }
}

impl InstFlags {
    /// Operands flagged as referring to the shader result
    pub fn result_operands(self) -> impl Iterator<Item = Operand> {
        [
            (Self::RESULT_DEST, Operand::Dest),
            (Self::RESULT_SRC0, Operand::Src0),
            (Self::RESULT_SRC1, Operand::Src1),
            (Self::RESULT_SRC2, Operand::Src2),
        ]
        .into_iter()
        .filter(move |(flag, _)| self.contains(*flag))
        .map(|(_, operand)| operand)
    }
}

/// An instruction and its flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Inst {
    pub hw: HwInst,
    pub flags: InstFlags,
}

impl Inst {
    pub fn new(hw: HwInst, flags: InstFlags) -> Self {
        Self { hw, flags }
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let word0 = r.read_u32()?;
        let word1 = r.read_u32()?;
        let flags = InstFlags::from_bits_retain(r.read_u32()?);
        Ok(Self::new(HwInst::new(word0, word1), flags))
    }

    pub fn write(&self, s: &mut dyn Sink) {
        s.put_u32(self.hw.word0);
        s.put_u32(self.hw.word1);
        s.put_u32(self.flags.bits());
    }
}

/// Which node a block belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockOwner {
    /// Plain code from the hardware-code block with this sequence number
    Code { group: u32 },
    Label(LabelId),
    Branch(BranchId),
    Sample(SampleId),
    SampleUnpack(UnpackId),
    TextureWrite(TexWriteId),
    /// Filled with set-up code when the shader is finalised
    Prologue,
}

/// One block of the instruction spine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstBlock {
    pub owner: BlockOwner,
    pub insts: Vec<Inst>,
    pub moe_start: MoeState,
    pub moe_end: MoeState,
    /// The block is a branch destination that must begin an instruction pair
    pub align_to_pair: bool,
}

impl InstBlock {
    /// An empty block in a constant addressing state
    pub fn empty(owner: BlockOwner, moe: MoeState) -> Self {
        Self {
            owner,
            insts: Vec::new(),
            moe_start: moe,
            moe_end: moe,
            align_to_pair: false,
        }
    }

    pub fn len(&self) -> usize {
        self.insts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }
}

/// A split-out run of code with its addressing state at either end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRun {
    pub insts: Vec<Inst>,
    pub moe_start: MoeState,
    pub moe_end: MoeState,
}

impl CodeRun {
    fn empty(state: MoeState) -> Self {
        Self {
            insts: Vec::new(),
            moe_start: state,
            moe_end: state,
        }
    }
}

/// Split a flat instruction list into runs of constant addressing state.
///
/// A new run starts at the first ordinary instruction after one or more
/// control instructions; those control instructions end the previous run and
/// their combined effect becomes its end state. A list without control
/// instructions yields exactly one run and an empty list yields none.
pub fn split_code(insts: Vec<Inst>, start: MoeState) -> Result<Vec<CodeRun>> {
    let mut runs = Vec::new();
    let mut state = start;
    let mut current = CodeRun::empty(state);
    let mut saw_control = false;

    for inst in insts {
        let is_control = inst.hw.is_moe_control()?;
        if !is_control && saw_control {
            current.moe_end = state;
            runs.push(mem::replace(&mut current, CodeRun::empty(state)));
            saw_control = false;
        }
        if is_control {
            state.apply(&inst.hw)?;
            saw_control = true;
        }
        current.insts.push(inst);
    }

    if !current.insts.is_empty() {
        current.moe_end = state;
        runs.push(current);
    }
    Ok(runs)
}
