//! Hardware instruction subset
//!
//! Instructions are 64 bits wide, stored as two 32-bit words. Only the fields
//! the patcher needs are decoded: the opcode class, register operands, branch
//! targets, addressing-mode control payloads and sample/unpack controls.
//!
//! Layout (bit ranges are half-open):
//! - word0: `src2.num[0..7] src1.num[7..14] src0.num[14..21]
//!   src0.bank[21..24] src1.bank[24..27] src2.bank[27..30]`
//! - word1: `dest.num[0..7] dest.bank[7..10] mask[10..14] op[14..26]
//!   sync_start[26] opcode[27..32]`

use crate::codec::{ByteReader, Sink};
use serde::Serialize;
use usp_core::error::{DecodeError, FinaliseError};

/// Size of one encoded instruction in bytes
pub const INST_SIZE: usize = 8;

/// Highest register number an operand field can hold
pub const MAX_REG_NUM: u16 = 0x7F;

/// Immediate-bank register reading as 0.0
pub const IMM_ZERO: u16 = 0;
/// Immediate-bank register reading as 1.0
pub const IMM_ONE: u16 = 1;

const OPCODE_SHIFT: u32 = 27;
const SYNC_START_BIT: u32 = 1 << 26;
const MASK_SHIFT: u32 = 10;
const BRANCH_TARGET_BITS: u32 = 20;

#[inline]
fn bits(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1u32 << width) - 1)
}

#[inline]
fn with_bits(word: u32, shift: u32, width: u32, value: u32) -> u32 {
    let mask = ((1u32 << width) - 1) << shift;
    (word & !mask) | ((value << shift) & mask)
}

/// Recognised opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Opcode {
    Fmad = 0x00,
    Fadd = 0x01,
    Fmul = 0x02,
    Fdp3 = 0x03,
    Fdp4 = 0x04,
    Fmin = 0x05,
    Fmax = 0x06,
    Fsfu = 0x07,
    Pckunpck = 0x08,
    Test = 0x09,
    Movc = 0x0A,
    Imae = 0x0B,
    Ldst = 0x0C,
    Mov = 0x0D,
    Smp = 0x10,
    SmpBias = 0x11,
    SmpReplace = 0x12,
    SmpGrad = 0x13,
    Emit = 0x1C,
    Flow = 0x1D,
    MoeCtrl = 0x1E,
    Nop = 0x1F,
}

impl Opcode {
    pub fn from_bits(v: u8) -> Option<Self> {
        Some(match v {
            0x00 => Self::Fmad,
            0x01 => Self::Fadd,
            0x02 => Self::Fmul,
            0x03 => Self::Fdp3,
            0x04 => Self::Fdp4,
            0x05 => Self::Fmin,
            0x06 => Self::Fmax,
            0x07 => Self::Fsfu,
            0x08 => Self::Pckunpck,
            0x09 => Self::Test,
            0x0A => Self::Movc,
            0x0B => Self::Imae,
            0x0C => Self::Ldst,
            0x0D => Self::Mov,
            0x10 => Self::Smp,
            0x11 => Self::SmpBias,
            0x12 => Self::SmpReplace,
            0x13 => Self::SmpGrad,
            0x1C => Self::Emit,
            0x1D => Self::Flow,
            0x1E => Self::MoeCtrl,
            0x1F => Self::Nop,
            _ => return None,
        })
    }

    /// Texture sample opcodes
    pub fn is_sample(self) -> bool {
        matches!(
            self,
            Self::Smp | Self::SmpBias | Self::SmpReplace | Self::SmpGrad
        )
    }
}

/// Register file selector
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RegBank {
    Temp = 0,
    Output = 1,
    PrimaryAttr = 2,
    SecondaryAttr = 3,
    Immediate = 4,
    Index = 5,
    Internal = 6,
    Global = 7,
}

impl RegBank {
    fn from_bits(v: u32) -> Self {
        match v & 0x7 {
            0 => Self::Temp,
            1 => Self::Output,
            2 => Self::PrimaryAttr,
            3 => Self::SecondaryAttr,
            4 => Self::Immediate,
            5 => Self::Index,
            6 => Self::Internal,
            _ => Self::Global,
        }
    }

    /// Parse a bank stored in a 16-bit container field
    pub fn from_u16(v: u16) -> Result<Self, DecodeError> {
        if v > 7 {
            return Err(DecodeError::InvalidEnum {
                field: "register bank",
                value: v as u32,
            });
        }
        Ok(Self::from_bits(v as u32))
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Temp => "r",
            Self::Output => "o",
            Self::PrimaryAttr => "pa",
            Self::SecondaryAttr => "sa",
            Self::Immediate => "imm",
            Self::Index => "idx",
            Self::Internal => "i",
            Self::Global => "g",
        }
    }
}

/// A register reference: bank plus register number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RegRef {
    pub bank: RegBank,
    pub num: u16,
}

impl RegRef {
    pub const fn new(bank: RegBank, num: u16) -> Self {
        Self { bank, num }
    }

    pub const fn temp(num: u16) -> Self {
        Self::new(RegBank::Temp, num)
    }

    /// Read a `bank: u16, num: u16` pair
    pub fn read(r: &mut ByteReader<'_>) -> usp_core::Result<Self> {
        let bank = RegBank::from_u16(r.read_u16()?)?;
        let num = r.read_u16()?;
        Ok(Self::new(bank, num))
    }

    pub fn write(&self, s: &mut dyn Sink) {
        s.put_u16(self.bank as u16);
        s.put_u16(self.num);
    }

    /// The register `by` slots further along the same bank
    pub fn offset(self, by: u16) -> Self {
        Self {
            bank: self.bank,
            num: self.num.wrapping_add(by),
        }
    }
}

impl std::fmt::Display for RegRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.bank.name(), self.num)
    }
}

/// Instruction operand slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Operand {
    Dest,
    Src0,
    Src1,
    Src2,
}

impl Operand {
    pub const ALL: [Operand; 4] = [Self::Dest, Self::Src0, Self::Src1, Self::Src2];
}

/// Flow-control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowOp {
    /// Relative branch
    Br,
    /// Absolute branch
    Ba,
    Call,
    /// Return through the link register
    Lapc,
}

/// Addressing-mode control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoeOp {
    /// Set increment/swizzle mode of every operand slot
    Smoa,
    /// Set base offsets of the selected slots
    Smbo,
    /// Set the format-control flags
    Setfc,
}

/// Decoded controls of a sample instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleControls {
    pub opcode: Opcode,
    /// Dependent-read counter slot the sample signals
    pub drc: u8,
    /// Coordinate dimensions (1-3)
    pub dimensions: u8,
    /// Result channels (1-4)
    pub channels: u8,
    pub chunk: u8,
}

/// Packed data formats understood by PCKUNPCK
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum PackFormat {
    U8 = 0,
    C10 = 1,
    F16 = 2,
    F32 = 3,
}

impl PackFormat {
    pub fn from_u8(v: u8) -> Result<Self, DecodeError> {
        match v {
            0 => Ok(Self::U8),
            1 => Ok(Self::C10),
            2 => Ok(Self::F16),
            3 => Ok(Self::F32),
            _ => Err(DecodeError::InvalidEnum {
                field: "pack format",
                value: v as u32,
            }),
        }
    }

    /// Components of this format held in one 32-bit register
    pub fn per_register(self) -> u16 {
        match self {
            Self::U8 | Self::C10 => 4,
            Self::F16 => 2,
            Self::F32 => 1,
        }
    }
}

/// One 64-bit hardware instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct HwInst {
    pub word0: u32,
    pub word1: u32,
}

impl HwInst {
    pub const fn new(word0: u32, word1: u32) -> Self {
        Self { word0, word1 }
    }

    fn with_opcode(op: Opcode) -> Self {
        Self {
            word0: 0,
            word1: (op as u32) << OPCODE_SHIFT,
        }
    }

    pub fn raw_opcode(&self) -> u8 {
        bits(self.word1, OPCODE_SHIFT, 5) as u8
    }

    /// Decode the opcode class; unknown encodings are fatal
    pub fn opcode(&self) -> Result<Opcode, DecodeError> {
        let raw = self.raw_opcode();
        Opcode::from_bits(raw).ok_or(DecodeError::UnknownOpcode {
            opcode: raw,
            word0: self.word0,
            word1: self.word1,
        })
    }

    /// Whether this instruction changes the addressing-mode state
    pub fn is_moe_control(&self) -> Result<bool, DecodeError> {
        Ok(self.opcode()? == Opcode::MoeCtrl)
    }

    /// Whether execution must start a new instruction pair here
    pub fn sync_start(&self) -> bool {
        self.word1 & SYNC_START_BIT != 0
    }

    pub fn set_sync_start(&mut self, on: bool) {
        if on {
            self.word1 |= SYNC_START_BIT;
        } else {
            self.word1 &= !SYNC_START_BIT;
        }
    }

    pub fn write_mask(&self) -> u8 {
        bits(self.word1, MASK_SHIFT, 4) as u8
    }

    pub fn set_write_mask(&mut self, mask: u8) {
        self.word1 = with_bits(self.word1, MASK_SHIFT, 4, mask as u32);
    }

    fn op_field(&self, shift: u32, width: u32) -> u32 {
        bits(self.word1, shift, width)
    }

    fn set_op_field(&mut self, shift: u32, width: u32, value: u32) {
        self.word1 = with_bits(self.word1, shift, width, value);
    }

    /// Read a register operand
    pub fn operand(&self, which: Operand) -> RegRef {
        let (bank, num) = match which {
            Operand::Dest => (bits(self.word1, 7, 3), bits(self.word1, 0, 7)),
            Operand::Src0 => (bits(self.word0, 21, 3), bits(self.word0, 14, 7)),
            Operand::Src1 => (bits(self.word0, 24, 3), bits(self.word0, 7, 7)),
            Operand::Src2 => (bits(self.word0, 27, 3), bits(self.word0, 0, 7)),
        };
        RegRef::new(RegBank::from_bits(bank), num as u16)
    }

    /// Replace a register operand
    pub fn set_operand(&mut self, which: Operand, reg: RegRef) -> Result<(), FinaliseError> {
        if reg.num > MAX_REG_NUM {
            return Err(FinaliseError::Register {
                bank: reg.bank.name(),
                num: reg.num as u32,
            });
        }
        let bank = reg.bank as u32;
        let num = reg.num as u32;
        match which {
            Operand::Dest => {
                self.word1 = with_bits(self.word1, 7, 3, bank);
                self.word1 = with_bits(self.word1, 0, 7, num);
            }
            Operand::Src0 => {
                self.word0 = with_bits(self.word0, 21, 3, bank);
                self.word0 = with_bits(self.word0, 14, 7, num);
            }
            Operand::Src1 => {
                self.word0 = with_bits(self.word0, 24, 3, bank);
                self.word0 = with_bits(self.word0, 7, 7, num);
            }
            Operand::Src2 => {
                self.word0 = with_bits(self.word0, 27, 3, bank);
                self.word0 = with_bits(self.word0, 0, 7, num);
            }
        }
        Ok(())
    }

    fn expect_class(&self, expected: Opcode, name: &'static str) -> Result<(), DecodeError> {
        let op = self.opcode()?;
        if op != expected {
            return Err(DecodeError::WrongClass {
                expected: name,
                opcode: op as u8,
            });
        }
        Ok(())
    }

    //=========================================================================
    // Flow control
    //=========================================================================

    pub fn flow_op(&self) -> Result<FlowOp, DecodeError> {
        self.expect_class(Opcode::Flow, "flow-control")?;
        Ok(match self.op_field(14, 3) {
            0 => FlowOp::Br,
            1 => FlowOp::Ba,
            2 => FlowOp::Call,
            3 => FlowOp::Lapc,
            v => {
                return Err(DecodeError::InvalidEnum {
                    field: "flow operation",
                    value: v,
                })
            }
        })
    }

    pub fn branch_target(&self) -> u32 {
        bits(self.word0, 0, BRANCH_TARGET_BITS)
    }

    /// Point a branch at the instruction at `target`, found at `pc`
    pub fn set_branch_target(&mut self, pc: u32, target: u32) -> Result<(), FinaliseError> {
        let encoded = match self.flow_op() {
            Ok(FlowOp::Br) => {
                let delta = target as i64 - pc as i64;
                let limit = 1i64 << (BRANCH_TARGET_BITS - 1);
                if delta < -limit || delta >= limit {
                    return Err(FinaliseError::BranchTarget(target));
                }
                (delta as u32) & ((1 << BRANCH_TARGET_BITS) - 1)
            }
            Ok(FlowOp::Lapc) => return Ok(()),
            _ => {
                if target >= 1 << BRANCH_TARGET_BITS {
                    return Err(FinaliseError::BranchTarget(target));
                }
                target
            }
        };
        self.word0 = with_bits(self.word0, 0, BRANCH_TARGET_BITS, encoded);
        Ok(())
    }

    pub fn branch(op: FlowOp, sync_start: bool) -> Self {
        let mut inst = Self::with_opcode(Opcode::Flow);
        let code = match op {
            FlowOp::Br => 0,
            FlowOp::Ba => 1,
            FlowOp::Call => 2,
            FlowOp::Lapc => 3,
        };
        inst.set_op_field(14, 3, code);
        inst.set_sync_start(sync_start);
        inst
    }

    //=========================================================================
    // Addressing-mode control
    //=========================================================================

    pub fn moe_op(&self) -> Result<MoeOp, DecodeError> {
        self.expect_class(Opcode::MoeCtrl, "addressing-mode control")?;
        Ok(match self.op_field(14, 2) {
            0 => MoeOp::Smoa,
            1 => MoeOp::Smbo,
            2 => MoeOp::Setfc,
            v => {
                return Err(DecodeError::InvalidEnum {
                    field: "addressing-mode operation",
                    value: v,
                })
            }
        })
    }

    /// The four 9-bit slot fields of an SMOA
    pub fn smoa_fields(&self) -> [u32; 4] {
        [
            bits(self.word0, 0, 9),
            bits(self.word0, 9, 9),
            bits(self.word0, 18, 9),
            bits(self.word1, 0, 9),
        ]
    }

    pub fn smoa(fields: [u32; 4]) -> Self {
        let mut inst = Self::with_opcode(Opcode::MoeCtrl);
        inst.word0 = with_bits(inst.word0, 0, 9, fields[0]);
        inst.word0 = with_bits(inst.word0, 9, 9, fields[1]);
        inst.word0 = with_bits(inst.word0, 18, 9, fields[2]);
        inst.word1 = with_bits(inst.word1, 0, 9, fields[3]);
        inst
    }

    /// Slot mask and base offset of an SMBO
    pub fn smbo_fields(&self) -> (u8, u16) {
        (self.op_field(18, 4) as u8, bits(self.word0, 0, 12) as u16)
    }

    pub fn smbo(slot_mask: u8, offset: u16) -> Self {
        let mut inst = Self::with_opcode(Opcode::MoeCtrl);
        inst.set_op_field(14, 2, 1);
        inst.set_op_field(18, 4, slot_mask as u32);
        inst.word0 = with_bits(inst.word0, 0, 12, offset as u32);
        inst
    }

    /// EFO and colour format-control flags of a SETFC
    pub fn setfc_fields(&self) -> (bool, bool) {
        (self.word0 & 1 != 0, self.word0 & 2 != 0)
    }

    pub fn setfc(efo: bool, colour: bool) -> Self {
        let mut inst = Self::with_opcode(Opcode::MoeCtrl);
        inst.set_op_field(14, 2, 2);
        inst.word0 = (efo as u32) | ((colour as u32) << 1);
        inst
    }

    //=========================================================================
    // Texture sampling
    //=========================================================================

    /// Decode the sample controls; fatal for anything but a sample opcode
    pub fn sample_controls(&self) -> Result<SampleControls, DecodeError> {
        let opcode = self.opcode()?;
        if !opcode.is_sample() {
            return Err(DecodeError::WrongClass {
                expected: "sample",
                opcode: opcode as u8,
            });
        }
        let channels = self.op_field(17, 3) as u8;
        if !(1..=4).contains(&channels) {
            return Err(DecodeError::OutOfRange {
                field: "sample result channels",
                value: channels as u32,
                max: 4,
            });
        }
        Ok(SampleControls {
            opcode,
            drc: self.op_field(14, 1) as u8,
            dimensions: self.op_field(15, 2) as u8 + 1,
            channels,
            chunk: self.op_field(20, 2) as u8,
        })
    }

    /// Fetch chunk `chunk` of a texture using `base` as the template
    pub fn smp_chunk(
        base: &HwInst,
        dest: RegRef,
        state: RegRef,
        chunk: u8,
    ) -> Result<Self, FinaliseError> {
        let mut inst = *base;
        inst.set_operand(Operand::Dest, dest)?;
        inst.set_operand(Operand::Src1, state)?;
        inst.set_op_field(20, 2, chunk as u32);
        Ok(inst)
    }

    /// Select the dependent-read counter a sample signals
    pub fn set_drc(&mut self, drc: u8) {
        self.set_op_field(14, 1, drc as u32);
    }

    /// Build a sample instruction from parts
    pub fn smp(opcode: Opcode, drc: u8, dimensions: u8, channels: u8) -> Self {
        let mut inst = Self::with_opcode(opcode);
        inst.set_op_field(14, 1, drc as u32);
        inst.set_op_field(15, 2, dimensions.saturating_sub(1) as u32);
        inst.set_op_field(17, 3, channels as u32);
        inst.set_write_mask(0xF);
        inst
    }

    //=========================================================================
    // Synthesised data movement
    //=========================================================================

    pub fn nop() -> Self {
        Self::with_opcode(Opcode::Nop)
    }

    pub fn mov(dest: RegRef, src: RegRef) -> Result<Self, FinaliseError> {
        let mut inst = Self::with_opcode(Opcode::Mov);
        inst.set_write_mask(0xF);
        inst.set_operand(Operand::Dest, dest)?;
        inst.set_operand(Operand::Src0, src)?;
        Ok(inst)
    }

    /// Convert component `src_comp` of `src` into component `dest_comp` of `dest`
    pub fn pckunpck(
        dest: RegRef,
        dest_format: PackFormat,
        dest_comp: u8,
        src: RegRef,
        src_format: PackFormat,
        src_comp: u8,
    ) -> Result<Self, FinaliseError> {
        let mut inst = Self::with_opcode(Opcode::Pckunpck);
        inst.set_write_mask(1 << (dest_comp & 3));
        inst.set_op_field(14, 2, dest_format as u32);
        inst.set_op_field(16, 2, src_format as u32);
        inst.set_op_field(18, 2, src_comp as u32);
        inst.set_op_field(20, 2, dest_comp as u32);
        inst.set_operand(Operand::Dest, dest)?;
        inst.set_operand(Operand::Src0, src)?;
        Ok(inst)
    }

    /// Formats and components of a PCKUNPCK: (dest fmt, dest comp, src fmt, src comp)
    pub fn pckunpck_fields(&self) -> (u8, u8, u8, u8) {
        (
            self.op_field(14, 2) as u8,
            self.op_field(20, 2) as u8,
            self.op_field(16, 2) as u8,
            self.op_field(18, 2) as u8,
        )
    }

    /// Integer multiply-add: `dest = a * b + c`
    pub fn imae(dest: RegRef, a: RegRef, b: RegRef, c: RegRef) -> Result<Self, FinaliseError> {
        let mut inst = Self::with_opcode(Opcode::Imae);
        inst.set_write_mask(0xF);
        inst.set_operand(Operand::Dest, dest)?;
        inst.set_operand(Operand::Src0, a)?;
        inst.set_operand(Operand::Src1, b)?;
        inst.set_operand(Operand::Src2, c)?;
        Ok(inst)
    }

    /// Store `data` to `base + offset + dword * 4`
    pub fn store(base: RegRef, offset: RegRef, data: RegRef, dword: u8) -> Result<Self, FinaliseError> {
        let mut inst = Self::with_opcode(Opcode::Ldst);
        inst.set_op_field(14, 1, 1);
        inst.set_op_field(15, 4, dword as u32);
        inst.set_operand(Operand::Src0, base)?;
        inst.set_operand(Operand::Src1, offset)?;
        inst.set_operand(Operand::Src2, data)?;
        Ok(inst)
    }

    pub fn is_store(&self) -> bool {
        self.raw_opcode() == Opcode::Ldst as u8 && self.op_field(14, 1) == 1
    }
}
