//! Operand addressing-mode (MOE) state
//!
//! Each of the four operand slots (dest, src0, src1, src2) either steps its
//! register number by a signed increment between iterations or selects
//! components through a swizzle. Every slot also carries a base offset, and two
//! format-control flags alter how F16/colour operands are interpreted.
//!
//! Decoding accepts any bit pattern. Encoding rejects values the wire form
//! cannot represent.

use crate::codec::{ByteReader, Sink};
use crate::hw::{HwInst, MoeOp};
use usp_core::error::{DecodeError, Result};

pub const MOE_SLOTS: usize = 4;

/// Largest base offset the hardware can hold
pub const MOE_MAX_BASE_OFFSET: u16 = 0xFFF;

/// Wire size of a [`MoeState`]
pub const MOE_STATE_SIZE: usize = MOE_SLOTS * 2 + MOE_SLOTS * 2 + 4;

const WIRE_SWIZZLE_MODE: u16 = 0x8000;
const HW_SWIZZLE_MODE: u32 = 0x100;
const FLAG_EFO_FORMAT_CONTROL: u32 = 0x1;
const FLAG_COLOUR_FORMAT_CONTROL: u32 = 0x2;

/// Addressing mode of one operand slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoeSlot {
    Increment(i8),
    /// Component selectors, each 0-3
    Swizzle([u8; 4]),
}

impl Default for MoeSlot {
    fn default() -> Self {
        Self::Increment(1)
    }
}

impl MoeSlot {
    fn unpack_swizzle(code: u8) -> [u8; 4] {
        [code & 3, (code >> 2) & 3, (code >> 4) & 3, (code >> 6) & 3]
    }

    fn pack_swizzle(components: [u8; 4]) -> Result<u8> {
        let mut code = 0u8;
        for (i, &c) in components.iter().enumerate() {
            if c > 3 {
                return Err(DecodeError::OutOfRange {
                    field: "MOE swizzle component",
                    value: c as u32,
                    max: 3,
                }
                .into());
            }
            code |= c << (i * 2);
        }
        Ok(code)
    }

    pub fn from_wire(value: u16) -> Self {
        if value & WIRE_SWIZZLE_MODE != 0 {
            Self::Swizzle(Self::unpack_swizzle(value as u8))
        } else {
            Self::Increment(value as u8 as i8)
        }
    }

    pub fn to_wire(self) -> Result<u16> {
        Ok(match self {
            Self::Increment(inc) => inc as u8 as u16,
            Self::Swizzle(c) => WIRE_SWIZZLE_MODE | Self::pack_swizzle(c)? as u16,
        })
    }

    /// Decode a 9-bit SMOA slot field
    pub fn from_hw(field: u32) -> Self {
        if field & HW_SWIZZLE_MODE != 0 {
            Self::Swizzle(Self::unpack_swizzle(field as u8))
        } else {
            Self::Increment(field as u8 as i8)
        }
    }

    pub fn to_hw(self) -> Result<u32> {
        Ok(match self {
            Self::Increment(inc) => inc as u8 as u32,
            Self::Swizzle(c) => HW_SWIZZLE_MODE | Self::pack_swizzle(c)? as u32,
        })
    }
}

/// Complete addressing-mode state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MoeState {
    pub slots: [MoeSlot; MOE_SLOTS],
    pub base_offsets: [u16; MOE_SLOTS],
    pub efo_format_control: bool,
    pub colour_format_control: bool,
}

impl MoeState {
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let mut state = Self::default();
        for slot in state.slots.iter_mut() {
            *slot = MoeSlot::from_wire(r.read_u16()?);
        }
        for offset in state.base_offsets.iter_mut() {
            *offset = r.read_u16()?;
        }
        let flags = r.read_u32()?;
        state.efo_format_control = flags & FLAG_EFO_FORMAT_CONTROL != 0;
        state.colour_format_control = flags & FLAG_COLOUR_FORMAT_CONTROL != 0;
        Ok(state)
    }

    pub fn write(&self, s: &mut dyn Sink) -> Result<()> {
        for slot in &self.slots {
            s.put_u16(slot.to_wire()?);
        }
        for &offset in &self.base_offsets {
            if offset > MOE_MAX_BASE_OFFSET {
                return Err(DecodeError::OutOfRange {
                    field: "MOE base offset",
                    value: offset as u32,
                    max: MOE_MAX_BASE_OFFSET as u32,
                }
                .into());
            }
            s.put_u16(offset);
        }
        let mut flags = 0;
        if self.efo_format_control {
            flags |= FLAG_EFO_FORMAT_CONTROL;
        }
        if self.colour_format_control {
            flags |= FLAG_COLOUR_FORMAT_CONTROL;
        }
        s.put_u32(flags);
        Ok(())
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Apply `inst` if it is an addressing-mode control instruction.
    ///
    /// Returns whether it was one. Undecodable opcodes are an error.
    pub fn apply(&mut self, inst: &HwInst) -> Result<bool> {
        if !inst.is_moe_control()? {
            return Ok(false);
        }
        match inst.moe_op()? {
            MoeOp::Smoa => {
                for (slot, field) in self.slots.iter_mut().zip(inst.smoa_fields()) {
                    *slot = MoeSlot::from_hw(field);
                }
            }
            MoeOp::Smbo => {
                let (mask, offset) = inst.smbo_fields();
                for (i, base) in self.base_offsets.iter_mut().enumerate() {
                    if mask & (1 << i) != 0 {
                        *base = offset;
                    }
                }
            }
            MoeOp::Setfc => {
                let (efo, colour) = inst.setfc_fields();
                self.efo_format_control = efo;
                self.colour_format_control = colour;
            }
        }
        Ok(true)
    }

    /// Control instructions that force the default state whatever came before
    pub fn reset_sequence() -> Result<Vec<HwInst>> {
        let mut fields = [0u32; MOE_SLOTS];
        for (field, slot) in fields.iter_mut().zip(Self::default().slots) {
            *field = slot.to_hw()?;
        }
        Ok(vec![
            HwInst::smoa(fields),
            HwInst::smbo(0xF, 0),
            HwInst::setfc(false, false),
        ])
    }

    /// Control instructions that move the hardware from `self` to `target`
    pub fn transition_to(&self, target: &MoeState) -> Result<Vec<HwInst>> {
        let mut insts = Vec::new();

        if self.slots != target.slots {
            let mut fields = [0u32; MOE_SLOTS];
            for (field, slot) in fields.iter_mut().zip(target.slots) {
                *field = slot.to_hw()?;
            }
            insts.push(HwInst::smoa(fields));
        }

        // One SMBO per distinct offset, covering every slot that needs it.
        let mut pending: u8 = 0;
        for i in 0..MOE_SLOTS {
            if self.base_offsets[i] != target.base_offsets[i] {
                pending |= 1 << i;
            }
        }
        while pending != 0 {
            let first = pending.trailing_zeros() as usize;
            let offset = target.base_offsets[first];
            if offset > MOE_MAX_BASE_OFFSET {
                return Err(DecodeError::OutOfRange {
                    field: "MOE base offset",
                    value: offset as u32,
                    max: MOE_MAX_BASE_OFFSET as u32,
                }
                .into());
            }
            let mut mask = 0u8;
            for i in first..MOE_SLOTS {
                if pending & (1 << i) != 0 && target.base_offsets[i] == offset {
                    mask |= 1 << i;
                }
            }
            insts.push(HwInst::smbo(mask, offset));
            pending &= !mask;
        }

        if self.efo_format_control != target.efo_format_control
            || self.colour_format_control != target.colour_format_control
        {
            insts.push(HwInst::setfc(
                target.efo_format_control,
                target.colour_format_control,
            ));
        }

        Ok(insts)
    }
}
