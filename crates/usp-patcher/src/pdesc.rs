//! Program descriptor
//!
//! Top-level metadata of a pre-compiled shader: register usage, the
//! secondary-attribute layout, the loads that must run before the program
//! and the label ids marking its special points.

use crate::codec::{write_sized, ByteReader, ByteWriter, Sink};
use crate::hw::{HwInst, RegBank, RegRef, INST_SIZE};
use bitflags::bitflags;
use serde::Serialize;
use usp_core::error::{ContainerError, DecodeError, Result};

/// Label id meaning "no such label"
pub const NO_LABEL: u32 = 0xFFFF_FFFF;

const ITER_INPUT_SIZE: usize = 9;
const CONST_LOAD_SIZE: usize = 7;
const TEX_STATE_LOAD_SIZE: usize = 6;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ProgramFlags: u32 {
        /// The result registers hold live data on entry
        const RESULT_PRELOADED = 0x01;
        /// The prologue must reset the addressing-mode state
        const MOE_RESET = 0x02;
        const TEXKILL_USED = 0x04;
        const DEPTH_FEEDBACK = 0x08;
        const PER_INSTANCE = 0x10;
    }
}

bitflags! {
    /// Which regions of the secondary attributes the program uses
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SaUsage: u32 {
        const CONSTANTS = 0x01;
        const TEXTURE_STATE = 0x02;
        const SCRATCH = 0x04;
        const INDEXED_CONSTANTS = 0x08;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ShaderType {
    Vertex,
    #[default]
    Pixel,
}

impl ShaderType {
    fn from_u32(v: u32) -> Result<Self> {
        match v {
            0 => Ok(Self::Vertex),
            1 => Ok(Self::Pixel),
            _ => Err(DecodeError::InvalidEnum {
                field: "shader type",
                value: v,
            }
            .into()),
        }
    }
}

/// How an iterated input is produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IterKind {
    /// Interpolated across the primitive
    Iterated,
    /// A texture fetched before the program runs
    PreSampled,
}

/// Iterator slots a coordinate can come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IterSource {
    TexCoord(u8),
    V0,
    V1,
    Fog,
    Position,
}

impl IterSource {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0..=9 => Self::TexCoord(v),
            10 => Self::V0,
            11 => Self::V1,
            12 => Self::Fog,
            13 => Self::Position,
            _ => {
                return Err(DecodeError::InvalidEnum {
                    field: "iterator source",
                    value: v as u32,
                }
                .into())
            }
        })
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::TexCoord(n) => n,
            Self::V0 => 10,
            Self::V1 => 11,
            Self::Fog => 12,
            Self::Position => 13,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IterFormat {
    F32,
    F16,
}

/// One value placed in the primary attributes before the program runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct IterInput {
    pub kind: IterKind,
    pub source: IterSource,
    pub components: u8,
    pub format: IterFormat,
    pub projected: bool,
    pub centroid: bool,
    /// Texture fetched for a pre-sampled input
    pub texture: u16,
    pub reg_count: u16,
}

impl IterInput {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let kind = match r.read_u8()? {
            0 => IterKind::Iterated,
            1 => IterKind::PreSampled,
            v => {
                return Err(DecodeError::InvalidEnum {
                    field: "iterated input kind",
                    value: v as u32,
                }
                .into())
            }
        };
        let source = IterSource::from_u8(r.read_u8()?)?;
        let components = r.read_u8()?;
        if !(1..=4).contains(&components) {
            return Err(DecodeError::OutOfRange {
                field: "iterated components",
                value: components as u32,
                max: 4,
            }
            .into());
        }
        let format = match r.read_u8()? {
            0 => IterFormat::F32,
            1 => IterFormat::F16,
            v => {
                return Err(DecodeError::InvalidEnum {
                    field: "iterated format",
                    value: v as u32,
                }
                .into())
            }
        };
        let flags = r.read_u8()?;
        Ok(Self {
            kind,
            source,
            components,
            format,
            projected: flags & 1 != 0,
            centroid: flags & 2 != 0,
            texture: r.read_u16()?,
            reg_count: r.read_u16()?,
        })
    }

    fn write(&self, s: &mut dyn Sink) {
        s.put_u8(match self.kind {
            IterKind::Iterated => 0,
            IterKind::PreSampled => 1,
        });
        s.put_u8(self.source.to_u8());
        s.put_u8(self.components);
        s.put_u8(match self.format {
            IterFormat::F32 => 0,
            IterFormat::F16 => 1,
        });
        s.put_u8(self.projected as u8 | (self.centroid as u8) << 1);
        s.put_u16(self.texture);
        s.put_u16(self.reg_count);
    }
}

/// Data format of a loaded constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConstFormat {
    F32,
    F16,
    C10,
    U8,
}

impl ConstFormat {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::F32,
            1 => Self::F16,
            2 => Self::C10,
            3 => Self::U8,
            _ => return None,
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::C10 => 2,
            Self::U8 => 3,
        }
    }

    /// Width of one value in bits
    pub fn width(self) -> u8 {
        match self {
            Self::F32 => 32,
            Self::F16 => 16,
            Self::C10 => 10,
            Self::U8 => 8,
        }
    }
}

/// Copy of one constant component into a secondary attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConstLoad {
    pub src_index: u16,
    pub component: u8,
    pub format: ConstFormat,
    /// Bit position of the value within the destination register
    pub shift: u8,
    pub dest: u16,
}

impl ConstLoad {
    fn read(r: &mut ByteReader<'_>, index: usize) -> Result<Self> {
        let src_index = r.read_u16()?;
        let component = r.read_u8()?;
        let raw_format = r.read_u8()?;
        let shift = r.read_u8()?;
        let dest = r.read_u16()?;

        if component > 3 {
            tracing::error!("Constant load {}: component {} out of range", index, component);
            return Err(DecodeError::ConstComponent { index, component }.into());
        }
        let Some(format) = ConstFormat::from_u8(raw_format) else {
            tracing::error!("Constant load {}: invalid format {}", index, raw_format);
            return Err(DecodeError::ConstFormat {
                index,
                format: raw_format,
            }
            .into());
        };
        let width = format.width();
        if shift % width != 0 || shift as u32 + width as u32 > 32 {
            tracing::error!(
                "Constant load {}: shift {} invalid for {:?}",
                index,
                shift,
                format
            );
            return Err(DecodeError::ConstShift {
                index,
                shift,
                format: raw_format,
            }
            .into());
        }

        Ok(Self {
            src_index,
            component,
            format,
            shift,
            dest,
        })
    }

    fn write(&self, s: &mut dyn Sink) {
        s.put_u16(self.src_index);
        s.put_u8(self.component);
        s.put_u8(self.format.to_u8());
        s.put_u8(self.shift);
        s.put_u16(self.dest);
    }
}

/// Secondary attribute receiving the state words of one texture chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TexStateLoad {
    pub texture: u16,
    pub chunk: u16,
    pub sa_reg: u16,
}

impl TexStateLoad {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            texture: r.read_u16()?,
            chunk: r.read_u16()?,
            sa_reg: r.read_u16()?,
        })
    }

    fn write(&self, s: &mut dyn Sink) {
        s.put_u16(self.texture);
        s.put_u16(self.chunk);
        s.put_u16(self.sa_reg);
    }
}

/// Program descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramDesc {
    pub flags: ProgramFlags,
    pub shader_type: ShaderType,

    pub temp_count: u16,
    pub pa_count: u16,
    pub sa_count: u16,
    pub output_count: u16,

    /// Bank the compiler wrote the result to
    pub default_result_bank: RegBank,
    pub result_reg_count: u16,
    pub result_temp_base: u16,
    pub result_output_base: u16,
    pub result_pa_base: u16,

    pub sa_usage: SaUsage,
    pub const_sa_base: u16,
    pub tex_state_sa_base: u16,
    pub scratch_sa_base: u16,

    pub program_start_label: u32,
    pub phase0_end_label: u32,
    pub phase1_start_label: u32,
    pub split_phase1_start_label: u32,

    pub texture_count: u16,

    pub brn_ids: Vec<u32>,
    pub iterated_inputs: Vec<IterInput>,
    pub mem_const_loads: Vec<ConstLoad>,
    pub reg_const_loads: Vec<ConstLoad>,
    pub tex_state_loads: Vec<TexStateLoad>,
    /// Code run once per primitive to update the secondary attributes
    pub secondary_update: Vec<HwInst>,
    /// Bitmap of output registers the program writes
    pub valid_outputs: Vec<u32>,
}

impl Default for ProgramDesc {
    fn default() -> Self {
        Self {
            flags: ProgramFlags::empty(),
            shader_type: ShaderType::Pixel,
            temp_count: 0,
            pa_count: 0,
            sa_count: 0,
            output_count: 0,
            default_result_bank: RegBank::Output,
            result_reg_count: 0,
            result_temp_base: 0,
            result_output_base: 0,
            result_pa_base: 0,
            sa_usage: SaUsage::empty(),
            const_sa_base: 0,
            tex_state_sa_base: 0,
            scratch_sa_base: 0,
            program_start_label: NO_LABEL,
            phase0_end_label: NO_LABEL,
            phase1_start_label: NO_LABEL,
            split_phase1_start_label: NO_LABEL,
            texture_count: 0,
            brn_ids: Vec::new(),
            iterated_inputs: Vec::new(),
            mem_const_loads: Vec::new(),
            reg_const_loads: Vec::new(),
            tex_state_loads: Vec::new(),
            secondary_update: Vec::new(),
            valid_outputs: Vec::new(),
        }
    }
}

fn list_count(field: &'static str, len: usize) -> Result<u16> {
    u16::try_from(len).map_err(|_| {
        DecodeError::OutOfRange {
            field,
            value: len.min(u32::MAX as usize) as u32,
            max: u16::MAX as u32,
        }
        .into()
    })
}

impl ProgramDesc {
    /// Read a descriptor block body: `size: u32` followed by the fields
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let size = r.read_u32()? as usize;
        let mut body = r.sub_reader(size)?;
        let desc = Self::read_fields(&mut body)?;
        if !body.is_empty() {
            return Err(ContainerError::SizeMismatch {
                declared: size,
                consumed: body.position(),
            }
            .into());
        }
        tracing::trace!(
            "Program descriptor: {} bytes, {} temps, {} textures",
            size,
            desc.temp_count,
            desc.texture_count
        );
        Ok(desc)
    }

    fn read_fields(r: &mut ByteReader<'_>) -> Result<Self> {
        let flags = ProgramFlags::from_bits_retain(r.read_u32()?);
        let shader_type = ShaderType::from_u32(r.read_u32()?)?;
        let temp_count = r.read_u16()?;
        let pa_count = r.read_u16()?;
        let sa_count = r.read_u16()?;
        let output_count = r.read_u16()?;

        let default_result_bank = RegBank::from_u16(r.read_u16()?)?;
        if !matches!(
            default_result_bank,
            RegBank::Temp | RegBank::Output | RegBank::PrimaryAttr
        ) {
            return Err(DecodeError::InvalidEnum {
                field: "default result bank",
                value: default_result_bank as u32,
            }
            .into());
        }
        let result_reg_count = r.read_u16()?;
        let result_temp_base = r.read_u16()?;
        let result_output_base = r.read_u16()?;
        let result_pa_base = r.read_u16()?;

        let sa_usage = SaUsage::from_bits_retain(r.read_u32()?);
        let const_sa_base = r.read_u16()?;
        let tex_state_sa_base = r.read_u16()?;
        let scratch_sa_base = r.read_u16()?;

        let program_start_label = r.read_u32()?;
        let phase0_end_label = r.read_u32()?;
        let phase1_start_label = r.read_u32()?;
        let split_phase1_start_label = r.read_u32()?;

        let texture_count = r.read_u16()?;

        let brn_count = r.read_u16()? as usize;
        let iter_count = r.read_u16()? as usize;
        let mem_const_count = r.read_u16()? as usize;
        let reg_const_count = r.read_u16()? as usize;
        let tex_state_count = r.read_u16()? as usize;
        let secondary_count = r.read_u16()? as usize;
        let valid_output_count = r.read_u16()? as usize;

        let mut brn_ids = r.alloc_list(brn_count, 4)?;
        for _ in 0..brn_count {
            brn_ids.push(r.read_u32()?);
        }

        let mut iterated_inputs = r.alloc_list(iter_count, ITER_INPUT_SIZE)?;
        for _ in 0..iter_count {
            iterated_inputs.push(IterInput::read(r)?);
        }

        let mut mem_const_loads = r.alloc_list(mem_const_count, CONST_LOAD_SIZE)?;
        for i in 0..mem_const_count {
            mem_const_loads.push(ConstLoad::read(r, i)?);
        }

        let mut reg_const_loads = r.alloc_list(reg_const_count, CONST_LOAD_SIZE)?;
        for i in 0..reg_const_count {
            reg_const_loads.push(ConstLoad::read(r, i)?);
        }

        let mut tex_state_loads = r.alloc_list(tex_state_count, TEX_STATE_LOAD_SIZE)?;
        for _ in 0..tex_state_count {
            tex_state_loads.push(TexStateLoad::read(r)?);
        }

        let mut secondary_update = r.alloc_list(secondary_count, INST_SIZE)?;
        for _ in 0..secondary_count {
            let word0 = r.read_u32()?;
            let word1 = r.read_u32()?;
            secondary_update.push(HwInst::new(word0, word1));
        }

        let mut valid_outputs = r.alloc_list(valid_output_count, 4)?;
        for _ in 0..valid_output_count {
            valid_outputs.push(r.read_u32()?);
        }

        Ok(Self {
            flags,
            shader_type,
            temp_count,
            pa_count,
            sa_count,
            output_count,
            default_result_bank,
            result_reg_count,
            result_temp_base,
            result_output_base,
            result_pa_base,
            sa_usage,
            const_sa_base,
            tex_state_sa_base,
            scratch_sa_base,
            program_start_label,
            phase0_end_label,
            phase1_start_label,
            split_phase1_start_label,
            texture_count,
            brn_ids,
            iterated_inputs,
            mem_const_loads,
            reg_const_loads,
            tex_state_loads,
            secondary_update,
            valid_outputs,
        })
    }

    /// Emit every field; shared by the measuring and the writing pass
    pub fn encode(&self, s: &mut dyn Sink) -> Result<()> {
        s.put_u32(self.flags.bits());
        s.put_u32(match self.shader_type {
            ShaderType::Vertex => 0,
            ShaderType::Pixel => 1,
        });
        s.put_u16(self.temp_count);
        s.put_u16(self.pa_count);
        s.put_u16(self.sa_count);
        s.put_u16(self.output_count);

        s.put_u16(self.default_result_bank as u16);
        s.put_u16(self.result_reg_count);
        s.put_u16(self.result_temp_base);
        s.put_u16(self.result_output_base);
        s.put_u16(self.result_pa_base);

        s.put_u32(self.sa_usage.bits());
        s.put_u16(self.const_sa_base);
        s.put_u16(self.tex_state_sa_base);
        s.put_u16(self.scratch_sa_base);

        s.put_u32(self.program_start_label);
        s.put_u32(self.phase0_end_label);
        s.put_u32(self.phase1_start_label);
        s.put_u32(self.split_phase1_start_label);

        s.put_u16(self.texture_count);

        s.put_u16(list_count("BRN id count", self.brn_ids.len())?);
        s.put_u16(list_count("iterated input count", self.iterated_inputs.len())?);
        s.put_u16(list_count("memory constant count", self.mem_const_loads.len())?);
        s.put_u16(list_count("register constant count", self.reg_const_loads.len())?);
        s.put_u16(list_count("texture state count", self.tex_state_loads.len())?);
        s.put_u16(list_count("secondary update count", self.secondary_update.len())?);
        s.put_u16(list_count("valid output count", self.valid_outputs.len())?);

        for &id in &self.brn_ids {
            s.put_u32(id);
        }
        for input in &self.iterated_inputs {
            input.write(s);
        }
        for load in self.mem_const_loads.iter().chain(&self.reg_const_loads) {
            load.write(s);
        }
        for load in &self.tex_state_loads {
            load.write(s);
        }
        for inst in &self.secondary_update {
            s.put_u32(inst.word0);
            s.put_u32(inst.word1);
        }
        for &word in &self.valid_outputs {
            s.put_u32(word);
        }
        Ok(())
    }

    /// Write the block body, size prefix included
    pub fn write(&self, out: &mut ByteWriter) -> Result<()> {
        write_sized(out, |s| self.encode(s))
    }

    /// Where the compiler placed the result
    pub fn default_result(&self) -> RegRef {
        self.result_base(self.default_result_bank)
    }

    /// First result register in `bank`
    pub fn result_base(&self, bank: RegBank) -> RegRef {
        let num = match bank {
            RegBank::Temp => self.result_temp_base,
            RegBank::PrimaryAttr => self.result_pa_base,
            _ => self.result_output_base,
        };
        RegRef::new(bank, num)
    }

    /// Ids of the program start, phase 0 end, phase 1 start and split phase 1 start labels
    pub fn special_labels(&self) -> [u32; 4] {
        [
            self.program_start_label,
            self.phase0_end_label,
            self.phase1_start_label,
            self.split_phase1_start_label,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, SizeCounter};
    use usp_core::error::UspError;

    fn sample_desc() -> ProgramDesc {
        ProgramDesc {
            flags: ProgramFlags::RESULT_PRELOADED | ProgramFlags::TEXKILL_USED,
            temp_count: 6,
            pa_count: 4,
            sa_count: 10,
            output_count: 1,
            result_reg_count: 1,
            result_temp_base: 2,
            sa_usage: SaUsage::CONSTANTS,
            program_start_label: 0,
            texture_count: 2,
            brn_ids: vec![7, 9],
            iterated_inputs: vec![IterInput {
                kind: IterKind::Iterated,
                source: IterSource::TexCoord(0),
                components: 2,
                format: IterFormat::F32,
                projected: false,
                centroid: true,
                texture: 0,
                reg_count: 2,
            }],
            mem_const_loads: vec![ConstLoad {
                src_index: 3,
                component: 1,
                format: ConstFormat::F16,
                shift: 16,
                dest: 4,
            }],
            reg_const_loads: vec![ConstLoad {
                src_index: 0,
                component: 0,
                format: ConstFormat::U8,
                shift: 24,
                dest: 0,
            }],
            tex_state_loads: vec![TexStateLoad {
                texture: 1,
                chunk: 0,
                sa_reg: 7,
            }],
            secondary_update: vec![HwInst::nop()],
            valid_outputs: vec![0x1],
            ..Default::default()
        }
    }

    fn encode(desc: &ProgramDesc) -> Vec<u8> {
        let mut w = ByteWriter::new(ByteOrder::Native);
        desc.write(&mut w).unwrap();
        w.into_bytes()
    }

    #[test]
    fn test_write_then_read() {
        let desc = sample_desc();
        let bytes = encode(&desc);
        let mut r = ByteReader::new(&bytes, ByteOrder::Native);
        assert_eq!(ProgramDesc::read(&mut r).unwrap(), desc);
        assert!(r.is_empty());
    }

    #[test]
    fn test_size_prefix_matches_measured_size() {
        let desc = sample_desc();
        let mut counter = SizeCounter::new();
        desc.encode(&mut counter).unwrap();

        let bytes = encode(&desc);
        assert_eq!(bytes.len(), 4 + counter.len());
        assert_eq!(
            u32::from_ne_bytes(bytes[0..4].try_into().unwrap()) as usize,
            counter.len()
        );
    }

    #[test]
    fn test_trailing_descriptor_bytes_rejected() {
        let mut bytes = encode(&sample_desc());
        let size = u32::from_ne_bytes(bytes[0..4].try_into().unwrap()) + 2;
        bytes[0..4].copy_from_slice(&size.to_ne_bytes());
        bytes.extend_from_slice(&[0, 0]);

        let mut r = ByteReader::new(&bytes, ByteOrder::Native);
        assert!(matches!(
            ProgramDesc::read(&mut r),
            Err(UspError::Container(ContainerError::SizeMismatch { .. }))
        ));
    }

    fn with_const_load(load: ConstLoad) -> Result<ProgramDesc> {
        let mut desc = sample_desc();
        desc.reg_const_loads = vec![load];
        let bytes = encode(&desc);
        ProgramDesc::read(&mut ByteReader::new(&bytes, ByteOrder::Native))
    }

    #[test]
    fn test_const_load_validation() {
        let good = ConstLoad {
            src_index: 1,
            component: 3,
            format: ConstFormat::C10,
            shift: 20,
            dest: 2,
        };
        assert!(with_const_load(good).is_ok());

        let err = with_const_load(ConstLoad {
            component: 4,
            ..good
        })
        .unwrap_err();
        assert!(matches!(
            err,
            UspError::Decode(DecodeError::ConstComponent { index: 0, component: 4 })
        ));

        // 10-bit values must sit on a 10-bit boundary
        let err = with_const_load(ConstLoad { shift: 15, ..good }).unwrap_err();
        assert!(matches!(err, UspError::Decode(DecodeError::ConstShift { .. })));

        // and must fit inside the register
        let err = with_const_load(ConstLoad { shift: 30, ..good }).unwrap_err();
        assert!(matches!(err, UspError::Decode(DecodeError::ConstShift { .. })));

        let err = with_const_load(ConstLoad {
            format: ConstFormat::F32,
            shift: 8,
            ..good
        })
        .unwrap_err();
        assert!(matches!(err, UspError::Decode(DecodeError::ConstShift { .. })));
    }

    #[test]
    fn test_invalid_const_format() {
        let mut bytes = encode(&sample_desc());
        // The register constant load sits after the header, counts, BRN ids,
        // the iterated input and the memory constant load.
        let fmt_at = 4 + 68 + 2 * 4 + ITER_INPUT_SIZE + CONST_LOAD_SIZE + 3;
        bytes[fmt_at] = 9;
        let err = ProgramDesc::read(&mut ByteReader::new(&bytes, ByteOrder::Native)).unwrap_err();
        assert!(matches!(
            err,
            UspError::Decode(DecodeError::ConstFormat { index: 0, format: 9 })
        ));
    }

    #[test]
    fn test_result_base_lookup() {
        let mut desc = sample_desc();
        desc.default_result_bank = RegBank::Temp;
        assert_eq!(desc.default_result(), RegRef::temp(2));
        desc.result_pa_base = 5;
        assert_eq!(
            desc.result_base(RegBank::PrimaryAttr),
            RegRef::new(RegBank::PrimaryAttr, 5)
        );
    }

    #[test]
    fn test_swapped_order() {
        let desc = sample_desc();
        let mut w = ByteWriter::new(ByteOrder::Swapped);
        desc.write(&mut w).unwrap();
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes, ByteOrder::Swapped);
        assert_eq!(ProgramDesc::read(&mut r).unwrap(), desc);
    }
}
