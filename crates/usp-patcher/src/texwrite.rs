//! Texture-write (image store) descriptors

use crate::codec::{ByteReader, Sink};
use crate::hw::{PackFormat, RegRef};
use crate::ids::BlockId;
use crate::moe::MoeState;
use usp_core::error::{DecodeError, Result};

/// Format texels are stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TexWriteFormat {
    U8,
    F16,
    F32,
}

impl TexWriteFormat {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::U8,
            1 => Self::F16,
            2 => Self::F32,
            _ => {
                return Err(DecodeError::InvalidEnum {
                    field: "texture write format",
                    value: v as u32,
                }
                .into())
            }
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::U8 => 0,
            Self::F16 => 1,
            Self::F32 => 2,
        }
    }

    pub fn pack_format(self) -> PackFormat {
        match self {
            Self::U8 => PackFormat::U8,
            Self::F16 => PackFormat::F16,
            Self::F32 => PackFormat::F32,
        }
    }
}

/// Store of up to four channels to `base + (coord_y * stride + coord_x)` texels
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureWriteDesc {
    pub id: u32,
    pub base: RegRef,
    pub stride: RegRef,
    pub coord_x: RegRef,
    pub coord_y: RegRef,
    pub channel_count: u8,
    pub format: TexWriteFormat,
    /// First temporary the patcher may use for address and packing
    pub temp_base: u16,
    pub temp_count: u16,
    /// Registers holding each channel as F32
    pub channels: [RegRef; 4],
    pub moe: MoeState,
}

impl TextureWriteDesc {
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let id = r.read_u32()?;
        let base = RegRef::read(r)?;
        let stride = RegRef::read(r)?;
        let coord_x = RegRef::read(r)?;
        let coord_y = RegRef::read(r)?;
        let channel_count = r.read_u8()?;
        if !(1..=4).contains(&channel_count) {
            return Err(DecodeError::OutOfRange {
                field: "texture write channels",
                value: channel_count as u32,
                max: 4,
            }
            .into());
        }
        let format = TexWriteFormat::from_u8(r.read_u8()?)?;
        let temp_base = r.read_u16()?;
        let temp_count = r.read_u16()?;
        let mut channels = [RegRef::temp(0); 4];
        for channel in channels.iter_mut() {
            *channel = RegRef::read(r)?;
        }
        let moe = MoeState::read(r)?;
        Ok(Self {
            id,
            base,
            stride,
            coord_x,
            coord_y,
            channel_count,
            format,
            temp_base,
            temp_count,
            channels,
            moe,
        })
    }

    pub fn write(&self, s: &mut dyn Sink) -> Result<()> {
        s.put_u32(self.id);
        for reg in [self.base, self.stride, self.coord_x, self.coord_y] {
            reg.write(s);
        }
        s.put_u8(self.channel_count);
        s.put_u8(self.format.to_u8());
        s.put_u16(self.temp_base);
        s.put_u16(self.temp_count);
        for reg in &self.channels {
            reg.write(s);
        }
        self.moe.write(s)
    }

    /// Registers the packed texel occupies
    pub fn packed_regs(&self) -> u16 {
        (self.channel_count as u16).div_ceil(self.format.pack_format().per_register())
    }

    /// Temporaries needed: one address register plus the packed texel unless
    /// the channels are stored as they are
    pub fn temps_needed(&self) -> u16 {
        match self.format {
            TexWriteFormat::F32 => 1,
            _ => 1 + self.packed_regs(),
        }
    }
}

/// Texture-write node of the shader graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureWrite {
    pub desc: TextureWriteDesc,
    pub block: BlockId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, ByteWriter};
    use crate::hw::RegBank;

    fn desc(format: TexWriteFormat, channel_count: u8) -> TextureWriteDesc {
        TextureWriteDesc {
            id: 1,
            base: RegRef::new(RegBank::SecondaryAttr, 4),
            stride: RegRef::new(RegBank::SecondaryAttr, 5),
            coord_x: RegRef::temp(0),
            coord_y: RegRef::temp(1),
            channel_count,
            format,
            temp_base: 8,
            temp_count: 3,
            channels: [
                RegRef::temp(2),
                RegRef::temp(3),
                RegRef::temp(4),
                RegRef::temp(5),
            ],
            moe: MoeState::default(),
        }
    }

    #[test]
    fn test_reads_back() {
        let d = desc(TexWriteFormat::F16, 3);
        let mut w = ByteWriter::new(ByteOrder::Swapped);
        d.write(&mut w).unwrap();
        let bytes = w.into_bytes();
        let mut r = ByteReader::new(&bytes, ByteOrder::Swapped);
        assert_eq!(TextureWriteDesc::read(&mut r).unwrap(), d);
        assert!(r.is_empty());
    }

    #[test]
    fn test_rejects_bad_channel_count() {
        let mut w = ByteWriter::new(ByteOrder::Native);
        desc(TexWriteFormat::U8, 5).write(&mut w).unwrap();
        let bytes = w.into_bytes();
        assert!(TextureWriteDesc::read(&mut ByteReader::new(&bytes, ByteOrder::Native)).is_err());
    }

    #[test]
    fn test_temp_requirements() {
        assert_eq!(desc(TexWriteFormat::U8, 4).temps_needed(), 2);
        assert_eq!(desc(TexWriteFormat::F16, 3).temps_needed(), 3);
        assert_eq!(desc(TexWriteFormat::F32, 4).temps_needed(), 1);
    }
}
