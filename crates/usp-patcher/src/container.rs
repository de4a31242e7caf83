//! Pre-compiled shader container
//!
//! A 12-byte header (tag, version, payload length) followed by tagged blocks.
//! The program descriptor always comes first and an end block always comes
//! last; everything between is kept in order.

use crate::block::{Inst, INST_WITH_FLAGS_SIZE};
use crate::codec::{ByteOrder, ByteReader, ByteWriter, Sink};
use crate::flow::BranchDesc;
use crate::moe::MoeState;
use crate::pdesc::ProgramDesc;
use crate::sample::{SampleDesc, UnpackDesc};
use crate::texwrite::TextureWriteDesc;
use usp_core::error::{ContainerError, Result};

/// Container tag; reads as "USPC" on a little-endian host
pub const CONTAINER_TAG: u32 = 0x4350_5355;

/// The only container version accepted
pub const CONTAINER_VERSION: u32 = 0x0000_0107;

pub const HEADER_SIZE: usize = 12;

/// Block type tags
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    ProgramDesc = 0,
    HwCode = 1,
    Branch = 2,
    Label = 3,
    Sample = 4,
    SampleUnpack = 5,
    TextureWrite = 6,
    End = 7,
}

impl BlockTag {
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::ProgramDesc,
            1 => Self::HwCode,
            2 => Self::Branch,
            3 => Self::Label,
            4 => Self::Sample,
            5 => Self::SampleUnpack,
            6 => Self::TextureWrite,
            7 => Self::End,
            _ => return None,
        })
    }
}

/// Straight-line code with the addressing state in effect at its start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwCodeDesc {
    pub moe_start: MoeState,
    pub insts: Vec<Inst>,
}

impl HwCodeDesc {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let count = r.read_u32()? as usize;
        let moe_start = MoeState::read(r)?;
        let mut insts = r.alloc_list(count, INST_WITH_FLAGS_SIZE)?;
        for _ in 0..count {
            insts.push(Inst::read(r)?);
        }
        Ok(Self { moe_start, insts })
    }

    fn write(&self, s: &mut dyn Sink) -> Result<()> {
        let count = u32::try_from(self.insts.len())
            .map_err(|_| ContainerError::TooLarge(self.insts.len()))?;
        s.put_u32(count);
        self.moe_start.write(s)?;
        for inst in &self.insts {
            inst.write(s);
        }
        Ok(())
    }
}

/// One container block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    ProgramDesc(ProgramDesc),
    HwCode(HwCodeDesc),
    Branch(BranchDesc),
    Label(u32),
    Sample(SampleDesc),
    SampleUnpack(UnpackDesc),
    TextureWrite(TextureWriteDesc),
    End,
}

impl Block {
    pub fn tag(&self) -> BlockTag {
        match self {
            Self::ProgramDesc(_) => BlockTag::ProgramDesc,
            Self::HwCode(_) => BlockTag::HwCode,
            Self::Branch(_) => BlockTag::Branch,
            Self::Label(_) => BlockTag::Label,
            Self::Sample(_) => BlockTag::Sample,
            Self::SampleUnpack(_) => BlockTag::SampleUnpack,
            Self::TextureWrite(_) => BlockTag::TextureWrite,
            Self::End => BlockTag::End,
        }
    }

    fn read(tag: BlockTag, r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(match tag {
            BlockTag::ProgramDesc => Self::ProgramDesc(ProgramDesc::read(r)?),
            BlockTag::HwCode => Self::HwCode(HwCodeDesc::read(r)?),
            BlockTag::Branch => Self::Branch(BranchDesc::read(r)?),
            BlockTag::Label => Self::Label(r.read_u32()?),
            BlockTag::Sample => Self::Sample(SampleDesc::read(r)?),
            BlockTag::SampleUnpack => Self::SampleUnpack(UnpackDesc::read(r)?),
            BlockTag::TextureWrite => Self::TextureWrite(TextureWriteDesc::read(r)?),
            BlockTag::End => Self::End,
        })
    }

    fn write(&self, w: &mut ByteWriter) -> Result<()> {
        w.put_u32(self.tag() as u32);
        match self {
            Self::ProgramDesc(d) => d.write(w),
            Self::HwCode(d) => d.write(w),
            Self::Branch(d) => d.write(w),
            Self::Label(id) => {
                w.put_u32(*id);
                Ok(())
            }
            Self::Sample(d) => d.write(w),
            Self::SampleUnpack(d) => d.write(w),
            Self::TextureWrite(d) => d.write(w),
            Self::End => Ok(()),
        }
    }
}

/// Decoded container: its byte order and block sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub byte_order: ByteOrder,
    pub blocks: Vec<Block>,
}

impl Container {
    /// Decode a container.
    ///
    /// Bytes after the declared payload are ignored; the blocks up to and
    /// including the end block must consume exactly the declared length.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ContainerError::Truncated {
                offset: data.len(),
                needed: HEADER_SIZE - data.len(),
            }
            .into());
        }

        let mut tag = [0u8; 4];
        tag.copy_from_slice(&data[0..4]);
        let Some(byte_order) = ByteOrder::detect(tag, CONTAINER_TAG) else {
            let found = u32::from_ne_bytes(tag);
            tracing::error!("Bad container tag 0x{:08x}", found);
            return Err(ContainerError::BadTag(found).into());
        };

        let mut r = ByteReader::with_base(&data[4..], byte_order, 4);
        let version = r.read_u32()?;
        if version != CONTAINER_VERSION {
            tracing::error!("Unsupported container version 0x{:08x}", version);
            return Err(ContainerError::BadVersion {
                found: version,
                expected: CONTAINER_VERSION,
            }
            .into());
        }
        let declared = r.read_u32()? as usize;

        let mut r = ByteReader::with_base(&data[HEADER_SIZE..], byte_order, HEADER_SIZE);
        let mut blocks = Vec::new();
        loop {
            let offset = r.offset();
            let raw = r.read_u32()?;
            let Some(tag) = BlockTag::from_u32(raw) else {
                tracing::error!("Unknown block tag {} at offset 0x{:x}", raw, offset);
                return Err(ContainerError::UnknownBlock { tag: raw, offset }.into());
            };
            match (tag, blocks.is_empty()) {
                (BlockTag::ProgramDesc, false) => {
                    return Err(ContainerError::DuplicateDescriptor(offset).into())
                }
                (t, true) if t != BlockTag::ProgramDesc => {
                    return Err(ContainerError::MissingDescriptor.into())
                }
                _ => {}
            }

            let block = Block::read(tag, &mut r)?;
            tracing::trace!("Read {:?} block at offset 0x{:x}", tag, offset);
            blocks.push(block);
            if tag == BlockTag::End {
                break;
            }
        }

        let consumed = r.position();
        if consumed != declared {
            tracing::error!(
                "Container declares {} payload bytes, blocks consumed {}",
                declared,
                consumed
            );
            return Err(ContainerError::SizeMismatch { declared, consumed }.into());
        }

        tracing::debug!(
            "Parsed container: {} blocks, {:?} byte order",
            blocks.len(),
            byte_order
        );
        Ok(Self { byte_order, blocks })
    }

    /// Encode the container in its byte order
    pub fn encode(&self) -> Result<Vec<u8>> {
        if !matches!(self.blocks.first(), Some(Block::ProgramDesc(_))) {
            return Err(ContainerError::MissingDescriptor.into());
        }
        if self.blocks.last() != Some(&Block::End) {
            return Err(ContainerError::MissingEnd.into());
        }

        let mut w = ByteWriter::new(self.byte_order);
        w.put_u32(CONTAINER_TAG);
        w.put_u32(CONTAINER_VERSION);
        w.put_u32(0);
        for block in &self.blocks {
            block.write(&mut w)?;
        }

        let payload = w.len() - HEADER_SIZE;
        let length = u32::try_from(payload).map_err(|_| ContainerError::TooLarge(payload))?;
        w.patch_u32(8, length);
        Ok(w.into_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::InstFlags;
    use crate::hw::{HwInst, RegRef};
    use usp_core::error::UspError;

    fn minimal(order: ByteOrder) -> Container {
        Container {
            byte_order: order,
            blocks: vec![
                Block::ProgramDesc(ProgramDesc::default()),
                Block::HwCode(HwCodeDesc {
                    moe_start: MoeState::default(),
                    insts: vec![Inst::new(
                        HwInst::mov(RegRef::temp(0), RegRef::temp(1)).unwrap(),
                        InstFlags::empty(),
                    )],
                }),
                Block::Label(3),
                Block::End,
            ],
        }
    }

    #[test]
    fn test_encode_then_parse() {
        for order in [ByteOrder::Native, ByteOrder::Swapped] {
            let c = minimal(order);
            let bytes = c.encode().unwrap();
            assert_eq!(Container::parse(&bytes).unwrap(), c);
        }
    }

    #[test]
    fn test_reversed_tag_decodes_identically() {
        let native = Container::parse(&minimal(ByteOrder::Native).encode().unwrap()).unwrap();
        let swapped = Container::parse(&minimal(ByteOrder::Swapped).encode().unwrap()).unwrap();
        assert_eq!(swapped.byte_order, ByteOrder::Swapped);
        assert_eq!(native.blocks, swapped.blocks);
    }

    #[test]
    fn test_bad_header() {
        let mut bytes = minimal(ByteOrder::Native).encode().unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            Container::parse(&bytes),
            Err(UspError::Container(ContainerError::BadTag(_)))
        ));

        let mut bytes = minimal(ByteOrder::Native).encode().unwrap();
        bytes[4..8].copy_from_slice(&0x0000_0106u32.to_ne_bytes());
        assert!(matches!(
            Container::parse(&bytes),
            Err(UspError::Container(ContainerError::BadVersion { found: 0x106, .. }))
        ));

        assert!(matches!(
            Container::parse(&bytes[..5]),
            Err(UspError::Container(ContainerError::Truncated { .. }))
        ));
    }

    #[test]
    fn test_length_must_match_blocks() {
        let mut bytes = minimal(ByteOrder::Native).encode().unwrap();
        let length = u32::from_ne_bytes(bytes[8..12].try_into().unwrap());
        bytes[8..12].copy_from_slice(&(length - 4).to_ne_bytes());
        assert!(matches!(
            Container::parse(&bytes),
            Err(UspError::Container(ContainerError::SizeMismatch { .. }))
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let c = minimal(ByteOrder::Native);
        let mut bytes = c.encode().unwrap();
        bytes.extend_from_slice(&[0xAA; 7]);
        assert_eq!(Container::parse(&bytes).unwrap(), c);
    }

    #[test]
    fn test_unknown_block_tag() {
        let mut bytes = minimal(ByteOrder::Native).encode().unwrap();
        // Replace the end tag
        let at = bytes.len() - 4;
        bytes[at..].copy_from_slice(&42u32.to_ne_bytes());
        assert!(matches!(
            Container::parse(&bytes),
            Err(UspError::Container(ContainerError::UnknownBlock { tag: 42, .. }))
        ));
    }

    #[test]
    fn test_block_order_rules() {
        let mut c = minimal(ByteOrder::Native);
        c.blocks.swap(0, 1);
        assert!(matches!(
            c.encode(),
            Err(UspError::Container(ContainerError::MissingDescriptor))
        ));

        let mut c = minimal(ByteOrder::Native);
        c.blocks.pop();
        assert!(matches!(
            c.encode(),
            Err(UspError::Container(ContainerError::MissingEnd))
        ));

        // A second descriptor is rejected on read
        let mut c = minimal(ByteOrder::Native);
        c.blocks.insert(1, Block::ProgramDesc(ProgramDesc::default()));
        let bytes = c.encode().unwrap();
        assert!(matches!(
            Container::parse(&bytes),
            Err(UspError::Container(ContainerError::DuplicateDescriptor(_)))
        ));
    }

    #[test]
    fn test_missing_end_is_truncation() {
        let mut bytes = minimal(ByteOrder::Native).encode().unwrap();
        bytes.truncate(bytes.len() - 4);
        assert!(matches!(
            Container::parse(&bytes),
            Err(UspError::Container(ContainerError::Truncated { .. }))
        ));
    }
}
