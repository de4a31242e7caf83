//! Texture sample and sample-unpack descriptors
//!
//! A non-dependent sample fetches with coordinates straight from an iterator
//! slot, so it can be hoisted out of the program and performed before it runs.
//! A dependent sample uses coordinates computed by the program and carries the
//! compiler's base sample instruction. Either kind expands to one fetch per
//! texture chunk once the bound texture format is known.

use crate::block::{Inst, InstFlags};
use crate::codec::{ByteReader, Sink};
use crate::hw::{PackFormat, RegRef, SampleControls};
use crate::ids::{BlockId, SampleId, UnpackId};
use crate::moe::MoeState;
use crate::pdesc::IterSource;
use std::collections::HashMap;
use usp_core::error::{DecodeError, GraphError, Result};

const SAMPLE_KIND_NON_DEPENDENT: u32 = 0;
const SAMPLE_KIND_DEPENDENT: u32 = 1;

/// Source of one destination channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelSel {
    X,
    Y,
    Z,
    W,
    Zero,
    One,
}

impl ChannelSel {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => Self::X,
            1 => Self::Y,
            2 => Self::Z,
            3 => Self::W,
            4 => Self::Zero,
            5 => Self::One,
            _ => {
                return Err(DecodeError::InvalidEnum {
                    field: "swizzle selector",
                    value: v as u32,
                }
                .into())
            }
        })
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
            Self::W => 3,
            Self::Zero => 4,
            Self::One => 5,
        }
    }

    /// Texel channel index, if this selects one
    pub fn channel(self) -> Option<u8> {
        match self {
            Self::Zero | Self::One => None,
            other => Some(other.to_u8()),
        }
    }
}

/// Mapping from texel channels to destination channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle(pub [ChannelSel; 4]);

impl Swizzle {
    pub const IDENTITY: Swizzle = Swizzle([ChannelSel::X, ChannelSel::Y, ChannelSel::Z, ChannelSel::W]);

    pub fn from_wire(v: u32) -> Result<Self> {
        let mut sels = [ChannelSel::X; 4];
        for (i, sel) in sels.iter_mut().enumerate() {
            *sel = ChannelSel::from_u8((v >> (i * 8)) as u8)?;
        }
        Ok(Self(sels))
    }

    pub fn to_wire(self) -> u32 {
        self.0
            .iter()
            .enumerate()
            .fold(0, |acc, (i, sel)| acc | (sel.to_u8() as u32) << (i * 8))
    }

    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }
}

impl Default for Swizzle {
    fn default() -> Self {
        Self::IDENTITY
    }
}

fn read_format(r: &mut ByteReader<'_>) -> Result<PackFormat> {
    Ok(PackFormat::from_u8(r.read_u8()?)?)
}

/// Fetch whose coordinates come straight from an iterator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonDepSampleDesc {
    pub id: u32,
    pub texture: u16,
    pub coord: IterSource,
    pub projected: bool,
    pub centroid: bool,
    pub dest: RegRef,
    pub dest_flags: InstFlags,
    pub swizzle: Swizzle,
    /// Format the destination should receive
    pub format: PackFormat,
    pub moe: MoeState,
}

impl NonDepSampleDesc {
    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let id = r.read_u32()?;
        let texture = r.read_u16()?;
        let coord = IterSource::from_u8(r.read_u8()?)?;
        let sample_flags = r.read_u8()?;
        let dest = RegRef::read(r)?;
        let dest_flags = InstFlags::from_bits_retain(r.read_u32()?);
        let swizzle = Swizzle::from_wire(r.read_u32()?)?;
        let format = read_format(r)?;
        let moe = MoeState::read(r)?;
        Ok(Self {
            id,
            texture,
            coord,
            projected: sample_flags & 1 != 0,
            centroid: sample_flags & 2 != 0,
            dest,
            dest_flags,
            swizzle,
            format,
            moe,
        })
    }

    fn write(&self, s: &mut dyn Sink) -> Result<()> {
        s.put_u32(self.id);
        s.put_u16(self.texture);
        s.put_u8(self.coord.to_u8());
        s.put_u8(self.projected as u8 | (self.centroid as u8) << 1);
        self.dest.write(s);
        s.put_u32(self.dest_flags.bits());
        s.put_u32(self.swizzle.to_wire());
        s.put_u8(self.format as u8);
        self.moe.write(s)
    }
}

/// Fetch whose coordinates are computed by the program
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepSampleDesc {
    pub id: u32,
    pub texture: u16,
    /// Dependent-read counter the fetch signals
    pub drc: u8,
    pub format: PackFormat,
    /// Compiler-supplied sample instruction used as a template for each chunk
    pub base: Inst,
    pub swizzle: Swizzle,
    pub moe: MoeState,
    /// Decoded from `base` when read
    pub controls: SampleControls,
}

impl DepSampleDesc {
    pub fn new(
        id: u32,
        texture: u16,
        drc: u8,
        format: PackFormat,
        base: Inst,
        swizzle: Swizzle,
        moe: MoeState,
    ) -> Result<Self> {
        if drc > 1 {
            return Err(DecodeError::OutOfRange {
                field: "dependent read counter",
                value: drc as u32,
                max: 1,
            }
            .into());
        }
        let controls = base.hw.sample_controls()?;
        Ok(Self {
            id,
            texture,
            drc,
            format,
            base,
            swizzle,
            moe,
            controls,
        })
    }

    fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let id = r.read_u32()?;
        let texture = r.read_u16()?;
        let drc = r.read_u8()?;
        let format = read_format(r)?;
        let base = Inst::read(r)?;
        let swizzle = Swizzle::from_wire(r.read_u32()?)?;
        let moe = MoeState::read(r)?;
        Self::new(id, texture, drc, format, base, swizzle, moe)
    }

    fn write(&self, s: &mut dyn Sink) -> Result<()> {
        s.put_u32(self.id);
        s.put_u16(self.texture);
        s.put_u8(self.drc);
        s.put_u8(self.format as u8);
        self.base.write(s);
        s.put_u32(self.swizzle.to_wire());
        self.moe.write(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleDesc {
    NonDependent(NonDepSampleDesc),
    Dependent(DepSampleDesc),
}

impl SampleDesc {
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        match r.read_u32()? {
            SAMPLE_KIND_NON_DEPENDENT => Ok(Self::NonDependent(NonDepSampleDesc::read(r)?)),
            SAMPLE_KIND_DEPENDENT => Ok(Self::Dependent(DepSampleDesc::read(r)?)),
            v => Err(DecodeError::InvalidEnum {
                field: "sample kind",
                value: v,
            }
            .into()),
        }
    }

    pub fn write(&self, s: &mut dyn Sink) -> Result<()> {
        match self {
            Self::NonDependent(d) => {
                s.put_u32(SAMPLE_KIND_NON_DEPENDENT);
                d.write(s)
            }
            Self::Dependent(d) => {
                s.put_u32(SAMPLE_KIND_DEPENDENT);
                d.write(s)
            }
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            Self::NonDependent(d) => d.id,
            Self::Dependent(d) => d.id,
        }
    }

    pub fn texture(&self) -> u16 {
        match self {
            Self::NonDependent(d) => d.texture,
            Self::Dependent(d) => d.texture,
        }
    }

    pub fn format(&self) -> PackFormat {
        match self {
            Self::NonDependent(d) => d.format,
            Self::Dependent(d) => d.format,
        }
    }

    pub fn moe(&self) -> MoeState {
        match self {
            Self::NonDependent(d) => d.moe,
            Self::Dependent(d) => d.moe,
        }
    }

    pub fn is_dependent(&self) -> bool {
        matches!(self, Self::Dependent(_))
    }
}

/// Unpack of data an earlier non-dependent sample already fetched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnpackDesc {
    pub sample_id: u32,
    pub dest: RegRef,
    pub dest_flags: InstFlags,
    pub swizzle: Swizzle,
    pub format: PackFormat,
    pub moe: MoeState,
}

impl UnpackDesc {
    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        Ok(Self {
            sample_id: r.read_u32()?,
            dest: RegRef::read(r)?,
            dest_flags: InstFlags::from_bits_retain(r.read_u32()?),
            swizzle: Swizzle::from_wire(r.read_u32()?)?,
            format: read_format(r)?,
            moe: MoeState::read(r)?,
        })
    }

    pub fn write(&self, s: &mut dyn Sink) -> Result<()> {
        s.put_u32(self.sample_id);
        self.dest.write(s);
        s.put_u32(self.dest_flags.bits());
        s.put_u32(self.swizzle.to_wire());
        s.put_u8(self.format as u8);
        self.moe.write(s)
    }
}

/// Sample node of the shader graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample {
    pub desc: SampleDesc,
    pub block: BlockId,
}

/// Sample-unpack node of the shader graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleUnpack {
    pub desc: UnpackDesc,
    pub block: BlockId,
    /// Set once the referenced sample is known
    pub source: Option<SampleId>,
}

/// Samples of one texture index, in the order they were read, and the
/// unpacks that read them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureGroup {
    pub texture: u16,
    pub samples: Vec<SampleId>,
    pub unpacks: Vec<UnpackId>,
}

/// Samples grouped by texture index, groups in order of first use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextureGroups {
    groups: Vec<TextureGroup>,
    by_texture: HashMap<u16, usize>,
}

impl TextureGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, texture: u16, sample: SampleId) {
        let index = *self.by_texture.entry(texture).or_insert_with(|| {
            self.groups.push(TextureGroup {
                texture,
                samples: Vec::new(),
                unpacks: Vec::new(),
            });
            self.groups.len() - 1
        });
        self.groups[index].samples.push(sample);
    }

    /// Record an unpack against the group of the sample it reads
    pub fn add_unpack(&mut self, texture: u16, unpack: UnpackId) {
        if let Some(&index) = self.by_texture.get(&texture) {
            self.groups[index].unpacks.push(unpack);
        }
    }

    pub fn get(&self, texture: u16) -> Option<&TextureGroup> {
        self.by_texture.get(&texture).map(|&i| &self.groups[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TextureGroup> {
        self.groups.iter()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

/// Bind every unpack to the non-dependent sample it reads
pub(crate) fn link_unpacks(
    unpacks: &mut [SampleUnpack],
    samples: &[Sample],
    by_id: &HashMap<u32, SampleId>,
) -> Result<()> {
    for (index, unpack) in unpacks.iter_mut().enumerate() {
        let wanted = unpack.desc.sample_id;
        let Some(&sample) = by_id.get(&wanted) else {
            tracing::error!("Sample unpack {} reads unknown sample {}", index, wanted);
            return Err(GraphError::UnknownSample(wanted).into());
        };
        if samples[sample.index()].desc.is_dependent() {
            tracing::error!("Sample unpack {} reads dependent sample {}", index, wanted);
            return Err(GraphError::UnpackOfDependent(wanted).into());
        }
        unpack.source = Some(sample);
    }
    Ok(())
}
