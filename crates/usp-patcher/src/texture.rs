//! Texture formats and per-unit control hints supplied at bind time

use crate::hw::PackFormat;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Texel layouts the sampler can return
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TextureFormat {
    U8888,
    U8,
    F16F16,
    F16x4,
    F32,
    F32F32,
    F32x4,
}

impl TextureFormat {
    pub const ALL: [TextureFormat; 7] = [
        Self::U8888,
        Self::U8,
        Self::F16F16,
        Self::F16x4,
        Self::F32,
        Self::F32F32,
        Self::F32x4,
    ];

    /// Format of each channel as it arrives from the sampler
    pub fn channel_format(self) -> PackFormat {
        match self {
            Self::U8888 | Self::U8 => PackFormat::U8,
            Self::F16F16 | Self::F16x4 => PackFormat::F16,
            Self::F32 | Self::F32F32 | Self::F32x4 => PackFormat::F32,
        }
    }

    pub fn channel_count(self) -> u8 {
        match self {
            Self::U8 | Self::F32 => 1,
            Self::F16F16 | Self::F32F32 => 2,
            Self::U8888 | Self::F16x4 | Self::F32x4 => 4,
        }
    }

    /// 32-bit registers needed to hold one fetched texel
    pub fn chunk_count(self) -> u16 {
        let per = self.channel_format().per_register();
        (self.channel_count() as u16).div_ceil(per)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::U8888 => "u8888",
            Self::U8 => "u8",
            Self::F16F16 => "f16f16",
            Self::F16x4 => "f16x4",
            Self::F32 => "f32",
            Self::F32F32 => "f32f32",
            Self::F32x4 => "f32x4",
        }
    }
}

impl fmt::Display for TextureFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TextureFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.name() == lower)
            .ok_or_else(|| format!("unknown texture format '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum TextureFilter {
    #[default]
    Point,
    Bilinear,
    Trilinear,
}

/// What the caller knows about the texture bound to one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TextureControl {
    pub format: TextureFormat,
    pub filter: TextureFilter,
    pub normalized_coords: bool,
}

impl TextureControl {
    pub fn new(format: TextureFormat) -> Self {
        Self {
            format,
            filter: TextureFilter::default(),
            normalized_coords: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_counts() {
        let chunks: Vec<_> = TextureFormat::ALL.iter().map(|f| f.chunk_count()).collect();
        assert_eq!(chunks, vec![1, 1, 1, 2, 1, 2, 4]);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("F16x4".parse::<TextureFormat>().unwrap(), TextureFormat::F16x4);
        assert_eq!("u8888".parse::<TextureFormat>().unwrap(), TextureFormat::U8888);
        assert!("rgba".parse::<TextureFormat>().is_err());
        for f in TextureFormat::ALL {
            assert_eq!(f.to_string().parse::<TextureFormat>().unwrap(), f);
        }
    }
}
