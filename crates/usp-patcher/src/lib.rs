//! Uniflex shader patcher
//!
//! Reads pre-compiled shader containers into a cross-linked graph, writes the
//! graph back byte for byte, and finalises it into hardware-ready code once
//! texture formats and the result location are known.

pub mod block;
pub mod codec;
pub mod container;
pub mod context;
pub mod finalise;
pub mod flow;
pub mod graph;
pub mod hw;
pub mod ids;
pub mod moe;
pub mod pdesc;
pub mod result;
pub mod sample;
pub mod texture;
pub mod texwrite;

pub use block::{Inst, InstBlock, InstFlags};
pub use codec::ByteOrder;
pub use container::{Block, Container, HwCodeDesc};
pub use context::UspContext;
pub use finalise::{finalise, FinaliseParams, HwShader, TexStateBinding};
pub use graph::ShaderGraph;
pub use hw::{HwInst, PackFormat, RegBank, RegRef};
pub use moe::MoeState;
pub use pdesc::ProgramDesc;
pub use result::{ResultLocation, ResultTarget};
pub use texture::{TextureControl, TextureFilter, TextureFormat};
