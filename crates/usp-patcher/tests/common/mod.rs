//! Container builders shared by the integration tests

#![allow(dead_code)]

use usp_patcher::block::{Inst, InstFlags};
use usp_patcher::codec::ByteOrder;
use usp_patcher::container::{Block, Container, HwCodeDesc};
use usp_patcher::flow::BranchDesc;
use usp_patcher::hw::{FlowOp, HwInst, Opcode, Operand, PackFormat, RegBank, RegRef};
use usp_patcher::moe::MoeState;
use usp_patcher::pdesc::{IterSource, ProgramDesc};
use usp_patcher::sample::{DepSampleDesc, NonDepSampleDesc, SampleDesc, Swizzle, UnpackDesc};
use usp_patcher::texwrite::{TexWriteFormat, TextureWriteDesc};

/// Descriptor whose program starts at label 0
pub fn desc() -> ProgramDesc {
    ProgramDesc {
        program_start_label: 0,
        temp_count: 8,
        ..Default::default()
    }
}

pub fn container(desc: ProgramDesc, blocks: Vec<Block>) -> Container {
    container_in(ByteOrder::Native, desc, blocks)
}

pub fn container_in(order: ByteOrder, desc: ProgramDesc, blocks: Vec<Block>) -> Container {
    let mut all = vec![Block::ProgramDesc(desc)];
    all.extend(blocks);
    all.push(Block::End);
    Container {
        byte_order: order,
        blocks: all,
    }
}

pub fn mov(dest: RegRef, src: RegRef, flags: InstFlags) -> Inst {
    Inst::new(HwInst::mov(dest, src).unwrap(), flags)
}

pub fn code(insts: Vec<Inst>) -> Block {
    code_in(MoeState::default(), insts)
}

pub fn code_in(moe: MoeState, insts: Vec<Inst>) -> Block {
    Block::HwCode(HwCodeDesc {
        moe_start: moe,
        insts,
    })
}

pub fn branch(target: u32, op: FlowOp, sync_start: bool) -> Block {
    let inst = Inst::new(HwInst::branch(op, sync_start), InstFlags::empty());
    Block::Branch(BranchDesc::new(target, inst, MoeState::default()).unwrap())
}

pub fn non_dep_sample(id: u32, texture: u16, dest: RegRef, format: PackFormat) -> NonDepSampleDesc {
    NonDepSampleDesc {
        id,
        texture,
        coord: IterSource::TexCoord(0),
        projected: false,
        centroid: false,
        dest,
        dest_flags: InstFlags::empty(),
        swizzle: Swizzle::IDENTITY,
        format,
        moe: MoeState::default(),
    }
}

pub fn sample(id: u32, texture: u16, dest: RegRef) -> Block {
    Block::Sample(SampleDesc::NonDependent(non_dep_sample(
        id,
        texture,
        dest,
        PackFormat::F32,
    )))
}

/// Dependent sample fetching into `dest` with coordinates from r0
pub fn dep_sample(id: u32, texture: u16, dest: RegRef, format: PackFormat) -> Block {
    let mut hw = HwInst::smp(Opcode::Smp, 0, 2, 4);
    hw.set_operand(Operand::Dest, dest).unwrap();
    hw.set_operand(Operand::Src0, RegRef::temp(0)).unwrap();
    let desc = DepSampleDesc::new(
        id,
        texture,
        0,
        format,
        Inst::new(hw, InstFlags::empty()),
        Swizzle::IDENTITY,
        MoeState::default(),
    )
    .unwrap();
    Block::Sample(SampleDesc::Dependent(desc))
}

pub fn unpack(sample_id: u32, dest: RegRef) -> Block {
    Block::SampleUnpack(UnpackDesc {
        sample_id,
        dest,
        dest_flags: InstFlags::empty(),
        swizzle: Swizzle::IDENTITY,
        format: PackFormat::F32,
        moe: MoeState::default(),
    })
}

pub fn texture_write(id: u32, format: TexWriteFormat, channels: u8, temp_count: u16) -> Block {
    Block::TextureWrite(TextureWriteDesc {
        id,
        base: RegRef::new(RegBank::SecondaryAttr, 0),
        stride: RegRef::new(RegBank::SecondaryAttr, 1),
        coord_x: RegRef::temp(0),
        coord_y: RegRef::temp(1),
        channel_count: channels,
        format,
        temp_base: 10,
        temp_count,
        channels: [
            RegRef::temp(2),
            RegRef::temp(3),
            RegRef::temp(4),
            RegRef::temp(5),
        ],
        moe: MoeState::default(),
    })
}
