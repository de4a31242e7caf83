//! Finalisation against bound texture formats and result locations

mod common;

use common::*;
use usp_core::config::PatcherConfig;
use usp_core::error::{FinaliseError, UspError};
use usp_patcher::block::InstFlags;
use usp_patcher::container::Block;
use usp_patcher::hw::{FlowOp, Opcode, Operand, PackFormat, RegBank, RegRef};
use usp_patcher::moe::MoeState;
use usp_patcher::pdesc::{IterFormat, IterKind, ProgramDesc, ProgramFlags};
use usp_patcher::sample::SampleDesc;
use usp_patcher::texwrite::TexWriteFormat;
use usp_patcher::{
    HwShader, ResultLocation, ShaderGraph, TextureControl, TextureFormat, UspContext,
};

fn graph(desc: ProgramDesc, blocks: Vec<Block>) -> ShaderGraph {
    ShaderGraph::from_container(container(desc, blocks)).unwrap()
}

fn context(textures: &[(u16, TextureFormat)]) -> UspContext {
    let mut ctx = UspContext::new(&PatcherConfig::default());
    for &(unit, format) in textures {
        ctx.set_texture_control(unit, TextureControl::new(format))
            .unwrap();
    }
    ctx
}

fn opcodes(shader: &HwShader) -> Vec<Opcode> {
    shader.code.iter().map(|i| i.opcode().unwrap()).collect()
}

fn result_desc() -> ProgramDesc {
    ProgramDesc {
        temp_count: 6,
        result_reg_count: 1,
        result_temp_base: 6,
        ..desc()
    }
}

#[test]
fn test_result_operands_follow_relocation() {
    let g = graph(
        result_desc(),
        vec![
            Block::Label(0),
            code(vec![
                mov(RegRef::new(RegBank::Output, 0), RegRef::temp(1), InstFlags::RESULT_DEST),
                mov(RegRef::temp(2), RegRef::new(RegBank::Output, 0), InstFlags::RESULT_SRC0),
                mov(RegRef::temp(3), RegRef::new(RegBank::Output, 0), InstFlags::empty()),
            ]),
        ],
    );

    let mut ctx = context(&[]);
    let unmoved = ctx.finalise(&g).unwrap();
    assert_eq!(unmoved.result, RegRef::new(RegBank::Output, 0));
    assert_eq!(unmoved.temp_count, 6);
    assert_eq!(
        unmoved.code[0].operand(Operand::Dest),
        RegRef::new(RegBank::Output, 0)
    );

    ctx.set_result_location(ResultLocation::Temp);
    let moved = ctx.finalise(&g).unwrap();
    assert_eq!(moved.result, RegRef::temp(6));
    assert_eq!(moved.temp_count, 7);
    assert_eq!(moved.code.len(), 3);
    assert_eq!(moved.code[0].operand(Operand::Dest), RegRef::temp(6));
    assert_eq!(moved.code[1].operand(Operand::Src0), RegRef::temp(6));
    // Unflagged operands keep their register
    assert_eq!(
        moved.code[2].operand(Operand::Src0),
        RegRef::new(RegBank::Output, 0)
    );
}

#[test]
fn test_detached_result_reference_is_left_alone() {
    let mut g = graph(
        result_desc(),
        vec![code(vec![mov(
            RegRef::new(RegBank::Output, 0),
            RegRef::temp(1),
            InstFlags::RESULT_DEST,
        )])],
    );
    let (id, _) = g.result_refs().iter().next().unwrap();
    g.remove_result_ref(id);

    let mut ctx = context(&[]);
    ctx.set_result_location(ResultLocation::Temp);
    let shader = ctx.finalise(&g).unwrap();
    assert_eq!(
        shader.code[0].operand(Operand::Dest),
        RegRef::new(RegBank::Output, 0)
    );
}

#[test]
fn test_preloaded_result_moves_in_prologue() {
    let mut d = result_desc();
    d.flags = ProgramFlags::RESULT_PRELOADED;
    d.result_reg_count = 2;
    let g = graph(
        d,
        vec![
            Block::Label(0),
            code(vec![mov(RegRef::temp(0), RegRef::temp(1), InstFlags::empty())]),
        ],
    );

    let mut ctx = context(&[]);
    ctx.set_result_location(ResultLocation::Temp);
    let shader = ctx.finalise(&g).unwrap();
    assert_eq!(shader.entry_offset, 0);
    assert_eq!(opcodes(&shader), vec![Opcode::Mov; 3]);
    assert_eq!(shader.code[0].operand(Operand::Dest), RegRef::temp(6));
    assert_eq!(
        shader.code[1].operand(Operand::Src0),
        RegRef::new(RegBank::Output, 1)
    );

    ctx.set_prologue_budget(1);
    let err = ctx.finalise(&g).unwrap_err();
    assert!(matches!(
        err,
        UspError::Finalise(FinaliseError::PrologueBudget {
            needed: 2,
            budget: 1
        })
    ));
}

#[test]
fn test_moe_reset_leads_the_prologue() {
    let mut d = desc();
    d.flags = ProgramFlags::MOE_RESET;
    let g = graph(
        d,
        vec![
            Block::Label(0),
            code(vec![mov(RegRef::temp(0), RegRef::temp(1), InstFlags::empty())]),
        ],
    );
    let shader = context(&[]).finalise(&g).unwrap();
    assert_eq!(shader.code.len(), 4);
    assert!(shader.code[..3]
        .iter()
        .all(|i| i.is_moe_control().unwrap()));

    let mut state = MoeState::default();
    state.base_offsets = [9; 4];
    for inst in &shader.code[..3] {
        state.apply(inst).unwrap();
    }
    assert!(state.is_default());
}

#[test]
fn test_pair_aligned_label_padded_with_nop() {
    let g = graph(
        desc(),
        vec![
            Block::Label(0),
            code(vec![mov(RegRef::temp(0), RegRef::temp(1), InstFlags::empty())]),
            Block::Label(1),
            branch(1, FlowOp::Ba, true),
        ],
    );
    let shader = context(&[]).finalise(&g).unwrap();
    assert_eq!(opcodes(&shader), vec![Opcode::Mov, Opcode::Nop, Opcode::Flow]);
    assert_eq!(shader.code[2].branch_target(), 2);
}

#[test]
fn test_branch_targets_patched() {
    let op = || mov(RegRef::temp(0), RegRef::temp(1), InstFlags::empty());
    let g = graph(
        desc(),
        vec![
            Block::Label(0),
            branch(7, FlowOp::Ba, false),
            code(vec![op(), op(), op()]),
            Block::Label(7),
            code(vec![op()]),
            branch(7, FlowOp::Br, false),
        ],
    );
    let shader = context(&[]).finalise(&g).unwrap();
    assert_eq!(shader.code.len(), 6);
    // Absolute forward branch to the fifth instruction
    assert_eq!(shader.code[0].branch_target(), 4);
    // Relative backward branch by one, in 20 bits
    assert_eq!(shader.code[5].branch_target(), 0xF_FFFF);
}

#[test]
fn test_phase_offsets_reported() {
    let mut d = desc();
    d.phase0_end_label = 3;
    let op = || mov(RegRef::temp(0), RegRef::temp(1), InstFlags::empty());
    let g = graph(
        d,
        vec![Block::Label(0), code(vec![op(), op()]), Block::Label(3)],
    );
    let shader = context(&[]).finalise(&g).unwrap();
    assert_eq!(shader.entry_offset, 0);
    assert_eq!(shader.phase0_end_offset, Some(2));
    assert_eq!(shader.phase1_start_offset, None);
}

#[test]
fn test_missing_texture_format() {
    let g = graph(desc(), vec![sample(1, 3, RegRef::temp(0))]);
    let err = context(&[(2, TextureFormat::F32)]).finalise(&g).unwrap_err();
    assert!(matches!(
        err,
        UspError::Finalise(FinaliseError::MissingTextureFormat(3))
    ));
}

#[test]
fn test_dependent_sample_fetches_every_chunk() {
    let g = graph(desc(), vec![dep_sample(1, 2, RegRef::temp(8), PackFormat::F32)]);
    let shader = context(&[(2, TextureFormat::F32x4)]).finalise(&g).unwrap();

    assert_eq!(opcodes(&shader), vec![Opcode::Smp; 4]);
    for (i, inst) in shader.code.iter().enumerate() {
        let controls = inst.sample_controls().unwrap();
        assert_eq!(controls.chunk as usize, i);
        assert_eq!(inst.operand(Operand::Dest), RegRef::temp(8 + i as u16));
        assert_eq!(
            inst.operand(Operand::Src1),
            RegRef::new(RegBank::SecondaryAttr, 3 * i as u16)
        );
    }
    assert_eq!(shader.sa_count, 12);
    assert_eq!(shader.tex_state_loads.len(), 4);
    assert!(shader
        .tex_state_loads
        .iter()
        .all(|l| l.texture == 2 && l.control.unwrap().format == TextureFormat::F32x4));
}

#[test]
fn test_dependent_sample_converts_through_scratch() {
    let g = graph(desc(), vec![dep_sample(1, 0, RegRef::temp(0), PackFormat::F32)]);
    let shader = context(&[(0, TextureFormat::U8888)]).finalise(&g).unwrap();

    let mut expected = vec![Opcode::Smp];
    expected.extend([Opcode::Pckunpck; 4]);
    assert_eq!(opcodes(&shader), expected);
    // Fetched into the first temporary past the program's own
    assert_eq!(shader.code[0].operand(Operand::Dest), RegRef::temp(8));
    assert_eq!(shader.temp_count, 9);
    for (i, inst) in shader.code[1..].iter().enumerate() {
        assert_eq!(inst.operand(Operand::Dest), RegRef::temp(i as u16));
        assert_eq!(inst.operand(Operand::Src0), RegRef::temp(8));
    }
}

#[test]
fn test_non_dependent_samples_share_presampled_attribute() {
    let g = graph(
        desc(),
        vec![sample(1, 0, RegRef::temp(0)), sample(2, 0, RegRef::temp(4))],
    );
    let shader = context(&[(0, TextureFormat::F16x4)]).finalise(&g).unwrap();

    assert_eq!(shader.pa_count, 2);
    assert_eq!(shader.iterated_inputs.len(), 1);
    let input = &shader.iterated_inputs[0];
    assert_eq!(input.kind, IterKind::PreSampled);
    assert_eq!(input.format, IterFormat::F16);
    assert_eq!(input.reg_count, 2);
    assert_eq!(input.components, 4);

    // Each sample widens its four F16 channels into F32 registers
    assert_eq!(opcodes(&shader), vec![Opcode::Pckunpck; 8]);
    assert_eq!(
        shader.code[7].operand(Operand::Src0),
        RegRef::new(RegBank::PrimaryAttr, 1)
    );
}

#[test]
fn test_presampled_attributes_follow_relocated_result() {
    let d = ProgramDesc {
        pa_count: 0,
        result_pa_base: 0,
        result_reg_count: 1,
        ..desc()
    };
    let g = graph(
        d,
        vec![
            code(vec![mov(
                RegRef::new(RegBank::Output, 0),
                RegRef::temp(1),
                InstFlags::RESULT_DEST,
            )]),
            sample(1, 0, RegRef::temp(0)),
        ],
    );
    let mut ctx = context(&[(0, TextureFormat::F32)]);
    ctx.set_result_location(ResultLocation::PrimaryAttr);
    let shader = ctx.finalise(&g).unwrap();

    let result = RegRef::new(RegBank::PrimaryAttr, 0);
    assert_eq!(shader.result, result);
    assert_eq!(shader.code[0].operand(Operand::Dest), result);
    assert_eq!(opcodes(&shader), vec![Opcode::Mov; 2]);
    assert_eq!(
        shader.code[1].operand(Operand::Src0),
        RegRef::new(RegBank::PrimaryAttr, 1)
    );
    assert_eq!(shader.pa_count, 2);
}

#[test]
fn test_unpack_reads_presampled_data() {
    let g = graph(
        desc(),
        vec![sample(1, 0, RegRef::temp(0)), unpack(1, RegRef::temp(4))],
    );
    let shader = context(&[(0, TextureFormat::F32)]).finalise(&g).unwrap();
    assert_eq!(opcodes(&shader), vec![Opcode::Mov; 2]);
    assert_eq!(shader.code[1].operand(Operand::Dest), RegRef::temp(4));
    assert_eq!(
        shader.code[1].operand(Operand::Src0),
        RegRef::new(RegBank::PrimaryAttr, 0)
    );
}

#[test]
fn test_sample_outside_default_state_is_bracketed() {
    let mut d = non_dep_sample(1, 0, RegRef::temp(0), PackFormat::F32);
    d.moe.base_offsets[0] = 2;
    let g = graph(desc(), vec![Block::Sample(SampleDesc::NonDependent(d))]);
    let shader = context(&[(0, TextureFormat::F32)]).finalise(&g).unwrap();
    assert_eq!(
        opcodes(&shader),
        vec![Opcode::MoeCtrl, Opcode::Mov, Opcode::MoeCtrl]
    );
}

#[test]
fn test_texture_write_temp_budget() {
    let g = graph(desc(), vec![texture_write(1, TexWriteFormat::F16, 3, 2)]);
    let err = context(&[]).finalise(&g).unwrap_err();
    assert!(matches!(
        err,
        UspError::Finalise(FinaliseError::TempBudget {
            id: 1,
            needed: 3,
            available: 2
        })
    ));
}

#[test]
fn test_texture_write_temporaries_past_register_range() {
    let Block::TextureWrite(mut d) = texture_write(1, TexWriteFormat::F16, 3, 3) else {
        unreachable!()
    };
    d.temp_base = u16::MAX;
    let g = graph(desc(), vec![Block::TextureWrite(d)]);
    let err = context(&[]).finalise(&g).unwrap_err();
    assert!(matches!(
        err,
        UspError::Finalise(FinaliseError::Register { num: 0x1_0000, .. })
    ));
}

#[test]
fn test_texture_write_packs_then_stores() {
    let g = graph(desc(), vec![texture_write(1, TexWriteFormat::F16, 3, 3)]);
    let shader = context(&[]).finalise(&g).unwrap();
    assert_eq!(
        opcodes(&shader),
        vec![
            Opcode::Imae,
            Opcode::Imae,
            Opcode::Pckunpck,
            Opcode::Pckunpck,
            Opcode::Pckunpck,
            Opcode::Ldst,
            Opcode::Ldst,
        ]
    );
    assert_eq!(shader.code.iter().filter(|i| i.is_store()).count(), 2);
    // Address in the first scratch temporary, packed texel after it
    assert_eq!(shader.code[0].operand(Operand::Dest), RegRef::temp(10));
    assert_eq!(shader.code[4].operand(Operand::Dest), RegRef::temp(12));
    assert_eq!(shader.temp_count, 13);

    let g = graph(desc(), vec![texture_write(2, TexWriteFormat::F32, 4, 1)]);
    let shader = context(&[]).finalise(&g).unwrap();
    assert_eq!(shader.code.len(), 6);
    assert_eq!(shader.code[5].operand(Operand::Src2), RegRef::temp(5));
}

#[test]
fn test_shader_serialises_to_json() {
    let g = graph(
        result_desc(),
        vec![Block::Label(0), sample(1, 0, RegRef::temp(0))],
    );
    let mut ctx = context(&[(0, TextureFormat::U8888)]);
    ctx.set_result_location(ResultLocation::Temp);
    let shader = ctx.finalise(&g).unwrap();

    let json = serde_json::to_value(&shader).unwrap();
    assert_eq!(json["code"].as_array().unwrap().len(), shader.code.len());
    assert_eq!(json["result"]["bank"], "Temp");
    assert_eq!(json["tex_state_loads"][0]["control"]["format"], "U8888");
}
