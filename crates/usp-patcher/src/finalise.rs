//! Finalisation
//!
//! Lays the graph out as one instruction stream once the bound texture
//! formats and the result location are known: samples expand into per-chunk
//! fetches and unpacks, texture writes into address/pack/store sequences,
//! result operands move to their final bank and branches get real targets.

use crate::block::BlockOwner;
use crate::graph::ShaderGraph;
use crate::hw::{HwInst, Operand, PackFormat, RegBank, RegRef, IMM_ONE, IMM_ZERO};
use crate::ids::{BlockId, BranchId, LabelId, SampleId, TexWriteId, UnpackId};
use crate::moe::MoeState;
use crate::pdesc::{ConstLoad, IterFormat, IterInput, IterKind, IterSource, ProgramFlags};
use crate::result::{Relocation, ResultLocation, ResultTarget};
use crate::sample::{ChannelSel, SampleDesc, Swizzle};
use crate::texture::{TextureControl, TextureFormat};
use crate::texwrite::TexWriteFormat;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use usp_core::error::{FinaliseError, GraphError, Result};

/// Caller choices that shape the final code
#[derive(Debug, Clone, Copy)]
pub struct FinaliseParams<'a> {
    /// Control hints per texture unit; `None` for units with nothing bound
    pub textures: &'a [Option<TextureControl>],
    pub result_location: ResultLocation,
    /// Most instructions the prologue may hold
    pub prologue_budget: usize,
    /// Secondary attributes holding the state of one texture chunk
    pub texture_state_words: u16,
}

/// Secondary attribute to fill with the state of one texture chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TexStateBinding {
    pub texture: u16,
    pub chunk: u16,
    pub sa_reg: u16,
    pub control: Option<TextureControl>,
}

/// Hardware-ready shader
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HwShader {
    pub code: Vec<HwInst>,
    /// Instruction offset execution starts at
    pub entry_offset: u32,
    pub phase0_end_offset: Option<u32>,
    pub phase1_start_offset: Option<u32>,
    pub split_phase1_start_offset: Option<u32>,

    pub temp_count: u16,
    pub pa_count: u16,
    pub sa_count: u16,
    pub output_count: u16,

    /// First result register after relocation
    pub result: RegRef,
    pub result_reg_count: u16,

    /// Iterated inputs followed by the pre-sampled textures
    pub iterated_inputs: Vec<IterInput>,
    pub mem_const_loads: Vec<ConstLoad>,
    pub reg_const_loads: Vec<ConstLoad>,
    pub tex_state_loads: Vec<TexStateBinding>,
    pub secondary_update: Vec<HwInst>,
    pub valid_outputs: Vec<u32>,
}

/// How the samples of one texture are expanded
#[derive(Debug, Clone)]
struct TexturePlan {
    format: TextureFormat,
    /// Format every sample of the texture unpacks to
    unpack: PackFormat,
    /// Secondary attribute holding each chunk's state
    state_regs: Vec<u16>,
}

struct Finaliser<'g> {
    graph: &'g ShaderGraph,
    reloc: Relocation,
    plans: HashMap<u16, TexturePlan>,
    /// Primary attribute holding each non-dependent sample, by sample index
    presampled: Vec<Option<u16>>,
    inst_refs: HashMap<(BlockId, usize), Vec<Operand>>,
    sample_refs: HashMap<SampleId, Vec<Operand>>,
    unpack_refs: HashSet<UnpackId>,

    temp_count: u16,
    pa_count: u16,
    sa_count: u16,
    output_count: u16,
    /// First temporary free for dependent-sample scratch
    scratch_base: u16,

    iterated_inputs: Vec<IterInput>,
    tex_state_loads: Vec<TexStateBinding>,
}

/// Produce hardware-ready code for `graph`
pub fn finalise(graph: &ShaderGraph, params: &FinaliseParams<'_>) -> Result<HwShader> {
    let desc = graph.desc();
    let mut f = Finaliser {
        graph,
        reloc: Relocation::new(desc, params.result_location),
        plans: HashMap::new(),
        presampled: vec![None; graph.samples().len()],
        inst_refs: HashMap::new(),
        sample_refs: HashMap::new(),
        unpack_refs: HashSet::new(),
        temp_count: desc.temp_count,
        pa_count: desc.pa_count,
        sa_count: desc.sa_count,
        output_count: desc.output_count,
        scratch_base: desc.temp_count,
        iterated_inputs: desc.iterated_inputs.clone(),
        tex_state_loads: Vec::new(),
    };

    f.plan_textures(params)?;
    // Result registers are reserved before pre-sampled attributes
    f.collect_result_refs();
    f.presample()?;

    let prologue_moe = graph
        .prologue_block()
        .map(|b| graph.block(b).moe_start)
        .unwrap_or_default();
    let prologue = f.prologue(prologue_moe)?;
    if prologue.len() > params.prologue_budget {
        tracing::error!(
            "Prologue needs {} instructions, budget is {}",
            prologue.len(),
            params.prologue_budget
        );
        return Err(FinaliseError::PrologueBudget {
            needed: prologue.len(),
            budget: params.prologue_budget,
        }
        .into());
    }

    let (code, offsets) = f.layout(&prologue)?;

    let special = graph.special_labels();
    let offset_of = |label: Option<LabelId>| {
        label.map(|l| offsets[graph.label(l).block.index()])
    };
    let shader = HwShader {
        entry_offset: offset_of(special.program_start).unwrap_or(0),
        phase0_end_offset: offset_of(special.phase0_end),
        phase1_start_offset: offset_of(special.phase1_start),
        split_phase1_start_offset: offset_of(special.split_phase1_start),
        code,
        temp_count: f.temp_count,
        pa_count: f.pa_count,
        sa_count: f.sa_count,
        output_count: f.output_count,
        result: f.reloc.to,
        result_reg_count: f.reloc.count,
        iterated_inputs: f.iterated_inputs,
        mem_const_loads: desc.mem_const_loads.clone(),
        reg_const_loads: desc.reg_const_loads.clone(),
        tex_state_loads: f.tex_state_loads,
        secondary_update: desc.secondary_update.clone(),
        valid_outputs: desc.valid_outputs.clone(),
    };

    tracing::debug!(
        "Finalised shader: {} instructions, {} temps, {} PAs, {} SAs, result at {}",
        shader.code.len(),
        shader.temp_count,
        shader.pa_count,
        shader.sa_count,
        shader.result
    );
    Ok(shader)
}

fn control_for(params: &FinaliseParams<'_>, texture: u16) -> Option<TextureControl> {
    params.textures.get(texture as usize).copied().flatten()
}

impl<'g> Finaliser<'g> {
    fn plan(&self, texture: u16) -> Result<&TexturePlan> {
        self.plans
            .get(&texture)
            .ok_or_else(|| FinaliseError::MissingTextureFormat(texture).into())
    }

    /// Pick each texture's unpack format and its state registers
    fn plan_textures(&mut self, params: &FinaliseParams<'_>) -> Result<()> {
        let graph = self.graph;
        let desc = graph.desc();

        let mut unify: HashMap<u16, PackFormat> = HashMap::new();
        let mut request = |texture: u16, format: PackFormat| {
            let entry = unify.entry(texture).or_insert(format);
            *entry = (*entry).max(format);
        };
        for group in graph.texture_groups().iter() {
            for &sample in &group.samples {
                request(group.texture, graph.sample(sample).desc.format());
            }
            for &unpack in &group.unpacks {
                request(group.texture, graph.unpacks()[unpack.index()].desc.format);
            }
        }

        for load in &desc.tex_state_loads {
            self.tex_state_loads.push(TexStateBinding {
                texture: load.texture,
                chunk: load.chunk,
                sa_reg: load.sa_reg,
                control: control_for(params, load.texture),
            });
        }

        for group in graph.texture_groups().iter() {
            let texture = group.texture;
            let Some(control) = control_for(params, texture) else {
                tracing::error!("No format set for texture {}", texture);
                return Err(FinaliseError::MissingTextureFormat(texture).into());
            };

            let chunks = control.format.chunk_count();
            let mut state_regs = Vec::with_capacity(chunks as usize);
            for chunk in 0..chunks {
                let preset = desc
                    .tex_state_loads
                    .iter()
                    .find(|l| l.texture == texture && l.chunk == chunk);
                let sa_reg = match preset {
                    Some(load) => load.sa_reg,
                    None => {
                        let reg = self.sa_count;
                        self.sa_count = self.sa_count.saturating_add(params.texture_state_words);
                        self.tex_state_loads.push(TexStateBinding {
                            texture,
                            chunk,
                            sa_reg: reg,
                            control: Some(control),
                        });
                        reg
                    }
                };
                state_regs.push(sa_reg);
            }

            let unpack = unify
                .get(&texture)
                .copied()
                .unwrap_or_else(|| control.format.channel_format());
            tracing::trace!(
                "Texture {}: {} unpacks to {:?} over {} chunks",
                texture,
                control.format,
                unpack,
                chunks
            );
            self.plans.insert(
                texture,
                TexturePlan {
                    format: control.format,
                    unpack,
                    state_regs,
                },
            );
        }
        Ok(())
    }

    /// Hoist non-dependent samples into pre-sampled primary attributes
    fn presample(&mut self) -> Result<()> {
        let graph = self.graph;
        let mut shared: HashMap<(u16, IterSource, bool, bool), u16> = HashMap::new();

        for (index, sample) in graph.samples().iter().enumerate() {
            let SampleDesc::NonDependent(d) = &sample.desc else {
                continue;
            };
            let key = (d.texture, d.coord, d.projected, d.centroid);
            let base = match shared.get(&key).copied() {
                Some(base) => base,
                None => {
                    let format = self.plan(d.texture)?.format;
                    let base = self.pa_count;
                    let chunks = format.chunk_count();
                    self.pa_count = self.pa_count.saturating_add(chunks);
                    self.iterated_inputs.push(IterInput {
                        kind: IterKind::PreSampled,
                        source: d.coord,
                        components: format.channel_count(),
                        format: match format.channel_format() {
                            PackFormat::F16 => IterFormat::F16,
                            _ => IterFormat::F32,
                        },
                        projected: d.projected,
                        centroid: d.centroid,
                        texture: d.texture,
                        reg_count: chunks,
                    });
                    shared.insert(key, base);
                    base
                }
            };
            self.presampled[index] = Some(base);
        }
        Ok(())
    }

    /// Index the result references and grow the target bank to hold the result
    fn collect_result_refs(&mut self) {
        if !self.reloc.is_move() {
            return;
        }
        for (_, target) in self.graph.result_refs().iter() {
            match *target {
                ResultTarget::Inst {
                    block,
                    index,
                    operand,
                } => self.inst_refs.entry((block, index)).or_default().push(operand),
                ResultTarget::Sample { sample, operand } => {
                    self.sample_refs.entry(sample).or_default().push(operand)
                }
                ResultTarget::Unpack(unpack) => {
                    self.unpack_refs.insert(unpack);
                }
            }
        }

        let end = self.reloc.to.num.saturating_add(self.reloc.count);
        match self.reloc.to.bank {
            RegBank::Temp => self.temp_count = self.temp_count.max(end),
            RegBank::PrimaryAttr => self.pa_count = self.pa_count.max(end),
            _ => self.output_count = self.output_count.max(end),
        }
        self.scratch_base = self.temp_count;
    }

    fn prologue(&self, moe: MoeState) -> Result<Vec<HwInst>> {
        let desc = self.graph.desc();
        let mut body = Vec::new();
        if self.reloc.is_move() && desc.flags.contains(ProgramFlags::RESULT_PRELOADED) {
            for i in 0..self.reloc.count {
                body.push(HwInst::mov(self.reloc.to.offset(i), self.reloc.from.offset(i))?);
            }
        }

        if desc.flags.contains(ProgramFlags::MOE_RESET) {
            let mut code = MoeState::reset_sequence()?;
            code.extend(body);
            Ok(code)
        } else {
            let mut code = Vec::new();
            bracket(&mut code, moe, body)?;
            Ok(code)
        }
    }

    fn relocate(&self, reg: RegRef, flagged: bool) -> Result<RegRef> {
        if flagged {
            self.reloc.apply(reg)
        } else {
            Ok(reg)
        }
    }

    fn relocate_inst(&self, block: BlockId, index: usize, mut hw: HwInst) -> Result<HwInst> {
        if let Some(operands) = self.inst_refs.get(&(block, index)) {
            for &operand in operands {
                let reg = self.reloc.apply(hw.operand(operand))?;
                hw.set_operand(operand, reg)?;
            }
        }
        Ok(hw)
    }

    /// Walk the spine and emit every block; returns the code and block offsets
    fn layout(&mut self, prologue: &[HwInst]) -> Result<(Vec<HwInst>, Vec<u32>)> {
        let graph = self.graph;
        let mut code: Vec<HwInst> = Vec::new();
        let mut offsets = vec![0u32; graph.blocks().len()];
        let mut fixups: Vec<(usize, BranchId)> = Vec::new();

        if graph.prologue_block().is_none() {
            code.extend_from_slice(prologue);
        }

        for id in graph.block_ids() {
            let block = graph.block(id);
            if block.align_to_pair && code.len() % 2 == 1 {
                code.push(HwInst::nop());
            }
            offsets[id.index()] = code.len() as u32;

            match block.owner {
                BlockOwner::Code { .. } | BlockOwner::Branch(_) => {
                    if let BlockOwner::Branch(branch) = block.owner {
                        fixups.push((code.len(), branch));
                    }
                    for (index, inst) in block.insts.iter().enumerate() {
                        code.push(self.relocate_inst(id, index, inst.hw)?);
                    }
                }
                BlockOwner::Label(_) => {}
                BlockOwner::Prologue => code.extend_from_slice(prologue),
                BlockOwner::Sample(sample) => {
                    let body = self.sample_code(sample)?;
                    bracket(&mut code, block.moe_start, body)?;
                }
                BlockOwner::SampleUnpack(unpack) => {
                    let body = self.unpack_node_code(unpack)?;
                    bracket(&mut code, block.moe_start, body)?;
                }
                BlockOwner::TextureWrite(tw) => {
                    let body = self.texture_write_code(tw)?;
                    bracket(&mut code, block.moe_start, body)?;
                }
            }
        }

        for (pc, branch) in fixups {
            if let Some(label) = graph.branches()[branch.index()].label {
                let target = offsets[graph.label(label).block.index()];
                code[pc].set_branch_target(pc as u32, target)?;
            }
        }
        Ok((code, offsets))
    }

    fn sample_code(&mut self, id: SampleId) -> Result<Vec<HwInst>> {
        let graph = self.graph;
        let sample = graph.sample(id);
        let refs = self.sample_refs.get(&id);
        let flagged = |operand: Operand| refs.is_some_and(|ops| ops.contains(&operand));

        match &sample.desc {
            SampleDesc::NonDependent(d) => {
                let plan = self.plan(d.texture)?;
                let pa = self.presampled[id.index()]
                    .ok_or(FinaliseError::MissingTextureFormat(d.texture))?;
                let dest = self.relocate(d.dest, flagged(Operand::Dest))?;
                unpack_code(
                    RegRef::new(RegBank::PrimaryAttr, pa),
                    plan.format,
                    plan.unpack,
                    dest,
                    d.swizzle,
                )
            }
            SampleDesc::Dependent(d) => {
                let plan = self.plan(d.texture)?.clone();
                let mut base = d.base.hw;
                for operand in Operand::ALL {
                    if flagged(operand) {
                        let reg = self.reloc.apply(base.operand(operand))?;
                        base.set_operand(operand, reg)?;
                    }
                }
                base.set_drc(d.drc);

                let dest = base.operand(Operand::Dest);
                let chunks = plan.format.chunk_count();
                let direct =
                    plan.format.channel_format() == plan.unpack && d.swizzle.is_identity();
                let fetch = if direct {
                    dest
                } else {
                    let scratch = RegRef::temp(self.scratch_base);
                    self.temp_count = self
                        .temp_count
                        .max(self.scratch_base.saturating_add(chunks));
                    scratch
                };

                let mut code = Vec::with_capacity(chunks as usize + 4);
                for (chunk, &sa) in plan.state_regs.iter().enumerate() {
                    code.push(HwInst::smp_chunk(
                        &base,
                        fetch.offset(chunk as u16),
                        RegRef::new(RegBank::SecondaryAttr, sa),
                        chunk as u8,
                    )?);
                }
                if !direct {
                    code.extend(unpack_code(fetch, plan.format, plan.unpack, dest, d.swizzle)?);
                }
                Ok(code)
            }
        }
    }

    fn unpack_node_code(&self, id: UnpackId) -> Result<Vec<HwInst>> {
        let unpack = &self.graph.unpacks()[id.index()];
        let Some(source) = unpack.source else {
            return Err(GraphError::UnknownSample(unpack.desc.sample_id).into());
        };
        let texture = self.graph.sample(source).desc.texture();
        let plan = self.plan(texture)?;
        let Some(pa) = self.presampled[source.index()] else {
            return Err(GraphError::UnpackOfDependent(unpack.desc.sample_id).into());
        };
        let dest = self.relocate(unpack.desc.dest, self.unpack_refs.contains(&id))?;
        unpack_code(
            RegRef::new(RegBank::PrimaryAttr, pa),
            plan.format,
            plan.unpack,
            dest,
            unpack.desc.swizzle,
        )
    }

    fn texture_write_code(&mut self, id: TexWriteId) -> Result<Vec<HwInst>> {
        let graph = self.graph;
        let d = &graph.texture_writes()[id.index()].desc;
        let needed = d.temps_needed();
        if needed > d.temp_count {
            tracing::error!(
                "Texture write {} needs {} temporaries, {} available",
                d.id,
                needed,
                d.temp_count
            );
            return Err(FinaliseError::TempBudget {
                id: d.id,
                needed,
                available: d.temp_count,
            }
            .into());
        }
        self.temp_count = self.temp_count.max(d.temp_base.saturating_add(needed));

        let addr = RegRef::temp(d.temp_base);
        let packed_base = temp_at(d.temp_base, 1)?.num;
        let texel_dwords = match d.format {
            TexWriteFormat::F32 => d.channel_count as u16,
            _ => d.packed_regs(),
        };

        // Immediate n reads as the integer n in integer operations
        let mut code = vec![
            HwInst::imae(addr, d.coord_y, d.stride, d.coord_x)?,
            HwInst::imae(
                addr,
                addr,
                RegRef::new(RegBank::Immediate, texel_dwords),
                RegRef::new(RegBank::Immediate, IMM_ZERO),
            )?,
        ];

        let channels = &d.channels[..d.channel_count as usize];
        match d.format {
            TexWriteFormat::F32 => {
                for (i, &channel) in channels.iter().enumerate() {
                    code.push(HwInst::store(d.base, addr, channel, i as u8)?);
                }
            }
            _ => {
                let format = d.format.pack_format();
                let per = format.per_register();
                for (i, &channel) in channels.iter().enumerate() {
                    let i = i as u16;
                    code.push(HwInst::pckunpck(
                        temp_at(packed_base, i / per)?,
                        format,
                        (i % per) as u8,
                        channel,
                        PackFormat::F32,
                        0,
                    )?);
                }
                for k in 0..d.packed_regs() {
                    code.push(HwInst::store(
                        d.base,
                        addr,
                        temp_at(packed_base, k)?,
                        k as u8,
                    )?);
                }
            }
        }
        Ok(code)
    }
}

/// Temporary `base + offset`, failing when it does not fit a register number
fn temp_at(base: u16, offset: u16) -> Result<RegRef> {
    match base.checked_add(offset) {
        Some(num) => Ok(RegRef::temp(num)),
        None => Err(FinaliseError::Register {
            bank: RegBank::Temp.name(),
            num: base as u32 + offset as u32,
        }
        .into()),
    }
}

/// Run `body` in the default addressing state, restoring `moe` afterwards
fn bracket(code: &mut Vec<HwInst>, moe: MoeState, body: Vec<HwInst>) -> Result<()> {
    if body.is_empty() {
        return Ok(());
    }
    if moe.is_default() {
        code.extend(body);
        return Ok(());
    }
    let default = MoeState::default();
    code.extend(moe.transition_to(&default)?);
    code.extend(body);
    code.extend(default.transition_to(&moe)?);
    Ok(())
}

/// Convert fetched texel data at `src` into `unpack` format at `dest`.
///
/// Channels the texture lacks read as zero, except W which reads as one.
fn unpack_code(
    src: RegRef,
    format: TextureFormat,
    unpack: PackFormat,
    dest: RegRef,
    swizzle: Swizzle,
) -> Result<Vec<HwInst>> {
    let native = format.channel_format();
    if native == unpack && swizzle.is_identity() {
        if src == dest {
            return Ok(Vec::new());
        }
        let mut code = Vec::with_capacity(format.chunk_count() as usize);
        for chunk in 0..format.chunk_count() {
            code.push(HwInst::mov(dest.offset(chunk), src.offset(chunk))?);
        }
        return Ok(code);
    }

    let per_src = native.per_register();
    let per_dest = unpack.per_register();
    let mut code = Vec::with_capacity(4);
    for (i, sel) in swizzle.0.iter().enumerate() {
        let i = i as u16;
        let target = dest.offset(i / per_dest);
        let target_comp = (i % per_dest) as u8;
        let inst = match sel.channel() {
            Some(ch) if ch < format.channel_count() => {
                let ch = ch as u16;
                HwInst::pckunpck(
                    target,
                    unpack,
                    target_comp,
                    src.offset(ch / per_src),
                    native,
                    (ch % per_src) as u8,
                )?
            }
            missing => {
                let one = *sel == ChannelSel::One || missing == Some(3);
                let imm = if one { IMM_ONE } else { IMM_ZERO };
                HwInst::pckunpck(
                    target,
                    unpack,
                    target_comp,
                    RegRef::new(RegBank::Immediate, imm),
                    PackFormat::F32,
                    0,
                )?
            }
        };
        code.push(inst);
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::Opcode;

    #[test]
    fn test_direct_unpack_is_a_move_per_chunk() {
        let code = unpack_code(
            RegRef::new(RegBank::PrimaryAttr, 4),
            TextureFormat::F16x4,
            PackFormat::F16,
            RegRef::temp(0),
            Swizzle::IDENTITY,
        )
        .unwrap();
        assert_eq!(code.len(), 2);
        assert!(code.iter().all(|i| i.opcode().unwrap() == Opcode::Mov));
        assert_eq!(code[1].operand(Operand::Src0), RegRef::new(RegBank::PrimaryAttr, 5));

        let same = unpack_code(
            RegRef::temp(0),
            TextureFormat::F32,
            PackFormat::F32,
            RegRef::temp(0),
            Swizzle::IDENTITY,
        )
        .unwrap();
        assert!(same.is_empty());
    }

    #[test]
    fn test_converting_unpack_fills_missing_channels() {
        // Two-channel texture widened to F32
        let code = unpack_code(
            RegRef::new(RegBank::PrimaryAttr, 0),
            TextureFormat::F16F16,
            PackFormat::F32,
            RegRef::temp(8),
            Swizzle::IDENTITY,
        )
        .unwrap();
        assert_eq!(code.len(), 4);

        let (dfmt, dcomp, sfmt, scomp) = code[1].pckunpck_fields();
        assert_eq!((dfmt, dcomp, sfmt, scomp), (PackFormat::F32 as u8, 0, PackFormat::F16 as u8, 1));
        assert_eq!(code[1].operand(Operand::Dest), RegRef::temp(9));

        // Z is missing and reads zero, W is missing and reads one
        assert_eq!(code[2].operand(Operand::Src0), RegRef::new(RegBank::Immediate, IMM_ZERO));
        assert_eq!(code[3].operand(Operand::Src0), RegRef::new(RegBank::Immediate, IMM_ONE));
    }

    #[test]
    fn test_bracket_only_outside_default_state() {
        let body = vec![HwInst::nop()];
        let mut code = Vec::new();
        bracket(&mut code, MoeState::default(), body.clone()).unwrap();
        assert_eq!(code.len(), 1);

        let mut moe = MoeState::default();
        moe.base_offsets[1] = 4;
        let mut code = Vec::new();
        bracket(&mut code, moe, body).unwrap();
        assert_eq!(code.len(), 3);
        assert!(code[0].is_moe_control().unwrap());
        assert!(code[2].is_moe_control().unwrap());
    }
}
