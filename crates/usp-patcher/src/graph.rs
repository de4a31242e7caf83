//! Shader graph
//!
//! The graph owns every node read from a container. Instruction blocks form
//! the spine in container order; labels, branches, samples, unpacks and
//! texture writes each own one block of it and are kept in their own arenas.
//! Cross links (branch to label, unpack to sample, texture groups, result
//! references) are typed indices into those arenas.

use crate::block::{split_code, BlockOwner, InstBlock, InstFlags};
use crate::codec::ByteOrder;
use crate::container::{Block, Container, HwCodeDesc};
use crate::flow::{resolve_branches, Branch, BranchDesc, Label, LabelTable, SpecialLabels};
use crate::hw::Operand;
use crate::ids::{BlockId, BranchId, LabelId, ResultRefId, SampleId, TexWriteId, UnpackId};
use crate::moe::MoeState;
use crate::pdesc::ProgramDesc;
use crate::result::{ResultRefs, ResultTarget};
use crate::sample::{link_unpacks, Sample, SampleDesc, SampleUnpack, TextureGroups, UnpackDesc};
use crate::texwrite::{TextureWrite, TextureWriteDesc};
use std::collections::HashMap;
use usp_core::error::{ContainerError, GraphError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderGraph {
    byte_order: ByteOrder,
    desc: ProgramDesc,
    /// The spine: every block in layout order, indexed by [`BlockId`]
    blocks: Vec<InstBlock>,
    labels: LabelTable,
    special: SpecialLabels,
    prologue: Option<BlockId>,
    branches: Vec<Branch>,
    samples: Vec<Sample>,
    sample_ids: HashMap<u32, SampleId>,
    unpacks: Vec<SampleUnpack>,
    tex_writes: Vec<TextureWrite>,
    result_refs: ResultRefs,
    tex_groups: TextureGroups,
}

impl ShaderGraph {
    fn new(byte_order: ByteOrder, desc: ProgramDesc) -> Self {
        Self {
            byte_order,
            desc,
            blocks: Vec::new(),
            labels: LabelTable::new(),
            special: SpecialLabels::default(),
            prologue: None,
            branches: Vec::new(),
            samples: Vec::new(),
            sample_ids: HashMap::new(),
            unpacks: Vec::new(),
            tex_writes: Vec::new(),
            result_refs: ResultRefs::new(),
            tex_groups: TextureGroups::new(),
        }
    }

    /// Decode a container and build its graph
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::from_container(Container::parse(data)?)
    }

    /// Build the graph of an already decoded container
    pub fn from_container(container: Container) -> Result<Self> {
        let mut blocks = container.blocks.into_iter();
        let Some(Block::ProgramDesc(desc)) = blocks.next() else {
            return Err(ContainerError::MissingDescriptor.into());
        };

        let mut graph = Self::new(container.byte_order, desc);
        let mut moe = MoeState::default();
        let mut code_group = 0u32;

        for (index, block) in blocks.enumerate() {
            match block {
                Block::ProgramDesc(_) => {
                    return Err(ContainerError::DuplicateDescriptor(index + 1).into())
                }
                Block::HwCode(code) => {
                    moe = graph.add_code(code, code_group)?;
                    code_group += 1;
                }
                Block::Label(id) => graph.add_label(id, moe)?,
                Block::Branch(desc) => {
                    moe = desc.moe;
                    graph.add_branch(desc);
                }
                Block::Sample(desc) => {
                    moe = desc.moe();
                    graph.add_sample(desc)?;
                }
                Block::SampleUnpack(desc) => {
                    moe = desc.moe;
                    graph.add_unpack(desc);
                }
                Block::TextureWrite(desc) => {
                    moe = desc.moe;
                    graph.add_texture_write(desc);
                }
                Block::End => break,
            }
        }

        resolve_branches(&mut graph.branches, &graph.labels, &mut graph.blocks)?;
        link_unpacks(&mut graph.unpacks, &graph.samples, &graph.sample_ids)?;
        for (index, unpack) in graph.unpacks.iter().enumerate() {
            if let Some(source) = unpack.source {
                let texture = graph.samples[source.index()].desc.texture();
                graph.tex_groups.add_unpack(texture, UnpackId::from_index(index));
            }
        }

        tracing::debug!(
            "Built shader graph: {} blocks, {} labels, {} branches, {} samples, {} textures",
            graph.blocks.len(),
            graph.labels.len(),
            graph.branches.len(),
            graph.samples.len(),
            graph.tex_groups.len()
        );
        Ok(graph)
    }

    fn push_block(&mut self, block: InstBlock) -> BlockId {
        self.blocks.push(block);
        BlockId::from_index(self.blocks.len() - 1)
    }

    fn next_block_id(&self) -> BlockId {
        BlockId::from_index(self.blocks.len())
    }

    /// Split a code block into constant-state runs; returns the end state
    fn add_code(&mut self, code: HwCodeDesc, group: u32) -> Result<MoeState> {
        let mut end = code.moe_start;
        for run in split_code(code.insts, code.moe_start)? {
            end = run.moe_end;
            let block = self.push_block(InstBlock {
                owner: BlockOwner::Code { group },
                insts: run.insts,
                moe_start: run.moe_start,
                moe_end: run.moe_end,
                align_to_pair: false,
            });
            self.track_block_results(block);
        }
        Ok(end)
    }

    fn track_block_results(&mut self, block: BlockId) {
        let insts = &self.blocks[block.index()].insts;
        let targets: Vec<_> = insts
            .iter()
            .enumerate()
            .flat_map(|(index, inst)| {
                inst.flags.result_operands().map(move |operand| ResultTarget::Inst {
                    block,
                    index,
                    operand,
                })
            })
            .collect();
        for target in targets {
            self.result_refs.add(target);
        }
    }

    fn add_label(&mut self, id: u32, moe: MoeState) -> Result<()> {
        let block = self.next_block_id();
        let label = self.labels.insert(id, block)?;
        self.push_block(InstBlock::empty(BlockOwner::Label(label), moe));

        self.special.record(&self.desc, id, label);
        if self.special.program_start == Some(label) {
            let prologue = self.push_block(InstBlock::empty(BlockOwner::Prologue, moe));
            self.prologue = Some(prologue);
        }
        Ok(())
    }

    fn add_branch(&mut self, desc: BranchDesc) {
        let id = BranchId::from_index(self.branches.len());
        let mut block = InstBlock::empty(BlockOwner::Branch(id), desc.moe);
        block.insts.push(desc.inst);
        let block = self.push_block(block);
        self.track_block_results(block);
        self.branches.push(Branch {
            desc,
            block,
            label: None,
        });
    }

    fn add_sample(&mut self, desc: SampleDesc) -> Result<()> {
        let id = SampleId::from_index(self.samples.len());
        if self.sample_ids.insert(desc.id(), id).is_some() {
            tracing::error!("Sample id {} used twice", desc.id());
            return Err(GraphError::DuplicateSample(desc.id()).into());
        }

        match &desc {
            SampleDesc::NonDependent(d) => {
                if d.dest_flags.contains(InstFlags::RESULT_DEST) {
                    self.result_refs.add(ResultTarget::Sample {
                        sample: id,
                        operand: Operand::Dest,
                    });
                }
            }
            SampleDesc::Dependent(d) => {
                for operand in d.base.flags.result_operands() {
                    self.result_refs.add(ResultTarget::Sample {
                        sample: id,
                        operand,
                    });
                }
            }
        }

        self.tex_groups.add(desc.texture(), id);
        let block = self.push_block(InstBlock::empty(BlockOwner::Sample(id), desc.moe()));
        self.samples.push(Sample { desc, block });
        Ok(())
    }

    fn add_unpack(&mut self, desc: UnpackDesc) {
        let id = UnpackId::from_index(self.unpacks.len());
        if desc.dest_flags.contains(InstFlags::RESULT_DEST) {
            self.result_refs.add(ResultTarget::Unpack(id));
        }
        let block = self.push_block(InstBlock::empty(BlockOwner::SampleUnpack(id), desc.moe));
        self.unpacks.push(SampleUnpack {
            desc,
            block,
            source: None,
        });
    }

    fn add_texture_write(&mut self, desc: TextureWriteDesc) {
        let id = TexWriteId::from_index(self.tex_writes.len());
        let block = self.push_block(InstBlock::empty(BlockOwner::TextureWrite(id), desc.moe));
        self.tex_writes.push(TextureWrite { desc, block });
    }

    /// Rebuild the container block sequence in original order
    pub fn to_container(&self) -> Container {
        let mut out = vec![Block::ProgramDesc(self.desc.clone())];
        let mut spine = self.blocks.iter().peekable();

        while let Some(block) = spine.next() {
            let item = match block.owner {
                BlockOwner::Code { group } => {
                    let mut insts = block.insts.clone();
                    while let Some(next) =
                        spine.next_if(|b| b.owner == BlockOwner::Code { group })
                    {
                        insts.extend_from_slice(&next.insts);
                    }
                    Block::HwCode(HwCodeDesc {
                        moe_start: block.moe_start,
                        insts,
                    })
                }
                BlockOwner::Label(label) => Block::Label(self.labels.get(label).id),
                BlockOwner::Branch(b) => Block::Branch(self.branches[b.index()].desc.clone()),
                BlockOwner::Sample(s) => Block::Sample(self.samples[s.index()].desc.clone()),
                BlockOwner::SampleUnpack(u) => {
                    Block::SampleUnpack(self.unpacks[u.index()].desc.clone())
                }
                BlockOwner::TextureWrite(t) => {
                    Block::TextureWrite(self.tex_writes[t.index()].desc.clone())
                }
                BlockOwner::Prologue => continue,
            };
            out.push(item);
        }

        out.push(Block::End);
        Container {
            byte_order: self.byte_order,
            blocks: out,
        }
    }

    /// Serialise back to container bytes in the byte order it was read with
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.to_container().encode()
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn desc(&self) -> &ProgramDesc {
        &self.desc
    }

    /// Blocks in layout order
    pub fn blocks(&self) -> &[InstBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &InstBlock {
        &self.blocks[id.index()]
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len()).map(BlockId::from_index)
    }

    pub fn labels(&self) -> &LabelTable {
        &self.labels
    }

    pub fn label(&self, id: LabelId) -> &Label {
        self.labels.get(id)
    }

    pub fn special_labels(&self) -> &SpecialLabels {
        &self.special
    }

    /// Block reserved for set-up code, present once the program-start label is read
    pub fn prologue_block(&self) -> Option<BlockId> {
        self.prologue
    }

    pub fn branches(&self) -> &[Branch] {
        &self.branches
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn sample(&self, id: SampleId) -> &Sample {
        &self.samples[id.index()]
    }

    /// Look up a sample by its container id
    pub fn find_sample(&self, id: u32) -> Option<SampleId> {
        self.sample_ids.get(&id).copied()
    }

    pub fn unpacks(&self) -> &[SampleUnpack] {
        &self.unpacks
    }

    pub fn texture_writes(&self) -> &[TextureWrite] {
        &self.tex_writes
    }

    pub fn texture_groups(&self) -> &TextureGroups {
        &self.tex_groups
    }

    pub fn result_refs(&self) -> &ResultRefs {
        &self.result_refs
    }

    /// Detach one result reference so finalisation leaves its operand alone
    pub fn remove_result_ref(&mut self, id: ResultRefId) -> Option<ResultTarget> {
        self.result_refs.remove(id)
    }
}
