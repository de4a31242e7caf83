//! Labels, branches and their resolution
//!
//! Branches are read before or after the label they target. Every label and
//! branch is recorded as it is read; once the whole container has been
//! consumed a single pass binds each branch to its label.

use crate::block::{Inst, InstBlock};
use crate::codec::{ByteReader, Sink};
use crate::hw::FlowOp;
use crate::ids::{BlockId, LabelId};
use crate::moe::MoeState;
use crate::pdesc::{ProgramDesc, NO_LABEL};
use std::collections::HashMap;
use usp_core::error::{GraphError, Result};

/// Branch target meaning "no label"
pub const NO_TARGET: u32 = 0xFFFF_FFFF;

/// A flow-control instruction and the label it jumps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchDesc {
    pub target: u32,
    pub inst: Inst,
    pub moe: MoeState,
    /// Decoded from `inst`
    pub op: FlowOp,
}

impl BranchDesc {
    pub fn new(target: u32, inst: Inst, moe: MoeState) -> Result<Self> {
        let op = inst.hw.flow_op()?;
        Ok(Self {
            target,
            inst,
            moe,
            op,
        })
    }

    pub fn read(r: &mut ByteReader<'_>) -> Result<Self> {
        let target = r.read_u32()?;
        let inst = Inst::read(r)?;
        let moe = MoeState::read(r)?;
        Self::new(target, inst, moe)
    }

    pub fn write(&self, s: &mut dyn Sink) -> Result<()> {
        s.put_u32(self.target);
        self.inst.write(s);
        self.moe.write(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub id: u32,
    /// Empty block marking the labelled position
    pub block: BlockId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub desc: BranchDesc,
    pub block: BlockId,
    /// Filled in by [`resolve_branches`]
    pub label: Option<LabelId>,
}

/// Labels with a lookup by id
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelTable {
    labels: Vec<Label>,
    by_id: HashMap<u32, LabelId>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a label; ids are unique within a shader
    pub fn insert(&mut self, id: u32, block: BlockId) -> Result<LabelId> {
        if self.by_id.contains_key(&id) {
            tracing::error!("Label {} defined twice", id);
            return Err(GraphError::DuplicateLabel(id).into());
        }
        let label = LabelId::from_index(self.labels.len());
        self.labels.push(Label { id, block });
        self.by_id.insert(id, label);
        Ok(label)
    }

    pub fn find(&self, id: u32) -> Option<LabelId> {
        self.by_id.get(&id).copied()
    }

    pub fn get(&self, label: LabelId) -> &Label {
        &self.labels[label.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (LabelId, &Label)> {
        self.labels
            .iter()
            .enumerate()
            .map(|(i, l)| (LabelId::from_index(i), l))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

/// Labels the program descriptor singles out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpecialLabels {
    pub program_start: Option<LabelId>,
    pub phase0_end: Option<LabelId>,
    pub phase1_start: Option<LabelId>,
    pub split_phase1_start: Option<LabelId>,
}

impl SpecialLabels {
    /// Note `label` if its id is one the descriptor names
    pub fn record(&mut self, desc: &ProgramDesc, id: u32, label: LabelId) {
        if id == NO_LABEL {
            return;
        }
        let [start, p0_end, p1_start, split] = desc.special_labels();
        if id == start {
            self.program_start = Some(label);
        }
        if id == p0_end {
            self.phase0_end = Some(label);
        }
        if id == p1_start {
            self.phase1_start = Some(label);
        }
        if id == split {
            self.split_phase1_start = Some(label);
        }
    }
}

/// Bind every branch to its label.
///
/// The block of a label reached by a branch that must start an instruction
/// pair is flagged for pair alignment. A target that names no label is an
/// error unless it is [`NO_TARGET`].
pub fn resolve_branches(
    branches: &mut [Branch],
    labels: &LabelTable,
    blocks: &mut [InstBlock],
) -> Result<()> {
    for branch in branches.iter_mut() {
        let target = branch.desc.target;
        if target == NO_TARGET {
            branch.label = None;
            continue;
        }
        let Some(label) = labels.find(target) else {
            tracing::error!("Branch to undefined label {}", target);
            return Err(GraphError::UnresolvedBranch(target).into());
        };
        if branch.desc.inst.hw.sync_start() {
            blocks[labels.get(label).block.index()].align_to_pair = true;
        }
        branch.label = Some(label);
    }
    tracing::debug!(
        "Resolved {} branches against {} labels",
        branches.len(),
        labels.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockOwner, InstFlags};
    use crate::hw::HwInst;
    use usp_core::error::UspError;

    fn branch(target: u32, sync: bool, block: usize) -> Branch {
        let inst = Inst::new(HwInst::branch(FlowOp::Call, sync), InstFlags::empty());
        Branch {
            desc: BranchDesc::new(target, inst, MoeState::default()).unwrap(),
            block: BlockId::from_index(block),
            label: None,
        }
    }

    fn blocks(n: usize) -> Vec<InstBlock> {
        (0..n)
            .map(|_| InstBlock::empty(BlockOwner::Prologue, MoeState::default()))
            .collect()
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let mut labels = LabelTable::new();
        labels.insert(4, BlockId::from_index(0)).unwrap();
        let err = labels.insert(4, BlockId::from_index(1)).unwrap_err();
        assert!(matches!(err, UspError::Graph(GraphError::DuplicateLabel(4))));
        assert_eq!(labels.len(), 1);
    }

    #[test]
    fn test_forward_and_backward_branches_resolve() {
        let mut labels = LabelTable::new();
        let l1 = labels.insert(1, BlockId::from_index(0)).unwrap();
        let l2 = labels.insert(2, BlockId::from_index(3)).unwrap();
        let mut branches = vec![branch(2, false, 1), branch(1, true, 2), branch(NO_TARGET, false, 4)];
        let mut spine = blocks(5);

        resolve_branches(&mut branches, &labels, &mut spine).unwrap();
        assert_eq!(branches[0].label, Some(l2));
        assert_eq!(branches[1].label, Some(l1));
        assert_eq!(branches[2].label, None);

        // Only the synchronised branch forces alignment
        assert!(spine[0].align_to_pair);
        assert!(!spine[3].align_to_pair);
    }

    #[test]
    fn test_unresolved_branch_fails() {
        let labels = LabelTable::new();
        let mut branches = vec![branch(8, false, 0)];
        let err = resolve_branches(&mut branches, &labels, &mut blocks(1)).unwrap_err();
        assert!(matches!(err, UspError::Graph(GraphError::UnresolvedBranch(8))));
    }

    #[test]
    fn test_branch_requires_flow_instruction() {
        let inst = Inst::new(HwInst::nop(), InstFlags::empty());
        assert!(BranchDesc::new(0, inst, MoeState::default()).is_err());
    }

    #[test]
    fn test_special_labels() {
        let desc = ProgramDesc {
            program_start_label: 10,
            phase1_start_label: 12,
            ..Default::default()
        };
        let mut special = SpecialLabels::default();
        special.record(&desc, 10, LabelId::from_index(0));
        special.record(&desc, 11, LabelId::from_index(1));
        special.record(&desc, 12, LabelId::from_index(2));
        assert_eq!(special.program_start, Some(LabelId::from_index(0)));
        assert_eq!(special.phase0_end, None);
        assert_eq!(special.phase1_start, Some(LabelId::from_index(2)));
    }
}
