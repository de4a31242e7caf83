//! Result references
//!
//! The compiler writes the shader result to a default register range. Every
//! operand that names that range is recorded here so the caller can move the
//! result to another bank at finalisation.

use crate::hw::{Operand, RegBank, RegRef};
use crate::ids::{BlockId, ResultRefId, SampleId, UnpackId};
use crate::pdesc::ProgramDesc;
use serde::Serialize;
use usp_core::error::{GraphError, Result};

/// Where a referenced operand lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultTarget {
    /// Operand of instruction `index` of a code or branch block
    Inst {
        block: BlockId,
        index: usize,
        operand: Operand,
    },
    /// Operand of a sample: the destination of a non-dependent sample or an
    /// operand of a dependent sample's base instruction
    Sample { sample: SampleId, operand: Operand },
    /// Destination of a sample unpack
    Unpack(UnpackId),
}

/// Arena of result references; removed entries leave a hole so ids stay valid
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResultRefs {
    refs: Vec<Option<ResultTarget>>,
}

impl ResultRefs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, target: ResultTarget) -> ResultRefId {
        self.refs.push(Some(target));
        ResultRefId::from_index(self.refs.len() - 1)
    }

    /// Detach a reference; returns what it pointed at
    pub fn remove(&mut self, id: ResultRefId) -> Option<ResultTarget> {
        self.refs.get_mut(id.index()).and_then(Option::take)
    }

    pub fn get(&self, id: ResultRefId) -> Option<&ResultTarget> {
        self.refs.get(id.index()).and_then(Option::as_ref)
    }

    /// References still attached
    pub fn iter(&self) -> impl Iterator<Item = (ResultRefId, &ResultTarget)> {
        self.refs
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().map(|t| (ResultRefId::from_index(i), t)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Register file the caller wants the result in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum ResultLocation {
    /// Wherever the compiler put it
    #[default]
    Default,
    Temp,
    Output,
    PrimaryAttr,
}

impl ResultLocation {
    pub fn bank(self, desc: &ProgramDesc) -> RegBank {
        match self {
            Self::Default => desc.default_result_bank,
            Self::Temp => RegBank::Temp,
            Self::Output => RegBank::Output,
            Self::PrimaryAttr => RegBank::PrimaryAttr,
        }
    }
}

/// Mapping of the default result range onto its final location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    pub from: RegRef,
    pub to: RegRef,
    pub count: u16,
}

impl Relocation {
    pub fn new(desc: &ProgramDesc, location: ResultLocation) -> Self {
        Self {
            from: desc.default_result(),
            to: desc.result_base(location.bank(desc)),
            count: desc.result_reg_count,
        }
    }

    /// Whether the result actually moves
    pub fn is_move(&self) -> bool {
        self.from != self.to
    }

    /// Final register for a referenced operand, keeping its offset in the range
    pub fn apply(&self, reg: RegRef) -> Result<RegRef> {
        if reg.num < self.from.num {
            tracing::error!("Result operand {} lies below result base {}", reg, self.from);
            return Err(GraphError::ResultOperand {
                num: reg.num,
                base: self.from.num,
            }
            .into());
        }
        Ok(self.to.offset(reg.num - self.from.num))
    }
}
