//! Typed indices into the graph's node arenas

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub(crate) u32);

        impl $name {
            pub(crate) fn from_index(index: usize) -> Self {
                Self(index as u32)
            }

            /// Position of the node in its arena
            pub fn index(self) -> usize {
                self.0 as usize
            }
        }
    };
}

define_id!(
    /// Instruction block
    BlockId
);
define_id!(
    /// Label node
    LabelId
);
define_id!(
    /// Branch node
    BranchId
);
define_id!(
    /// Dependent or non-dependent sample node
    SampleId
);
define_id!(
    /// Sample-unpack node
    UnpackId
);
define_id!(
    /// Texture-write node
    TexWriteId
);
define_id!(
    /// Result reference
    ResultRefId
);
