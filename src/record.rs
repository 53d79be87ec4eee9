//! The trace record stream consumed by the merge engine. This is the
//! boundary with the tracer/preprocessor that produces it -- only the
//! shape of what crosses that boundary lives here, never how it got
//! produced.

use strum_macros::{Display, EnumString};

/// One loaded image, part of the per-trace prefix used to resolve image
/// ids to human names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFileInfo {
    pub id: u32,
    pub low: u64,
    pub high: u64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum BranchKind {
    Call,
    Jump,
    Return,
}

/// One trace record, as ingested by [`crate::merge::AnalysisContext::add_trace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceRecord {
    Branch {
        kind: BranchKind,
        source_image_id: u32,
        source_offset: u32,
        /// Meaningful only when `taken` is true.
        dest_image_id: u32,
        dest_offset: u32,
        taken: bool,
    },
    HeapAllocation {
        id: i32,
        size: u32,
    },
    StackAllocation {
        id: i32,
        size: u32,
    },
    ImageMemoryAccess {
        is_write: bool,
        instruction_image_id: u32,
        instruction_offset: u32,
        memory_image_id: u32,
        memory_offset: u32,
    },
    StackMemoryAccess {
        is_write: bool,
        instruction_image_id: u32,
        instruction_offset: u32,
        /// -1 = unmapped.
        stack_alloc_id: i32,
        memory_offset: u32,
    },
    HeapMemoryAccess {
        is_write: bool,
        instruction_image_id: u32,
        instruction_offset: u32,
        heap_alloc_id: i32,
        memory_offset: u32,
    },
}

/// Source-instruction identity used as a distinguishing key throughout the
/// merge engine: an (image, offset) pair, not yet interned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstructionRef {
    pub image_id: u32,
    pub offset: u32,
}

impl TraceRecord {
    /// The instruction this record is attached to, used by the merge
    /// engine's six-case dispatch as the record's "source".
    pub fn source(&self) -> InstructionRef {
        match *self {
            TraceRecord::Branch {
                source_image_id,
                source_offset,
                ..
            } => InstructionRef {
                image_id: source_image_id,
                offset: source_offset,
            },
            TraceRecord::ImageMemoryAccess {
                instruction_image_id,
                instruction_offset,
                ..
            }
            | TraceRecord::StackMemoryAccess {
                instruction_image_id,
                instruction_offset,
                ..
            }
            | TraceRecord::HeapMemoryAccess {
                instruction_image_id,
                instruction_offset,
                ..
            } => InstructionRef {
                image_id: instruction_image_id,
                offset: instruction_offset,
            },
            // Allocations carry no source instruction in the trace format;
            // the merge engine keys on (size, is_heap) instead.
            TraceRecord::HeapAllocation { .. } | TraceRecord::StackAllocation { .. } => {
                InstructionRef {
                    image_id: 0,
                    offset: 0,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_source_is_source_fields() {
        let rec = TraceRecord::Branch {
            kind: BranchKind::Jump,
            source_image_id: 1,
            source_offset: 0x10,
            dest_image_id: 1,
            dest_offset: 0x20,
            taken: true,
        };
        assert_eq!(
            rec.source(),
            InstructionRef {
                image_id: 1,
                offset: 0x10
            }
        );
    }

    #[test]
    fn branch_kind_display() {
        assert_eq!(BranchKind::Call.to_string(), "Call");
    }
}
