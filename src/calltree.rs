//! The merged call-tree node model. A tagged sum over {Root, Split, Call,
//! Branch, Return, Allocation, MemoryAccess}. Split-like nodes (Root,
//! Split, Call) share a pair of successor lists; the other variants are
//! leaves. Every node carries its own test-case set as a common field.

use crate::address::TaggedAddressId;
use crate::record::InstructionRef;
use crate::testcase_set::TestcaseSet;

/// The distinguishing key of a node, used by the merge engine's six-case
/// dispatch to decide "linear match" vs "linear conflict", and by the
/// split successor lookup when an existing divergence is revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistinguishingKey {
    Call {
        source: InstructionRef,
        target: InstructionRef,
    },
    Branch {
        source: InstructionRef,
        target: InstructionRef,
    },
    Return {
        source: InstructionRef,
        target: InstructionRef,
    },
    Allocation {
        size: u32,
        is_heap: bool,
    },
    MemoryAccess {
        instruction: InstructionRef,
    },
}

/// Node-specific payload. Control-flow fields for Branch carry `taken` for
/// informational rendering only -- it is deliberately excluded from
/// [`DistinguishingKey::Branch`]: two branches with the same source/target
/// but opposite outcomes are still the same distinguishing key, since
/// matching relies on source/target, not the observed outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum NodePayload {
    Root,
    Split,
    Call {
        source: InstructionRef,
        target: InstructionRef,
        call_stack_id: u64,
    },
    Branch {
        source: InstructionRef,
        target: InstructionRef,
        taken: bool,
    },
    Return {
        source: InstructionRef,
        target: InstructionRef,
    },
    Allocation {
        shared_allocation_id: u32,
        size: u32,
        is_heap: bool,
    },
    MemoryAccess {
        instruction: InstructionRef,
        is_write: bool,
        /// Insertion-ordered: one entry per target address, in the order
        /// first touched. Target counts are small in practice so a
        /// linear-scan association list beats pulling in an ordered-map
        /// dependency for this.
        targets: Vec<(TaggedAddressId, TestcaseSet)>,
    },
}

impl NodePayload {
    pub fn is_split_like(&self) -> bool {
        matches!(self, NodePayload::Root | NodePayload::Split | NodePayload::Call { .. })
    }

    pub fn is_call(&self) -> bool {
        matches!(self, NodePayload::Call { .. })
    }

    pub fn distinguishing_key(&self) -> Option<DistinguishingKey> {
        match *self {
            NodePayload::Call { source, target, .. } => {
                Some(DistinguishingKey::Call { source, target })
            }
            NodePayload::Branch { source, target, .. } => {
                Some(DistinguishingKey::Branch { source, target })
            }
            NodePayload::Return { source, target } => {
                Some(DistinguishingKey::Return { source, target })
            }
            NodePayload::Allocation { size, is_heap, .. } => {
                Some(DistinguishingKey::Allocation { size, is_heap })
            }
            NodePayload::MemoryAccess { instruction, .. } => {
                Some(DistinguishingKey::MemoryAccess { instruction })
            }
            NodePayload::Root | NodePayload::Split => None,
        }
    }
}

/// The successor lists shared by split-like nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Children {
    /// The linear tail shared by all test cases that reached this node
    /// without diverging.
    pub successors: Vec<Node>,
    /// Alternatives reached only by a strict subset of `testcases`,
    /// pairwise disjoint in membership.
    pub split_successors: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub testcases: TestcaseSet,
    pub payload: NodePayload,
    /// `Some` for Root/Split/Call, `None` for leaf variants.
    pub children: Option<Children>,
}

impl Node {
    fn split_like(testcases: TestcaseSet, payload: NodePayload) -> Self {
        debug_assert!(payload.is_split_like());
        Node {
            testcases,
            payload,
            children: Some(Children::default()),
        }
    }

    fn leaf(testcases: TestcaseSet, payload: NodePayload) -> Self {
        debug_assert!(!payload.is_split_like());
        Node {
            testcases,
            payload,
            children: None,
        }
    }

    pub fn root() -> Self {
        Self::split_like(TestcaseSet::new(), NodePayload::Root)
    }

    pub fn new_split(testcases: TestcaseSet) -> Self {
        Self::split_like(testcases, NodePayload::Split)
    }

    pub fn new_call(
        testcases: TestcaseSet,
        source: InstructionRef,
        target: InstructionRef,
        call_stack_id: u64,
    ) -> Self {
        Self::split_like(
            testcases,
            NodePayload::Call {
                source,
                target,
                call_stack_id,
            },
        )
    }

    pub fn new_branch(
        testcases: TestcaseSet,
        source: InstructionRef,
        target: InstructionRef,
        taken: bool,
    ) -> Self {
        Self::leaf(testcases, NodePayload::Branch { source, target, taken })
    }

    pub fn new_return(testcases: TestcaseSet, source: InstructionRef, target: InstructionRef) -> Self {
        Self::leaf(testcases, NodePayload::Return { source, target })
    }

    pub fn new_allocation(
        testcases: TestcaseSet,
        shared_allocation_id: u32,
        size: u32,
        is_heap: bool,
    ) -> Self {
        Self::leaf(
            testcases,
            NodePayload::Allocation {
                shared_allocation_id,
                size,
                is_heap,
            },
        )
    }

    pub fn new_memory_access(
        testcases: TestcaseSet,
        instruction: InstructionRef,
        is_write: bool,
    ) -> Self {
        Self::leaf(
            testcases,
            NodePayload::MemoryAccess {
                instruction,
                is_write,
                targets: Vec::new(),
            },
        )
    }

    pub fn children(&self) -> Option<&Children> {
        self.children.as_ref()
    }

    pub fn children_mut(&mut self) -> Option<&mut Children> {
        self.children.as_mut()
    }

    pub fn distinguishing_key(&self) -> Option<DistinguishingKey> {
        self.payload.distinguishing_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instr(offset: u32) -> InstructionRef {
        InstructionRef { image_id: 1, offset }
    }

    #[test]
    fn root_is_split_like_with_empty_children() {
        let root = Node::root();
        assert!(root.payload.is_split_like());
        let children = root.children().unwrap();
        assert!(children.successors.is_empty());
        assert!(children.split_successors.is_empty());
    }

    #[test]
    fn branch_is_leaf() {
        let node = Node::new_branch(TestcaseSet::singleton(0), instr(1), instr(2), true);
        assert!(node.children().is_none());
    }

    #[test]
    fn branch_distinguishing_key_excludes_taken() {
        let taken = Node::new_branch(TestcaseSet::singleton(0), instr(1), instr(2), true);
        let not_taken = Node::new_branch(TestcaseSet::singleton(1), instr(1), instr(2), false);
        assert_eq!(taken.distinguishing_key(), not_taken.distinguishing_key());
    }

    #[test]
    fn allocation_key_ignores_per_trace_id() {
        let a = Node::new_allocation(TestcaseSet::singleton(0), 10, 16, true);
        let b = Node::new_allocation(TestcaseSet::singleton(1), 11, 16, true);
        assert_eq!(a.distinguishing_key(), b.distinguishing_key());
    }
}
