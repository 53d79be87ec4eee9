//! The leakage attribution walk: the single post-ingestion traversal that
//! discovers divergence points in the merged call tree,
//! builds per-instruction test-case partition trees, and groups them by
//! call-stack identity.

use std::collections::HashMap;

use crate::address::TaggedAddressId;
use crate::calltree::{Node, NodePayload};
use crate::record::InstructionRef;
use crate::testcase_set::TestcaseSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FindingKind {
    Call,
    Return,
    Jump,
    MemoryAccess,
}

/// One occurrence of a test-case partition at a given instruction: the set
/// is split into children, each a subset reached by a distinct outcome.
/// Children marked dummy inherit a higher, still-open divergence rather
/// than representing a new outcome at this instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct TestcaseIdTreeNode {
    pub testcases: TestcaseSet,
    pub is_dummy: bool,
    pub children: Vec<TestcaseIdTreeNode>,
}

impl TestcaseIdTreeNode {
    fn new(testcases: TestcaseSet, is_dummy: bool) -> Self {
        TestcaseIdTreeNode {
            testcases,
            is_dummy,
            children: Vec::new(),
        }
    }
}

/// Findings recorded for one instruction within one call-stack context.
/// `partition_roots` holds one entry per independent divergence occurrence
/// (normally one, but a loop can revisit the same instruction more than
/// once at the same call-stack depth).
#[derive(Debug, Clone)]
pub struct InstructionAnalysisData {
    pub instruction: InstructionRef,
    pub kind: FindingKind,
    pub partition_roots: Vec<TestcaseIdTreeNode>,
}

impl InstructionAnalysisData {
    fn new(instruction: InstructionRef, kind: FindingKind) -> Self {
        InstructionAnalysisData {
            instruction,
            kind,
            partition_roots: Vec::new(),
        }
    }
}

/// A node of the call-stack tree, parallel to the merged call tree: one
/// node per unique call-stack id ever entered.
#[derive(Debug, Clone)]
pub struct CallStackNode {
    pub id: u64,
    pub parent: Option<u64>,
    pub source: Option<InstructionRef>,
    pub target: Option<InstructionRef>,
    pub children: Vec<u64>,
    pub instruction_data: HashMap<InstructionRef, InstructionAnalysisData>,
    pub interesting: bool,
}

#[derive(Debug, Clone)]
pub struct CallStackTree {
    pub nodes: HashMap<u64, CallStackNode>,
    pub root_id: u64,
}

impl CallStackTree {
    fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            0,
            CallStackNode {
                id: 0,
                parent: None,
                source: None,
                target: None,
                children: Vec::new(),
                instruction_data: HashMap::new(),
                interesting: false,
            },
        );
        CallStackTree { nodes, root_id: 0 }
    }

    fn ensure_child(&mut self, parent_id: u64, child_id: u64, source: InstructionRef, target: InstructionRef) {
        if self.nodes.contains_key(&child_id) {
            return;
        }
        self.nodes.insert(
            child_id,
            CallStackNode {
                id: child_id,
                parent: Some(parent_id),
                source: Some(source),
                target: Some(target),
                children: Vec::new(),
                instruction_data: HashMap::new(),
                interesting: false,
            },
        );
        self.nodes.get_mut(&parent_id).unwrap().children.push(child_id);
    }

    fn mark_interesting(&mut self, mut id: u64) {
        loop {
            let node = match self.nodes.get_mut(&id) {
                Some(node) => node,
                None => break,
            };
            if node.interesting {
                break;
            }
            node.interesting = true;
            match node.parent {
                Some(parent) => id = parent,
                None => break,
            }
        }
    }

    pub fn get(&self, id: u64) -> Option<&CallStackNode> {
        self.nodes.get(&id)
    }
}

/// Locates one node within a partition tree: which occurrence
/// (`root_index` into `partition_roots`) and which path of child indices
/// down from its root.
#[derive(Clone)]
struct OpenEntry {
    root_index: usize,
    path: Vec<usize>,
}

fn divergence_key(first_successor: &Node) -> Option<InstructionRef> {
    match first_successor.payload {
        NodePayload::Call { source, .. } => Some(source),
        NodePayload::Return { source, .. } => Some(source),
        NodePayload::Branch { source, .. } => Some(source),
        _ => None,
    }
}

fn finding_kind(first_successor: &Node) -> FindingKind {
    match first_successor.payload {
        NodePayload::Call { .. } => FindingKind::Call,
        NodePayload::Return { .. } => FindingKind::Return,
        NodePayload::Branch { .. } => FindingKind::Jump,
        _ => unreachable!("finding_kind is only called on control-flow distinguishing nodes"),
    }
}

/// Runs the attribution walk over a fully-merged call tree and returns the
/// populated call-stack tree.
pub fn attribute(root: &Node) -> CallStackTree {
    let mut walker = Walker {
        call_stack_tree: CallStackTree::new(),
    };
    walker.visit_split_like(root, 0, &HashMap::new());
    walker.call_stack_tree
}

struct Walker {
    call_stack_tree: CallStackTree,
}

impl Walker {
    fn partition_node_mut(&mut self, csid: u64, instruction: InstructionRef, entry: &OpenEntry) -> &mut TestcaseIdTreeNode {
        let data = self
            .call_stack_tree
            .nodes
            .get_mut(&csid)
            .expect("open entries only reference existing call-stack nodes")
            .instruction_data
            .get_mut(&instruction)
            .expect("open entries only reference existing instruction data");
        let mut node = &mut data.partition_roots[entry.root_index];
        for &index in &entry.path {
            node = &mut node.children[index];
        }
        node
    }

    /// Groups this node's split successors by the source instruction of
    /// their first linear successor: any instruction shared by ≥2 split
    /// successors is a divergence.
    fn detect_divergence_groups(node: &Node) -> HashMap<InstructionRef, Vec<usize>> {
        let children = node.children().expect("detect_divergence_groups requires a split-like node");
        let mut groups: HashMap<InstructionRef, Vec<usize>> = HashMap::new();
        for (index, split) in children.split_successors.iter().enumerate() {
            if let Some(first) = split.children().and_then(|c| c.successors.first()) {
                if let Some(key) = divergence_key(first) {
                    groups.entry(key).or_default().push(index);
                }
            }
        }
        groups.retain(|_, members| members.len() >= 2);
        groups
    }

    fn visit_split_like(&mut self, node: &Node, csid: u64, open: &HashMap<InstructionRef, OpenEntry>) {
        let children = match node.children() {
            Some(children) => children,
            None => return,
        };

        for successor in &children.successors {
            self.visit_successor(successor, csid, open);
        }

        if children.split_successors.len() < 2 {
            for split in &children.split_successors {
                self.visit_split_like(split, csid, open);
            }
            return;
        }

        let groups = Self::detect_divergence_groups(node);
        let mut open = open.clone();

        for (instruction, members) in &groups {
            let kind = finding_kind(&children.split_successors[members[0]].children().unwrap().successors[0]);
            let entry = match open.get(instruction) {
                Some(existing) => existing.clone(),
                None => {
                    let data = self
                        .call_stack_tree
                        .nodes
                        .get_mut(&csid)
                        .unwrap()
                        .instruction_data
                        .entry(*instruction)
                        .or_insert_with(|| InstructionAnalysisData::new(*instruction, kind));
                    data.partition_roots.push(TestcaseIdTreeNode::new(node.testcases.clone(), false));
                    OpenEntry {
                        root_index: data.partition_roots.len() - 1,
                        path: Vec::new(),
                    }
                }
            };
            open.insert(*instruction, entry);
            self.call_stack_tree.mark_interesting(csid);
        }

        let tracked: Vec<InstructionRef> = open.keys().copied().collect();
        let children = node.children().unwrap();
        for (index, split) in children.split_successors.iter().enumerate() {
            let mut child_open = HashMap::new();
            for instruction in &tracked {
                let entry = open.get(instruction).unwrap().clone();
                let is_real = groups
                    .get(instruction)
                    .map_or(false, |members| members.contains(&index));
                let child_index = {
                    let parent = self.partition_node_mut(csid, *instruction, &entry);
                    parent.children.push(TestcaseIdTreeNode::new(split.testcases.clone(), !is_real));
                    parent.children.len() - 1
                };
                let mut path = entry.path.clone();
                path.push(child_index);
                child_open.insert(
                    *instruction,
                    OpenEntry {
                        root_index: entry.root_index,
                        path,
                    },
                );
            }
            self.visit_split_like(split, csid, &child_open);
        }
    }

    fn visit_successor(&mut self, successor: &Node, csid: u64, _open: &HashMap<InstructionRef, OpenEntry>) {
        match &successor.payload {
            NodePayload::Call {
                source,
                target,
                call_stack_id,
            } => {
                self.call_stack_tree.ensure_child(csid, *call_stack_id, *source, *target);
                // a nested call starts with an empty per-instruction map.
                self.visit_split_like(successor, *call_stack_id, &HashMap::new());
            }
            NodePayload::MemoryAccess { instruction, targets, .. } => {
                if targets.len() > 1 {
                    self.record_memory_divergence(csid, *instruction, successor.testcases.clone(), targets);
                }
            }
            NodePayload::Branch { .. } | NodePayload::Return { .. } | NodePayload::Allocation { .. } => {}
            NodePayload::Root | NodePayload::Split => {
                unreachable!("Root/Split never appear as linear successors")
            }
        }
    }

    fn record_memory_divergence(
        &mut self,
        csid: u64,
        instruction: InstructionRef,
        testcases: TestcaseSet,
        targets: &[(TaggedAddressId, TestcaseSet)],
    ) {
        let data = self
            .call_stack_tree
            .nodes
            .get_mut(&csid)
            .unwrap()
            .instruction_data
            .entry(instruction)
            .or_insert_with(|| InstructionAnalysisData::new(instruction, FindingKind::MemoryAccess));
        let mut root = TestcaseIdTreeNode::new(testcases, false);
        for (_, set) in targets {
            root.children.push(TestcaseIdTreeNode::new(set.clone(), false));
        }
        data.partition_roots.push(root);
        self.call_stack_tree.mark_interesting(csid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::address::NullResolver;
    use crate::merge::AnalysisContext;
    use crate::record::{BranchKind, ImageFileInfo, TraceRecord};

    fn images() -> Vec<ImageFileInfo> {
        vec![ImageFileInfo {
            id: 1,
            low: 0,
            high: 0xffff,
            name: "prog".to_string(),
        }]
    }

    fn call(src: u32, dst: u32) -> TraceRecord {
        TraceRecord::Branch {
            kind: BranchKind::Call,
            source_image_id: 1,
            source_offset: src,
            dest_image_id: 1,
            dest_offset: dst,
            taken: true,
        }
    }

    fn jump(src: u32, dst: u32) -> TraceRecord {
        TraceRecord::Branch {
            kind: BranchKind::Jump,
            source_image_id: 1,
            source_offset: src,
            dest_image_id: 1,
            dest_offset: dst,
            taken: true,
        }
    }

    fn ret(src: u32, dst: u32) -> TraceRecord {
        TraceRecord::Branch {
            kind: BranchKind::Return,
            source_image_id: 1,
            source_offset: src,
            dest_image_id: 1,
            dest_offset: dst,
            taken: true,
        }
    }

    #[test]
    fn identical_traces_yield_no_findings() {
        let mut ctx = AnalysisContext::new();
        let resolver = NullResolver;
        let trace = vec![call(10, 20), jump(21, 25), ret(25, 11)];
        ctx.add_trace(0, &images(), trace.clone(), &resolver).unwrap();
        ctx.add_trace(1, &images(), trace, &resolver).unwrap();

        let tree = attribute(&ctx.root);
        assert!(tree.nodes.values().all(|n| n.instruction_data.is_empty()));
    }

    #[test]
    fn divergent_branch_is_found_inside_the_call_stack() {
        let mut ctx = AnalysisContext::new();
        let resolver = NullResolver;
        ctx.add_trace(0, &images(), vec![call(10, 20), jump(21, 25), ret(25, 11)], &resolver)
            .unwrap();
        ctx.add_trace(1, &images(), vec![call(10, 20), jump(21, 30), ret(30, 11)], &resolver)
            .unwrap();

        let tree = attribute(&ctx.root);
        let call_stack_id = match &ctx.root.children().unwrap().successors[0].payload {
            NodePayload::Call { call_stack_id, .. } => *call_stack_id,
            _ => panic!("expected a Call node"),
        };

        assert!(!tree.get(0).unwrap().instruction_data.contains_key(&InstructionRef {
            image_id: 1,
            offset: 21
        }));
        let inner = tree.get(call_stack_id).unwrap();
        assert!(inner.interesting);
        let data = inner
            .instruction_data
            .get(&InstructionRef { image_id: 1, offset: 21 })
            .unwrap();
        assert_eq!(data.kind, FindingKind::Jump);
        assert_eq!(data.partition_roots.len(), 1);

        let expected = TestcaseIdTreeNode {
            testcases: [0u32, 1].iter().copied().collect(),
            is_dummy: false,
            children: vec![
                TestcaseIdTreeNode {
                    testcases: TestcaseSet::singleton(0),
                    is_dummy: false,
                    children: Vec::new(),
                },
                TestcaseIdTreeNode {
                    testcases: TestcaseSet::singleton(1),
                    is_dummy: false,
                    children: Vec::new(),
                },
            ],
        };
        assert_eq!(data.partition_roots[0], expected);
    }

    #[test]
    fn memory_divergence_creates_two_children() {
        let mut ctx = AnalysisContext::new();
        let resolver = NullResolver;
        ctx.add_trace(
            0,
            &images(),
            vec![TraceRecord::ImageMemoryAccess {
                is_write: false,
                instruction_image_id: 1,
                instruction_offset: 42,
                memory_image_id: 1,
                memory_offset: 0x100,
            }],
            &resolver,
        )
        .unwrap();
        ctx.add_trace(
            1,
            &images(),
            vec![TraceRecord::ImageMemoryAccess {
                is_write: false,
                instruction_image_id: 1,
                instruction_offset: 42,
                memory_image_id: 1,
                memory_offset: 0x200,
            }],
            &resolver,
        )
        .unwrap();

        let tree = attribute(&ctx.root);
        let data = tree
            .get(0)
            .unwrap()
            .instruction_data
            .get(&InstructionRef { image_id: 1, offset: 42 })
            .unwrap();
        assert_eq!(data.kind, FindingKind::MemoryAccess);

        let expected = TestcaseIdTreeNode {
            testcases: [0u32, 1].iter().copied().collect(),
            is_dummy: false,
            children: vec![
                TestcaseIdTreeNode {
                    testcases: TestcaseSet::singleton(0),
                    is_dummy: false,
                    children: Vec::new(),
                },
                TestcaseIdTreeNode {
                    testcases: TestcaseSet::singleton(1),
                    is_dummy: false,
                    children: Vec::new(),
                },
            ],
        };
        assert_eq!(data.partition_roots[0], expected);
    }
}
