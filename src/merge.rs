//! The trace ingestion / merge engine: the per-record state machine that
//! walks and extends the shared call tree for one test case at a time.
//! The six-case decision tree below is the heart of it.

use std::collections::HashMap;

use log::warn;

use crate::address::{AddressFormatter, SymbolResolver, UNMAPPED_HEAP, UNMAPPED_STACK};
use crate::calltree::{DistinguishingKey, Node, NodePayload};
use crate::error::{Error, Result};
use crate::hash::fnv1a;
use crate::record::{BranchKind, ImageFileInfo, InstructionRef, TraceRecord};
use crate::split::split_at;
use crate::testcase_set::{TestcaseId, TestcaseSet};

/// Tally of structural anomalies recovered from during ingestion. Exposed
/// so a caller can audit how often the tolerant paths fired instead of
/// having to scrape logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnalysisStats {
    pub by_condition_code: [u64; 6],
    pub unmapped_allocations: u64,
    pub empty_return_stacks: u64,
    /// How often a memory access causes a linear conflict (expected to be
    /// rare/never, kept tolerant anyway).
    pub memory_access_splits: u64,
}

impl AnalysisStats {
    fn record(&mut self, case: SixCase) {
        self.by_condition_code[condition_code(case) as usize - 1] += 1;
    }
}

/// The six cases of the merge decision tree, numbered so warnings can
/// cite "condition code N".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SixCase {
    LinearMatch,
    LinearConflict,
    ExhaustedSoleOccupant,
    ExhaustedMatchingSplit { split_index: usize },
    ExhaustedNewSplit,
    Weird,
}

fn condition_code(case: SixCase) -> u8 {
    match case {
        SixCase::LinearMatch => 1,
        SixCase::LinearConflict => 2,
        SixCase::ExhaustedSoleOccupant => 3,
        SixCase::ExhaustedMatchingSplit { .. } => 4,
        SixCase::ExhaustedNewSplit => 5,
        SixCase::Weird => 6,
    }
}

fn classify(node: &Node, index: usize, key: &DistinguishingKey) -> SixCase {
    let children = node
        .children()
        .expect("classify is only called against split-like nodes");
    if let Some(existing) = children.successors.get(index) {
        return if existing.distinguishing_key().as_ref() == Some(key) {
            SixCase::LinearMatch
        } else {
            SixCase::LinearConflict
        };
    }
    if node.testcases.count() == 1 {
        return SixCase::ExhaustedSoleOccupant;
    }
    if !children.split_successors.is_empty() {
        let matching = children.split_successors.iter().position(|split| {
            split
                .children()
                .and_then(|c| c.successors.first())
                .and_then(|n| n.distinguishing_key())
                .as_ref()
                == Some(key)
        });
        return match matching {
            Some(split_index) => SixCase::ExhaustedMatchingSplit { split_index },
            None => SixCase::ExhaustedNewSplit,
        };
    }
    SixCase::Weird
}

/// Where the node a record resolved to now lives, relative to the node
/// `classify` was called against.
#[derive(Debug, Clone, Copy)]
enum Resolved {
    /// `successors[index]` of the classified node (matched or freshly
    /// appended).
    Linear(usize),
    /// `split_successors[index].successors[0]` -- the distinguishing first
    /// child of a (possibly brand new) split alternative.
    SplitChild(usize),
}

/// Applies the outcome of `classify` uniformly: matches add membership to
/// the existing node; everything else creates exactly one fresh node via
/// `make_node` and either appends it linearly or wraps it in a new split
/// alternative. Shared by every record kind's ingest function -- what
/// differs between kinds is the key, the node constructor, and what
/// happens to the resolved node afterward.
fn resolve_or_create(
    current: &mut Node,
    index: usize,
    case: SixCase,
    testcase: TestcaseId,
    make_node: impl FnOnce(TestcaseSet) -> Node,
) -> Resolved {
    match case {
        SixCase::LinearMatch => {
            let children = current.children_mut().unwrap();
            children.successors[index].testcases.add(testcase);
            Resolved::Linear(index)
        }
        SixCase::LinearConflict => {
            let new_node = make_node(TestcaseSet::singleton(testcase));
            let split_index = split_at(current, index, testcase, new_node);
            Resolved::SplitChild(split_index)
        }
        SixCase::ExhaustedSoleOccupant => {
            let new_node = make_node(TestcaseSet::singleton(testcase));
            let children = current.children_mut().unwrap();
            children.successors.push(new_node);
            Resolved::Linear(children.successors.len() - 1)
        }
        SixCase::ExhaustedMatchingSplit { split_index } => {
            let children = current.children_mut().unwrap();
            let split = &mut children.split_successors[split_index];
            split.testcases.add(testcase);
            split.children_mut().unwrap().successors[0]
                .testcases
                .add(testcase);
            Resolved::SplitChild(split_index)
        }
        SixCase::ExhaustedNewSplit | SixCase::Weird => {
            let new_node = make_node(TestcaseSet::singleton(testcase));
            let mut split = Node::new_split(TestcaseSet::singleton(testcase));
            split.children_mut().unwrap().successors.push(new_node);
            let children = current.children_mut().unwrap();
            children.split_successors.push(split);
            Resolved::SplitChild(children.split_successors.len() - 1)
        }
    }
}

fn resolved_node_mut<'a>(current: &'a mut Node, resolved: &Resolved) -> &'a mut Node {
    match *resolved {
        Resolved::Linear(i) => &mut current.children_mut().unwrap().successors[i],
        Resolved::SplitChild(i) => {
            &mut current.children_mut().unwrap().split_successors[i]
                .children_mut()
                .unwrap()
                .successors[0]
        }
    }
}

/// Where a trace continues appending linear successors once a record has
/// been resolved against a split-like node.
fn resume_point(resolved: Resolved, current_path: &[PathStep]) -> (Vec<PathStep>, usize) {
    match resolved {
        Resolved::Linear(i) => (current_path.to_vec(), i + 1),
        Resolved::SplitChild(i) => {
            let mut path = current_path.to_vec();
            path.push(PathStep::SplitSuccessor(i));
            (path, 1)
        }
    }
}

/// Where to descend to process records *inside* a just-resolved Call node.
fn descend_path(resolved: Resolved, current_path: &[PathStep]) -> Vec<PathStep> {
    match resolved {
        Resolved::Linear(i) => {
            let mut path = current_path.to_vec();
            path.push(PathStep::Successor(i));
            path
        }
        Resolved::SplitChild(i) => {
            let mut path = current_path.to_vec();
            path.push(PathStep::SplitSuccessor(i));
            path.push(PathStep::Successor(0));
            path
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathStep {
    Successor(usize),
    SplitSuccessor(usize),
}

fn navigate<'a>(root: &'a Node, path: &[PathStep]) -> &'a Node {
    let mut node = root;
    for step in path {
        let children = node.children().expect("path only threads through split-like nodes");
        node = match *step {
            PathStep::Successor(i) => &children.successors[i],
            PathStep::SplitSuccessor(i) => &children.split_successors[i],
        };
    }
    node
}

fn navigate_mut<'a>(root: &'a mut Node, path: &[PathStep]) -> &'a mut Node {
    let mut node = root;
    for step in path {
        let children = node
            .children_mut()
            .expect("path only threads through split-like nodes");
        node = match *step {
            PathStep::Successor(i) => &mut children.successors[i],
            PathStep::SplitSuccessor(i) => &mut children.split_successors[i],
        };
    }
    node
}

/// Saved state of an open call, restored on the matching Return.
struct Frame {
    path: Vec<PathStep>,
    index: usize,
    call_stack_id: u64,
}

/// Per-trace cursor: current position in the tree, the open call-frame
/// stack, and the per-trace allocation dictionaries, valid only for the
/// duration of ingesting one trace.
struct Cursor {
    path: Vec<PathStep>,
    index: usize,
    call_stack_id: u64,
    frames: Vec<Frame>,
    heap_allocations: HashMap<i32, u32>,
    stack_allocations: HashMap<i32, u32>,
    warned_unmapped_heap: bool,
    warned_unmapped_stack: bool,
}

impl Cursor {
    fn new() -> Self {
        Cursor {
            path: Vec::new(),
            index: 0,
            call_stack_id: 0,
            frames: Vec::new(),
            heap_allocations: HashMap::new(),
            stack_allocations: HashMap::new(),
            warned_unmapped_heap: false,
            warned_unmapped_stack: false,
        }
    }
}

/// The shared analysis context: the root node, the address interner, the
/// allocation-id counter, and the structural-anomaly tally, threaded
/// through every `add_trace` call instead of living in statics.
pub struct AnalysisContext {
    pub root: Node,
    pub formatter: AddressFormatter,
    pub stats: AnalysisStats,
    next_shared_allocation_id: u32,
}

impl Default for AnalysisContext {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalysisContext {
    pub fn new() -> Self {
        AnalysisContext {
            root: Node::root(),
            formatter: AddressFormatter::new(),
            stats: AnalysisStats::default(),
            // 0 and 1 are reserved sentinels (UNMAPPED_STACK, UNMAPPED_HEAP).
            next_shared_allocation_id: 2,
        }
    }

    fn mint_allocation_id(&mut self) -> u32 {
        let id = self.next_shared_allocation_id;
        self.next_shared_allocation_id += 1;
        id
    }

    /// Derives the call-stack id for a call from `prev` under source `s`
    /// to target `t`: a 64-bit hash of `prev ∥ s ∥ t`, strict little-endian.
    fn derive_call_stack_id(prev: u64, source: InstructionRef, target: InstructionRef) -> u64 {
        let mut bytes = [0u8; 24];
        bytes[0..8].copy_from_slice(&prev.to_le_bytes());
        bytes[8..12].copy_from_slice(&source.image_id.to_le_bytes());
        bytes[12..16].copy_from_slice(&source.offset.to_le_bytes());
        bytes[16..20].copy_from_slice(&target.image_id.to_le_bytes());
        bytes[20..24].copy_from_slice(&target.offset.to_le_bytes());
        fnv1a(&bytes)
    }

    fn log_anomaly(&mut self, case: SixCase, record_index: usize) {
        self.stats.record(case);
        if case == SixCase::Weird {
            warn!(
                "weird case at trace record {}: no existing divergence to split against (condition code {})",
                record_index,
                condition_code(case)
            );
        }
    }

    /// Ingests one test case's trace. `images` is the per-trace prefix
    /// table; an empty table is treated as a malformed/missing prefix and
    /// rejected without touching the tree.
    pub fn add_trace(
        &mut self,
        testcase: TestcaseId,
        images: &[ImageFileInfo],
        records: impl IntoIterator<Item = TraceRecord>,
        resolver: &dyn SymbolResolver,
    ) -> Result<()> {
        if images.is_empty() {
            return Err(Error::Input {
                inner: "trace is missing its image prefix table".to_string(),
            });
        }

        self.root.testcases.add(testcase);
        let mut cursor = Cursor::new();

        for (record_index, record) in records.into_iter().enumerate() {
            self.ingest_record(&mut cursor, testcase, record_index, record, resolver);
        }

        Ok(())
    }

    fn ingest_record(
        &mut self,
        cursor: &mut Cursor,
        testcase: TestcaseId,
        record_index: usize,
        record: TraceRecord,
        resolver: &dyn SymbolResolver,
    ) {
        match record {
            TraceRecord::Branch {
                kind: BranchKind::Call,
                source_image_id,
                source_offset,
                dest_image_id,
                dest_offset,
                ..
            } => {
                let source = InstructionRef {
                    image_id: source_image_id,
                    offset: source_offset,
                };
                let target = InstructionRef {
                    image_id: dest_image_id,
                    offset: dest_offset,
                };
                self.ingest_call(cursor, testcase, record_index, source, target);
            }
            TraceRecord::Branch {
                kind: BranchKind::Return,
                source_image_id,
                source_offset,
                dest_image_id,
                dest_offset,
                ..
            } => {
                let source = InstructionRef {
                    image_id: source_image_id,
                    offset: source_offset,
                };
                let target = InstructionRef {
                    image_id: dest_image_id,
                    offset: dest_offset,
                };
                self.ingest_return(cursor, testcase, record_index, source, target);
            }
            TraceRecord::Branch {
                kind: BranchKind::Jump,
                source_image_id,
                source_offset,
                dest_image_id,
                dest_offset,
                taken,
            } => {
                let source = InstructionRef {
                    image_id: source_image_id,
                    offset: source_offset,
                };
                let target = InstructionRef {
                    image_id: dest_image_id,
                    offset: dest_offset,
                };
                self.ingest_branch(cursor, testcase, record_index, source, target, taken);
            }
            TraceRecord::HeapAllocation { id, size } => {
                self.ingest_allocation(cursor, testcase, record_index, id, size, true);
            }
            TraceRecord::StackAllocation { id, size } => {
                self.ingest_allocation(cursor, testcase, record_index, id, size, false);
            }
            TraceRecord::ImageMemoryAccess {
                is_write,
                instruction_image_id,
                instruction_offset,
                memory_image_id,
                memory_offset,
            } => {
                let instruction = InstructionRef {
                    image_id: instruction_image_id,
                    offset: instruction_offset,
                };
                let target = self
                    .formatter
                    .intern_image(resolver, memory_image_id, memory_offset);
                self.ingest_memory_access(cursor, testcase, record_index, instruction, is_write, target);
            }
            TraceRecord::StackMemoryAccess {
                is_write,
                instruction_image_id,
                instruction_offset,
                stack_alloc_id,
                memory_offset,
            } => {
                let instruction = InstructionRef {
                    image_id: instruction_image_id,
                    offset: instruction_offset,
                };
                let shared_id = if stack_alloc_id < 0 {
                    UNMAPPED_STACK
                } else {
                    match cursor.stack_allocations.get(&stack_alloc_id) {
                        Some(&id) => id,
                        None => {
                            self.stats.unmapped_allocations += 1;
                            if !cursor.warned_unmapped_stack {
                                cursor.warned_unmapped_stack = true;
                                warn!(
                                    "unmapped stack allocation {} at trace record {}, falling back to sentinel",
                                    stack_alloc_id, record_index
                                );
                            }
                            UNMAPPED_STACK
                        }
                    }
                };
                let target = self.formatter.intern_memory(shared_id, memory_offset, false);
                self.ingest_memory_access(cursor, testcase, record_index, instruction, is_write, target);
            }
            TraceRecord::HeapMemoryAccess {
                is_write,
                instruction_image_id,
                instruction_offset,
                heap_alloc_id,
                memory_offset,
            } => {
                let instruction = InstructionRef {
                    image_id: instruction_image_id,
                    offset: instruction_offset,
                };
                let shared_id = match cursor.heap_allocations.get(&heap_alloc_id) {
                    Some(&id) => id,
                    None => {
                        self.stats.unmapped_allocations += 1;
                        if !cursor.warned_unmapped_heap {
                            cursor.warned_unmapped_heap = true;
                            warn!(
                                "unmapped heap allocation {} at trace record {}, falling back to sentinel",
                                heap_alloc_id, record_index
                            );
                        }
                        UNMAPPED_HEAP
                    }
                };
                let target = self.formatter.intern_memory(shared_id, memory_offset, true);
                self.ingest_memory_access(cursor, testcase, record_index, instruction, is_write, target);
            }
        }
    }

    fn ingest_branch(
        &mut self,
        cursor: &mut Cursor,
        testcase: TestcaseId,
        record_index: usize,
        source: InstructionRef,
        target: InstructionRef,
        taken: bool,
    ) {
        let key = DistinguishingKey::Branch { source, target };
        let case = classify(navigate(&self.root, &cursor.path), cursor.index, &key);
        self.log_anomaly(case, record_index);

        let current = navigate_mut(&mut self.root, &cursor.path);
        let resolved = resolve_or_create(current, cursor.index, case, testcase, |ts| {
            Node::new_branch(ts, source, target, taken)
        });

        let (path, index) = resume_point(resolved, &cursor.path);
        cursor.path = path;
        cursor.index = index;
    }

    fn ingest_call(
        &mut self,
        cursor: &mut Cursor,
        testcase: TestcaseId,
        record_index: usize,
        source: InstructionRef,
        target: InstructionRef,
    ) {
        let key = DistinguishingKey::Call { source, target };
        let case = classify(navigate(&self.root, &cursor.path), cursor.index, &key);
        self.log_anomaly(case, record_index);

        let prev_call_stack_id = cursor.call_stack_id;
        let new_call_stack_id = Self::derive_call_stack_id(prev_call_stack_id, source, target);

        let current = navigate_mut(&mut self.root, &cursor.path);
        let resolved = resolve_or_create(current, cursor.index, case, testcase, |ts| {
            Node::new_call(ts, source, target, new_call_stack_id)
        });

        let call_stack_id = match &resolved_node_mut(current, &resolved).payload {
            NodePayload::Call { call_stack_id, .. } => *call_stack_id,
            _ => unreachable!("ingest_call always resolves to a Call node"),
        };

        let (resume_path, resume_index) = resume_point(resolved, &cursor.path);
        cursor.frames.push(Frame {
            path: resume_path,
            index: resume_index,
            call_stack_id: prev_call_stack_id,
        });

        cursor.path = descend_path(resolved, &cursor.path);
        cursor.index = 0;
        cursor.call_stack_id = call_stack_id;
    }

    fn ingest_return(
        &mut self,
        cursor: &mut Cursor,
        testcase: TestcaseId,
        record_index: usize,
        source: InstructionRef,
        target: InstructionRef,
    ) {
        let key = DistinguishingKey::Return { source, target };
        let case = classify(navigate(&self.root, &cursor.path), cursor.index, &key);
        self.log_anomaly(case, record_index);

        let current = navigate_mut(&mut self.root, &cursor.path);
        resolve_or_create(current, cursor.index, case, testcase, |ts| {
            Node::new_return(ts, source, target)
        });

        match cursor.frames.pop() {
            Some(frame) => {
                cursor.path = frame.path;
                cursor.index = frame.index;
                cursor.call_stack_id = frame.call_stack_id;
            }
            None => {
                self.stats.empty_return_stacks += 1;
                warn!(
                    "return with an empty call-frame stack at trace record {} (condition code {}), continuing from the root",
                    record_index,
                    condition_code(case)
                );
                cursor.path = Vec::new();
                cursor.index = 0;
                cursor.call_stack_id = 0;
            }
        }
    }

    fn ingest_allocation(
        &mut self,
        cursor: &mut Cursor,
        testcase: TestcaseId,
        record_index: usize,
        per_trace_id: i32,
        size: u32,
        is_heap: bool,
    ) {
        let key = DistinguishingKey::Allocation { size, is_heap };
        let case = classify(navigate(&self.root, &cursor.path), cursor.index, &key);
        self.log_anomaly(case, record_index);

        let reuses_existing = matches!(
            case,
            SixCase::LinearMatch | SixCase::ExhaustedMatchingSplit { .. }
        );
        let minted_id = if reuses_existing {
            None
        } else {
            Some(self.mint_allocation_id())
        };

        let current = navigate_mut(&mut self.root, &cursor.path);
        let resolved = resolve_or_create(current, cursor.index, case, testcase, |ts| {
            Node::new_allocation(ts, minted_id.expect("fresh allocation id"), size, is_heap)
        });

        let shared_id = match &resolved_node_mut(current, &resolved).payload {
            NodePayload::Allocation {
                shared_allocation_id,
                ..
            } => *shared_allocation_id,
            _ => unreachable!("ingest_allocation always resolves to an Allocation node"),
        };

        let dict = if is_heap {
            &mut cursor.heap_allocations
        } else {
            &mut cursor.stack_allocations
        };
        dict.insert(per_trace_id, shared_id);

        let (path, index) = resume_point(resolved, &cursor.path);
        cursor.path = path;
        cursor.index = index;
    }

    fn ingest_memory_access(
        &mut self,
        cursor: &mut Cursor,
        testcase: TestcaseId,
        record_index: usize,
        instruction: InstructionRef,
        is_write: bool,
        target: crate::address::TaggedAddressId,
    ) {
        let key = DistinguishingKey::MemoryAccess { instruction };
        let case = classify(navigate(&self.root, &cursor.path), cursor.index, &key);
        self.log_anomaly(case, record_index);
        if case == SixCase::LinearConflict {
            self.stats.memory_access_splits += 1;
            warn!(
                "memory access at trace record {} caused a linear conflict (condition code 2); handling it as a split",
                record_index
            );
        }

        let current = navigate_mut(&mut self.root, &cursor.path);
        let resolved = resolve_or_create(current, cursor.index, case, testcase, |ts| {
            Node::new_memory_access(ts, instruction, is_write)
        });

        let node = resolved_node_mut(current, &resolved);
        match &mut node.payload {
            NodePayload::MemoryAccess { targets, .. } => {
                match targets.iter_mut().find(|(addr, _)| *addr == target) {
                    Some((_, set)) => set.add(testcase),
                    None => targets.push((target, TestcaseSet::singleton(testcase))),
                }
            }
            _ => unreachable!("ingest_memory_access always resolves to a MemoryAccess node"),
        }

        let (path, index) = resume_point(resolved, &cursor.path);
        cursor.path = path;
        cursor.index = index;
    }
}
