//! Black-box end-to-end scenarios exercised only through the public API
//! (`AnalysisContext`, `add_trace`, the attribution walk, and the
//! renderers): small `#[cfg(test)]` unit tests live per module, and this
//! suite covers multi-module behavior instead.

use pretty_assertions::assert_eq;

use sidetrace::address::NullResolver;
use sidetrace::attribution::{attribute, FindingKind, TestcaseIdTreeNode};
use sidetrace::calltree::NodePayload;
use sidetrace::merge::AnalysisContext;
use sidetrace::record::{BranchKind, ImageFileInfo, TraceRecord};
use sidetrace::render_reports_to_strings;
use sidetrace::testcase_set::TestcaseSet;

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

    let root_children = ctx.root.children().unwrap();
    assert_eq!(root_children.successors.len(), 1);
    assert!(matches!(root_children.successors[0].payload, NodePayload::Call { .. }));
    assert!(root_children.split_successors.is_empty());

    let stack_tree = attribute(&ctx.root);
    assert!(stack_tree.nodes.values().all(|n| n.instruction_data.is_empty()));

    let (_, call_stacks) = render_reports_to_strings(&mut ctx, true, &resolver);
    // Only the uninteresting root is ever visited; nothing else is printed.
    assert_eq!(call_stacks.trim(), "");
}

#[test]
fn secret_dependent_branch_is_found() {
    let mut ctx = AnalysisContext::new();
    let resolver = NullResolver;

    ctx.add_trace(0, &images(), vec![call(10, 20), jump(21, 25), ret(25, 11)], &resolver)
        .unwrap();
    ctx.add_trace(1, &images(), vec![call(10, 20), jump(21, 30), ret(30, 11)], &resolver)
        .unwrap();

    let call_stack_id = match &ctx.root.children().unwrap().successors[0].payload {
        NodePayload::Call { call_stack_id, .. } => *call_stack_id,
        _ => panic!("expected a Call node"),
    };

    let tree = attribute(&ctx.root);
    let inner = tree.get(call_stack_id).unwrap();
    assert!(inner.interesting);

    let instruction = sidetrace::record::InstructionRef { image_id: 1, offset: 21 };
    let data = inner.instruction_data.get(&instruction).unwrap();
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
fn secret_dependent_memory_access_is_found() {
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
    let instruction = sidetrace::record::InstructionRef { image_id: 1, offset: 42 };
    let data = tree.get(0).unwrap().instruction_data.get(&instruction).unwrap();
    assert_eq!(data.kind, FindingKind::MemoryAccess);
    assert_eq!(data.partition_roots.len(), 1);
    let root = &data.partition_roots[0];
    assert_eq!(root.testcases.iter().collect::<Vec<_>>(), vec![0, 1]);
    assert_eq!(root.children.len(), 2);
}

#[test]
fn nested_call_divergence_attaches_to_the_inner_frame() {
    let mut ctx = AnalysisContext::new();
    let resolver = NullResolver;

    // main -> f -> g, with the divergence inside g.
    ctx.add_trace(
        0,
        &images(),
        vec![
            call(1, 100),  // main -> f
            call(101, 200), // f -> g
            jump(201, 210),
            ret(211, 102), // g -> f
            ret(103, 2),   // f -> main
        ],
        &resolver,
    )
    .unwrap();
    ctx.add_trace(
        1,
        &images(),
        vec![
            call(1, 100),
            call(101, 200),
            jump(201, 220),
            ret(221, 102),
            ret(103, 2),
        ],
        &resolver,
    )
    .unwrap();

    let f_node = &ctx.root.children().unwrap().successors[0];
    let f_csid = match f_node.payload {
        NodePayload::Call { call_stack_id, .. } => call_stack_id,
        _ => panic!("expected main -> f Call node"),
    };
    let g_node = &f_node.children().unwrap().successors[0];
    let g_csid = match g_node.payload {
        NodePayload::Call { call_stack_id, .. } => call_stack_id,
        _ => panic!("expected f -> g Call node"),
    };
    assert_ne!(f_csid, g_csid);

    let tree = attribute(&ctx.root);

    // The finding is attached to g's call-stack context, not f's.
    let instruction = sidetrace::record::InstructionRef { image_id: 1, offset: 201 };
    assert!(tree.get(f_csid).unwrap().instruction_data.get(&instruction).is_none());
    assert!(tree.get(g_csid).unwrap().instruction_data.contains_key(&instruction));

    // Both csids on the path are marked interesting.
    assert!(tree.get(f_csid).unwrap().interesting);
    assert!(tree.get(g_csid).unwrap().interesting);
}

#[test]
fn allocation_size_divergence_mints_distinct_shared_ids() {
    let mut ctx = AnalysisContext::new();
    let resolver = NullResolver;

    ctx.add_trace(
        0,
        &images(),
        vec![
            TraceRecord::HeapAllocation { id: 1, size: 16 },
            TraceRecord::HeapMemoryAccess {
                is_write: false,
                instruction_image_id: 1,
                instruction_offset: 5,
                heap_alloc_id: 1,
                memory_offset: 0,
            },
        ],
        &resolver,
    )
    .unwrap();
    ctx.add_trace(
        1,
        &images(),
        vec![
            TraceRecord::HeapAllocation { id: 1, size: 32 },
            TraceRecord::HeapMemoryAccess {
                is_write: false,
                instruction_image_id: 1,
                instruction_offset: 5,
                heap_alloc_id: 1,
                memory_offset: 0,
            },
        ],
        &resolver,
    )
    .unwrap();

    let root_children = ctx.root.children().unwrap();
    assert_eq!(root_children.split_successors.len(), 2);

    let mut shared_ids = Vec::new();
    for split in &root_children.split_successors {
        let alloc = &split.children().unwrap().successors[0];
        match alloc.payload {
            NodePayload::Allocation {
                shared_allocation_id,
                ..
            } => shared_ids.push(shared_allocation_id),
            _ => panic!("expected an Allocation node"),
        }
        // The subsequent memory access under each split reuses that split's
        // shared allocation id in its target address.
        let access = &split.children().unwrap().successors[1];
        match &access.payload {
            NodePayload::MemoryAccess { targets, .. } => assert_eq!(targets.len(), 1),
            _ => panic!("expected a MemoryAccess node"),
        }
    }
    shared_ids.sort_unstable();
    assert_eq!(shared_ids, vec![2, 3]);
}

#[test]
fn malformed_return_warns_and_does_not_crash() {
    let mut ctx = AnalysisContext::new();
    let resolver = NullResolver;

    ctx.add_trace(0, &images(), vec![ret(1, 2)], &resolver).unwrap();

    assert_eq!(ctx.stats.empty_return_stacks, 1);
    // Execution continued from the root without panicking; a second, normal
    // trace still merges cleanly afterward.
    ctx.add_trace(1, &images(), vec![call(10, 20), ret(21, 11)], &resolver)
        .unwrap();
    assert_eq!(ctx.root.children().unwrap().successors.len(), 1);
}
