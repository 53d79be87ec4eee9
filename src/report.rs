//! Report rendering: the call-tree dump and the call-stack leakage
//! report. Both take any `Write` sink -- no filesystem access lives in
//! this module, only formatting.

use std::collections::HashMap;
use std::io::{self, Write};

use crate::address::{AddressFormatter, SymbolResolver};
use crate::attribution::{CallStackNode, CallStackTree, FindingKind, TestcaseIdTreeNode};
use crate::calltree::{Node, NodePayload};
use crate::record::InstructionRef;
use crate::testcase_set::TestcaseSet;

/// Ascending test-case IDs, run-length compressed: runs of length >= 3
/// collapse to `a-b`; shorter runs print individually. Space separated,
/// no trailing space.
pub fn format_testcase_ids(set: &TestcaseSet) -> String {
    let ids: Vec<u32> = set.iter().collect();
    let mut parts = Vec::new();
    let mut i = 0;
    while i < ids.len() {
        let start = ids[i];
        let mut end = start;
        let mut j = i + 1;
        while j < ids.len() && ids[j] == end + 1 {
            end = ids[j];
            j += 1;
        }
        if j - i >= 3 {
            parts.push(format!("{}-{}", start, end));
        } else {
            parts.extend(ids[i..j].iter().map(u32::to_string));
        }
        i = j;
    }
    parts.join(" ")
}

fn instruction_label(
    formatter: &mut AddressFormatter,
    resolver: &dyn SymbolResolver,
    instruction: InstructionRef,
) -> String {
    let id = formatter.intern_image(resolver, instruction.image_id, instruction.offset);
    formatter.format(id).to_string()
}

/// Preorder pretty-print of the merged call tree, 4-space indent per
/// depth. `include_memory` gates the `#memory`/`#heapalloc`/
/// `#stackalloc` lines (the config's `include-memory-accesses-in-dump`).
pub fn render_call_tree(
    out: &mut dyn Write,
    root: &Node,
    formatter: &mut AddressFormatter,
    resolver: &dyn SymbolResolver,
    include_memory: bool,
) -> io::Result<()> {
    render_node(out, root, formatter, resolver, include_memory, 0)
}

fn indent(out: &mut dyn Write, depth: usize) -> io::Result<()> {
    for _ in 0..depth {
        write!(out, "    ")?;
    }
    Ok(())
}

fn render_node(
    out: &mut dyn Write,
    node: &Node,
    formatter: &mut AddressFormatter,
    resolver: &dyn SymbolResolver,
    include_memory: bool,
    depth: usize,
) -> io::Result<()> {
    indent(out, depth)?;
    match &node.payload {
        NodePayload::Root => writeln!(out, "@root")?,
        NodePayload::Split => writeln!(out, "@split")?,
        NodePayload::Call {
            source,
            target,
            call_stack_id,
        } => {
            let src = instruction_label(formatter, resolver, *source);
            let tgt = instruction_label(formatter, resolver, *target);
            writeln!(out, "#call {} -> {} (${})", src, tgt, call_stack_id)?;
        }
        NodePayload::Branch { source, target, taken } => {
            let src = instruction_label(formatter, resolver, *source);
            if *taken {
                let tgt = instruction_label(formatter, resolver, *target);
                writeln!(out, "#branch {} -> {}", src, tgt)?;
            } else {
                writeln!(out, "#branch {} -> <?> (not taken)", src)?;
            }
        }
        NodePayload::Return { source, target } => {
            let src = instruction_label(formatter, resolver, *source);
            let tgt = instruction_label(formatter, resolver, *target);
            writeln!(out, "#return {} -> {}", src, tgt)?;
        }
        NodePayload::Allocation {
            shared_allocation_id,
            size,
            is_heap,
        } => {
            if !include_memory {
                return Ok(());
            }
            if *is_heap {
                writeln!(out, "#heapalloc H#{}, {} bytes", shared_allocation_id, size)?;
            } else {
                writeln!(out, "#stackalloc S#{}, {} bytes", shared_allocation_id, size)?;
            }
        }
        NodePayload::MemoryAccess {
            instruction,
            is_write,
            targets,
        } => {
            if !include_memory {
                return Ok(());
            }
            let src = instruction_label(formatter, resolver, *instruction);
            let verb = if *is_write { "writes" } else { "reads" };
            writeln!(out, "#memory {} {}", src, verb)?;
            for (addr, testcases) in targets {
                indent(out, depth + 1)?;
                writeln!(
                    out,
                    "{} : {} ({} total)",
                    formatter.format(*addr),
                    format_testcase_ids(testcases),
                    testcases.count()
                )?;
            }
        }
    }

    if let Some(children) = node.children() {
        for successor in &children.successors {
            render_node(out, successor, formatter, resolver, include_memory, depth + 1)?;
        }
        for split in &children.split_successors {
            render_node(out, split, formatter, resolver, include_memory, depth + 1)?;
        }
    }
    Ok(())
}

fn finding_kind_label(kind: FindingKind) -> &'static str {
    match kind {
        FindingKind::Call => "call",
        FindingKind::Return => "return",
        FindingKind::Jump => "jump",
        FindingKind::MemoryAccess => "memory access",
    }
}

fn render_partition_children(
    out: &mut dyn Write,
    children: &[TestcaseIdTreeNode],
    prefix: &str,
) -> io::Result<()> {
    for (i, child) in children.iter().enumerate() {
        let is_last = i + 1 == children.len();
        let connector = if is_last { "└── " } else { "├── " };
        let tag = if child.is_dummy { " [M]" } else { "" };
        writeln!(
            out,
            "{}{}{}{}",
            prefix,
            connector,
            format_testcase_ids(&child.testcases),
            tag
        )?;
        let child_prefix = format!("{}{}", prefix, if is_last { "    " } else { "│   " });
        render_partition_children(out, &child.children, &child_prefix)?;
    }
    Ok(())
}

fn render_partition_tree(out: &mut dyn Write, root: &TestcaseIdTreeNode, prefix: &str) -> io::Result<()> {
    writeln!(out, "{}", format_testcase_ids(&root.testcases))?;
    render_partition_children(out, &root.children, prefix)
}

/// DFS over the call-stack tree, 2-space indent per depth, pruning
/// subtrees that were never marked interesting.
pub fn render_call_stack_report(
    out: &mut dyn Write,
    tree: &CallStackTree,
    formatter: &mut AddressFormatter,
    resolver: &dyn SymbolResolver,
) -> io::Result<()> {
    render_call_stack_node(out, tree, tree.root_id, formatter, resolver, 0)
}

fn render_call_stack_node(
    out: &mut dyn Write,
    tree: &CallStackTree,
    id: u64,
    formatter: &mut AddressFormatter,
    resolver: &dyn SymbolResolver,
    depth: usize,
) -> io::Result<()> {
    let node: &CallStackNode = match tree.get(id) {
        Some(node) => node,
        None => return Ok(()),
    };
    if !node.interesting {
        return Ok(());
    }

    let margin = "  ".repeat(depth);
    match (node.source, node.target) {
        (Some(source), Some(target)) => {
            let src = instruction_label(formatter, resolver, source);
            let tgt = instruction_label(formatter, resolver, target);
            writeln!(out, "{}{} -> {} (${})", margin, src, tgt, id)?;
        }
        _ => writeln!(out, "{}(root) (${})", margin, id)?,
    }

    let mut instructions: Vec<&InstructionRef> = node.instruction_data.keys().collect();
    instructions.sort_by_key(|i| (i.image_id, i.offset));

    for instruction in instructions {
        let data = &node.instruction_data[instruction];
        let label = instruction_label(formatter, resolver, *instruction);
        writeln!(
            out,
            "{}  [L] {} ({})",
            margin,
            label,
            finding_kind_label(data.kind)
        )?;
        writeln!(out, "{}  - Number of calls: {}", margin, data.partition_roots.len())?;
        let partition_prefix = format!("{}  ", margin);
        for partition_root in &data.partition_roots {
            write!(out, "{}", partition_prefix)?;
            render_partition_tree(out, partition_root, &partition_prefix)?;
        }
    }

    for child in &node.children {
        render_call_stack_node(out, tree, *child, formatter, resolver, depth + 1)?;
    }
    Ok(())
}
