//! Merges per-test-case execution traces into a shared call tree and
//! attributes microarchitectural side-channel leakage to the instructions
//! where traces diverge.
//!
//! The crate is organized as a handful of leaf modules, each owning one
//! concern:
//!
//! - [`testcase_set`] -- the compact bit-set of test-case IDs.
//! - [`address`] -- tagged address identifiers and the symbol interner.
//! - [`record`] -- the trace record stream consumed from outside the crate.
//! - [`calltree`] -- the merged-tree node model.
//! - [`split`] -- the split operation.
//! - [`merge`] -- the online trace ingestion engine (`AnalysisContext`).
//! - [`attribution`] -- the post-ingestion leakage attribution walk.
//! - [`report`] -- the two rendered report formats.
//! - [`config`] -- the configuration consumed by callers of this crate.
//! - [`hash`] -- the one non-cryptographic hash shared by the digest and
//!   the call-stack rolling hash.
//! - [`error`] -- the crate-wide error type.

pub mod address;
pub mod attribution;
pub mod calltree;
pub mod config;
pub mod error;
pub mod hash;
pub mod merge;
pub mod record;
pub mod report;
pub mod split;
pub mod testcase_set;

use std::fs::{self, File};

pub use address::{AddressFormatter, SymbolResolver, TaggedAddressId};
pub use attribution::{attribute, CallStackNode, CallStackTree};
pub use calltree::Node;
pub use config::AnalysisConfig;
pub use error::{Error, Result};
pub use merge::{AnalysisContext, AnalysisStats};
pub use record::{BranchKind, ImageFileInfo, TraceRecord};
pub use testcase_set::{TestcaseId, TestcaseSet};

/// Runs the leakage attribution walk over `context`'s merged tree and writes
/// `call-stacks.txt` (always) and, if `config.dump_call_tree` is set,
/// `call-tree-dump.txt`, under `config.output_directory`.
///
/// This is the thin driver the core exposes to callers; it owns no state of
/// its own beyond what it needs to open the two output files, keeping
/// file-writing plumbing separate from the ingestion and attribution logic
/// it serves.
pub fn write_reports(
    context: &mut AnalysisContext,
    config: &AnalysisConfig,
    resolver: &dyn SymbolResolver,
) -> Result<()> {
    config.validate()?;
    fs::create_dir_all(&config.output_directory)?;

    if config.dump_call_tree {
        let path = config.output_directory.join("call-tree-dump.txt");
        let mut file = File::create(path)?;
        report::render_call_tree(
            &mut file,
            &context.root,
            &mut context.formatter,
            resolver,
            config.include_memory_accesses_in_dump,
        )?;
    }

    let tree = attribute(&context.root);
    let path = config.output_directory.join("call-stacks.txt");
    let mut file = File::create(path)?;
    report::render_call_stack_report(&mut file, &tree, &mut context.formatter, resolver)?;

    Ok(())
}

/// Convenience wrapper used by tests and small drivers that only want the
/// rendered text, without touching the filesystem.
pub fn render_reports_to_strings(
    context: &mut AnalysisContext,
    include_memory_accesses_in_dump: bool,
    resolver: &dyn SymbolResolver,
) -> (String, String) {
    let mut tree_dump = Vec::new();
    report::render_call_tree(
        &mut tree_dump,
        &context.root,
        &mut context.formatter,
        resolver,
        include_memory_accesses_in_dump,
    )
    .expect("writing to a Vec<u8> never fails");

    let call_stack_tree = attribute(&context.root);
    let mut call_stacks = Vec::new();
    report::render_call_stack_report(&mut call_stacks, &call_stack_tree, &mut context.formatter, resolver)
        .expect("writing to a Vec<u8> never fails");

    (
        String::from_utf8(tree_dump).expect("report output is always valid UTF-8"),
        String::from_utf8(call_stacks).expect("report output is always valid UTF-8"),
    )
}
