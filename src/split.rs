//! The split operation: the protocol that divides a linear successor list
//! into two alternative branches when a new trace conflicts with the
//! accumulated tree, while preserving per-test-case membership.

use crate::calltree::Node;
use crate::testcase_set::{TestcaseId, TestcaseSet};

/// Splits `parent` at `index`: the linear successors from `index` onward
/// are displaced into a new split child `A` alongside the parent's old
/// split successors, and a fresh split child `B` is created to carry
/// `new_successor` for `testcase` alone.
///
/// Returns the index of `B` within `parent`'s `split_successors`, so the
/// caller can descend into it.
///
/// `new_successor`'s own test-case set must already contain `testcase` --
/// it represents the path that test case just took.
pub fn split_at(
    parent: &mut Node,
    index: usize,
    testcase: TestcaseId,
    new_successor: Node,
) -> usize {
    let parent_testcases = parent.testcases.clone();
    let children = parent
        .children_mut()
        .expect("split_at requires a split-like node");

    let displaced = children.successors.split_off(index);
    let old_split_successors = std::mem::take(&mut children.split_successors);

    let mut a_testcases = parent_testcases;
    a_testcases.remove(testcase);
    let mut a = Node::new_split(a_testcases);
    {
        let a_children = a.children_mut().unwrap();
        a_children.successors = displaced;
        a_children.split_successors = old_split_successors;
    }

    let mut b = Node::new_split(TestcaseSet::singleton(testcase));
    b.children_mut().unwrap().successors.push(new_successor);

    children.split_successors.push(a);
    children.split_successors.push(b);
    children.split_successors.len() - 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::InstructionRef;

    fn instr(offset: u32) -> InstructionRef {
        InstructionRef { image_id: 1, offset }
    }

    #[test]
    fn split_preserves_tail_and_membership() {
        let both: TestcaseSet = [0, 1].iter().copied().collect();
        let mut parent = Node::new_split(both.clone());
        let tail = Node::new_branch(both, instr(1), instr(2), true);
        parent.children_mut().unwrap().successors.push(tail);

        let new_leaf = Node::new_branch(TestcaseSet::singleton(1), instr(1), instr(3), true);
        let b_index = split_at(&mut parent, 0, 1, new_leaf);

        let children = parent.children().unwrap();
        assert!(children.successors.is_empty());
        assert_eq!(children.split_successors.len(), 2);

        let a = &children.split_successors[1 - b_index];
        assert_eq!(a.testcases.iter().collect::<Vec<_>>(), vec![0]);
        assert_eq!(a.children().unwrap().successors.len(), 1);

        let b = &children.split_successors[b_index];
        assert_eq!(b.testcases.iter().collect::<Vec<_>>(), vec![1]);
        assert_eq!(b.children().unwrap().successors.len(), 1);
    }
}
