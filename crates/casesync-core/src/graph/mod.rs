//! Dependency graph primitives over the child and extension index trees.
//!
//! Every traversal keeps a visited set, so self-references and cycles
//! terminate.

mod index_tree;
mod prune;

pub use index_tree::IndexTree;
pub(crate) use prune::prune;

use std::collections::BTreeSet;

use crate::models::CaseId;

/// Every case reachable from `seed` over outgoing child and extension edges.
///
/// The seed itself is part of the result.
pub fn closure_forward(
    seed: &BTreeSet<CaseId>,
    child_tree: &IndexTree,
    extension_tree: &IndexTree,
) -> BTreeSet<CaseId> {
    let mut reached = seed.clone();
    let mut pending: Vec<CaseId> = seed.iter().cloned().collect();
    while let Some(case_id) = pending.pop() {
        for target in child_tree
            .outgoing(&case_id)
            .chain(extension_tree.outgoing(&case_id))
        {
            if reached.insert(target.clone()) {
                pending.push(target.clone());
            }
        }
    }
    reached
}

/// Cases that transitively reference `case_id` through child edges.
///
/// `case_id` is only part of the result when it sits on a child cycle.
/// Pruning classifies through [`get_all_dependencies`] instead; this is the
/// narrower query for callers asking whether a parent is still needed.
pub fn who_depends_on(case_id: &CaseId, child_tree: &IndexTree) -> BTreeSet<CaseId> {
    let reverse = child_tree.reverse_indices();
    let mut dependents = BTreeSet::new();
    let mut pending = vec![case_id.clone()];
    while let Some(current) = pending.pop() {
        let Some(children) = reverse.get(&current) else {
            continue;
        };
        for child in children {
            if dependents.insert(child.clone()) {
                pending.push(child.clone());
            }
        }
    }
    dependents
}

/// Cases whose presence on a device is tied to `case_id`.
///
/// Follows incoming child edges, incoming extension edges and outgoing
/// extension edges. Outgoing child edges are not followed: a parent does
/// not keep its children.
pub fn get_all_dependencies(
    case_id: &CaseId,
    child_tree: &IndexTree,
    extension_tree: &IndexTree,
) -> BTreeSet<CaseId> {
    let child_reverse = child_tree.reverse_indices();
    let extension_reverse = extension_tree.reverse_indices();

    let mut all = BTreeSet::from([case_id.clone()]);
    let mut pending = vec![case_id.clone()];
    while let Some(current) = pending.pop() {
        let incoming = child_reverse
            .get(&current)
            .into_iter()
            .chain(extension_reverse.get(&current))
            .flatten();
        for related in incoming.chain(extension_tree.outgoing(&current)) {
            if all.insert(related.clone()) {
                pending.push(related.clone());
            }
        }
    }
    all
}

/// `case_id` plus every open extension hanging off it, transitively
pub fn traverse_incoming_extensions(
    case_id: &CaseId,
    extension_tree: &IndexTree,
    closed: &BTreeSet<CaseId>,
) -> BTreeSet<CaseId> {
    let reverse = extension_tree.reverse_indices();
    let mut all = BTreeSet::from([case_id.clone()]);
    let mut pending = vec![case_id.clone()];
    while let Some(current) = pending.pop() {
        let Some(extensions) = reverse.get(&current) else {
            continue;
        };
        for extension in extensions {
            if !closed.contains(extension) && all.insert(extension.clone()) {
                pending.push(extension.clone());
            }
        }
    }
    all
}
