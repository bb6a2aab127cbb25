//! Reference-counted removal of cases from a sync log.
//!
//! Pruning a case demotes it to dependent, then classifies the cases tied
//! to it in three passes:
//!
//! * *relevant*: reachable over incoming child, incoming extension and
//!   outgoing extension edges;
//! * *available*: relevant, open, and either not an extension or also a
//!   child, plus open extensions of available cases;
//! * *live*: available primary cases, everything they point at, and their
//!   open extensions.
//!
//! Relevant cases that are not live are removed, and parents that were only
//! kept for a removed child get pruned in turn.

use std::collections::BTreeSet;

use super::{get_all_dependencies, traverse_incoming_extensions};
use crate::models::CaseId;
use crate::sync_log::SyncLog;

/// Prune `case_id` from `log`
pub(crate) fn prune(log: &mut SyncLog, case_id: &CaseId) {
    let mut purged = BTreeSet::new();
    prune_with(log, case_id, &mut purged);
}

fn prune_with(log: &mut SyncLog, case_id: &CaseId, purged: &mut BTreeSet<CaseId>) {
    tracing::debug!(case_id = %case_id, "Pruning case");
    log.demote_to_dependent(case_id);

    let relevant = get_all_dependencies(
        case_id,
        &log.child_index_tree,
        &log.extension_index_tree,
    );
    let available = available_cases(log, &relevant, purged);
    let live = live_cases(log, &available, purged);

    let to_remove: BTreeSet<CaseId> = relevant
        .into_iter()
        .filter(|candidate| !purged.contains(candidate) && !live.contains(candidate))
        .collect();
    tracing::debug!(
        case_id = %case_id,
        live = live.len(),
        removing = to_remove.len(),
        "Pruning classified dependencies"
    );

    remove_cases(log, &to_remove, case_id, purged);
}

fn available_cases(
    log: &SyncLog,
    relevant: &BTreeSet<CaseId>,
    purged: &BTreeSet<CaseId>,
) -> BTreeSet<CaseId> {
    let mut available: BTreeSet<CaseId> = relevant
        .iter()
        .filter(|case_id| {
            !log.closed_case_ids.contains(*case_id)
                && (!log.extension_index_tree.has_outgoing(case_id)
                    || log.child_index_tree.has_outgoing(case_id))
        })
        .cloned()
        .collect();

    let incoming_extensions = log.extension_index_tree.reverse_indices();
    let mut pending: Vec<CaseId> = available.iter().cloned().collect();
    while let Some(current) = pending.pop() {
        let Some(extensions) = incoming_extensions.get(&current) else {
            continue;
        };
        for extension in extensions {
            let closed = log.closed_case_ids.contains(extension);
            if !closed && !purged.contains(extension) && available.insert(extension.clone()) {
                pending.push(extension.clone());
            }
        }
    }
    available
}

fn live_cases(
    log: &SyncLog,
    available: &BTreeSet<CaseId>,
    purged: &BTreeSet<CaseId>,
) -> BTreeSet<CaseId> {
    let mut live: BTreeSet<CaseId> = available
        .iter()
        .filter(|case_id| log.case_ids_on_phone.contains_key(*case_id))
        .cloned()
        .collect();

    let mut pending: Vec<CaseId> = live.iter().cloned().collect();
    let mut checked = BTreeSet::new();
    while let Some(current) = pending.pop() {
        if !checked.insert(current.clone()) {
            continue;
        }
        let outgoing = super::closure_forward(
            &BTreeSet::from([current.clone()]),
            &log.child_index_tree,
            &log.extension_index_tree,
        );
        let extensions =
            traverse_incoming_extensions(&current, &log.extension_index_tree, &log.closed_case_ids);
        for reached in outgoing.into_iter().chain(extensions) {
            if purged.contains(&reached) || checked.contains(&reached) {
                continue;
            }
            live.insert(reached.clone());
            pending.push(reached);
        }
    }
    live
}

fn remove_cases(
    log: &mut SyncLog,
    to_remove: &BTreeSet<CaseId>,
    checked_case_id: &CaseId,
    purged: &mut BTreeSet<CaseId>,
) {
    for case_id in to_remove {
        let parents: Vec<CaseId> = log.child_index_tree.outgoing(case_id).cloned().collect();

        if log.remove_case(case_id) {
            tracing::debug!(case_id = %case_id, "Removed case from sync log");
            purged.insert(case_id.clone());
        }

        for parent in parents {
            let is_dependent = log.dependent_case_ids_on_phone.contains_key(&parent);
            if is_dependent && !to_remove.contains(&parent) && &parent != checked_case_id {
                prune_with(log, &parent, purged);
            }
        }
    }
}
