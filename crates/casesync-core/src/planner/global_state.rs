//! Running state shared by every batch of one planning run

use std::collections::{BTreeMap, BTreeSet};

use crate::models::{Case, CaseId, CaseSyncUpdate};

/// Cases seen so far in a planning run, deduplicated across owners and batches.
///
/// Cloned before each owner is processed so a failing owner can be rolled
/// back without touching what other owners contributed.
#[derive(Debug, Clone, Default)]
pub struct GlobalSyncState {
    /// Every case that ends up in the next log or must be pruned from it
    relevant: BTreeMap<CaseId, Case>,
    /// Relevant cases with a current reason to be on the device
    justified: BTreeSet<CaseId>,
    /// Cases an update was already emitted for
    synced: BTreeSet<CaseId>,
    /// Held cases the store no longer has, or has deleted
    removed: BTreeSet<CaseId>,
    updates: Vec<CaseSyncUpdate>,
}

impl GlobalSyncState {
    pub fn is_relevant(&self, case_id: &CaseId) -> bool {
        self.relevant.contains_key(case_id)
    }

    pub fn is_justified(&self, case_id: &CaseId) -> bool {
        self.justified.contains(case_id)
    }

    pub fn is_removed(&self, case_id: &CaseId) -> bool {
        self.removed.contains(case_id)
    }

    pub fn is_synced(&self, case_id: &CaseId) -> bool {
        self.synced.contains(case_id)
    }

    /// Record `case` as relevant. Returns whether it became justified just now.
    pub fn record(&mut self, case: &Case, justified: bool) -> bool {
        self.relevant.insert(case.case_id.clone(), case.clone());
        justified && self.justified.insert(case.case_id.clone())
    }

    pub fn mark_removed(&mut self, case_id: CaseId) {
        self.removed.insert(case_id);
    }

    /// Queue `update` unless its case was already sent this run
    pub fn emit(&mut self, update: CaseSyncUpdate) {
        if self.synced.insert(update.case.case_id.clone()) {
            self.updates.push(update);
        }
    }

    pub fn relevant_cases(&self) -> impl Iterator<Item = &Case> {
        self.relevant.values()
    }

    /// Relevant cases nothing justifies any more
    pub fn stale_ids(&self) -> impl Iterator<Item = &CaseId> {
        self.relevant
            .keys()
            .filter(|case_id| !self.justified.contains(*case_id))
    }

    pub fn removed_ids(&self) -> impl Iterator<Item = &CaseId> {
        self.removed.iter()
    }

    pub fn justified_count(&self) -> usize {
        self.justified.len()
    }

    pub fn into_updates(self) -> Vec<CaseSyncUpdate> {
        self.updates
    }
}
