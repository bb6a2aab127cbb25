//! Per-device sync log: what a device is known to hold after a sync.
//!
//! A log is immutable once a newer log points at it. New logs are derived
//! with [`SyncLog::next`] and then changed through mutations, pruning and
//! planning.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::db::SyncLogRepository;
use crate::error::{Error, Result};
use crate::graph::{self, IndexTree};
use crate::models::{
    CaseAction, CaseId, CaseIndex, CaseMutation, CaseState, Relationship, SyncLogId,
};

/// Dangling edges listed in an invariant error before truncating
const MAX_REPORTED_VIOLATIONS: usize = 10;

/// Persisted record of the cases a device holds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: SyncLogId,
    pub domain: String,
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    /// When the sync that produced this log ran (Unix ms)
    pub date: i64,
    #[serde(default)]
    pub previous_log_id: Option<SyncLogId>,
    #[serde(default)]
    pub owner_ids_on_phone: BTreeSet<String>,
    /// Primary cases, held because a current owner owns them
    #[serde(default)]
    pub case_ids_on_phone: BTreeMap<CaseId, CaseState>,
    /// Cases held only because something on the device needs them
    #[serde(default)]
    pub dependent_case_ids_on_phone: BTreeMap<CaseId, CaseState>,
    #[serde(default)]
    pub child_index_tree: IndexTree,
    #[serde(default)]
    pub extension_index_tree: IndexTree,
    #[serde(default)]
    pub closed_case_ids: BTreeSet<CaseId>,
    /// Set when the log failed reconciliation; the next sync rebuilds from scratch
    #[serde(default)]
    pub had_state_error: bool,
}

impl SyncLog {
    /// Create an empty log for a user
    pub fn new(domain: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            id: SyncLogId::new(),
            domain: domain.into(),
            user_id: user_id.into(),
            device_id: None,
            date: crate::util::unix_timestamp_millis_now(),
            previous_log_id: None,
            owner_ids_on_phone: BTreeSet::new(),
            case_ids_on_phone: BTreeMap::new(),
            dependent_case_ids_on_phone: BTreeMap::new(),
            child_index_tree: IndexTree::new(),
            extension_index_tree: IndexTree::new(),
            closed_case_ids: BTreeSet::new(),
            had_state_error: false,
        }
    }

    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    #[must_use]
    pub fn with_owners<I, S>(mut self, owner_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.owner_ids_on_phone = owner_ids.into_iter().map(Into::into).collect();
        self
    }

    /// Derive the successor of this log, carrying its state forward
    #[must_use]
    pub fn next(&self) -> Self {
        Self {
            id: SyncLogId::new(),
            date: crate::util::unix_timestamp_millis_now(),
            previous_log_id: Some(self.id),
            had_state_error: false,
            ..self.clone()
        }
    }

    /// Load the log this one was derived from
    pub async fn get_previous<R: SyncLogRepository>(&self, repo: &R) -> Result<Option<Self>> {
        match self.previous_log_id {
            Some(previous_id) => repo.get(&previous_id).await,
            None => Ok(None),
        }
    }

    /// Whether the device holds `case_id`, as primary or dependent
    pub fn phone_holds(&self, case_id: &CaseId) -> bool {
        self.case_ids_on_phone.contains_key(case_id)
            || self.dependent_case_ids_on_phone.contains_key(case_id)
    }

    pub fn is_primary(&self, case_id: &CaseId) -> bool {
        self.case_ids_on_phone.contains_key(case_id)
    }

    pub fn is_dependent(&self, case_id: &CaseId) -> bool {
        self.dependent_case_ids_on_phone.contains_key(case_id)
    }

    /// Number of cases held, primary and dependent
    pub fn case_count(&self) -> usize {
        self.case_ids_on_phone.len() + self.dependent_case_ids_on_phone.len()
    }

    /// Every held case id
    pub fn held_case_ids(&self) -> BTreeSet<CaseId> {
        self.case_ids_on_phone
            .keys()
            .chain(self.dependent_case_ids_on_phone.keys())
            .cloned()
            .collect()
    }

    pub fn case_state(&self, case_id: &CaseId) -> Option<&CaseState> {
        self.case_ids_on_phone
            .get(case_id)
            .or_else(|| self.dependent_case_ids_on_phone.get(case_id))
    }

    /// Hold `state` as primary, promoting it if it was dependent
    pub fn add_primary(&mut self, state: CaseState) {
        self.dependent_case_ids_on_phone.remove(&state.case_id);
        self.case_ids_on_phone.insert(state.case_id.clone(), state);
    }

    /// Hold `state` as dependent unless it is already primary
    pub fn add_dependent(&mut self, state: CaseState) {
        if let Some(existing) = self.case_ids_on_phone.get_mut(&state.case_id) {
            *existing = state;
            return;
        }
        self.dependent_case_ids_on_phone
            .insert(state.case_id.clone(), state);
    }

    /// Move a held primary case to the dependent set
    pub fn demote_to_dependent(&mut self, case_id: &CaseId) {
        if let Some(state) = self.case_ids_on_phone.remove(case_id) {
            self.dependent_case_ids_on_phone
                .insert(case_id.clone(), state);
        }
    }

    /// Drop a case from both case sets and both trees.
    ///
    /// Returns whether the case was held.
    pub fn remove_case(&mut self, case_id: &CaseId) -> bool {
        self.child_index_tree.remove_case(case_id);
        self.extension_index_tree.remove_case(case_id);
        let was_primary = self.case_ids_on_phone.remove(case_id).is_some();
        let was_dependent = self.dependent_case_ids_on_phone.remove(case_id).is_some();
        was_primary || was_dependent
    }

    /// Remove a case and everything that was only held because of it
    pub fn prune(&mut self, case_id: &CaseId) {
        graph::prune(self, case_id);
    }

    /// Try to prune every dependent case once, dropping orphans
    pub fn purge_dependent_cases(&mut self) {
        let dependents: Vec<CaseId> = self.dependent_case_ids_on_phone.keys().cloned().collect();
        for case_id in dependents {
            // an earlier prune may already have removed it
            if self.is_dependent(&case_id) {
                self.prune(&case_id);
            }
        }
    }

    /// Apply the mutations of one form submission.
    ///
    /// The whole batch is validated before anything changes, so a rejected
    /// batch leaves the log untouched.
    pub fn apply_mutations(&mut self, mutations: &[CaseMutation]) -> Result<()> {
        let updates = self.collect_updates(mutations)?;
        tracing::debug!(
            log_id = %self.id,
            cases = updates.len(),
            "Applying case mutations to sync log"
        );

        let mut non_live = Vec::new();
        let mut cleared_targets = Vec::new();
        for update in &updates {
            if update.is_live(&self.owner_ids_on_phone) {
                self.closed_case_ids.remove(&update.case_id);
                if self.is_dependent(&update.case_id) || !self.phone_holds(&update.case_id) {
                    let state = self
                        .take_state(&update.case_id)
                        .unwrap_or_else(|| CaseState::new(update.case_id.clone()));
                    self.add_primary(state);
                }
                self.apply_index_changes(update, &mut cleared_targets);
            } else {
                if update.is_closed {
                    self.closed_case_ids.insert(update.case_id.clone());
                }
                non_live.push(update);
            }
        }

        for update in &non_live {
            if update.has_extension_indices_to_add() {
                if !self.phone_holds(&update.case_id) {
                    self.add_dependent(CaseState::new(update.case_id.clone()));
                }
                for index in &update.indices_to_add {
                    self.add_index(update, index, &mut cleared_targets);
                }
            }
        }

        for update in &non_live {
            if self.phone_holds(&update.case_id) {
                self.prune(&update.case_id);
                if self.phone_holds(&update.case_id) {
                    self.apply_index_changes(update, &mut cleared_targets);
                }
            }
        }

        for target in cleared_targets {
            if self.is_dependent(&target) {
                self.prune(&target);
            }
        }
        Ok(())
    }

    /// Repair overlapping case sets and check for dangling edges.
    ///
    /// A consistent log is left unchanged. A dangling edge marks the log
    /// with `had_state_error` and fails with a graph invariant error.
    pub fn reconcile(&mut self) -> Result<()> {
        let overlapping: Vec<CaseId> = self
            .dependent_case_ids_on_phone
            .keys()
            .filter(|case_id| self.case_ids_on_phone.contains_key(*case_id))
            .cloned()
            .collect();
        for case_id in &overlapping {
            self.dependent_case_ids_on_phone.remove(case_id);
        }
        if !overlapping.is_empty() {
            tracing::warn!(
                log_id = %self.id,
                count = overlapping.len(),
                "Sync log held cases as both primary and dependent; kept them as primary"
            );
        }

        let violations = self.dangling_edges();
        if violations.is_empty() {
            return Ok(());
        }

        self.had_state_error = true;
        let mut detail = violations
            .iter()
            .take(MAX_REPORTED_VIOLATIONS)
            .cloned()
            .collect::<Vec<_>>()
            .join("; ");
        if violations.len() > MAX_REPORTED_VIOLATIONS {
            detail.push_str(&format!(
                "; and {} more",
                violations.len() - MAX_REPORTED_VIOLATIONS
            ));
        }
        tracing::error!(
            log_id = %self.id,
            detail = %detail,
            graph = %self.graph_dump(),
            "Sync log failed reconciliation"
        );
        Err(Error::GraphInvariant {
            log_id: self.id.to_string(),
            detail,
        })
    }

    /// Pretty JSON of both case sets and both trees, for diagnostics
    pub fn graph_dump(&self) -> String {
        let dump = serde_json::json!({
            "id": self.id,
            "case_ids_on_phone": self.case_ids_on_phone.keys().collect::<Vec<_>>(),
            "dependent_case_ids_on_phone": self.dependent_case_ids_on_phone.keys().collect::<Vec<_>>(),
            "closed_case_ids": self.closed_case_ids,
            "child_index_tree": self.child_index_tree,
            "extension_index_tree": self.extension_index_tree,
        });
        serde_json::to_string_pretty(&dump).unwrap_or_else(|_| dump.to_string())
    }

    fn dangling_edges(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for (kind, tree) in [
            (Relationship::Child, &self.child_index_tree),
            (Relationship::Extension, &self.extension_index_tree),
        ] {
            for case_id in tree.case_ids() {
                if !self.phone_holds(case_id) {
                    violations.push(format!("{kind} index owned by unheld case {case_id}"));
                }
            }
            for (from, identifier, to) in tree.edges() {
                if !self.phone_holds(to) {
                    violations.push(format!(
                        "{kind} index {from}.{identifier} points at unheld case {to}"
                    ));
                }
            }
        }
        violations
    }

    fn take_state(&mut self, case_id: &CaseId) -> Option<CaseState> {
        self.dependent_case_ids_on_phone
            .remove(case_id)
            .or_else(|| self.case_ids_on_phone.remove(case_id))
    }

    fn collect_updates(&self, mutations: &[CaseMutation]) -> Result<Vec<PendingUpdate>> {
        let mut updates: Vec<PendingUpdate> = Vec::new();
        let mut positions: BTreeMap<CaseId, usize> = BTreeMap::new();

        for mutation in mutations {
            let position = *positions.entry(mutation.case_id.clone()).or_insert_with(|| {
                updates.push(PendingUpdate::new(
                    mutation.case_id.clone(),
                    self.is_primary(&mutation.case_id),
                ));
                updates.len() - 1
            });
            let update = &mut updates[position];

            match mutation.action {
                CaseAction::Create => {
                    if self.phone_holds(&mutation.case_id) || update.created {
                        return Err(Error::invalid_mutation(
                            mutation.case_id.as_str(),
                            "create of a case the device already holds",
                        ));
                    }
                    update.created = true;
                }
                CaseAction::Update => {
                    if !self.phone_holds(&mutation.case_id) && !update.created {
                        return Err(Error::invalid_mutation(
                            mutation.case_id.as_str(),
                            "update of a case the device does not hold",
                        ));
                    }
                }
                CaseAction::Index => {
                    for change in &mutation.indices {
                        match &change.referenced_id {
                            Some(referenced_id) => update.indices_to_add.push(CaseIndex {
                                identifier: change.identifier.clone(),
                                referenced_id: referenced_id.clone(),
                                relationship: change.relationship,
                            }),
                            None => update.indices_to_delete.push(change.identifier.clone()),
                        }
                    }
                }
                CaseAction::Close => update.is_closed = true,
            }

            if let Some(owner_id) = &mutation.owner_id {
                update.final_owner_id = Some(owner_id.clone());
            }
        }
        Ok(updates)
    }

    fn apply_index_changes(&mut self, update: &PendingUpdate, cleared_targets: &mut Vec<CaseId>) {
        for index in &update.indices_to_add {
            self.add_index(update, index, cleared_targets);
        }
        for identifier in &update.indices_to_delete {
            self.delete_index(&update.case_id, identifier, cleared_targets);
        }
    }

    /// Set one index. A target the identifier pointed at before goes to
    /// `cleared_targets`, the same as a deleted index.
    fn add_index(
        &mut self,
        update: &PendingUpdate,
        index: &CaseIndex,
        cleared_targets: &mut Vec<CaseId>,
    ) {
        tracing::debug!(
            case_id = %update.case_id,
            relationship = %index.relationship,
            referenced_id = %index.referenced_id,
            identifier = %index.identifier,
            "Adding index"
        );
        let (tree, other) = match index.relationship {
            Relationship::Child => (&mut self.child_index_tree, &mut self.extension_index_tree),
            Relationship::Extension => (&mut self.extension_index_tree, &mut self.child_index_tree),
        };
        let replaced = tree.set_index(
            &update.case_id,
            &index.identifier,
            index.referenced_id.clone(),
        );
        // an identifier lives in one tree at a time
        let moved = other.delete_index(&update.case_id, &index.identifier);
        cleared_targets.extend(
            replaced
                .into_iter()
                .chain(moved)
                .filter(|target| *target != index.referenced_id),
        );

        if !self.phone_holds(&index.referenced_id) {
            self.add_dependent(CaseState::new(index.referenced_id.clone()));
        }

        if let Some(state) = self.state_mut(&update.case_id) {
            state
                .indices
                .retain(|existing| existing.identifier != index.identifier);
            state.indices.push(index.clone());
        }

        if index.relationship == Relationship::Extension {
            let also_child_of_host = update.indices_to_add.iter().any(|other| {
                other.relationship == Relationship::Child
                    && other.referenced_id == index.referenced_id
            });
            if !also_child_of_host && !update.is_live(&self.owner_ids_on_phone) {
                self.demote_to_dependent(&update.case_id);
            }
        }
    }

    fn delete_index(
        &mut self,
        case_id: &CaseId,
        identifier: &str,
        cleared_targets: &mut Vec<CaseId>,
    ) {
        let child = self.child_index_tree.delete_index(case_id, identifier);
        let extension = self.extension_index_tree.delete_index(case_id, identifier);
        if let Some(state) = self.state_mut(case_id) {
            state.indices.retain(|index| index.identifier != identifier);
        }
        cleared_targets.extend(child.into_iter().chain(extension));
    }

    fn state_mut(&mut self, case_id: &CaseId) -> Option<&mut CaseState> {
        if let Some(state) = self.case_ids_on_phone.get_mut(case_id) {
            return Some(state);
        }
        self.dependent_case_ids_on_phone.get_mut(case_id)
    }
}

/// All mutations of one batch folded per case
#[derive(Debug)]
struct PendingUpdate {
    case_id: CaseId,
    was_live_previously: bool,
    final_owner_id: Option<String>,
    is_closed: bool,
    created: bool,
    indices_to_add: Vec<CaseIndex>,
    indices_to_delete: Vec<String>,
}

impl PendingUpdate {
    const fn new(case_id: CaseId, was_live_previously: bool) -> Self {
        Self {
            case_id,
            was_live_previously,
            final_owner_id: None,
            is_closed: false,
            created: false,
            indices_to_add: Vec::new(),
            indices_to_delete: Vec::new(),
        }
    }

    /// Whether the case ends up owned by one of the device's owners
    fn is_live(&self, owner_ids: &BTreeSet<String>) -> bool {
        if self.is_closed {
            return false;
        }
        self.final_owner_id
            .as_ref()
            .map_or(self.was_live_previously, |owner_id| owner_ids.contains(owner_id))
    }

    fn has_extension_indices_to_add(&self) -> bool {
        self.indices_to_add
            .iter()
            .any(|index| index.relationship == Relationship::Extension)
    }
}
