//! Footprint resolution against the case store.
//!
//! A footprint is everything a set of seed cases drags onto a device: the
//! seeds, every case they reference (child or extension, transitively,
//! closed parents included) and the open extensions of anything reached.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Result;
use crate::graph::{closure_forward, IndexTree};
use crate::models::{Case, CaseId, Relationship};
use crate::store::CaseStore;

/// Cases reached from a seed set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Footprint {
    pub cases: BTreeMap<CaseId, Case>,
    /// Cases pulled in only as open extensions of a reached case
    pub extension_ids: BTreeSet<CaseId>,
}

impl Footprint {
    pub fn case_ids(&self) -> BTreeSet<CaseId> {
        self.cases.keys().cloned().collect()
    }

    pub fn contains(&self, case_id: &CaseId) -> bool {
        self.cases.contains_key(case_id)
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Cases in the footprint owned by neither `owner_id` nor nobody
    pub fn foreign_cases<'a>(&'a self, owner_id: &'a str) -> impl Iterator<Item = &'a Case> + 'a {
        self.cases
            .values()
            .filter(move |case| case.owner_id != owner_id && !case.is_unowned_extension())
    }
}

/// What a seed set depends on, beyond the seeds themselves
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependentCaseInfo {
    /// Every reached case, seeds included; empty when nothing beyond the seeds was reached
    pub all_ids: BTreeSet<CaseId>,
    pub extension_ids: BTreeSet<CaseId>,
}

/// Resolves footprints from a case store, fetching in chunks
pub struct FootprintResolver<'a, S: CaseStore> {
    store: &'a S,
    domain: &'a str,
    chunk_size: usize,
}

impl<'a, S: CaseStore> FootprintResolver<'a, S> {
    pub fn new(store: &'a S, domain: &'a str, chunk_size: usize) -> Self {
        Self {
            store,
            domain,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Footprint of an owner: its open cases and everything they need
    pub async fn owner_footprint(&self, owner_id: &str) -> Result<Footprint> {
        let base: BTreeSet<CaseId> = self
            .store
            .get_open_case_ids_by_owner(self.domain, owner_id)
            .await?
            .into_iter()
            .collect();
        let footprint = self.resolve(&base).await?;
        tracing::debug!(
            owner_id,
            base = base.len(),
            footprint = footprint.len(),
            "Resolved owner footprint"
        );
        Ok(footprint)
    }

    /// Footprint of `seed`. Missing and deleted cases are skipped.
    pub async fn resolve(&self, seed: &BTreeSet<CaseId>) -> Result<Footprint> {
        let mut footprint = Footprint::default();
        let mut child_tree = IndexTree::new();
        let mut extension_tree = IndexTree::new();
        let mut requested: BTreeSet<CaseId> = BTreeSet::new();
        let mut pending: BTreeSet<CaseId> = seed.clone();

        while !pending.is_empty() {
            requested.extend(pending.iter().cloned());
            let batch: Vec<CaseId> = std::mem::take(&mut pending).into_iter().collect();

            for chunk in batch.chunks(self.chunk_size) {
                let fetched = self.fetch_live(chunk).await?;
                let fetched_ids: Vec<CaseId> =
                    fetched.iter().map(|case| case.case_id.clone()).collect();
                for case in fetched {
                    child_tree.replace_indices(&case.case_id, case.indices_of(Relationship::Child));
                    extension_tree
                        .replace_indices(&case.case_id, case.indices_of(Relationship::Extension));
                    footprint.cases.insert(case.case_id.clone(), case);
                }

                if fetched_ids.is_empty() {
                    continue;
                }
                for extension_id in self
                    .store
                    .get_extension_case_ids(self.domain, &fetched_ids, false)
                    .await?
                {
                    if !requested.contains(&extension_id) {
                        footprint.extension_ids.insert(extension_id.clone());
                        pending.insert(extension_id);
                    }
                }
            }

            let known: BTreeSet<CaseId> = footprint.cases.keys().cloned().collect();
            for case_id in closure_forward(&known, &child_tree, &extension_tree) {
                if !requested.contains(&case_id) {
                    pending.insert(case_id);
                }
            }
        }

        footprint
            .extension_ids
            .retain(|case_id| footprint.cases.contains_key(case_id));
        Ok(footprint)
    }

    /// Dependency closure of `seed`
    pub async fn dependent_case_info(&self, seed: &BTreeSet<CaseId>) -> Result<DependentCaseInfo> {
        let footprint = self.resolve(seed).await?;
        let all_ids = footprint.case_ids();
        if all_ids.is_subset(seed) {
            return Ok(DependentCaseInfo::default());
        }
        Ok(DependentCaseInfo {
            all_ids,
            extension_ids: footprint.extension_ids,
        })
    }

    /// Neighbours of `cases` one hop away: referenced cases and open extensions
    pub async fn expand_one_hop(&self, cases: &[Case]) -> Result<BTreeSet<CaseId>> {
        let mut reached: BTreeSet<CaseId> = cases
            .iter()
            .flat_map(|case| case.indices.iter().map(|index| index.referenced_id.clone()))
            .collect();
        let ids: Vec<CaseId> = cases.iter().map(|case| case.case_id.clone()).collect();
        for chunk in ids.chunks(self.chunk_size) {
            reached.extend(
                self.store
                    .get_extension_case_ids(self.domain, chunk, false)
                    .await?,
            );
        }
        Ok(reached)
    }

    async fn fetch_live(&self, case_ids: &[CaseId]) -> Result<Vec<Case>> {
        let mut cases = self.store.get_cases(self.domain, case_ids).await?;
        cases.retain(|case| !case.deleted);
        Ok(cases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CaseIndex;
    use crate::store::MemoryCaseStore;
    use pretty_assertions::assert_eq;

    fn ids(values: &[&str]) -> BTreeSet<CaseId> {
        values.iter().map(|value| CaseId::from(*value)).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extension_then_child_chain_is_followed() {
        let store = MemoryCaseStore::with_cases([
            Case::new("A", "clinic", "owner-1").with_index(CaseIndex::extension("host", "B")),
            Case::new("B", "clinic", "owner-2").with_index(CaseIndex::child("parent", "C")),
            Case::new("C", "clinic", "owner-2"),
        ]);
        let resolver = FootprintResolver::new(&store, "clinic", 1000);

        let footprint = resolver.resolve(&ids(&["A"])).await.unwrap();
        assert_eq!(footprint.case_ids(), ids(&["A", "B", "C"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn parents_do_not_pull_in_children() {
        let store = MemoryCaseStore::with_cases([
            Case::new("parent", "clinic", "owner-1"),
            Case::new("child", "clinic", "owner-2")
                .with_index(CaseIndex::child("parent", "parent")),
        ]);
        let resolver = FootprintResolver::new(&store, "clinic", 1000);

        let footprint = resolver.resolve(&ids(&["parent"])).await.unwrap();
        assert_eq!(footprint.case_ids(), ids(&["parent"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_extensions_of_reached_cases_are_included() {
        let store = MemoryCaseStore::with_cases([
            Case::new("child", "clinic", "owner-1").with_index(CaseIndex::child("parent", "host")),
            Case::new("host", "clinic", "owner-2"),
            Case::new("extension", "clinic", "-").with_index(CaseIndex::extension("host", "host")),
            Case::new("closed_extension", "clinic", "-")
                .with_index(CaseIndex::extension("host", "host"))
                .closed(),
        ]);
        let resolver = FootprintResolver::new(&store, "clinic", 1);

        let footprint = resolver.resolve(&ids(&["child"])).await.unwrap();
        assert_eq!(footprint.case_ids(), ids(&["child", "host", "extension"]));
        assert_eq!(footprint.extension_ids, ids(&["extension"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_parents_and_cycles_are_handled() {
        let store = MemoryCaseStore::with_cases([
            Case::new("a", "clinic", "owner-1").with_index(CaseIndex::child("parent", "b")),
            Case::new("b", "clinic", "owner-1")
                .with_index(CaseIndex::child("parent", "a"))
                .closed(),
            Case::new("self", "clinic", "owner-1").with_index(CaseIndex::child("me", "self")),
        ]);
        let resolver = FootprintResolver::new(&store, "clinic", 1000);

        let footprint = resolver.owner_footprint("owner-1").await.unwrap();
        assert_eq!(footprint.case_ids(), ids(&["a", "b", "self"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_and_deleted_references_are_skipped() {
        let mut deleted = Case::new("deleted", "clinic", "owner-2");
        deleted.deleted = true;
        let store = MemoryCaseStore::with_cases([
            Case::new("c1", "clinic", "owner-1")
                .with_index(CaseIndex::child("parent", "missing"))
                .with_index(CaseIndex::child("other", "deleted")),
            deleted,
        ]);
        let resolver = FootprintResolver::new(&store, "clinic", 1000);

        let footprint = resolver.resolve(&ids(&["c1"])).await.unwrap();
        assert_eq!(footprint.case_ids(), ids(&["c1"]));
        assert_eq!(footprint.foreign_cases("owner-1").count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dependent_info_is_empty_without_dependencies() {
        let store = MemoryCaseStore::with_cases([
            Case::new("lonely", "clinic", "owner-1"),
            Case::new("child", "clinic", "owner-1").with_index(CaseIndex::child("parent", "lonely")),
        ]);
        let resolver = FootprintResolver::new(&store, "clinic", 1000);

        let info = resolver.dependent_case_info(&ids(&["lonely"])).await.unwrap();
        assert_eq!(info, DependentCaseInfo::default());

        let info = resolver.dependent_case_info(&ids(&["child"])).await.unwrap();
        assert_eq!(info.all_ids, ids(&["child", "lonely"]));
        assert!(info.extension_ids.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn expand_one_hop_reports_direct_neighbours() {
        let store = MemoryCaseStore::with_cases([
            Case::new("a", "clinic", "owner-1").with_index(CaseIndex::child("parent", "b")),
            Case::new("b", "clinic", "owner-1").with_index(CaseIndex::child("parent", "c")),
            Case::new("c", "clinic", "owner-1"),
            Case::new("ext", "clinic", "-").with_index(CaseIndex::extension("host", "a")),
        ]);
        let resolver = FootprintResolver::new(&store, "clinic", 1000);
        let a = store.get_case("clinic", &CaseId::from("a")).await.unwrap().unwrap();

        let reached = resolver.expand_one_hop(&[a]).await.unwrap();
        assert_eq!(reached, ids(&["b", "ext"]));
    }
}
