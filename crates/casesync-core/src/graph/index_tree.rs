//! Flattened index tree over case ids

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::models::{CaseId, CaseIndex};

/// One relation of index edges: `case -> identifier -> referenced case`.
///
/// A sync log keeps one tree for child edges and one for extension edges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexTree {
    indices: BTreeMap<CaseId, BTreeMap<String, CaseId>>,
}

impl IndexTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from `(case, identifier, referenced)` triples
    pub fn from_edges<'a>(edges: impl IntoIterator<Item = (&'a str, &'a str, &'a str)>) -> Self {
        let mut tree = Self::new();
        for (from, identifier, to) in edges {
            tree.set_index(&CaseId::from(from), identifier, CaseId::from(to));
        }
        tree
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Point `from`'s `identifier` at `to`, returning the target it replaced
    pub fn set_index(&mut self, from: &CaseId, identifier: &str, to: CaseId) -> Option<CaseId> {
        self.indices
            .entry(from.clone())
            .or_default()
            .insert(identifier.to_string(), to)
    }

    /// Drop one identifier of `from`, returning the case it referenced
    pub fn delete_index(&mut self, from: &CaseId, identifier: &str) -> Option<CaseId> {
        let entries = self.indices.get_mut(from)?;
        let removed = entries.remove(identifier);
        if entries.is_empty() {
            self.indices.remove(from);
        }
        removed
    }

    /// Replace all outgoing edges of `from` with the given indices
    pub fn replace_indices<'a>(&mut self, from: &CaseId, indices: impl IntoIterator<Item = &'a CaseIndex>) {
        self.indices.remove(from);
        for index in indices {
            self.set_index(from, &index.identifier, index.referenced_id.clone());
        }
    }

    /// Record the complete edge set of `from`.
    ///
    /// Unlike [`replace_indices`](Self::replace_indices) an empty set keeps
    /// an entry, so merging this tree over another clears `from` there.
    pub fn refresh_case<'a>(
        &mut self,
        from: &CaseId,
        indices: impl IntoIterator<Item = &'a CaseIndex>,
    ) {
        let entries = self.indices.entry(from.clone()).or_default();
        entries.clear();
        for index in indices {
            entries.insert(index.identifier.clone(), index.referenced_id.clone());
        }
    }

    /// Remove every outgoing edge of `case_id`, returning them
    pub fn remove_case(&mut self, case_id: &CaseId) -> BTreeMap<String, CaseId> {
        self.indices.remove(case_id).unwrap_or_default()
    }

    /// Cases `case_id` points at
    pub fn outgoing(&self, case_id: &CaseId) -> impl Iterator<Item = &CaseId> {
        self.indices
            .get(case_id)
            .into_iter()
            .flat_map(BTreeMap::values)
    }

    pub fn has_outgoing(&self, case_id: &CaseId) -> bool {
        self.indices.contains_key(case_id)
    }

    pub fn get(&self, case_id: &CaseId) -> Option<&BTreeMap<String, CaseId>> {
        self.indices.get(case_id)
    }

    /// Cases that directly point at `case_id`
    pub fn incoming(&self, case_id: &CaseId) -> BTreeSet<CaseId> {
        self.indices
            .iter()
            .filter(|(_, entries)| entries.values().any(|target| target == case_id))
            .map(|(from, _)| from.clone())
            .collect()
    }

    /// Map of referenced case to the cases pointing at it
    pub fn reverse_indices(&self) -> BTreeMap<CaseId, BTreeSet<CaseId>> {
        let mut reverse: BTreeMap<CaseId, BTreeSet<CaseId>> = BTreeMap::new();
        for (from, entries) in &self.indices {
            for target in entries.values() {
                reverse
                    .entry(target.clone())
                    .or_default()
                    .insert(from.clone());
            }
        }
        reverse
    }

    /// Cases that own at least one edge
    pub fn case_ids(&self) -> impl Iterator<Item = &CaseId> {
        self.indices.keys()
    }

    /// Every `(from, identifier, to)` edge
    pub fn edges(&self) -> impl Iterator<Item = (&CaseId, &str, &CaseId)> {
        self.indices.iter().flat_map(|(from, entries)| {
            entries
                .iter()
                .map(move |(identifier, to)| (from, identifier.as_str(), to))
        })
    }

    /// Union of this tree and `other`, without any edge touching `removed`.
    ///
    /// A case present in `other` takes its edges from `other` only.
    #[must_use]
    pub fn merge(&self, other: &Self, removed: &BTreeSet<CaseId>) -> Self {
        let mut indices = self.indices.clone();
        for (from, entries) in &other.indices {
            indices.insert(from.clone(), entries.clone());
        }
        indices.retain(|from, entries| {
            if removed.contains(from) {
                return false;
            }
            entries.retain(|_, to| !removed.contains(to));
            !entries.is_empty()
        });
        Self { indices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ids(values: &[&str]) -> BTreeSet<CaseId> {
        values.iter().map(|value| CaseId::from(*value)).collect()
    }

    #[test]
    fn delete_last_index_drops_case_entry() {
        let mut tree = IndexTree::from_edges([("child", "parent", "p1")]);
        assert_eq!(
            tree.delete_index(&CaseId::from("child"), "parent"),
            Some(CaseId::from("p1"))
        );
        assert!(tree.is_empty());
        assert_eq!(tree.delete_index(&CaseId::from("child"), "parent"), None);
    }

    #[test]
    fn reverse_indices_groups_referrers() {
        let tree = IndexTree::from_edges([
            ("bran", "parent", "ned"),
            ("arya", "parent", "ned"),
            ("ned", "parent", "rickard"),
        ]);
        let reverse = tree.reverse_indices();
        assert_eq!(reverse[&CaseId::from("ned")], ids(&["arya", "bran"]));
        assert_eq!(reverse[&CaseId::from("rickard")], ids(&["ned"]));
        assert_eq!(tree.incoming(&CaseId::from("ned")), ids(&["arya", "bran"]));
    }

    #[test]
    fn merge_prefers_other_and_filters_removed() {
        let base = IndexTree::from_edges([
            ("a", "parent", "p1"),
            ("b", "parent", "gone"),
            ("gone", "parent", "p1"),
        ]);
        let update = IndexTree::from_edges([("a", "parent", "p2")]);
        let merged = base.merge(&update, &ids(&["gone"]));
        assert_eq!(merged, IndexTree::from_edges([("a", "parent", "p2")]));
    }

    #[test]
    fn refreshed_case_without_edges_clears_base_on_merge() {
        let base = IndexTree::from_edges([("a", "parent", "p1"), ("b", "parent", "p1")]);
        let mut update = IndexTree::new();
        update.refresh_case(&CaseId::from("a"), &[]);
        update.refresh_case(&CaseId::from("b"), &[CaseIndex::child("parent", "p2")]);

        let merged = base.merge(&update, &BTreeSet::new());
        assert_eq!(merged, IndexTree::from_edges([("b", "parent", "p2")]));
        assert!(!merged.has_outgoing(&CaseId::from("a")));
    }

    #[test]
    fn replace_indices_overwrites_previous_edges() {
        let mut tree = IndexTree::from_edges([("c", "old", "p1")]);
        tree.replace_indices(&CaseId::from("c"), &[CaseIndex::child("new", "p2")]);
        let edges: Vec<_> = tree
            .edges()
            .map(|(from, identifier, to)| (from.as_str(), identifier, to.as_str()))
            .collect();
        assert_eq!(edges, vec![("c", "new", "p2")]);
    }
}
