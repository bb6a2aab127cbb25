//! In-memory case store for tests and embedding

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;

use super::{CaseStore, ReverseIndex};
use crate::error::{Error, Result};
use crate::models::{Case, CaseId, Relationship};

/// Case store backed by a map, with a switch to simulate outages
#[derive(Debug, Default)]
pub struct MemoryCaseStore {
    cases: RwLock<BTreeMap<CaseId, Case>>,
    unavailable: AtomicBool,
}

impl MemoryCaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `cases`
    pub fn with_cases(cases: impl IntoIterator<Item = Case>) -> Self {
        let cases = cases
            .into_iter()
            .map(|case| (case.case_id.clone(), case))
            .collect();
        Self {
            cases: RwLock::new(cases),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Insert or replace a case
    pub async fn upsert(&self, case: Case) {
        self.cases.write().await.insert(case.case_id.clone(), case);
    }

    /// Drop a case entirely, as if it never existed
    pub async fn remove(&self, case_id: &CaseId) -> Option<Case> {
        self.cases.write().await.remove(case_id)
    }

    /// Make every query fail with a batch fetch error until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::BatchFetch("case store is unavailable".to_string()));
        }
        Ok(())
    }

    async fn live_cases_in(&self, domain: &str) -> Vec<Case> {
        self.cases
            .read()
            .await
            .values()
            .filter(|case| case.domain == domain && !case.deleted)
            .cloned()
            .collect()
    }
}

impl CaseStore for MemoryCaseStore {
    async fn get_open_case_ids_by_owner(
        &self,
        domain: &str,
        owner_id: &str,
    ) -> Result<Vec<CaseId>> {
        self.check_available()?;
        Ok(self
            .live_cases_in(domain)
            .await
            .into_iter()
            .filter(|case| case.owner_id == owner_id && !case.closed)
            .map(|case| case.case_id)
            .collect())
    }

    async fn get_cases_modified_since(
        &self,
        domain: &str,
        owner_id: &str,
        since: i64,
    ) -> Result<Vec<CaseId>> {
        self.check_available()?;
        Ok(self
            .live_cases_in(domain)
            .await
            .into_iter()
            .filter(|case| case.owner_id == owner_id && case.server_modified_on >= since)
            .map(|case| case.case_id)
            .collect())
    }

    async fn get_indexed_case_ids(
        &self,
        domain: &str,
        case_ids: &[CaseId],
    ) -> Result<Vec<CaseId>> {
        self.check_available()?;
        let wanted: BTreeSet<&CaseId> = case_ids.iter().collect();
        let referenced: BTreeSet<CaseId> = self
            .live_cases_in(domain)
            .await
            .into_iter()
            .filter(|case| wanted.contains(&case.case_id))
            .flat_map(|case| case.indices.into_iter().map(|index| index.referenced_id))
            .collect();
        Ok(referenced.into_iter().collect())
    }

    async fn get_extension_case_ids(
        &self,
        domain: &str,
        case_ids: &[CaseId],
        include_closed: bool,
    ) -> Result<Vec<CaseId>> {
        self.check_available()?;
        let wanted: BTreeSet<&CaseId> = case_ids.iter().collect();
        Ok(self
            .live_cases_in(domain)
            .await
            .into_iter()
            .filter(|case| include_closed || !case.closed)
            .filter(|case| {
                case.indices_of(Relationship::Extension)
                    .any(|index| wanted.contains(&index.referenced_id))
            })
            .map(|case| case.case_id)
            .collect())
    }

    async fn get_reverse_indices(
        &self,
        domain: &str,
        case_ids: &[CaseId],
    ) -> Result<Vec<ReverseIndex>> {
        self.check_available()?;
        let wanted: BTreeSet<&CaseId> = case_ids.iter().collect();
        let mut reverse = Vec::new();
        for case in self.live_cases_in(domain).await {
            for index in case.indices {
                if wanted.contains(&index.referenced_id) {
                    reverse.push(ReverseIndex {
                        case_id: case.case_id.clone(),
                        index,
                    });
                }
            }
        }
        Ok(reverse)
    }

    async fn get_cases(&self, domain: &str, case_ids: &[CaseId]) -> Result<Vec<Case>> {
        self.check_available()?;
        let cases = self.cases.read().await;
        let unique: BTreeSet<&CaseId> = case_ids.iter().collect();
        Ok(unique
            .into_iter()
            .filter_map(|case_id| cases.get(case_id))
            .filter(|case| case.domain == domain)
            .cloned()
            .collect())
    }
}
