//! Read access to the external case store.
//!
//! The engine never writes cases; it only asks which cases exist, who owns
//! them and how they index each other. Every query is scoped to a domain.

mod libsql_store;
mod memory;

pub use libsql_store::LibSqlCaseStore;
pub use memory::MemoryCaseStore;

use crate::error::Result;
use crate::models::{Case, CaseId, CaseIndex};

/// An index row seen from the referenced side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseIndex {
    /// The case holding the index
    pub case_id: CaseId,
    pub index: CaseIndex,
}

/// Case queries the planner, footprint resolver and cleanliness cache rely on.
///
/// Implementations report outages as [`crate::Error::BatchFetch`]. Deleted
/// cases are left out of every id query; `get_cases` returns them with
/// `deleted` set so callers can tell "gone" from "never existed".
#[allow(async_fn_in_trait)]
pub trait CaseStore {
    /// Open, non-deleted cases owned by `owner_id`
    async fn get_open_case_ids_by_owner(&self, domain: &str, owner_id: &str)
        -> Result<Vec<CaseId>>;

    /// Cases owned by `owner_id` modified at or after `since` (Unix ms), closed ones included
    async fn get_cases_modified_since(
        &self,
        domain: &str,
        owner_id: &str,
        since: i64,
    ) -> Result<Vec<CaseId>>;

    /// Cases referenced by any of `case_ids`, over either relationship.
    ///
    /// The planner reads edges off the cases it already fetched; this lookup
    /// serves callers that only hold ids.
    async fn get_indexed_case_ids(&self, domain: &str, case_ids: &[CaseId])
        -> Result<Vec<CaseId>>;

    /// Cases holding an extension index onto any of `case_ids`
    async fn get_extension_case_ids(
        &self,
        domain: &str,
        case_ids: &[CaseId],
        include_closed: bool,
    ) -> Result<Vec<CaseId>>;

    /// Every index pointing at one of `case_ids`
    async fn get_reverse_indices(
        &self,
        domain: &str,
        case_ids: &[CaseId],
    ) -> Result<Vec<ReverseIndex>>;

    /// Bulk fetch; unknown ids are skipped
    async fn get_cases(&self, domain: &str, case_ids: &[CaseId]) -> Result<Vec<Case>>;

    async fn get_case(&self, domain: &str, case_id: &CaseId) -> Result<Option<Case>> {
        let mut cases = self
            .get_cases(domain, std::slice::from_ref(case_id))
            .await?;
        Ok(cases.pop())
    }
}
