//! Per-owner cleanliness cache.
//!
//! An owner is clean when its footprint holds only its own cases and
//! unowned extensions. Clean owners sync incrementally without resolving
//! their footprint. Flags are keyed by `(domain, owner_id)` and written
//! optimistically: a write only lands if the row has not changed since it
//! was read, and a lost race is corrected by the next revalidation.

use std::collections::{BTreeMap, BTreeSet};

use libsql::Connection;

use crate::db::{CleanlinessRepository, LibSqlCleanlinessRepository};
use crate::error::{Error, Result};
use crate::footprint::FootprintResolver;
use crate::models::{
    Case, CaseChangeEvent, CaseId, OwnershipCleanlinessFlag, Relationship,
    UNOWNED_EXTENSION_OWNER_ID,
};
use crate::store::CaseStore;
use crate::util::{validate_domain, validate_owner_id};

/// Attempts at a conditional flag write before giving up
const MAX_WRITE_ATTEMPTS: usize = 3;

/// Outcome of [`CleanlinessCache::revalidate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revalidation {
    Clean,
    /// Dirty, and the hint still proves it
    DirtyHintValid(CaseId),
    /// The flag was missing or stale and has been recomputed
    Rebuilt(OwnershipCleanlinessFlag),
}

/// Cleanliness flags over a libSQL connection and a case store
pub struct CleanlinessCache<'a, S: CaseStore> {
    conn: &'a Connection,
    store: &'a S,
    chunk_size: usize,
    track_new_owners: bool,
}

impl<'a, S: CaseStore> CleanlinessCache<'a, S> {
    pub const fn new(conn: &'a Connection, store: &'a S) -> Self {
        Self {
            conn,
            store,
            chunk_size: 1000,
            track_new_owners: true,
        }
    }

    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Whether `mark_dirty_if` may create flags for owners it has never seen
    #[must_use]
    pub const fn with_track_new_owners(mut self, track_new_owners: bool) -> Self {
        self.track_new_owners = track_new_owners;
        self
    }

    fn repo(&self) -> LibSqlCleanlinessRepository<'a> {
        LibSqlCleanlinessRepository::new(self.conn)
    }

    fn resolver<'r>(&'r self, domain: &'r str) -> FootprintResolver<'r, S> {
        FootprintResolver::new(self.store, domain, self.chunk_size)
    }

    pub async fn get_flag(
        &self,
        domain: &str,
        owner_id: &str,
    ) -> Result<Option<OwnershipCleanlinessFlag>> {
        let domain = validate_domain(domain)?;
        let owner_id = validate_owner_id(owner_id)?;
        self.repo().get(domain, owner_id).await
    }

    /// Whether the stored flag says clean. A missing flag is not clean.
    pub async fn is_clean(&self, domain: &str, owner_id: &str) -> Result<bool> {
        Ok(self
            .get_flag(domain, owner_id)
            .await?
            .is_some_and(|flag| flag.is_clean))
    }

    /// Return the owner's flag, computing and storing it on first use
    pub async fn ensure_flag(&self, domain: &str, owner_id: &str) -> Result<OwnershipCleanlinessFlag> {
        if let Some(flag) = self.get_flag(domain, owner_id).await? {
            return Ok(flag);
        }
        let flag = self.flag_from_scratch(domain, owner_id).await?;
        if self.repo().insert_if_absent(&flag).await? {
            tracing::debug!(domain, owner_id, is_clean = flag.is_clean, "Created cleanliness flag");
            return Ok(flag);
        }
        // someone else created it between our read and write
        self.get_flag(domain, owner_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("cleanliness flag for {owner_id}")))
    }

    /// Compute an owner's flag from its footprint without storing it
    pub async fn flag_from_scratch(
        &self,
        domain: &str,
        owner_id: &str,
    ) -> Result<OwnershipCleanlinessFlag> {
        let domain = validate_domain(domain)?;
        let owner_id = validate_owner_id(owner_id)?;
        let resolver = self.resolver(domain);

        let base: BTreeSet<CaseId> = self
            .store
            .get_open_case_ids_by_owner(domain, owner_id)
            .await?
            .into_iter()
            .collect();
        let footprint = resolver.resolve(&base).await?;
        if footprint.foreign_cases(owner_id).next().is_none() {
            return Ok(OwnershipCleanlinessFlag::clean(domain, owner_id));
        }

        let mut hint = None;
        for case_id in &base {
            let reached = resolver.resolve(&BTreeSet::from([case_id.clone()])).await?;
            if reached.foreign_cases(owner_id).next().is_some() {
                hint = Some(case_id.clone());
                break;
            }
        }
        Ok(OwnershipCleanlinessFlag::dirty(domain, owner_id, hint))
    }

    /// Recompute an owner's flag and store it
    pub async fn rebuild(&self, domain: &str, owner_id: &str) -> Result<OwnershipCleanlinessFlag> {
        let flag = self.flag_from_scratch(domain, owner_id).await?;
        self.store_flag(&flag).await?;
        tracing::info!(
            domain,
            owner_id,
            is_clean = flag.is_clean,
            hint = ?flag.hint,
            "Rebuilt cleanliness flag"
        );
        Ok(flag)
    }

    /// Whether `hint` still proves its owner's footprint reaches foreign cases
    pub async fn hint_still_valid(&self, domain: &str, hint: &CaseId) -> Result<bool> {
        let Some(case) = self.store.get_case(domain, hint).await? else {
            return Ok(false);
        };
        if case.deleted {
            return Ok(false);
        }
        let info = self
            .resolver(domain)
            .dependent_case_info(&BTreeSet::from([hint.clone()]))
            .await?;
        if info.all_ids.is_empty() {
            return Ok(false);
        }
        let related: Vec<CaseId> = info.all_ids.into_iter().collect();
        let cases = self.store.get_cases(domain, &related).await?;
        Ok(cases.iter().any(|related| {
            !related.deleted
                && related.owner_id != case.owner_id
                && !related.is_unowned_extension()
        }))
    }

    /// Confirm or repair an owner's flag before planning
    pub async fn revalidate(&self, domain: &str, owner_id: &str) -> Result<Revalidation> {
        let Some(flag) = self.get_flag(domain, owner_id).await? else {
            return Ok(Revalidation::Rebuilt(self.ensure_flag(domain, owner_id).await?));
        };
        if flag.is_clean {
            return Ok(Revalidation::Clean);
        }
        if let Some(hint) = &flag.hint {
            if self.hint_still_valid(domain, hint).await? {
                return Ok(Revalidation::DirtyHintValid(hint.clone()));
            }
            let stale = Error::StaleHint {
                owner_id: owner_id.to_string(),
                hint: hint.to_string(),
            };
            tracing::warn!(domain, "{stale}; rebuilding from scratch");
        }
        Ok(Revalidation::Rebuilt(self.rebuild(domain, owner_id).await?))
    }

    /// Mark every owner whose footprint a case change may have made dirty.
    ///
    /// Returns the owners marked, in order.
    pub async fn mark_dirty_if(&self, domain: &str, event: &CaseChangeEvent) -> Result<Vec<String>> {
        let domain = validate_domain(domain)?;
        let dirty = self.dirty_owners(domain, event).await?;

        let mut marked = Vec::new();
        for (owner_id, hint) in dirty {
            if self.mark_dirty(domain, &owner_id, hint).await? {
                marked.push(owner_id);
            }
        }
        if !marked.is_empty() {
            tracing::debug!(
                domain,
                case_id = %event.case.case_id,
                owners = ?marked,
                "Marked owners dirty"
            );
        }
        Ok(marked)
    }

    /// Owners made dirty by `event`, each with its hint. Later rules override earlier hints.
    async fn dirty_owners(
        &self,
        domain: &str,
        event: &CaseChangeEvent,
    ) -> Result<BTreeMap<String, CaseId>> {
        let case = &event.case;
        let mut dirty: BTreeMap<String, CaseId> = BTreeMap::new();
        let mut mark = |owner_id: &str, hint: &CaseId| {
            if owner_id != UNOWNED_EXTENSION_OWNER_ID {
                dirty.insert(owner_id.to_string(), hint.clone());
            }
        };

        if let Some(previous_owner_id) = event.reassigned_away_from() {
            mark(previous_owner_id, &case.case_id);
        }

        let child_targets: Vec<CaseId> = case
            .indices_of(Relationship::Child)
            .map(|index| index.referenced_id.clone())
            .collect();
        for parent in self.fetch_live(domain, &child_targets).await? {
            if parent.owner_id != case.owner_id && !parent.is_unowned_extension() {
                mark(&case.owner_id, &case.case_id);
            }
        }

        let hosts = self.effective_hosts(domain, case).await?;
        let mut involved: BTreeSet<&str> = hosts
            .iter()
            .map(|host| host.owner_id.as_str())
            .collect();
        if !case.is_unowned_extension() {
            involved.insert(case.owner_id.as_str());
        }
        if involved.len() > 1 {
            mark(&case.owner_id, &case.case_id);
            for host in &hosts {
                mark(&host.owner_id, &host.case_id);
            }
        }

        let reverse = self
            .store
            .get_reverse_indices(domain, std::slice::from_ref(&case.case_id))
            .await?;
        let children: Vec<CaseId> = reverse
            .into_iter()
            .filter(|reverse| reverse.index.relationship == Relationship::Child)
            .map(|reverse| reverse.case_id)
            .collect();
        for child in self.fetch_live(domain, &children).await? {
            if child.owner_id != case.owner_id && !case.is_unowned_extension() {
                mark(&child.owner_id, &child.case_id);
            }
        }

        Ok(dirty)
    }

    /// Extension hosts of `case`, walking through hosts nobody owns
    async fn effective_hosts(&self, domain: &str, case: &Case) -> Result<Vec<Case>> {
        let mut hosts = Vec::new();
        let mut visited = BTreeSet::from([case.case_id.clone()]);
        let mut pending: Vec<CaseId> = case
            .indices_of(Relationship::Extension)
            .map(|index| index.referenced_id.clone())
            .collect();

        while !pending.is_empty() {
            pending.retain(|case_id| visited.insert(case_id.clone()));
            let fetched = self.fetch_live(domain, &pending).await?;
            pending.clear();
            for host in fetched {
                if host.is_unowned_extension() {
                    pending.extend(
                        host.indices_of(Relationship::Extension)
                            .map(|index| index.referenced_id.clone()),
                    );
                } else {
                    hosts.push(host);
                }
            }
        }
        Ok(hosts)
    }

    async fn fetch_live(&self, domain: &str, case_ids: &[CaseId]) -> Result<Vec<Case>> {
        if case_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut cases = self.store.get_cases(domain, case_ids).await?;
        cases.retain(|case| !case.deleted);
        Ok(cases)
    }

    /// Returns whether a dirty flag was written
    async fn mark_dirty(&self, domain: &str, owner_id: &str, hint: CaseId) -> Result<bool> {
        let owner_id = validate_owner_id(owner_id)?;
        let flag = OwnershipCleanlinessFlag::dirty(domain, owner_id, Some(hint));
        if self.repo().get(domain, owner_id).await?.is_none() {
            if !self.track_new_owners {
                return Ok(false);
            }
            if self.repo().insert_if_absent(&flag).await? {
                return Ok(true);
            }
        }
        self.store_flag(&flag).await?;
        Ok(true)
    }

    /// Write `flag` over whatever is stored, retrying lost races
    async fn store_flag(&self, flag: &OwnershipCleanlinessFlag) -> Result<()> {
        let repo = self.repo();
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let written = match repo.get(&flag.domain, &flag.owner_id).await? {
                Some(current) => repo.write_if_unchanged(flag, current.last_checked).await?,
                None => repo.insert_if_absent(flag).await?,
            };
            if written {
                return Ok(());
            }
        }
        tracing::warn!(
            domain = %flag.domain,
            owner_id = %flag.owner_id,
            "Cleanliness flag kept changing underneath us; leaving it for the next revalidation"
        );
        Ok(())
    }
}
