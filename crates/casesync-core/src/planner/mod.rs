//! Batched sync planning.
//!
//! For each owner on the device the planner picks a candidate strategy from
//! the cleanliness cache, then pulls candidates from the case store in
//! chunks, expanding one hop at a time until every dependency is known.
//! Cases the previous log holds that no owner batch reached are re-checked
//! at the end. The result is the list of updates to send and the next log;
//! nothing is persisted here.

mod batch;
mod global_state;

pub use global_state::GlobalSyncState;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use libsql::Connection;
use serde::{Deserialize, Serialize};

use crate::cleanliness::{CleanlinessCache, Revalidation};
use crate::config::SyncEngineConfig;
use crate::error::{Error, Result};
use crate::footprint::FootprintResolver;
use crate::graph::IndexTree;
use crate::models::{
    Case, CaseId, CaseIndex, CaseState, CaseSyncUpdate, Relationship, RequiredUpdate,
};
use crate::store::CaseStore;
use crate::sync_log::SyncLog;
use crate::util::{unix_timestamp_millis_now, validate_domain, validate_owner_id};
use batch::Reason;

/// Who is syncing, and on behalf of which owners
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub domain: String,
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    pub owner_ids: BTreeSet<String>,
}

impl SyncRequest {
    pub fn new(domain: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            user_id: user_id.into(),
            device_id: None,
            owner_ids: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    #[must_use]
    pub fn with_owners<I, T>(mut self, owner_ids: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.owner_ids = owner_ids.into_iter().map(Into::into).collect();
        self
    }
}

/// Outcome of one planning run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncPlan {
    pub updates: Vec<CaseSyncUpdate>,
    pub log: SyncLog,
    /// Owners skipped because of an isolated failure, with the error message
    pub failed_owners: Vec<(String, String)>,
}

/// How candidates are gathered for one owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Every open case of the owner, expanded to its full footprint
    Initial,
    /// Only cases modified since the previous sync
    Clean,
    /// The owner's full footprint, as a known-dirty owner
    DirtyHintValid(CaseId),
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => f.write_str("initial"),
            Self::Clean => f.write_str("clean"),
            Self::DirtyHintValid(hint) => write!(f, "dirty (hint {hint})"),
        }
    }
}

/// Cooperative cancellation, checked at chunk boundaries
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that also trips once `timeout` has elapsed
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancelled: Arc::default(),
            deadline: Instant::now().checked_add(timeout),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled("planning was cancelled".to_string()));
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(Error::Cancelled("planning deadline exceeded".to_string()));
        }
        Ok(())
    }
}

/// What every batch of a run needs to know about the request
pub(crate) struct PlanContext<'p> {
    request: &'p SyncRequest,
    /// Previous log, unless it is absent or failed reconciliation
    previous: Option<&'p SyncLog>,
}

impl PlanContext<'_> {
    fn owns(&self, case: &Case) -> bool {
        !case.closed && self.request.owner_ids.contains(&case.owner_id)
    }

    fn previous_holds(&self, case_id: &CaseId) -> bool {
        self.previous.is_some_and(|log| log.phone_holds(case_id))
    }

    fn previous_dependent(&self, case_id: &CaseId) -> bool {
        self.previous.is_some_and(|log| log.is_dependent(case_id))
    }

    fn modified_since_previous(&self, case: &Case) -> bool {
        match self.previous {
            Some(log) => case.server_modified_on >= log.date || !log.phone_holds(&case.case_id),
            None => true,
        }
    }
}

/// Plans syncs against a case store and the cleanliness cache
pub struct BatchedSyncPlanner<'a, S: CaseStore> {
    store: &'a S,
    cleanliness: CleanlinessCache<'a, S>,
    chunk_size: usize,
}

impl<'a, S: CaseStore> BatchedSyncPlanner<'a, S> {
    pub fn new(conn: &'a Connection, store: &'a S, config: &SyncEngineConfig) -> Self {
        let chunk_size = config.chunk_size.max(1);
        Self {
            store,
            cleanliness: CleanlinessCache::new(conn, store)
                .with_chunk_size(chunk_size)
                .with_track_new_owners(config.track_new_owners),
            chunk_size,
        }
    }

    /// Plan a sync for `request` on top of `previous`.
    ///
    /// Store outages and cancellation abort the run. Any other failure is
    /// confined to the owner it happened for, which is reported in
    /// `failed_owners` and left out of the new log's owners.
    pub async fn plan(
        &self,
        request: &SyncRequest,
        previous: Option<&SyncLog>,
        cancel: &CancelHandle,
    ) -> Result<SyncPlan> {
        // the next sync asks for changes since this instant, so take it before any read
        let started_at = unix_timestamp_millis_now();
        validate_domain(&request.domain)?;
        if request.user_id.trim().is_empty() {
            return Err(Error::InvalidInput("user id cannot be empty".to_string()));
        }
        if let Some(log) = previous {
            if log.domain != request.domain || log.user_id != request.user_id {
                return Err(Error::InvalidInput(format!(
                    "sync log {} belongs to another user or domain",
                    log.id
                )));
            }
            if log.had_state_error {
                tracing::warn!(log_id = %log.id, "Previous sync log had a state error; rebuilding");
            }
        }

        let request = &SyncRequest {
            owner_ids: request
                .owner_ids
                .iter()
                .map(|owner_id| owner_id.trim().to_string())
                .collect(),
            ..request.clone()
        };
        let ctx = PlanContext {
            request,
            previous: previous.filter(|log| !log.had_state_error),
        };
        let mut state = GlobalSyncState::default();
        let mut failed_owners = Vec::new();

        for owner_id in &request.owner_ids {
            cancel.check()?;
            let snapshot = state.clone();
            match self.process_owner(&ctx, owner_id, &mut state, cancel).await {
                Ok(()) => {}
                Err(error) if error.is_owner_recoverable() => {
                    tracing::warn!(owner_id, %error, "Skipping owner after isolated failure");
                    state = snapshot;
                    failed_owners.push((owner_id.clone(), error.to_string()));
                }
                Err(error) => return Err(error),
            }
        }

        if let Some(log) = ctx.previous {
            let leftover: Vec<(CaseId, Reason)> = log
                .held_case_ids()
                .into_iter()
                .filter(|case_id| !state.is_relevant(case_id) && !state.is_removed(case_id))
                .map(|case_id| (case_id, Reason::Held))
                .collect();
            tracing::debug!(cases = leftover.len(), "Re-checking cases held by the device");
            self.process_batch(&ctx, &mut state, leftover, cancel).await?;
        }
        cancel.check()?;

        let log = build_log(&ctx, previous, &state, &failed_owners, started_at);
        let updates = final_updates(state.into_updates(), &log, ctx.previous);
        tracing::info!(
            log_id = %log.id,
            updates = updates.len(),
            primary = log.case_ids_on_phone.len(),
            dependent = log.dependent_case_ids_on_phone.len(),
            failed_owners = failed_owners.len(),
            "Planned sync"
        );
        Ok(SyncPlan {
            updates,
            log,
            failed_owners,
        })
    }

    /// Pick the candidate strategy for one owner
    pub async fn strategy(
        &self,
        domain: &str,
        owner_id: &str,
        previous: Option<&SyncLog>,
    ) -> Result<Strategy> {
        let known_owner = previous.is_some_and(|log| log.owner_ids_on_phone.contains(owner_id));
        if !known_owner {
            self.cleanliness.ensure_flag(domain, owner_id).await?;
            return Ok(Strategy::Initial);
        }
        Ok(match self.cleanliness.revalidate(domain, owner_id).await? {
            Revalidation::Clean => Strategy::Clean,
            Revalidation::DirtyHintValid(hint) => Strategy::DirtyHintValid(hint),
            Revalidation::Rebuilt(_) => Strategy::Initial,
        })
    }

    async fn process_owner(
        &self,
        ctx: &PlanContext<'_>,
        owner_id: &str,
        state: &mut GlobalSyncState,
        cancel: &CancelHandle,
    ) -> Result<()> {
        let owner_id = validate_owner_id(owner_id)?;
        let domain = ctx.request.domain.as_str();
        let strategy = self.strategy(domain, owner_id, ctx.previous).await?;

        let (candidates, reason) = match (&strategy, ctx.previous) {
            (Strategy::Clean, Some(log)) => (
                self.store
                    .get_cases_modified_since(domain, owner_id, log.date)
                    .await?,
                Reason::Candidate,
            ),
            (Strategy::DirtyHintValid(_), _) => (
                FootprintResolver::new(self.store, domain, self.chunk_size)
                    .owner_footprint(owner_id)
                    .await?
                    .case_ids()
                    .into_iter()
                    .collect(),
                Reason::Dependency,
            ),
            _ => (
                self.store
                    .get_open_case_ids_by_owner(domain, owner_id)
                    .await?,
                Reason::Candidate,
            ),
        };
        tracing::info!(
            owner_id,
            strategy = %strategy,
            candidates = candidates.len(),
            "Planning owner"
        );

        self.process_batch(
            ctx,
            state,
            candidates.into_iter().map(|case_id| (case_id, reason)),
            cancel,
        )
        .await
    }
}

/// Derive the next log from the previous one and what the run found
fn build_log(
    ctx: &PlanContext<'_>,
    previous: Option<&SyncLog>,
    state: &GlobalSyncState,
    failed_owners: &[(String, String)],
    started_at: i64,
) -> SyncLog {
    let request = ctx.request;
    let mut log = match ctx.previous {
        Some(log) => log.next(),
        None => {
            let mut log = SyncLog::new(&request.domain, &request.user_id);
            log.previous_log_id = previous.map(|log| log.id);
            log
        }
    };
    log.date = started_at;
    if request.device_id.is_some() {
        log.device_id.clone_from(&request.device_id);
    }
    log.owner_ids_on_phone = request
        .owner_ids
        .iter()
        .filter(|owner_id| !failed_owners.iter().any(|(failed, _)| failed == *owner_id))
        .cloned()
        .collect();

    for case in state.relevant_cases() {
        if case.closed {
            log.closed_case_ids.insert(case.case_id.clone());
        } else {
            log.closed_case_ids.remove(&case.case_id);
        }
        if !state.is_justified(&case.case_id) {
            continue;
        }
        let case_state = CaseState::from_case(case);
        if ctx.owns(case) {
            log.add_primary(case_state);
        } else {
            log.demote_to_dependent(&case.case_id);
            log.add_dependent(case_state);
        }
    }

    // second pass so edges can point at cases added above
    let mut child_edges = IndexTree::new();
    let mut extension_edges = IndexTree::new();
    for case in state.relevant_cases() {
        if !log.phone_holds(&case.case_id) {
            continue;
        }
        let kept: Vec<&CaseIndex> = case
            .indices
            .iter()
            .filter(|index| {
                log.phone_holds(&index.referenced_id) && !state.is_removed(&index.referenced_id)
            })
            .collect();
        let with = |relationship: Relationship| {
            kept.iter()
                .copied()
                .filter(move |index| index.relationship == relationship)
        };
        child_edges.refresh_case(&case.case_id, with(Relationship::Child));
        extension_edges.refresh_case(&case.case_id, with(Relationship::Extension));
    }
    // removed cases the log no longer holds cannot keep edges
    let gone: BTreeSet<CaseId> = state
        .removed_ids()
        .filter(|case_id| !log.phone_holds(case_id))
        .cloned()
        .collect();
    log.child_index_tree = log.child_index_tree.merge(&child_edges, &gone);
    log.extension_index_tree = log.extension_index_tree.merge(&extension_edges, &gone);

    let to_prune: Vec<CaseId> = state
        .stale_ids()
        .chain(state.removed_ids())
        .cloned()
        .collect();
    for case_id in &to_prune {
        if log.phone_holds(case_id) {
            log.prune(case_id);
        }
    }
    log.purge_dependent_cases();

    if let Err(error) = log.reconcile() {
        tracing::warn!(%error, "Storing sync log with a state error");
    }
    log
}

/// Keep the updates the finished log backs.
///
/// A case the new log holds keeps everything. A case only the previous log
/// held is leaving the device and keeps `Update`/`Close`. Anything else was
/// picked up during expansion and pruned again, so it is not sent.
fn final_updates(
    updates: Vec<CaseSyncUpdate>,
    log: &SyncLog,
    previous: Option<&SyncLog>,
) -> Vec<CaseSyncUpdate> {
    updates
        .into_iter()
        .filter_map(|mut update| {
            let case_id = &update.case.case_id;
            if log.phone_holds(case_id) {
                return Some(update);
            }
            if !previous.is_some_and(|log| log.phone_holds(case_id)) {
                tracing::debug!(
                    case_id = %case_id,
                    "Dropping update for a case the device will not hold"
                );
                return None;
            }
            update.required_updates.remove(&RequiredUpdate::Create);
            (!update.required_updates.is_empty()).then_some(update)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CleanlinessRepository, Database, LibSqlCleanlinessRepository};
    use crate::models::OwnershipCleanlinessFlag;
    use crate::store::MemoryCaseStore;
    use pretty_assertions::assert_eq;

    const DOMAIN: &str = "clinic";
    /// Well before any log date
    const LONG_AGO: i64 = 1;

    fn case(id: &str, owner: &str) -> Case {
        Case::new(id, DOMAIN, owner).modified_at(LONG_AGO)
    }

    fn ids(values: &[&str]) -> BTreeSet<CaseId> {
        values.iter().map(|value| CaseId::from(*value)).collect()
    }

    fn request(owners: &[&str]) -> SyncRequest {
        SyncRequest::new(DOMAIN, "user-1")
            .with_device("phone-1")
            .with_owners(owners.iter().copied())
    }

    fn sent(plan: &SyncPlan) -> BTreeSet<CaseId> {
        plan.updates
            .iter()
            .map(|update| update.case.case_id.clone())
            .collect()
    }

    fn update_for<'p>(plan: &'p SyncPlan, case_id: &str) -> &'p CaseSyncUpdate {
        plan.updates
            .iter()
            .find(|update| update.case.case_id.as_str() == case_id)
            .unwrap()
    }

    fn primary(log: &SyncLog) -> BTreeSet<CaseId> {
        log.case_ids_on_phone.keys().cloned().collect()
    }

    fn dependent(log: &SyncLog) -> BTreeSet<CaseId> {
        log.dependent_case_ids_on_phone.keys().cloned().collect()
    }

    async fn plan(
        db: &Database,
        store: &MemoryCaseStore,
        request: &SyncRequest,
        previous: Option<&SyncLog>,
    ) -> Result<SyncPlan> {
        let config = SyncEngineConfig {
            chunk_size: 2,
            ..SyncEngineConfig::default()
        };
        BatchedSyncPlanner::new(db.connection(), store, &config)
            .plan(request, previous, &CancelHandle::new())
            .await
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn first_sync_sends_footprint_and_builds_log() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([
            case("child", "owner-1").with_index(CaseIndex::child("parent", "parent")),
            case("parent", "owner-2"),
            case("extension", "-").with_index(CaseIndex::extension("host", "child")),
            case("unrelated", "owner-2"),
        ]);

        let plan = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap();

        assert_eq!(sent(&plan), ids(&["child", "parent", "extension"]));
        assert!(plan.updates.iter().all(|update| update.requires(RequiredUpdate::Create)));
        assert_eq!(primary(&plan.log), ids(&["child"]));
        assert_eq!(dependent(&plan.log), ids(&["parent", "extension"]));
        assert_eq!(
            plan.log.child_index_tree.outgoing(&CaseId::from("child")).cloned().collect::<Vec<_>>(),
            vec![CaseId::from("parent")]
        );
        assert_eq!(plan.log.device_id.as_deref(), Some("phone-1"));
        assert!(plan.failed_owners.is_empty());
        assert!(!plan.log.had_state_error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clean_owner_resync_sends_only_modified_cases() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([case("c1", "owner-1"), case("c2", "owner-1")]);
        let first = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap();

        let config = SyncEngineConfig::default();
        let planner = BatchedSyncPlanner::new(db.connection(), &store, &config);
        assert_eq!(
            planner.strategy(DOMAIN, "owner-1", Some(&first.log)).await.unwrap(),
            Strategy::Clean
        );

        let second = plan(&db, &store, &request(&["owner-1"]), Some(&first.log))
            .await
            .unwrap();
        assert!(second.updates.is_empty());
        assert_eq!(primary(&second.log), ids(&["c1", "c2"]));
        assert_eq!(second.log.previous_log_id, Some(first.log.id));

        store
            .upsert(Case::new("c2", DOMAIN, "owner-1").modified_at(i64::MAX))
            .await;
        let third = plan(&db, &store, &request(&["owner-1"]), Some(&second.log))
            .await
            .unwrap();
        assert_eq!(sent(&third), ids(&["c2"]));
        assert_eq!(
            update_for(&third, "c2").required_updates,
            BTreeSet::from([RequiredUpdate::Update])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dropped_index_releases_the_parent() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([
            case("child", "owner-1").with_index(CaseIndex::child("parent", "parent")),
            case("parent", "owner-2"),
        ]);
        let first = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap();
        assert_eq!(dependent(&first.log), ids(&["parent"]));

        store
            .upsert(Case::new("child", DOMAIN, "owner-1").modified_at(i64::MAX))
            .await;
        let second = plan(&db, &store, &request(&["owner-1"]), Some(&first.log))
            .await
            .unwrap();

        assert!(second.log.child_index_tree.is_empty());
        assert_eq!(primary(&second.log), ids(&["child"]));
        assert!(dependent(&second.log).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closing_a_held_case_sends_close_and_drops_it() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([case("c1", "owner-1"), case("c2", "owner-1")]);
        let first = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap();

        store
            .upsert(Case::new("c1", DOMAIN, "owner-1").closed().modified_at(i64::MAX))
            .await;
        let second = plan(&db, &store, &request(&["owner-1"]), Some(&first.log))
            .await
            .unwrap();

        assert_eq!(sent(&second), ids(&["c1"]));
        assert!(update_for(&second, "c1").requires(RequiredUpdate::Close));
        assert!(!update_for(&second, "c1").requires(RequiredUpdate::Create));
        assert_eq!(primary(&second.log), ids(&["c2"]));
        assert!(dependent(&second.log).is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_parent_of_open_child_stays_as_dependent() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([
            case("child", "owner-1").with_index(CaseIndex::child("parent", "parent")),
            case("parent", "owner-1"),
        ]);
        let first = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap();

        store
            .upsert(case("parent", "owner-1").closed().modified_at(i64::MAX))
            .await;
        let second = plan(&db, &store, &request(&["owner-1"]), Some(&first.log))
            .await
            .unwrap();

        assert!(update_for(&second, "parent").requires(RequiredUpdate::Close));
        assert_eq!(primary(&second.log), ids(&["child"]));
        assert_eq!(dependent(&second.log), ids(&["parent"]));
        assert!(second.log.closed_case_ids.contains(&CaseId::from("parent")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn closed_case_the_device_never_had_is_not_sent() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([
            case("open", "owner-1"),
            case("closed", "owner-1").closed(),
        ]);
        let first = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap();
        store
            .upsert(case("closed", "owner-1").closed().modified_at(i64::MAX))
            .await;

        let second = plan(&db, &store, &request(&["owner-1"]), Some(&first.log))
            .await
            .unwrap();
        assert!(second.updates.is_empty());
        assert_eq!(primary(&second.log), ids(&["open"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn removing_an_owner_prunes_its_cases() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([
            case("mine", "owner-1"),
            case("group", "group-1").with_index(CaseIndex::child("parent", "group_parent")),
            case("group_parent", "group-1"),
        ]);
        let first = plan(&db, &store, &request(&["owner-1", "group-1"]), None)
            .await
            .unwrap();
        assert_eq!(primary(&first.log), ids(&["mine", "group", "group_parent"]));

        let second = plan(&db, &store, &request(&["owner-1"]), Some(&first.log))
            .await
            .unwrap();
        assert!(second.updates.is_empty());
        assert_eq!(primary(&second.log), ids(&["mine"]));
        assert!(dependent(&second.log).is_empty());
        assert_eq!(second.log.owner_ids_on_phone, BTreeSet::from(["owner-1".to_string()]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shared_dependency_is_sent_once() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([
            case("a", "owner-1").with_index(CaseIndex::child("parent", "shared")),
            case("b", "owner-2").with_index(CaseIndex::child("parent", "shared")),
            case("shared", "owner-3"),
        ]);

        let plan = plan(&db, &store, &request(&["owner-1", "owner-2"]), None)
            .await
            .unwrap();
        let shared = plan
            .updates
            .iter()
            .filter(|update| update.case.case_id.as_str() == "shared")
            .count();
        assert_eq!(shared, 1);
        assert_eq!(plan.updates.len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_owner_is_isolated() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([case("c1", "owner-1")]);
        let long_owner = "o".repeat(200);

        let plan = plan(&db, &store, &request(&["owner-1", &long_owner]), None)
            .await
            .unwrap();
        assert_eq!(sent(&plan), ids(&["c1"]));
        assert_eq!(plan.failed_owners.len(), 1);
        assert_eq!(plan.failed_owners[0].0, long_owner);
        assert_eq!(
            plan.log.owner_ids_on_phone,
            BTreeSet::from(["owner-1".to_string()])
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn store_outage_aborts_the_run() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([case("c1", "owner-1")]);
        store.set_unavailable(true);

        let error = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap_err();
        assert!(matches!(error, Error::BatchFetch(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_run_returns_cancelled() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([case("c1", "owner-1")]);
        let config = SyncEngineConfig::default();
        let planner = BatchedSyncPlanner::new(db.connection(), &store, &config);

        let cancel = CancelHandle::new();
        cancel.cancel();
        let error = planner
            .plan(&request(&["owner-1"]), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(error, Error::Cancelled(_)));

        let expired = CancelHandle::with_timeout(Duration::ZERO);
        assert!(matches!(expired.check(), Err(Error::Cancelled(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dirty_owner_with_valid_hint_uses_footprint() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([
            case("child", "owner-1").with_index(CaseIndex::child("parent", "parent")),
            case("parent", "owner-2"),
        ]);
        let first = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap();

        let config = SyncEngineConfig::default();
        let planner = BatchedSyncPlanner::new(db.connection(), &store, &config);
        assert_eq!(
            planner.strategy(DOMAIN, "owner-1", Some(&first.log)).await.unwrap(),
            Strategy::DirtyHintValid(CaseId::from("child"))
        );

        let second = planner
            .plan(&request(&["owner-1"]), Some(&first.log), &CancelHandle::new())
            .await
            .unwrap();
        assert!(second.updates.is_empty());
        assert_eq!(primary(&second.log), ids(&["child"]));
        assert_eq!(dependent(&second.log), ids(&["parent"]));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_hint_falls_back_to_initial() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([case("c1", "owner-1")]);
        LibSqlCleanlinessRepository::new(db.connection())
            .insert_if_absent(&OwnershipCleanlinessFlag::dirty(
                DOMAIN,
                "owner-1",
                Some(CaseId::from("deleted-long-ago")),
            ))
            .await
            .unwrap();
        let previous = SyncLog::new(DOMAIN, "user-1").with_owners(["owner-1"]);

        let config = SyncEngineConfig::default();
        let planner = BatchedSyncPlanner::new(db.connection(), &store, &config);
        assert_eq!(
            planner.strategy(DOMAIN, "owner-1", Some(&previous)).await.unwrap(),
            Strategy::Initial
        );
        assert!(planner.cleanliness.is_clean(DOMAIN, "owner-1").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleted_held_case_is_pruned() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([case("c1", "owner-1"), case("c2", "owner-1")]);
        let first = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap();

        let mut deleted = case("c1", "owner-1");
        deleted.deleted = true;
        store.upsert(deleted).await;
        store.remove(&CaseId::from("c2")).await;

        let second = plan(&db, &store, &request(&["owner-1"]), Some(&first.log))
            .await
            .unwrap();
        assert!(second.updates.is_empty());
        assert_eq!(second.log.case_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn log_with_state_error_is_rebuilt_from_scratch() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([case("c1", "owner-1")]);
        let mut first = plan(&db, &store, &request(&["owner-1"]), None).await.unwrap().log;
        first.had_state_error = true;

        let second = plan(&db, &store, &request(&["owner-1"]), Some(&first))
            .await
            .unwrap();
        assert_eq!(sent(&second), ids(&["c1"]));
        assert!(update_for(&second, "c1").requires(RequiredUpdate::Create));
        assert_eq!(second.log.previous_log_id, Some(first.id));
        assert!(!second.log.had_state_error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn previous_log_of_another_user_is_rejected() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::new();
        let foreign = SyncLog::new(DOMAIN, "user-2");

        let error = plan(&db, &store, &request(&["owner-1"]), Some(&foreign))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::InvalidInput(_)));
    }

    /// Store that edits one case right after the planner has read it
    struct EditAfterRead {
        inner: MemoryCaseStore,
        edit: tokio::sync::Mutex<Option<CaseId>>,
    }

    impl CaseStore for EditAfterRead {
        async fn get_open_case_ids_by_owner(
            &self,
            domain: &str,
            owner_id: &str,
        ) -> Result<Vec<CaseId>> {
            self.inner.get_open_case_ids_by_owner(domain, owner_id).await
        }

        async fn get_cases_modified_since(
            &self,
            domain: &str,
            owner_id: &str,
            since: i64,
        ) -> Result<Vec<CaseId>> {
            self.inner
                .get_cases_modified_since(domain, owner_id, since)
                .await
        }

        async fn get_indexed_case_ids(
            &self,
            domain: &str,
            case_ids: &[CaseId],
        ) -> Result<Vec<CaseId>> {
            self.inner.get_indexed_case_ids(domain, case_ids).await
        }

        async fn get_extension_case_ids(
            &self,
            domain: &str,
            case_ids: &[CaseId],
            include_closed: bool,
        ) -> Result<Vec<CaseId>> {
            self.inner
                .get_extension_case_ids(domain, case_ids, include_closed)
                .await
        }

        async fn get_reverse_indices(
            &self,
            domain: &str,
            case_ids: &[CaseId],
        ) -> Result<Vec<crate::store::ReverseIndex>> {
            self.inner.get_reverse_indices(domain, case_ids).await
        }

        async fn get_cases(&self, domain: &str, case_ids: &[CaseId]) -> Result<Vec<Case>> {
            let cases = self.inner.get_cases(domain, case_ids).await?;
            let mut edit = self.edit.lock().await;
            if let Some(target) = edit.as_ref().filter(|target| case_ids.contains(target)) {
                if let Some(mut edited) = cases.iter().find(|case| &case.case_id == target).cloned() {
                    edited.case_type = "edited".to_string();
                    edited.server_modified_on = unix_timestamp_millis_now();
                    self.inner.upsert(edited).await;
                    *edit = None;
                }
            }
            Ok(cases)
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn edit_made_while_planning_reaches_the_next_sync() {
        let db = Database::open_in_memory().await.unwrap();
        LibSqlCleanlinessRepository::new(db.connection())
            .insert_if_absent(&OwnershipCleanlinessFlag::clean(DOMAIN, "owner-1"))
            .await
            .unwrap();
        let store = EditAfterRead {
            inner: MemoryCaseStore::with_cases([case("c1", "owner-1")]),
            edit: tokio::sync::Mutex::new(Some(CaseId::from("c1"))),
        };
        let config = SyncEngineConfig::default();
        let planner = BatchedSyncPlanner::new(db.connection(), &store, &config);

        let first = planner
            .plan(&request(&["owner-1"]), None, &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(update_for(&first, "c1").case.case_type, "");
        assert!(store.edit.lock().await.is_none());

        let second = planner
            .plan(&request(&["owner-1"]), Some(&first.log), &CancelHandle::new())
            .await
            .unwrap();
        assert_eq!(sent(&second), ids(&["c1"]));
        assert_eq!(update_for(&second, "c1").case.case_type, "edited");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn dependency_pruned_in_the_same_run_is_not_sent() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([
            case("mine", "owner-1"),
            case("k", "owner-2").with_index(CaseIndex::child("parent", "p")),
            case("p", "owner-3"),
        ]);
        let first = plan(&db, &store, &request(&["owner-1", "owner-2"]), None)
            .await
            .unwrap();
        assert_eq!(dependent(&first.log), ids(&["p"]));

        store
            .upsert(
                case("p", "owner-3")
                    .with_index(CaseIndex::child("parent", "g"))
                    .modified_at(i64::MAX),
            )
            .await;
        store.upsert(case("g", "owner-3")).await;

        let second = plan(&db, &store, &request(&["owner-1"]), Some(&first.log))
            .await
            .unwrap();
        assert_eq!(second.log.held_case_ids(), ids(&["mine"]));
        assert!(!sent(&second).contains(&CaseId::from("g")));
        for update in &second.updates {
            let case_id = &update.case.case_id;
            assert!(second.log.phone_holds(case_id) || first.log.phone_holds(case_id));
            if update.requires(RequiredUpdate::Create) {
                assert!(second.log.phone_holds(case_id), "{case_id} created but not held");
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn owner_ids_are_trimmed_before_planning() {
        let db = Database::open_in_memory().await.unwrap();
        let store = MemoryCaseStore::with_cases([case("c1", "owner-1")]);

        let plan = plan(&db, &store, &request(&[" owner-1 "]), None).await.unwrap();
        assert_eq!(primary(&plan.log), ids(&["c1"]));
        assert!(dependent(&plan.log).is_empty());
        assert_eq!(
            plan.log.owner_ids_on_phone,
            BTreeSet::from(["owner-1".to_string()])
        );
    }
}
