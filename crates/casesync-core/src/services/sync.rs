//! Thread-safe sync service over one database and one case store.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use libsql::Connection;
use tokio::sync::Mutex;

use crate::cleanliness::CleanlinessCache;
use crate::config::SyncEngineConfig;
use crate::db::{
    CleanlinessRepository, Database, LibSqlCleanlinessRepository, LibSqlSyncLogRepository,
    SyncLogRepository,
};
use crate::error::{Error, Result};
use crate::models::{CaseChangeEvent, CaseMutation, OwnershipCleanlinessFlag, SyncLogId};
use crate::planner::{BatchedSyncPlanner, CancelHandle, SyncPlan, SyncRequest};
use crate::store::CaseStore;
use crate::sync_log::SyncLog;
use crate::util::{validate_domain, validate_owner_id};

type LogLocks = HashMap<SyncLogId, Arc<Mutex<()>>>;

/// Plans syncs, records mutations and maintains cleanliness flags.
///
/// Planning runs never hold the database lock; they work on a clone of the
/// connection. Mutations against one log are serialized by a per-log lock.
pub struct SyncService<S: CaseStore> {
    db: Arc<Mutex<Database>>,
    store: Arc<S>,
    config: SyncEngineConfig,
    log_locks: Arc<Mutex<LogLocks>>,
}

impl<S: CaseStore> Clone for SyncService<S> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            log_locks: Arc::clone(&self.log_locks),
        }
    }
}

impl<S: CaseStore> SyncService<S> {
    pub fn new(db: Database, store: S, config: SyncEngineConfig) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            store: Arc::new(store),
            config,
            log_locks: Arc::default(),
        }
    }

    /// Open the database at `db_path`, creating parent directories
    pub async fn open_path(
        db_path: impl Into<PathBuf>,
        store: S,
        config: SyncEngineConfig,
    ) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&db_path).await?;
        tracing::info!("Opened casesync database at {}", db_path.display());
        Ok(Self::new(db, store, config))
    }

    pub async fn open_in_memory(store: S, config: SyncEngineConfig) -> Result<Self> {
        Ok(Self::new(Database::open_in_memory().await?, store, config))
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub const fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    /// A connection handle that outlives the database lock
    pub async fn connection(&self) -> Connection {
        self.db.lock().await.connection().clone()
    }

    /// Plan a sync, honouring the configured planning timeout
    pub async fn plan_sync(
        &self,
        request: &SyncRequest,
        previous_log_id: Option<SyncLogId>,
    ) -> Result<SyncPlan> {
        let cancel = self
            .config
            .planning_timeout()
            .map_or_else(CancelHandle::new, CancelHandle::with_timeout);
        self.plan_sync_with(request, previous_log_id, &cancel).await
    }

    /// Plan a sync and store the new log once the whole plan is complete
    pub async fn plan_sync_with(
        &self,
        request: &SyncRequest,
        previous_log_id: Option<SyncLogId>,
        cancel: &CancelHandle,
    ) -> Result<SyncPlan> {
        // mutations on the previous log wait until its successor is stored
        let lock = match previous_log_id {
            Some(id) => Some(self.log_lock(id).await),
            None => None,
        };
        let _guard = match &lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let conn = self.connection().await;
        let repo = LibSqlSyncLogRepository::new(&conn);
        let previous = match previous_log_id {
            Some(id) => Some(
                repo.get(&id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("sync log {id}")))?,
            ),
            None => None,
        };

        let planner = BatchedSyncPlanner::new(&conn, self.store.as_ref(), &self.config);
        let plan = planner.plan(request, previous.as_ref(), cancel).await?;
        repo.insert(&plan.log).await?;
        tracing::info!(
            log_id = %plan.log.id,
            user_id = %request.user_id,
            updates = plan.updates.len(),
            "Stored new sync log"
        );
        Ok(plan)
    }

    /// Apply one submission's mutations to a log that has not been superseded
    pub async fn record_mutation(
        &self,
        log_id: SyncLogId,
        mutations: &[CaseMutation],
    ) -> Result<SyncLog> {
        let lock = self.log_lock(log_id).await;
        let _guard = lock.lock().await;

        let conn = self.connection().await;
        let repo = LibSqlSyncLogRepository::new(&conn);
        let mut log = repo
            .get(&log_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync log {log_id}")))?;
        if repo.has_successor(&log_id).await? {
            let case_id = mutations
                .first()
                .map_or_else(String::new, |mutation| mutation.case_id.to_string());
            return Err(Error::invalid_mutation(
                case_id,
                format!("sync log {log_id} has been superseded"),
            ));
        }

        log.apply_mutations(mutations)?;
        if let Err(error) = log.reconcile() {
            repo.update(&log).await?;
            return Err(error);
        }
        repo.update(&log).await?;
        tracing::debug!(log_id = %log_id, mutations = mutations.len(), "Recorded mutations");
        Ok(log)
    }

    /// Tell the cleanliness cache a case changed owner, closed or was re-indexed
    pub async fn mark_case_changed(
        &self,
        domain: &str,
        event: &CaseChangeEvent,
    ) -> Result<Vec<String>> {
        let conn = self.connection().await;
        self.cleanliness(&conn).mark_dirty_if(domain, event).await
    }

    pub async fn get_log(&self, log_id: &SyncLogId) -> Result<Option<SyncLog>> {
        let conn = self.connection().await;
        LibSqlSyncLogRepository::new(&conn).get(log_id).await
    }

    /// Follow `previous_log_id` links from `log_id`, newest first.
    ///
    /// Stops at a missing log, a repeated id or after `limit` logs.
    pub async fn log_chain(&self, log_id: SyncLogId, limit: usize) -> Result<Vec<SyncLog>> {
        let conn = self.connection().await;
        let repo = LibSqlSyncLogRepository::new(&conn);
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut next = Some(log_id);
        while let Some(id) = next {
            if chain.len() >= limit || !seen.insert(id) {
                break;
            }
            let Some(log) = repo.get(&id).await? else {
                tracing::warn!(log_id = %id, "Sync log chain points at a missing log");
                break;
            };
            next = log.previous_log_id;
            chain.push(log);
        }
        Ok(chain)
    }

    pub async fn recent_logs(
        &self,
        domain: &str,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<SyncLog>> {
        let domain = validate_domain(domain)?;
        let conn = self.connection().await;
        LibSqlSyncLogRepository::new(&conn)
            .list_for_user(domain, user_id, limit)
            .await
    }

    pub async fn cleanliness_flag(
        &self,
        domain: &str,
        owner_id: &str,
    ) -> Result<Option<OwnershipCleanlinessFlag>> {
        let conn = self.connection().await;
        self.cleanliness(&conn).get_flag(domain, owner_id).await
    }

    pub async fn cleanliness_flags(&self, domain: &str) -> Result<Vec<OwnershipCleanlinessFlag>> {
        let domain = validate_domain(domain)?;
        let conn = self.connection().await;
        LibSqlCleanlinessRepository::new(&conn).list(domain).await
    }

    /// Recompute an owner's flag from its footprint
    pub async fn rebuild_cleanliness(
        &self,
        domain: &str,
        owner_id: &str,
    ) -> Result<OwnershipCleanlinessFlag> {
        validate_owner_id(owner_id)?;
        let conn = self.connection().await;
        self.cleanliness(&conn).rebuild(domain, owner_id).await
    }

    fn cleanliness<'c>(&'c self, conn: &'c Connection) -> CleanlinessCache<'c, S> {
        CleanlinessCache::new(conn, self.store.as_ref())
            .with_chunk_size(self.config.chunk_size)
            .with_track_new_owners(self.config.track_new_owners)
    }

    async fn log_lock(&self, log_id: SyncLogId) -> Arc<Mutex<()>> {
        let mut locks = self.log_locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(locks.entry(log_id).or_default())
    }
}
