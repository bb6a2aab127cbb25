//! casesync-core - case synchronization consistency engine
//!
//! Decides which cases an offline device must receive on each sync and
//! keeps a per-device sync log of what it holds, so the next sync can be
//! planned incrementally. The case store is an external collaborator behind
//! the [`store::CaseStore`] trait; logs and cleanliness flags live in libSQL.

pub mod classifier;
pub mod cleanliness;
pub mod config;
pub mod db;
pub mod error;
pub mod footprint;
pub mod graph;
pub mod models;
pub mod planner;
pub mod services;
pub mod store;
pub mod sync_log;
pub mod util;

pub use cleanliness::{CleanlinessCache, Revalidation};
pub use config::{ConfigError, SyncEngineConfig};
pub use error::{Error, Result};
pub use models::{
    Case, CaseAction, CaseChangeEvent, CaseId, CaseIndex, CaseMutation, CaseState,
    CaseSyncUpdate, IndexChange, OwnershipCleanlinessFlag, Relationship, RequiredUpdate,
    SyncLogId,
};
pub use planner::{CancelHandle, SyncPlan, SyncRequest};
pub use services::SyncService;
pub use sync_log::SyncLog;
