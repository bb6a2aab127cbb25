//! Database layer for casesync

mod cleanliness_repository;
mod connection;
mod migrations;
mod sync_log_repository;

pub use cleanliness_repository::{CleanlinessRepository, LibSqlCleanlinessRepository};
pub use connection::Database;
pub use sync_log_repository::{LibSqlSyncLogRepository, SyncLogRepository};
