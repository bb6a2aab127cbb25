use std::env;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use casesync_core::db::Database;
use casesync_core::store::LibSqlCaseStore;
use casesync_core::{
    CaseIndex, CaseSyncUpdate, IndexChange, OwnershipCleanlinessFlag, Relationship,
    SyncEngineConfig, SyncLog, SyncLogId,
};
use chrono::{TimeZone, Utc};

use crate::error::CliError;

pub type Service = casesync_core::SyncService<LibSqlCaseStore>;

pub fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("CASESYNC_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("casesync")
        .join("casesync.db")
}

/// Engine settings from `--config` when given, otherwise from the environment
pub fn resolve_engine_config(config_path: Option<&Path>) -> Result<SyncEngineConfig, CliError> {
    let config = match config_path {
        Some(path) => SyncEngineConfig::load_from_path(path)?,
        None => SyncEngineConfig::from_env()?,
    };
    Ok(config)
}

/// Open the database and a case store sharing its connection
pub async fn open_service(path: &Path, config: SyncEngineConfig) -> Result<Service, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::open(path).await?;
    let store = LibSqlCaseStore::new(db.connection().clone());
    Ok(Service::new(db, store, config))
}

pub fn parse_log_id(raw: &str) -> Result<SyncLogId, CliError> {
    SyncLogId::from_str(raw).map_err(|_| CliError::InvalidLogId(raw.trim().to_string()))
}

/// Parse `identifier=referenced_id[:child|:extension]`
pub fn parse_index_arg(raw: &str) -> Result<IndexChange, CliError> {
    let invalid = || CliError::InvalidIndex(raw.to_string());
    let (identifier, target) = raw.split_once('=').ok_or_else(invalid)?;
    let identifier = identifier.trim();
    let (referenced_id, relationship) = match target.rsplit_once(':') {
        Some((referenced_id, relationship)) => (
            referenced_id.trim(),
            Relationship::from_str(relationship).map_err(|_| invalid())?,
        ),
        None => (target.trim(), Relationship::Child),
    };
    if identifier.is_empty() || referenced_id.is_empty() {
        return Err(invalid());
    }

    let index = match relationship {
        Relationship::Child => CaseIndex::child(identifier, referenced_id),
        Relationship::Extension => CaseIndex::extension(identifier, referenced_id),
    };
    Ok(IndexChange::set(index))
}

pub fn format_timestamp(ms: i64) -> String {
    Utc.timestamp_millis_opt(ms)
        .single()
        .map_or_else(
            || ms.to_string(),
            |at| at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        )
}

pub fn format_update_line(update: &CaseSyncUpdate) -> String {
    let actions = update
        .required_updates
        .iter()
        .map(|required| format!("{required:?}").to_lowercase())
        .collect::<Vec<_>>()
        .join(",");
    format!("{}  {actions}", update.case.case_id)
}

pub fn format_log_summary(log: &SyncLog) -> String {
    let mut line = format!(
        "{}  {}  user={} primary={} dependent={}",
        log.id,
        format_timestamp(log.date),
        log.user_id,
        log.case_ids_on_phone.len(),
        log.dependent_case_ids_on_phone.len(),
    );
    if log.had_state_error {
        line.push_str("  state-error");
    }
    line
}

pub fn format_flag_line(flag: &OwnershipCleanlinessFlag) -> String {
    let state = if flag.is_clean { "clean" } else { "dirty" };
    let mut line = format!(
        "{}  {state}  checked {}",
        flag.owner_id,
        format_timestamp(flag.last_checked)
    );
    if let Some(hint) = &flag.hint {
        let _ = write!(line, "  hint={hint}");
    }
    line
}
