use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] casesync_core::Error),
    #[error(transparent)]
    EngineConfig(#[from] casesync_core::ConfigError),
    #[error(transparent)]
    LibSql(#[from] libsql::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid sync log id: {0}")]
    InvalidLogId(String),
    #[error("Invalid index '{0}': expected identifier=referenced_id[:child|:extension]")]
    InvalidIndex(String),
    #[error("Sync log not found: {0}")]
    LogNotFound(String),
    #[error("Case not found: {0}")]
    CaseNotFound(String),
    #[error("Logging setup failed: {0}")]
    Logging(String),
}
