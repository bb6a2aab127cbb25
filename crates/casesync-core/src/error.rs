//! Error types for casesync-core

use thiserror::Error;

/// Result type alias using casesync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in casesync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A mutation implies a prior state the sync log does not have
    #[error("Invalid mutation for case {case_id}: {reason}")]
    InvalidMutation { case_id: String, reason: String },

    /// A cleanliness hint no longer resolves to a case
    #[error("Stale cleanliness hint {hint} for owner {owner_id}")]
    StaleHint { owner_id: String, hint: String },

    /// The case store failed while a planning run was fetching a batch
    #[error("Batch fetch failed: {0}")]
    BatchFetch(String),

    /// Overlapping case sets or dangling index edges in a sync log
    #[error("Graph invariant violated in sync log {log_id}: {detail}")]
    GraphInvariant { log_id: String, detail: String },

    /// Planning was cancelled or ran past its deadline
    #[error("Planning cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Build an `InvalidMutation` error for a case.
    pub fn invalid_mutation(case_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMutation {
            case_id: case_id.into(),
            reason: reason.into(),
        }
    }

    /// Whether planning may skip the failing owner and carry on with the others.
    ///
    /// Store outages and cancellation abandon the whole run instead.
    pub const fn is_owner_recoverable(&self) -> bool {
        matches!(
            self,
            Self::InvalidMutation { .. }
                | Self::StaleHint { .. }
                | Self::GraphInvariant { .. }
                | Self::InvalidInput(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_recoverable_errors_are_graph_and_input_errors() {
        assert!(Error::invalid_mutation("c1", "update of a case not held").is_owner_recoverable());
        assert!(Error::InvalidInput("owner id cannot be empty".to_string()).is_owner_recoverable());
        assert!(!Error::BatchFetch("store offline".to_string()).is_owner_recoverable());
        assert!(!Error::Cancelled("deadline exceeded".to_string()).is_owner_recoverable());
    }

    #[test]
    fn invalid_mutation_message_names_case() {
        let error = Error::invalid_mutation("case-7", "create of a case already held");
        assert_eq!(
            error.to_string(),
            "Invalid mutation for case case-7: create of a case already held"
        );
    }
}
