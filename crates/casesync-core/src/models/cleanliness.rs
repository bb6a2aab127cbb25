//! Ownership cleanliness flag model

use serde::{Deserialize, Serialize};

use super::case::CaseId;

/// Whether an owner's footprint is known to contain only its own cases.
///
/// A dirty flag carries a hint: a case whose current state proves the
/// footprint reaches cases owned by somebody else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnershipCleanlinessFlag {
    pub domain: String,
    pub owner_id: String,
    pub is_clean: bool,
    #[serde(default)]
    pub hint: Option<CaseId>,
    /// Last time the flag was computed or written (Unix ms)
    pub last_checked: i64,
}

impl OwnershipCleanlinessFlag {
    /// A clean flag checked now
    pub fn clean(domain: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            owner_id: owner_id.into(),
            is_clean: true,
            hint: None,
            last_checked: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// A dirty flag with the given hint, checked now
    pub fn dirty(
        domain: impl Into<String>,
        owner_id: impl Into<String>,
        hint: Option<CaseId>,
    ) -> Self {
        Self {
            is_clean: false,
            hint,
            ..Self::clean(domain, owner_id)
        }
    }
}
