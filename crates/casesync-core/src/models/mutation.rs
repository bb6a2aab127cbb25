//! Case mutations reported by the form-processing pipeline

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::case::{Case, CaseId, CaseIndex, Relationship};

/// What a single case action did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseAction {
    Create,
    Update,
    Index,
    Close,
}

impl CaseAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Index => "index",
            Self::Close => "close",
        }
    }
}

impl fmt::Display for CaseAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "index" => Ok(Self::Index),
            "close" => Ok(Self::Close),
            other => Err(format!("unknown case action: {other}")),
        }
    }
}

/// An index set or cleared by an `Index` action.
///
/// A missing `referenced_id` clears the identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChange {
    pub identifier: String,
    #[serde(default)]
    pub referenced_id: Option<CaseId>,
    #[serde(default)]
    pub relationship: Relationship,
}

impl IndexChange {
    pub fn set(index: CaseIndex) -> Self {
        Self {
            identifier: index.identifier,
            referenced_id: Some(index.referenced_id),
            relationship: index.relationship,
        }
    }

    pub fn clear(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            referenced_id: None,
            relationship: Relationship::Child,
        }
    }
}

/// One action applied to one case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseMutation {
    pub case_id: CaseId,
    pub action: CaseAction,
    /// Owner asserted by the action, if it set one
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub indices: Vec<IndexChange>,
}

impl CaseMutation {
    pub fn create(case_id: impl Into<CaseId>, owner_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            action: CaseAction::Create,
            owner_id: Some(owner_id.into()),
            indices: Vec::new(),
        }
    }

    pub fn update(case_id: impl Into<CaseId>) -> Self {
        Self {
            case_id: case_id.into(),
            action: CaseAction::Update,
            owner_id: None,
            indices: Vec::new(),
        }
    }

    pub fn reassign(case_id: impl Into<CaseId>, owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: Some(owner_id.into()),
            ..Self::update(case_id)
        }
    }

    pub fn index(case_id: impl Into<CaseId>, indices: Vec<IndexChange>) -> Self {
        Self {
            case_id: case_id.into(),
            action: CaseAction::Index,
            owner_id: None,
            indices,
        }
    }

    pub fn close(case_id: impl Into<CaseId>) -> Self {
        Self {
            case_id: case_id.into(),
            action: CaseAction::Close,
            owner_id: None,
            indices: Vec::new(),
        }
    }
}

/// A case that changed owner or closed, as seen by the cleanliness cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseChangeEvent {
    /// Current state of the case after the change
    pub case: Case,
    /// Owner before the change, when it differs from the current one
    pub previous_owner_id: Option<String>,
}

impl CaseChangeEvent {
    pub const fn new(case: Case) -> Self {
        Self {
            case,
            previous_owner_id: None,
        }
    }

    #[must_use]
    pub fn reassigned_from(mut self, previous_owner_id: impl Into<String>) -> Self {
        self.previous_owner_id = Some(previous_owner_id.into());
        self
    }

    /// Previous owner, only if the case actually moved
    pub fn reassigned_away_from(&self) -> Option<&str> {
        self.previous_owner_id
            .as_deref()
            .filter(|previous| *previous != self.case.owner_id)
    }
}
