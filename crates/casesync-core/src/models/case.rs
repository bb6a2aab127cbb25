//! Case model

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Owner id carried by extension cases that nobody owns directly.
pub const UNOWNED_EXTENSION_OWNER_ID: &str = "-";

/// Identifier of a case in the external case store
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    /// Wrap a raw case id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CaseId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CaseId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl Borrow<str> for CaseId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Kind of index edge between two cases.
///
/// A child needs its parent but the parent does not need the child. An
/// extension and its host need each other.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Relationship {
    #[default]
    Child,
    Extension,
}

impl Relationship {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Child => "child",
            Self::Extension => "extension",
        }
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Relationship {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "child" => Ok(Self::Child),
            "extension" => Ok(Self::Extension),
            other => Err(format!("unknown relationship: {other}")),
        }
    }
}

/// A named reference from one case to another
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaseIndex {
    pub identifier: String,
    pub referenced_id: CaseId,
    #[serde(default)]
    pub relationship: Relationship,
}

impl CaseIndex {
    pub fn child(identifier: impl Into<String>, referenced_id: impl Into<CaseId>) -> Self {
        Self {
            identifier: identifier.into(),
            referenced_id: referenced_id.into(),
            relationship: Relationship::Child,
        }
    }

    pub fn extension(identifier: impl Into<String>, referenced_id: impl Into<CaseId>) -> Self {
        Self {
            identifier: identifier.into(),
            referenced_id: referenced_id.into(),
            relationship: Relationship::Extension,
        }
    }
}

/// A case as read from the case store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Case {
    pub case_id: CaseId,
    pub domain: String,
    #[serde(default)]
    pub case_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub closed: bool,
    /// Soft delete flag; deleted cases never reach a device
    #[serde(default)]
    pub deleted: bool,
    /// Last server-side modification (Unix ms)
    #[serde(default)]
    pub server_modified_on: i64,
    #[serde(default)]
    pub indices: Vec<CaseIndex>,
}

impl Case {
    /// Create an open case with no indices, modified now
    pub fn new(
        case_id: impl Into<CaseId>,
        domain: impl Into<String>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            case_id: case_id.into(),
            domain: domain.into(),
            case_type: String::new(),
            owner_id: owner_id.into(),
            closed: false,
            deleted: false,
            server_modified_on: chrono::Utc::now().timestamp_millis(),
            indices: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_index(mut self, index: CaseIndex) -> Self {
        self.indices.push(index);
        self
    }

    #[must_use]
    pub fn with_case_type(mut self, case_type: impl Into<String>) -> Self {
        self.case_type = case_type.into();
        self
    }

    #[must_use]
    pub fn closed(mut self) -> Self {
        self.closed = true;
        self
    }

    #[must_use]
    pub fn modified_at(mut self, server_modified_on: i64) -> Self {
        self.server_modified_on = server_modified_on;
        self
    }

    /// Whether nobody owns this case directly
    pub fn is_unowned_extension(&self) -> bool {
        self.owner_id == UNOWNED_EXTENSION_OWNER_ID
    }

    /// Indices of one relationship kind
    pub fn indices_of(&self, relationship: Relationship) -> impl Iterator<Item = &CaseIndex> {
        self.indices
            .iter()
            .filter(move |index| index.relationship == relationship)
    }
}

/// Minimal projection of a case kept inside a sync log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseState {
    pub case_id: CaseId,
    #[serde(default)]
    pub case_type: String,
    #[serde(default)]
    pub indices: Vec<CaseIndex>,
}

impl CaseState {
    pub fn new(case_id: impl Into<CaseId>) -> Self {
        Self {
            case_id: case_id.into(),
            case_type: String::new(),
            indices: Vec::new(),
        }
    }

    pub fn from_case(case: &Case) -> Self {
        Self {
            case_id: case.case_id.clone(),
            case_type: case.case_type.clone(),
            indices: case.indices.clone(),
        }
    }
}

impl From<&Case> for CaseState {
    fn from(case: &Case) -> Self {
        Self::from_case(case)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relationship_parses_case_insensitively() {
        assert_eq!("Extension".parse::<Relationship>(), Ok(Relationship::Extension));
        assert_eq!(" child ".parse::<Relationship>(), Ok(Relationship::Child));
        assert!("sibling".parse::<Relationship>().is_err());
    }

    #[test]
    fn case_deserializes_with_defaults() {
        let case: Case = serde_json::from_str(
            r#"{"case_id":"c1","domain":"clinic","owner_id":"u1",
                "indices":[{"identifier":"parent","referenced_id":"p1"}]}"#,
        )
        .unwrap();
        assert!(!case.closed);
        assert!(!case.deleted);
        assert_eq!(case.indices[0].relationship, Relationship::Child);
        assert_eq!(case.indices[0].referenced_id, CaseId::from("p1"));
    }

    #[test]
    fn case_state_keeps_only_identity_and_indices() {
        let case = Case::new("c1", "clinic", "u1")
            .with_case_type("patient")
            .with_index(CaseIndex::extension("host", "h1"));
        let state = CaseState::from_case(&case);
        assert_eq!(state.case_id.as_str(), "c1");
        assert_eq!(state.case_type, "patient");
        assert_eq!(state.indices, vec![CaseIndex::extension("host", "h1")]);
    }

    #[test]
    fn unowned_extension_uses_dash_owner() {
        let case = Case::new("e1", "clinic", UNOWNED_EXTENSION_OWNER_ID);
        assert!(case.is_unowned_extension());
    }
}
