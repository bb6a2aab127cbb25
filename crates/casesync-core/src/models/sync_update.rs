//! Per-case output of a planning run

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::case::CaseState;

/// Change a device must apply for one case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredUpdate {
    Create,
    Update,
    Close,
}

/// How a case should sync down to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseSyncUpdate {
    pub case: CaseState,
    pub required_updates: BTreeSet<RequiredUpdate>,
}

impl CaseSyncUpdate {
    pub fn requires(&self, update: RequiredUpdate) -> bool {
        self.required_updates.contains(&update)
    }
}
