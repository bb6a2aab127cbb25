//! Labels a case with the changes a device must apply for it.

use std::collections::BTreeSet;

use crate::models::{Case, CaseState, CaseSyncUpdate, RequiredUpdate};
use crate::sync_log::SyncLog;

/// Required updates for `case` relative to what `previous_log` says the device holds
pub fn classify(case: &Case, previous_log: Option<&SyncLog>) -> BTreeSet<RequiredUpdate> {
    let mut updates = BTreeSet::from([RequiredUpdate::Update]);
    if !previous_log.is_some_and(|log| log.phone_holds(&case.case_id)) {
        updates.insert(RequiredUpdate::Create);
    }
    if case.closed {
        updates.insert(RequiredUpdate::Close);
    }
    updates
}

/// Build the update for `case`, or `None` when there is nothing to send
pub fn sync_update(case: &Case, previous_log: Option<&SyncLog>) -> Option<CaseSyncUpdate> {
    let required_updates = classify(case, previous_log);
    if required_updates.is_empty() {
        return None;
    }
    Some(CaseSyncUpdate {
        case: CaseState::from_case(case),
        required_updates,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CaseIndex;
    use pretty_assertions::assert_eq;

    #[test]
    fn first_sync_creates_everything() {
        let case = Case::new("c1", "clinic", "owner-1");
        assert_eq!(
            classify(&case, None),
            BTreeSet::from([RequiredUpdate::Create, RequiredUpdate::Update])
        );
    }

    #[test]
    fn held_case_is_only_updated() {
        let case = Case::new("c1", "clinic", "owner-1");
        let mut log = SyncLog::new("clinic", "user-1");
        log.add_dependent(CaseState::new("c1"));

        assert_eq!(
            classify(&case, Some(&log)),
            BTreeSet::from([RequiredUpdate::Update])
        );
    }

    #[test]
    fn closed_case_not_yet_held_is_created_and_closed() {
        let case = Case::new("c1", "clinic", "owner-1").closed();
        let log = SyncLog::new("clinic", "user-1");

        let update = sync_update(&case, Some(&log)).unwrap();
        assert!(update.requires(RequiredUpdate::Create));
        assert!(update.requires(RequiredUpdate::Update));
        assert!(update.requires(RequiredUpdate::Close));
    }

    #[test]
    fn update_carries_indices_but_not_ownership() {
        let case = Case::new("child", "clinic", "owner-1")
            .with_case_type("visit")
            .with_index(CaseIndex::child("parent", "mother"));

        let update = sync_update(&case, None).unwrap();
        assert_eq!(update.case.case_type, "visit");
        assert_eq!(update.case.indices, vec![CaseIndex::child("parent", "mother")]);
    }
}
