//! Data models for casesync

mod case;
mod cleanliness;
mod mutation;
mod sync_log_id;
mod sync_update;

pub use case::{
    Case, CaseId, CaseIndex, CaseState, Relationship, UNOWNED_EXTENSION_OWNER_ID,
};
pub use cleanliness::OwnershipCleanlinessFlag;
pub use mutation::{CaseAction, CaseChangeEvent, CaseMutation, IndexChange};
pub use sync_log_id::SyncLogId;
pub use sync_update::{CaseSyncUpdate, RequiredUpdate};
