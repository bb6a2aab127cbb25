//! Services shared by the CLI and embedding hosts

mod sync;

pub use sync::SyncService;
