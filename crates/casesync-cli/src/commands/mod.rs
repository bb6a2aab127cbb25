pub mod cleanliness;
pub mod common;
pub mod completions;
pub mod import;
pub mod log;
pub mod plan;
pub mod record;
