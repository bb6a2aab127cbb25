use std::path::Path;

use casesync_core::Case;

use super::common::Service;
use crate::error::CliError;

pub async fn run_import(service: &Service, path: &Path) -> Result<(), CliError> {
    let count = import_cases(service, path).await?;
    println!("Imported {count} cases");
    Ok(())
}

/// Upsert every case in the JSON array at `path`
pub async fn import_cases(service: &Service, path: &Path) -> Result<usize, CliError> {
    let raw = std::fs::read_to_string(path)?;
    let cases: Vec<Case> = serde_json::from_str(&raw)?;
    Ok(service.store().upsert_cases(&cases).await?)
}
