use casesync_core::store::CaseStore;
use casesync_core::{CaseChangeEvent, CaseId};

use super::common::{format_flag_line, Service};
use crate::error::CliError;

pub async fn run_cleanliness_show(
    service: &Service,
    domain: &str,
    owner_id: &str,
) -> Result<(), CliError> {
    match service.cleanliness_flag(domain, owner_id).await? {
        Some(flag) => println!("{}", format_flag_line(&flag)),
        None => println!("{owner_id}  untracked"),
    }
    Ok(())
}

pub async fn run_cleanliness_rebuild(
    service: &Service,
    domain: &str,
    owner_id: &str,
) -> Result<(), CliError> {
    let flag = service.rebuild_cleanliness(domain, owner_id).await?;
    println!("{}", format_flag_line(&flag));
    Ok(())
}

pub async fn run_cleanliness_list(
    service: &Service,
    domain: &str,
    as_json: bool,
) -> Result<(), CliError> {
    let flags = service.cleanliness_flags(domain).await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&flags)?);
    } else {
        for flag in &flags {
            println!("{}", format_flag_line(flag));
        }
    }
    Ok(())
}

pub async fn run_cleanliness_mark(
    service: &Service,
    domain: &str,
    case_id: &str,
    previous_owner: Option<&str>,
) -> Result<(), CliError> {
    let dirtied = mark_case(service, domain, case_id, previous_owner).await?;
    if dirtied.is_empty() {
        println!("No owners marked dirty");
    }
    for owner_id in dirtied {
        println!("{owner_id}  dirty");
    }
    Ok(())
}

/// Load a case from the store and report it changed. Returns the owners marked dirty.
pub async fn mark_case(
    service: &Service,
    domain: &str,
    case_id: &str,
    previous_owner: Option<&str>,
) -> Result<Vec<String>, CliError> {
    let case_id = CaseId::new(case_id.trim());
    let case = service
        .store()
        .get_case(domain, &case_id)
        .await?
        .ok_or_else(|| CliError::CaseNotFound(case_id.to_string()))?;

    let mut event = CaseChangeEvent::new(case);
    if let Some(previous_owner) = previous_owner {
        event = event.reassigned_from(previous_owner);
    }
    Ok(service.mark_case_changed(domain, &event).await?)
}
