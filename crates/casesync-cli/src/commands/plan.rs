use casesync_core::{CaseSyncUpdate, SyncLogId, SyncPlan, SyncRequest};
use serde::Serialize;

use super::common::{format_update_line, parse_log_id, Service};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct FailedOwner {
    pub owner_id: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct PlanOutput {
    pub log_id: SyncLogId,
    pub previous_log_id: Option<SyncLogId>,
    pub updates: Vec<CaseSyncUpdate>,
    pub failed_owners: Vec<FailedOwner>,
}

impl From<SyncPlan> for PlanOutput {
    fn from(plan: SyncPlan) -> Self {
        Self {
            log_id: plan.log.id,
            previous_log_id: plan.log.previous_log_id,
            updates: plan.updates,
            failed_owners: plan
                .failed_owners
                .into_iter()
                .map(|(owner_id, error)| FailedOwner { owner_id, error })
                .collect(),
        }
    }
}

pub async fn run_plan(
    service: &Service,
    request: &SyncRequest,
    previous: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    let output = plan(service, request, previous).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for failed in &output.failed_owners {
        eprintln!("Skipped owner {}: {}", failed.owner_id, failed.error);
    }
    for update in &output.updates {
        println!("{}", format_update_line(update));
    }
    println!("{} updates, log {}", output.updates.len(), output.log_id);
    Ok(())
}

pub async fn plan(
    service: &Service,
    request: &SyncRequest,
    previous: Option<&str>,
) -> Result<PlanOutput, CliError> {
    let previous = previous.map(parse_log_id).transpose()?;
    Ok(service.plan_sync(request, previous).await?.into())
}
