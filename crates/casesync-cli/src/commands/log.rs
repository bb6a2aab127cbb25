use casesync_core::SyncLog;

use super::common::{format_log_summary, format_timestamp, parse_log_id, Service};
use crate::error::CliError;

pub async fn run_log_show(service: &Service, id: &str, as_json: bool) -> Result<(), CliError> {
    let log_id = parse_log_id(id)?;
    let log = service
        .get_log(&log_id)
        .await?
        .ok_or_else(|| CliError::LogNotFound(log_id.to_string()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&log)?);
    } else {
        for line in format_log_detail(&log) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_log_chain(service: &Service, id: &str, limit: usize) -> Result<(), CliError> {
    let log_id = parse_log_id(id)?;
    let chain = service.log_chain(log_id, limit).await?;
    if chain.is_empty() {
        return Err(CliError::LogNotFound(log_id.to_string()));
    }
    for log in &chain {
        println!("{}", format_log_summary(log));
    }
    Ok(())
}

pub async fn run_log_list(
    service: &Service,
    domain: &str,
    user_id: &str,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let logs = service.recent_logs(domain, user_id, limit).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&logs)?);
    } else if logs.is_empty() {
        println!("No sync logs for {user_id} in {domain}");
    } else {
        for log in &logs {
            println!("{}", format_log_summary(log));
        }
    }
    Ok(())
}

pub fn format_log_detail(log: &SyncLog) -> Vec<String> {
    let mut lines = vec![
        format!("id:        {}", log.id),
        format!("domain:    {}", log.domain),
        format!("user:      {}", log.user_id),
        format!("device:    {}", log.device_id.as_deref().unwrap_or("-")),
        format!("date:      {}", format_timestamp(log.date)),
        format!(
            "previous:  {}",
            log.previous_log_id
                .map_or_else(|| "-".to_string(), |id| id.to_string())
        ),
        format!(
            "owners:    {}",
            log.owner_ids_on_phone.iter().cloned().collect::<Vec<_>>().join(", ")
        ),
    ];
    if log.had_state_error {
        lines.push("state:     error, next sync rebuilds from scratch".to_string());
    }
    lines.extend(
        log.case_ids_on_phone
            .keys()
            .map(|case_id| format!("  primary    {case_id}")),
    );
    lines.extend(
        log.dependent_case_ids_on_phone
            .keys()
            .map(|case_id| format!("  dependent  {case_id}")),
    );
    lines
}
