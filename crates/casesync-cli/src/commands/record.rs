use casesync_core::util::normalize_text_option;
use casesync_core::{CaseAction, CaseId, CaseMutation, IndexChange};

use super::common::{format_log_summary, parse_index_arg, parse_log_id, Service};
use crate::error::CliError;

/// Assemble one mutation from command-line pieces
pub fn build_mutation(
    case_id: &str,
    action: CaseAction,
    owner: Option<String>,
    indices: &[String],
    cleared: &[String],
) -> Result<CaseMutation, CliError> {
    let mut changes = indices
        .iter()
        .map(|raw| parse_index_arg(raw))
        .collect::<Result<Vec<_>, _>>()?;
    changes.extend(cleared.iter().map(|identifier| IndexChange::clear(identifier.trim())));

    Ok(CaseMutation {
        case_id: CaseId::new(case_id.trim()),
        action,
        owner_id: normalize_text_option(owner),
        indices: changes,
    })
}

pub async fn run_record(
    service: &Service,
    log_id: &str,
    mutation: CaseMutation,
    as_json: bool,
) -> Result<(), CliError> {
    let log_id = parse_log_id(log_id)?;
    let log = service.record_mutation(log_id, &[mutation]).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&log)?);
    } else {
        println!("{}", format_log_summary(&log));
    }
    Ok(())
}
