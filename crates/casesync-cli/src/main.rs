//! casesync CLI - plan and inspect case syncs from the command line
//!
//! Works against a local libSQL database holding both the case store and
//! the engine's sync logs and cleanliness flags.

mod cli;
mod commands;
mod error;


use casesync_core::SyncRequest;
use clap::Parser;

use crate::cli::{CleanlinessCommands, Cli, Commands, LogCommands};
use crate::commands::cleanliness::{
    run_cleanliness_list, run_cleanliness_mark, run_cleanliness_rebuild, run_cleanliness_show,
};
use crate::commands::common::{open_service, resolve_db_path, resolve_engine_config};
use crate::commands::completions::run_completions;
use crate::commands::import::run_import;
use crate::commands::log::{run_log_chain, run_log_list, run_log_show};
use crate::commands::plan::run_plan;
use crate::commands::record::{build_mutation, run_record};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let directive = "casesync=info"
        .parse::<tracing_subscriber::filter::Directive>()
        .map_err(|error| CliError::Logging(format!("{error}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let db_path = resolve_db_path(cli.db_path);
    let config = resolve_engine_config(cli.config.as_deref())?;
    let service = open_service(&db_path, config).await?;

    match cli.command {
        Commands::Import { path } => run_import(&service, &path).await?,
        Commands::Plan {
            domain,
            user,
            device,
            owners,
            previous,
            json,
        } => {
            let mut request = SyncRequest::new(domain, user).with_owners(owners);
            if let Some(device) = device {
                request = request.with_device(device);
            }
            run_plan(&service, &request, previous.as_deref(), json).await?;
        }
        Commands::Record {
            log,
            case_id,
            action,
            owner,
            indices,
            cleared,
            json,
        } => {
            let mutation = build_mutation(&case_id, action, owner, &indices, &cleared)?;
            run_record(&service, &log, mutation, json).await?;
        }
        Commands::Log { command } => match command {
            LogCommands::Show { id, json } => run_log_show(&service, &id, json).await?,
            LogCommands::Chain { id, limit } => run_log_chain(&service, &id, limit).await?,
            LogCommands::List {
                domain,
                user,
                limit,
                json,
            } => run_log_list(&service, &domain, &user, limit, json).await?,
        },
        Commands::Cleanliness { command } => match command {
            CleanlinessCommands::Show { domain, owner } => {
                run_cleanliness_show(&service, &domain, &owner).await?;
            }
            CleanlinessCommands::Rebuild { domain, owner } => {
                run_cleanliness_rebuild(&service, &domain, &owner).await?;
            }
            CleanlinessCommands::List { domain, json } => {
                run_cleanliness_list(&service, &domain, json).await?;
            }
            CleanlinessCommands::Mark {
                domain,
                case_id,
                previous_owner,
            } => {
                run_cleanliness_mark(&service, &domain, &case_id, previous_owner.as_deref())
                    .await?;
            }
        },
        Commands::Completions { .. } => {}
    }

    Ok(())
}
