use std::path::PathBuf;

use casesync_core::CaseAction;
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "casesync")]
#[command(about = "Plan and inspect case syncs for offline devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// Engine settings file (JSON); environment variables are used when omitted
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Load cases from a JSON array into the local case store
    Import {
        /// JSON file holding the cases
        path: PathBuf,
    },
    /// Plan a sync for a user and store the resulting log
    Plan {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        device: Option<String>,
        /// Owner the device syncs for (repeatable)
        #[arg(long = "owner", value_name = "OWNER_ID", required = true)]
        owners: Vec<String>,
        /// Log returned by the device's previous sync
        #[arg(long, value_name = "LOG_ID")]
        previous: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a case action submitted from a device against its sync log
    Record {
        #[arg(long, value_name = "LOG_ID")]
        log: String,
        #[arg(long = "case", value_name = "CASE_ID")]
        case_id: String,
        /// create, update, index or close
        #[arg(long)]
        action: CaseAction,
        /// Owner asserted by the action
        #[arg(long)]
        owner: Option<String>,
        /// Index to set, as identifier=referenced_id[:child|:extension] (repeatable)
        #[arg(long = "index", value_name = "INDEX")]
        indices: Vec<String>,
        /// Index identifier to clear (repeatable)
        #[arg(long = "clear", value_name = "IDENTIFIER")]
        cleared: Vec<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Inspect stored sync logs
    Log {
        #[command(subcommand)]
        command: LogCommands,
    },
    /// Inspect and maintain ownership cleanliness flags
    Cleanliness {
        #[command(subcommand)]
        command: CleanlinessCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Subcommand)]
pub enum LogCommands {
    /// Show one sync log
    Show {
        id: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Walk a log's chain of previous logs, newest first
    Chain {
        id: String,
        /// Maximum number of logs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// List a user's most recent logs
    List {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        user: String,
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum CleanlinessCommands {
    /// Show an owner's flag
    Show {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        owner: String,
    },
    /// Recompute an owner's flag from its footprint
    Rebuild {
        #[arg(long)]
        domain: String,
        #[arg(long)]
        owner: String,
    },
    /// List every flag in a domain
    List {
        #[arg(long)]
        domain: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Report a changed case so affected owners are marked dirty
    Mark {
        #[arg(long)]
        domain: String,
        #[arg(long = "case", value_name = "CASE_ID")]
        case_id: String,
        /// Owner before a reassignment
        #[arg(long)]
        previous_owner: Option<String>,
    },
}
