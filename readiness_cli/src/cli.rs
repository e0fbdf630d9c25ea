use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "readiness", version, about = "Readiness data sync")]
pub struct Cli {
    /// SQLite database file.
    #[arg(long, env = "READINESS_DB_PATH", global = true)]
    pub db_path: Option<PathBuf>,

    /// Use a throwaway in-memory store instead of SQLite.
    #[arg(long, global = true)]
    pub memory: bool,

    /// Tenant org id (UUID).
    #[arg(long, env = "READINESS_ORG_ID", global = true)]
    pub org_id: Option<Uuid>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage configured data sources.
    Sources {
        #[command(subcommand)]
        action: SourceCommands,
    },

    /// Verify a source's credentials with a minimal read. Writes nothing.
    Test {
        /// Source id (UUID) or code.
        source: String,
    },

    /// Pull facts from a source and record a sync job.
    Sync {
        /// Source id (UUID) or code.
        source: String,

        /// First day of the range (YYYY-MM-DD). Defaults to the trailing window.
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,

        /// Last day of the range, inclusive.
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },

    /// Ingest a JSON batch (`sales`, `nps`, `hr_events`) into a manual upload source.
    Upload {
        /// Source id (UUID) or code.
        source: String,

        /// Path to the JSON batch file.
        file: PathBuf,
    },

    /// List sync jobs, newest first.
    Jobs {
        /// Only jobs for this source (UUID or code).
        #[arg(long)]
        source: Option<String>,

        /// Only jobs in this status (running, success, error).
        #[arg(long)]
        status: Option<String>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum SourceCommands {
    List {
        #[arg(long, default_value = "100")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Create or update a source keyed on its code.
    Upsert {
        #[arg(long)]
        code: String,

        /// bitrix, odoo, accounting or manual_upload.
        #[arg(long)]
        kind: String,

        #[arg(long)]
        name: String,

        /// Credentials as JSON, e.g. '{"type":"api_key","base_url":"...","api_key":"..."}'.
        #[arg(long, conflicts_with = "credentials_file")]
        credentials: Option<String>,

        /// Read credentials JSON from a file.
        #[arg(long)]
        credentials_file: Option<PathBuf>,

        /// Store the source as inactive.
        #[arg(long)]
        inactive: bool,
    },

    /// Mark a source inactive. Its facts and jobs are kept.
    Deactivate {
        /// Source id (UUID) or code.
        source: String,
    },
}
