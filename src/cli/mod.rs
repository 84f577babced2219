use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use curation_flow::workflow::{DateFrequency, Role};

pub mod commands;

#[derive(Parser)]
#[command(name = "curation-flow")]
#[command(about = "Workflow tag transitions for literature curation")]
#[command(long_about = "curation-flow moves (reference, organization) curation tracks between ontology \
                       workflow tags according to the transition table, drives job start/success/failure \
                       for automated workers and sweeps stuck jobs. Start with 'curation-flow tags' to see \
                       where a reference stands.")]
pub struct Cli {
    /// Configuration file used instead of curation-flow.toml
    #[arg(long, global = true, help = "Path to a TOML configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum RoleArg {
    Start,
    Success,
    Failed,
    Retry,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Start => Role::Start,
            RoleArg::Success => Role::Success,
            RoleArg::Failed => Role::Failed,
            RoleArg::Retry => Role::Retry,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new workflow track for a reference and organization
    Create {
        reference_id: i64,
        org: String,
        /// Initial workflow tag, e.g. ATP:0000141
        tag: String,
        #[arg(long, help = "Actor recorded in the version log")]
        actor: Option<String>,
    },
    /// Move a track to a new tag, or to the target of a role
    Transition {
        track_id: i64,
        /// Target tag
        #[arg(long, conflicts_with = "role", required_unless_present = "role")]
        to: Option<String>,
        /// Target by job role instead of by tag
        #[arg(long, value_enum)]
        role: Option<RoleArg>,
        /// Act as an automated worker rather than a curator
        #[arg(long, help = "Caller is an automated worker (default: manual curator)")]
        automated: bool,
        #[arg(long, help = "Actor recorded in the version log")]
        actor: Option<String>,
    },
    /// Delete a track
    Delete {
        track_id: i64,
        #[arg(long, help = "Actor recorded in the version log")]
        actor: Option<String>,
    },
    /// Report job progress as an automated worker
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// List tracks waiting for a job
    Jobs {
        /// Job name fragment, e.g. text_convert
        job: String,
        #[arg(long)]
        org: Option<String>,
        #[arg(long, default_value = "100", help = "Page size (at most 1000)")]
        limit: usize,
        #[arg(long, default_value = "0")]
        offset: usize,
    },
    /// Show the current tags of a reference for one organization
    Tags { reference_id: i64, org: String },
    /// Show the version log of a track
    History { track_id: i64 },
    /// Count tracks per tag
    Counters {
        #[arg(long)]
        org: Option<String>,
        /// Only tags below this process tag
        #[arg(long)]
        process: Option<String>,
        /// Only rows updated on or after this day (YYYY-MM-DD)
        #[arg(long)]
        after: Option<String>,
        /// Only rows updated before this day (YYYY-MM-DD)
        #[arg(long)]
        before: Option<String>,
        /// Bucket by year, month or week of last update
        #[arg(long)]
        frequency: Option<DateFrequency>,
    },
    /// Status breakdown of a job family for one organization
    Report {
        /// Main tag of the job family, e.g. ATP:0000165
        process: String,
        org: String,
    },
    /// Transition table as tags and the tags they lead to
    Diagram {
        #[arg(long, help = "Only rules that apply to this organization")]
        org: Option<String>,
    },
    /// Reset tracks after the main file of a reference was removed
    Reset {
        reference_id: i64,
        org: String,
        #[arg(long, help = "Leave the file upload track untouched")]
        keep_file_status: bool,
        #[arg(long, help = "Actor recorded in the version log")]
        actor: Option<String>,
    },
    /// Check whether a running job blocks a new file upload
    UploadCheck { reference_id: i64, org: String },
    /// Retry or fail jobs that have not moved within their window
    Reconcile,
    /// Inspect and load the transition table
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },
    /// Query the ontology behind workflow tags
    Ontology {
        #[command(subcommand)]
        action: OntologyAction,
    },
    /// Write a configuration file with the default settings
    Init {
        #[arg(long, default_value = "curation-flow.toml")]
        path: PathBuf,
        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum JobAction {
    /// Move a track to its in-progress tag
    Start {
        track_id: i64,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Move a track to its success tag
    Succeed {
        track_id: i64,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Move a track to its failed tag
    Fail {
        track_id: i64,
        #[arg(long)]
        actor: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum RulesAction {
    /// Validate a transition table (from a TOML file, or the store when omitted)
    Check {
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Validate a TOML transition table and write it to the store
    Import { file: PathBuf },
}

#[derive(Subcommand)]
pub enum OntologyAction {
    /// Display name of a term
    Name { id: String },
    /// Process root a tag belongs to
    Root { tag: String },
    /// Every tag below a tag
    Under { tag: String },
    /// Jobs to run for a process name or id
    Jobs { name: String, org: String },
}
