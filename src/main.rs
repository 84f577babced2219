use anyhow::Result;
use clap::Parser;

mod cli;

use cli::commands::counters::{parse_day, CountersCommand};
use cli::commands::init::InitCommand;
use cli::commands::jobs::{JobCommand, JobsCommand};
use cli::commands::maintenance::{DiagramCommand, ReportCommand, ResetCommand, UploadCheckCommand};
use cli::commands::ontology::OntologyCommand;
use cli::commands::reconcile::ReconcileCommand;
use cli::commands::rules::{RulesCheckCommand, RulesImportCommand};
use cli::commands::tracks::{
    CreateCommand, DeleteCommand, HistoryCommand, TagsCommand, TransitionCommand,
};
use cli::commands::{load_config, show_usage};
use cli::{Cli, Commands, JobAction, RulesAction};
use curation_flow::telemetry::init_telemetry;
use curation_flow::workflow::{CounterQuery, JobQuery, Role};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_telemetry(&config.observability)?;

    let runtime = tokio::runtime::Runtime::new()?;

    match cli.command {
        // No subcommand: explain what is available
        None => {
            show_usage();
            Ok(())
        }
        Some(Commands::Create { reference_id, org, tag, actor }) => runtime.block_on(async {
            CreateCommand { reference_id, org, tag, actor }.execute(&config).await
        }),
        Some(Commands::Transition { track_id, to, role, automated, actor }) => {
            runtime.block_on(async {
                TransitionCommand {
                    track_id,
                    to,
                    role: role.map(Role::from),
                    automated,
                    actor,
                }
                .execute(&config)
                .await
            })
        }
        Some(Commands::Delete { track_id, actor }) => runtime.block_on(async {
            DeleteCommand { track_id, actor }.execute(&config).await
        }),
        Some(Commands::Job { action }) => {
            let command = match action {
                JobAction::Start { track_id, actor } => {
                    JobCommand::new(track_id, Role::Start).with_actor(actor)
                }
                JobAction::Succeed { track_id, actor } => {
                    JobCommand::new(track_id, Role::Success).with_actor(actor)
                }
                JobAction::Fail { track_id, actor } => {
                    JobCommand::new(track_id, Role::Failed).with_actor(actor)
                }
            };
            runtime.block_on(async { command.execute(&config).await })
        }
        Some(Commands::Jobs { job, org, limit, offset }) => {
            let mut query = JobQuery::new(job);
            query.org = org;
            query.limit = limit;
            query.offset = offset;
            runtime.block_on(async { JobsCommand { query }.execute(&config).await })
        }
        Some(Commands::Tags { reference_id, org }) => runtime.block_on(async {
            TagsCommand { reference_id, org }.execute(&config).await
        }),
        Some(Commands::History { track_id }) => runtime.block_on(async {
            HistoryCommand { track_id }.execute(&config).await
        }),
        Some(Commands::Counters { org, process, after, before, frequency }) => {
            let query = CounterQuery {
                org,
                process,
                updated_after: after.as_deref().map(parse_day).transpose()?,
                updated_before: before.as_deref().map(parse_day).transpose()?,
                frequency,
            };
            runtime.block_on(async { CountersCommand { query }.execute(&config).await })
        }
        Some(Commands::Report { process, org }) => runtime.block_on(async {
            ReportCommand { process, org }.execute(&config).await
        }),
        Some(Commands::Diagram { org }) => {
            runtime.block_on(async { DiagramCommand { org }.execute(&config).await })
        }
        Some(Commands::Reset { reference_id, org, keep_file_status, actor }) => {
            runtime.block_on(async {
                ResetCommand { reference_id, org, keep_file_status, actor }
                    .execute(&config)
                    .await
            })
        }
        Some(Commands::UploadCheck { reference_id, org }) => runtime.block_on(async {
            UploadCheckCommand { reference_id, org }.execute(&config).await
        }),
        Some(Commands::Reconcile) => {
            runtime.block_on(async { ReconcileCommand.execute(&config).await })
        }
        Some(Commands::Rules { action }) => match action {
            RulesAction::Check { file } => runtime.block_on(async {
                RulesCheckCommand { file }.execute(&config).await
            }),
            RulesAction::Import { file } => runtime.block_on(async {
                RulesImportCommand { file }.execute(&config).await
            }),
        },
        Some(Commands::Ontology { action }) => runtime.block_on(async {
            OntologyCommand { action }.execute(&config).await
        }),
        Some(Commands::Init { path, force }) => InitCommand { path, force }.execute(),
    }
}
