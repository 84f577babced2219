use anyhow::{anyhow, Result};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use curation_flow::config::{config, CurationFlowConfig};
use curation_flow::ontology::{HttpOntologyClient, OntologyResolver, ResolverSettings};
use curation_flow::workflow::{
    ActionRegistry, EngineSettings, ErrorKind, JobFamilies, RequirementRegistry, StateStore,
    TransitionEngine, WorkflowError,
};

pub mod counters;
pub mod init;
pub mod jobs;
pub mod maintenance;
pub mod ontology;
pub mod reconcile;
pub mod rules;
pub mod tracks;

/// The explicit file when given, the global layered configuration otherwise.
pub fn load_config(path: Option<&Path>) -> Result<CurationFlowConfig> {
    match path {
        Some(path) => CurationFlowConfig::load_with_file(Some(path)),
        None => Ok(config()?.clone()),
    }
}

pub fn build_resolver(config: &CurationFlowConfig) -> Result<Arc<OntologyResolver>> {
    let client = HttpOntologyClient::new(&config.ontology)?;
    Ok(Arc::new(OntologyResolver::new(
        Arc::new(client),
        ResolverSettings::from(&config.ontology),
    )))
}

pub fn job_families(config: &CurationFlowConfig) -> Arc<JobFamilies> {
    Arc::new(JobFamilies::with_overrides(config.workflow.job_families.clone()))
}

pub fn registries(config: &CurationFlowConfig) -> Result<(RequirementRegistry, ActionRegistry)> {
    let settings = EngineSettings::from_config(&config.workflow, &config.ontology)?;
    Ok((
        RequirementRegistry::with_builtins(),
        ActionRegistry::builtins(settings.tag_pattern, job_families(config)),
    ))
}

#[cfg(feature = "database")]
pub async fn open_store(config: &CurationFlowConfig) -> Result<Arc<dyn StateStore>> {
    let database = config
        .database
        .as_ref()
        .ok_or_else(|| anyhow!("No [database] section in the configuration"))?;
    Ok(Arc::new(curation_flow::database::SqliteStore::connect(database).await?))
}

#[cfg(not(feature = "database"))]
pub async fn open_store(_config: &CurationFlowConfig) -> Result<Arc<dyn StateStore>> {
    Err(anyhow!(
        "curation-flow was built without the `database` feature; rebuild with --features database"
    ))
}

pub async fn build_engine(config: &CurationFlowConfig) -> Result<Arc<TransitionEngine>> {
    let store = open_store(config).await?;
    let ontology = build_resolver(config)?;
    let (requirements, actions) = registries(config)?;
    let settings = EngineSettings::from_config(&config.workflow, &config.ontology)?;

    Ok(Arc::new(
        TransitionEngine::new(store, ontology)
            .with_requirements(requirements)
            .with_actions(actions)
            .with_settings(settings),
    ))
}

pub async fn with_engine<F, Fut, R>(config: &CurationFlowConfig, f: F) -> Result<R>
where
    F: FnOnce(Arc<TransitionEngine>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    print!("🔄 Connecting to workflow store... ");
    std::io::Write::flush(&mut std::io::stdout())?;

    match build_engine(config).await {
        Ok(engine) => {
            println!("✅");
            f(engine).await
        }
        Err(e) => {
            println!("❌");
            Err(e)
        }
    }
}

/// One-line suggestion printed under a failed workflow operation.
pub fn hint(err: &WorkflowError) -> &'static str {
    match err.kind() {
        ErrorKind::NotFound => "💡 Check the id with: curation-flow tags <reference_id> <org>",
        ErrorKind::Rejected => "💡 The transition exists but its checks refused this request",
        ErrorKind::InvalidConfiguration => "💡 Validate the transition table with: curation-flow rules check",
        ErrorKind::ServiceUnavailable => "💡 The ontology service could not be reached; retry later",
        ErrorKind::Conflict => "💡 The track changed concurrently; re-read it and retry",
        ErrorKind::Internal => "💡 See the log output above for details",
    }
}

pub fn show_usage() {
    println!("🏷️  curation-flow - workflow tags for literature curation");
    println!();
    println!("Curators:");
    println!("  📋 curation-flow tags <reference_id> <org>        # Where a reference stands");
    println!("  ➡️  curation-flow transition <track_id> --to <tag>  # Move a track");
    println!("  📜 curation-flow history <track_id>                # Version log");
    println!();
    println!("Workers:");
    println!("  🧰 curation-flow jobs <job>                        # Work waiting for a job");
    println!("  ▶️  curation-flow job start|succeed|fail <track_id> # Report progress");
    println!();
    println!("Admin:");
    println!("  🧹 curation-flow reconcile                         # Sweep stuck jobs");
    println!("  📊 curation-flow report <process> <org>            # Job family status breakdown");
    println!("  ♻️  curation-flow reset <reference_id> <org>        # Reset after main file removal");
    println!("  📐 curation-flow rules check                       # Validate the transition table");
    println!("  ⚙️  curation-flow init                              # Write a default configuration");
}
