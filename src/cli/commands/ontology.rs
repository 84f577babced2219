use anyhow::Result;

use crate::cli::commands::build_resolver;
use crate::cli::OntologyAction;
use curation_flow::config::CurationFlowConfig;

pub struct OntologyCommand {
    pub action: OntologyAction,
}

impl OntologyCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        let resolver = build_resolver(config)?;

        match &self.action {
            OntologyAction::Name { id } => {
                println!("🏷️  {} = {}", id, resolver.resolve_name(id).await);
            }
            OntologyAction::Root { tag } => match resolver.process_root_of(tag).await? {
                Some(root) => {
                    let name = resolver.resolve_name(&root).await;
                    println!("🧭 {} belongs to {} ({})", tag, name, root);
                }
                None => println!("🧭 {} is not under any configured process root", tag),
            },
            OntologyAction::Under { tag } => {
                let tags = resolver.tags_under(tag).await?;
                println!("🌳 {} tag(s) under {}:", tags.len(), tag);
                for child in tags {
                    println!("   {} ({})", resolver.resolve_name(&child).await, child);
                }
            }
            OntologyAction::Jobs { name, org } => {
                let jobs = resolver.jobs_to_run(name, org).await?;
                if jobs.is_empty() {
                    println!("🧰 No jobs to run for {} in {}", name, org);
                } else {
                    println!("🧰 Jobs for {} in {}:", name, org);
                    for job in jobs {
                        println!("   → {} ({})", resolver.resolve_name(&job).await, job);
                    }
                }
            }
        }
        Ok(())
    }
}
