use anyhow::Result;

use crate::cli::commands::{hint, with_engine};
use curation_flow::config::CurationFlowConfig;
use curation_flow::workflow::{JobLifecycle, JobQuery, Role, TrackId};

pub struct JobCommand {
    pub track_id: TrackId,
    pub role: Role,
    pub actor: Option<String>,
}

impl JobCommand {
    pub fn new(track_id: TrackId, role: Role) -> Self {
        Self {
            track_id,
            role,
            actor: None,
        }
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            let mut lifecycle = JobLifecycle::new(engine.clone());
            if let Some(actor) = &self.actor {
                lifecycle = lifecycle.with_actor(actor.clone());
            }

            let result = match self.role {
                Role::Start => lifecycle.start(self.track_id).await,
                Role::Success => lifecycle.succeed(self.track_id).await,
                Role::Failed => lifecycle.fail(self.track_id).await,
                Role::Retry => {
                    return Err(anyhow::anyhow!(
                        "Retries are issued by the reconciler, not by workers"
                    ))
                }
            };

            match result {
                Ok(state) => {
                    let name = engine.ontology().resolve_name(&state.tag).await;
                    println!("✅ Track {} ({}): now at {} ({})", state.id, self.role, name, state.tag);
                    Ok(())
                }
                Err(e) => {
                    println!("❌ {}", e);
                    println!("{}", hint(&e));
                    Err(e.into())
                }
            }
        })
        .await
    }
}

pub struct JobsCommand {
    pub query: JobQuery,
}

impl JobsCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            let entries = JobLifecycle::new(engine).jobs(&self.query).await?;
            println!();
            if entries.is_empty() {
                println!("📋 No tracks waiting for '{}'", self.query.job);
                return Ok(());
            }

            println!("🧰 WAITING FOR '{}' ({} shown):", self.query.job, entries.len());
            for entry in &entries {
                println!(
                    "   🎯 Track {} | reference {} | {} | {} ({})",
                    entry.track_id, entry.reference_id, entry.org, entry.job_name, entry.tag
                );
            }
            if entries.len() == self.query.limit {
                println!();
                println!(
                    "💡 More may follow: --offset {}",
                    self.query.offset + entries.len()
                );
            }
            Ok(())
        })
        .await
    }
}
