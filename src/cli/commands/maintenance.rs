use anyhow::Result;

use crate::cli::commands::{hint, with_engine};
use curation_flow::config::CurationFlowConfig;

pub struct ReportCommand {
    pub process: String,
    pub org: String,
}

impl ReportCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            let report = engine.status_report(&self.process, &self.org).await?;
            let process = engine.ontology().resolve_name(&report.process).await;
            println!();
            println!("📊 {} FOR {}:", process.to_uppercase(), report.org);
            println!("────────────────────");
            println!("{}", report.headers().join(" | "));
            for row in &report.rows {
                let mut cells = vec![
                    row.status.clone(),
                    format!("{} ({:.2}%)", row.overall.count, row.overall.percent),
                ];
                cells.extend(
                    row.fields
                        .iter()
                        .map(|c| format!("{} ({:.2}%)", c.count, c.percent)),
                );
                println!("{}", cells.join(" | "));
            }
            Ok(())
        })
        .await
    }
}

pub struct DiagramCommand {
    pub org: Option<String>,
}

impl DiagramCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            let nodes = engine.transition_diagram(self.org.as_deref()).await?;
            println!();
            println!("🗺️  TRANSITIONS ({} tags):", nodes.len());
            for node in nodes {
                if node.transitions_to.is_empty() {
                    println!("   {} ({})", node.tag_name, node.tag);
                } else {
                    println!(
                        "   {} ({}) → {}",
                        node.tag_name,
                        node.tag,
                        node.transitions_to.join(", ")
                    );
                }
            }
            Ok(())
        })
        .await
    }
}

pub struct ResetCommand {
    pub reference_id: i64,
    pub org: String,
    pub keep_file_status: bool,
    pub actor: Option<String>,
}

impl ResetCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            let actor = self
                .actor
                .clone()
                .unwrap_or_else(|| engine.settings().default_actor.clone());
            match engine
                .reset_after_main_file_removed(self.reference_id, &self.org, self.keep_file_status, &actor)
                .await
            {
                Ok(outcome) => {
                    println!("♻️  Removed {} track(s)", outcome.removed.len());
                    for state in &outcome.removed {
                        println!("   🗑️  Track {} at {}", state.id, state.tag);
                    }
                    if let Some(state) = outcome.file_upload {
                        let name = engine.ontology().resolve_name(&state.tag).await;
                        println!("   📁 File upload track {} is now at {}", state.id, name);
                    }
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

pub struct UploadCheckCommand {
    pub reference_id: i64,
    pub org: String,
}

impl UploadCheckCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            match engine.upload_blocker(self.reference_id, &self.org).await? {
                Some(job) => println!("⛔ Upload blocked: {} is running", job),
                None => println!("✅ No running job blocks an upload"),
            }
            Ok(())
        })
        .await
    }
}
