use anyhow::Result;

use crate::cli::commands::{hint, with_engine};
use curation_flow::config::CurationFlowConfig;
use curation_flow::workflow::{CallerMode, Role, Target, TrackId};

pub struct CreateCommand {
    pub reference_id: i64,
    pub org: String,
    pub tag: String,
    pub actor: Option<String>,
}

impl CreateCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        println!("🆕 Creating track for reference {} ({})", self.reference_id, self.org);
        println!();

        with_engine(config, |engine| async move {
            let actor = self
                .actor
                .clone()
                .unwrap_or_else(|| engine.settings().default_actor.clone());
            match engine
                .create_track(self.reference_id, &self.org, &self.tag, &actor)
                .await
            {
                Ok(state) => {
                    let name = engine.ontology().resolve_name(&state.tag).await;
                    println!("✅ Track {} created at {} ({})", state.id, name, state.tag);
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

pub struct TransitionCommand {
    pub track_id: TrackId,
    pub to: Option<String>,
    pub role: Option<Role>,
    pub automated: bool,
    pub actor: Option<String>,
}

impl TransitionCommand {
    fn target(&self) -> Result<Target> {
        match (&self.to, self.role) {
            (Some(tag), _) => Ok(Target::Tag(tag.clone())),
            (None, Some(role)) => Ok(Target::Role(role)),
            (None, None) => Err(anyhow::anyhow!("Either --to or --role is required")),
        }
    }

    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        let target = self.target()?;
        let mode = if self.automated {
            CallerMode::Automated
        } else {
            CallerMode::Manual
        };
        println!("➡️  Moving track {} to {} ({})", self.track_id, target, mode);
        println!();

        with_engine(config, |engine| async move {
            let actor = self
                .actor
                .clone()
                .unwrap_or_else(|| engine.settings().default_actor.clone());
            match engine
                .apply_transition_as(self.track_id, target, mode, &actor)
                .await
            {
                Ok(state) => {
                    let name = engine.ontology().resolve_name(&state.tag).await;
                    println!("✅ Track {} is now at {} ({})", state.id, name, state.tag);
                    println!("   🔢 Version: {}", state.version);
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

pub struct DeleteCommand {
    pub track_id: TrackId,
    pub actor: Option<String>,
}

impl DeleteCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            let actor = self
                .actor
                .clone()
                .unwrap_or_else(|| engine.settings().default_actor.clone());
            engine.delete_track(self.track_id, &actor).await?;
            println!("🗑️  Track {} deleted", self.track_id);
            Ok(())
        })
        .await
    }
}

pub struct TagsCommand {
    pub reference_id: i64,
    pub org: String,
}

impl TagsCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            let states = engine.current_tags(self.reference_id, &self.org).await?;
            println!();
            if states.is_empty() {
                println!("📋 Reference {} has no tracks for {}", self.reference_id, self.org);
                println!("   💡 Start one with: curation-flow create {} {} <tag>", self.reference_id, self.org);
                return Ok(());
            }

            println!("📋 CURRENT TAGS ({} / {}):", self.reference_id, self.org);
            println!("────────────────────");
            for state in states {
                let name = engine.ontology().resolve_name(&state.tag).await;
                let process = match engine.ontology().process_root_of(&state.tag).await {
                    Ok(Some(root)) => engine.ontology().resolve_name(&root).await,
                    _ => "unknown process".to_string(),
                };
                println!("🏷️  Track {}: {} ({})", state.id, name, state.tag);
                println!("   🧭 Process: {}", process);
                println!(
                    "   🕒 Updated {} by {}",
                    state.updated_at.format("%Y-%m-%d %H:%M"),
                    state.updated_by
                );
            }
            Ok(())
        })
        .await
    }
}

pub struct HistoryCommand {
    pub track_id: TrackId,
}

impl HistoryCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            let versions = engine.history(self.track_id).await?;
            println!();
            if versions.is_empty() {
                println!("📜 No history recorded for track {}", self.track_id);
                return Ok(());
            }

            println!("📜 HISTORY OF TRACK {}:", self.track_id);
            for version in versions {
                let from = match &version.previous_tag {
                    Some(tag) if *tag != version.tag => format!("{tag} → "),
                    _ => String::new(),
                };
                println!(
                    "   {} {:<6} {}{}  ({})",
                    version.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                    version.operation.as_str(),
                    from,
                    version.tag,
                    version.actor
                );
            }
            Ok(())
        })
        .await
    }
}
