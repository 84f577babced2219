use anyhow::{bail, Result};
use std::path::PathBuf;

use curation_flow::config::CurationFlowConfig;

pub struct InitCommand {
    pub path: PathBuf,
    pub force: bool,
}

impl InitCommand {
    pub fn execute(&self) -> Result<()> {
        if self.path.exists() && !self.force {
            println!("⚠️  {} already exists", self.path.display());
            println!("   💡 Use --force to overwrite it");
            bail!("Refusing to overwrite {}", self.path.display());
        }

        CurationFlowConfig::default().save_to_file(&self.path)?;
        println!("✅ Wrote default configuration to {}", self.path.display());
        println!();
        println!("🎯 NEXT STEPS:");
        println!("   → Point [ontology] base_url at your ontology service");
        println!("   → Set ONTOLOGY_API_TOKEN or [ontology] api_token");
        println!("   → Load transitions: curation-flow rules import <rules.toml>");
        Ok(())
    }
}
