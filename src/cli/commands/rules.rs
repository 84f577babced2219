use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cli::commands::{open_store, registries};
use curation_flow::config::CurationFlowConfig;
use curation_flow::workflow::{RuleRecord, RuleSet, TransitionRule};

/// `[[rules]]` tables in a TOML file.
#[derive(Debug, Deserialize)]
struct RuleFile {
    #[serde(default)]
    rules: Vec<RuleRecord>,
}

fn read_rule_file(path: &Path) -> Result<Vec<RuleRecord>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("Cannot read {}: {}", path.display(), e))?;
    let file: RuleFile = toml::from_str(&content)
        .map_err(|e| anyhow!("Cannot parse {}: {}", path.display(), e))?;
    Ok(file.rules)
}

/// Every problem in a table: unparseable rules, unknown names, bad
/// arguments and rules competing for the same request.
fn problems(records: Vec<RuleRecord>, config: &CurationFlowConfig) -> Result<Vec<String>> {
    let (requirements, actions) = registries(config)?;
    let mut found = Vec::new();
    let mut parsed = Vec::with_capacity(records.len());

    for record in records {
        let id = record.id;
        let rule = match TransitionRule::try_from(record) {
            Ok(rule) => rule,
            Err(e) => {
                found.push(format!("rule {id}: {e}"));
                continue;
            }
        };
        for call in &rule.requirements {
            if let Err(e) = requirements.validate(call) {
                found.push(format!("rule {id}: {e}"));
            }
        }
        for call in &rule.actions {
            if let Err(e) = actions.validate(call) {
                found.push(format!("rule {id}: {e}"));
            }
        }
        parsed.push(rule);
    }

    for conflict in RuleSet::conflicts(&parsed) {
        found.push(format!("rules {:?}: {}", conflict.rule_ids, conflict.detail));
    }
    Ok(found)
}

pub struct RulesCheckCommand {
    pub file: Option<PathBuf>,
}

impl RulesCheckCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        let records = match &self.file {
            Some(path) => {
                println!("📐 Checking transition table in {}", path.display());
                read_rule_file(path)?
            }
            None => {
                println!("📐 Checking stored transition table");
                let store = open_store(config).await?;
                let mut tx = store.begin().await?;
                let records = tx.transition_rules().await;
                tx.rollback().await?;
                records?
            }
        };
        println!();

        let total = records.len();
        let found = problems(records, config)?;
        if found.is_empty() {
            println!("✅ {} rules, no problems found", total);
            return Ok(());
        }

        println!("❌ {} problem(s) in {} rules:", found.len(), total);
        for problem in &found {
            println!("   → {}", problem);
        }
        bail!("Transition table is invalid")
    }
}

pub struct RulesImportCommand {
    pub file: PathBuf,
}

impl RulesImportCommand {
    #[cfg(feature = "database")]
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        use curation_flow::database::SqliteStore;

        let records = read_rule_file(&self.file)?;
        let found = problems(records.clone(), config)?;
        if !found.is_empty() {
            for problem in &found {
                println!("   → {}", problem);
            }
            bail!("Refusing to import an invalid transition table");
        }

        let database = config
            .database
            .as_ref()
            .ok_or_else(|| anyhow!("No [database] section in the configuration"))?;
        let store = SqliteStore::connect(database).await?;
        for record in &records {
            store.upsert_rule(record).await?;
        }
        println!("✅ Imported {} rules from {}", records.len(), self.file.display());
        Ok(())
    }

    #[cfg(not(feature = "database"))]
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        open_store(config).await.map(|_| ())
    }
}
