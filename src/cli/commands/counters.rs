use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, Utc};

use crate::cli::commands::with_engine;
use curation_flow::config::CurationFlowConfig;
use curation_flow::workflow::CounterQuery;

/// Midnight UTC of a YYYY-MM-DD day.
pub fn parse_day(raw: &str) -> Result<DateTime<Utc>> {
    let day = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| anyhow!("Invalid date '{}' (expected YYYY-MM-DD): {}", raw, e))?;
    day.and_hms_opt(0, 0, 0)
        .map(|at| at.and_utc())
        .ok_or_else(|| anyhow!("Invalid date '{}'", raw))
}

pub struct CountersCommand {
    pub query: CounterQuery,
}

impl CountersCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        with_engine(config, |engine| async move {
            let counters = engine.counters(&self.query).await?;
            println!();
            if counters.is_empty() {
                println!("📊 No tracks match");
                return Ok(());
            }

            println!("📊 TAG COUNTERS:");
            println!("────────────────────");
            let mut total = 0;
            for counter in &counters {
                total += counter.count;
                let period = counter
                    .period
                    .as_deref()
                    .map(|p| format!(" [{p}]"))
                    .unwrap_or_default();
                println!(
                    "   {:<6} {:>6}  {} ({}){}",
                    counter.org, counter.count, counter.tag_name, counter.tag, period
                );
            }
            println!();
            println!("   🎯 Total: {}", total);
            Ok(())
        })
        .await
    }
}
