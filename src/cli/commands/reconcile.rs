use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::cli::commands::{job_families, with_engine};
use curation_flow::config::CurationFlowConfig;
use curation_flow::notify::{sink_from_config, NotificationSink};
use curation_flow::workflow::{StuckJobReconciler, SweepDecision, SweepLock};

pub struct ReconcileCommand;

impl ReconcileCommand {
    pub async fn execute(&self, config: &CurationFlowConfig) -> Result<()> {
        println!("🧹 Sweeping stuck jobs");
        println!();

        let _lock = SweepLock::acquire(Path::new(&config.reconciler.lock_file))?;
        let notifier: Arc<dyn NotificationSink> = Arc::from(sink_from_config(&config.notifications)?);

        with_engine(config, |engine| async move {
            let reconciler = StuckJobReconciler::from_config(
                engine,
                notifier,
                &config.reconciler,
                &job_families(config),
            )?
            .with_subject_template(config.notifications.subject_template.clone());

            let reports = reconciler.run().await?;
            println!();
            for report in &reports {
                println!("🔎 {}: {} examined", report.name, report.examined);
                for action in &report.actions {
                    let icon = match action.decision {
                        SweepDecision::Retry => "🔁",
                        SweepDecision::Escalate => "🛑",
                    };
                    println!(
                        "   {} Track {} ({}): {} → {}",
                        icon, action.track_id, action.org, action.from_tag, action.to_tag
                    );
                }
                for (track_id, reason) in &report.failures {
                    println!("   ⚠️  Track {}: {}", track_id, reason);
                }
                if !report.notified_orgs.is_empty() {
                    println!("   📣 Notified: {}", report.notified_orgs.join(", "));
                }
            }

            let retried: usize = reports.iter().map(|r| r.retried()).sum();
            let escalated: usize = reports.iter().map(|r| r.escalated()).sum();
            println!();
            println!("✅ Sweep complete: {} retried, {} failed", retried, escalated);
            Ok(())
        })
        .await
    }
}
