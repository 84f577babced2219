// Stuck-Job Reconciler - periodic sweep that retries or fails tracks which
// have sat in an in-progress or failed tag for longer than their window.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use fd_lock::{RwLock, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

use super::engine::TransitionEngine;
use super::errors::{WorkflowError, WorkflowResult};
use super::store::{StateFilter, StoreTransaction};
use super::subtasks::JobFamilies;
use super::types::{CallerMode, JobFamily, Role, Target, TrackId, VersionOperation, WorkflowState};
use crate::config::{PhaseConfig, ReconcilerConfig};
use crate::notify::{Notification, NotificationSink};
use crate::telemetry::{create_sweep_span, generate_correlation_id};

#[derive(Debug, Clone)]
pub enum PhaseKind {
    /// Tags are written directly.
    SingleStage {
        stuck_tags: Vec<String>,
        retry_tag: String,
        failed_tag: String,
    },
    /// Subtask tracks under the family's in-progress and failed subtrees,
    /// moved through the engine's retry and failed roles.
    JobFamily { family_name: String, family: JobFamily },
}

#[derive(Debug, Clone)]
pub struct SweepPhase {
    pub name: String,
    pub kind: PhaseKind,
    pub restart_marker: String,
    pub window: Duration,
    pub max_attempts: usize,
    pub notify: bool,
}

impl SweepPhase {
    pub fn from_config(config: &PhaseConfig, families: &JobFamilies) -> WorkflowResult<Self> {
        let kind = match &config.job_family {
            Some(family_name) => PhaseKind::JobFamily {
                family_name: family_name.clone(),
                family: families.get(family_name)?.clone(),
            },
            None => {
                let (Some(retry_tag), Some(failed_tag)) = (&config.retry_tag, &config.failed_tag) else {
                    return Err(WorkflowError::InvalidConfiguration(format!(
                        "sweep phase '{}' needs retry_tag and failed_tag",
                        config.name
                    )));
                };
                if config.stuck_tags.is_empty() {
                    return Err(WorkflowError::InvalidConfiguration(format!(
                        "sweep phase '{}' lists no stuck tags",
                        config.name
                    )));
                }
                PhaseKind::SingleStage {
                    stuck_tags: config.stuck_tags.clone(),
                    retry_tag: retry_tag.clone(),
                    failed_tag: failed_tag.clone(),
                }
            }
        };

        Ok(Self {
            name: config.name.clone(),
            kind,
            restart_marker: config.restart_marker.clone(),
            window: Duration::weeks(config.window_weeks),
            max_attempts: config.max_attempts,
            notify: config.notify,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepDecision {
    Retry,
    Escalate,
}

/// One row moved by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepAction {
    pub track_id: TrackId,
    pub reference_id: i64,
    pub org: String,
    pub decision: SweepDecision,
    pub from_tag: String,
    pub to_tag: String,
}

#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub name: String,
    pub examined: usize,
    pub actions: Vec<SweepAction>,
    /// Rows whose update failed; the rest of the phase still committed.
    pub failures: Vec<(TrackId, String)>,
    pub notified_orgs: Vec<String>,
}

impl PhaseReport {
    pub fn retried(&self) -> usize {
        self.actions.iter().filter(|a| a.decision == SweepDecision::Retry).count()
    }

    pub fn escalated(&self) -> usize {
        self.actions.iter().filter(|a| a.decision == SweepDecision::Escalate).count()
    }
}

/// Tags a phase sweeps, and the subset meaning "already failed".
struct PhaseTags {
    stuck: BTreeSet<String>,
    failed: HashSet<String>,
}

pub struct StuckJobReconciler {
    engine: Arc<TransitionEngine>,
    notifier: Arc<dyn NotificationSink>,
    phases: Vec<SweepPhase>,
    actor: String,
    subject_template: String,
}

impl StuckJobReconciler {
    pub fn new(
        engine: Arc<TransitionEngine>,
        notifier: Arc<dyn NotificationSink>,
        phases: Vec<SweepPhase>,
    ) -> Self {
        Self {
            engine,
            notifier,
            phases,
            actor: default_actor(),
            subject_template: "Report on stuck {org} Papers in workflows".to_string(),
        }
    }

    pub fn from_config(
        engine: Arc<TransitionEngine>,
        notifier: Arc<dyn NotificationSink>,
        config: &ReconcilerConfig,
        families: &JobFamilies,
    ) -> WorkflowResult<Self> {
        let phases = config
            .phases
            .iter()
            .map(|p| SweepPhase::from_config(p, families))
            .collect::<WorkflowResult<Vec<_>>>()?;
        let mut reconciler = Self::new(engine, notifier, phases);
        if let Some(actor) = &config.actor {
            reconciler.actor = actor.clone();
        }
        Ok(reconciler)
    }

    pub fn with_subject_template(mut self, template: impl Into<String>) -> Self {
        self.subject_template = template.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn phases(&self) -> &[SweepPhase] {
        &self.phases
    }

    pub async fn run(&self) -> WorkflowResult<Vec<PhaseReport>> {
        self.run_at(self.engine.store().now()).await
    }

    /// Sweep every phase as of `now`. A phase that cannot start (store or
    /// ontology unavailable) aborts the sweep; row failures do not.
    pub async fn run_at(&self, now: DateTime<Utc>) -> WorkflowResult<Vec<PhaseReport>> {
        let mut reports = Vec::with_capacity(self.phases.len());
        for phase in &self.phases {
            let span = create_sweep_span(&phase.name, &generate_correlation_id());
            let report = self.sweep_phase(phase, now).instrument(span).await?;
            info!(
                phase = %report.name,
                examined = report.examined,
                retried = report.retried(),
                escalated = report.escalated(),
                failures = report.failures.len(),
                "Sweep phase finished"
            );
            reports.push(report);
        }
        Ok(reports)
    }

    async fn phase_tags(&self, phase: &SweepPhase) -> WorkflowResult<PhaseTags> {
        match &phase.kind {
            PhaseKind::SingleStage {
                stuck_tags,
                failed_tag,
                ..
            } => Ok(PhaseTags {
                stuck: stuck_tags.iter().cloned().collect(),
                failed: HashSet::from([failed_tag.clone()]),
            }),
            PhaseKind::JobFamily { family, .. } => {
                let ontology = self.engine.ontology();
                let failed = ontology.tags_under(&family.failed).await?;
                let mut stuck = ontology.tags_under(&family.in_progress).await?;
                stuck.extend(failed.iter().cloned());
                Ok(PhaseTags {
                    stuck,
                    failed: failed.into_iter().collect(),
                })
            }
        }
    }

    async fn sweep_phase(&self, phase: &SweepPhase, now: DateTime<Utc>) -> WorkflowResult<PhaseReport> {
        let mut report = PhaseReport {
            name: phase.name.clone(),
            ..PhaseReport::default()
        };
        let tags = self.phase_tags(phase).await?;
        if tags.stuck.is_empty() {
            warn!(phase = %phase.name, "Sweep phase has no tags to examine");
            return Ok(report);
        }

        let cutoff = now - phase.window;
        let filter = StateFilter {
            tags: Some(tags.stuck.iter().cloned().collect()),
            updated_before: Some(cutoff),
            ..StateFilter::default()
        };

        let mut tx = self.engine.store().begin().await?;
        let candidates = match tx.find_states(&filter).await {
            Ok(candidates) => candidates,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };
        report.examined = candidates.len();

        let mut references = BTreeMap::new();
        for row in candidates {
            tx.savepoint().await?;
            match self.reconcile_row(tx.as_mut(), phase, &tags, &row, cutoff).await {
                Ok(Some(action)) => {
                    tx.release_savepoint().await?;
                    match tx.reference(row.reference_id).await {
                        Ok(Some(reference)) => {
                            references.insert(row.reference_id, reference.curie);
                        }
                        Ok(None) => {}
                        Err(err) => warn!(
                            reference_id = row.reference_id,
                            error = %err,
                            "Reference lookup failed; report will use the numeric id"
                        ),
                    }
                    report.actions.push(action);
                }
                Ok(None) => tx.release_savepoint().await?,
                Err(err) => {
                    tx.rollback_to_savepoint().await?;
                    warn!(track_id = row.id, phase = %phase.name, error = %err, "Could not reconcile track");
                    report.failures.push((row.id, err.to_string()));
                }
            }
        }
        tx.commit().await?;

        if phase.notify && !report.actions.is_empty() {
            report.notified_orgs = self.notify(phase, &report.actions, &references).await;
        }
        Ok(report)
    }

    async fn reconcile_row(
        &self,
        tx: &mut dyn StoreTransaction,
        phase: &SweepPhase,
        tags: &PhaseTags,
        row: &WorkflowState,
        cutoff: DateTime<Utc>,
    ) -> WorkflowResult<Option<SweepAction>> {
        let attempts = tx
            .versions(row.id)
            .await?
            .iter()
            .filter(|v| v.operation != VersionOperation::Delete)
            .filter(|v| tags.stuck.contains(&v.tag) && !tags.failed.contains(&v.tag))
            .count();
        let restarted = tx
            .versions_since(row.reference_id, &row.org, cutoff)
            .await?
            .iter()
            .any(|v| v.tag == phase.restart_marker);

        let decision = if restarted && attempts < phase.max_attempts {
            SweepDecision::Retry
        } else {
            SweepDecision::Escalate
        };
        debug!(
            track_id = row.id,
            attempts = attempts,
            restarted = restarted,
            decision = ?decision,
            "Stuck track examined"
        );

        if decision == SweepDecision::Escalate && tags.failed.contains(&row.tag) {
            return Ok(None);
        }

        let updated = match (&phase.kind, decision) {
            (PhaseKind::SingleStage { retry_tag, .. }, SweepDecision::Retry) => {
                tx.update_tag(row, retry_tag, &self.actor).await?
            }
            (PhaseKind::SingleStage { failed_tag, .. }, SweepDecision::Escalate) => {
                tx.update_tag(row, failed_tag, &self.actor).await?
            }
            (PhaseKind::JobFamily { .. }, decision) => {
                let role = match decision {
                    SweepDecision::Retry => Role::Retry,
                    SweepDecision::Escalate => Role::Failed,
                };
                self.engine
                    .transition_within(tx, row.id, &Target::Role(role), CallerMode::Automated, &self.actor)
                    .await?
            }
        };

        Ok(Some(SweepAction {
            track_id: row.id,
            reference_id: row.reference_id,
            org: row.org.clone(),
            decision,
            from_tag: row.tag.clone(),
            to_tag: updated.tag,
        }))
    }

    /// One report per org; delivery failures are logged and dropped.
    async fn notify(
        &self,
        phase: &SweepPhase,
        actions: &[SweepAction],
        references: &BTreeMap<i64, String>,
    ) -> Vec<String> {
        let ontology = self.engine.ontology();
        let mut by_org: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for action in actions {
            let curie = references
                .get(&action.reference_id)
                .cloned()
                .unwrap_or_else(|| action.reference_id.to_string());
            let verb = match action.decision {
                SweepDecision::Retry => "retried",
                SweepDecision::Escalate => "failed",
            };
            by_org.entry(action.org.as_str()).or_default().push(format!(
                "{curie}: {verb} in {}, '{}' -> '{}'",
                phase.name,
                ontology.resolve_name(&action.from_tag).await,
                ontology.resolve_name(&action.to_tag).await,
            ));
        }

        let mut notified = Vec::new();
        for (org, lines) in by_org {
            let notification = Notification {
                org: org.to_string(),
                subject: self.subject_template.replace("{org}", org),
                lines,
            };
            match self.notifier.send(&notification).await {
                Ok(()) => notified.push(org.to_string()),
                Err(err) => warn!(org = %org, error = %err, "Notification not delivered"),
            }
        }
        notified
    }
}

fn default_actor() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown-host".to_string());
    format!("stuck_job_reconciler@{host}")
}

/// Exclusive lock held for the duration of a sweep.
pub struct SweepLock {
    _guard: RwLockWriteGuard<'static, File>,
}

impl SweepLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;

        // The guard must outlive this call; the lock is leaked like any
        // process-lifetime lock.
        let lock = Box::leak(Box::new(RwLock::new(file)));
        let guard = lock.try_write().map_err(|_| {
            anyhow!(
                "Another sweep is already running (lock held on {})",
                path.display()
            )
        })?;
        Ok(Self { _guard: guard })
    }
}
