// Transition Engine - selects the single matching rule for a request, checks
// it, moves the row and runs the rule's actions in one unit of work.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn, Instrument};

use super::actions::{ActionContext, ActionRegistry};
use super::counters::{tally, CounterQuery, TagCounter};
use super::errors::{ErrorKind, WorkflowError, WorkflowResult};
use super::requirements::RequirementRegistry;
use super::rules::RuleSet;
use super::store::{StateFilter, StateStore, StoreTransaction};
use super::subtasks::JobFamilies;
use super::types::{
    CallerMode, ReferenceId, TagPattern, Target, TrackId, WorkflowState, WorkflowStateVersion,
};
use crate::config::{MaintenanceConfig, OntologyConfig, WorkflowConfig};
use crate::ontology::OntologyResolver;
use crate::telemetry::{create_transition_span, generate_correlation_id};

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Actor recorded when the caller does not name one.
    pub default_actor: String,
    pub tag_pattern: TagPattern,
    /// Process roots that may hold several tracks per (reference, org).
    pub multiple_allowed_processes: HashSet<String>,
    pub maintenance: MaintenanceConfig,
    pub families: Arc<JobFamilies>,
}

impl EngineSettings {
    pub fn from_config(workflow: &WorkflowConfig, ontology: &OntologyConfig) -> WorkflowResult<Self> {
        Ok(Self {
            default_actor: workflow.default_actor.clone(),
            tag_pattern: TagPattern::new(&ontology.tag_prefix)?,
            multiple_allowed_processes: workflow.multiple_allowed_processes.iter().cloned().collect(),
            maintenance: workflow.maintenance.clone(),
            families: Arc::new(JobFamilies::with_overrides(workflow.job_families.clone())),
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            default_actor: "default_user".to_string(),
            tag_pattern: TagPattern::default(),
            multiple_allowed_processes: HashSet::new(),
            maintenance: MaintenanceConfig::default(),
            families: Arc::new(JobFamilies::default()),
        }
    }
}

pub struct TransitionEngine {
    store: Arc<dyn StateStore>,
    ontology: Arc<OntologyResolver>,
    requirements: RequirementRegistry,
    actions: ActionRegistry,
    settings: EngineSettings,
    rules: RwLock<Option<Arc<RuleSet>>>,
}

impl TransitionEngine {
    pub fn new(store: Arc<dyn StateStore>, ontology: Arc<OntologyResolver>) -> Self {
        Self {
            store,
            ontology,
            requirements: RequirementRegistry::with_builtins(),
            actions: ActionRegistry::with_builtins(),
            settings: EngineSettings::default(),
            rules: RwLock::new(None),
        }
    }

    pub fn with_requirements(mut self, requirements: RequirementRegistry) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_actions(mut self, actions: ActionRegistry) -> Self {
        self.actions = actions;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn ontology(&self) -> &Arc<OntologyResolver> {
        &self.ontology
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// The validated transition table, loading it on first use.
    pub async fn rules(&self) -> WorkflowResult<Arc<RuleSet>> {
        if let Some(rules) = self.rules.read().await.as_ref() {
            return Ok(rules.clone());
        }
        let mut tx = self.store.begin().await?;
        let loaded = self.cached_rules(tx.as_mut()).await;
        tx.rollback().await?;
        loaded
    }

    /// Drop the cached table and load it again from the store.
    pub async fn reload_rules(&self) -> WorkflowResult<Arc<RuleSet>> {
        self.rules.write().await.take();
        self.rules().await
    }

    async fn cached_rules(&self, tx: &mut dyn StoreTransaction) -> WorkflowResult<Arc<RuleSet>> {
        if let Some(rules) = self.rules.read().await.as_ref() {
            return Ok(rules.clone());
        }
        let mut slot = self.rules.write().await;
        if let Some(rules) = slot.as_ref() {
            return Ok(rules.clone());
        }
        let loaded = Arc::new(RuleSet::load(
            tx.transition_rules().await?,
            &self.requirements,
            &self.actions,
        )?);
        *slot = Some(loaded.clone());
        Ok(loaded)
    }

    pub async fn apply_transition(
        &self,
        track_id: TrackId,
        target: Target,
        mode: CallerMode,
    ) -> WorkflowResult<WorkflowState> {
        let actor = self.settings.default_actor.clone();
        self.apply_transition_as(track_id, target, mode, &actor).await
    }

    /// Run one transition in its own unit of work, recorded against `actor`.
    pub async fn apply_transition_as(
        &self,
        track_id: TrackId,
        target: Target,
        mode: CallerMode,
        actor: &str,
    ) -> WorkflowResult<WorkflowState> {
        let correlation_id = generate_correlation_id();
        let span = create_transition_span(track_id, &target.to_string(), &mode.to_string(), &correlation_id);

        async {
            let mut tx = self.store.begin().await?;
            match self.transition_within(tx.as_mut(), track_id, &target, mode, actor).await {
                Ok(state) => {
                    tx.commit().await?;
                    info!(track_id = track_id, tag = %state.tag, version = state.version, "Transition applied");
                    Ok(state)
                }
                Err(err) => {
                    if let Err(rollback_err) = tx.rollback().await {
                        error!(track_id = track_id, error = %rollback_err, "Rollback failed");
                    }
                    log_failure(track_id, &target, &err);
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Apply a transition inside a caller-owned transaction. A failure rolls
    /// back to a savepoint, leaving earlier work in `tx` intact.
    pub async fn transition_within(
        &self,
        tx: &mut dyn StoreTransaction,
        track_id: TrackId,
        target: &Target,
        mode: CallerMode,
        actor: &str,
    ) -> WorkflowResult<WorkflowState> {
        let rules = self.cached_rules(tx).await?;
        tx.savepoint().await?;
        match self.run_transition(tx, &rules, track_id, target, mode, actor).await {
            Ok(state) => {
                tx.release_savepoint().await?;
                Ok(state)
            }
            Err(err) => {
                tx.rollback_to_savepoint().await?;
                Err(err)
            }
        }
    }

    async fn run_transition(
        &self,
        tx: &mut dyn StoreTransaction,
        rules: &RuleSet,
        track_id: TrackId,
        target: &Target,
        mode: CallerMode,
        actor: &str,
    ) -> WorkflowResult<WorkflowState> {
        let state = tx
            .get_state(track_id)
            .await?
            .ok_or(WorkflowError::TrackNotFound(track_id))?;
        let rule = rules.select(&state.org, &state.tag, target)?;

        if !rule.mode.permits(mode) {
            return Err(WorkflowError::ModeMismatch {
                rule_id: rule.id,
                mode: rule.mode,
                caller: mode,
            });
        }

        let reference = tx
            .reference(state.reference_id)
            .await?
            .ok_or(WorkflowError::ReferenceNotFound(state.reference_id))?;

        if let Some(unmet) = self
            .requirements
            .first_unmet(&rule.requirements, tx, &reference, &state.org)
            .await?
        {
            return Err(WorkflowError::RequirementNotMet {
                requirement: unmet.to_string(),
                from: self.ontology.resolve_name(&state.tag).await,
                to: self.ontology.resolve_name(&rule.to_tag).await,
            });
        }

        let updated = tx.update_tag(&state, &rule.to_tag, actor).await?;

        let mut ctx = ActionContext {
            tx: &mut *tx,
            state: &updated,
            reference: &reference,
            rule,
            rules,
            ontology: &self.ontology,
            actor,
        };
        for call in &rule.actions {
            if let Err(err) = self.actions.dispatch(&mut ctx, call).await {
                if matches!(err.kind(), ErrorKind::Internal | ErrorKind::InvalidConfiguration) {
                    error!(
                        track_id = track_id,
                        org = %state.org,
                        rule_id = rule.id,
                        action = %call,
                        error = %err,
                        "Action failed, transition rolled back"
                    );
                }
                return Err(err);
            }
        }

        Ok(tx.get_state(track_id).await?.unwrap_or(updated))
    }

    /// Start a new track for a (reference, org) pair.
    pub async fn create_track(
        &self,
        reference_id: ReferenceId,
        org: &str,
        tag: &str,
        actor: &str,
    ) -> WorkflowResult<WorkflowState> {
        self.settings.tag_pattern.check(tag)?;
        let process = self.ontology.process_root_of(tag).await?;

        let mut tx = self.store.begin().await?;
        let result = async {
            tx.reference(reference_id)
                .await?
                .ok_or(WorkflowError::ReferenceNotFound(reference_id))?;

            if let Some(process) = process.filter(|p| !self.settings.multiple_allowed_processes.contains(p)) {
                for existing in tx.find_states(&StateFilter::for_pair(reference_id, org)).await? {
                    if self.ontology.process_root_of(&existing.tag).await?.as_deref() == Some(process.as_str()) {
                        return Err(WorkflowError::ProcessAlreadyTracked {
                            reference_id,
                            org: org.to_string(),
                            process: self.ontology.resolve_name(&process).await,
                        });
                    }
                }
            }
            tx.insert_state(reference_id, org, tag, actor).await
        }
        .await;

        match result {
            Ok(state) => {
                tx.commit().await?;
                info!(track_id = state.id, reference_id = reference_id, org = %org, tag = %tag, "Track created");
                Ok(state)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    pub async fn delete_track(&self, track_id: TrackId, actor: &str) -> WorkflowResult<()> {
        let mut tx = self.store.begin().await?;
        let Some(state) = tx.get_state(track_id).await? else {
            tx.rollback().await?;
            return Err(WorkflowError::TrackNotFound(track_id));
        };
        tx.delete_state(&state, actor).await?;
        tx.commit().await?;
        warn!(track_id = track_id, tag = %state.tag, actor = %actor, "Track deleted");
        Ok(())
    }

    pub async fn find_states(&self, filter: &StateFilter) -> WorkflowResult<Vec<WorkflowState>> {
        let mut tx = self.store.begin().await?;
        let states = tx.find_states(filter).await;
        tx.rollback().await?;
        states
    }

    pub async fn current_tags(&self, reference_id: ReferenceId, org: &str) -> WorkflowResult<Vec<WorkflowState>> {
        self.find_states(&StateFilter::for_pair(reference_id, org)).await
    }

    pub async fn history(&self, track_id: TrackId) -> WorkflowResult<Vec<WorkflowStateVersion>> {
        let mut tx = self.store.begin().await?;
        let versions = tx.versions(track_id).await;
        tx.rollback().await?;
        versions
    }

    pub async fn counters(&self, query: &CounterQuery) -> WorkflowResult<Vec<TagCounter>> {
        let tags = match &query.process {
            Some(process) => {
                let mut tags: BTreeSet<String> = self.ontology.tags_under(process).await?;
                tags.insert(process.clone());
                Some(tags.into_iter().collect())
            }
            None => None,
        };
        let filter = StateFilter {
            tags,
            org: query.org.clone(),
            reference_id: None,
            updated_before: query.updated_before,
            updated_after: query.updated_after,
        };

        let states = self.find_states(&filter).await?;
        let mut counters = tally(&states, query.frequency);
        for counter in &mut counters {
            counter.tag_name = self.ontology.resolve_name(&counter.tag).await;
        }
        Ok(counters)
    }
}

fn log_failure(track_id: TrackId, target: &Target, err: &WorkflowError) {
    match err.kind() {
        ErrorKind::NotFound | ErrorKind::Rejected => {
            info!(track_id = track_id, target = %target, error = %err, "Transition refused")
        }
        ErrorKind::Conflict => {
            warn!(track_id = track_id, target = %target, error = %err, "Transition lost a concurrent update")
        }
        ErrorKind::InvalidConfiguration | ErrorKind::Internal | ErrorKind::ServiceUnavailable => {
            error!(track_id = track_id, target = %target, error = %err, "Transition failed")
        }
    }
}
