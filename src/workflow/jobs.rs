use serde::Serialize;
use std::sync::Arc;

use super::engine::TransitionEngine;
use super::errors::WorkflowResult;
use super::store::StateFilter;
use super::types::{CallerMode, ReferenceId, Role, Target, TrackId, WorkflowState};

pub const MAX_JOB_PAGE: usize = 1000;

/// A track waiting for a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEntry {
    pub job_name: String,
    pub track_id: TrackId,
    pub reference_id: ReferenceId,
    pub org: String,
    pub tag: String,
}

#[derive(Debug, Clone)]
pub struct JobQuery {
    /// Substring of the job condition, e.g. "text_convert".
    pub job: String,
    pub org: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

impl JobQuery {
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            org: None,
            limit: MAX_JOB_PAGE,
            offset: 0,
        }
    }
}

/// Start, succeed and fail jobs by role, as automated workers do.
#[derive(Clone)]
pub struct JobLifecycle {
    engine: Arc<TransitionEngine>,
    actor: String,
}

impl JobLifecycle {
    pub fn new(engine: Arc<TransitionEngine>) -> Self {
        let actor = engine.settings().default_actor.clone();
        Self { engine, actor }
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    async fn apply(&self, track_id: TrackId, role: Role) -> WorkflowResult<WorkflowState> {
        self.engine
            .apply_transition_as(track_id, Target::Role(role), CallerMode::Automated, &self.actor)
            .await
    }

    pub async fn start(&self, track_id: TrackId) -> WorkflowResult<WorkflowState> {
        self.apply(track_id, Role::Start).await
    }

    pub async fn succeed(&self, track_id: TrackId) -> WorkflowResult<WorkflowState> {
        self.apply(track_id, Role::Success).await
    }

    pub async fn fail(&self, track_id: TrackId) -> WorkflowResult<WorkflowState> {
        self.apply(track_id, Role::Failed).await
    }

    /// Tracks sitting on the target of a rule whose job condition mentions
    /// `query.job`, ordered by track id. At most 1000 per page.
    pub async fn jobs(&self, query: &JobQuery) -> WorkflowResult<Vec<JobEntry>> {
        let rules = self.engine.rules().await?;
        let job_rules: Vec<_> = rules.with_job(&query.job).collect();
        if job_rules.is_empty() {
            return Ok(Vec::new());
        }

        let mut tags: Vec<String> = job_rules.iter().map(|r| r.to_tag.clone()).collect();
        tags.sort();
        tags.dedup();
        let filter = StateFilter {
            tags: Some(tags),
            org: query.org.clone(),
            ..StateFilter::default()
        };

        let mut states = self.engine.find_states(&filter).await?;
        states.sort_by_key(|s| s.id);

        let entries = states.into_iter().filter_map(|state| {
            let rule = job_rules
                .iter()
                .find(|r| r.to_tag == state.tag && r.org_scope.applies_to(&state.org))?;
            let job_name = rule
                .job_names()
                .find(|name| name.contains(&query.job))?
                .to_string();
            Some(JobEntry {
                job_name,
                track_id: state.id,
                reference_id: state.reference_id,
                org: state.org,
                tag: state.tag,
            })
        });

        Ok(entries
            .skip(query.offset)
            .take(query.limit.min(MAX_JOB_PAGE))
            .collect())
    }
}
