// Subtasks - fan-out of subtask tracks and maintenance of the aggregate row
// that summarizes a multi-subtask job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

use super::actions::{ActionContext, ActionHandler};
use super::errors::{WorkflowError, WorkflowResult};
use super::store::StateFilter;
use super::types::{JobFamily, WorkflowState};

/// Job families by name ("reference classification", ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobFamilies(HashMap<String, JobFamily>);

impl JobFamilies {
    pub fn new(families: HashMap<String, JobFamily>) -> Self {
        Self(families)
    }

    /// Built-in families with `overrides` replacing or adding entries.
    pub fn with_overrides(overrides: HashMap<String, JobFamily>) -> Self {
        let mut families = Self::default();
        families.0.extend(overrides);
        families
    }

    pub fn get(&self, name: &str) -> WorkflowResult<&JobFamily> {
        self.0.get(name).ok_or_else(|| {
            WorkflowError::InvalidArgument(format!("unknown job family '{name}'"))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// The family whose main tag is `main`, with its name.
    pub fn by_main(&self, main: &str) -> Option<(&str, &JobFamily)> {
        self.0
            .iter()
            .find(|(_, family)| family.main == main)
            .map(|(name, family)| (name.as_str(), family))
    }
}

fn family(main: &str, needed: &str, in_progress: &str, complete: &str, failed: &str) -> JobFamily {
    JobFamily {
        main: main.to_string(),
        needed: needed.to_string(),
        in_progress: in_progress.to_string(),
        complete: complete.to_string(),
        failed: failed.to_string(),
    }
}

impl Default for JobFamilies {
    fn default() -> Self {
        Self(HashMap::from([
            (
                "reference classification".to_string(),
                family("ATP:0000165", "ATP:0000166", "ATP:0000178", "ATP:0000169", "ATP:0000189"),
            ),
            (
                "curation classification".to_string(),
                family("ATP:0000311", "ATP:0000313", "ATP:0000314", "ATP:0000312", "ATP:0000315"),
            ),
            (
                "entity extraction".to_string(),
                family("ATP:0000172", "ATP:0000173", "ATP:0000190", "ATP:0000174", "ATP:0000187"),
            ),
            (
                "email extraction".to_string(),
                family("ATP:0000354", "ATP:0000358", "ATP:0000357", "ATP:0000355", "ATP:0000356"),
            ),
        ]))
    }
}

/// Where an aggregate row currently sits within its family vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregatePhase {
    Main,
    Needed,
    InProgress,
    Complete,
    Failed,
}

impl AggregatePhase {
    pub fn of(family: &JobFamily, tag: &str) -> Option<Self> {
        [
            (&family.main, AggregatePhase::Main),
            (&family.needed, AggregatePhase::Needed),
            (&family.in_progress, AggregatePhase::InProgress),
            (&family.complete, AggregatePhase::Complete),
            (&family.failed, AggregatePhase::Failed),
        ]
        .into_iter()
        .find(|(candidate, _)| *candidate == tag)
        .map(|(_, phase)| phase)
    }

    pub fn tag<'f>(&self, family: &'f JobFamily) -> &'f str {
        match self {
            AggregatePhase::Main => &family.main,
            AggregatePhase::Needed => &family.needed,
            AggregatePhase::InProgress => &family.in_progress,
            AggregatePhase::Complete => &family.complete,
            AggregatePhase::Failed => &family.failed,
        }
    }
}

/// Subtask lifecycle notifications that update the aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtaskEvent {
    InProgress,
    Complete,
    Failed,
    Retry,
}

/// Sibling rows consulted before deciding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingQuery {
    /// Subtasks still under the needed or in-progress subtrees.
    Open,
    /// Subtasks under the failed subtree.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateOutcome {
    Transition(AggregatePhase),
    Handled,
    Inconsistent(String),
}

impl SubtaskEvent {
    pub const ALL: [SubtaskEvent; 4] = [
        SubtaskEvent::InProgress,
        SubtaskEvent::Complete,
        SubtaskEvent::Failed,
        SubtaskEvent::Retry,
    ];

    pub fn action_name(&self) -> &'static str {
        match self {
            SubtaskEvent::InProgress => "sub_task_in_progress",
            SubtaskEvent::Complete => "sub_task_complete",
            SubtaskEvent::Failed => "sub_task_failed",
            SubtaskEvent::Retry => "sub_task_retry",
        }
    }

    /// Which siblings must be counted before `decide` can answer.
    pub fn sibling_query(&self, phase: AggregatePhase) -> Option<SiblingQuery> {
        match (self, phase) {
            (SubtaskEvent::Complete, AggregatePhase::Needed | AggregatePhase::InProgress) => {
                Some(SiblingQuery::Open)
            }
            (SubtaskEvent::Retry, _) => Some(SiblingQuery::Failed),
            _ => None,
        }
    }

    /// Aggregate decision table. `siblings` answers `sibling_query`.
    pub fn decide(&self, phase: AggregatePhase, siblings: bool) -> AggregateOutcome {
        use AggregateOutcome::*;
        use AggregatePhase as P;

        match (self, phase) {
            (SubtaskEvent::InProgress, P::Needed) => Transition(P::InProgress),
            (SubtaskEvent::InProgress, P::InProgress | P::Failed) => Handled,
            (SubtaskEvent::InProgress, P::Complete) => {
                Inconsistent("aggregate is complete but a subtask started".to_string())
            }

            (SubtaskEvent::Complete, P::Failed | P::Main) => Handled,
            (SubtaskEvent::Complete, P::Complete) => {
                Inconsistent("aggregate is already complete but a subtask completed".to_string())
            }
            (SubtaskEvent::Complete, P::Needed | P::InProgress) if !siblings => {
                Transition(P::Complete)
            }
            (SubtaskEvent::Complete, P::Needed) => Transition(P::InProgress),
            (SubtaskEvent::Complete, P::InProgress) => Handled,

            (SubtaskEvent::Failed, P::Complete) => {
                Inconsistent("aggregate is complete but a subtask failed".to_string())
            }
            (SubtaskEvent::Failed, P::Failed) => Handled,
            (SubtaskEvent::Failed, _) => Transition(P::Failed),

            (SubtaskEvent::Retry, _) if siblings => Transition(P::Failed),
            (SubtaskEvent::Retry, _) => Transition(P::InProgress),

            (_, P::Main) => Inconsistent("aggregate has not entered its lifecycle".to_string()),
        }
    }
}

/// `sub_task_*::<family>` actions.
pub struct SubtaskUpdate {
    event: SubtaskEvent,
    families: Arc<JobFamilies>,
}

impl SubtaskUpdate {
    pub fn new(event: SubtaskEvent, families: Arc<JobFamilies>) -> Self {
        Self { event, families }
    }

    async fn aggregate(
        ctx: &mut ActionContext<'_>,
        family: &JobFamily,
    ) -> WorkflowResult<WorkflowState> {
        let filter = StateFilter::for_pair(ctx.state.reference_id, &ctx.state.org)
            .with_tags(family.tags());
        let mut rows = ctx.tx.find_states(&filter).await?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(WorkflowError::SubtaskInconsistency(format!(
                "no aggregate row for reference {} and {}",
                ctx.state.reference_id, ctx.state.org
            ))),
            n => Err(WorkflowError::SubtaskInconsistency(format!(
                "{n} aggregate rows for reference {} and {}",
                ctx.state.reference_id, ctx.state.org
            ))),
        }
    }

    async fn siblings_exist(
        ctx: &mut ActionContext<'_>,
        family: &JobFamily,
        query: SiblingQuery,
    ) -> WorkflowResult<bool> {
        let roots: Vec<&str> = match query {
            SiblingQuery::Open => vec![family.needed.as_str(), family.in_progress.as_str()],
            SiblingQuery::Failed => vec![family.failed.as_str()],
        };
        let mut tags = BTreeSet::new();
        for root in roots {
            tags.extend(ctx.ontology.tags_under(root).await?);
        }
        if tags.is_empty() {
            return Ok(false);
        }

        let filter = StateFilter::for_pair(ctx.state.reference_id, &ctx.state.org).with_tags(tags);
        Ok(!ctx.tx.find_states(&filter).await?.is_empty())
    }
}

#[async_trait]
impl ActionHandler for SubtaskUpdate {
    fn arity(&self) -> usize {
        1
    }

    fn validate_args(&self, args: &[String]) -> WorkflowResult<()> {
        match args {
            [name] => self.families.get(name).map(|_| ()),
            _ => Err(WorkflowError::InvalidArgument(format!(
                "{} takes a job family",
                self.event.action_name()
            ))),
        }
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>, args: &[String]) -> WorkflowResult<()> {
        let family = self.families.get(&args[0])?;
        let aggregate = Self::aggregate(ctx, family).await?;
        let phase = AggregatePhase::of(family, &aggregate.tag).ok_or_else(|| {
            WorkflowError::SubtaskInconsistency(format!(
                "aggregate tag '{}' is outside '{}'",
                aggregate.tag, args[0]
            ))
        })?;

        let siblings = match self.event.sibling_query(phase) {
            Some(query) => Self::siblings_exist(ctx, family, query).await?,
            None => false,
        };

        match self.event.decide(phase, siblings) {
            AggregateOutcome::Transition(next) => {
                let updated = ctx
                    .tx
                    .update_tag(&aggregate, next.tag(family), ctx.actor)
                    .await?;
                info!(
                    aggregate_id = updated.id,
                    family = %args[0],
                    from = %aggregate.tag,
                    to = %updated.tag,
                    "Aggregate job advanced"
                );
                Ok(())
            }
            AggregateOutcome::Handled => {
                debug!(aggregate_id = aggregate.id, family = %args[0], "Aggregate unchanged");
                Ok(())
            }
            AggregateOutcome::Inconsistent(reason) => Err(WorkflowError::SubtaskInconsistency(
                format!("{}: {reason}", args[0]),
            )),
        }
    }
}

/// `add_subtasks`: one new track per fan-out rule leaving the current tag.
/// Tags the pair already carries are skipped, so repeating the fan-out adds
/// nothing.
pub struct FanOutSubtasks;

#[async_trait]
impl ActionHandler for FanOutSubtasks {
    fn arity(&self) -> usize {
        0
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>, _args: &[String]) -> WorkflowResult<()> {
        let targets: Vec<String> = ctx
            .rules
            .fan_out(&ctx.state.org, &ctx.state.tag)
            .into_iter()
            .map(|rule| rule.to_tag.clone())
            .collect();
        if targets.is_empty() {
            return Err(WorkflowError::InvalidConfiguration(format!(
                "add_subtasks found no add_subtask rules from '{}' for {}",
                ctx.state.tag, ctx.state.org
            )));
        }

        let existing = ctx.sibling_tags().await?;
        let mut created = 0usize;
        for tag in targets {
            if existing.contains(&tag) {
                debug!(tag = %tag, reference_id = ctx.state.reference_id, "Subtask already present");
                continue;
            }
            ctx.tx
                .insert_state(ctx.state.reference_id, &ctx.state.org, &tag, ctx.actor)
                .await?;
            created += 1;
        }

        info!(
            track_id = ctx.state.id,
            reference_id = ctx.state.reference_id,
            org = %ctx.state.org,
            created = created,
            "Subtasks fanned out"
        );
        Ok(())
    }
}
