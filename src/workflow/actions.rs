// Action Registry - side effects run after a transition moves its row
//
// Actions are configured as `name::arg1::arg2` strings on transition rules.
// Names and argument shapes are checked when the rule table loads and again
// before each dispatch; execution happens inside the transition's unit of work.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use super::errors::{WorkflowError, WorkflowResult};
use super::rules::RuleSet;
use super::store::{StateFilter, StoreTransaction};
use super::subtasks::{FanOutSubtasks, JobFamilies, SubtaskEvent, SubtaskUpdate};
use super::types::{ActionCall, Reference, TagPattern, TransitionRule, WorkflowState};
use crate::ontology::OntologyResolver;

/// Everything an action may read or write while it runs.
pub struct ActionContext<'a> {
    pub tx: &'a mut dyn StoreTransaction,
    /// The row as it stands after the transition's update.
    pub state: &'a WorkflowState,
    pub reference: &'a Reference,
    pub rule: &'a TransitionRule,
    pub rules: &'a RuleSet,
    pub ontology: &'a OntologyResolver,
    pub actor: &'a str,
}

impl ActionContext<'_> {
    /// Tags already present for the row's (reference, org) pair.
    pub async fn sibling_tags(&mut self) -> WorkflowResult<HashSet<String>> {
        let filter = StateFilter::for_pair(self.state.reference_id, &self.state.org);
        Ok(self
            .tx
            .find_states(&filter)
            .await?
            .into_iter()
            .map(|s| s.tag)
            .collect())
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Number of arguments following the action name.
    fn arity(&self) -> usize;

    /// Check argument values without touching the store.
    fn validate_args(&self, _args: &[String]) -> WorkflowResult<()> {
        Ok(())
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>, args: &[String]) -> WorkflowResult<()>;
}

#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        Self::builtins(TagPattern::default(), Arc::new(JobFamilies::default()))
    }

    pub fn builtins(tag_pattern: TagPattern, families: Arc<JobFamilies>) -> Self {
        let mut registry = Self::empty();
        registry.register("proceed_on_value", Arc::new(ConditionalTag::new(tag_pattern)));
        registry.register("add_subtasks", Arc::new(FanOutSubtasks));
        for event in SubtaskEvent::ALL {
            registry.register(
                event.action_name(),
                Arc::new(SubtaskUpdate::new(event, families.clone())),
            );
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    fn handler(&self, call: &ActionCall) -> WorkflowResult<&Arc<dyn ActionHandler>> {
        self.handlers.get(&call.name).ok_or_else(|| {
            WorkflowError::InvalidConfiguration(format!("unknown action '{}'", call.name))
        })
    }

    pub fn validate(&self, call: &ActionCall) -> WorkflowResult<()> {
        let handler = self.handler(call)?;
        if call.args.len() != handler.arity() {
            return Err(WorkflowError::InvalidArgument(format!(
                "action '{}' takes {} argument(s), got {}",
                call.name,
                handler.arity(),
                call.args.len()
            )));
        }
        handler.validate_args(&call.args)
    }

    pub async fn dispatch(&self, ctx: &mut ActionContext<'_>, call: &ActionCall) -> WorkflowResult<()> {
        self.validate(call)?;
        debug!(action = %call, track_id = ctx.state.id, "Dispatching action");
        self.handler(call)?
            .execute(ctx, &call.args)
            .await
            .map_err(|e| WorkflowError::from_action(&call.name, e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Category,
    ReferenceType,
}

impl FromStr for CheckKind {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "category" => Ok(CheckKind::Category),
            "reference_type" => Ok(CheckKind::ReferenceType),
            other => Err(WorkflowError::InvalidArgument(format!(
                "proceed_on_value cannot check '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalTagArgs {
    pub check: CheckKind,
    pub value: String,
    pub new_tag: String,
}

impl ConditionalTagArgs {
    pub fn parse(args: &[String], pattern: &TagPattern) -> WorkflowResult<Self> {
        let [check, value, new_tag] = args else {
            return Err(WorkflowError::InvalidArgument(format!(
                "proceed_on_value takes 3 arguments, got {}",
                args.len()
            )));
        };
        pattern.check(new_tag)?;
        Ok(Self {
            check: check.parse()?,
            value: value.clone(),
            new_tag: new_tag.clone(),
        })
    }

    pub fn matches(&self, reference: &Reference) -> bool {
        match self.check {
            CheckKind::Category => reference.category.as_deref() == Some(self.value.as_str()),
            CheckKind::ReferenceType => reference.reference_types.iter().any(|t| *t == self.value),
        }
    }
}

/// Start an extra track when a reference attribute has a given value.
pub struct ConditionalTag {
    pattern: TagPattern,
}

impl ConditionalTag {
    pub fn new(pattern: TagPattern) -> Self {
        Self { pattern }
    }
}

#[async_trait]
impl ActionHandler for ConditionalTag {
    fn arity(&self) -> usize {
        3
    }

    fn validate_args(&self, args: &[String]) -> WorkflowResult<()> {
        ConditionalTagArgs::parse(args, &self.pattern).map(|_| ())
    }

    async fn execute(&self, ctx: &mut ActionContext<'_>, args: &[String]) -> WorkflowResult<()> {
        let args = ConditionalTagArgs::parse(args, &self.pattern)?;
        if !args.matches(ctx.reference) {
            return Ok(());
        }
        if ctx.sibling_tags().await?.contains(&args.new_tag) {
            debug!(tag = %args.new_tag, reference_id = ctx.state.reference_id, "Tag already present");
            return Ok(());
        }

        let created = ctx
            .tx
            .insert_state(ctx.state.reference_id, &ctx.state.org, &args.new_tag, ctx.actor)
            .await?;
        info!(
            track_id = created.id,
            reference_id = created.reference_id,
            org = %created.org,
            tag = %created.tag,
            "Conditional track created"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_conditional_args_checked() {
        let pattern = TagPattern::default();
        let parsed =
            ConditionalTagArgs::parse(&args(&["category", "thesis", "ATP:0000200"]), &pattern).unwrap();
        assert_eq!(parsed.check, CheckKind::Category);

        assert!(matches!(
            ConditionalTagArgs::parse(&args(&["category", "thesis", "thesis needed"]), &pattern),
            Err(WorkflowError::InvalidArgument(_))
        ));
        assert!(matches!(
            ConditionalTagArgs::parse(&args(&["colour", "red", "ATP:0000200"]), &pattern),
            Err(WorkflowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_conditional_matches_reference() {
        let reference = Reference {
            id: 1,
            curie: "AGRKB:1".into(),
            category: Some("thesis".into()),
            reference_types: vec!["Review".into(), "Journal".into()],
        };
        let pattern = TagPattern::default();
        let by_type =
            ConditionalTagArgs::parse(&args(&["reference_type", "Review", "ATP:1"]), &pattern).unwrap();
        let by_category =
            ConditionalTagArgs::parse(&args(&["category", "research_article", "ATP:1"]), &pattern)
                .unwrap();
        assert!(by_type.matches(&reference));
        assert!(!by_category.matches(&reference));
    }

    #[test]
    fn test_registry_validation() {
        let registry = ActionRegistry::with_builtins();

        let unknown: ActionCall = "launch_rocket".parse().unwrap();
        assert!(matches!(
            registry.validate(&unknown),
            Err(WorkflowError::InvalidConfiguration(_))
        ));

        let wrong_arity: ActionCall = "add_subtasks::extra".parse().unwrap();
        assert!(matches!(
            registry.validate(&wrong_arity),
            Err(WorkflowError::InvalidArgument(_))
        ));

        let unknown_family: ActionCall = "sub_task_complete::banana extraction".parse().unwrap();
        assert!(matches!(
            registry.validate(&unknown_family),
            Err(WorkflowError::InvalidArgument(_))
        ));

        let ok: ActionCall = "sub_task_complete::reference classification".parse().unwrap();
        assert!(registry.validate(&ok).is_ok());
    }
}
