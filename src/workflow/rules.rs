// Rule Set - the validated transition table
//
// Loaded once from raw records; every name, arity and scope overlap is checked
// before any transition may select from it.

use std::collections::HashMap;
use tracing::info;

use super::actions::ActionRegistry;
use super::errors::{WorkflowError, WorkflowResult};
use super::requirements::RequirementRegistry;
use super::types::{Role, RuleRecord, Target, TransitionRule};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum SelectionKey {
    To(String),
    Role(Role),
}

impl SelectionKey {
    fn describe(&self, from: &str) -> String {
        match self {
            SelectionKey::To(to) => format!("'{from}' -> '{to}'"),
            SelectionKey::Role(role) => format!("'{from}' on {role}"),
        }
    }
}

/// Two or more rules that could both answer the same request for some org.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleConflict {
    pub rule_ids: Vec<i64>,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<TransitionRule>,
}

impl RuleSet {
    /// Parse and validate raw records against the registries.
    pub fn load(
        records: Vec<RuleRecord>,
        requirements: &RequirementRegistry,
        actions: &ActionRegistry,
    ) -> WorkflowResult<Self> {
        let mut rules = Vec::with_capacity(records.len());
        for record in records {
            let id = record.id;
            let rule = TransitionRule::try_from(record).map_err(|e| {
                WorkflowError::InvalidConfiguration(format!("transition rule {id}: {e}"))
            })?;
            for call in &rule.requirements {
                requirements.validate(call)?;
            }
            for call in &rule.actions {
                actions.validate(call)?;
            }
            rules.push(rule);
        }

        if let Some(conflict) = Self::conflicts(&rules).into_iter().next() {
            return Err(WorkflowError::AmbiguousTransition {
                rule_ids: conflict.rule_ids,
                detail: conflict.detail,
            });
        }

        info!(rules = rules.len(), "Transition table loaded");
        Ok(Self { rules })
    }

    /// Every group of rules sharing a selection key with overlapping org scopes.
    pub fn conflicts(rules: &[TransitionRule]) -> Vec<RuleConflict> {
        let mut by_key: HashMap<(&str, SelectionKey), Vec<&TransitionRule>> = HashMap::new();
        for rule in rules {
            by_key
                .entry((rule.from_tag.as_str(), SelectionKey::To(rule.to_tag.clone())))
                .or_default()
                .push(rule);
            for role in rule.roles() {
                by_key
                    .entry((rule.from_tag.as_str(), SelectionKey::Role(role)))
                    .or_default()
                    .push(rule);
            }
        }

        let mut conflicts = Vec::new();
        for ((from, key), group) in by_key {
            for (i, a) in group.iter().enumerate() {
                for b in &group[i + 1..] {
                    if a.org_scope.overlaps(&b.org_scope) {
                        conflicts.push(RuleConflict {
                            rule_ids: vec![a.id, b.id],
                            detail: format!(
                                "{} for scopes {} and {}",
                                key.describe(from),
                                a.org_scope,
                                b.org_scope
                            ),
                        });
                    }
                }
            }
        }
        conflicts.sort_by(|a, b| a.rule_ids.cmp(&b.rule_ids));
        conflicts
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransitionRule> {
        self.rules.iter()
    }

    pub fn get(&self, id: i64) -> Option<&TransitionRule> {
        self.rules.iter().find(|r| r.id == id)
    }

    /// The single rule answering `target` from `from` for `org`.
    pub fn select(&self, org: &str, from: &str, target: &Target) -> WorkflowResult<&TransitionRule> {
        let matches: Vec<&TransitionRule> = self
            .rules
            .iter()
            .filter(|r| r.from_tag == from && r.org_scope.applies_to(org))
            .filter(|r| match target {
                Target::Tag(tag) => r.to_tag == *tag,
                Target::Role(role) => r.has_role(*role),
            })
            .collect();

        match matches.as_slice() {
            [] => Err(WorkflowError::NoTransition {
                org: org.to_string(),
                from: from.to_string(),
                to: target.to_string(),
            }),
            [rule] => Ok(*rule),
            many => Err(WorkflowError::AmbiguousTransition {
                rule_ids: many.iter().map(|r| r.id).collect(),
                detail: format!("'{from}' -> {target} for {org}"),
            }),
        }
    }

    /// Rules spawning subtasks when a track reaches `from`.
    pub fn fan_out(&self, org: &str, from: &str) -> Vec<&TransitionRule> {
        self.rules
            .iter()
            .filter(|r| r.from_tag == from && r.is_fan_out() && r.org_scope.applies_to(org))
            .collect()
    }

    /// Rules whose job condition mentions `job`.
    pub fn with_job<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a TransitionRule> + 'a {
        self.rules
            .iter()
            .filter(move |r| r.job_names().any(|name| name.contains(job)))
    }
}
