// Workflow Types - rows, audit entries, rule definitions and call targets
//
// Tags are ontology identifiers (e.g. "ATP:0000162"). Organizations are
// referenced by their abbreviation ("WB", "FB", ...).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::WorkflowError;

pub type TrackId = i64;
pub type ReferenceId = i64;

/// Current state of one curation track for a (reference, org) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: TrackId,
    pub reference_id: ReferenceId,
    pub org: String,
    pub tag: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionOperation {
    Insert,
    Update,
    Delete,
}

impl VersionOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionOperation::Insert => "insert",
            VersionOperation::Update => "update",
            VersionOperation::Delete => "delete",
        }
    }
}

impl FromStr for VersionOperation {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(VersionOperation::Insert),
            "update" => Ok(VersionOperation::Update),
            "delete" => Ok(VersionOperation::Delete),
            other => Err(WorkflowError::Storage(format!(
                "unknown version operation '{other}'"
            ))),
        }
    }
}

/// Append-only audit entry written for every insert, update and delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowStateVersion {
    pub sequence: i64,
    pub track_id: TrackId,
    pub reference_id: ReferenceId,
    pub org: String,
    /// Tag after the change (the removed tag for deletes).
    pub tag: String,
    pub previous_tag: Option<String>,
    pub operation: VersionOperation,
    pub actor: String,
    pub recorded_at: DateTime<Utc>,
}

/// Reference metadata consulted by requirements and actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub id: ReferenceId,
    pub curie: String,
    pub category: Option<String>,
    #[serde(default)]
    pub reference_types: Vec<String>,
}

/// Which organizations a transition rule applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OrgScope {
    All,
    Only(String),
    Except(String),
}

impl OrgScope {
    pub fn applies_to(&self, org: &str) -> bool {
        match self {
            OrgScope::All => true,
            OrgScope::Only(o) => o == org,
            OrgScope::Except(o) => o != org,
        }
    }

    /// Whether some organization falls inside both scopes.
    pub fn overlaps(&self, other: &OrgScope) -> bool {
        match (self, other) {
            (OrgScope::All, _) | (_, OrgScope::All) => true,
            (OrgScope::Only(a), OrgScope::Only(b)) => a == b,
            (OrgScope::Only(a), OrgScope::Except(b)) | (OrgScope::Except(b), OrgScope::Only(a)) => {
                a != b
            }
            (OrgScope::Except(_), OrgScope::Except(_)) => true,
        }
    }
}

impl FromStr for OrgScope {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(WorkflowError::InvalidConfiguration(
                "empty organization scope".to_string(),
            ));
        }
        if s.eq_ignore_ascii_case("all") {
            return Ok(OrgScope::All);
        }
        match s.strip_prefix("NOT_") {
            Some("") => Err(WorkflowError::InvalidConfiguration(format!(
                "organization scope '{s}' names no organization"
            ))),
            Some(org) => Ok(OrgScope::Except(org.to_string())),
            None => Ok(OrgScope::Only(s.to_string())),
        }
    }
}

impl fmt::Display for OrgScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrgScope::All => write!(f, "ALL"),
            OrgScope::Only(org) => write!(f, "{org}"),
            OrgScope::Except(org) => write!(f, "NOT_{org}"),
        }
    }
}

/// Symbolic transition roles carried in a rule's condition list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Start,
    Success,
    Failed,
    Retry,
}

impl Role {
    pub fn condition(&self) -> &'static str {
        match self {
            Role::Start => "on_start",
            Role::Success => "on_success",
            Role::Failed => "on_failed",
            Role::Retry => "on_retry",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.condition())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    Role(Role),
    AddSubtask,
    /// Marks the rule's target as a job a worker should pick up.
    Job(String),
}

impl Condition {
    /// Parse a comma separated condition column.
    pub fn parse_list(raw: Option<&str>) -> Result<Vec<Condition>, WorkflowError> {
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };
        raw.split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(Condition::from_str)
            .collect()
    }
}

impl FromStr for Condition {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on_start" => Ok(Condition::Role(Role::Start)),
            "on_success" => Ok(Condition::Role(Role::Success)),
            "on_failed" => Ok(Condition::Role(Role::Failed)),
            "on_retry" => Ok(Condition::Role(Role::Retry)),
            "add_subtask" => Ok(Condition::AddSubtask),
            job if job.ends_with("_job") => Ok(Condition::Job(job.to_string())),
            other => Err(WorkflowError::InvalidConfiguration(format!(
                "unknown transition condition '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Role(role) => f.write_str(role.condition()),
            Condition::AddSubtask => f.write_str("add_subtask"),
            Condition::Job(job) => f.write_str(job),
        }
    }
}

/// Which callers may perform a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransitionMode {
    Any,
    AutomatedOnly,
    ManualOnly,
}

impl TransitionMode {
    pub fn permits(&self, caller: CallerMode) -> bool {
        matches!(
            (self, caller),
            (TransitionMode::Any, _)
                | (TransitionMode::AutomatedOnly, CallerMode::Automated)
                | (TransitionMode::ManualOnly, CallerMode::Manual)
        )
    }
}

impl FromStr for TransitionMode {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "any" => Ok(TransitionMode::Any),
            "automated_only" => Ok(TransitionMode::AutomatedOnly),
            "manual_only" => Ok(TransitionMode::ManualOnly),
            other => Err(WorkflowError::InvalidConfiguration(format!(
                "unknown transition type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for TransitionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransitionMode::Any => "any",
            TransitionMode::AutomatedOnly => "automated_only",
            TransitionMode::ManualOnly => "manual_only",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallerMode {
    Automated,
    Manual,
}

impl fmt::Display for CallerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallerMode::Automated => "automated",
            CallerMode::Manual => "manual",
        })
    }
}

/// Destination of a transition request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Tag(String),
    Role(Role),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tag(tag) => f.write_str(tag),
            Target::Role(role) => write!(f, "{role}"),
        }
    }
}

/// Requirement reference inside a rule, with optional `not_` negation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequirementCall {
    pub name: String,
    pub negated: bool,
}

impl FromStr for RequirementCall {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (name, negated) = match s.strip_prefix("not_") {
            Some(rest) => (rest, true),
            None => (s, false),
        };
        if name.is_empty() {
            return Err(WorkflowError::InvalidConfiguration(format!(
                "malformed requirement '{s}'"
            )));
        }
        Ok(RequirementCall {
            name: name.to_string(),
            negated,
        })
    }
}

impl fmt::Display for RequirementCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "not_{}", self.name)
        } else {
            f.write_str(&self.name)
        }
    }
}

/// Action reference parsed from the `name::arg1::arg2` string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionCall {
    pub name: String,
    pub args: Vec<String>,
}

pub const ACTION_ARG_DELIMITER: &str = "::";

impl FromStr for ActionCall {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(ACTION_ARG_DELIMITER);
        let name = parts.next().unwrap_or_default().trim();
        if name.is_empty() {
            return Err(WorkflowError::InvalidConfiguration(format!(
                "malformed action '{s}'"
            )));
        }
        Ok(ActionCall {
            name: name.to_string(),
            args: parts.map(|a| a.to_string()).collect(),
        })
    }
}

impl fmt::Display for ActionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, "{ACTION_ARG_DELIMITER}{arg}")?;
        }
        Ok(())
    }
}

/// Raw transition row as stored or configured, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub id: i64,
    pub org: String,
    pub from_tag: String,
    pub to_tag: String,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub actions: Vec<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default = "default_transition_type")]
    pub transition_type: String,
}

fn default_transition_type() -> String {
    "any".to_string()
}

/// Validated, typed transition rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRule {
    pub id: i64,
    pub org_scope: OrgScope,
    pub from_tag: String,
    pub to_tag: String,
    pub requirements: Vec<RequirementCall>,
    pub actions: Vec<ActionCall>,
    pub conditions: Vec<Condition>,
    pub mode: TransitionMode,
}

impl TransitionRule {
    pub fn has_role(&self, role: Role) -> bool {
        self.conditions.contains(&Condition::Role(role))
    }

    pub fn is_fan_out(&self) -> bool {
        self.conditions.contains(&Condition::AddSubtask)
    }

    pub fn job_names(&self) -> impl Iterator<Item = &str> {
        self.conditions.iter().filter_map(|c| match c {
            Condition::Job(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.conditions.iter().filter_map(|c| match c {
            Condition::Role(role) => Some(*role),
            _ => None,
        })
    }
}

impl TryFrom<RuleRecord> for TransitionRule {
    type Error = WorkflowError;

    fn try_from(record: RuleRecord) -> Result<Self, Self::Error> {
        let requirements = record
            .requirements
            .iter()
            .filter(|r| !r.trim().is_empty())
            .map(|r| r.parse())
            .collect::<Result<Vec<_>, _>>()?;
        let actions = record
            .actions
            .iter()
            .filter(|a| !a.trim().is_empty())
            .map(|a| a.parse())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TransitionRule {
            id: record.id,
            org_scope: record.org.parse()?,
            from_tag: record.from_tag,
            to_tag: record.to_tag,
            requirements,
            actions,
            conditions: Condition::parse_list(record.condition.as_deref())?,
            mode: record.transition_type.parse()?,
        })
    }
}

pub const DEFAULT_TAG_PREFIX: &str = "ATP:";

/// Identifier convention every tag written by an action must follow:
/// the configured prefix, then a non-empty local id without whitespace.
#[derive(Debug, Clone)]
pub struct TagPattern {
    prefix: String,
}

impl TagPattern {
    pub fn new(prefix: &str) -> Result<Self, WorkflowError> {
        if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
            return Err(WorkflowError::InvalidConfiguration(format!(
                "tag prefix '{prefix}' must be non-empty and contain no whitespace"
            )));
        }
        Ok(Self {
            prefix: prefix.to_string(),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn is_valid(&self, tag: &str) -> bool {
        tag.strip_prefix(self.prefix.as_str())
            .is_some_and(|local| !local.is_empty() && !local.chars().any(char::is_whitespace))
    }

    pub fn check(&self, tag: &str) -> Result<(), WorkflowError> {
        if self.is_valid(tag) {
            Ok(())
        } else {
            Err(WorkflowError::InvalidArgument(format!(
                "'{tag}' is not a tag identifier (expected prefix '{}')",
                self.prefix
            )))
        }
    }
}

impl Default for TagPattern {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_TAG_PREFIX.to_string(),
        }
    }
}

/// A 5-tag vocabulary describing one multi-subtask job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFamily {
    pub main: String,
    pub needed: String,
    pub in_progress: String,
    pub complete: String,
    pub failed: String,
}

impl JobFamily {
    pub fn tags(&self) -> [&str; 5] {
        [
            &self.main,
            &self.needed,
            &self.in_progress,
            &self.complete,
            &self.failed,
        ]
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.tags().contains(&tag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_org_scope_parsing() {
        assert_eq!("ALL".parse::<OrgScope>().unwrap(), OrgScope::All);
        assert_eq!("WB".parse::<OrgScope>().unwrap(), OrgScope::Only("WB".into()));
        assert_eq!(
            "NOT_WB".parse::<OrgScope>().unwrap(),
            OrgScope::Except("WB".into())
        );
        assert!("NOT_".parse::<OrgScope>().is_err());
    }

    #[test]
    fn test_org_scope_overlap() {
        let wb = OrgScope::Only("WB".into());
        let fb = OrgScope::Only("FB".into());
        let not_wb = OrgScope::Except("WB".into());

        assert!(OrgScope::All.overlaps(&wb));
        assert!(!wb.overlaps(&fb));
        assert!(!wb.overlaps(&not_wb));
        assert!(fb.overlaps(&not_wb));
        assert!(not_wb.overlaps(&OrgScope::Except("FB".into())));
    }

    #[test]
    fn test_condition_list() {
        let conditions = Condition::parse_list(Some("on_success, text_convert_job")).unwrap();
        assert_eq!(
            conditions,
            vec![
                Condition::Role(Role::Success),
                Condition::Job("text_convert_job".into())
            ]
        );
        assert!(Condition::parse_list(Some("on_banana")).is_err());
        assert!(Condition::parse_list(None).unwrap().is_empty());
    }

    #[test]
    fn test_requirement_negation() {
        let call: RequirementCall = "not_referencefiles_present".parse().unwrap();
        assert!(call.negated);
        assert_eq!(call.name, "referencefiles_present");
        assert_eq!(call.to_string(), "not_referencefiles_present");
    }

    #[test]
    fn test_mode_permits() {
        assert!(TransitionMode::Any.permits(CallerMode::Manual));
        assert!(!TransitionMode::ManualOnly.permits(CallerMode::Automated));
        assert!(!TransitionMode::AutomatedOnly.permits(CallerMode::Manual));
    }

    #[test]
    fn test_tag_pattern() {
        let pattern = TagPattern::default();
        assert!(pattern.is_valid("ATP:0000162"));
        assert!(!pattern.is_valid("ATP:"));
        assert!(!pattern.is_valid("GO:0000162"));
        assert!(!pattern.is_valid("ATP:00 162"));
        assert!(matches!(
            pattern.check("file uploaded"),
            Err(WorkflowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rule_record_conversion() {
        let record = RuleRecord {
            id: 7,
            org: "NOT_WB".into(),
            from_tag: "ATP:0000141".into(),
            to_tag: "ATP:0000166".into(),
            requirements: vec!["referencefiles_present".into()],
            actions: vec!["proceed_on_value::category::thesis::ATP:0000200".into()],
            condition: Some("on_success".into()),
            transition_type: "automated_only".into(),
        };
        let rule = TransitionRule::try_from(record).unwrap();
        assert_eq!(rule.org_scope, OrgScope::Except("WB".into()));
        assert_eq!(rule.actions[0].args.len(), 3);
        assert!(rule.has_role(Role::Success));
        assert_eq!(rule.mode, TransitionMode::AutomatedOnly);
    }

    proptest! {
        #[test]
        fn action_call_display_parses_back(
            name in "[a-z_]{1,20}",
            args in proptest::collection::vec("[A-Za-z0-9_]{0,6}(:[A-Za-z0-9_]{1,7})?", 0..4),
        ) {
            let call = ActionCall { name: name.clone(), args: args.clone() };
            let parsed: ActionCall = call.to_string().parse().unwrap();
            prop_assert_eq!(parsed, call);
        }

        #[test]
        fn action_call_name_never_contains_delimiter(raw in ".{0,40}") {
            if let Ok(call) = raw.parse::<ActionCall>() {
                prop_assert!(!call.name.contains(ACTION_ARG_DELIMITER));
                prop_assert!(!call.name.is_empty());
            }
        }
    }
}
