// Workflow Module - tag transitions for literature curation tracks
//
// Each (reference, org) pair carries one row per curation process. Rows move
// between ontology tags according to a per-organization transition table.

pub mod actions;
pub mod counters;
pub mod engine;
pub mod errors;
pub mod jobs;
pub mod maintenance;
pub mod reconciler;
pub mod requirements;
pub mod rules;
pub mod store;
pub mod subtasks;
pub mod types;

pub use actions::{ActionContext, ActionHandler, ActionRegistry};
pub use counters::{CounterQuery, DateFrequency, TagCounter};
pub use engine::{EngineSettings, TransitionEngine};
pub use errors::{ErrorKind, WorkflowError, WorkflowResult};
pub use jobs::{JobEntry, JobLifecycle, JobQuery};
pub use maintenance::{DiagramNode, ResetOutcome, StatusCount, StatusReport, StatusRow};
pub use reconciler::{PhaseReport, StuckJobReconciler, SweepDecision, SweepLock, SweepPhase};
pub use requirements::{Requirement, RequirementRegistry};
pub use rules::{RuleConflict, RuleSet};
pub use store::{MemoryStore, StateFilter, StateStore, StoreTransaction};
pub use subtasks::JobFamilies;
pub use types::{
    ActionCall, CallerMode, JobFamily, OrgScope, Reference, RequirementCall, Role, RuleRecord,
    TagPattern, Target, TrackId, TransitionMode, TransitionRule, VersionOperation, WorkflowState,
    WorkflowStateVersion,
};
