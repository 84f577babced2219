// Curation Flow Library - workflow tag transitions for literature curation
// This exposes the core components for testing and integration

pub mod config;
pub mod database;
pub mod notify;
pub mod ontology;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use config::{config, init_config, CurationFlowConfig};
#[cfg(feature = "database")]
pub use database::SqliteStore;
pub use notify::{LogNotifier, Notification, NotificationSink, WebhookNotifier};
pub use ontology::{HttpOntologyClient, OntologyError, OntologyResolver, OntologyService};
pub use telemetry::{generate_correlation_id, init_telemetry};
pub use workflow::{
    CallerMode, EngineSettings, ErrorKind, JobLifecycle, MemoryStore, Role, StateStore,
    StuckJobReconciler, Target, TransitionEngine, WorkflowError, WorkflowResult,
};
