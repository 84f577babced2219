use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::workflow::types::JobFamily;

/// Main configuration structure for curation-flow
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CurationFlowConfig {
    /// Ontology service and resolver caches
    pub ontology: OntologyConfig,
    /// Transition engine settings
    pub workflow: WorkflowConfig,
    /// Stuck-job sweep settings
    pub reconciler: ReconcilerConfig,
    /// Operator notifications
    pub notifications: NotificationConfig,
    /// Logging settings
    pub observability: ObservabilityConfig,
    /// Database settings (optional)
    pub database: Option<DatabaseConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OntologyConfig {
    /// Base URL of the ontology service
    pub base_url: String,
    /// Bearer token (can be set via env var)
    pub api_token: Option<String>,
    /// Roots of the process hierarchy walked on load
    pub process_roots: Vec<String>,
    /// Prefix every tag identifier carries
    pub tag_prefix: String,
    pub requests_per_second: u32,
    pub burst_capacity: u32,
    pub request_timeout_seconds: u64,
    pub jobs_cache_ttl_hours: u64,
    pub descendants_cache_ttl_hours: u64,
    /// Seconds after a failed hierarchy load during which no reload is tried
    pub reload_backoff_seconds: u64,
}

impl Default for OntologyConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            api_token: None,
            process_roots: vec!["ATP:0000177".to_string(), "ATP:0000335".to_string()],
            tag_prefix: "ATP:".to_string(),
            requests_per_second: 5,
            burst_capacity: 20,
            request_timeout_seconds: 30,
            jobs_cache_ttl_hours: 12,
            descendants_cache_ttl_hours: 24,
            reload_backoff_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Actor recorded in the version log when none is given
    pub default_actor: String,
    /// Process roots allowed to hold several tracks per reference and org
    pub multiple_allowed_processes: Vec<String>,
    /// Job families added to or replacing the built-in ones
    pub job_families: HashMap<String, JobFamily>,
    /// File-driven resets and upload checks
    pub maintenance: MaintenanceConfig,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            default_actor: "default_user".to_string(),
            multiple_allowed_processes: Vec::new(),
            job_families: HashMap::new(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Processes whose tracks are removed when the main file goes away
    pub reset_processes: Vec<String>,
    /// File upload tags rewritten by the reset
    pub files_uploaded_tag: String,
    pub file_upload_in_progress_tag: String,
    pub file_needed_tag: String,
    /// Jobs that block a new upload while any of their tags is held,
    /// checked in order
    pub upload_blocking_jobs: Vec<RunningJobConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunningJobConfig {
    pub name: String,
    /// In-progress tag; every tag below it counts as well
    pub in_progress_tag: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        let job = |name: &str, tag: &str| RunningJobConfig {
            name: name.to_string(),
            in_progress_tag: tag.to_string(),
        };
        Self {
            reset_processes: vec![
                "ATP:0000161".to_string(),
                "ATP:0000165".to_string(),
                "ATP:0000172".to_string(),
            ],
            files_uploaded_tag: "ATP:0000134".to_string(),
            file_upload_in_progress_tag: "ATP:0000139".to_string(),
            file_needed_tag: "ATP:0000141".to_string(),
            upload_blocking_jobs: vec![
                job("text conversion", "ATP:0000198"),
                job("reference classification", "ATP:0000178"),
                job("entity extraction", "ATP:0000190"),
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Lock file preventing overlapping sweeps
    pub lock_file: String,
    /// Actor recorded for sweep writes; defaults to a host-qualified name
    pub actor: Option<String>,
    pub phases: Vec<PhaseConfig>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            lock_file: ".curation-flow/reconciler.lock".to_string(),
            actor: None,
            phases: vec![
                PhaseConfig {
                    name: "text conversion".to_string(),
                    job_family: None,
                    stuck_tags: vec!["ATP:0000198".to_string(), "ATP:0000164".to_string()],
                    restart_marker: "ATP:0000134".to_string(),
                    retry_tag: Some("ATP:0000162".to_string()),
                    failed_tag: Some("ATP:0000164".to_string()),
                    ..PhaseConfig::default()
                },
                PhaseConfig {
                    name: "reference classification".to_string(),
                    job_family: Some("reference classification".to_string()),
                    ..PhaseConfig::default()
                },
                PhaseConfig {
                    name: "entity extraction".to_string(),
                    job_family: Some("entity extraction".to_string()),
                    ..PhaseConfig::default()
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PhaseConfig {
    pub name: String,
    /// Set for multi-stage phases; the family's in-progress and failed
    /// subtrees are swept through the engine.
    pub job_family: Option<String>,
    /// Tags swept by a single-stage phase
    pub stuck_tags: Vec<String>,
    /// Tag whose recent appearance means the track was restarted
    pub restart_marker: String,
    pub retry_tag: Option<String>,
    pub failed_tag: Option<String>,
    pub window_weeks: i64,
    /// Entries into a stuck tag after which the track is failed outright
    pub max_attempts: usize,
    pub notify: bool,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            job_family: None,
            stuck_tags: Vec::new(),
            restart_marker: "ATP:0000134".to_string(),
            retry_tag: None,
            failed_tag: None,
            window_weeks: 6,
            max_attempts: 5,
            notify: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Slack-style incoming webhook; reports are only logged when unset
    pub webhook_url: Option<String>,
    /// Subject line; `{org}` is replaced by the organization
    pub subject_template: String,
    pub request_timeout_seconds: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            subject_template: "Report on stuck {org} Papers in workflows".to_string(),
            request_timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level
    pub log_level: String,
    /// Emit JSON lines instead of compact text
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Database URL (SQLite file path or connection string)
    pub url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Enable automatic migrations
    pub auto_migrate: bool,
}

impl Default for CurationFlowConfig {
    fn default() -> Self {
        Self {
            ontology: OntologyConfig::default(),
            workflow: WorkflowConfig::default(),
            reconciler: ReconcilerConfig::default(),
            notifications: NotificationConfig::default(),
            observability: ObservabilityConfig::default(),
            database: Some(DatabaseConfig {
                url: ".curation-flow/curation-flow.db".to_string(),
                max_connections: 5,
                auto_migrate: true,
            }),
        }
    }
}

impl CurationFlowConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration files (curation-flow.toml, .curation-flow-rc)
    /// 3. Environment variables (prefixed with CURATION_FLOW__)
    pub fn load() -> Result<Self> {
        Self::load_with_file(None)
    }

    /// Like `load`, with an explicit file taking the place of the default names.
    pub fn load_with_file(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) => {
                builder = builder.add_source(File::from(path));
            }
            None => {
                if Path::new("curation-flow.toml").exists() {
                    builder = builder.add_source(File::with_name("curation-flow"));
                }
                if Path::new(".curation-flow-rc").exists() {
                    builder = builder.add_source(
                        File::with_name(".curation-flow-rc").format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // Nested keys use a double underscore: CURATION_FLOW__ONTOLOGY__BASE_URL
        builder = builder.add_source(
            Environment::with_prefix("CURATION_FLOW")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut loaded: CurationFlowConfig = builder.build()?.try_deserialize()?;

        if loaded.ontology.api_token.is_none() {
            if let Ok(token) = std::env::var("ONTOLOGY_API_TOKEN") {
                loaded.ontology.api_token = Some(token);
            }
        }

        Ok(loaded)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let toml_content = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}

/// Global configuration instance
static CONFIG: std::sync::LazyLock<Result<CurationFlowConfig, anyhow::Error>> =
    std::sync::LazyLock::new(|| {
        // Load .env file first
        let _ = CurationFlowConfig::load_env_file();
        CurationFlowConfig::load()
    });

/// Get the global configuration
pub fn config() -> Result<&'static CurationFlowConfig> {
    CONFIG
        .as_ref()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
}

/// Initialize configuration (called at startup)
pub fn init_config() -> Result<()> {
    let _config = config()?;
    tracing::info!("Configuration loaded successfully");
    Ok(())
}
