// SQLite-backed state store. Each unit of work is one sqlx transaction;
// nested savepoints are issued as plain SQL on the same connection.

#[cfg(feature = "database")]
use anyhow::Result;
#[cfg(feature = "database")]
use async_trait::async_trait;
#[cfg(feature = "database")]
use chrono::{DateTime, SecondsFormat, Utc};
#[cfg(feature = "database")]
use sqlx::{
    migrate::MigrateDatabase, sqlite::SqlitePoolOptions, sqlite::SqliteRow, QueryBuilder, Row,
    Sqlite, SqlitePool, Transaction,
};
#[cfg(feature = "database")]
use std::path::Path;
#[cfg(feature = "database")]
use tracing::{debug, info};

#[cfg(feature = "database")]
use crate::config::DatabaseConfig;
#[cfg(feature = "database")]
use crate::workflow::errors::{WorkflowError, WorkflowResult};
#[cfg(feature = "database")]
use crate::workflow::store::{StateFilter, StateStore, StoreTransaction};
#[cfg(feature = "database")]
use crate::workflow::types::{
    Reference, ReferenceId, RuleRecord, TrackId, VersionOperation, WorkflowState,
    WorkflowStateVersion,
};

#[cfg(feature = "database")]
const STATE_COLUMNS: &str =
    "id, reference_id, org, tag, version, created_at, updated_at, updated_by";

#[cfg(feature = "database")]
const VERSION_COLUMNS: &str =
    "sequence, track_id, reference_id, org, tag, previous_tag, operation, actor, recorded_at";

#[cfg(feature = "database")]
fn timestamp(at: DateTime<Utc>) -> String {
    // Fixed width so that text comparison orders like time
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(feature = "database")]
fn parse_timestamp(raw: &str) -> WorkflowResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| WorkflowError::Storage(format!("bad timestamp '{raw}': {e}")))
}

#[cfg(feature = "database")]
fn parse_json_list(raw: &str, column: &str) -> WorkflowResult<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| WorkflowError::Storage(format!("bad {column} value '{raw}': {e}")))
}

#[cfg(feature = "database")]
fn state_from_row(row: &SqliteRow) -> WorkflowResult<WorkflowState> {
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(WorkflowState {
        id: row.try_get("id")?,
        reference_id: row.try_get("reference_id")?,
        org: row.try_get("org")?,
        tag: row.try_get("tag")?,
        version: row.try_get("version")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
        updated_by: row.try_get("updated_by")?,
    })
}

#[cfg(feature = "database")]
fn version_from_row(row: &SqliteRow) -> WorkflowResult<WorkflowStateVersion> {
    let operation: String = row.try_get("operation")?;
    let recorded_at: String = row.try_get("recorded_at")?;
    Ok(WorkflowStateVersion {
        sequence: row.try_get("sequence")?,
        track_id: row.try_get("track_id")?,
        reference_id: row.try_get("reference_id")?,
        org: row.try_get("org")?,
        tag: row.try_get("tag")?,
        previous_tag: row.try_get("previous_tag")?,
        operation: operation.parse()?,
        actor: row.try_get("actor")?,
        recorded_at: parse_timestamp(&recorded_at)?,
    })
}

#[cfg(feature = "database")]
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Accepts either a `sqlite:` URL or a bare file path.
#[cfg(feature = "database")]
fn database_url(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}

#[cfg(feature = "database")]
/// Pool-backed store for workflow state, history, rules and reference data
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[cfg(feature = "database")]
impl SqliteStore {
    /// Open (creating if needed) the database and run migrations if enabled
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = database_url(&config.url);

        if !sqlx::Sqlite::database_exists(&url).await? {
            let path = url.trim_start_matches("sqlite://").trim_start_matches("sqlite:");
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            info!("Creating database at {}", url);
            sqlx::Sqlite::create_database(&url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect(&url)
            .await?;

        if config.auto_migrate {
            info!("Running database migrations...");
            sqlx::migrate!("./migrations").run(&pool).await?;
            info!("Database migrations completed");
        }

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace one transition rule
    pub async fn upsert_rule(&self, rule: &RuleRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO workflow_transition
                (id, org, from_tag, to_tag, requirements, actions, condition, transition_type)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(rule.id)
        .bind(&rule.org)
        .bind(&rule.from_tag)
        .bind(&rule.to_tag)
        .bind(serde_json::to_string(&rule.requirements)?)
        .bind(serde_json::to_string(&rule.actions)?)
        .bind(&rule.condition)
        .bind(&rule.transition_type)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or replace reference metadata
    pub async fn upsert_reference(&self, reference: &Reference) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO reference (id, curie, category, reference_types)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(reference.id)
        .bind(&reference.curie)
        .bind(&reference.category)
        .bind(serde_json::to_string(&reference.reference_types)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a file attached to a reference for one organization
    pub async fn add_reference_file(
        &self,
        reference_id: ReferenceId,
        org: &str,
        file_name: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reference_file (reference_id, org, file_name)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(reference_id)
        .bind(org)
        .bind(file_name)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl StateStore for SqliteStore {
    async fn begin(&self) -> WorkflowResult<Box<dyn StoreTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteTransaction { tx, depth: 0 }))
    }
}

#[cfg(feature = "database")]
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    depth: usize,
}

#[cfg(feature = "database")]
impl SqliteTransaction {
    #[allow(clippy::too_many_arguments)]
    async fn record(
        &mut self,
        track_id: TrackId,
        reference_id: ReferenceId,
        org: &str,
        tag: &str,
        previous_tag: Option<&str>,
        operation: VersionOperation,
        actor: &str,
        at: &str,
    ) -> WorkflowResult<()> {
        sqlx::query(
            r#"
            INSERT INTO workflow_state_version
                (track_id, reference_id, org, tag, previous_tag, operation, actor, recorded_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(track_id)
        .bind(reference_id)
        .bind(org)
        .bind(tag)
        .bind(previous_tag)
        .bind(operation.as_str())
        .bind(actor)
        .bind(at)
        .execute(&mut *self.tx)
        .await?;

        Ok(())
    }
}

#[cfg(feature = "database")]
#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn get_state(&mut self, id: TrackId) -> WorkflowResult<Option<WorkflowState>> {
        let row = sqlx::query(&format!(
            "SELECT {STATE_COLUMNS} FROM workflow_state WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        row.as_ref().map(state_from_row).transpose()
    }

    async fn find_states(&mut self, filter: &StateFilter) -> WorkflowResult<Vec<WorkflowState>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {STATE_COLUMNS} FROM workflow_state WHERE 1 = 1"
        ));

        if let Some(tags) = &filter.tags {
            if tags.is_empty() {
                return Ok(Vec::new());
            }
            query.push(" AND tag IN (");
            let mut separated = query.separated(", ");
            for tag in tags {
                separated.push_bind(tag.clone());
            }
            separated.push_unseparated(")");
        }
        if let Some(org) = &filter.org {
            query.push(" AND org = ").push_bind(org.clone());
        }
        if let Some(reference_id) = filter.reference_id {
            query.push(" AND reference_id = ").push_bind(reference_id);
        }
        if let Some(before) = filter.updated_before {
            query.push(" AND updated_at < ").push_bind(timestamp(before));
        }
        if let Some(after) = filter.updated_after {
            query.push(" AND updated_at >= ").push_bind(timestamp(after));
        }
        query.push(" ORDER BY id");

        let rows = query.build().fetch_all(&mut *self.tx).await?;
        rows.iter().map(state_from_row).collect()
    }

    async fn insert_state(
        &mut self,
        reference_id: ReferenceId,
        org: &str,
        tag: &str,
        actor: &str,
    ) -> WorkflowResult<WorkflowState> {
        let now = Utc::now();
        let at = timestamp(now);

        let result = sqlx::query(
            r#"
            INSERT INTO workflow_state
                (reference_id, org, tag, version, created_at, updated_at, updated_by)
            VALUES (?1, ?2, ?3, 1, ?4, ?4, ?5)
            "#,
        )
        .bind(reference_id)
        .bind(org)
        .bind(tag)
        .bind(&at)
        .bind(actor)
        .execute(&mut *self.tx)
        .await;

        let id = match result {
            Ok(done) => done.last_insert_rowid(),
            Err(err) if is_unique_violation(&err) => {
                return Err(WorkflowError::DuplicateState {
                    reference_id,
                    org: org.to_string(),
                    tag: tag.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        self.record(id, reference_id, org, tag, None, VersionOperation::Insert, actor, &at)
            .await?;
        debug!(track_id = id, reference_id, org, tag, "Inserted workflow state");

        self.get_state(id)
            .await?
            .ok_or(WorkflowError::TrackNotFound(id))
    }

    async fn update_tag(
        &mut self,
        current: &WorkflowState,
        tag: &str,
        actor: &str,
    ) -> WorkflowResult<WorkflowState> {
        let at = timestamp(Utc::now());

        let result = sqlx::query(
            r#"
            UPDATE workflow_state
            SET tag = ?1, version = version + 1, updated_at = ?2, updated_by = ?3
            WHERE id = ?4 AND version = ?5
            "#,
        )
        .bind(tag)
        .bind(&at)
        .bind(actor)
        .bind(current.id)
        .bind(current.version)
        .execute(&mut *self.tx)
        .await;

        let affected = match result {
            Ok(done) => done.rows_affected(),
            Err(err) if is_unique_violation(&err) => {
                return Err(WorkflowError::DuplicateState {
                    reference_id: current.reference_id,
                    org: current.org.clone(),
                    tag: tag.to_string(),
                })
            }
            Err(err) => return Err(err.into()),
        };

        if affected == 0 {
            return match self.get_state(current.id).await? {
                Some(_) => Err(WorkflowError::Conflict(current.id)),
                None => Err(WorkflowError::TrackNotFound(current.id)),
            };
        }

        self.record(
            current.id,
            current.reference_id,
            &current.org,
            tag,
            Some(&current.tag),
            VersionOperation::Update,
            actor,
            &at,
        )
        .await?;

        self.get_state(current.id)
            .await?
            .ok_or(WorkflowError::TrackNotFound(current.id))
    }

    async fn delete_state(&mut self, current: &WorkflowState, actor: &str) -> WorkflowResult<()> {
        let at = timestamp(Utc::now());

        let done = sqlx::query("DELETE FROM workflow_state WHERE id = ?1 AND version = ?2")
            .bind(current.id)
            .bind(current.version)
            .execute(&mut *self.tx)
            .await?;

        if done.rows_affected() == 0 {
            return match self.get_state(current.id).await? {
                Some(_) => Err(WorkflowError::Conflict(current.id)),
                None => Err(WorkflowError::TrackNotFound(current.id)),
            };
        }

        self.record(
            current.id,
            current.reference_id,
            &current.org,
            &current.tag,
            Some(&current.tag),
            VersionOperation::Delete,
            actor,
            &at,
        )
        .await
    }

    async fn versions(&mut self, track_id: TrackId) -> WorkflowResult<Vec<WorkflowStateVersion>> {
        let rows = sqlx::query(&format!(
            "SELECT {VERSION_COLUMNS} FROM workflow_state_version WHERE track_id = ?1 ORDER BY sequence"
        ))
        .bind(track_id)
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(version_from_row).collect()
    }

    async fn versions_since(
        &mut self,
        reference_id: ReferenceId,
        org: &str,
        since: DateTime<Utc>,
    ) -> WorkflowResult<Vec<WorkflowStateVersion>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {VERSION_COLUMNS} FROM workflow_state_version
            WHERE reference_id = ?1 AND org = ?2 AND recorded_at >= ?3
            ORDER BY sequence
            "#
        ))
        .bind(reference_id)
        .bind(org)
        .bind(timestamp(since))
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter().map(version_from_row).collect()
    }

    async fn transition_rules(&mut self) -> WorkflowResult<Vec<RuleRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, org, from_tag, to_tag, requirements, actions, condition, transition_type
            FROM workflow_transition
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await?;

        rows.iter()
            .map(|row| -> WorkflowResult<RuleRecord> {
                let requirements: String = row.try_get("requirements")?;
                let actions: String = row.try_get("actions")?;
                Ok(RuleRecord {
                    id: row.try_get("id")?,
                    org: row.try_get("org")?,
                    from_tag: row.try_get("from_tag")?,
                    to_tag: row.try_get("to_tag")?,
                    requirements: parse_json_list(&requirements, "requirements")?,
                    actions: parse_json_list(&actions, "actions")?,
                    condition: row.try_get("condition")?,
                    transition_type: row.try_get("transition_type")?,
                })
            })
            .collect()
    }

    async fn reference(&mut self, id: ReferenceId) -> WorkflowResult<Option<Reference>> {
        let row = sqlx::query(
            "SELECT id, curie, category, reference_types FROM reference WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => {
                let types: String = row.try_get("reference_types")?;
                Ok(Some(Reference {
                    id: row.try_get("id")?,
                    curie: row.try_get("curie")?,
                    category: row.try_get("category")?,
                    reference_types: parse_json_list(&types, "reference_types")?,
                }))
            }
            None => Ok(None),
        }
    }

    async fn file_count(&mut self, reference_id: ReferenceId, org: &str) -> WorkflowResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS files FROM reference_file WHERE reference_id = ?1 AND org = ?2",
        )
        .bind(reference_id)
        .bind(org)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(row.try_get("files")?)
    }

    async fn savepoint(&mut self) -> WorkflowResult<()> {
        self.depth += 1;
        sqlx::query(&format!("SAVEPOINT flow_sp_{}", self.depth))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> WorkflowResult<()> {
        if self.depth == 0 {
            return Err(WorkflowError::Storage("no open savepoint".to_string()));
        }
        let name = format!("flow_sp_{}", self.depth);
        sqlx::query(&format!("ROLLBACK TO SAVEPOINT {name}"))
            .execute(&mut *self.tx)
            .await?;
        sqlx::query(&format!("RELEASE SAVEPOINT {name}"))
            .execute(&mut *self.tx)
            .await?;
        self.depth -= 1;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> WorkflowResult<()> {
        if self.depth == 0 {
            return Err(WorkflowError::Storage("no open savepoint".to_string()));
        }
        sqlx::query(&format!("RELEASE SAVEPOINT flow_sp_{}", self.depth))
            .execute(&mut *self.tx)
            .await?;
        self.depth -= 1;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> WorkflowResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> WorkflowResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(all(test, feature = "database"))]
mod tests {
    use super::*;

    async fn open(dir: &tempfile::TempDir) -> SqliteStore {
        let config = DatabaseConfig {
            url: dir.path().join("flow.db").display().to_string(),
            max_connections: 1,
            auto_migrate: true,
        };
        SqliteStore::connect(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_update_keeps_id_and_logs_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let mut tx = store.begin().await.unwrap();
        let state = tx.insert_state(7, "WB", "ATP:0000141", "tester").await.unwrap();
        let moved = tx.update_tag(&state, "ATP:0000134", "tester").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(moved.id, state.id);
        assert_eq!(moved.version, state.version + 1);

        let mut tx = store.begin().await.unwrap();
        let versions = tx.versions(state.id).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[1].previous_tag.as_deref(), Some("ATP:0000141"));
    }

    #[tokio::test]
    async fn test_rollback_to_savepoint_discards_nested_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let mut tx = store.begin().await.unwrap();
        let state = tx.insert_state(7, "WB", "ATP:0000141", "tester").await.unwrap();
        tx.savepoint().await.unwrap();
        tx.update_tag(&state, "ATP:0000134", "tester").await.unwrap();
        tx.rollback_to_savepoint().await.unwrap();

        let current = tx.get_state(state.id).await.unwrap().unwrap();
        assert_eq!(current.tag, "ATP:0000141");
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_writes_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        let mut tx = store.begin().await.unwrap();
        let state = tx.insert_state(7, "WB", "ATP:0000141", "tester").await.unwrap();
        let duplicate = tx.insert_state(7, "WB", "ATP:0000141", "tester").await;
        assert!(matches!(duplicate, Err(WorkflowError::DuplicateState { .. })));

        tx.update_tag(&state, "ATP:0000134", "tester").await.unwrap();
        let stale = tx.update_tag(&state, "ATP:0000162", "tester").await;
        assert!(matches!(stale, Err(WorkflowError::Conflict(_))));
        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_rules_and_references_round_trip_json_columns() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir).await;

        store
            .upsert_rule(&RuleRecord {
                id: 1,
                org: "ALL".into(),
                from_tag: "ATP:0000141".into(),
                to_tag: "ATP:0000134".into(),
                requirements: vec!["files_present".into()],
                actions: vec!["proceed_on_value::category::thesis::ATP:0000162".into()],
                condition: Some("on_success".into()),
                transition_type: "any".into(),
            })
            .await
            .unwrap();
        store
            .upsert_reference(&Reference {
                id: 7,
                curie: "AGRKB:101000000000007".into(),
                category: Some("thesis".into()),
                reference_types: vec!["Journal".into()],
            })
            .await
            .unwrap();
        store.add_reference_file(7, "WB", "main.pdf").await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let rules = tx.transition_rules().await.unwrap();
        assert_eq!(rules[0].requirements, vec!["files_present".to_string()]);
        let reference = tx.reference(7).await.unwrap().unwrap();
        assert_eq!(reference.reference_types, vec!["Journal".to_string()]);
        assert_eq!(tx.file_count(7, "WB").await.unwrap(), 1);
        assert_eq!(tx.file_count(7, "FB").await.unwrap(), 0);
        tx.rollback().await.unwrap();
    }
}
