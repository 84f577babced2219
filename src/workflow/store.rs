// State Store - persistence seam for workflow rows, the version log and the
// read-only collaborator data (rules, references, files) transitions consult.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::errors::{WorkflowError, WorkflowResult};
use super::types::{
    Reference, ReferenceId, RuleRecord, TrackId, VersionOperation, WorkflowState,
    WorkflowStateVersion,
};

/// Row selection used by sweeps, listings and counters.
#[derive(Debug, Clone, Default)]
pub struct StateFilter {
    /// `None` matches every tag; an empty list matches nothing.
    pub tags: Option<Vec<String>>,
    pub org: Option<String>,
    pub reference_id: Option<ReferenceId>,
    pub updated_before: Option<DateTime<Utc>>,
    pub updated_after: Option<DateTime<Utc>>,
}

impl StateFilter {
    pub fn for_pair(reference_id: ReferenceId, org: &str) -> Self {
        Self {
            reference_id: Some(reference_id),
            org: Some(org.to_string()),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    pub fn matches(&self, state: &WorkflowState) -> bool {
        self.tags
            .as_ref()
            .map_or(true, |tags| tags.iter().any(|t| *t == state.tag))
            && self.org.as_ref().map_or(true, |org| *org == state.org)
            && self.reference_id.map_or(true, |id| id == state.reference_id)
            && self.updated_before.map_or(true, |before| state.updated_at < before)
            && self.updated_after.map_or(true, |after| state.updated_at >= after)
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Open a unit of work. Nothing it writes is visible until `commit`.
    async fn begin(&self) -> WorkflowResult<Box<dyn StoreTransaction>>;

    /// Clock used to stamp rows and version entries.
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[async_trait]
pub trait StoreTransaction: Send {
    async fn get_state(&mut self, id: TrackId) -> WorkflowResult<Option<WorkflowState>>;

    async fn find_states(&mut self, filter: &StateFilter) -> WorkflowResult<Vec<WorkflowState>>;

    /// Insert a new track; a duplicate (reference, org, tag) is rejected.
    async fn insert_state(
        &mut self,
        reference_id: ReferenceId,
        org: &str,
        tag: &str,
        actor: &str,
    ) -> WorkflowResult<WorkflowState>;

    /// Move `current` to `tag` in place. Fails with `Conflict` when the stored
    /// version no longer matches `current.version`.
    async fn update_tag(
        &mut self,
        current: &WorkflowState,
        tag: &str,
        actor: &str,
    ) -> WorkflowResult<WorkflowState>;

    async fn delete_state(&mut self, current: &WorkflowState, actor: &str) -> WorkflowResult<()>;

    /// Version log of one track, oldest first.
    async fn versions(&mut self, track_id: TrackId) -> WorkflowResult<Vec<WorkflowStateVersion>>;

    /// Version entries for a (reference, org) pair recorded at or after `since`.
    async fn versions_since(
        &mut self,
        reference_id: ReferenceId,
        org: &str,
        since: DateTime<Utc>,
    ) -> WorkflowResult<Vec<WorkflowStateVersion>>;

    async fn transition_rules(&mut self) -> WorkflowResult<Vec<RuleRecord>>;

    async fn reference(&mut self, id: ReferenceId) -> WorkflowResult<Option<Reference>>;

    async fn file_count(&mut self, reference_id: ReferenceId, org: &str) -> WorkflowResult<i64>;

    /// Savepoints nest; each `savepoint` must be closed by a release or a
    /// rollback to it.
    async fn savepoint(&mut self) -> WorkflowResult<()>;

    async fn rollback_to_savepoint(&mut self) -> WorkflowResult<()>;

    async fn release_savepoint(&mut self) -> WorkflowResult<()>;

    async fn commit(self: Box<Self>) -> WorkflowResult<()>;

    async fn rollback(self: Box<Self>) -> WorkflowResult<()>;
}

#[derive(Debug, Clone, Default)]
struct MemoryData {
    states: BTreeMap<TrackId, WorkflowState>,
    versions: Vec<WorkflowStateVersion>,
    rules: Vec<RuleRecord>,
    references: HashMap<ReferenceId, Reference>,
    files: HashMap<(ReferenceId, String), i64>,
    last_track_id: TrackId,
    last_sequence: i64,
}

impl MemoryData {
    fn record(
        &mut self,
        state: &WorkflowState,
        previous_tag: Option<String>,
        operation: VersionOperation,
        actor: &str,
        at: DateTime<Utc>,
    ) {
        self.last_sequence += 1;
        self.versions.push(WorkflowStateVersion {
            sequence: self.last_sequence,
            track_id: state.id,
            reference_id: state.reference_id,
            org: state.org.clone(),
            tag: state.tag.clone(),
            previous_tag,
            operation,
            actor: actor.to_string(),
            recorded_at: at,
        });
    }

    /// (reference, org, tag) identifies at most one row.
    fn ensure_unique(
        &self,
        reference_id: ReferenceId,
        org: &str,
        tag: &str,
        except: Option<TrackId>,
    ) -> WorkflowResult<()> {
        let duplicate = self.states.values().any(|s| {
            Some(s.id) != except && s.reference_id == reference_id && s.org == org && s.tag == tag
        });
        if duplicate {
            return Err(WorkflowError::DuplicateState {
                reference_id,
                org: org.to_string(),
                tag: tag.to_string(),
            });
        }
        Ok(())
    }

    fn insert(
        &mut self,
        reference_id: ReferenceId,
        org: &str,
        tag: &str,
        actor: &str,
        at: DateTime<Utc>,
    ) -> WorkflowResult<WorkflowState> {
        self.ensure_unique(reference_id, org, tag, None)?;

        self.last_track_id += 1;
        let state = WorkflowState {
            id: self.last_track_id,
            reference_id,
            org: org.to_string(),
            tag: tag.to_string(),
            version: 1,
            created_at: at,
            updated_at: at,
            updated_by: actor.to_string(),
        };
        self.states.insert(state.id, state.clone());
        self.record(&state, None, VersionOperation::Insert, actor, at);
        Ok(state)
    }
}

/// In-process store. Transactions are serialized: `begin` waits for the
/// previous unit of work to commit or roll back.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    data: Arc<Mutex<MemoryData>>,
    /// Pinned clock in epoch milliseconds; 0 follows the wall clock.
    pinned_millis: Arc<AtomicI64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the store clock. Later writes are stamped with `at`.
    pub fn set_time(&self, at: DateTime<Utc>) {
        self.pinned_millis
            .store(at.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn clear_time(&self) {
        self.pinned_millis.store(0, Ordering::SeqCst);
    }

    pub async fn add_reference(&self, reference: Reference) {
        self.data
            .lock()
            .await
            .references
            .insert(reference.id, reference);
    }

    pub async fn set_file_count(&self, reference_id: ReferenceId, org: &str, count: i64) {
        self.data
            .lock()
            .await
            .files
            .insert((reference_id, org.to_string()), count);
    }

    pub async fn add_rule(&self, rule: RuleRecord) {
        self.data.lock().await.rules.push(rule);
    }

    /// Insert a row outside any engine transition, logging it like any insert.
    pub async fn seed_state(
        &self,
        reference_id: ReferenceId,
        org: &str,
        tag: &str,
    ) -> WorkflowResult<WorkflowState> {
        let at = self.now();
        self.data
            .lock()
            .await
            .insert(reference_id, org, tag, "seed", at)
    }

    pub async fn states(&self) -> Vec<WorkflowState> {
        self.data.lock().await.states.values().cloned().collect()
    }

    pub async fn all_versions(&self) -> Vec<WorkflowStateVersion> {
        self.data.lock().await.versions.clone()
    }

    /// Tag changes of one track, oldest first. Inserts and deletes excluded.
    pub async fn transition_log(&self, track_id: TrackId) -> Vec<WorkflowStateVersion> {
        self.data
            .lock()
            .await
            .versions
            .iter()
            .filter(|v| v.track_id == track_id && v.operation == VersionOperation::Update)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn begin(&self) -> WorkflowResult<Box<dyn StoreTransaction>> {
        let guard = self.data.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            savepoints: Vec::new(),
            clock: self.clone(),
        }))
    }

    fn now(&self) -> DateTime<Utc> {
        match self.pinned_millis.load(Ordering::SeqCst) {
            0 => Utc::now(),
            millis => DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now),
        }
    }
}

pub struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryData>,
    working: MemoryData,
    savepoints: Vec<MemoryData>,
    clock: MemoryStore,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get_state(&mut self, id: TrackId) -> WorkflowResult<Option<WorkflowState>> {
        Ok(self.working.states.get(&id).cloned())
    }

    async fn find_states(&mut self, filter: &StateFilter) -> WorkflowResult<Vec<WorkflowState>> {
        Ok(self
            .working
            .states
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn insert_state(
        &mut self,
        reference_id: ReferenceId,
        org: &str,
        tag: &str,
        actor: &str,
    ) -> WorkflowResult<WorkflowState> {
        let at = self.clock.now();
        self.working.insert(reference_id, org, tag, actor, at)
    }

    async fn update_tag(
        &mut self,
        current: &WorkflowState,
        tag: &str,
        actor: &str,
    ) -> WorkflowResult<WorkflowState> {
        let at = self.clock.now();
        self.working
            .ensure_unique(current.reference_id, &current.org, tag, Some(current.id))?;
        let stored = self
            .working
            .states
            .get_mut(&current.id)
            .ok_or(WorkflowError::TrackNotFound(current.id))?;
        if stored.version != current.version {
            return Err(WorkflowError::Conflict(current.id));
        }

        let previous = std::mem::replace(&mut stored.tag, tag.to_string());
        stored.version += 1;
        stored.updated_at = at;
        stored.updated_by = actor.to_string();
        let updated = stored.clone();

        self.working
            .record(&updated, Some(previous), VersionOperation::Update, actor, at);
        Ok(updated)
    }

    async fn delete_state(&mut self, current: &WorkflowState, actor: &str) -> WorkflowResult<()> {
        let at = self.clock.now();
        let removed = self
            .working
            .states
            .remove(&current.id)
            .ok_or(WorkflowError::TrackNotFound(current.id))?;
        let previous = Some(removed.tag.clone());
        self.working
            .record(&removed, previous, VersionOperation::Delete, actor, at);
        Ok(())
    }

    async fn versions(&mut self, track_id: TrackId) -> WorkflowResult<Vec<WorkflowStateVersion>> {
        Ok(self
            .working
            .versions
            .iter()
            .filter(|v| v.track_id == track_id)
            .cloned()
            .collect())
    }

    async fn versions_since(
        &mut self,
        reference_id: ReferenceId,
        org: &str,
        since: DateTime<Utc>,
    ) -> WorkflowResult<Vec<WorkflowStateVersion>> {
        Ok(self
            .working
            .versions
            .iter()
            .filter(|v| v.reference_id == reference_id && v.org == org && v.recorded_at >= since)
            .cloned()
            .collect())
    }

    async fn transition_rules(&mut self) -> WorkflowResult<Vec<RuleRecord>> {
        Ok(self.working.rules.clone())
    }

    async fn reference(&mut self, id: ReferenceId) -> WorkflowResult<Option<Reference>> {
        Ok(self.working.references.get(&id).cloned())
    }

    async fn file_count(&mut self, reference_id: ReferenceId, org: &str) -> WorkflowResult<i64> {
        Ok(self
            .working
            .files
            .get(&(reference_id, org.to_string()))
            .copied()
            .unwrap_or(0))
    }

    async fn savepoint(&mut self) -> WorkflowResult<()> {
        self.savepoints.push(self.working.clone());
        Ok(())
    }

    async fn rollback_to_savepoint(&mut self) -> WorkflowResult<()> {
        let snapshot = self
            .savepoints
            .pop()
            .ok_or_else(|| WorkflowError::Storage("no open savepoint".to_string()))?;
        self.working = snapshot;
        Ok(())
    }

    async fn release_savepoint(&mut self) -> WorkflowResult<()> {
        self.savepoints
            .pop()
            .map(|_| ())
            .ok_or_else(|| WorkflowError::Storage("no open savepoint".to_string()))
    }

    async fn commit(self: Box<Self>) -> WorkflowResult<()> {
        let MemoryTransaction {
            mut guard, working, ..
        } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> WorkflowResult<()> {
        Ok(())
    }
}
