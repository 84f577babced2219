use moka::future::Cache;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::client::{OntologyService, OntologyTerm};
use super::OntologyError;
use crate::config::OntologyConfig;

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    /// Process roots: the load walk starts here and `process_root_of` stops here.
    pub process_roots: Vec<String>,
    pub tag_prefix: String,
    pub jobs_ttl: Duration,
    pub descendants_ttl: Duration,
    /// After a failed load, queries fail fast for this long instead of
    /// reloading against a service that is down.
    pub reload_backoff: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            process_roots: vec!["ATP:0000177".to_string(), "ATP:0000335".to_string()],
            tag_prefix: "ATP:".to_string(),
            jobs_ttl: Duration::from_secs(12 * 60 * 60),
            descendants_ttl: Duration::from_secs(24 * 60 * 60),
            reload_backoff: Duration::from_secs(30),
        }
    }
}

impl From<&OntologyConfig> for ResolverSettings {
    fn from(config: &OntologyConfig) -> Self {
        Self {
            process_roots: config.process_roots.clone(),
            tag_prefix: config.tag_prefix.clone(),
            jobs_ttl: Duration::from_secs(config.jobs_cache_ttl_hours * 60 * 60),
            descendants_ttl: Duration::from_secs(config.descendants_cache_ttl_hours * 60 * 60),
            reload_backoff: Duration::from_secs(config.reload_backoff_seconds),
        }
    }
}

#[derive(Debug, Default)]
struct Hierarchy {
    names: HashMap<String, String>,
    ids_by_name: HashMap<String, String>,
    parents: HashMap<String, String>,
    children: HashMap<String, Vec<String>>,
}

impl Hierarchy {
    fn is_incomplete(&self) -> bool {
        self.names.is_empty()
            || self.ids_by_name.is_empty()
            || self.parents.is_empty()
            || self.children.is_empty()
    }

    fn record_name(&mut self, id: &str, name: &str) {
        self.names.insert(id.to_string(), name.to_string());
        self.ids_by_name.insert(name.to_string(), id.to_string());
    }

    /// Record a descendant closure fetched for `frontier`. The frontier becomes
    /// the parent of every descendant that has none yet, so deeper nodes end up
    /// parented by the first frontier that saw them.
    fn merge_closure(&mut self, frontier: &str, terms: &[OntologyTerm]) {
        for term in terms {
            self.record_name(&term.curie, &term.name);
            self.parents
                .entry(term.curie.clone())
                .or_insert_with(|| frontier.to_string());
            let children = self.children.entry(frontier.to_string()).or_default();
            if !children.contains(&term.curie) {
                children.push(term.curie.clone());
            }
        }
    }

    fn subtree(&self, root: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([root]);
        while let Some(node) = queue.pop_front() {
            for child in self.children.get(node).into_iter().flatten() {
                if child != root && found.insert(child.clone()) {
                    queue.push_back(child);
                }
            }
        }
        found
    }
}

/// Cached view of the ontology hierarchy.
///
/// Base maps start empty and are rebuilt in full whenever any of them is empty
/// at query time. Subtree and job queries sit behind TTL caches that writes do
/// not invalidate.
pub struct OntologyResolver {
    service: Arc<dyn OntologyService>,
    settings: ResolverSettings,
    hierarchy: RwLock<Hierarchy>,
    reload_lock: Mutex<()>,
    /// Time and reason of the last failed load.
    last_failure: RwLock<Option<(Instant, String)>>,
    descendants_cache: Cache<String, Arc<BTreeSet<String>>>,
    jobs_cache: Cache<(String, String), Arc<Vec<String>>>,
}

impl OntologyResolver {
    pub fn new(service: Arc<dyn OntologyService>, settings: ResolverSettings) -> Self {
        let descendants_cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(settings.descendants_ttl)
            .build();
        let jobs_cache = Cache::builder()
            .max_capacity(1000)
            .time_to_live(settings.jobs_ttl)
            .build();

        Self {
            service,
            settings,
            hierarchy: RwLock::new(Hierarchy::default()),
            reload_lock: Mutex::new(()),
            last_failure: RwLock::new(None),
            descendants_cache,
            jobs_cache,
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    pub fn is_process_root(&self, tag: &str) -> bool {
        self.settings.process_roots.iter().any(|r| r == tag)
    }

    /// Whether `value` looks like an identifier rather than a term name.
    pub fn is_identifier(&self, value: &str) -> bool {
        value.starts_with(&self.settings.tag_prefix)
    }

    /// Rebuild the base maps now, regardless of their state.
    pub async fn reload(&self) -> Result<(), OntologyError> {
        let _guard = self.reload_lock.lock().await;
        self.load_and_record().await
    }

    /// Drop every cached map and query result.
    pub async fn invalidate(&self) {
        let _guard = self.reload_lock.lock().await;
        *self.hierarchy.write().await = Hierarchy::default();
        *self.last_failure.write().await = None;
        self.descendants_cache.invalidate_all();
        self.jobs_cache.invalidate_all();
        debug!("Ontology caches invalidated");
    }

    async fn ensure_loaded(&self) -> Result<(), OntologyError> {
        if !self.hierarchy.read().await.is_incomplete() {
            return Ok(());
        }
        let _guard = self.reload_lock.lock().await;
        // Another caller may have finished the reload while we waited.
        if !self.hierarchy.read().await.is_incomplete() {
            return Ok(());
        }
        self.check_backoff().await?;
        self.load_and_record().await
    }

    async fn check_backoff(&self) -> Result<(), OntologyError> {
        if let Some((failed_at, reason)) = self.last_failure.read().await.as_ref() {
            let elapsed = failed_at.elapsed();
            if elapsed < self.settings.reload_backoff {
                let remaining = self.settings.reload_backoff - elapsed;
                return Err(OntologyError::Backoff {
                    reason: reason.clone(),
                    retry_in_secs: remaining.as_secs().max(1),
                });
            }
        }
        Ok(())
    }

    /// Caller must hold `reload_lock`.
    async fn load_and_record(&self) -> Result<(), OntologyError> {
        let result = self.load_hierarchy().await;
        let mut last_failure = self.last_failure.write().await;
        match &result {
            Ok(()) => *last_failure = None,
            Err(e) => {
                warn!(error = %e, backoff = ?self.settings.reload_backoff, "Ontology hierarchy load failed");
                *last_failure = Some((Instant::now(), e.to_string()));
            }
        }
        result
    }

    /// Caller must hold `reload_lock`.
    async fn load_hierarchy(&self) -> Result<(), OntologyError> {
        let roots = &self.settings.process_roots;
        let mut fresh = Hierarchy::default();
        let mut seen: HashSet<String> = roots.iter().cloned().collect();
        let mut frontier: VecDeque<String> = roots.iter().cloned().collect();
        let mut requests = 0usize;

        for root in roots {
            match self.service.term_name(root).await {
                Ok(Some(name)) => fresh.record_name(root, &name),
                Ok(None) => {}
                Err(e) => warn!(root = %root, error = %e, "Could not resolve process root name"),
            }
        }

        while let Some(node) = frontier.pop_front() {
            let terms = self.service.descendants(&node).await?;
            requests += 1;
            fresh.merge_closure(&node, &terms);
            for term in terms {
                if seen.insert(term.curie.clone()) {
                    frontier.push_back(term.curie);
                }
            }
        }

        info!(
            terms = fresh.names.len(),
            requests = requests,
            "Ontology hierarchy loaded"
        );

        *self.hierarchy.write().await = fresh;
        self.descendants_cache.invalidate_all();
        self.jobs_cache.invalidate_all();
        Ok(())
    }

    /// Human-readable name for `id`; the identifier itself when unresolvable.
    pub async fn resolve_name(&self, id: &str) -> String {
        if let Some(name) = self.hierarchy.read().await.names.get(id) {
            return name.clone();
        }
        match self.ensure_loaded().await {
            Ok(()) => {
                if let Some(name) = self.hierarchy.read().await.names.get(id) {
                    return name.clone();
                }
            }
            Err(OntologyError::Backoff { .. }) => return id.to_string(),
            Err(e) => debug!(id = %id, error = %e, "Hierarchy unavailable while resolving name"),
        }

        match self.service.term_name(id).await {
            Ok(Some(name)) => {
                self.hierarchy.write().await.record_name(id, &name);
                name
            }
            Ok(None) => id.to_string(),
            Err(e) => {
                debug!(id = %id, error = %e, "Name lookup failed");
                id.to_string()
            }
        }
    }

    pub async fn id_for_name(&self, name: &str) -> Result<Option<String>, OntologyError> {
        self.ensure_loaded().await?;
        Ok(self.hierarchy.read().await.ids_by_name.get(name).cloned())
    }

    pub async fn parent_of(&self, tag: &str) -> Result<Option<String>, OntologyError> {
        self.ensure_loaded().await?;
        Ok(self.hierarchy.read().await.parents.get(tag).cloned())
    }

    /// Climb parent pointers from `tag` until a process root is reached.
    pub async fn process_root_of(&self, tag: &str) -> Result<Option<String>, OntologyError> {
        self.ensure_loaded().await?;
        let hierarchy = self.hierarchy.read().await;

        let mut current = tag;
        for _ in 0..=hierarchy.parents.len() {
            if self.is_process_root(current) {
                return Ok(Some(current.to_string()));
            }
            match hierarchy.parents.get(current) {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
        warn!(tag = %tag, "Parent cycle while climbing to a process root");
        Ok(None)
    }

    /// Every tag below `root`, excluding the root itself.
    pub async fn tags_under(&self, root: &str) -> Result<BTreeSet<String>, OntologyError> {
        if let Some(cached) = self.descendants_cache.get(root).await {
            return Ok((*cached).clone());
        }
        self.ensure_loaded().await?;

        let mut subtree = self.hierarchy.read().await.subtree(root);
        if subtree.is_empty() {
            let terms = self.service.descendants(root).await?;
            let mut hierarchy = self.hierarchy.write().await;
            hierarchy.merge_closure(root, &terms);
            subtree = hierarchy.subtree(root);
        }

        self.descendants_cache
            .insert(root.to_string(), Arc::new(subtree.clone()))
            .await;
        Ok(subtree)
    }

    /// The parent job tag followed by its descendants in the org's subset.
    /// `name_or_id` is either an identifier or a job name whose
    /// "<name> needed" term is the parent.
    pub async fn jobs_to_run(&self, name_or_id: &str, org: &str) -> Result<Vec<String>, OntologyError> {
        let key = (name_or_id.to_string(), org.to_string());
        if let Some(cached) = self.jobs_cache.get(&key).await {
            return Ok((*cached).clone());
        }

        let parent = if self.is_identifier(name_or_id) {
            name_or_id.to_string()
        } else {
            let needed = format!("{name_or_id} needed");
            self.id_for_name(&needed)
                .await?
                .ok_or(OntologyError::UnknownTerm(needed))?
        };

        let allowed: HashSet<String> = self.service.subset(org).await?.into_iter().collect();
        let mut jobs = vec![parent.clone()];
        jobs.extend(
            self.tags_under(&parent)
                .await?
                .into_iter()
                .filter(|tag| allowed.contains(tag)),
        );

        self.jobs_cache.insert(key, Arc::new(jobs.clone())).await;
        Ok(jobs)
    }
}
