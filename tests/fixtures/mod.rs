// Shared fixtures: an in-process ontology, a seeded memory store and a
// notifier that records what it was asked to send.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use curation_flow::notify::{Notification, NotificationSink, NotifyError};
use curation_flow::ontology::{
    OntologyError, OntologyResolver, OntologyService, OntologyTerm, ResolverSettings,
};
use curation_flow::workflow::{
    ActionRegistry, MemoryStore, Reference, RuleRecord, TransitionEngine,
};

pub const ORG: &str = "WB";

pub const FILE_UPLOAD: &str = "ATP:0000140";
pub const FILES_NEEDED: &str = "ATP:0000141";
pub const FILES_UPLOADED: &str = "ATP:0000134";
pub const FILE_UPLOAD_IN_PROGRESS: &str = "ATP:0000139";

pub const TEXT_CONVERSION: &str = "ATP:0000161";
pub const TEXT_NEEDED: &str = "ATP:0000162";
pub const TEXT_IN_PROGRESS: &str = "ATP:0000198";
pub const TEXT_CONVERTED: &str = "ATP:0000163";
pub const TEXT_FAILED: &str = "ATP:0000164";

pub const CLASSIFICATION: &str = "ATP:0000165";
pub const CLASS_NEEDED: &str = "ATP:0000166";
pub const CLASS_IN_PROGRESS: &str = "ATP:0000178";
pub const CLASS_COMPLETE: &str = "ATP:0000169";
pub const CLASS_FAILED: &str = "ATP:0000189";
pub const FAMILY: &str = "reference classification";

pub const SUBTASKS: [&str; 3] = ["catalytic activity", "disease", "expression"];

/// Subtask tags: stage 0 needed, 1 in progress, 2 complete, 3 failed.
fn subtask(stage: u32, index: usize) -> String {
    format!("ATP:90000{stage}{index}")
}

pub fn needed(index: usize) -> String {
    subtask(0, index)
}

pub fn in_progress(index: usize) -> String {
    subtask(1, index)
}

pub fn complete(index: usize) -> String {
    subtask(2, index)
}

pub fn failed(index: usize) -> String {
    subtask(3, index)
}

pub fn at(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

/// Ontology held in memory, counting the requests it serves.
#[derive(Default)]
pub struct FakeOntology {
    names: HashMap<String, String>,
    children: HashMap<String, Vec<String>>,
    subsets: HashMap<String, Vec<String>>,
    offline: AtomicBool,
    pub descendant_calls: AtomicUsize,
    pub name_calls: AtomicUsize,
}

impl FakeOntology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, id: &str, name: &str, parent: Option<&str>) -> Self {
        self.names.insert(id.to_string(), name.to_string());
        if let Some(parent) = parent {
            self.children
                .entry(parent.to_string())
                .or_default()
                .push(id.to_string());
        }
        self
    }

    pub fn subset(mut self, org: &str, ids: &[&str]) -> Self {
        self.subsets
            .insert(org.to_string(), ids.iter().map(|id| id.to_string()).collect());
        self
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn descendant_requests(&self) -> usize {
        self.descendant_calls.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), OntologyError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(OntologyError::Request("ontology service offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl OntologyService for FakeOntology {
    async fn descendants(&self, id: &str) -> Result<Vec<OntologyTerm>, OntologyError> {
        self.check_online()?;
        self.descendant_calls.fetch_add(1, Ordering::SeqCst);

        let mut found = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::from([id]);
        while let Some(node) = queue.pop_front() {
            for child in self.children.get(node).into_iter().flatten() {
                found.push(OntologyTerm {
                    curie: child.clone(),
                    name: self.names.get(child).cloned().unwrap_or_default(),
                });
                queue.push_back(child);
            }
        }
        Ok(found)
    }

    async fn term_name(&self, id: &str) -> Result<Option<String>, OntologyError> {
        self.check_online()?;
        self.name_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.names.get(id).cloned())
    }

    async fn subset(&self, org: &str) -> Result<Vec<String>, OntologyError> {
        self.check_online()?;
        Ok(self.subsets.get(org).cloned().unwrap_or_default())
    }
}

/// The three processes exercised by the tests, with three classification
/// subtasks below each stage of the reference classification family.
pub fn curation_ontology() -> FakeOntology {
    let mut ontology = FakeOntology::new()
        .term(FILE_UPLOAD, "file upload", None)
        .term(FILES_NEEDED, "files needed", Some(FILE_UPLOAD))
        .term(FILES_UPLOADED, "files uploaded", Some(FILE_UPLOAD))
        .term(FILE_UPLOAD_IN_PROGRESS, "file upload in progress", Some(FILE_UPLOAD))
        .term(TEXT_CONVERSION, "text conversion", None)
        .term(TEXT_NEEDED, "text conversion needed", Some(TEXT_CONVERSION))
        .term(TEXT_IN_PROGRESS, "text conversion in progress", Some(TEXT_CONVERSION))
        .term(TEXT_CONVERTED, "file converted to text", Some(TEXT_CONVERSION))
        .term(TEXT_FAILED, "text conversion failed", Some(TEXT_CONVERSION))
        .term(CLASSIFICATION, FAMILY, None)
        .term(CLASS_NEEDED, "reference classification needed", Some(CLASSIFICATION))
        .term(CLASS_IN_PROGRESS, "reference classification in progress", Some(CLASSIFICATION))
        .term(CLASS_COMPLETE, "reference classification complete", Some(CLASSIFICATION))
        .term(CLASS_FAILED, "reference classification failed", Some(CLASSIFICATION));

    for (i, name) in SUBTASKS.iter().enumerate() {
        let index = i + 1;
        ontology = ontology
            .term(&needed(index), &format!("{name} classification needed"), Some(CLASS_NEEDED))
            .term(
                &in_progress(index),
                &format!("{name} classification in progress"),
                Some(CLASS_IN_PROGRESS),
            )
            .term(&complete(index), &format!("{name} classification complete"), Some(CLASS_COMPLETE))
            .term(&failed(index), &format!("{name} classification failed"), Some(CLASS_FAILED));
    }
    ontology
}

pub fn resolver(ontology: Arc<FakeOntology>) -> Arc<OntologyResolver> {
    Arc::new(OntologyResolver::new(
        ontology,
        ResolverSettings {
            process_roots: vec![
                FILE_UPLOAD.to_string(),
                TEXT_CONVERSION.to_string(),
                CLASSIFICATION.to_string(),
            ],
            reload_backoff: Duration::ZERO,
            ..ResolverSettings::default()
        },
    ))
}

/// A rule for every organization with no checks, actions or conditions.
pub fn rule(id: i64, from: &str, to: &str) -> RuleRecord {
    RuleRecord {
        id,
        org: "ALL".to_string(),
        from_tag: from.to_string(),
        to_tag: to.to_string(),
        requirements: Vec::new(),
        actions: Vec::new(),
        condition: None,
        transition_type: "any".to_string(),
    }
}

pub fn role_rule(id: i64, from: &str, to: &str, condition: &str) -> RuleRecord {
    RuleRecord {
        condition: Some(condition.to_string()),
        transition_type: "automated_only".to_string(),
        ..rule(id, from, to)
    }
}

/// Text conversion lifecycle driven by roles.
pub fn text_conversion_rules() -> Vec<RuleRecord> {
    vec![
        RuleRecord {
            condition: Some("text_convert_job".to_string()),
            ..rule(1, FILES_UPLOADED, TEXT_NEEDED)
        },
        role_rule(2, TEXT_NEEDED, TEXT_IN_PROGRESS, "on_start"),
        role_rule(3, TEXT_IN_PROGRESS, TEXT_CONVERTED, "on_success"),
        role_rule(4, TEXT_IN_PROGRESS, TEXT_FAILED, "on_failed"),
        role_rule(5, TEXT_FAILED, TEXT_NEEDED, "on_retry"),
    ]
}

/// Reference classification: fan-out from the aggregate, then per-subtask
/// start, success, failure and retry, each keeping the aggregate current.
pub fn classification_rules() -> Vec<RuleRecord> {
    let mut rules = vec![RuleRecord {
        actions: vec!["add_subtasks".to_string()],
        ..rule(100, CLASSIFICATION, CLASS_NEEDED)
    }];
    for index in 1..=SUBTASKS.len() {
        let i = index as i64;
        rules.push(RuleRecord {
            condition: Some("add_subtask".to_string()),
            ..rule(110 + i, CLASS_NEEDED, &needed(index))
        });
        rules.push(RuleRecord {
            actions: vec![format!("sub_task_in_progress::{FAMILY}")],
            ..role_rule(120 + i, &needed(index), &in_progress(index), "on_start")
        });
        rules.push(RuleRecord {
            actions: vec![format!("sub_task_complete::{FAMILY}")],
            ..role_rule(130 + i, &in_progress(index), &complete(index), "on_success")
        });
        rules.push(RuleRecord {
            actions: vec![format!("sub_task_failed::{FAMILY}")],
            ..role_rule(140 + i, &in_progress(index), &failed(index), "on_failed")
        });
        rules.push(RuleRecord {
            actions: vec![format!("sub_task_retry::{FAMILY}")],
            ..role_rule(150 + i, &in_progress(index), &needed(index), "on_retry")
        });
    }
    rules
}

pub struct Harness {
    pub store: MemoryStore,
    pub ontology: Arc<FakeOntology>,
    pub engine: Arc<TransitionEngine>,
}

pub fn reference(id: i64) -> Reference {
    Reference {
        id,
        curie: format!("AGRKB:1010000000000{id:02}"),
        category: Some("research_article".to_string()),
        reference_types: vec!["Journal".to_string()],
    }
}

pub async fn seeded_store(rules: Vec<RuleRecord>) -> MemoryStore {
    let store = MemoryStore::new();
    for id in 1..=5 {
        store.add_reference(reference(id)).await;
    }
    for rule in rules {
        store.add_rule(rule).await;
    }
    store
}

pub async fn harness(rules: Vec<RuleRecord>) -> Harness {
    harness_with_actions(rules, ActionRegistry::with_builtins()).await
}

pub async fn harness_with_actions(rules: Vec<RuleRecord>, actions: ActionRegistry) -> Harness {
    let store = seeded_store(rules).await;
    let ontology = Arc::new(curation_ontology());
    let engine = TransitionEngine::new(Arc::new(store.clone()), resolver(ontology.clone()))
        .with_actions(actions);
    Harness {
        store,
        ontology,
        engine: Arc::new(engine),
    }
}

/// Keeps every notification instead of sending it.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
