use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::errors::{WorkflowError, WorkflowResult};
use super::store::StoreTransaction;
use super::types::{Reference, RequirementCall};

/// Boolean guard evaluated before a transition touches the store.
#[async_trait]
pub trait Requirement: Send + Sync {
    async fn check(
        &self,
        tx: &mut dyn StoreTransaction,
        reference: &Reference,
        org: &str,
    ) -> WorkflowResult<bool>;
}

/// At least one file has been uploaded for the organization.
#[derive(Debug, Default)]
pub struct FilesPresent;

#[async_trait]
impl Requirement for FilesPresent {
    async fn check(
        &self,
        tx: &mut dyn StoreTransaction,
        reference: &Reference,
        org: &str,
    ) -> WorkflowResult<bool> {
        Ok(tx.file_count(reference.id, org).await? > 0)
    }
}

#[derive(Clone, Default)]
pub struct RequirementRegistry {
    entries: HashMap<String, Arc<dyn Requirement>>,
}

impl RequirementRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        let files: Arc<dyn Requirement> = Arc::new(FilesPresent);
        registry.register("files_present", files.clone());
        registry.register("referencefiles_present", files);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, requirement: Arc<dyn Requirement>) {
        self.entries.insert(name.into(), requirement);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Unknown names fail closed when the rule table is loaded.
    pub fn validate(&self, call: &RequirementCall) -> WorkflowResult<()> {
        if self.entries.contains_key(&call.name) {
            Ok(())
        } else {
            Err(WorkflowError::InvalidConfiguration(format!(
                "unknown requirement '{}'",
                call.name
            )))
        }
    }

    /// Evaluate in order; returns the first call that is not satisfied.
    pub async fn first_unmet<'c>(
        &self,
        calls: &'c [RequirementCall],
        tx: &mut dyn StoreTransaction,
        reference: &Reference,
        org: &str,
    ) -> WorkflowResult<Option<&'c RequirementCall>> {
        for call in calls {
            self.validate(call)?;
            let requirement = &self.entries[&call.name];
            let holds = requirement.check(tx, reference, org).await?;
            debug!(requirement = %call, holds = holds, "Requirement evaluated");
            if holds == call.negated {
                return Ok(Some(call));
            }
        }
        Ok(None)
    }
}
