// Housekeeping around file removal plus read-only views over the transition
// table and the rows it governs.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use super::engine::TransitionEngine;
use super::errors::{WorkflowError, WorkflowResult};
use super::store::StateFilter;
use super::types::{ReferenceId, WorkflowState};

/// Rows changed by [`TransitionEngine::reset_after_main_file_removed`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResetOutcome {
    pub removed: Vec<WorkflowState>,
    /// The file upload track once moved off "files uploaded".
    pub file_upload: Option<WorkflowState>,
}

/// Report statuses in display order.
pub const REPORT_STATUSES: [&str; 4] = ["complete", "in progress", "failed", "needed"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub count: usize,
    /// Share of the column total, rounded to two decimals.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusRow {
    pub status: String,
    pub overall: StatusCount,
    /// Parallel to [`StatusReport::fields`].
    pub fields: Vec<StatusCount>,
}

/// Status breakdown of one job family for one org: the aggregate rows in the
/// overall column, subtask rows grouped by field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub process: String,
    pub org: String,
    pub fields: Vec<String>,
    pub rows: Vec<StatusRow>,
}

impl StatusReport {
    pub fn headers(&self) -> Vec<String> {
        ["status", "overall"]
            .into_iter()
            .map(str::to_string)
            .chain(self.fields.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagramNode {
    pub tag: String,
    pub tag_name: String,
    /// Empty for tags that are only ever entered.
    pub transitions_to: Vec<String>,
}

/// Split a term name such as "disease classification in progress" into its
/// field ("disease") and status ("in progress").
pub fn field_and_status(name: &str) -> Option<(String, &'static str)> {
    let (field, status) = match name.strip_suffix(" in progress") {
        Some(field) => (field, "in progress"),
        None => {
            let (field, last) = name.rsplit_once(' ')?;
            let status = ["complete", "failed", "needed"]
                .into_iter()
                .find(|s| *s == last)?;
            (field, status)
        }
    };
    let field = field.strip_suffix(" classification").unwrap_or(field);
    if field.is_empty() {
        return None;
    }
    Some((field.to_string(), status))
}

fn share(count: usize, total: usize) -> StatusCount {
    let percent = if total == 0 {
        0.0
    } else {
        (count as f64 / total as f64 * 10_000.0).round() / 100.0
    };
    StatusCount { count, percent }
}

impl TransitionEngine {
    /// The main file of a reference is gone for `org`. Tracks under the
    /// configured reset processes are deleted and, unless `keep_file_status`,
    /// "files uploaded" moves back to upload in progress when other files
    /// remain or to files needed when none do.
    pub async fn reset_after_main_file_removed(
        &self,
        reference_id: ReferenceId,
        org: &str,
        keep_file_status: bool,
        actor: &str,
    ) -> WorkflowResult<ResetOutcome> {
        let maintenance = &self.settings().maintenance;
        let mut cleared = BTreeSet::new();
        for process in &maintenance.reset_processes {
            cleared.extend(self.ontology().tags_under(process).await?);
        }

        let mut tx = self.store().begin().await?;
        let result: WorkflowResult<ResetOutcome> = async {
            tx.reference(reference_id)
                .await?
                .ok_or(WorkflowError::ReferenceNotFound(reference_id))?;

            let mut outcome = ResetOutcome::default();
            let filter = StateFilter::for_pair(reference_id, org).with_tags(cleared.iter().cloned());
            for state in tx.find_states(&filter).await? {
                tx.delete_state(&state, actor).await?;
                outcome.removed.push(state);
            }
            if keep_file_status {
                return Ok(outcome);
            }

            let uploaded = StateFilter::for_pair(reference_id, org)
                .with_tags([maintenance.files_uploaded_tag.as_str()]);
            if let Some(state) = tx.find_states(&uploaded).await?.into_iter().next() {
                let tag = if tx.file_count(reference_id, org).await? > 0 {
                    &maintenance.file_upload_in_progress_tag
                } else {
                    &maintenance.file_needed_tag
                };
                outcome.file_upload = Some(tx.update_tag(&state, tag, actor).await?);
            }
            Ok(outcome)
        }
        .await;

        match result {
            Ok(outcome) => {
                tx.commit().await?;
                info!(
                    reference_id = reference_id,
                    org = %org,
                    removed = outcome.removed.len(),
                    file_tag = ?outcome.file_upload.as_ref().map(|s| s.tag.as_str()),
                    "Tracks reset after main file removal"
                );
                Ok(outcome)
            }
            Err(err) => {
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    /// Name of the first configured job currently running for the pair. A
    /// running job means a new upload must wait.
    pub async fn upload_blocker(&self, reference_id: ReferenceId, org: &str) -> WorkflowResult<Option<String>> {
        let mut jobs = Vec::new();
        for job in &self.settings().maintenance.upload_blocking_jobs {
            let mut tags = self.ontology().tags_under(&job.in_progress_tag).await?;
            tags.insert(job.in_progress_tag.clone());
            jobs.push((job.name.clone(), tags));
        }

        let mut tx = self.store().begin().await?;
        let result: WorkflowResult<Option<String>> = async {
            tx.reference(reference_id)
                .await?
                .ok_or(WorkflowError::ReferenceNotFound(reference_id))?;
            for (name, tags) in jobs {
                let filter = StateFilter::for_pair(reference_id, org).with_tags(tags);
                if !tx.find_states(&filter).await?.is_empty() {
                    return Ok(Some(name));
                }
            }
            Ok(None)
        }
        .await;
        tx.rollback().await?;
        result
    }

    /// Count rows of the job family rooted at `process` for `org`.
    pub async fn status_report(&self, process: &str, org: &str) -> WorkflowResult<StatusReport> {
        let (_, family) = self.settings().families.by_main(process).ok_or_else(|| {
            WorkflowError::InvalidArgument(format!("'{process}' is not the main tag of a job family"))
        })?;
        let overall_status = [
            (family.complete.as_str(), "complete"),
            (family.in_progress.as_str(), "in progress"),
            (family.failed.as_str(), "failed"),
            (family.needed.as_str(), "needed"),
        ];

        let mut tags = self.ontology().tags_under(process).await?;
        tags.extend(overall_status.iter().map(|(tag, _)| tag.to_string()));
        let filter = StateFilter {
            tags: Some(tags.into_iter().collect()),
            org: Some(org.to_string()),
            ..StateFilter::default()
        };

        let mut held: BTreeMap<String, usize> = BTreeMap::new();
        for state in self.find_states(&filter).await? {
            *held.entry(state.tag).or_default() += 1;
        }

        let mut overall: BTreeMap<&str, usize> = BTreeMap::new();
        let mut by_field: BTreeMap<String, BTreeMap<&str, usize>> = BTreeMap::new();
        for (tag, count) in &held {
            if let Some(&(_, status)) = overall_status.iter().find(|(t, _)| *t == tag.as_str()) {
                *overall.entry(status).or_default() += count;
                continue;
            }
            let name = self.ontology().resolve_name(tag).await;
            match field_and_status(&name) {
                Some((field, status)) => {
                    *by_field.entry(field).or_default().entry(status).or_default() += count;
                }
                None => warn!(tag = %tag, name = %name, "Tag name carries no report status, skipped"),
            }
        }

        let overall_total: usize = overall.values().sum();
        let field_totals: Vec<usize> = by_field.values().map(|c| c.values().sum()).collect();
        let rows: Vec<StatusRow> = REPORT_STATUSES
            .iter()
            .map(|status| StatusRow {
                status: status.to_string(),
                overall: share(overall.get(status).copied().unwrap_or(0), overall_total),
                fields: by_field
                    .values()
                    .zip(&field_totals)
                    .map(|(counts, total)| share(counts.get(status).copied().unwrap_or(0), *total))
                    .collect(),
            })
            .collect();

        Ok(StatusReport {
            process: process.to_string(),
            org: org.to_string(),
            fields: by_field.into_keys().collect(),
            rows,
        })
    }

    /// Every tag in the transition table with the tags it can move to.
    /// `org` limits the table to rules that apply to that org.
    pub async fn transition_diagram(&self, org: Option<&str>) -> WorkflowResult<Vec<DiagramNode>> {
        let rules = self.rules().await?;
        let mut edges: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        let mut entered: BTreeSet<&str> = BTreeSet::new();
        for rule in rules
            .iter()
            .filter(|rule| org.map_or(true, |org| rule.org_scope.applies_to(org)))
        {
            let targets = edges.entry(rule.from_tag.as_str()).or_default();
            if !targets.contains(&rule.to_tag) {
                targets.push(rule.to_tag.clone());
            }
            entered.insert(rule.to_tag.as_str());
        }

        let mut nodes = Vec::with_capacity(edges.len() + entered.len());
        for (tag, transitions_to) in &edges {
            nodes.push(DiagramNode {
                tag: tag.to_string(),
                tag_name: self.ontology().resolve_name(tag).await,
                transitions_to: transitions_to.clone(),
            });
        }
        for tag in entered.iter().filter(|tag| !edges.contains_key(*tag)) {
            nodes.push(DiagramNode {
                tag: tag.to_string(),
                tag_name: self.ontology().resolve_name(tag).await,
                transitions_to: Vec::new(),
            });
        }
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_and_status_from_term_names() {
        assert_eq!(
            field_and_status("disease classification in progress"),
            Some(("disease".to_string(), "in progress"))
        );
        assert_eq!(
            field_and_status("catalytic activity classification complete"),
            Some(("catalytic activity".to_string(), "complete"))
        );
        assert_eq!(
            field_and_status("gene extraction failed"),
            Some(("gene extraction".to_string(), "failed"))
        );
        assert_eq!(field_and_status("files uploaded"), None);
        assert_eq!(field_and_status("needed"), None);
    }

    #[test]
    fn test_share_rounds_to_two_decimals() {
        assert_eq!(share(1, 3).percent, 33.33);
        assert_eq!(share(2, 3).percent, 66.67);
        assert_eq!(share(0, 0).percent, 0.0);
    }
}
