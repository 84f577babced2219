// Track housekeeping after file removal and the read-only reports

mod fixtures;

use curation_flow::workflow::{ErrorKind, RuleRecord, VersionOperation, WorkflowError};
use fixtures::*;

async fn tags_of(h: &Harness, reference_id: i64, org: &str) -> Vec<String> {
    let mut tags: Vec<String> = h
        .store
        .states()
        .await
        .into_iter()
        .filter(|s| s.reference_id == reference_id && s.org == org)
        .map(|s| s.tag)
        .collect();
    tags.sort();
    tags
}

/// Reference 1 fully processed for WB, plus rows that must survive a reset.
async fn processed_reference() -> Harness {
    let h = harness(Vec::new()).await;
    for tag in [FILES_UPLOADED, TEXT_CONVERTED, CLASS_IN_PROGRESS, in_progress(1).as_str()] {
        h.store.seed_state(1, ORG, tag).await.unwrap();
    }
    h.store.seed_state(1, "FB", TEXT_CONVERTED).await.unwrap();
    h.store.seed_state(2, ORG, TEXT_NEEDED).await.unwrap();
    h
}

#[tokio::test]
async fn test_reset_clears_processing_and_reopens_upload() {
    let h = processed_reference().await;
    h.store.set_file_count(1, ORG, 2).await;

    let outcome = h
        .engine
        .reset_after_main_file_removed(1, ORG, false, "file_service")
        .await
        .unwrap();

    let mut removed: Vec<String> = outcome.removed.iter().map(|s| s.tag.clone()).collect();
    removed.sort();
    let mut expected = vec![
        TEXT_CONVERTED.to_string(),
        CLASS_IN_PROGRESS.to_string(),
        in_progress(1),
    ];
    expected.sort();
    assert_eq!(removed, expected);

    let upload = outcome.file_upload.unwrap();
    assert_eq!(upload.tag, FILE_UPLOAD_IN_PROGRESS);
    assert_eq!(upload.updated_by, "file_service");

    assert_eq!(tags_of(&h, 1, ORG).await, vec![FILE_UPLOAD_IN_PROGRESS.to_string()]);
    assert_eq!(tags_of(&h, 1, "FB").await, vec![TEXT_CONVERTED.to_string()]);
    assert_eq!(tags_of(&h, 2, ORG).await, vec![TEXT_NEEDED.to_string()]);

    let deletes = h
        .store
        .all_versions()
        .await
        .into_iter()
        .filter(|v| v.operation == VersionOperation::Delete)
        .count();
    assert_eq!(deletes, 3);
}

#[tokio::test]
async fn test_reset_without_remaining_files_asks_for_files() {
    let h = processed_reference().await;

    let outcome = h
        .engine
        .reset_after_main_file_removed(1, ORG, false, "file_service")
        .await
        .unwrap();

    assert_eq!(outcome.file_upload.unwrap().tag, FILES_NEEDED);
}

#[tokio::test]
async fn test_reset_can_leave_file_status_alone() {
    let h = processed_reference().await;

    let outcome = h
        .engine
        .reset_after_main_file_removed(1, ORG, true, "file_service")
        .await
        .unwrap();

    assert_eq!(outcome.removed.len(), 3);
    assert!(outcome.file_upload.is_none());
    assert_eq!(tags_of(&h, 1, ORG).await, vec![FILES_UPLOADED.to_string()]);
}

#[tokio::test]
async fn test_reset_of_unknown_reference_changes_nothing() {
    let h = processed_reference().await;
    let before = h.store.all_versions().await;

    let err = h
        .engine
        .reset_after_main_file_removed(99, ORG, false, "file_service")
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::ReferenceNotFound(99)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(h.store.all_versions().await, before);
}

#[tokio::test]
async fn test_running_jobs_block_uploads_in_configured_order() {
    let h = harness(Vec::new()).await;
    h.store.seed_state(1, ORG, FILES_UPLOADED).await.unwrap();
    h.store.seed_state(2, ORG, &in_progress(2)).await.unwrap();
    h.store.seed_state(3, ORG, &in_progress(3)).await.unwrap();
    h.store.seed_state(3, ORG, TEXT_IN_PROGRESS).await.unwrap();

    assert_eq!(h.engine.upload_blocker(1, ORG).await.unwrap(), None);
    assert_eq!(
        h.engine.upload_blocker(2, ORG).await.unwrap().as_deref(),
        Some("reference classification")
    );
    assert_eq!(
        h.engine.upload_blocker(3, ORG).await.unwrap().as_deref(),
        Some("text conversion")
    );
    assert_eq!(h.engine.upload_blocker(3, "FB").await.unwrap(), None);
    assert!(matches!(
        h.engine.upload_blocker(99, ORG).await,
        Err(WorkflowError::ReferenceNotFound(99))
    ));
}

#[tokio::test]
async fn test_status_report_splits_overall_and_fields() {
    let h = harness(Vec::new()).await;
    for (reference_id, tag) in [
        (1, CLASS_COMPLETE.to_string()),
        (1, complete(1)),
        (1, complete(2)),
        (2, CLASS_IN_PROGRESS.to_string()),
        (2, in_progress(1)),
        (2, complete(2)),
        (3, CLASS_IN_PROGRESS.to_string()),
        (3, needed(1)),
        (4, CLASS_FAILED.to_string()),
    ] {
        h.store.seed_state(reference_id, ORG, &tag).await.unwrap();
    }
    h.store.seed_state(5, "FB", CLASS_COMPLETE).await.unwrap();

    let report = h.engine.status_report(CLASSIFICATION, ORG).await.unwrap();

    assert_eq!(report.headers(), vec!["status", "overall", "catalytic activity", "disease"]);
    let table: Vec<(String, usize, f64, Vec<(usize, f64)>)> = report
        .rows
        .iter()
        .map(|row| {
            (
                row.status.clone(),
                row.overall.count,
                row.overall.percent,
                row.fields.iter().map(|c| (c.count, c.percent)).collect(),
            )
        })
        .collect();
    assert_eq!(
        table,
        vec![
            ("complete".to_string(), 1, 25.0, vec![(1, 33.33), (2, 100.0)]),
            ("in progress".to_string(), 2, 50.0, vec![(1, 33.33), (0, 0.0)]),
            ("failed".to_string(), 1, 25.0, vec![(0, 0.0), (0, 0.0)]),
            ("needed".to_string(), 0, 0.0, vec![(1, 33.33), (0, 0.0)]),
        ]
    );

    assert!(matches!(
        h.engine.status_report(TEXT_CONVERSION, ORG).await,
        Err(WorkflowError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_diagram_lists_every_tag_of_the_table() {
    let mut rules = text_conversion_rules();
    rules.push(RuleRecord {
        org: "FB".to_string(),
        ..rule(6, FILES_NEEDED, FILES_UPLOADED)
    });
    let h = harness(rules).await;

    let diagram = h.engine.transition_diagram(Some(ORG)).await.unwrap();
    let edges: Vec<(&str, Vec<&str>)> = diagram
        .iter()
        .map(|n| (n.tag.as_str(), n.transitions_to.iter().map(String::as_str).collect()))
        .collect();
    assert_eq!(
        edges,
        vec![
            (FILES_UPLOADED, vec![TEXT_NEEDED]),
            (TEXT_NEEDED, vec![TEXT_IN_PROGRESS]),
            (TEXT_FAILED, vec![TEXT_NEEDED]),
            (TEXT_IN_PROGRESS, vec![TEXT_CONVERTED, TEXT_FAILED]),
            (TEXT_CONVERTED, vec![]),
        ]
    );
    assert_eq!(diagram[0].tag_name, "files uploaded");

    let everything = h.engine.transition_diagram(None).await.unwrap();
    assert_eq!(everything.len(), 6);
    assert_eq!(everything[1].tag, FILES_NEEDED);
}
