// Subtask fan-out and aggregate maintenance for the reference classification family

mod fixtures;

use curation_flow::workflow::{
    CallerMode, ErrorKind, JobLifecycle, Role, Target, TrackId, WorkflowError, WorkflowState,
};
use fixtures::*;

async fn tag_of(h: &Harness, track_id: TrackId) -> String {
    h.store
        .states()
        .await
        .into_iter()
        .find(|s| s.id == track_id)
        .map(|s| s.tag)
        .unwrap_or_default()
}

async fn retry(h: &Harness, track_id: TrackId) -> WorkflowState {
    h.engine
        .apply_transition(track_id, Target::Role(Role::Retry), CallerMode::Automated)
        .await
        .unwrap()
}

async fn find(h: &Harness, tag: &str) -> WorkflowState {
    h.store
        .states()
        .await
        .into_iter()
        .find(|s| s.tag == tag)
        .unwrap_or_else(|| panic!("no row tagged {tag}"))
}

/// Classification track moved to "needed", fanning out every subtask.
async fn fanned_out() -> (Harness, TrackId, Vec<TrackId>) {
    let h = harness(classification_rules()).await;
    let aggregate = h.store.seed_state(1, ORG, CLASSIFICATION).await.unwrap();
    h.engine
        .apply_transition(aggregate.id, Target::Tag(CLASS_NEEDED.to_string()), CallerMode::Manual)
        .await
        .unwrap();

    let mut subtasks = Vec::new();
    for index in 1..=SUBTASKS.len() {
        subtasks.push(find(&h, &needed(index)).await.id);
    }
    (h, aggregate.id, subtasks)
}

#[tokio::test]
async fn test_fan_out_creates_one_track_per_subtask() {
    let (h, aggregate, subtasks) = fanned_out().await;

    assert_eq!(tag_of(&h, aggregate).await, CLASS_NEEDED);
    assert_eq!(subtasks.len(), 3);
    assert_eq!(h.store.states().await.len(), 4);
}

#[tokio::test]
async fn test_fan_out_skips_existing_subtasks() {
    let h = harness(classification_rules()).await;
    let aggregate = h.store.seed_state(1, ORG, CLASSIFICATION).await.unwrap();
    let existing = h.store.seed_state(1, ORG, &needed(1)).await.unwrap();

    h.engine
        .apply_transition(aggregate.id, Target::Tag(CLASS_NEEDED.to_string()), CallerMode::Manual)
        .await
        .unwrap();

    let states = h.store.states().await;
    assert_eq!(states.len(), 4);
    let first = states.iter().filter(|s| s.tag == needed(1)).count();
    assert_eq!(first, 1);
    assert_eq!(find(&h, &needed(1)).await.id, existing.id);
}

#[tokio::test]
async fn test_aggregate_completes_after_last_subtask() {
    let (h, aggregate, subtasks) = fanned_out().await;
    let jobs = JobLifecycle::new(h.engine.clone()).with_actor("classifier");

    jobs.start(subtasks[0]).await.unwrap();
    assert_eq!(tag_of(&h, aggregate).await, CLASS_IN_PROGRESS);

    jobs.start(subtasks[1]).await.unwrap();
    jobs.start(subtasks[2]).await.unwrap();
    assert_eq!(tag_of(&h, aggregate).await, CLASS_IN_PROGRESS);

    jobs.succeed(subtasks[0]).await.unwrap();
    assert_eq!(tag_of(&h, aggregate).await, CLASS_IN_PROGRESS);
    jobs.succeed(subtasks[1]).await.unwrap();
    assert_eq!(tag_of(&h, aggregate).await, CLASS_IN_PROGRESS);

    let last = jobs.succeed(subtasks[2]).await.unwrap();
    assert_eq!(last.tag, complete(3));
    assert_eq!(tag_of(&h, aggregate).await, CLASS_COMPLETE);

    let log: Vec<String> = h
        .store
        .transition_log(aggregate)
        .await
        .into_iter()
        .map(|v| v.tag)
        .collect();
    assert_eq!(log, vec![CLASS_NEEDED, CLASS_IN_PROGRESS, CLASS_COMPLETE]);
}

#[tokio::test]
async fn test_aggregate_completes_when_first_subtask_finishes_last() {
    let (h, aggregate, subtasks) = fanned_out().await;
    let jobs = JobLifecycle::new(h.engine.clone());

    for &subtask in &subtasks {
        jobs.start(subtask).await.unwrap();
    }

    jobs.succeed(subtasks[1]).await.unwrap();
    assert_eq!(tag_of(&h, aggregate).await, CLASS_IN_PROGRESS);
    jobs.succeed(subtasks[2]).await.unwrap();
    assert_eq!(tag_of(&h, aggregate).await, CLASS_IN_PROGRESS);
    assert_eq!(tag_of(&h, subtasks[0]).await, in_progress(1));

    jobs.succeed(subtasks[0]).await.unwrap();
    assert_eq!(tag_of(&h, subtasks[0]).await, complete(1));
    assert_eq!(tag_of(&h, aggregate).await, CLASS_COMPLETE);
}

#[tokio::test]
async fn test_completion_waits_for_queued_siblings() {
    let (h, aggregate, subtasks) = fanned_out().await;
    let jobs = JobLifecycle::new(h.engine.clone());

    jobs.start(subtasks[0]).await.unwrap();
    jobs.succeed(subtasks[0]).await.unwrap();

    // Two siblings still need to run
    assert_eq!(tag_of(&h, aggregate).await, CLASS_IN_PROGRESS);
}

#[tokio::test]
async fn test_subtask_failure_fails_the_aggregate() {
    let (h, aggregate, subtasks) = fanned_out().await;
    let jobs = JobLifecycle::new(h.engine.clone());

    jobs.start(subtasks[0]).await.unwrap();
    jobs.start(subtasks[1]).await.unwrap();
    jobs.fail(subtasks[0]).await.unwrap();
    assert_eq!(tag_of(&h, aggregate).await, CLASS_FAILED);

    // A later success does not hide the failure
    jobs.succeed(subtasks[1]).await.unwrap();
    assert_eq!(tag_of(&h, aggregate).await, CLASS_FAILED);
}

#[tokio::test]
async fn test_retry_keeps_aggregate_failed_while_other_subtasks_failed() {
    let (h, aggregate, subtasks) = fanned_out().await;
    let jobs = JobLifecycle::new(h.engine.clone());

    jobs.start(subtasks[0]).await.unwrap();
    jobs.start(subtasks[1]).await.unwrap();
    jobs.fail(subtasks[0]).await.unwrap();

    let requeued = retry(&h, subtasks[1]).await;
    assert_eq!(requeued.tag, needed(2));
    assert_eq!(tag_of(&h, aggregate).await, CLASS_FAILED);
}

#[tokio::test]
async fn test_retry_without_failures_returns_aggregate_to_in_progress() {
    let (h, aggregate, subtasks) = fanned_out().await;
    let jobs = JobLifecycle::new(h.engine.clone());

    jobs.start(subtasks[0]).await.unwrap();
    retry(&h, subtasks[0]).await;

    assert_eq!(tag_of(&h, subtasks[0]).await, needed(1));
    assert_eq!(tag_of(&h, aggregate).await, CLASS_IN_PROGRESS);
}

#[tokio::test]
async fn test_failure_after_completion_is_rejected_and_rolled_back() {
    let h = harness(classification_rules()).await;
    let aggregate = h.store.seed_state(1, ORG, CLASS_COMPLETE).await.unwrap();
    let subtask = h.store.seed_state(1, ORG, &in_progress(1)).await.unwrap();
    let versions_before = h.store.all_versions().await;

    let err = JobLifecycle::new(h.engine.clone())
        .fail(subtask.id)
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::SubtaskInconsistency(_)));
    assert_eq!(err.kind(), ErrorKind::Rejected);
    assert_eq!(tag_of(&h, subtask.id).await, in_progress(1));
    assert_eq!(tag_of(&h, aggregate.id).await, CLASS_COMPLETE);
    assert_eq!(h.store.all_versions().await, versions_before);
}

#[tokio::test]
async fn test_missing_aggregate_is_inconsistent() {
    let h = harness(classification_rules()).await;
    let subtask = h.store.seed_state(1, ORG, &needed(2)).await.unwrap();

    let err = JobLifecycle::new(h.engine.clone())
        .start(subtask.id)
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::SubtaskInconsistency(_)));
    assert_eq!(tag_of(&h, subtask.id).await, needed(2));
}

#[tokio::test]
async fn test_completion_ignored_before_aggregate_lifecycle() {
    let h = harness(classification_rules()).await;
    let aggregate = h.store.seed_state(1, ORG, CLASSIFICATION).await.unwrap();
    let subtask = h.store.seed_state(1, ORG, &in_progress(2)).await.unwrap();
    let jobs = JobLifecycle::new(h.engine.clone());

    let done = jobs.succeed(subtask.id).await.unwrap();

    assert_eq!(done.tag, complete(2));
    assert_eq!(tag_of(&h, aggregate.id).await, CLASSIFICATION);

    // Starting is still rejected while the aggregate sits at its main tag
    let queued = h.store.seed_state(1, ORG, &needed(3)).await.unwrap();
    let err = jobs.start(queued.id).await.unwrap_err();
    assert!(matches!(err, WorkflowError::SubtaskInconsistency(_)));
}
