// Ontology resolver over the in-memory curation ontology

mod fixtures;

use std::sync::Arc;

use curation_flow::ontology::OntologyError;
use curation_flow::workflow::{ErrorKind, WorkflowError};
use fixtures::*;

#[tokio::test]
async fn test_process_root_found_for_nested_tags() {
    let resolver = resolver(Arc::new(curation_ontology()));

    assert_eq!(
        resolver.process_root_of(&complete(2)).await.unwrap().as_deref(),
        Some(CLASSIFICATION)
    );
    assert_eq!(
        resolver.process_root_of(TEXT_FAILED).await.unwrap().as_deref(),
        Some(TEXT_CONVERSION)
    );
    assert_eq!(
        resolver.process_root_of(CLASSIFICATION).await.unwrap().as_deref(),
        Some(CLASSIFICATION)
    );
    assert_eq!(resolver.process_root_of("ATP:0009999").await.unwrap(), None);
}

#[tokio::test]
async fn test_deep_tags_are_parented_by_the_process_root() {
    let resolver = resolver(Arc::new(curation_ontology()));

    // The root's closure is fetched first, so it claims every descendant
    assert_eq!(
        resolver.parent_of(&needed(1)).await.unwrap().as_deref(),
        Some(CLASSIFICATION)
    );
    assert_eq!(
        resolver.parent_of(CLASS_NEEDED).await.unwrap().as_deref(),
        Some(CLASSIFICATION)
    );
}

#[tokio::test]
async fn test_tags_under_cached_after_first_query() {
    let ontology = Arc::new(curation_ontology());
    let resolver = resolver(ontology.clone());

    let first = resolver.tags_under(CLASS_IN_PROGRESS).await.unwrap();
    let requests = ontology.descendant_requests();
    let second = resolver.tags_under(CLASS_IN_PROGRESS).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(ontology.descendant_requests(), requests);
    let expected: Vec<String> = (1..=3).map(in_progress).collect();
    assert_eq!(first.into_iter().collect::<Vec<_>>(), expected);
}

#[tokio::test]
async fn test_names_resolve_both_ways() {
    let resolver = resolver(Arc::new(curation_ontology()));

    assert_eq!(resolver.resolve_name(TEXT_NEEDED).await, "text conversion needed");
    assert_eq!(
        resolver.id_for_name("file converted to text").await.unwrap().as_deref(),
        Some(TEXT_CONVERTED)
    );
    assert_eq!(resolver.resolve_name("ATP:0009999").await, "ATP:0009999");
}

#[tokio::test]
async fn test_offline_service_is_an_error_but_names_degrade() {
    let ontology = Arc::new(curation_ontology());
    ontology.set_offline(true);
    let resolver = resolver(ontology.clone());

    assert_eq!(resolver.resolve_name(TEXT_NEEDED).await, TEXT_NEEDED);
    let err = resolver.tags_under(CLASS_NEEDED).await.unwrap_err();
    assert!(matches!(err, OntologyError::Request(_)));

    let wrapped = WorkflowError::from(err);
    assert_eq!(wrapped.kind(), ErrorKind::ServiceUnavailable);

    // Back online, the hierarchy loads on the next query
    ontology.set_offline(false);
    assert_eq!(resolver.tags_under(CLASS_NEEDED).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_offline_ontology_blocks_track_creation() {
    let h = harness(Vec::new()).await;
    h.ontology.set_offline(true);

    let err = h
        .engine
        .create_track(1, ORG, TEXT_NEEDED, "curator")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
    assert!(h.store.states().await.is_empty());
}

#[tokio::test]
async fn test_jobs_to_run_limited_to_org_subset() {
    let ontology = Arc::new(curation_ontology().subset(ORG, &[&needed(1), &needed(3)]));
    let resolver = resolver(ontology);

    let jobs = resolver.jobs_to_run(FAMILY, ORG).await.unwrap();
    assert_eq!(jobs, vec![CLASS_NEEDED.to_string(), needed(1), needed(3)]);

    let by_id = resolver.jobs_to_run(CLASS_NEEDED, "FB").await.unwrap();
    assert_eq!(by_id, vec![CLASS_NEEDED.to_string()]);

    assert!(matches!(
        resolver.jobs_to_run("banana", ORG).await,
        Err(OntologyError::UnknownTerm(_))
    ));
}

#[tokio::test]
async fn test_invalidate_forces_reload() {
    let ontology = Arc::new(curation_ontology());
    let resolver = resolver(ontology.clone());

    resolver.tags_under(TEXT_CONVERSION).await.unwrap();
    let loaded = ontology.descendant_requests();
    resolver.invalidate().await;
    resolver.tags_under(TEXT_CONVERSION).await.unwrap();

    assert!(ontology.descendant_requests() > loaded);
}
