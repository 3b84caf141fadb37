//! Research workflow integration tests
//!
//! Tests for research -> deduplicate -> merge -> persist against a file store.

mod common;

use std::sync::Arc;

use common::{
    budget, engine, hit, single_topic_plan, test_settings, BagOfWordsEmbedder, PinnedIndex, PlanScript,
    ScriptedReasoner, ScriptedSearch, UnavailableIndex,
};
use deepdive::core::{
    BudgetGuard, CancelFlag, DocumentStore, PersistOperation, ResearchWorkflow, StopPolicy,
};
use deepdive::dedup::{DedupAction, DedupSettings, DeduplicationEngine};
use deepdive::domain::{ArtifactId, ArtifactMetadata, StopReason};
use deepdive::index::{MemoryIndex, SimilarityIndex};
use deepdive::merge::{MergeEngine, MergeSettings};
use deepdive::store::FileDocumentStore;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const QUERY: &str = "Does coffee improve focus?";

fn metadata() -> ArtifactMetadata {
    ArtifactMetadata {
        title: "Coffee and focus".to_string(),
        topics: vec!["coffee".to_string()],
        purpose: String::new(),
    }
}

fn workflow(index: Arc<dyn SimilarityIndex>, store: Arc<FileDocumentStore>) -> ResearchWorkflow {
    workflow_with(index, store, Arc::new(BudgetGuard::default()), 0.001, 2)
}

fn workflow_with(
    index: Arc<dyn SimilarityIndex>,
    store: Arc<FileDocumentStore>,
    guard: Arc<BudgetGuard>,
    call_cost: f64,
    max_hops: u32,
) -> ResearchWorkflow {
    let plan = PlanScript::Usable(single_topic_plan("coffee", "coffee improves focus"));
    let engine = engine(
        Arc::new(ScriptedSearch::new(2)),
        Arc::new(ScriptedReasoner::new(plan)),
        guard,
        test_settings(1, call_cost),
    );
    let policy = StopPolicy::from_settings(engine.settings()).with_max_hops(max_hops);
    ResearchWorkflow::new(
        engine,
        DeduplicationEngine::new(index.clone(), DedupSettings::default()),
        MergeEngine::new(Arc::new(BagOfWordsEmbedder), MergeSettings::default()),
        index,
        store,
        policy,
    )
}

#[tokio::test]
async fn test_first_session_creates_and_indexes_artifact() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileDocumentStore::new(dir.path()));
    let index = Arc::new(MemoryIndex::new(Arc::new(BagOfWordsEmbedder)));
    let workflow = workflow(index.clone(), store.clone());

    let outcome = workflow.research(QUERY, metadata(), &CancelFlag::new()).await.unwrap();
    assert_eq!(outcome.decision.action, DedupAction::Create);
    assert!(outcome.within_budget);
    assert!(outcome.context.evidence_count() > 0);
    // Scripted confidence 0.5 sits below the default target
    assert!(outcome.warnings.iter().any(|w| w.contains("Low confidence")));

    let report = workflow.save(&outcome).await.unwrap();
    assert_eq!(report.operation, PersistOperation::Create);
    assert!(report.conflicts.is_empty());
    assert_eq!(report.diff.statements_added, outcome.content.findings.len());

    let stored = store.load(&report.artifact_id).await.unwrap();
    assert_eq!(stored.metadata.title, "Coffee and focus");
    assert_eq!(stored.questions, vec![QUERY.to_string()]);
    assert_eq!(stored.revision, 0);

    assert!(store.markdown_path(&report.artifact_id).exists());
    let catalog = store.catalog().await.unwrap();
    assert_eq!(catalog.len(), 1);
    assert_eq!(index.len().await, 1);
}

#[tokio::test]
async fn test_near_duplicate_session_updates_existing_artifact() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileDocumentStore::new(dir.path()));
    let first = workflow(Arc::new(MemoryIndex::new(Arc::new(BagOfWordsEmbedder))), store.clone());
    let created = first
        .save(&first.research(QUERY, metadata(), &CancelFlag::new()).await.unwrap())
        .await
        .unwrap();

    let pinned = Arc::new(PinnedIndex::new(vec![hit(
        created.artifact_id.as_str(),
        0.95,
        &["coffee"],
        &[QUERY],
    )]));
    let second = workflow(pinned, store.clone());
    let outcome = second.research(QUERY, metadata(), &CancelFlag::new()).await.unwrap();
    assert_eq!(outcome.decision.action, DedupAction::Update);

    let report = second.save(&outcome).await.unwrap();
    assert_eq!(report.operation, PersistOperation::Update);
    assert_eq!(report.artifact_id, created.artifact_id);

    let stored = store.load(&created.artifact_id).await.unwrap();
    assert_eq!(stored.revision, 1);
    assert_eq!(store.catalog().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_missing_target_falls_back_to_create() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileDocumentStore::new(dir.path()));
    let pinned = Arc::new(PinnedIndex::new(vec![hit("gone", 0.95, &["coffee"], &[QUERY])]));
    let workflow = workflow(pinned, store.clone());

    let outcome = workflow.research(QUERY, metadata(), &CancelFlag::new()).await.unwrap();
    assert_eq!(outcome.decision.action, DedupAction::Update);

    let report = workflow.save(&outcome).await.unwrap();
    assert_eq!(report.operation, PersistOperation::Create);
    assert_ne!(report.artifact_id.as_str(), "gone");
    assert!(report.warnings.iter().any(|w| w.contains("not found")));
    let stored = assert_ok!(store.load(&report.artifact_id).await);
    assert_eq!(stored.revision, 0);
    assert_err!(store.load(&ArtifactId::new("gone")).await);
}

#[tokio::test]
async fn test_index_outage_does_not_lose_the_artifact() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileDocumentStore::new(dir.path()));
    let workflow = workflow(Arc::new(UnavailableIndex), store.clone());

    let outcome = workflow.research(QUERY, metadata(), &CancelFlag::new()).await.unwrap();
    assert_eq!(outcome.decision.action, DedupAction::Create);

    let report = workflow.save(&outcome).await.unwrap();
    assert_eq!(report.operation, PersistOperation::Create);
    assert!(report.warnings.iter().any(|w| w.contains("not indexed")));
    assert!(store.exists(&report.artifact_id).await.unwrap());
}

#[tokio::test]
async fn test_empty_metadata_filled_from_session() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileDocumentStore::new(dir.path()));
    let workflow = workflow(Arc::new(MemoryIndex::new(Arc::new(BagOfWordsEmbedder))), store);

    let outcome = workflow
        .research(QUERY, ArtifactMetadata::default(), &CancelFlag::new())
        .await
        .unwrap();

    assert_eq!(outcome.content.metadata.title, QUERY);
    assert_eq!(outcome.content.metadata.topics, vec!["coffee".to_string()]);
}

#[tokio::test]
async fn test_budget_cutoff_flags_outcome_and_still_saves() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FileDocumentStore::new(dir.path()));
    let guard = budget(0.105);
    // Plan 0.01, hop 1 0.03, hop 2 0.04; hop 3 is denied its test call
    let workflow = workflow_with(
        Arc::new(MemoryIndex::new(Arc::new(BagOfWordsEmbedder))),
        store.clone(),
        guard.clone(),
        0.01,
        5,
    );

    let outcome = workflow.research(QUERY, metadata(), &CancelFlag::new()).await.unwrap();

    assert!(!outcome.within_budget);
    assert!(outcome.warnings.iter().any(|w| w.contains("Budget exhausted after 3 hops")));
    assert_eq!(outcome.context.stop_reason, Some(StopReason::BudgetExhausted));
    assert_eq!(outcome.context.hops().len(), 3);
    let last = &outcome.context.hops()[2];
    assert!(last.partial);
    assert!(!last.evidence.is_empty());
    assert!(outcome.context.cost_usd <= 0.105 + 1e-9);
    assert_eq!(guard.open_sessions(), 0);

    // The partial session is still worth keeping
    let report = workflow.save(&outcome).await.unwrap();
    assert_eq!(report.operation, PersistOperation::Create);
    assert!(store.exists(&report.artifact_id).await.unwrap());
}
