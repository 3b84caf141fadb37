//! Research loop integration tests
//!
//! Tests for stop conditions, budget cut-offs, fallbacks and hop ordering.

mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use common::{budget, engine, single_topic_plan, test_settings, PlanScript, ScriptedReasoner, ScriptedSearch};
use deepdive::core::{CancelFlag, ChannelSink, ProgressSink, ResearchError, StopPolicy};
use deepdive::domain::{ProgressEvent, ProgressKind, StopReason, NO_EVIDENCE_GAP};

fn plan() -> PlanScript {
    PlanScript::Usable(single_topic_plan("t", "coffee improves focus"))
}

#[tokio::test]
async fn test_budget_exhausted_mid_hop_keeps_partial_hop() {
    // Every call costs 0.01: plan, then 3 calls in hop 1 and 4 per later hop.
    // Hop 3 gets its hypothesis and evidence (total 0.10) but not its test.
    let search = Arc::new(ScriptedSearch::new(2));
    let reasoner = Arc::new(ScriptedReasoner::new(plan()));
    let guard = budget(10.0);
    let engine = engine(search, reasoner, guard.clone(), test_settings(1, 0.01));

    let policy = StopPolicy::from_settings(engine.settings())
        .with_max_hops(5)
        .with_budget(0.105);
    let context = engine
        .run_to_completion("Does coffee improve focus?", &policy)
        .await
        .unwrap();

    assert_eq!(context.stop_reason, Some(StopReason::BudgetExhausted));
    assert_eq!(context.current_hop(), 3);
    assert_eq!(context.hops().len(), 3);

    let hop3 = &context.hops()[2];
    assert!(hop3.partial);
    assert!(!hop3.evidence.is_empty());
    assert!(!context.hops()[0].partial);
    assert!(!context.hops()[1].partial);

    let spent = context.cost_usd;
    assert!(spent <= 0.105 + 1e-9, "spent {}", spent);
    assert!((spent - 0.10).abs() < 1e-9, "spent {}", spent);
    assert_eq!(guard.open_sessions(), 0);
    assert!(context.final_synthesis.is_some());
}

#[tokio::test]
async fn test_hop_numbers_are_monotonic() {
    let search = Arc::new(ScriptedSearch::new(1));
    let reasoner = Arc::new(ScriptedReasoner::new(plan()).with_confidence(0.4, 0.4));
    let engine = engine(search, reasoner, budget(1.0), test_settings(2, 0.001));

    let policy = StopPolicy::from_settings(engine.settings()).with_max_hops(4);
    let context = engine.run_to_completion("Is tea healthy?", &policy).await.unwrap();

    assert_eq!(context.stop_reason, Some(StopReason::MaxHops));
    assert_eq!(context.current_hop(), 4);
    for (i, hop) in context.hops().iter().enumerate() {
        assert_eq!(hop.hop_number, i as u32 + 1);
        assert!(hop.completed_at >= hop.started_at);
    }

    let confidence = context.final_synthesis.unwrap().confidence;
    assert!((0.0..=1.0).contains(&confidence));
    assert!((confidence - 0.4).abs() < 1e-12);
}

#[tokio::test]
async fn test_run_hop_appends_one_hop_at_a_time() {
    let search = Arc::new(ScriptedSearch::new(1));
    let reasoner = Arc::new(ScriptedReasoner::new(plan()));
    let engine = engine(search, reasoner.clone(), budget(1.0), test_settings(1, 0.001));

    let mut context = engine.start("Does coffee improve focus?").await.unwrap();
    assert_eq!(context.current_hop(), 0);

    let first = engine.run_hop(&mut context).await.unwrap();
    assert_eq!(first.hop_number, 1);
    assert_eq!(first.hypotheses[0].statement, "coffee improves focus");

    let second = engine.run_hop(&mut context).await.unwrap();
    assert_eq!(second.hop_number, 2);
    assert_eq!(context.current_hop(), 2);

    // Hop 2 is driven by the gaps hop 1 left open
    assert_eq!(reasoner.generated_for(), vec!["open question".to_string()]);
    assert_eq!(second.hypotheses[0].topic, "t");
    assert_eq!(second.hypotheses[0].statement, "refined: open question");
}

#[tokio::test]
async fn test_unusable_plan_falls_back_to_query() {
    for script in [PlanScript::Empty, PlanScript::Malformed] {
        let search = Arc::new(ScriptedSearch::new(1));
        let reasoner = Arc::new(ScriptedReasoner::new(script));
        let engine = engine(search, reasoner, budget(1.0), test_settings(3, 0.001));

        let context = engine.start("  Why is the sky blue?  ").await.unwrap();

        assert!(context.plan_is_fallback);
        assert_eq!(context.query, "Why is the sky blue?");
        assert_eq!(context.plan.topics, vec!["Why is the sky blue?".to_string()]);
        assert_eq!(context.plan.hypotheses.len(), 1);
        assert_eq!(context.plan.hypotheses[0].statement, "Why is the sky blue?");
    }
}

#[tokio::test]
async fn test_all_searches_failing_ends_with_zero_confidence() {
    let search = Arc::new(ScriptedSearch::failing());
    let reasoner = Arc::new(ScriptedReasoner::new(plan()));
    let engine = engine(search.clone(), reasoner, budget(1.0), test_settings(2, 0.001));

    let policy = StopPolicy::from_settings(engine.settings()).with_max_hops(3);
    let context = engine.run_to_completion("Does coffee improve focus?", &policy).await.unwrap();

    assert_eq!(context.stop_reason, Some(StopReason::MaxHops));
    assert_eq!(context.evidence_count(), 0);
    assert!(context.hops().iter().all(|h| !h.has_evidence()));
    assert!(search.calls() >= 3);

    let synthesis = context.final_synthesis.unwrap();
    assert_eq!(synthesis.confidence, 0.0);
    assert_eq!(synthesis.remaining_gaps, vec![NO_EVIDENCE_GAP.to_string()]);
}

#[tokio::test]
async fn test_failed_tests_count_as_inconclusive() {
    let search = Arc::new(ScriptedSearch::new(2));
    let mut reasoner = ScriptedReasoner::new(plan());
    reasoner.fail_tests = true;
    let engine = engine(search, Arc::new(reasoner), budget(1.0), test_settings(1, 0.001));

    let mut context = engine.start("Does coffee improve focus?").await.unwrap();
    let hop = engine.run_hop(&mut context).await.unwrap();

    assert_eq!(hop.evidence.len(), 2);
    assert_eq!(hop.results[0].posterior_confidence, 0.0);
    assert_eq!(hop.results[0].verdict, "inconclusive");
    assert!(!hop.partial);
}

#[tokio::test]
async fn test_high_confidence_stops_early() {
    let search = Arc::new(ScriptedSearch::new(2));
    let reasoner = Arc::new(ScriptedReasoner::new(plan()).with_confidence(0.9, 0.9));
    let engine = engine(search, reasoner, budget(1.0), test_settings(1, 0.001));

    let policy = StopPolicy::from_settings(engine.settings());
    let context = engine.run_to_completion("Does coffee improve focus?", &policy).await.unwrap();

    assert_eq!(context.stop_reason, Some(StopReason::ConfidenceReached));
    assert_eq!(context.current_hop(), 1);
}

#[tokio::test]
async fn test_target_confidence_without_gaps_stops() {
    let search = Arc::new(ScriptedSearch::new(2));
    let reasoner = Arc::new(
        ScriptedReasoner::new(plan())
            .with_confidence(0.75, 0.75)
            .with_gaps(&[]),
    );
    let engine = engine(search, reasoner, budget(1.0), test_settings(1, 0.001));

    let policy = StopPolicy::from_settings(engine.settings());
    let context = engine.run_to_completion("Does coffee improve focus?", &policy).await.unwrap();

    assert_eq!(context.stop_reason, Some(StopReason::ConfidenceReached));
    assert_eq!(context.current_hop(), 1);
}

#[tokio::test]
async fn test_empty_query_is_rejected() {
    let search = Arc::new(ScriptedSearch::new(1));
    let reasoner = Arc::new(ScriptedReasoner::new(plan()));
    let engine = engine(search.clone(), reasoner, budget(1.0), test_settings(1, 0.001));

    let policy = StopPolicy::from_settings(engine.settings());
    let result = engine.run_to_completion("   ", &policy).await;

    assert!(matches!(result, Err(ResearchError::EmptyQuery)));
    assert_eq!(search.calls(), 0);
}

/// Sink that raises a cancel flag once hop 1 is synthesized
struct CancelAfterFirstHop {
    cancel: CancelFlag,
    kinds: Mutex<Vec<ProgressKind>>,
}

#[async_trait]
impl ProgressSink for CancelAfterFirstHop {
    async fn emit(&self, event: &ProgressEvent) {
        self.kinds.lock().unwrap().push(event.kind);
        if event.kind == ProgressKind::HopSynthesized && event.hop == Some(1) {
            self.cancel.cancel();
        }
    }
}

#[tokio::test]
async fn test_cancel_finishes_in_flight_hop() {
    let cancel = CancelFlag::new();
    let sink = Arc::new(CancelAfterFirstHop {
        cancel: cancel.clone(),
        kinds: Mutex::new(Vec::new()),
    });

    let search = Arc::new(ScriptedSearch::new(2));
    let reasoner = Arc::new(ScriptedReasoner::new(plan()));
    let engine = engine(search, reasoner, budget(1.0), test_settings(1, 0.001)).with_progress(sink.clone());

    let policy = StopPolicy::from_settings(engine.settings());
    let context = engine
        .run_cancellable("Does coffee improve focus?", &policy, &cancel)
        .await
        .unwrap();

    assert_eq!(context.stop_reason, Some(StopReason::Cancelled));
    assert_eq!(context.current_hop(), 1);
    assert!(context.hops()[0].has_evidence());

    let kinds = sink.kinds.lock().unwrap().clone();
    assert!(kinds.contains(&ProgressKind::SessionCancelled));
    assert_eq!(kinds.last(), Some(&ProgressKind::SessionComplete));
}

#[tokio::test]
async fn test_progress_events_are_ordered() {
    let (sink, mut rx) = ChannelSink::new();
    let search = Arc::new(ScriptedSearch::new(1));
    let reasoner = Arc::new(ScriptedReasoner::new(plan()));
    let engine = engine(search, reasoner, budget(1.0), test_settings(1, 0.001)).with_progress(Arc::new(sink));

    let policy = StopPolicy::from_settings(engine.settings()).with_max_hops(2);
    let context = engine.run_to_completion("Does coffee improve focus?", &policy).await.unwrap();
    drop(engine);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert_eq!(events.first().map(|e| e.kind), Some(ProgressKind::SessionStarted));
    let last = events.last().unwrap();
    assert_eq!(last.kind, ProgressKind::SessionComplete);
    assert_eq!(last.stop_reason, Some(StopReason::MaxHops));
    assert!(events.iter().all(|e| e.session_id == context.session_id));

    let hop_marks: Vec<(ProgressKind, Option<u32>)> = events
        .iter()
        .filter(|e| matches!(e.kind, ProgressKind::HopStarted | ProgressKind::HopSynthesized))
        .map(|e| (e.kind, e.hop))
        .collect();
    assert_eq!(
        hop_marks,
        vec![
            (ProgressKind::HopStarted, Some(1)),
            (ProgressKind::HopSynthesized, Some(1)),
            (ProgressKind::HopStarted, Some(2)),
            (ProgressKind::HopSynthesized, Some(2)),
        ]
    );
}

#[tokio::test]
async fn test_budget_warning_is_emitted_once() {
    let (sink, mut rx) = ChannelSink::new();
    let search = Arc::new(ScriptedSearch::new(1));
    let reasoner = Arc::new(ScriptedReasoner::new(plan()));
    let engine = engine(search, reasoner, budget(10.0), test_settings(1, 0.01)).with_progress(Arc::new(sink));

    let policy = StopPolicy::from_settings(engine.settings()).with_budget(0.105);
    engine.run_to_completion("Does coffee improve focus?", &policy).await.unwrap();
    drop(engine);

    let mut warnings = 0;
    while let Ok(event) = rx.try_recv() {
        if event.kind == ProgressKind::BudgetWarning {
            warnings += 1;
        }
    }
    assert_eq!(warnings, 1);
}
