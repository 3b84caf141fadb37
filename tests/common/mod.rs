//! Scripted providers, embedders and indexes shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use deepdive::adapters::{EvidenceProvider, ProviderError, ReasoningProvider, Reply};
use deepdive::core::{BudgetGuard, BudgetLimits, CostModel, HypothesisEngine, ResearchSettings, RetryPolicy};
use deepdive::dedup::key_terms;
use deepdive::domain::{Evidence, Hypothesis, HypothesisResult, Plan, Synthesis};
use deepdive::index::{EntryMetadata, Embedder, IndexError, IndexHit, SimilarityIndex};

/// Search provider returning fresh sources on every call
pub struct ScriptedSearch {
    pub per_call: usize,
    pub fail: bool,
    calls: AtomicUsize,
}

impl ScriptedSearch {
    pub fn new(per_call: usize) -> Self {
        Self {
            per_call,
            fail: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(0)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvidenceProvider for ScriptedSearch {
    fn name(&self) -> &str {
        "scripted-search"
    }

    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Evidence>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(ProviderError::unavailable("scripted-search", "connection refused"));
        }
        Ok((0..self.per_call.min(max_results))
            .map(|i| {
                Evidence::new(
                    format!("Snippet {} about {}", i, query),
                    format!("https://source.test/{}/{}", call, i),
                    0.8,
                )
            })
            .collect())
    }
}

/// How the scripted reasoner answers planning calls
#[derive(Clone)]
pub enum PlanScript {
    Usable(Plan),
    Empty,
    Malformed,
}

/// Reasoning provider with fixed answers
pub struct ScriptedReasoner {
    pub plan: PlanScript,
    pub posterior: f64,
    pub synthesis_confidence: f64,
    pub gaps: Vec<String>,
    pub fail_tests: bool,
    seen_gaps: Mutex<Vec<String>>,
}

impl ScriptedReasoner {
    pub fn new(plan: PlanScript) -> Self {
        Self {
            plan,
            posterior: 0.5,
            synthesis_confidence: 0.5,
            gaps: vec!["open question".to_string()],
            fail_tests: false,
            seen_gaps: Mutex::new(Vec::new()),
        }
    }

    pub fn with_confidence(mut self, posterior: f64, synthesis: f64) -> Self {
        self.posterior = posterior;
        self.synthesis_confidence = synthesis;
        self
    }

    pub fn with_gaps(mut self, gaps: &[&str]) -> Self {
        self.gaps = gaps.iter().map(|g| g.to_string()).collect();
        self
    }

    /// Questions passed to `generate_hypotheses`, in call order
    pub fn generated_for(&self) -> Vec<String> {
        self.seen_gaps.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedReasoner {
    fn name(&self) -> &str {
        "scripted-reasoner"
    }

    async fn plan(&self, _query: &str) -> Reply<Plan> {
        match &self.plan {
            PlanScript::Usable(plan) => Reply::Parsed(plan.clone()),
            PlanScript::Empty => Reply::Parsed(Plan::default()),
            PlanScript::Malformed => Reply::Malformed("I think you should research it".to_string()),
        }
    }

    async fn generate_hypotheses(&self, topic: &str) -> Reply<Vec<Hypothesis>> {
        self.seen_gaps.lock().unwrap().push(topic.to_string());
        Reply::Parsed(vec![Hypothesis::new(topic, format!("refined: {}", topic))])
    }

    async fn test_hypothesis(
        &self,
        hypothesis: &Hypothesis,
        evidence: &[Evidence],
    ) -> Reply<HypothesisResult> {
        if self.fail_tests {
            return Reply::Failed(ProviderError::unavailable("scripted-reasoner", "overloaded"));
        }
        let supporting = evidence.iter().map(|e| e.source.clone()).collect();
        Reply::Parsed(HypothesisResult::new(hypothesis, self.posterior, "supported").with_split(supporting, Vec::new()))
    }

    async fn synthesize(&self, results: &[HypothesisResult]) -> Reply<Synthesis> {
        Reply::Parsed(Synthesis {
            key_findings: results.iter().map(|r| r.statement.clone()).collect(),
            confidence: self.synthesis_confidence,
            remaining_gaps: self.gaps.clone(),
            recommendations: Vec::new(),
        })
    }
}

/// Plan with one topic and one hypothesis
pub fn single_topic_plan(topic: &str, statement: &str) -> Plan {
    Plan {
        topics: vec![topic.to_string()],
        hypotheses: vec![Hypothesis::new(topic, statement)],
        success_criteria: vec!["answered".to_string()],
        estimated_hops: 2,
    }
}

/// Settings with flat costs and no retries
pub fn test_settings(max_hypotheses: usize, cost: f64) -> ResearchSettings {
    ResearchSettings {
        max_hypotheses_per_hop: max_hypotheses,
        call_timeout_seconds: 5,
        retry_policy: RetryPolicy::no_retry(),
        costs: CostModel {
            search_call_usd: cost,
            reasoning_call_usd: cost,
        },
        ..Default::default()
    }
}

pub fn budget(session_limit_usd: f64) -> Arc<BudgetGuard> {
    Arc::new(BudgetGuard::new(BudgetLimits {
        session_limit_usd,
        ..Default::default()
    }))
}

pub fn engine(
    search: Arc<ScriptedSearch>,
    reasoner: Arc<ScriptedReasoner>,
    guard: Arc<BudgetGuard>,
    settings: ResearchSettings,
) -> HypothesisEngine {
    HypothesisEngine::new(search, reasoner, guard, settings)
}

/// Hashed bag-of-words embedder over key terms
pub struct BagOfWordsEmbedder;

const DIMENSIONS: usize = 512;

fn bucket(term: &str) -> usize {
    // FNV-1a
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in term.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % DIMENSIONS as u64) as usize
}

#[async_trait]
impl Embedder for BagOfWordsEmbedder {
    fn name(&self) -> &str {
        "bag-of-words"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let mut vector = vec![0.0f32; DIMENSIONS];
        for term in key_terms(text) {
            vector[bucket(&term)] += 1.0;
        }
        Ok(vector)
    }
}

/// Embedder that always fails
pub struct DownEmbedder;

#[async_trait]
impl Embedder for DownEmbedder {
    fn name(&self) -> &str {
        "down"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, IndexError> {
        Err(IndexError::unavailable("embedding service returned 503"))
    }
}

/// Index returning pinned hits regardless of the query
pub struct PinnedIndex {
    pub hits: Vec<IndexHit>,
    queries: AtomicUsize,
}

impl PinnedIndex {
    pub fn new(hits: Vec<IndexHit>) -> Self {
        Self {
            hits,
            queries: AtomicUsize::new(0),
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

pub fn hit(id: &str, score: f64, topics: &[&str], questions: &[&str]) -> IndexHit {
    IndexHit {
        id: id.to_string(),
        score,
        metadata: EntryMetadata {
            title: format!("Artifact {}", id),
            topics: topics.iter().map(|t| t.to_string()).collect(),
            questions: questions.iter().map(|q| q.to_string()).collect(),
        },
    }
}

#[async_trait]
impl SimilarityIndex for PinnedIndex {
    async fn upsert(&self, _id: &str, _text: &str, _metadata: EntryMetadata) -> Result<(), IndexError> {
        Ok(())
    }

    async fn remove(&self, _id: &str) -> Result<bool, IndexError> {
        Ok(false)
    }

    async fn query(&self, _text: &str, limit: usize) -> Result<Vec<IndexHit>, IndexError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.hits.iter().take(limit).cloned().collect())
    }

    async fn len(&self) -> usize {
        self.hits.len()
    }
}

/// Index whose backend is down
pub struct UnavailableIndex;

#[async_trait]
impl SimilarityIndex for UnavailableIndex {
    async fn upsert(&self, _id: &str, _text: &str, _metadata: EntryMetadata) -> Result<(), IndexError> {
        Err(IndexError::unavailable("down"))
    }

    async fn remove(&self, _id: &str) -> Result<bool, IndexError> {
        Err(IndexError::unavailable("down"))
    }

    async fn query(&self, _text: &str, _limit: usize) -> Result<Vec<IndexHit>, IndexError> {
        Err(IndexError::unavailable("down"))
    }

    async fn len(&self) -> usize {
        0
    }
}
