//! Research session data model.
//!
//! A session (`ReasoningContext`) owns an append-only list of hops. Each hop
//! records the hypotheses it tested, the evidence it gathered, the per-hypothesis
//! verdicts and a synthesis. Nothing in a completed hop is edited afterwards.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Gap recorded when a hop (or a whole session) produced no usable evidence.
pub const NO_EVIDENCE_GAP: &str = "no evidence obtained";

/// Verdict used when a hypothesis test could not be interpreted.
pub const INCONCLUSIVE_VERDICT: &str = "inconclusive";

/// How a hypothesis is meant to be tested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestMethod {
    /// Read the evidence and judge support/contradiction
    #[default]
    EvidenceReview,

    /// Look for independent sources agreeing with each other
    SourceTriangulation,

    /// Compare figures reported by the evidence
    Quantitative,

    /// Actively search for counterexamples
    Counterexample,

    /// Anything the reasoning provider invents that we do not model
    #[serde(other)]
    Unspecified,
}

/// A testable statement
///
/// Hypotheses are never mutated. A later hop refines one by creating a new
/// hypothesis whose `refines` points at the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Unique identifier
    pub id: Uuid,

    /// Research topic this hypothesis belongs to
    pub topic: String,

    /// The claim under test
    pub statement: String,

    /// Confidence before any evidence was seen, in [0, 1]
    pub prior_confidence: f64,

    /// Description of the evidence that would settle the claim
    #[serde(default)]
    pub required_evidence: String,

    /// Test method tag
    #[serde(default)]
    pub test_method: TestMethod,

    /// Hypothesis this one refines, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refines: Option<Uuid>,
}

impl Hypothesis {
    /// Create a hypothesis with a neutral prior
    pub fn new(topic: impl Into<String>, statement: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            statement: statement.into(),
            prior_confidence: 0.5,
            required_evidence: String::new(),
            test_method: TestMethod::default(),
            refines: None,
        }
    }

    /// Set the prior confidence (clamped to [0, 1])
    pub fn with_prior(mut self, prior: f64) -> Self {
        self.prior_confidence = clamp_unit(prior);
        self
    }

    /// Describe the evidence needed to test this hypothesis
    pub fn with_required_evidence(mut self, required: impl Into<String>) -> Self {
        self.required_evidence = required.into();
        self
    }

    /// Set the test method
    pub fn with_method(mut self, method: TestMethod) -> Self {
        self.test_method = method;
        self
    }

    /// Create a refinement of this hypothesis with a new statement
    pub fn refine(&self, statement: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: self.topic.clone(),
            statement: statement.into(),
            prior_confidence: self.prior_confidence,
            required_evidence: self.required_evidence.clone(),
            test_method: self.test_method,
            refines: Some(self.id),
        }
    }

    /// Query string handed to the evidence provider
    pub fn search_query(&self) -> String {
        self.statement
            .trim()
            .trim_end_matches(|c: char| c == '.' || c == '?' || c == '!')
            .to_string()
    }
}

/// One retrieved evidence item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Snippet text
    pub text: String,

    /// Source locator (URL, document path, ...). Evidence identity.
    pub source: String,

    /// Relevance score reported by the provider, in [0, 1]
    pub relevance: f64,
}

impl Evidence {
    /// Create an evidence item (relevance clamped to [0, 1])
    pub fn new(text: impl Into<String>, source: impl Into<String>, relevance: f64) -> Self {
        Self {
            text: text.into(),
            source: source.into(),
            relevance: clamp_unit(relevance),
        }
    }
}

/// Outcome of testing one hypothesis against its evidence
///
/// Evidence is referenced by source locator, the hop owns the items themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HypothesisResult {
    /// Hypothesis that was tested
    pub hypothesis_id: Uuid,

    /// Topic of the tested hypothesis
    pub topic: String,

    /// Statement of the tested hypothesis
    pub statement: String,

    /// Confidence before testing
    pub prior_confidence: f64,

    /// Confidence after testing, in [0, 1]
    pub posterior_confidence: f64,

    /// Sources supporting the hypothesis
    #[serde(default)]
    pub supporting: Vec<String>,

    /// Sources contradicting the hypothesis
    #[serde(default)]
    pub contradicting: Vec<String>,

    /// Verdict text
    pub verdict: String,
}

impl HypothesisResult {
    /// Create a result for a hypothesis
    pub fn new(hypothesis: &Hypothesis, posterior: f64, verdict: impl Into<String>) -> Self {
        Self {
            hypothesis_id: hypothesis.id,
            topic: hypothesis.topic.clone(),
            statement: hypothesis.statement.clone(),
            prior_confidence: hypothesis.prior_confidence,
            posterior_confidence: clamp_unit(posterior),
            supporting: Vec::new(),
            contradicting: Vec::new(),
            verdict: verdict.into(),
        }
    }

    /// Attach supporting and contradicting sources
    pub fn with_split(mut self, supporting: Vec<String>, contradicting: Vec<String>) -> Self {
        self.supporting = supporting;
        self.contradicting = contradicting;
        self
    }

    /// Conservative result for a test whose output could not be used
    pub fn inconclusive(hypothesis: &Hypothesis) -> Self {
        Self::new(hypothesis, 0.0, INCONCLUSIVE_VERDICT)
    }

    /// Result recorded for a hypothesis that never received evidence
    pub fn without_evidence(hypothesis: &Hypothesis) -> Self {
        Self::new(hypothesis, 0.0, NO_EVIDENCE_GAP)
    }

    /// posterior - prior
    pub fn confidence_change(&self) -> f64 {
        self.posterior_confidence - self.prior_confidence
    }

    /// Whether any evidence was classified for this hypothesis
    pub fn has_evidence(&self) -> bool {
        !self.supporting.is_empty() || !self.contradicting.is_empty()
    }
}

/// Summary of a hop or of a whole session. Always derived, never edited.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    /// Key findings, most important first
    #[serde(default)]
    pub key_findings: Vec<String>,

    /// Confidence in the findings, in [0, 1]
    pub confidence: f64,

    /// Open questions left after this synthesis
    #[serde(default)]
    pub remaining_gaps: Vec<String>,

    /// Suggested next steps
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl Synthesis {
    /// Synthesis for a hop or session that produced no usable evidence
    pub fn no_evidence() -> Self {
        Self {
            key_findings: Vec::new(),
            confidence: 0.0,
            remaining_gaps: vec![NO_EVIDENCE_GAP.to_string()],
            recommendations: Vec::new(),
        }
    }

    /// Local synthesis built straight from hypothesis results
    ///
    /// Used when the reasoning provider cannot synthesize (failure, malformed
    /// output, or no budget left).
    pub fn from_results(results: &[HypothesisResult], confidence: f64) -> Self {
        let tested: Vec<&HypothesisResult> = results.iter().filter(|r| r.has_evidence()).collect();
        if tested.is_empty() {
            return Self::no_evidence();
        }

        let mut key_findings = Vec::new();
        let mut remaining_gaps = Vec::new();
        for result in &tested {
            if result.posterior_confidence >= 0.5 {
                key_findings.push(format!("{} ({})", result.statement, result.verdict));
            } else {
                remaining_gaps.push(result.statement.clone());
            }
        }
        for result in results.iter().filter(|r| !r.has_evidence()) {
            remaining_gaps.push(result.statement.clone());
        }

        Self {
            key_findings,
            confidence: clamp_unit(confidence),
            remaining_gaps,
            recommendations: Vec::new(),
        }
    }

    /// Combine hop syntheses (oldest first) into a session synthesis
    ///
    /// Findings and recommendations are the ordered union across hops. Gaps
    /// come from the most recent hop only: earlier gaps were the input of
    /// later hops.
    pub fn consolidate<'a, I>(syntheses: I, confidence: f64) -> Self
    where
        I: IntoIterator<Item = &'a Synthesis>,
    {
        let mut key_findings: Vec<String> = Vec::new();
        let mut recommendations: Vec<String> = Vec::new();
        let mut last: Option<&Synthesis> = None;

        for synthesis in syntheses {
            push_unique(&mut key_findings, &synthesis.key_findings);
            push_unique(&mut recommendations, &synthesis.recommendations);
            last = Some(synthesis);
        }

        if key_findings.is_empty() {
            return Self::no_evidence();
        }

        Self {
            key_findings,
            confidence: clamp_unit(confidence),
            remaining_gaps: last.map(|s| s.remaining_gaps.clone()).unwrap_or_default(),
            recommendations,
        }
    }
}

fn push_unique(target: &mut Vec<String>, items: &[String]) {
    for item in items {
        if !target.contains(item) {
            target.push(item.clone());
        }
    }
}

/// Output of one hop. Immutable once appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopResult {
    /// 1-indexed hop number
    pub hop_number: u32,

    /// Distinct topics addressed by this hop
    pub topics: Vec<String>,

    /// Hypotheses tested in this hop
    pub hypotheses: Vec<Hypothesis>,

    /// Evidence gathered in this hop
    pub evidence: Vec<Evidence>,

    /// Verdict per hypothesis
    pub results: Vec<HypothesisResult>,

    /// Synthesis of this hop's results
    pub synthesis: Synthesis,

    /// True if the hop was cut short (budget exhausted mid-hop)
    #[serde(default)]
    pub partial: bool,

    /// When the hop started
    pub started_at: DateTime<Utc>,

    /// When the hop completed
    pub completed_at: DateTime<Utc>,
}

impl HopResult {
    /// Whether any hypothesis in this hop was tested against evidence
    pub fn has_evidence(&self) -> bool {
        self.results.iter().any(HypothesisResult::has_evidence)
    }
}

/// Research plan built at session start
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Topics to investigate
    #[serde(default)]
    pub topics: Vec<String>,

    /// Candidate hypotheses for the first hop
    #[serde(default)]
    pub hypotheses: Vec<Hypothesis>,

    /// What "answered" looks like
    #[serde(default)]
    pub success_criteria: Vec<String>,

    /// Provider's estimate of hops needed
    #[serde(default)]
    pub estimated_hops: u32,
}

impl Plan {
    /// A plan is usable if it names at least one topic or hypothesis
    pub fn is_usable(&self) -> bool {
        self.topics.iter().any(|t| !t.trim().is_empty())
            || self.hypotheses.iter().any(|h| !h.statement.trim().is_empty())
    }

    /// Single-topic, single-hypothesis plan derived from the raw query
    pub fn fallback(query: &str) -> Self {
        let query = query.trim();
        Self {
            topics: vec![query.to_string()],
            hypotheses: vec![Hypothesis::new(query, query)
                .with_required_evidence("sources that directly address the query")],
            success_criteria: vec![format!("A supported answer to: {}", query)],
            estimated_hops: 1,
        }
    }
}

/// Why the research loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Overall confidence reached the early-stop threshold
    ConfidenceReached,

    /// The configured hop limit was reached
    MaxHops,

    /// The budget guard refused further calls
    BudgetExhausted,

    /// The caller cancelled the session
    Cancelled,

    /// Nothing left to investigate
    NoOpenQuestions,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::ConfidenceReached => "confidence_reached",
            StopReason::MaxHops => "max_hops",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::Cancelled => "cancelled",
            StopReason::NoOpenQuestions => "no_open_questions",
        };
        write!(f, "{}", s)
    }
}

/// Hop appended out of sequence
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Hop {actual} appended out of order (expected hop {expected})")]
pub struct HopOrderError {
    pub expected: u32,
    pub actual: u32,
}

/// Root aggregate of a research session
///
/// Mutated only by appending completed hops. The hop counter is the length of
/// the hop list, so the two can never drift apart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningContext {
    /// Session identifier
    pub session_id: Uuid,

    /// Original research question
    pub query: String,

    /// Plan built at session start
    pub plan: Plan,

    /// True if `plan` is the fallback plan
    #[serde(default)]
    pub plan_is_fallback: bool,

    /// When the session was created
    pub started_at: DateTime<Utc>,

    /// Final session synthesis, set once the loop ends
    #[serde(default)]
    pub final_synthesis: Option<Synthesis>,

    /// Why the loop ended
    #[serde(default)]
    pub stop_reason: Option<StopReason>,

    /// Committed spend in USD, set once the loop ends
    #[serde(default)]
    pub cost_usd: f64,

    hops: Vec<HopResult>,

    /// Cumulative evidence keyed by source locator
    evidence: BTreeMap<String, Evidence>,
}

impl ReasoningContext {
    /// Create a new session
    pub fn new(query: impl Into<String>, plan: Plan) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            query: query.into(),
            plan,
            plan_is_fallback: false,
            started_at: Utc::now(),
            final_synthesis: None,
            stop_reason: None,
            cost_usd: 0.0,
            hops: Vec::new(),
            evidence: BTreeMap::new(),
        }
    }

    /// Number of completed hops
    pub fn current_hop(&self) -> u32 {
        self.hops.len() as u32
    }

    /// Number the next hop must carry
    pub fn next_hop_number(&self) -> u32 {
        self.current_hop() + 1
    }

    /// Completed hops, oldest first
    pub fn hops(&self) -> &[HopResult] {
        &self.hops
    }

    /// Most recently completed hop
    pub fn last_hop(&self) -> Option<&HopResult> {
        self.hops.last()
    }

    /// Cumulative evidence, deduplicated by source locator
    pub fn evidence(&self) -> impl Iterator<Item = &Evidence> {
        self.evidence.values()
    }

    /// Number of distinct evidence sources seen
    pub fn evidence_count(&self) -> usize {
        self.evidence.len()
    }

    /// Append a completed hop
    pub fn append_hop(&mut self, hop: HopResult) -> Result<(), HopOrderError> {
        let expected = self.next_hop_number();
        if hop.hop_number != expected {
            return Err(HopOrderError {
                expected,
                actual: hop.hop_number,
            });
        }

        for item in &hop.evidence {
            match self.evidence.get(&item.source) {
                Some(existing) if existing.relevance >= item.relevance => {}
                _ => {
                    self.evidence.insert(item.source.clone(), item.clone());
                }
            }
        }

        self.hops.push(hop);
        Ok(())
    }

    /// Distinct topics addressed so far, in first-seen order
    pub fn topics_addressed(&self) -> Vec<String> {
        let mut topics: Vec<String> = Vec::new();
        for hop in &self.hops {
            for topic in &hop.topics {
                if !topics.contains(topic) {
                    topics.push(topic.clone());
                }
            }
        }
        topics
    }
}

/// Clamp to [0, 1], mapping NaN to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
