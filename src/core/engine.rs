//! Hypothesis engine: the multi-hop research loop.
//!
//! A session runs plan -> hop -> hop -> ... until confidence is high enough,
//! the hop limit is reached, the budget runs out or the caller cancels. Every
//! provider call goes through the budget guard, a timeout and the retry
//! policy. Provider failures never abort a session: they degrade to empty
//! evidence or local fallbacks and the loop carries on.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::budget::BudgetGuard;
use super::confidence::{hop_confidence, session_confidence, should_stop, topics_below};
use super::progress::{ProgressSink, TracingSink};
use super::settings::ResearchSettings;
use super::workflow::StoreError;
use crate::adapters::{EvidenceProvider, ProviderError, ReasoningProvider, Reply};
use crate::domain::research::clamp_unit;
use crate::domain::{
    Evidence, HopOrderError, HopResult, Hypothesis, HypothesisResult, Plan, ProgressEvent,
    ProgressKind, ReasoningContext, StopReason, Synthesis, NO_EVIDENCE_GAP,
};

/// Errors that end a research request
#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("Research query is empty")]
    EmptyQuery,

    #[error(transparent)]
    HopOrder(#[from] HopOrderError),

    #[error("Failed to persist artifact: {0}")]
    Persistence(#[from] StoreError),
}

/// Cooperative cancellation flag, checked between hops
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The in-flight hop still completes.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// When a session stops
#[derive(Debug, Clone, PartialEq)]
pub struct StopPolicy {
    /// Hop limit
    pub max_hops: u32,

    /// Confidence considered good enough
    pub confidence_target: f64,

    /// Confidence at which to stop regardless of open gaps
    pub early_stop_confidence: f64,

    /// Session budget in USD, overriding the guard's default ceiling
    pub budget_usd: Option<f64>,
}

impl StopPolicy {
    /// Policy taken from the configured settings
    pub fn from_settings(settings: &ResearchSettings) -> Self {
        Self {
            max_hops: settings.max_hops,
            confidence_target: settings.confidence_target,
            early_stop_confidence: settings.early_stop_confidence,
            budget_usd: None,
        }
    }

    pub fn with_max_hops(mut self, max_hops: u32) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_budget(mut self, budget_usd: f64) -> Self {
        self.budget_usd = Some(budget_usd);
        self
    }
}

/// Result of a budget-gated provider call
enum Billed<T> {
    /// The call was made (possibly several attempts)
    Done(Reply<T>),

    /// The budget guard refused the call
    Denied,
}

/// Evidence and verdict for one hypothesis
struct Investigation {
    evidence: Vec<Evidence>,
    result: HypothesisResult,
    budget_denied: bool,
}

/// Multi-hop research engine
pub struct HypothesisEngine {
    evidence: Arc<dyn EvidenceProvider>,
    reasoner: Arc<dyn ReasoningProvider>,
    budget: Arc<BudgetGuard>,
    progress: Arc<dyn ProgressSink>,
    settings: ResearchSettings,
}

impl HypothesisEngine {
    /// Create an engine that reports progress through `tracing`
    pub fn new(
        evidence: Arc<dyn EvidenceProvider>,
        reasoner: Arc<dyn ReasoningProvider>,
        budget: Arc<BudgetGuard>,
        settings: ResearchSettings,
    ) -> Self {
        Self {
            evidence,
            reasoner,
            budget,
            progress: Arc::new(TracingSink),
            settings,
        }
    }

    /// Report progress to `sink` instead
    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn settings(&self) -> &ResearchSettings {
        &self.settings
    }

    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    /// Create a session and its plan
    pub async fn start(&self, query: &str) -> Result<ReasoningContext, ResearchError> {
        self.open_session(query, None).await
    }

    /// Run one hop on an existing session
    ///
    /// Hypotheses come from the plan (first hop) or from the previous hop's
    /// gaps. If nothing is left to investigate the query itself is tested
    /// again.
    pub async fn run_hop(&self, context: &mut ReasoningContext) -> Result<HopResult, ResearchError> {
        let target = self.settings.confidence_target;
        let mut hypotheses = self.derive_hypotheses(context, target).await;
        if hypotheses.is_empty() {
            hypotheses = Plan::fallback(&context.query).hypotheses;
        }
        self.execute_hop(context, hypotheses).await
    }

    /// Run a whole session
    pub async fn run_to_completion(
        &self,
        query: &str,
        policy: &StopPolicy,
    ) -> Result<ReasoningContext, ResearchError> {
        self.run_cancellable(query, policy, &CancelFlag::new()).await
    }

    /// Run a whole session, stopping early if `cancel` is raised
    #[instrument(skip(self, policy, cancel), fields(max_hops = policy.max_hops))]
    pub async fn run_cancellable(
        &self,
        query: &str,
        policy: &StopPolicy,
        cancel: &CancelFlag,
    ) -> Result<ReasoningContext, ResearchError> {
        let mut context = self.open_session(query, policy.budget_usd).await?;
        let session = context.session_id;

        let reason = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if context.current_hop() >= policy.max_hops {
                break StopReason::MaxHops;
            }
            if self.budget.is_exhausted(session) {
                break StopReason::BudgetExhausted;
            }

            let hypotheses = self.derive_hypotheses(&context, policy.confidence_target).await;
            if hypotheses.is_empty() {
                break if self.budget.is_exhausted(session) {
                    StopReason::BudgetExhausted
                } else {
                    StopReason::NoOpenQuestions
                };
            }

            if let Err(e) = self.execute_hop(&mut context, hypotheses).await {
                self.budget.close_session(session);
                return Err(e);
            }

            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if self.budget.is_exhausted(session) {
                break StopReason::BudgetExhausted;
            }
            if should_stop(&context, policy.confidence_target, policy.early_stop_confidence) {
                break StopReason::ConfidenceReached;
            }
        };

        if reason == StopReason::Cancelled {
            self.emit(ProgressEvent::new(
                session,
                None,
                ProgressKind::SessionCancelled,
                format!("Session cancelled after {} hops", context.current_hop()),
            ))
            .await;
        }

        Ok(self.finish(context, reason).await)
    }

    async fn open_session(
        &self,
        query: &str,
        budget_usd: Option<f64>,
    ) -> Result<ReasoningContext, ResearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResearchError::EmptyQuery);
        }

        let mut context = ReasoningContext::new(query, Plan::default());
        let session = context.session_id;
        if let Some(limit) = budget_usd {
            self.budget.set_session_limit(session, limit);
        }
        info!(%session, query, "Starting research session");

        let cost = self.settings.costs.reasoning_call_usd;
        let plan = match self
            .guarded(session, None, self.reasoner.name(), cost, || self.reasoner.plan(query))
            .await
        {
            Billed::Done(Reply::Parsed(plan)) if plan.is_usable() => Some(plan),
            Billed::Done(Reply::Parsed(_)) => {
                warn!(%session, "Plan named no topics or hypotheses");
                None
            }
            Billed::Done(Reply::Malformed(raw)) => {
                warn!(%session, raw_len = raw.len(), "Malformed plan output");
                None
            }
            Billed::Done(Reply::Failed(e)) => {
                warn!(%session, error = %e, "Planning failed");
                None
            }
            Billed::Denied => {
                warn!(%session, "No budget left for planning");
                None
            }
        };

        match plan {
            Some(plan) => context.plan = normalize_plan(plan, query),
            None => {
                info!(%session, "Using single-hypothesis fallback plan");
                context.plan = Plan::fallback(query);
                context.plan_is_fallback = true;
            }
        }

        self.emit(ProgressEvent::new(session, None, ProgressKind::SessionStarted, query))
            .await;
        Ok(context)
    }

    /// Hypotheses for the next hop. Empty when nothing is left to do or the
    /// budget refused the calls needed to find out.
    async fn derive_hypotheses(&self, context: &ReasoningContext, target: f64) -> Vec<Hypothesis> {
        let limit = self.settings.max_hypotheses_per_hop;
        let session = context.session_id;
        let hop = Some(context.next_hop_number());

        let Some(last) = context.last_hop() else {
            let mut hypotheses: Vec<Hypothesis> = context
                .plan
                .hypotheses
                .iter()
                .filter(|h| !h.statement.trim().is_empty())
                .take(limit)
                .cloned()
                .collect();

            let uncovered: Vec<&String> = context
                .plan
                .topics
                .iter()
                .filter(|t| !hypotheses.iter().any(|h| &h.topic == *t))
                .collect();
            for topic in uncovered {
                if hypotheses.len() >= limit {
                    break;
                }
                let room = limit - hypotheses.len();
                hypotheses.extend(self.generate_for(session, hop, topic, topic, room).await);
            }
            return hypotheses;
        };

        let mut questions: Vec<(String, String)> = Vec::new();
        for gap in &last.synthesis.remaining_gaps {
            let gap = gap.trim();
            if gap.is_empty() || gap == NO_EVIDENCE_GAP || questions.iter().any(|(_, q)| q == gap) {
                continue;
            }
            questions.push((topic_for_gap(last, gap), gap.to_string()));
        }
        if questions.is_empty() {
            questions = topics_below(context, target)
                .into_iter()
                .map(|topic| (topic.clone(), topic))
                .collect();
        }
        if questions.is_empty() {
            return Vec::new();
        }

        let share = (limit / questions.len()).max(1);
        let mut hypotheses = Vec::new();
        for (topic, question) in &questions {
            if hypotheses.len() >= limit {
                break;
            }
            let room = share.min(limit - hypotheses.len());
            let refines = last
                .results
                .iter()
                .find(|r| &r.statement == question)
                .map(|r| r.hypothesis_id);

            for mut hypothesis in self.generate_for(session, hop, topic, question, room).await {
                if hypothesis.refines.is_none() {
                    hypothesis.refines = refines;
                }
                hypotheses.push(hypothesis);
            }
        }
        hypotheses
    }

    /// Ask the reasoner for hypotheses about `question`, filed under `topic`
    async fn generate_for(
        &self,
        session: Uuid,
        hop: Option<u32>,
        topic: &str,
        question: &str,
        take: usize,
    ) -> Vec<Hypothesis> {
        let cost = self.settings.costs.reasoning_call_usd;
        let reply = self
            .guarded(session, hop, self.reasoner.name(), cost, || {
                self.reasoner.generate_hypotheses(question)
            })
            .await;

        let generated = match reply {
            Billed::Done(Reply::Parsed(list)) => list,
            Billed::Done(Reply::Malformed(raw)) => {
                warn!(%session, question, raw_len = raw.len(), "Malformed hypotheses output");
                Vec::new()
            }
            Billed::Done(Reply::Failed(e)) => {
                warn!(%session, question, error = %e, "Hypothesis generation failed");
                Vec::new()
            }
            Billed::Denied => return Vec::new(),
        };

        let generated: Vec<Hypothesis> = generated
            .into_iter()
            .filter(|h| !h.statement.trim().is_empty())
            .take(take)
            .map(|h| Hypothesis {
                topic: topic.to_string(),
                ..h
            })
            .collect();

        if generated.is_empty() {
            vec![Hypothesis::new(topic, question)]
        } else {
            generated
        }
    }

    /// Run a hop over the given hypotheses and append it to the session
    #[instrument(skip(self, context, hypotheses), fields(session = %context.session_id, hop = context.next_hop_number()))]
    async fn execute_hop(
        &self,
        context: &mut ReasoningContext,
        hypotheses: Vec<Hypothesis>,
    ) -> Result<HopResult, ResearchError> {
        let session = context.session_id;
        let hop_number = context.next_hop_number();
        let started_at = Utc::now();

        self.emit(ProgressEvent::new(
            session,
            Some(hop_number),
            ProgressKind::HopStarted,
            format!("Hop {} testing {} hypotheses", hop_number, hypotheses.len()),
        ))
        .await;

        let investigations = join_all(
            hypotheses
                .iter()
                .map(|h| self.investigate(session, hop_number, h)),
        )
        .await;

        let mut partial = false;
        let mut evidence: Vec<Evidence> = Vec::new();
        let mut results = Vec::with_capacity(investigations.len());
        for investigation in investigations {
            partial |= investigation.budget_denied;
            for item in investigation.evidence {
                if !evidence.iter().any(|e| e.source == item.source) {
                    evidence.push(item);
                }
            }
            results.push(investigation.result);
        }

        let synthesis = if evidence.is_empty() {
            Synthesis::no_evidence()
        } else {
            let (synthesis, denied) = self.synthesize_hop(session, hop_number, &results).await;
            partial |= denied;
            synthesis
        };

        let mut topics: Vec<String> = Vec::new();
        for hypothesis in &hypotheses {
            if !topics.contains(&hypothesis.topic) {
                topics.push(hypothesis.topic.clone());
            }
        }

        let hop = HopResult {
            hop_number,
            topics,
            hypotheses,
            evidence,
            results,
            synthesis,
            partial,
            started_at,
            completed_at: Utc::now(),
        };
        context.append_hop(hop.clone())?;

        let confidence = session_confidence(context.hops());
        let spent = self.budget.snapshot(session).committed_usd;
        info!(
            hop = hop_number,
            hop_confidence = hop.synthesis.confidence,
            session_confidence = confidence,
            evidence = hop.evidence.len(),
            partial,
            "Hop completed"
        );
        self.emit(
            ProgressEvent::new(
                session,
                Some(hop_number),
                ProgressKind::HopSynthesized,
                format!(
                    "Hop {} synthesized {} findings from {} sources",
                    hop_number,
                    hop.synthesis.key_findings.len(),
                    hop.evidence.len()
                ),
            )
            .with_confidence(confidence)
            .with_cost(spent),
        )
        .await;

        Ok(hop)
    }

    /// Gather evidence for one hypothesis and test it
    async fn investigate(&self, session: Uuid, hop: u32, hypothesis: &Hypothesis) -> Investigation {
        let max = self.settings.max_evidence_per_hypothesis;
        let query = hypothesis.search_query();

        let evidence: Vec<Evidence> = match self
            .guarded(
                session,
                Some(hop),
                self.evidence.name(),
                self.settings.costs.search_call_usd,
                || self.search_once(&query, max),
            )
            .await
        {
            Billed::Done(Reply::Parsed(items)) => items.into_iter().take(max).collect(),
            Billed::Done(Reply::Malformed(raw)) => {
                warn!(%session, hop, raw_len = raw.len(), "Malformed search output");
                Vec::new()
            }
            Billed::Done(Reply::Failed(e)) => {
                warn!(%session, hop, hypothesis = %hypothesis.statement, error = %e, "Evidence search failed");
                Vec::new()
            }
            Billed::Denied => {
                return Investigation {
                    evidence: Vec::new(),
                    result: HypothesisResult::without_evidence(hypothesis),
                    budget_denied: true,
                };
            }
        };

        self.emit(ProgressEvent::new(
            session,
            Some(hop),
            ProgressKind::EvidenceGathered,
            format!("{} evidence items for: {}", evidence.len(), hypothesis.statement),
        ))
        .await;

        if evidence.is_empty() {
            return Investigation {
                evidence,
                result: HypothesisResult::without_evidence(hypothesis),
                budget_denied: false,
            };
        }

        let mut budget_denied = false;
        let result = match self
            .guarded(
                session,
                Some(hop),
                self.reasoner.name(),
                self.settings.costs.reasoning_call_usd,
                || self.reasoner.test_hypothesis(hypothesis, &evidence),
            )
            .await
        {
            Billed::Done(Reply::Parsed(result)) => HypothesisResult {
                hypothesis_id: hypothesis.id,
                topic: hypothesis.topic.clone(),
                statement: hypothesis.statement.clone(),
                prior_confidence: hypothesis.prior_confidence,
                posterior_confidence: clamp_unit(result.posterior_confidence),
                ..result
            },
            Billed::Done(Reply::Malformed(raw)) => {
                warn!(%session, hop, raw_len = raw.len(), "Malformed hypothesis test output");
                HypothesisResult::inconclusive(hypothesis)
            }
            Billed::Done(Reply::Failed(e)) => {
                warn!(%session, hop, error = %e, "Hypothesis test failed");
                HypothesisResult::inconclusive(hypothesis)
            }
            Billed::Denied => {
                budget_denied = true;
                HypothesisResult::inconclusive(hypothesis)
            }
        };

        self.emit(
            ProgressEvent::new(
                session,
                Some(hop),
                ProgressKind::HypothesisTested,
                format!("{}: {}", result.verdict, hypothesis.statement),
            )
            .with_confidence(result.posterior_confidence),
        )
        .await;

        Investigation {
            evidence,
            result,
            budget_denied,
        }
    }

    /// Synthesize a hop, falling back to a local synthesis. Returns whether
    /// the budget refused the call.
    async fn synthesize_hop(
        &self,
        session: Uuid,
        hop: u32,
        results: &[HypothesisResult],
    ) -> (Synthesis, bool) {
        let local = || Synthesis::from_results(results, hop_confidence(results));

        match self
            .guarded(
                session,
                Some(hop),
                self.reasoner.name(),
                self.settings.costs.reasoning_call_usd,
                || self.reasoner.synthesize(results),
            )
            .await
        {
            Billed::Done(Reply::Parsed(synthesis)) => (
                Synthesis {
                    confidence: clamp_unit(synthesis.confidence),
                    ..synthesis
                },
                false,
            ),
            Billed::Done(Reply::Malformed(raw)) => {
                warn!(%session, hop, raw_len = raw.len(), "Malformed synthesis output, synthesizing locally");
                (local(), false)
            }
            Billed::Done(Reply::Failed(e)) => {
                warn!(%session, hop, error = %e, "Synthesis failed, synthesizing locally");
                (local(), false)
            }
            Billed::Denied => (local(), true),
        }
    }

    /// Close the session: consolidate hop syntheses and report completion
    async fn finish(&self, mut context: ReasoningContext, reason: StopReason) -> ReasoningContext {
        let session = context.session_id;
        let confidence = session_confidence(context.hops());
        let synthesis = Synthesis::consolidate(context.hops().iter().map(|h| &h.synthesis), confidence);
        let spent = self.budget.close_session(session).committed_usd;

        info!(
            %session,
            hops = context.current_hop(),
            confidence = synthesis.confidence,
            cost_usd = spent,
            stop_reason = %reason,
            "Research session complete"
        );
        self.emit(
            ProgressEvent::new(
                session,
                None,
                ProgressKind::SessionComplete,
                format!("Stopped after {} hops: {}", context.current_hop(), reason),
            )
            .with_confidence(synthesis.confidence)
            .with_cost(spent)
            .with_stop_reason(reason),
        )
        .await;

        context.final_synthesis = Some(synthesis);
        context.stop_reason = Some(reason);
        context.cost_usd = spent;
        context
    }

    async fn search_once(&self, query: &str, max_results: usize) -> Reply<Vec<Evidence>> {
        match self.evidence.search(query, max_results).await {
            Ok(items) => Reply::Parsed(items),
            Err(e) => Reply::Failed(e),
        }
    }

    /// Make a provider call under the budget, the call timeout and the retry
    /// policy
    ///
    /// Each attempt reserves `cost`. Attempts that reached the provider are
    /// charged; calls that could not reach it are released.
    async fn guarded<T, F, Fut>(
        &self,
        session: Uuid,
        hop: Option<u32>,
        provider: &str,
        cost: f64,
        call: F,
    ) -> Billed<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Reply<T>>,
    {
        let policy = &self.settings.retry_policy;
        let call_timeout = self.settings.call_timeout();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if !self.budget.reserve(session, cost) {
                return Billed::Denied;
            }

            let reply = match timeout(call_timeout, call()).await {
                Ok(reply) => reply,
                Err(_) => Reply::Failed(ProviderError::Timeout {
                    provider: provider.to_string(),
                    timeout: call_timeout,
                }),
            };

            match &reply {
                Reply::Failed(ProviderError::Unavailable { .. }) => self.budget.release(session, cost),
                _ => self.budget.commit(session, cost, cost),
            }
            self.check_budget_warning(session, hop).await;

            if let Reply::Failed(e) = &reply {
                if e.is_transient() && policy.should_retry(attempt) {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        provider,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Provider call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            debug!(provider, attempt, "Provider call finished");
            return Billed::Done(reply);
        }
    }

    async fn check_budget_warning(&self, session: Uuid, hop: Option<u32>) {
        if let Some(snapshot) = self.budget.take_warning(session) {
            self.emit(
                ProgressEvent::new(
                    session,
                    hop,
                    ProgressKind::BudgetWarning,
                    format!(
                        "Budget {:.0}% spent (${:.4} of ${:.4})",
                        snapshot.used_fraction() * 100.0,
                        snapshot.committed_usd,
                        snapshot.limit_usd
                    ),
                )
                .with_cost(snapshot.committed_usd),
            )
            .await;
        }
    }

    async fn emit(&self, event: ProgressEvent) {
        self.progress.emit(&event).await;
    }
}

/// Trim a provider plan and give every hypothesis a topic the plan lists
fn normalize_plan(plan: Plan, query: &str) -> Plan {
    let mut topics: Vec<String> = Vec::new();
    for topic in plan.topics.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
        if !topics.iter().any(|t| t == topic) {
            topics.push(topic.to_string());
        }
    }

    let default_topic = topics.first().cloned().unwrap_or_else(|| query.to_string());
    let hypotheses: Vec<Hypothesis> = plan
        .hypotheses
        .into_iter()
        .filter(|h| !h.statement.trim().is_empty())
        .map(|h| {
            let topic = match h.topic.trim() {
                "" => default_topic.clone(),
                topic => topic.to_string(),
            };
            Hypothesis { topic, ..h }
        })
        .collect();

    for hypothesis in &hypotheses {
        if !topics.contains(&hypothesis.topic) {
            topics.push(hypothesis.topic.clone());
        }
    }

    Plan {
        topics,
        hypotheses,
        ..plan
    }
}

/// Topic an open question from `hop` belongs to
fn topic_for_gap(hop: &HopResult, gap: &str) -> String {
    if let [only] = hop.topics.as_slice() {
        return only.clone();
    }
    hop.results
        .iter()
        .find(|r| r.statement == gap)
        .map(|r| r.topic.clone())
        .unwrap_or_else(|| gap.to_string())
}
