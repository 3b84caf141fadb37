//! Research workflow: session -> deduplication -> merge -> persist.
//!
//! `research` runs a session and decides what to do with its findings.
//! `save` carries that decision out. The two are separate so that a failed
//! save can be retried without re-running the session.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::engine::{CancelFlag, HypothesisEngine, ResearchError, StopPolicy};
use crate::dedup::{DedupAction, DeduplicationEngine, DeduplicationResult};
use crate::domain::{
    Artifact, ArtifactId, ArtifactMetadata, NewContent, ReasoningContext, StopReason, Synthesis,
    NO_EVIDENCE_GAP,
};
use crate::index::{EntryMetadata, SimilarityIndex};
use crate::merge::{MergeConflict, MergeEngine, MergeStrategy, StructuralDiff};

/// Document store failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Artifact not found: {0}")]
    NotFound(ArtifactId),

    #[error("Artifact already exists: {0}")]
    AlreadyExists(ArtifactId),

    #[error("Store I/O error: {0}")]
    Io(String),

    #[error("Store serialization error: {0}")]
    Serialization(String),
}

/// How an artifact came to be written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistOperation {
    Create,
    Update,
    Merge,
}

impl std::fmt::Display for PersistOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PersistOperation::Create => "create",
            PersistOperation::Update => "update",
            PersistOperation::Merge => "merge",
        };
        write!(f, "{}", s)
    }
}

/// Where artifacts live
///
/// Implemented outside the core; the core only hands over plain artifacts.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, id: &ArtifactId) -> Result<Artifact, StoreError>;

    async fn persist(&self, artifact: &Artifact, operation: PersistOperation) -> Result<(), StoreError>;
}

/// A finished session plus what should happen to its findings
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub context: ReasoningContext,

    /// Findings ready to be stored
    pub content: NewContent,

    pub decision: DeduplicationResult,

    /// Non-fatal issues
    pub warnings: Vec<String>,

    /// False if the session stopped because the budget ran out
    pub within_budget: bool,
}

impl ResearchOutcome {
    /// Overall confidence of the session
    pub fn confidence(&self) -> f64 {
        self.content.confidence
    }
}

/// Result of saving an outcome
#[derive(Debug, Clone)]
pub struct SaveReport {
    pub artifact_id: ArtifactId,
    pub operation: PersistOperation,
    pub conflicts: Vec<MergeConflict>,
    pub diff: StructuralDiff,
    pub warnings: Vec<String>,
}

/// Wires the engine to deduplication, merging and storage
pub struct ResearchWorkflow {
    engine: HypothesisEngine,
    dedup: DeduplicationEngine,
    merger: MergeEngine,
    index: Arc<dyn SimilarityIndex>,
    store: Arc<dyn DocumentStore>,
    policy: StopPolicy,
}

impl ResearchWorkflow {
    pub fn new(
        engine: HypothesisEngine,
        dedup: DeduplicationEngine,
        merger: MergeEngine,
        index: Arc<dyn SimilarityIndex>,
        store: Arc<dyn DocumentStore>,
        policy: StopPolicy,
    ) -> Self {
        Self {
            engine,
            dedup,
            merger,
            index,
            store,
            policy,
        }
    }

    pub fn engine(&self) -> &HypothesisEngine {
        &self.engine
    }

    pub fn policy(&self) -> &StopPolicy {
        &self.policy
    }

    /// Run a session and decide CREATE / UPDATE / MERGE for its findings
    ///
    /// Empty title or topics in `metadata` are filled from the session.
    #[instrument(skip(self, metadata, cancel))]
    pub async fn research(
        &self,
        query: &str,
        metadata: ArtifactMetadata,
        cancel: &CancelFlag,
    ) -> Result<ResearchOutcome, ResearchError> {
        let context = self.engine.run_cancellable(query, &self.policy, cancel).await?;

        let synthesis = context
            .final_synthesis
            .clone()
            .unwrap_or_else(Synthesis::no_evidence);
        let mut metadata = metadata;
        if metadata.title.trim().is_empty() {
            metadata.title = context.query.clone();
        }
        if metadata.topics.is_empty() {
            metadata.topics = context.topics_addressed();
        }

        let content =
            NewContent::from_synthesis(metadata, &context.query, &synthesis, context.evidence_count());
        let decision = self
            .dedup
            .decide(&content.body(), &content.metadata, &context.query)
            .await;

        let within_budget = context.stop_reason != Some(StopReason::BudgetExhausted);
        let warnings = self.session_warnings(&context, &synthesis, within_budget);
        for warning in &warnings {
            warn!(session = %context.session_id, "{}", warning);
        }

        Ok(ResearchOutcome {
            context,
            content,
            decision,
            warnings,
            within_budget,
        })
    }

    fn session_warnings(
        &self,
        context: &ReasoningContext,
        synthesis: &Synthesis,
        within_budget: bool,
    ) -> Vec<String> {
        let mut warnings = Vec::new();
        if context.plan_is_fallback {
            warnings.push("Planning failed; researched the raw query as a single hypothesis".to_string());
        }
        if !within_budget {
            warnings.push(format!(
                "Budget exhausted after {} hops; results may be incomplete",
                context.current_hop()
            ));
        }
        if synthesis.remaining_gaps.iter().any(|g| g == NO_EVIDENCE_GAP) && context.evidence_count() == 0 {
            warnings.push("No evidence was obtained for any hypothesis".to_string());
        }
        if synthesis.confidence < self.policy.confidence_target {
            warnings.push(format!(
                "Low confidence: {:.2} is below the target {:.2}",
                synthesis.confidence, self.policy.confidence_target
            ));
        }
        warnings
    }

    /// Carry out the deduplication decision and persist the artifact
    ///
    /// A missing UPDATE/MERGE target falls back to creating a new artifact.
    /// Index failures after a successful write are reported as warnings.
    #[instrument(skip(self, outcome), fields(action = %outcome.decision.action))]
    pub async fn save(&self, outcome: &ResearchOutcome) -> Result<SaveReport, ResearchError> {
        let mut warnings = Vec::new();

        let merge_into = match (outcome.decision.action, &outcome.decision.target) {
            (DedupAction::Update, Some(target)) => Some((target, MergeStrategy::Integrate, PersistOperation::Update)),
            (DedupAction::Merge, Some(target)) => Some((target, MergeStrategy::Append, PersistOperation::Merge)),
            _ => None,
        };

        let existing = match merge_into {
            Some((target, strategy, operation)) => match self.store.load(target).await {
                Ok(artifact) => Some((artifact, strategy, operation)),
                Err(StoreError::NotFound(id)) => {
                    warn!(artifact = %id, "Dedup target missing from store, creating instead");
                    warnings.push(format!("Target artifact {} not found; created a new artifact", id));
                    None
                }
                Err(e) => return Err(e.into()),
            },
            None => None,
        };

        let (artifact, operation, conflicts, diff) = match existing {
            Some((existing, strategy, operation)) => {
                let merged = self.merger.merge(&existing, &outcome.content, strategy).await;
                warnings.extend(merged.warnings);
                (merged.artifact, operation, merged.conflicts, merged.diff)
            }
            None => {
                let artifact = Artifact::from_content(&outcome.content);
                let diff = StructuralDiff {
                    sections_added: artifact.sections.len(),
                    statements_added: artifact.statements().count(),
                    ..Default::default()
                };
                (artifact, PersistOperation::Create, Vec::new(), diff)
            }
        };

        self.store.persist(&artifact, operation).await?;
        info!(artifact = %artifact.id, %operation, %diff, "Artifact persisted");

        let entry = EntryMetadata {
            title: artifact.metadata.title.clone(),
            topics: artifact.metadata.topics.clone(),
            questions: artifact.questions.clone(),
        };
        if let Err(e) = self
            .index
            .upsert(artifact.id.as_str(), &artifact.index_text(), entry)
            .await
        {
            warn!(artifact = %artifact.id, error = %e, "Failed to index artifact");
            warnings.push(format!("Artifact saved but not indexed: {}", e));
        }

        for conflict in conflicts.iter().filter(|c| c.is_unresolved()) {
            warnings.push(format!(
                "Unresolved {} conflict in '{}': {}",
                conflict.conflict_type, conflict.section, conflict.description
            ));
        }

        Ok(SaveReport {
            artifact_id: artifact.id,
            operation,
            conflicts,
            diff,
            warnings,
        })
    }
}
