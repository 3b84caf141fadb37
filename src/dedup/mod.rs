//! Deduplication decisions for newly synthesized content.
//!
//! New content is compared against the similarity index and classified as
//! CREATE (new artifact), UPDATE (integrate into a near-duplicate) or MERGE
//! (append to a related artifact). The decision is deterministic for fixed
//! index contents, and an unavailable index never blocks creation.

pub mod scoring;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::{ArtifactId, ArtifactMetadata};
use crate::index::{IndexHit, SimilarityIndex};

pub use scoring::{dominant_signal, key_terms, question_overlap, topic_overlap, ScoreWeights, Signal};

/// What to do with new content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupAction {
    /// Store as a new artifact
    Create,

    /// Integrate into a near-duplicate artifact
    Update,

    /// Append to a related artifact
    Merge,
}

impl std::fmt::Display for DedupAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DedupAction::Create => "create",
            DedupAction::Update => "update",
            DedupAction::Merge => "merge",
        };
        write!(f, "{}", s)
    }
}

/// Score thresholds for UPDATE and MERGE
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionThresholds {
    /// Scores at or above this update the match (default: 0.85)
    #[serde(default = "default_update_threshold")]
    pub update: f64,

    /// Scores at or above this (and below `update`) merge into the match (default: 0.70)
    #[serde(default = "default_merge_threshold")]
    pub merge: f64,
}

fn default_update_threshold() -> f64 {
    0.85
}
fn default_merge_threshold() -> f64 {
    0.70
}

impl Default for DecisionThresholds {
    fn default() -> Self {
        Self {
            update: default_update_threshold(),
            merge: default_merge_threshold(),
        }
    }
}

/// Slack for weighted sums that land a rounding error below a threshold
const SCORE_EPSILON: f64 = 1e-9;

impl DecisionThresholds {
    /// Action for a best composite score
    pub fn classify(&self, score: f64) -> DedupAction {
        if score + SCORE_EPSILON >= self.update {
            DedupAction::Update
        } else if score + SCORE_EPSILON >= self.merge {
            DedupAction::Merge
        } else {
            DedupAction::Create
        }
    }
}

/// Deduplication settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupSettings {
    #[serde(default)]
    pub thresholds: DecisionThresholds,

    #[serde(default)]
    pub weights: ScoreWeights,

    /// Candidates fetched from the index (default: 5)
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,

    /// Characters of content used as the index query (default: 2000)
    #[serde(default = "default_content_prefix")]
    pub content_prefix_chars: usize,
}

fn default_candidate_limit() -> usize {
    5
}
fn default_content_prefix() -> usize {
    2000
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self {
            thresholds: DecisionThresholds::default(),
            weights: ScoreWeights::default(),
            candidate_limit: default_candidate_limit(),
            content_prefix_chars: default_content_prefix(),
        }
    }
}

impl DedupSettings {
    /// Validate thresholds and weights
    pub fn validate(&self) -> anyhow::Result<()> {
        let t = &self.thresholds;
        if !(0.0..=1.0).contains(&t.merge) || !(0.0..=1.0).contains(&t.update) || t.merge > t.update {
            anyhow::bail!(
                "dedup thresholds must satisfy 0 <= merge ({}) <= update ({}) <= 1",
                t.merge,
                t.update
            );
        }
        self.weights.validate()
    }
}

/// One scored candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityMatch {
    /// Candidate artifact
    pub artifact_id: ArtifactId,

    /// Candidate title
    pub title: String,

    /// Composite score in [0, 1]
    pub score: f64,

    pub topic_overlap: f64,
    pub content_similarity: f64,
    pub question_overlap: f64,

    /// Which signal dominated, in words
    pub reason: String,
}

/// Outcome of a deduplication decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationResult {
    pub action: DedupAction,

    /// Artifact to update or merge into. Present iff action is not CREATE.
    pub target: Option<ArtifactId>,

    /// Candidates, best first
    pub matches: Vec<SimilarityMatch>,

    /// Confidence in the decision, in [0, 1]
    pub confidence: f64,

    pub rationale: String,
}

impl DeduplicationResult {
    /// CREATE with full confidence, used when there is nothing to compare against
    fn create_fallback(rationale: impl Into<String>) -> Self {
        Self {
            action: DedupAction::Create,
            target: None,
            matches: Vec::new(),
            confidence: 1.0,
            rationale: rationale.into(),
        }
    }

    /// Best match, if any
    pub fn best_match(&self) -> Option<&SimilarityMatch> {
        self.matches.first()
    }
}

/// Decides CREATE / UPDATE / MERGE for new content
pub struct DeduplicationEngine {
    index: Arc<dyn SimilarityIndex>,
    settings: DedupSettings,
}

impl DeduplicationEngine {
    pub fn new(index: Arc<dyn SimilarityIndex>, settings: DedupSettings) -> Self {
        Self { index, settings }
    }

    pub fn settings(&self) -> &DedupSettings {
        &self.settings
    }

    /// Decide what to do with `content`
    pub async fn decide(
        &self,
        content: &str,
        metadata: &ArtifactMetadata,
        originating_query: &str,
    ) -> DeduplicationResult {
        let excerpt = scoring::prefix(content, self.settings.content_prefix_chars);

        let hits = match self.index.query(excerpt, self.settings.candidate_limit).await {
            Ok(hits) => hits,
            Err(e) => {
                warn!(error = %e, "Similarity index unavailable, defaulting to create");
                return DeduplicationResult::create_fallback(format!(
                    "Similarity index unavailable ({}); creating a new artifact",
                    e
                ));
            }
        };

        if hits.is_empty() {
            debug!("No indexed candidates");
            return DeduplicationResult::create_fallback(
                "No similar artifacts found; creating a new artifact",
            );
        }

        let mut matches: Vec<SimilarityMatch> = hits
            .into_iter()
            .map(|hit| self.score(hit, metadata, originating_query))
            .collect();

        // Stable: equal scores keep the index's recency order
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let best = &matches[0];
        let action = self.settings.thresholds.classify(best.score);
        let (target, confidence, verdict) = match action {
            DedupAction::Update => (
                Some(best.artifact_id.clone()),
                best.score,
                format!("at or above the update threshold {:.2}", self.settings.thresholds.update),
            ),
            DedupAction::Merge => (
                Some(best.artifact_id.clone()),
                best.score,
                format!("at or above the merge threshold {:.2}", self.settings.thresholds.merge),
            ),
            DedupAction::Create => (
                None,
                1.0 - best.score,
                format!("below the merge threshold {:.2}", self.settings.thresholds.merge),
            ),
        };

        let rationale = format!(
            "Best match '{}' ({}) scored {:.3}, {}; {} dominated",
            best.title, best.artifact_id, best.score, verdict, best.reason
        );
        info!(
            action = %action,
            best_score = best.score,
            candidates = matches.len(),
            "Deduplication decision"
        );

        DeduplicationResult {
            action,
            target,
            confidence: confidence.clamp(0.0, 1.0),
            rationale,
            matches,
        }
    }

    fn score(&self, hit: IndexHit, metadata: &ArtifactMetadata, query: &str) -> SimilarityMatch {
        let weights = &self.settings.weights;
        let topic = topic_overlap(&metadata.topics, &hit.metadata.topics);
        let content = hit.score.clamp(0.0, 1.0);
        let question = question_overlap(query, &hit.metadata.questions);
        let signal = dominant_signal(weights, topic, content, question);

        SimilarityMatch {
            artifact_id: ArtifactId::new(hit.id),
            title: hit.metadata.title,
            score: weights.composite(topic, content, question),
            topic_overlap: topic,
            content_similarity: content,
            question_overlap: question,
            reason: format!(
                "{} (topics {:.2}, content {:.2}, questions {:.2})",
                signal, topic, content, question
            ),
        }
    }
}
