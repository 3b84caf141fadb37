//! Adapter interfaces for external systems.
//!
//! Research sessions depend on two kinds of external collaborators: an
//! evidence provider (search) and a reasoning provider (LLM). Both are traits
//! so sessions can run against real services or scripted doubles.

pub mod fabric;
pub mod search;
pub mod wire;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Evidence, Hypothesis, HypothesisResult, Plan, Synthesis};

// Re-export the concrete adapters
pub use fabric::{FabricPatterns, FabricReasoner};
pub use search::HttpSearchProvider;

/// Failure of a single provider call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("{provider} unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("{provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

impl ProviderError {
    /// Build an `Unavailable` error
    pub fn unavailable(provider: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Unavailable {
            provider: provider.into(),
            message: message.to_string(),
        }
    }

    /// Whether retrying the same call might succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Outcome of a reasoning call
///
/// Malformed output is not an error: callers degrade to a conservative
/// default instead of aborting.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    /// Output parsed into the expected shape
    Parsed(T),

    /// The provider answered, but the answer was unusable
    Malformed(String),

    /// The call failed
    Failed(ProviderError),
}

impl<T> Reply<T> {
    /// The parsed value, if any
    pub fn parsed(self) -> Option<T> {
        match self {
            Reply::Parsed(value) => Some(value),
            Reply::Malformed(_) | Reply::Failed(_) => None,
        }
    }

    /// Transform the parsed value
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Reply<U> {
        match self {
            Reply::Parsed(value) => Reply::Parsed(f(value)),
            Reply::Malformed(raw) => Reply::Malformed(raw),
            Reply::Failed(e) => Reply::Failed(e),
        }
    }
}

impl<T> From<ProviderError> for Reply<T> {
    fn from(error: ProviderError) -> Self {
        Reply::Failed(error)
    }
}

/// Source of evidence for hypotheses
#[async_trait]
pub trait EvidenceProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Search for up to `max_results` evidence items
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<Evidence>, ProviderError>;
}

/// Structured reasoning (planning, hypothesis testing, synthesis)
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Build a research plan for a query
    async fn plan(&self, query: &str) -> Reply<Plan>;

    /// Generate hypotheses for a topic or open question
    async fn generate_hypotheses(&self, topic: &str) -> Reply<Vec<Hypothesis>>;

    /// Judge a hypothesis against evidence
    async fn test_hypothesis(
        &self,
        hypothesis: &Hypothesis,
        evidence: &[Evidence],
    ) -> Reply<HypothesisResult>;

    /// Synthesize the results of one hop
    async fn synthesize(&self, results: &[HypothesisResult]) -> Reply<Synthesis>;
}
