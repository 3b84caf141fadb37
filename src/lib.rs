//! deepdive - Multi-hop research with semantic deduplication
//!
//! A research session iterates plan -> hypotheses -> evidence -> verdicts ->
//! synthesis over several hops until confidence is high enough, the hop limit
//! is reached, the budget runs out or the caller cancels. The findings are
//! then checked against previously stored artifacts and either stored as a
//! new artifact, integrated into a near-duplicate or appended to a related
//! one. Merges never drop content; conflicting statements are surfaced.
//!
//! # Modules
//!
//! - `adapters`: External providers (Fabric reasoning, HTTP search)
//! - `core`: Research loop, budget, confidence, progress, workflow
//! - `domain`: Data structures (Hypothesis, HopResult, Artifact, events)
//! - `index`: Embeddings and the similarity index
//! - `dedup`: CREATE / UPDATE / MERGE decisions
//! - `merge`: Append / integrate merges and conflict detection
//! - `store`: File-based artifact store
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Research a question and store the findings
//! deepdive research "Does intermittent fasting improve longevity?" --topic health
//!
//! # Check a session
//! deepdive status <session-id>
//!
//! # List stored artifacts
//! deepdive artifacts --search health
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod dedup;
pub mod domain;
pub mod index;
pub mod merge;
pub mod store;

// Re-export main types at crate root for convenience
pub use core::{HypothesisEngine, ResearchWorkflow};
pub use dedup::{DedupAction, DeduplicationEngine, DeduplicationResult};
pub use domain::{Artifact, ArtifactId, NewContent, ReasoningContext, StopReason};
pub use merge::{MergeEngine, MergeStrategy};
