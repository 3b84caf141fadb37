//! Core research logic.
//!
//! This module contains:
//! - Settings: research loop, cost and retry settings
//! - Budget: per-session and global cost ceilings
//! - Confidence: pure hop and session confidence aggregation
//! - Progress / Journal: progress sinks and the per-session event log
//! - Engine: the multi-hop research loop
//! - Workflow: session -> deduplication -> merge -> persist

pub mod budget;
pub mod confidence;
pub mod engine;
pub mod journal;
pub mod progress;
pub mod settings;
pub mod workflow;

// Re-export commonly used types
pub use budget::{BudgetExceeded, BudgetGuard, BudgetLimits, BudgetSnapshot};
pub use confidence::{hop_confidence, session_confidence, should_stop, topic_confidences, topics_below};
pub use engine::{CancelFlag, HypothesisEngine, ResearchError, StopPolicy};
pub use journal::SessionJournal;
pub use progress::{ChannelSink, FanoutSink, ProgressSink, TracingSink};
pub use settings::{CostModel, ResearchSettings, RetryPolicy};
pub use workflow::{
    DocumentStore, PersistOperation, ResearchOutcome, ResearchWorkflow, SaveReport, StoreError,
};
