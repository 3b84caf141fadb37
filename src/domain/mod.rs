//! Domain types for deepdive.
//!
//! This module contains the core data structures:
//! - Research: hypotheses, evidence, hops and the session aggregate
//! - Artifact: persisted knowledge documents and incoming content
//! - Events: progress events emitted while a session runs
//! - Status: session state reconstructed from events

pub mod artifact;
pub mod events;
pub mod research;
pub mod status;

// Re-export commonly used types
pub use artifact::{Artifact, ArtifactId, ArtifactMetadata, Finding, NewContent, Section};
pub use events::{ProgressEvent, ProgressKind};
pub use research::{
    clamp_unit, Evidence, HopOrderError, HopResult, Hypothesis, HypothesisResult, Plan,
    ReasoningContext, StopReason, Synthesis, TestMethod, INCONCLUSIVE_VERDICT, NO_EVIDENCE_GAP,
};
pub use status::{SessionState, SessionStatus};
