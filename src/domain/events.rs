//! Progress events emitted by research sessions.
//!
//! Events are ordered per session and delivered at-least-once. Consumers that
//! care about duplicates de-duplicate by `id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::research::StopReason;

/// A single progress event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The session this event belongs to
    pub session_id: Uuid,

    /// Hop number (if applicable)
    pub hop: Option<u32>,

    /// Type of event
    pub kind: ProgressKind,

    /// Human-readable summary
    pub summary: String,

    /// Confidence at the time of the event (if meaningful)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// Cumulative committed cost in USD (if meaningful)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,

    /// Stop reason (session_complete only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

impl ProgressEvent {
    /// Create a new event with the current timestamp
    pub fn new(session_id: Uuid, hop: Option<u32>, kind: ProgressKind, summary: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            session_id,
            hop,
            kind,
            summary: summary.into(),
            confidence: None,
            cost_usd: None,
            stop_reason: None,
        }
    }

    /// Attach a confidence value
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Attach the cumulative cost
    pub fn with_cost(mut self, cost_usd: f64) -> Self {
        self.cost_usd = Some(cost_usd);
        self
    }

    /// Attach the stop reason
    pub fn with_stop_reason(mut self, reason: StopReason) -> Self {
        self.stop_reason = Some(reason);
        self
    }
}

/// Types of progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    /// A session was created and planned
    SessionStarted,

    /// A hop began
    HopStarted,

    /// Evidence for one hypothesis arrived (possibly empty)
    EvidenceGathered,

    /// One hypothesis was tested
    HypothesisTested,

    /// A hop's synthesis is available
    HopSynthesized,

    /// The session's budget is nearly or fully spent
    BudgetWarning,

    /// The caller cancelled the session
    SessionCancelled,

    /// The research loop ended
    SessionComplete,
}
