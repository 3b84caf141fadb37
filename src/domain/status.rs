//! Session status reconstructed from progress events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::{ProgressEvent, ProgressKind};
use super::research::StopReason;

/// Summary view of a research session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Session identifier
    pub session_id: Uuid,

    /// Research question (from the session_started summary)
    pub query: String,

    /// Current state
    pub state: SessionState,

    /// Number of hops whose synthesis was recorded
    pub hops_completed: u32,

    /// Latest reported confidence
    pub confidence: Option<f64>,

    /// Latest reported cumulative cost
    pub cost_usd: Option<f64>,

    /// Budget warnings seen
    pub budget_warnings: u32,

    /// When the session started
    pub started_at: DateTime<Utc>,

    /// When the session ended (if it has)
    pub completed_at: Option<DateTime<Utc>>,
}

impl SessionStatus {
    /// Reconstruct status from a sequence of events
    ///
    /// Duplicate deliveries (same event id) are applied once.
    pub fn from_events(events: &[ProgressEvent]) -> Option<Self> {
        let first = events.first()?;

        let mut status = Self {
            session_id: first.session_id,
            query: String::new(),
            state: SessionState::Running,
            hops_completed: 0,
            confidence: None,
            cost_usd: None,
            budget_warnings: 0,
            started_at: first.timestamp,
            completed_at: None,
        };

        let mut seen = std::collections::HashSet::new();
        for event in events {
            if seen.insert(event.id) {
                status.apply_event(event);
            }
        }

        Some(status)
    }

    /// Apply a single event
    pub fn apply_event(&mut self, event: &ProgressEvent) {
        if let Some(cost) = event.cost_usd {
            self.cost_usd = Some(cost);
        }

        match event.kind {
            ProgressKind::SessionStarted => {
                self.query = event.summary.clone();
                self.started_at = event.timestamp;
                self.state = SessionState::Running;
            }
            ProgressKind::HopSynthesized => {
                if let Some(hop) = event.hop {
                    self.hops_completed = self.hops_completed.max(hop);
                }
                if event.confidence.is_some() {
                    self.confidence = event.confidence;
                }
            }
            ProgressKind::BudgetWarning => {
                self.budget_warnings += 1;
            }
            ProgressKind::SessionCancelled => {
                self.state = SessionState::Cancelling;
            }
            ProgressKind::SessionComplete => {
                self.state = SessionState::Finished {
                    reason: event.stop_reason,
                };
                if event.confidence.is_some() {
                    self.confidence = event.confidence;
                }
                self.completed_at = Some(event.timestamp);
            }
            ProgressKind::HopStarted
            | ProgressKind::EvidenceGathered
            | ProgressKind::HypothesisTested => {}
        }
    }

    /// Check if the session is still in progress
    pub fn is_running(&self) -> bool {
        !matches!(self.state, SessionState::Finished { .. })
    }
}

/// State of a research session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum SessionState {
    /// Hops are still running
    Running,

    /// Cancelled, waiting for the in-flight hop to finish
    Cancelling,

    /// The loop ended
    Finished { reason: Option<StopReason> },
}
