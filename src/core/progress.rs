//! Progress sinks.
//!
//! The engine reports through a `ProgressSink` and never waits on consumers:
//! sinks must not block, and a failing sink only logs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{ProgressEvent, ProgressKind};

/// Receiver of progress events
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Deliver one event
    async fn emit(&self, event: &ProgressEvent);
}

/// Sink that logs events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl ProgressSink for TracingSink {
    async fn emit(&self, event: &ProgressEvent) {
        match event.kind {
            ProgressKind::BudgetWarning => warn!(
                session_id = %event.session_id,
                cost_usd = ?event.cost_usd,
                "{}",
                event.summary
            ),
            ProgressKind::SessionStarted
            | ProgressKind::HopSynthesized
            | ProgressKind::SessionCancelled
            | ProgressKind::SessionComplete => info!(
                session_id = %event.session_id,
                hop = ?event.hop,
                confidence = ?event.confidence,
                "{}",
                event.summary
            ),
            ProgressKind::HopStarted
            | ProgressKind::EvidenceGathered
            | ProgressKind::HypothesisTested => debug!(
                session_id = %event.session_id,
                hop = ?event.hop,
                "{}",
                event.summary
            ),
        }
    }
}

/// Sink that forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver its events arrive on
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressSink for ChannelSink {
    async fn emit(&self, event: &ProgressEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(event_id = %event.id, "Progress receiver dropped");
        }
    }
}

/// Sink that delivers every event to several sinks in order
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink
    pub fn with(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait]
impl ProgressSink for FanoutSink {
    async fn emit(&self, event: &ProgressEvent) {
        for sink in &self.sinks {
            sink.emit(event).await;
        }
    }
}
