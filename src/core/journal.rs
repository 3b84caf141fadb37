//! Append-only session journal with file-based persistence.
//!
//! Progress events are stored per session as newline-delimited JSON under
//! `<sessions_dir>/<session_id>/events.jsonl`, so a session's status can be
//! reconstructed after the process exits.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;
use uuid::Uuid;

use super::progress::ProgressSink;
use crate::domain::{ProgressEvent, SessionStatus};

/// File-based journal of session progress events
#[derive(Debug, Clone)]
pub struct SessionJournal {
    /// Directory holding one subdirectory per session
    base_dir: PathBuf,
}

impl SessionJournal {
    /// Open a journal rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Base directory of the journal
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path to a session's events file
    pub fn events_path(&self, session_id: Uuid) -> PathBuf {
        self.base_dir.join(session_id.to_string()).join("events.jsonl")
    }

    /// Append an event to its session's log
    pub async fn append(&self, event: &ProgressEvent) -> Result<()> {
        let events_path = self.events_path(event.session_id);
        if let Some(dir) = events_path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create session directory: {}", dir.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay a session's events in order
    pub async fn replay(&self, session_id: Uuid) -> Result<Vec<ProgressEvent>> {
        let events_path = self.events_path(session_id);
        if !events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: ProgressEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Reconstruct a session's status from its journal
    pub async fn status(&self, session_id: Uuid) -> Result<Option<SessionStatus>> {
        let events = self.replay(session_id).await?;
        Ok(SessionStatus::from_events(&events))
    }

    /// List all session ids in the journal
    pub async fn list_sessions(&self) -> Result<Vec<Uuid>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut sessions = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        sessions.push(uuid);
                    }
                }
            }
        }

        Ok(sessions)
    }
}

#[async_trait]
impl ProgressSink for SessionJournal {
    async fn emit(&self, event: &ProgressEvent) {
        if let Err(e) = self.append(event).await {
            warn!(session_id = %event.session_id, error = %e, "Failed to journal progress event");
        }
    }
}
