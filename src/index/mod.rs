//! Similarity index over stored content.
//!
//! The index keeps one embedding per artifact id together with the small
//! amount of metadata deduplication needs. It never holds artifact content:
//! the document store is the source of truth for that.

pub mod embedding;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

pub use embedding::{cosine_similarity, similarity_score, Embedder, OllamaEmbedder};

/// Index failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum IndexError {
    /// The embedding backend could not be reached or answered garbage
    #[error("Similarity index unavailable: {message}")]
    Unavailable { message: String },

    /// An embedding with a different dimension than the indexed ones
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl IndexError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }
}

/// Metadata stored alongside an embedding
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Title of the indexed item
    pub title: String,

    /// Topic tags
    #[serde(default)]
    pub topics: Vec<String>,

    /// Originating research questions
    #[serde(default)]
    pub questions: Vec<String>,
}

/// One nearest-neighbour result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    /// Indexed item id
    pub id: String,

    /// Similarity in [0, 1]
    pub score: f64,

    /// Metadata stored with the item
    pub metadata: EntryMetadata,
}

/// Vector similarity index
#[async_trait]
pub trait SimilarityIndex: Send + Sync {
    /// Embed `text` and store it under `id`, replacing any previous entry
    async fn upsert(&self, id: &str, text: &str, metadata: EntryMetadata) -> Result<(), IndexError>;

    /// Remove an entry. Returns whether it existed.
    async fn remove(&self, id: &str) -> Result<bool, IndexError>;

    /// Nearest neighbours of `text`, best first
    ///
    /// Ties are broken by most-recently-updated first. An empty index returns
    /// an empty list without consulting the embedder.
    async fn query(&self, text: &str, limit: usize) -> Result<Vec<IndexHit>, IndexError>;

    /// Number of indexed entries
    async fn len(&self) -> usize;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    vector: Vec<f32>,
    metadata: EntryMetadata,
    updated_seq: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: HashMap<String, Entry>,
}

/// In-process similarity index with brute-force search
///
/// Safe for concurrent use: entries sit behind an `RwLock` that is never held
/// across an await point.
pub struct MemoryIndex {
    embedder: Arc<dyn Embedder>,
    entries: RwLock<HashMap<String, Entry>>,
    clock: AtomicU64,
}

impl MemoryIndex {
    /// Create an empty index
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Load an index snapshot, or start empty if the file does not exist
    pub async fn load(embedder: Arc<dyn Embedder>, path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(embedder));
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read index snapshot: {}", path.display()))?;
        let snapshot: Snapshot =
            serde_json::from_str(&content).context("Failed to parse index snapshot JSON")?;

        let clock = snapshot
            .entries
            .values()
            .map(|e| e.updated_seq)
            .max()
            .unwrap_or(0);

        Ok(Self {
            embedder,
            entries: RwLock::new(snapshot.entries),
            clock: AtomicU64::new(clock),
        })
    }

    /// Save a snapshot of the index
    pub async fn save(&self, path: &Path) -> Result<()> {
        let snapshot = Snapshot {
            version: 1,
            entries: self.read_entries().clone(),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string(&snapshot)?;
        fs::write(path, content)
            .await
            .with_context(|| format!("Failed to write index snapshot: {}", path.display()))?;

        Ok(())
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SimilarityIndex for MemoryIndex {
    async fn upsert(&self, id: &str, text: &str, metadata: EntryMetadata) -> Result<(), IndexError> {
        let vector = self.embedder.embed(text).await?;

        let mut entries = self.write_entries();
        if let Some((_, other)) = entries
            .iter()
            .find(|(key, e)| key.as_str() != id && e.vector.len() != vector.len())
        {
            return Err(IndexError::DimensionMismatch {
                expected: other.vector.len(),
                actual: vector.len(),
            });
        }

        let updated_seq = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        entries.insert(
            id.to_string(),
            Entry {
                vector,
                metadata,
                updated_seq,
            },
        );
        debug!(id, updated_seq, "Index entry upserted");
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<bool, IndexError> {
        Ok(self.write_entries().remove(id).is_some())
    }

    async fn query(&self, text: &str, limit: usize) -> Result<Vec<IndexHit>, IndexError> {
        if limit == 0 || self.read_entries().is_empty() {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed(text).await?;

        let entries = self.read_entries();
        // Upserts keep every stored vector at one dimension
        if let Some(entry) = entries.values().find(|e| e.vector.len() != query.len()) {
            return Err(IndexError::DimensionMismatch {
                expected: entry.vector.len(),
                actual: query.len(),
            });
        }
        let mut scored: Vec<(f64, u64, &String, &Entry)> = entries
            .iter()
            .map(|(id, entry)| (similarity_score(&query, &entry.vector), entry.updated_seq, id, entry))
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.1.cmp(&a.1))
        });

        Ok(scored
            .into_iter()
            .take(limit)
            .map(|(score, _, id, entry)| IndexHit {
                id: id.clone(),
                score,
                metadata: entry.metadata.clone(),
            })
            .collect())
    }

    async fn len(&self) -> usize {
        self.read_entries().len()
    }
}
