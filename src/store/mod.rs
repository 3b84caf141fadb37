//! File-based document store.
//!
//! Layout under the store root:
//! - `<id>.json`: the artifact itself (source of truth)
//! - `<id>.md`: rendered markdown, rewritten on every persist
//! - `catalog.json`: small listing of every stored artifact

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::core::{DocumentStore, PersistOperation, StoreError};
use crate::domain::{Artifact, ArtifactId};

/// Listing of stored artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    /// Catalog format version
    pub version: u32,

    pub items: Vec<CatalogItem>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            version: 1,
            items: Vec::new(),
        }
    }
}

impl Catalog {
    /// Insert or replace the entry for an artifact
    pub fn add(&mut self, item: CatalogItem) {
        if let Some(existing) = self.items.iter_mut().find(|i| i.id == item.id) {
            *existing = item;
        } else {
            self.items.push(item);
        }
    }

    pub fn get(&self, id: &ArtifactId) -> Option<&CatalogItem> {
        self.items.iter().find(|i| &i.id == id)
    }

    /// Case-insensitive substring search over titles and topics
    pub fn search(&self, query: &str) -> Vec<&CatalogItem> {
        let query_lower = query.to_lowercase();

        self.items
            .iter()
            .filter(|item| {
                item.title.to_lowercase().contains(&query_lower)
                    || item.topics.iter().any(|t| t.to_lowercase().contains(&query_lower))
            })
            .collect()
    }

    /// Items sorted by last update (most recent first)
    pub fn list(&self, limit: Option<usize>) -> Vec<&CatalogItem> {
        let mut items: Vec<_> = self.items.iter().collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

        if let Some(limit) = limit {
            items.truncate(limit);
        }

        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: ArtifactId,
    pub title: String,

    #[serde(default)]
    pub topics: Vec<String>,

    pub confidence: f64,
    pub revision: u32,
    pub last_operation: PersistOperation,
    pub updated_at: DateTime<Utc>,
}

impl CatalogItem {
    fn of(artifact: &Artifact, operation: PersistOperation) -> Self {
        Self {
            id: artifact.id.clone(),
            title: artifact.metadata.title.clone(),
            topics: artifact.metadata.topics.clone(),
            confidence: artifact.confidence,
            revision: artifact.revision,
            last_operation: operation,
            updated_at: artifact.updated_at,
        }
    }
}

/// Artifacts stored as JSON files in one directory
pub struct FileDocumentStore {
    root: PathBuf,

    /// Serializes catalog read-modify-write cycles
    catalog_lock: Mutex<()>,
}

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            catalog_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }

    pub fn markdown_path(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(format!("{}.md", id))
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.root.join("catalog.json")
    }

    /// Load the catalog, empty if none has been written yet
    pub async fn catalog(&self) -> Result<Catalog, StoreError> {
        let path = self.catalog_path();
        if !fs::try_exists(&path).await.map_err(|e| io_error(&path, e))? {
            return Ok(Catalog::default());
        }

        let content = fs::read_to_string(&path).await.map_err(|e| io_error(&path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e)))
    }

    async fn save_catalog(&self, catalog: &Catalog) -> Result<(), StoreError> {
        let content = serde_json::to_string_pretty(catalog)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.catalog_path(), &content).await
    }

    pub async fn exists(&self, id: &ArtifactId) -> Result<bool, StoreError> {
        let path = self.artifact_path(id);
        fs::try_exists(&path).await.map_err(|e| io_error(&path, e))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn load(&self, id: &ArtifactId) -> Result<Artifact, StoreError> {
        let path = self.artifact_path(id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(io_error(&path, e)),
        };

        serde_json::from_str(&content)
            .map_err(|e| StoreError::Serialization(format!("{}: {}", path.display(), e)))
    }

    async fn persist(&self, artifact: &Artifact, operation: PersistOperation) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root, e))?;

        let exists = self.exists(&artifact.id).await?;
        match operation {
            PersistOperation::Create if exists => {
                return Err(StoreError::AlreadyExists(artifact.id.clone()));
            }
            PersistOperation::Update | PersistOperation::Merge if !exists => {
                return Err(StoreError::NotFound(artifact.id.clone()));
            }
            _ => {}
        }

        let json = serde_json::to_string_pretty(artifact)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        write_atomic(&self.artifact_path(&artifact.id), &json).await?;
        write_atomic(&self.markdown_path(&artifact.id), &artifact.to_markdown()).await?;

        let _guard = self.catalog_lock.lock().await;
        let mut catalog = self.catalog().await?;
        catalog.add(CatalogItem::of(artifact, operation));
        self.save_catalog(&catalog).await?;

        debug!(artifact = %artifact.id, %operation, "Artifact written");
        Ok(())
    }
}

/// Write via a temporary file and rename, so readers never see half a file
async fn write_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, content).await.map_err(|e| io_error(&tmp, e))?;
    fs::rename(&tmp, path).await.map_err(|e| io_error(path, e))
}

fn io_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Io(format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactMetadata, Finding, NewContent};
    use tempfile::TempDir;

    fn artifact(title: &str) -> Artifact {
        Artifact::from_content(&NewContent {
            metadata: ArtifactMetadata {
                title: title.to_string(),
                topics: vec!["energy".to_string()],
                purpose: String::new(),
            },
            question: None,
            findings: vec![Finding::new("Solar output peaks at noon.")],
            confidence: 0.6,
            source_count: 2,
        })
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let temp = TempDir::new().unwrap();
        let store = FileDocumentStore::new(temp.path().join("artifacts"));
        let artifact = artifact("Solar");

        store.persist(&artifact, PersistOperation::Create).await.unwrap();

        let loaded = store.load(&artifact.id).await.unwrap();
        assert_eq!(loaded, artifact);
        assert!(store.markdown_path(&artifact.id).exists());

        let catalog = store.catalog().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(&artifact.id).unwrap().last_operation, PersistOperation::Create);
    }

    #[tokio::test]
    async fn test_operation_preconditions() {
        let temp = TempDir::new().unwrap();
        let store = FileDocumentStore::new(temp.path());
        let artifact = artifact("Solar");

        let err = store.persist(&artifact, PersistOperation::Update).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound(artifact.id.clone()));

        store.persist(&artifact, PersistOperation::Create).await.unwrap();
        let err = store.persist(&artifact, PersistOperation::Create).await.unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(artifact.id.clone()));

        let mut updated = artifact.clone();
        updated.revision += 1;
        store.persist(&updated, PersistOperation::Merge).await.unwrap();

        let catalog = store.catalog().await.unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.items[0].revision, 1);
        assert_eq!(catalog.items[0].last_operation, PersistOperation::Merge);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let store = FileDocumentStore::new(temp.path());
        let id = ArtifactId::new("missing");

        assert_eq!(store.load(&id).await.unwrap_err(), StoreError::NotFound(id));
        assert!(store.catalog().await.unwrap().is_empty());
    }

    #[test]
    fn test_catalog_search() {
        let mut catalog = Catalog::default();
        catalog.add(CatalogItem::of(&artifact("Solar storage"), PersistOperation::Create));
        catalog.add(CatalogItem::of(&artifact("Wind"), PersistOperation::Create));

        assert_eq!(catalog.search("solar").len(), 1);
        assert_eq!(catalog.search("ENERGY").len(), 2);
        assert_eq!(catalog.list(Some(1)).len(), 1);
    }
}
