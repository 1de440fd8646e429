//! Persisted state documents
//!
//! Every persisted concern (credentials, session registry, each log) is one
//! small JSON document that is read and rewritten whole. `StateStore` is the
//! raw, backend-specific half; `Document<T>` adds typed load/save/clear and
//! the reset-on-corruption policy.

use crate::error::{LinkError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Raw storage for a single document
pub trait StateStore: Send + Sync {
    /// Read the document, `None` if it does not exist
    fn read(&self) -> Result<Option<String>>;

    /// Atomically replace the document
    fn write(&self, contents: &str) -> Result<()>;

    /// Delete the document (no-op if absent)
    fn remove(&self) -> Result<()>;

    /// Human-readable location for logs
    fn location(&self) -> String;
}

/// Opens named documents on some storage medium
pub trait StateBackend: Send + Sync {
    /// Open the document called `name` (e.g. `"sessions"`, `"logs/errors"`)
    fn open(&self, name: &str) -> Box<dyn StateStore>;
}

/// JSON file-based document
///
/// Atomic writes via temp file + rename to prevent corruption.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    /// Create a new file state store at the given path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> Result<Option<String>> {
        if !self.path.exists() {
            return Ok(None);
        }

        std::fs::read_to_string(&self.path).map(Some).map_err(|e| {
            LinkError::Persistence(format!(
                "Failed to read state file {}: {}",
                self.path.display(),
                e
            ))
        })
    }

    fn write(&self, contents: &str) -> Result<()> {
        let tmp_path = self.path.with_extension("tmp");

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LinkError::Persistence(format!(
                    "Failed to create state directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        std::fs::write(&tmp_path, contents).map_err(|e| {
            LinkError::Persistence(format!(
                "Failed to write state file {}: {}",
                tmp_path.display(),
                e
            ))
        })?;

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            LinkError::Persistence(format!(
                "Failed to rename state file {} → {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), "State saved");
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LinkError::Persistence(format!(
                "Failed to remove state file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Backend storing each document as `<root>/<name>.json`
#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a named document is stored at
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", name))
    }
}

impl StateBackend for FileBackend {
    fn open(&self, name: &str) -> Box<dyn StateStore> {
        Box::new(FileStateStore::new(self.path_for(name)))
    }
}

/// In-memory document for testing
///
/// Documents live in a map shared with the owning `MemoryBackend`, so tests
/// can inspect or corrupt them directly.
pub struct MemoryStateStore {
    docs: Arc<RwLock<HashMap<String, String>>>,
    name: String,
}

impl StateStore for MemoryStateStore {
    fn read(&self) -> Result<Option<String>> {
        let docs = self.docs.read().map_err(|e| {
            LinkError::Persistence(format!("Failed to acquire state lock: {}", e))
        })?;
        Ok(docs.get(&self.name).cloned())
    }

    fn write(&self, contents: &str) -> Result<()> {
        let mut docs = self.docs.write().map_err(|e| {
            LinkError::Persistence(format!("Failed to acquire state lock: {}", e))
        })?;
        docs.insert(self.name.clone(), contents.to_string());
        Ok(())
    }

    fn remove(&self) -> Result<()> {
        let mut docs = self.docs.write().map_err(|e| {
            LinkError::Persistence(format!("Failed to acquire state lock: {}", e))
        })?;
        docs.remove(&self.name);
        Ok(())
    }

    fn location(&self) -> String {
        format!("memory:{}", self.name)
    }
}

/// Backend keeping all documents in memory, lost on drop
#[derive(Default, Clone)]
pub struct MemoryBackend {
    docs: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw contents of a document
    pub fn get(&self, name: &str) -> Option<String> {
        self.docs
            .read()
            .ok()
            .and_then(|docs| docs.get(name).cloned())
    }

    /// Overwrite a document with raw contents
    pub fn put(&self, name: &str, contents: impl Into<String>) {
        if let Ok(mut docs) = self.docs.write() {
            docs.insert(name.to_string(), contents.into());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }
}

impl StateBackend for MemoryBackend {
    fn open(&self, name: &str) -> Box<dyn StateStore> {
        Box::new(MemoryStateStore {
            docs: self.docs.clone(),
            name: name.to_string(),
        })
    }
}

/// Typed JSON document on top of a `StateStore`
pub struct Document<T> {
    store: Box<dyn StateStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Document<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(store: Box<dyn StateStore>) -> Self {
        Self {
            store,
            _marker: PhantomData,
        }
    }

    /// Open `name` on a backend
    pub fn open(backend: &dyn StateBackend, name: &str) -> Self {
        Self::new(backend.open(name))
    }

    pub fn location(&self) -> String {
        self.store.location()
    }

    /// Load and parse the document, surfacing read and parse failures
    pub fn try_load(&self) -> Result<Option<T>> {
        match self.store.read()? {
            Some(raw) if raw.trim().is_empty() => Ok(None),
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Serialize and atomically replace the document
    pub fn save(&self, value: &T) -> Result<()> {
        let json = serde_json::to_string_pretty(value)?;
        self.store.write(&json)
    }

    /// Delete the document
    pub fn clear(&self) -> Result<()> {
        self.store.remove()
    }
}

impl<T> Document<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Load the document, never failing
    ///
    /// An absent document is initialised with the default. An unreadable or
    /// malformed one is replaced by the default so the next start is clean.
    pub fn load_or_default(&self) -> T {
        match self.try_load() {
            Ok(Some(value)) => {
                tracing::debug!(location = %self.location(), "State loaded");
                value
            }
            Ok(None) => {
                let value = T::default();
                if let Err(e) = self.save(&value) {
                    tracing::warn!(
                        location = %self.location(),
                        error = %e,
                        "Failed to initialise state document"
                    );
                }
                value
            }
            Err(e) => {
                tracing::warn!(
                    location = %self.location(),
                    error = %e,
                    "State document unreadable, resetting to default"
                );
                let value = T::default();
                if let Err(e) = self.save(&value) {
                    tracing::warn!(
                        location = %self.location(),
                        error = %e,
                        "Failed to rewrite state document"
                    );
                }
                value
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        name: String,
        value: u32,
    }

    fn temp_dir() -> PathBuf {
        std::env::temp_dir().join(format!("a3s-link-test-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_memory_document_save_load() {
        let backend = MemoryBackend::new();
        let doc: Document<Counter> = Document::open(&backend, "counter");

        let counter = Counter {
            name: "opens".to_string(),
            value: 3,
        };
        doc.save(&counter).unwrap();

        assert_eq!(doc.try_load().unwrap(), Some(counter));
        assert!(backend.contains("counter"));
    }

    #[test]
    fn test_memory_document_absent_initialises_default() {
        let backend = MemoryBackend::new();
        let doc: Document<Counter> = Document::open(&backend, "counter");

        assert_eq!(doc.load_or_default(), Counter::default());
        let raw = backend.get("counter").unwrap();
        assert!(serde_json::from_str::<Counter>(&raw).is_ok());
    }

    #[test]
    fn test_corrupt_document_is_reset() {
        let backend = MemoryBackend::new();
        backend.put("counter", "{ not json");
        let doc: Document<Counter> = Document::open(&backend, "counter");

        assert!(doc.try_load().is_err());
        assert_eq!(doc.load_or_default(), Counter::default());

        // Rewritten with a valid document
        let raw = backend.get("counter").unwrap();
        assert_eq!(serde_json::from_str::<Counter>(&raw).unwrap(), Counter::default());
    }

    #[test]
    fn test_empty_document_treated_as_absent() {
        let backend = MemoryBackend::new();
        backend.put("counter", "   ");
        let doc: Document<Counter> = Document::open(&backend, "counter");
        assert_eq!(doc.try_load().unwrap(), None);
    }

    #[test]
    fn test_document_clear() {
        let backend = MemoryBackend::new();
        let doc: Document<Counter> = Document::open(&backend, "counter");
        doc.save(&Counter::default()).unwrap();
        doc.clear().unwrap();
        assert!(!backend.contains("counter"));
        // Clearing twice is fine
        doc.clear().unwrap();
    }

    #[test]
    fn test_file_store_save_load() {
        let dir = temp_dir();
        let backend = FileBackend::new(&dir);
        let doc: Document<Counter> = Document::open(&backend, "counter");

        let counter = Counter {
            name: "closes".to_string(),
            value: 7,
        };
        doc.save(&counter).unwrap();
        assert!(backend.path_for("counter").exists());
        assert_eq!(doc.try_load().unwrap(), Some(counter));

        // Verify JSON is human-readable
        let content = std::fs::read_to_string(backend.path_for("counter")).unwrap();
        assert!(content.contains("closes"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_load_nonexistent() {
        let store = FileStateStore::new("/tmp/nonexistent-a3s-link-state.json");
        assert!(store.read().unwrap().is_none());
        store.remove().unwrap();
    }

    #[test]
    fn test_file_store_creates_parent_dirs() {
        let dir = temp_dir();
        let backend = FileBackend::new(&dir);
        let doc: Document<Counter> = Document::open(&backend, "logs/nested");
        doc.save(&Counter::default()).unwrap();
        assert!(dir.join("logs").join("nested.json").exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_atomic_write() {
        let dir = temp_dir();
        let path = dir.join("state.json");
        let store = FileStateStore::new(&path);

        store.write("{}").unwrap();
        store.write("{\"a\":1}").unwrap();
        assert!(!path.with_extension("tmp").exists());
        assert_eq!(store.read().unwrap().as_deref(), Some("{\"a\":1}"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_corrupt_document_rewritten() {
        let dir = temp_dir();
        let backend = FileBackend::new(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(backend.path_for("counter"), "[1, 2,").unwrap();

        let doc: Document<Counter> = Document::open(&backend, "counter");
        assert_eq!(doc.load_or_default(), Counter::default());

        let content = std::fs::read_to_string(backend.path_for("counter")).unwrap();
        assert!(serde_json::from_str::<Counter>(&content).is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
