//! Cache and document store implementations.
//!
//! `MemoryCacheStore` and `MemoryDocumentStore` back single-process
//! deployments and tests; `FileDocumentStore` persists one JSON file per
//! key so conversations survive restarts.

use crate::traits::{CacheStore, DocumentStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Load and deserialize a typed document.
pub async fn load_doc<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key).await? {
        Some(value) => {
            let doc = serde_json::from_value(value)
                .with_context(|| format!("failed to parse document: {key}"))?;
            Ok(Some(doc))
        }
        None => Ok(None),
    }
}

/// Serialize and store a typed document.
pub async fn save_doc<T: Serialize + Sync>(
    store: &dyn DocumentStore,
    key: &str,
    doc: &T,
) -> Result<()> {
    let value = serde_json::to_value(doc)
        .with_context(|| format!("failed to serialize document: {key}"))?;
    store.set(key, value).await
}

// ---------------------------------------------------------------------------
// MemoryCacheStore
// ---------------------------------------------------------------------------

const DEFAULT_MAX_ENTRIES: usize = 1024;

struct CacheEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    insertion_order: Vec<String>,
}

/// In-process TTL cache. When full, the oldest insertion is evicted.
pub struct MemoryCacheStore {
    inner: Mutex<CacheInner>,
    max_entries: usize,
}

impl std::fmt::Debug for MemoryCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCacheStore")
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_ENTRIES)
    }

    pub fn with_capacity(max_entries: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_entries: max_entries.max(1),
        }
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.values().filter(|e| now < e.expires_at).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(inner
            .entries
            .get(key)
            .filter(|e| Instant::now() < e.expires_at)
            .map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let CacheInner {
            entries,
            insertion_order,
        } = &mut *inner;

        entries.retain(|_, e| now < e.expires_at);
        insertion_order.retain(|k| entries.contains_key(k));

        if !entries.contains_key(key) {
            while entries.len() >= self.max_entries && !insertion_order.is_empty() {
                let oldest = insertion_order.remove(0);
                entries.remove(&oldest);
            }
            insertion_order.push(key.to_owned());
        }

        entries.insert(
            key.to_owned(),
            CacheEntry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entries.remove(key);
        inner.insertion_order.retain(|k| k != key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryDocumentStore
// ---------------------------------------------------------------------------

/// In-memory document store.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<String, serde_json::Value>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        docs.keys().cloned().collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let docs = self.docs.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(docs.get(key).cloned())
    }

    async fn set(&self, key: &str, doc: serde_json::Value) -> Result<()> {
        self.docs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned(), doc);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileDocumentStore
// ---------------------------------------------------------------------------

/// File-backed document store: `{dir}/{escaped key}.json`.
#[derive(Debug)]
pub struct FileDocumentStore {
    dir: PathBuf,
}

impl FileDocumentStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create document dir: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut slug = String::with_capacity(key.len());
        for byte in key.bytes() {
            if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' || byte == b'.' {
                slug.push(char::from(byte));
            } else {
                slug.push_str(&format!("~{byte:02x}"));
            }
        }
        self.dir.join(format!("{slug}.json"))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(data) => {
                let doc = serde_json::from_str(&data)
                    .with_context(|| format!("failed to parse document: {}", path.display()))?;
                debug!(key, "loaded document");
                Ok(Some(doc))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn set(&self, key: &str, doc: serde_json::Value) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        let data = serde_json::to_string_pretty(&doc)?;
        tokio::fs::write(&tmp, data)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("failed to replace {}", path.display()))?;
        debug!(key, "saved document");
        Ok(())
    }
}
