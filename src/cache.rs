//! Idempotency cache for classifications
//!
//! Entries are keyed by `message_id:fingerprint`, where the fingerprint is a
//! SHA-256 over subject, sender and extracted text. A small LRU tier sits in
//! front of a persistent store (JSON file, or SQLite with the `cache`
//! feature).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{CacheBackend, CacheConfig};
use crate::error::{LabellerError, Result};
use crate::models::{ClassificationResult, ExtractedContent, Message, Summary};

/// Stable content fingerprint of a message
pub fn fingerprint(message: &Message, content: &ExtractedContent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(message.subject.as_bytes());
    hasher.update([0x1f]);
    hasher.update(message.sender.as_bytes());
    hasher.update([0x1f]);
    hasher.update(content.text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn cache_key(message: &Message, content: &ExtractedContent) -> String {
    format!("{}:{}", message.id, fingerprint(message, content))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResult {
    pub summary: Summary,
    pub classification: ClassificationResult,
    pub cached_at: DateTime<Utc>,
}

/// Persistent tier behind the in-memory LRU
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedResult>>;
    async fn put(&self, key: &str, entry: &CachedResult) -> Result<()>;
    /// Persist buffered writes
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Whole cache held in memory and written to one JSON file on flush
pub struct FileCacheStore {
    path: PathBuf,
    entries: tokio::sync::Mutex<HashMap<String, CachedResult>>,
    dirty: AtomicBool,
}

impl FileCacheStore {
    /// Load the cache file. A missing file starts empty; an unreadable one is
    /// discarded with a warning.
    pub async fn open(path: &Path) -> Result<Self> {
        let entries = match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json).unwrap_or_else(|e| {
                warn!("Ignoring corrupt cache file {:?}: {}", path, e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} cached classifications from {:?}", entries.len(), path);

        Ok(Self {
            path: path.to_path_buf(),
            entries: tokio::sync::Mutex::new(entries),
            dirty: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CachedResult>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, entry: &CachedResult) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), entry.clone());
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = {
            let entries = self.entries.lock().await;
            serde_json::to_string(&*entries)?
        };
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!("Flushed classification cache to {:?}", self.path);
        Ok(())
    }
}

#[cfg(feature = "cache")]
pub use sqlite::SqliteCacheStore;

#[cfg(feature = "cache")]
mod sqlite {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::sync::Arc;

    const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS classification_cache (
        key TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        cached_at TEXT NOT NULL
    );";

    fn db_error(e: impl std::fmt::Display) -> LabellerError {
        LabellerError::CacheError(e.to_string())
    }

    /// SQLite-backed store; queries run on the blocking pool
    #[derive(Clone)]
    pub struct SqliteCacheStore {
        conn: Arc<tokio::sync::Mutex<Connection>>,
    }

    impl SqliteCacheStore {
        pub async fn open(path: &Path) -> Result<Self> {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let path = path.to_path_buf();
            let conn = tokio::task::spawn_blocking(move || -> rusqlite::Result<Connection> {
                let conn = Connection::open(&path)?;
                conn.execute_batch("PRAGMA journal_mode = WAL;")?;
                conn.execute_batch(SCHEMA)?;
                Ok(conn)
            })
            .await
            .map_err(db_error)?
            .map_err(db_error)?;

            Ok(Self {
                conn: Arc::new(tokio::sync::Mutex::new(conn)),
            })
        }

        pub async fn open_in_memory() -> Result<Self> {
            let conn = Connection::open_in_memory().map_err(db_error)?;
            conn.execute_batch(SCHEMA).map_err(db_error)?;
            Ok(Self {
                conn: Arc::new(tokio::sync::Mutex::new(conn)),
            })
        }
    }

    #[async_trait]
    impl CacheStore for SqliteCacheStore {
        async fn get(&self, key: &str) -> Result<Option<CachedResult>> {
            let conn = self.conn.clone();
            let key = key.to_string();
            let payload = tokio::task::spawn_blocking(move || {
                let conn = conn.blocking_lock();
                conn.query_row(
                    "SELECT payload FROM classification_cache WHERE key = ?1",
                    params![key],
                    |row| row.get::<_, String>(0),
                )
                .optional()
            })
            .await
            .map_err(db_error)?
            .map_err(db_error)?;

            payload
                .map(|json| serde_json::from_str(&json).map_err(LabellerError::from))
                .transpose()
        }

        async fn put(&self, key: &str, entry: &CachedResult) -> Result<()> {
            let conn = self.conn.clone();
            let key = key.to_string();
            let payload = serde_json::to_string(entry)?;
            let cached_at = entry.cached_at.to_rfc3339();
            tokio::task::spawn_blocking(move || {
                let conn = conn.blocking_lock();
                conn.execute(
                    "INSERT OR REPLACE INTO classification_cache (key, payload, cached_at)
                     VALUES (?1, ?2, ?3)",
                    params![key, payload, cached_at],
                )
            })
            .await
            .map_err(db_error)?
            .map_err(db_error)?;
            Ok(())
        }
    }
}

/// LRU tier plus persistent store
pub struct ClassificationCache {
    recent: Mutex<LruCache<String, CachedResult>>,
    store: Box<dyn CacheStore>,
}

impl ClassificationCache {
    pub fn new(capacity: usize, store: Box<dyn CacheStore>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            recent: Mutex::new(LruCache::new(capacity)),
            store,
        }
    }

    /// Open the store selected by configuration
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        let store: Box<dyn CacheStore> = match config.backend {
            CacheBackend::File => Box::new(FileCacheStore::open(&config.path).await?),
            #[cfg(feature = "cache")]
            CacheBackend::Sqlite => Box::new(SqliteCacheStore::open(&config.path).await?),
            #[cfg(not(feature = "cache"))]
            CacheBackend::Sqlite => {
                return Err(LabellerError::ConfigError(
                    "sqlite cache backend requires the 'cache' feature".to_string(),
                ))
            }
        };
        info!("Classification cache: {:?} at {:?}", config.backend, config.path);
        Ok(Self::new(config.capacity, store))
    }

    /// Cached result for `key`, only if it was classified by `classify_model`
    pub async fn lookup(&self, key: &str, classify_model: &str) -> Result<Option<CachedResult>> {
        let recent = self.recent_lock()?.get(key).cloned();
        let entry = match recent {
            Some(entry) => Some(entry),
            None => {
                let stored = self.store.get(key).await?;
                if let Some(entry) = &stored {
                    self.recent_lock()?.put(key.to_string(), entry.clone());
                }
                stored
            }
        };

        Ok(entry.filter(|e| {
            let same_model = e.classification.model_id == classify_model;
            if !same_model {
                debug!(
                    "Cache entry {} was produced by {}, not {}",
                    key, e.classification.model_id, classify_model
                );
            }
            same_model
        }))
    }

    pub async fn insert(&self, key: &str, summary: &Summary, classification: &ClassificationResult) -> Result<()> {
        let entry = CachedResult {
            summary: summary.clone(),
            classification: classification.clone(),
            cached_at: Utc::now(),
        };
        self.recent_lock()?.put(key.to_string(), entry.clone());
        self.store.put(key, &entry).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    fn recent_lock(&self) -> Result<std::sync::MutexGuard<'_, LruCache<String, CachedResult>>> {
        self.recent
            .lock()
            .map_err(|_| LabellerError::CacheError("cache lock poisoned".to_string()))
    }
}
