//! SQLite-backed cache for model completions.
//!
//! Content-addressed by a blake3 hash over (model, system text, user text,
//! normalized call options, extra salt). Entries carry the full completion
//! and its token counts so cache hits still contribute accurate cost
//! accounting, flagged as cached. Eviction is LRU by row cap plus optional
//! age-based pruning.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of a completion call, hashed into the cache key.
#[derive(Debug, Clone)]
pub struct CompletionCacheKey {
    pub model: String,
    pub system_hash: String,
    pub user_hash: String,
    /// Normalized options fingerprint: "t=<temp>;max=<tokens>;json=<bool>".
    pub params: String,
    pub key_hash: String,
}

impl CompletionCacheKey {
    pub fn new(
        model: &str,
        system_text: &str,
        user_text: &str,
        temperature: f32,
        max_tokens: Option<u32>,
        json_mode: bool,
        salt: Option<&str>,
    ) -> Self {
        let system_hash = hash_text(system_text);
        let user_hash = hash_text(user_text);
        let params = format!(
            "t={temperature};max={};json={json_mode}",
            max_tokens.map(|m| m.to_string()).unwrap_or_default()
        );
        let key_hash = hash_fields(&[
            model,
            &system_hash,
            &user_hash,
            &params,
            salt.unwrap_or(""),
        ]);

        Self {
            model: model.to_string(),
            system_hash,
            user_hash,
            params,
            key_hash,
        }
    }
}

/// A cached completion with its original usage record.
#[derive(Debug, Clone)]
pub struct CachedCompletion {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

#[async_trait]
pub trait CompletionCache: Send + Sync {
    async fn get(&self, key: &CompletionCacheKey) -> Result<Option<CachedCompletion>, CacheError>;
    async fn put(
        &self,
        key: &CompletionCacheKey,
        value: &CachedCompletion,
    ) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteCompletionCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCompletionCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS completion_cache (\
               key_hash TEXT PRIMARY KEY,\
               model TEXT NOT NULL,\
               system_hash TEXT NOT NULL,\
               user_hash TEXT NOT NULL,\
               params TEXT NOT NULL,\
               content TEXT NOT NULL,\
               input_tokens INTEGER NOT NULL,\
               output_tokens INTEGER NOT NULL,\
               cost_nanodollars INTEGER NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Default on-disk location inside a cache directory.
    pub fn default_path(cache_dir: &Path) -> PathBuf {
        cache_dir.join("llm_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl CompletionCache for SqliteCompletionCache {
    async fn get(&self, key: &CompletionCacheKey) -> Result<Option<CachedCompletion>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT content, input_tokens, output_tokens, cost_nanodollars \
                     FROM completion_cache WHERE key_hash = ?1",
                )?;
                let mut rows = stmt.query(params![key_hash])?;
                if let Some(row) = rows.next()? {
                    let entry = CachedCompletion {
                        content: row.get(0)?,
                        input_tokens: row.get::<_, i64>(1)? as u32,
                        output_tokens: row.get::<_, i64>(2)? as u32,
                        cost_nanodollars: row.get(3)?,
                    };
                    conn.execute(
                        "UPDATE completion_cache \
                         SET hit_count = hit_count + 1, updated_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now_epoch(), key_hash],
                    )?;
                    Ok(Some(entry))
                } else {
                    Ok(None)
                }
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(
        &self,
        key: &CompletionCacheKey,
        value: &CachedCompletion,
    ) -> Result<(), CacheError> {
        let key = key.clone();
        let value = value.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO completion_cache (\
                        key_hash, model, system_hash, user_hash, params,\
                        content, input_tokens, output_tokens, cost_nanodollars,\
                        created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        content = excluded.content,\
                        input_tokens = excluded.input_tokens,\
                        output_tokens = excluded.output_tokens,\
                        cost_nanodollars = excluded.cost_nanodollars,\
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.model,
                        key.system_hash,
                        key.user_hash,
                        key.params,
                        value.content,
                        value.input_tokens as i64,
                        value.output_tokens as i64,
                        value.cost_nanodollars,
                        now,
                        now,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Serialize)]
pub struct CacheExportRow {
    pub key_hash: String,
    pub model: String,
    pub system_hash: String,
    pub user_hash: String,
    pub params: String,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteCompletionCache {
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<(), CacheError> {
        let path = path.as_ref().to_path_buf();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT key_hash, model, system_hash, user_hash, params,\
                            content, input_tokens, output_tokens, cost_nanodollars,\
                            created_at, updated_at, hit_count \
                     FROM completion_cache ORDER BY updated_at DESC",
                )?;
                let mut rows = stmt.query([])?;
                let mut file = std::fs::File::create(path)?;
                while let Some(row) = rows.next()? {
                    let record = CacheExportRow {
                        key_hash: row.get(0)?,
                        model: row.get(1)?,
                        system_hash: row.get(2)?,
                        user_hash: row.get(3)?,
                        params: row.get(4)?,
                        content: row.get(5)?,
                        input_tokens: row.get::<_, i64>(6)? as u32,
                        output_tokens: row.get::<_, i64>(7)? as u32,
                        cost_nanodollars: row.get(8)?,
                        created_at: row.get(9)?,
                        updated_at: row.get(10)?,
                        hit_count: row.get(11)?,
                    };
                    let line = serde_json::to_string(&record)
                        .map_err(|e| CacheError::Serde(e.to_string()))?;
                    use std::io::Write;
                    writeln!(file, "{line}")?;
                }
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    /// Prune by age and/or LRU row cap (keyed on `updated_at`, which hits
    /// bump, so the retained rows are the most recently used).
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                    let removed = conn.execute(
                        "DELETE FROM completion_cache WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    if max_rows == 0 {
                        let removed = conn.execute("DELETE FROM completion_cache", [])?;
                        return Ok(CachePruneStats {
                            deleted: deleted + removed,
                            remaining: 0,
                        });
                    }
                    let count: i64 =
                        conn.query_row("SELECT COUNT(*) FROM completion_cache", [], |row| {
                            row.get(0)
                        })?;
                    let keep = max_rows as i64;
                    if count > keep {
                        let removed = conn.execute(
                            "DELETE FROM completion_cache WHERE key_hash IN (\
                                SELECT key_hash FROM completion_cache \
                                ORDER BY updated_at DESC LIMIT -1 OFFSET ?1\
                             )",
                            params![keep],
                        )?;
                        deleted = deleted.saturating_add(removed);
                    }
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM completion_cache", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
