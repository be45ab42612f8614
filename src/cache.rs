//! SQLite-backed cache of accepted oracle replies.
//!
//! Only raw reply text is stored. Callers re-validate a hit under their
//! current rules, so tightening `min_note_length` never lets a stale reply
//! through.

use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::catalog::RecordKey;
use crate::prompts::PromptInstance;

pub const ENV_CACHE_PATH: &str = "CCSI_CACHE_PATH";
const DEFAULT_CACHE_PATH: &str = "output/reply_cache.sqlite";

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS reply_cache (
        key_hash             TEXT PRIMARY KEY,
        oracle               TEXT NOT NULL,
        prompt_template_slug TEXT NOT NULL,
        template_hash        TEXT NOT NULL,
        era_id               TEXT NOT NULL,
        region               TEXT NOT NULL,
        prompt_hash          TEXT NOT NULL,
        reply                TEXT NOT NULL,
        created_at           INTEGER NOT NULL,
        updated_at           INTEGER NOT NULL,
        hit_count            INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS reply_cache_updated ON reply_cache (updated_at);
";

/// Identity of one cached reply.
///
/// Two requests share an entry only if they went to the same oracle with the
/// same rendered prompt for the same cell, so editing a template or a
/// baseline changes the key.
#[derive(Debug, Clone)]
pub struct ReplyCacheKey {
    pub oracle: String,
    pub prompt_template_slug: String,
    pub template_hash: String,
    pub era_id: String,
    pub region: String,
    pub prompt_hash: String,
    pub key_hash: String,
}

impl ReplyCacheKey {
    /// `oracle` is the gateway identity, e.g. `gemini/gemini-2.0-flash`.
    pub fn new(oracle: &str, prompt: &PromptInstance, record: &RecordKey) -> Self {
        let era_id = record.era.to_string();
        let prompt_hash = blake3::hash(prompt.text.as_bytes()).to_hex().to_string();
        let key_hash = hash_fields(&[
            oracle,
            prompt.template_slug,
            &prompt.template_hash,
            &era_id,
            &record.region,
            &prompt_hash,
        ]);

        Self {
            oracle: oracle.to_string(),
            prompt_template_slug: prompt.template_slug.to_string(),
            template_hash: prompt.template_hash.clone(),
            era_id,
            region: record.region.clone(),
            prompt_hash,
            key_hash,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache connection mutex poisoned")]
    Poisoned,
    #[error("cache worker panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("encoding export row: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Storage for raw oracle replies. Read or write failures are logged by the
/// engine and never fail a record.
#[async_trait]
pub trait ReplyCache: Send + Sync {
    async fn get(&self, key: &ReplyCacheKey) -> Result<Option<String>, CacheError>;
    async fn put(&self, key: &ReplyCacheKey, reply: &str) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteReplyCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteReplyCache {
    /// Open or create the database, creating parent directories as needed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// `$CCSI_CACHE_PATH`, else `output/reply_cache.sqlite`.
    pub fn default_path() -> PathBuf {
        std::env::var_os(ENV_CACHE_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_PATH))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hold an advisory lock next to the database while running maintenance.
    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::acquire(&self.path)
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&mut Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| CacheError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }

    /// Write every entry as one JSON object per line, most recently used
    /// first. Returns the number of rows written.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key_hash, oracle, prompt_template_slug, template_hash, era_id, region,
                        prompt_hash, reply, created_at, updated_at, hit_count
                 FROM reply_cache
                 ORDER BY updated_at DESC, key_hash",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(CacheExportRow {
                    key_hash: row.get(0)?,
                    oracle: row.get(1)?,
                    prompt_template_slug: row.get(2)?,
                    template_hash: row.get(3)?,
                    era_id: row.get(4)?,
                    region: row.get(5)?,
                    prompt_hash: row.get(6)?,
                    reply: row.get(7)?,
                    created_at: row.get(8)?,
                    updated_at: row.get(9)?,
                    hit_count: row.get(10)?,
                })
            })?;

            let mut out = BufWriter::new(std::fs::File::create(path)?);
            let mut written = 0usize;
            for row in rows {
                serde_json::to_writer(&mut out, &row?)?;
                out.write_all(b"\n")?;
                written += 1;
            }
            out.flush()?;
            Ok(written)
        })
        .await
    }

    /// Drop entries unused for more than `max_age_days`, then keep only the
    /// `max_rows` most recently used.
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0usize;

            if let Some(days) = max_age_days {
                let age = i64::try_from(days).unwrap_or(i64::MAX).saturating_mul(86_400);
                let cutoff = now_epoch().saturating_sub(age);
                deleted += tx.execute(
                    "DELETE FROM reply_cache WHERE updated_at < ?1",
                    params![cutoff],
                )?;
            }

            if let Some(keep) = max_rows {
                let keep = i64::try_from(keep).unwrap_or(i64::MAX);
                deleted += tx.execute(
                    "DELETE FROM reply_cache WHERE key_hash IN (
                         SELECT key_hash FROM reply_cache
                         ORDER BY updated_at DESC, key_hash
                         LIMIT -1 OFFSET ?1
                     )",
                    params![keep],
                )?;
            }

            let remaining: i64 =
                tx.query_row("SELECT COUNT(*) FROM reply_cache", [], |row| row.get(0))?;
            tx.commit()?;
            Ok(CachePruneStats {
                deleted,
                remaining: usize::try_from(remaining).unwrap_or(0),
            })
        })
        .await
    }
}

#[async_trait]
impl ReplyCache for SqliteReplyCache {
    async fn get(&self, key: &ReplyCacheKey) -> Result<Option<String>, CacheError> {
        let key_hash = key.key_hash.clone();
        self.blocking(move |conn| {
            let reply: Option<String> = conn
                .query_row(
                    "SELECT reply FROM reply_cache WHERE key_hash = ?1",
                    params![key_hash],
                    |row| row.get(0),
                )
                .optional()?;
            if reply.is_some() {
                conn.execute(
                    "UPDATE reply_cache SET hit_count = hit_count + 1, updated_at = ?1
                     WHERE key_hash = ?2",
                    params![now_epoch(), key_hash],
                )?;
            }
            Ok(reply)
        })
        .await
    }

    async fn put(&self, key: &ReplyCacheKey, reply: &str) -> Result<(), CacheError> {
        let key = key.clone();
        let reply = reply.to_string();
        self.blocking(move |conn| {
            let now = now_epoch();
            conn.execute(
                "INSERT INTO reply_cache (
                     key_hash, oracle, prompt_template_slug, template_hash,
                     era_id, region, prompt_hash, reply, created_at, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(key_hash) DO UPDATE SET
                     reply = excluded.reply,
                     updated_at = excluded.updated_at",
                params![
                    key.key_hash,
                    key.oracle,
                    key.prompt_template_slug,
                    key.template_hash,
                    key.era_id,
                    key.region,
                    key.prompt_hash,
                    reply,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }
}

/// Advisory lock on `<db>.lock`, released on drop.
#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn acquire(db_path: &Path) -> Result<Self, CacheError> {
        let lock_path = db_path.with_extension("lock");
        // Never truncate: another process may hold the lock and own the file.
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
    pub oracle: String,
    pub prompt_template_slug: String,
    pub template_hash: String,
    pub era_id: String,
    pub region: String,
    pub prompt_hash: String,
    pub reply: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
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
    chrono::Utc::now().timestamp()
}
