//! Content-addressed response cache for pass executors.
//!
//! A [`Fingerprint`] hashes everything that determines a pass's model output.
//! [`CacheStore`] layers at-most-one-computation-per-fingerprint on top of a
//! [`ResponseCache`] backend.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::gateway::Message;

// =============================================================================
// FINGERPRINT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub lane_id: String,
    pub pass_type: String,
    pub model: String,
    pub prompt_hash: String,
    pub context_hash: String,
    pub key_hash: String,
}

impl Fingerprint {
    pub fn new(
        lane_id: &str,
        lane_version: u32,
        pass_type: &str,
        model: &str,
        messages: &[Message],
        context_signature: &Value,
    ) -> Self {
        let prompt_hash = hash_text(&canonical_prompt(messages));
        let context_hash = hash_text(&canonical_json(context_signature));
        let version = lane_version.to_string();
        let key_hash = hash_fields(&[
            lane_id,
            &version,
            pass_type,
            model,
            &prompt_hash,
            &context_hash,
        ]);

        Self {
            lane_id: lane_id.to_string(),
            pass_type: pass_type.to_string(),
            model: model.to_string(),
            prompt_hash,
            context_hash,
            key_hash,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key_hash
    }
}

/// Role-tagged message bodies with line endings unified and trailing
/// whitespace stripped, so cosmetic edits do not split the cache.
pub fn canonical_prompt(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| format!("{}\n{}", m.role.as_str(), normalize_text(&m.content)))
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

fn normalize_text(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

/// Compact JSON with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                if let Some(v) = map.get(*key) {
                    write_canonical(v, out);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// =============================================================================
// BACKENDS
// =============================================================================

/// A schema-valid pass output plus the usage of the call that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub payload: String,
    pub model: String,
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
pub trait ResponseCache: Send + Sync {
    /// Unexpired entry for `fp`, if any. Expired entries read as a miss.
    async fn get(&self, fp: &Fingerprint) -> Result<Option<CachedResponse>, CacheError>;

    /// Store `value` for `ttl`. A live entry for the same fingerprint is kept.
    async fn put(
        &self,
        fp: &Fingerprint,
        value: &CachedResponse,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Drop the entry for `fp`. Returns whether one existed.
    async fn invalidate(&self, fp: &Fingerprint) -> Result<bool, CacheError>;
}

#[derive(Clone)]
pub struct SqliteResponseCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResponseCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;\
             CREATE TABLE IF NOT EXISTS response_cache (\
               key_hash TEXT PRIMARY KEY,\
               lane_id TEXT NOT NULL,\
               pass_type TEXT NOT NULL,\
               model TEXT NOT NULL,\
               prompt_hash TEXT NOT NULL,\
               context_hash TEXT NOT NULL,\
               payload TEXT NOT NULL,\
               served_model TEXT NOT NULL,\
               input_tokens INTEGER NOT NULL,\
               output_tokens INTEGER NOT NULL,\
               cost_nanodollars INTEGER NOT NULL,\
               created_at_ms INTEGER NOT NULL,\
               expires_at_ms INTEGER NOT NULL,\
               last_hit_at_ms INTEGER,\
               hit_count INTEGER NOT NULL DEFAULT 0 \
             );\
             CREATE INDEX IF NOT EXISTS idx_response_cache_expiry ON response_cache(expires_at_ms);",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advisory exclusive lock for maintenance commands.
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

    async fn blocking<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError> + Send + 'static,
        R: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.with_conn(f))
            .await
            .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[async_trait]
impl ResponseCache for SqliteResponseCache {
    async fn get(&self, fp: &Fingerprint) -> Result<Option<CachedResponse>, CacheError> {
        let key_hash = fp.key_hash.clone();
        self.blocking(move |conn| {
            let now = now_ms();
            let entry = conn
                .query_row(
                    "SELECT payload, served_model, input_tokens, output_tokens, cost_nanodollars \
                     FROM response_cache WHERE key_hash = ?1 AND expires_at_ms > ?2",
                    params![key_hash, now],
                    |row| {
                        Ok(CachedResponse {
                            payload: row.get(0)?,
                            model: row.get(1)?,
                            input_tokens: row.get::<_, i64>(2)? as u32,
                            output_tokens: row.get::<_, i64>(3)? as u32,
                            cost_nanodollars: row.get(4)?,
                        })
                    },
                )
                .optional()?;
            if entry.is_some() {
                conn.execute(
                    "UPDATE response_cache \
                     SET hit_count = hit_count + 1, last_hit_at_ms = ?1 \
                     WHERE key_hash = ?2",
                    params![now, key_hash],
                )?;
            }
            Ok(entry)
        })
        .await
    }

    async fn put(
        &self,
        fp: &Fingerprint,
        value: &CachedResponse,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let fp = fp.clone();
        let value = value.clone();
        self.blocking(move |conn| {
            let now = now_ms();
            let expires = now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);
            // Replace only an expired row; a live entry is never mutated.
            conn.execute(
                "INSERT INTO response_cache (\
                    key_hash, lane_id, pass_type, model, prompt_hash, context_hash,\
                    payload, served_model, input_tokens, output_tokens, cost_nanodollars,\
                    created_at_ms, expires_at_ms \
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)\
                 ON CONFLICT(key_hash) DO UPDATE SET \
                    payload = excluded.payload,\
                    served_model = excluded.served_model,\
                    input_tokens = excluded.input_tokens,\
                    output_tokens = excluded.output_tokens,\
                    cost_nanodollars = excluded.cost_nanodollars,\
                    created_at_ms = excluded.created_at_ms,\
                    expires_at_ms = excluded.expires_at_ms,\
                    hit_count = 0 \
                 WHERE response_cache.expires_at_ms <= excluded.created_at_ms",
                params![
                    fp.key_hash,
                    fp.lane_id,
                    fp.pass_type,
                    fp.model,
                    fp.prompt_hash,
                    fp.context_hash,
                    value.payload,
                    value.model,
                    value.input_tokens as i64,
                    value.output_tokens as i64,
                    value.cost_nanodollars,
                    now,
                    expires,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn invalidate(&self, fp: &Fingerprint) -> Result<bool, CacheError> {
        let key_hash = fp.key_hash.clone();
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM response_cache WHERE key_hash = ?1",
                params![key_hash],
            )?;
            Ok(removed > 0)
        })
        .await
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
    pub lane_id: String,
    pub pass_type: String,
    pub model: String,
    pub payload: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
    pub hit_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub expired: usize,
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteResponseCache {
    /// Write every row, newest first, as one JSON object per line.
    /// Returns the number of rows written.
    pub async fn export_jsonl(&self, path: impl AsRef<Path>) -> Result<usize, CacheError> {
        let path = path.as_ref().to_path_buf();
        self.blocking(move |conn| {
            use std::io::Write;

            let mut stmt = conn.prepare(
                "SELECT key_hash, lane_id, pass_type, model, payload, input_tokens, output_tokens,\
                        cost_nanodollars, created_at_ms, expires_at_ms, hit_count \
                 FROM response_cache ORDER BY created_at_ms DESC, key_hash",
            )?;
            let mut rows = stmt.query([])?;
            let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
            let mut written = 0;
            while let Some(row) = rows.next()? {
                let record = CacheExportRow {
                    key_hash: row.get(0)?,
                    lane_id: row.get(1)?,
                    pass_type: row.get(2)?,
                    model: row.get(3)?,
                    payload: row.get(4)?,
                    input_tokens: row.get::<_, i64>(5)? as u32,
                    output_tokens: row.get::<_, i64>(6)? as u32,
                    cost_nanodollars: row.get(7)?,
                    created_at_ms: row.get(8)?,
                    expires_at_ms: row.get(9)?,
                    hit_count: row.get(10)?,
                };
                let line =
                    serde_json::to_string(&record).map_err(|e| CacheError::Serde(e.to_string()))?;
                writeln!(file, "{line}")?;
                written += 1;
            }
            file.flush()?;
            Ok(written)
        })
        .await
    }

    /// Drop expired rows, then rows older than `max_age_days`, then the oldest
    /// rows beyond `max_rows`.
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        self.blocking(move |conn| {
            let now = now_ms();
            let expired = conn.execute(
                "DELETE FROM response_cache WHERE expires_at_ms <= ?1",
                params![now],
            )?;

            let mut deleted: usize = 0;
            if let Some(days) = max_age_days {
                let cutoff = now.saturating_sub((days as i64).saturating_mul(86_400_000));
                deleted += conn.execute(
                    "DELETE FROM response_cache WHERE created_at_ms < ?1",
                    params![cutoff],
                )?;
            }

            if let Some(max_rows) = max_rows {
                deleted += conn.execute(
                    "DELETE FROM response_cache WHERE key_hash IN (\
                        SELECT key_hash FROM response_cache \
                        ORDER BY created_at_ms DESC LIMIT -1 OFFSET ?1 \
                     )",
                    params![max_rows as i64],
                )?;
            }

            let remaining: i64 =
                conn.query_row("SELECT COUNT(*) FROM response_cache", [], |row| row.get(0))?;
            Ok(CachePruneStats {
                expired,
                deleted,
                remaining: remaining.max(0) as usize,
            })
        })
        .await
    }
}

/// Process-local backend for tests and throwaway runs.
#[derive(Default)]
pub struct MemoryResponseCache {
    entries: Mutex<HashMap<String, (CachedResponse, i64)>>,
}

impl MemoryResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn get(&self, fp: &Fingerprint) -> Result<Option<CachedResponse>, CacheError> {
        let map = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(map
            .get(&fp.key_hash)
            .filter(|(_, expires)| *expires > now_ms())
            .map(|(value, _)| value.clone()))
    }

    async fn put(
        &self,
        fp: &Fingerprint,
        value: &CachedResponse,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut map = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        let now = now_ms();
        let live = map
            .get(&fp.key_hash)
            .map(|(_, expires)| *expires > now)
            .unwrap_or(false);
        if !live {
            let expires = now.saturating_add(ttl.as_millis().min(i64::MAX as u128) as i64);
            map.insert(fp.key_hash.clone(), (value.clone(), expires));
        }
        Ok(())
    }

    async fn invalidate(&self, fp: &Fingerprint) -> Result<bool, CacheError> {
        let mut map = self.entries.lock().map_err(|_| CacheError::Poisoned)?;
        Ok(map.remove(&fp.key_hash).is_some())
    }
}

// =============================================================================
// SINGLE-FLIGHT STORE
// =============================================================================

/// Result of [`CacheStore::get_or_compute`].
#[derive(Debug, Clone)]
pub struct Lookup {
    pub response: CachedResponse,
    pub hit: bool,
}

/// The caller's token fired while it waited for another computation of the
/// same fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("cancelled while waiting on an in-flight computation")]
pub struct LookupCancelled;

type Gates = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

#[derive(Clone)]
pub struct CacheStore {
    backend: Arc<dyn ResponseCache>,
    inflight: Gates,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn ResponseCache>) -> Self {
        Self {
            backend,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Serve `fp` from cache, or run `compute` with no other computation for
    /// the same fingerprint in flight. Waiters re-read the cache once the
    /// leader finishes and only compute themselves if it failed.
    ///
    /// `ttl == None` or zero bypasses the cache entirely. Waiting for the
    /// gate ends early with [`LookupCancelled`] once `cancel` fires.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        fp: &Fingerprint,
        ttl: Option<Duration>,
        cancel: &CancellationToken,
        compute: F,
    ) -> Result<Lookup, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, E>>,
        E: From<LookupCancelled>,
    {
        let ttl = match ttl {
            Some(ttl) if !ttl.is_zero() => ttl,
            _ => {
                return compute().await.map(|response| Lookup {
                    response,
                    hit: false,
                })
            }
        };

        if let Some(response) = self.read(fp).await {
            return Ok(Lookup {
                response,
                hit: true,
            });
        }

        let flight = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            flight = self.acquire(fp) => Some(flight),
        };
        let Some(_flight) = flight else {
            debug!(fingerprint = fp.as_str(), "gave up waiting on in-flight computation");
            self.forget_idle(fp);
            return Err(LookupCancelled.into());
        };

        if let Some(response) = self.read(fp).await {
            debug!(fingerprint = fp.as_str(), "served by concurrent computation");
            return Ok(Lookup {
                response,
                hit: true,
            });
        }

        let response = compute().await?;
        if let Err(err) = self.backend.put(fp, &response, ttl).await {
            warn!(fingerprint = fp.as_str(), error = %err, "cache write failed");
        }
        Ok(Lookup {
            response,
            hit: false,
        })
    }

    /// Backend read; errors degrade to a miss.
    async fn read(&self, fp: &Fingerprint) -> Option<CachedResponse> {
        match self.backend.get(fp).await {
            Ok(hit) => hit,
            Err(err) => {
                warn!(fingerprint = fp.as_str(), error = %err, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn acquire(&self, fp: &Fingerprint) -> FlightGuard {
        let gate = {
            let mut map = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(
                map.entry(fp.key_hash.clone())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let held = Arc::clone(&gate).lock_owned().await;
        FlightGuard {
            gates: Arc::clone(&self.inflight),
            key: fp.key_hash.clone(),
            gate,
            held: Some(held),
        }
    }

    /// Drops the gate for `fp` if an abandoned wait left it behind unheld.
    fn forget_idle(&self, fp: &Fingerprint) {
        let mut map = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        let idle = map
            .get(&fp.key_hash)
            .is_some_and(|gate| Arc::strong_count(gate) == 1 && gate.try_lock().is_ok());
        if idle {
            map.remove(&fp.key_hash);
        }
    }

    /// Fingerprints with a computation or waiter in flight.
    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }
}

/// Releases the per-fingerprint gate on drop, including when the leader's
/// future is cancelled, and forgets the gate once nobody else holds it.
struct FlightGuard {
    gates: Gates,
    key: String,
    gate: Arc<AsyncMutex<()>>,
    held: Option<OwnedMutexGuard<()>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        drop(self.held.take());
        let mut map = self.gates.lock().unwrap_or_else(|p| p.into_inner());
        // The map's clone and ours.
        if Arc::strong_count(&self.gate) <= 2 {
            map.remove(&self.key);
        }
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

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fp(messages: &[Message], ctx: &Value) -> Fingerprint {
        Fingerprint::new("default", 1, "planner", "test/model", messages, ctx)
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let a = json!({"b": 1, "a": {"z": [1, {"y": 2, "x": 1}], "k": null}});
        assert_eq!(
            canonical_json(&a),
            r#"{"a":{"k":null,"z":[1,{"x":1,"y":2}]},"b":1}"#
        );
    }

    #[test]
    fn test_fingerprint_ignores_key_order_and_line_endings() {
        let m1 = vec![Message::user("line one\r\nline two   \n")];
        let m2 = vec![Message::user("line one\nline two")];
        let c1 = json!({"limits": {"max": 3, "min": 1}, "tone": "plain"});
        let c2 = json!({"tone": "plain", "limits": {"min": 1, "max": 3}});
        assert_eq!(fp(&m1, &c1), fp(&m2, &c2));
    }

    #[test]
    fn test_fingerprint_separates_fields() {
        let msgs = vec![Message::user("hello")];
        let ctx = json!({});
        let base = fp(&msgs, &ctx);

        let other_pass = Fingerprint::new("default", 1, "solver", "test/model", &msgs, &ctx);
        let other_version = Fingerprint::new("default", 2, "planner", "test/model", &msgs, &ctx);
        let other_role = fp(&[Message::system("hello")], &ctx);
        let other_ctx = fp(&msgs, &json!({"a": 1}));

        assert_ne!(base.key_hash, other_pass.key_hash);
        assert_ne!(base.key_hash, other_version.key_hash);
        assert_ne!(base.key_hash, other_role.key_hash);
        assert_ne!(base.key_hash, other_ctx.key_hash);
    }

    #[tokio::test]
    async fn test_memory_cache_ttl_and_invalidate() {
        let cache = MemoryResponseCache::new();
        let key = fp(&[Message::user("q")], &json!({}));
        let value = CachedResponse {
            payload: "{}".into(),
            model: "m".into(),
            input_tokens: 1,
            output_tokens: 2,
            cost_nanodollars: 3,
        };

        cache
            .put(&key, &value, Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(cache.get(&key).await.unwrap(), Some(value.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get(&key).await.unwrap(), None);

        cache.put(&key, &value, Duration::from_secs(60)).await.unwrap();
        assert!(cache.invalidate(&key).await.unwrap());
        assert!(!cache.invalidate(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_ttl_bypasses_cache() {
        let backend = Arc::new(MemoryResponseCache::new());
        let store = CacheStore::new(backend.clone());
        let key = fp(&[Message::user("q")], &json!({}));

        let lookup = store
            .get_or_compute(&key, Some(Duration::ZERO), &CancellationToken::new(), || async {
                Ok::<_, LookupCancelled>(CachedResponse {
                    payload: "{}".into(),
                    model: "m".into(),
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_nanodollars: 0,
                })
            })
            .await
            .unwrap();
        assert!(!lookup.hit);
        assert!(backend.is_empty());
    }
    #[tokio::test]
    async fn test_waiter_gives_up_when_cancelled() {
        let store = CacheStore::new(Arc::new(MemoryResponseCache::new()));
        let key = fp(&[Message::user("slow")], &json!({}));
        let ttl = Some(Duration::from_secs(60));

        let leader = {
            let (store, key) = (store.clone(), key.clone());
            tokio::spawn(async move {
                store
                    .get_or_compute(&key, ttl, &CancellationToken::new(), || async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok::<_, LookupCancelled>(CachedResponse {
                            payload: "{}".into(),
                            model: "m".into(),
                            input_tokens: 1,
                            output_tokens: 1,
                            cost_nanodollars: 1,
                        })
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let waited = store
            .get_or_compute(&key, ttl, &cancel, || async {
                Ok::<_, LookupCancelled>(CachedResponse {
                    payload: "waiter".into(),
                    model: "m".into(),
                    input_tokens: 0,
                    output_tokens: 0,
                    cost_nanodollars: 0,
                })
            })
            .await;
        assert_eq!(waited.unwrap_err(), LookupCancelled);
        assert!(started.elapsed() < Duration::from_millis(200));

        assert!(!leader.await.unwrap().unwrap().hit);
        assert_eq!(store.inflight_len(), 0);
    }
}
