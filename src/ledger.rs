//! Append-only cost ledger: one entry per settled pass.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::gateway::estimate_call_cost;
use crate::run::model::{PassId, PassType, RunId, Usage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketPeriod {
    Hour,
    Day,
    Month,
}

impl BucketPeriod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Month => "month",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "month" => Some(Self::Month),
            _ => None,
        }
    }

    /// UTC bucket key: `2026-10-19T13`, `2026-10-19` or `2026-10`.
    pub fn bucket_key(self, at: DateTime<Utc>) -> String {
        match self {
            Self::Hour => at.format("%Y-%m-%dT%H").to_string(),
            Self::Day => at.format("%Y-%m-%d").to_string(),
            Self::Month => at.format("%Y-%m").to_string(),
        }
    }

    pub fn bucket_key_ms(self, at_ms: i64) -> String {
        let at = Utc
            .timestamp_millis_opt(at_ms)
            .single()
            .unwrap_or_else(Utc::now);
        self.bucket_key(at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub pass_id: PassId,
    pub run_id: RunId,
    pub lane_id: String,
    pub pass_type: PassType,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    /// Served from the response cache; cost is zero.
    pub cached: bool,
    /// Hour bucket the entry was recorded in.
    pub bucket: String,
    pub recorded_at_ms: i64,
}

impl LedgerEntry {
    pub fn new(
        pass_id: PassId,
        run_id: RunId,
        lane_id: &str,
        pass_type: PassType,
        model: &str,
        usage: Usage,
        cached: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            pass_id,
            run_id,
            lane_id: lane_id.to_string(),
            pass_type,
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost_nanodollars: usage.cost_nanodollars,
            cached,
            bucket: BucketPeriod::Hour.bucket_key(now),
            recorded_at_ms: now.timestamp_millis(),
        }
    }
}

/// Sums over a run's entries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub entries: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

impl RunTotals {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// One row of the bucketed report consumed by budget dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAggregate {
    pub bucket: String,
    pub lane_id: String,
    pub passes: u64,
    pub cached_passes: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ledger lock poisoned")]
    Poisoned,
    #[error("ledger closed")]
    Closed,
    #[error("task join error: {0}")]
    Join(String),
    #[error("pass {0} already has a ledger entry")]
    Duplicate(PassId),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

#[async_trait]
pub trait CostLedger: Send + Sync {
    /// Append one entry. A second entry for the same pass is rejected.
    async fn append(&self, entry: LedgerEntry) -> Result<(), LedgerError>;

    async fn entries_for_run(&self, run_id: RunId) -> Result<Vec<LedgerEntry>, LedgerError>;

    async fn run_total(&self, run_id: RunId) -> Result<RunTotals, LedgerError> {
        Ok(totals(&self.entries_for_run(run_id).await?))
    }

    /// Per-bucket, per-lane sums, newest bucket first.
    async fn aggregate(
        &self,
        period: BucketPeriod,
        lane_id: Option<&str>,
    ) -> Result<Vec<LedgerAggregate>, LedgerError>;
}

pub fn totals(entries: &[LedgerEntry]) -> RunTotals {
    entries.iter().fold(RunTotals::default(), |mut t, e| {
        t.entries += 1;
        t.input_tokens += e.input_tokens as u64;
        t.output_tokens += e.output_tokens as u64;
        t.cost_nanodollars = t.cost_nanodollars.saturating_add(e.cost_nanodollars);
        t
    })
}

fn aggregate_entries<'a>(
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
    period: BucketPeriod,
) -> Vec<LedgerAggregate> {
    let mut groups: BTreeMap<(String, String), LedgerAggregate> = BTreeMap::new();
    for e in entries {
        let bucket = period.bucket_key_ms(e.recorded_at_ms);
        let row = groups
            .entry((bucket.clone(), e.lane_id.clone()))
            .or_insert_with(|| LedgerAggregate {
                bucket,
                lane_id: e.lane_id.clone(),
                passes: 0,
                cached_passes: 0,
                input_tokens: 0,
                output_tokens: 0,
                cost_nanodollars: 0,
            });
        row.passes += 1;
        if e.cached {
            row.cached_passes += 1;
        }
        row.input_tokens += e.input_tokens as u64;
        row.output_tokens += e.output_tokens as u64;
        row.cost_nanodollars = row.cost_nanodollars.saturating_add(e.cost_nanodollars);
    }
    // Newest bucket first, lanes alphabetical within a bucket.
    let mut rows: Vec<LedgerAggregate> = groups.into_values().collect();
    rows.sort_by(|a, b| b.bucket.cmp(&a.bucket).then_with(|| a.lane_id.cmp(&b.lane_id)));
    rows
}

// =============================================================================
// Budget projection
// =============================================================================

/// A call a stage is about to make, sized at its worst case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedCall {
    pub model: String,
    pub input_tokens: u32,
    pub max_output_tokens: u32,
}

impl ProjectedCall {
    pub fn cost(&self) -> i64 {
        estimate_call_cost(&self.model, self.input_tokens, self.max_output_tokens)
    }

    pub fn tokens(&self) -> u64 {
        self.input_tokens as u64 + self.max_output_tokens as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetBreach {
    #[error("projected cost {projected} nanodollars exceeds budget {cap}")]
    Cost { projected: i64, cap: i64 },
    #[error("projected {projected} tokens exceeds token cap {cap}")]
    Tokens { projected: u64, cap: u64 },
}

/// Fail if spending so far plus the stage's worst case would cross either cap.
pub fn project_budget(
    spent: &RunTotals,
    calls: &[ProjectedCall],
    budget_nanodollars: Option<i64>,
    token_cap: Option<u64>,
) -> Result<(), BudgetBreach> {
    if let Some(cap) = budget_nanodollars {
        let projected = calls
            .iter()
            .fold(spent.cost_nanodollars, |acc, c| acc.saturating_add(c.cost()));
        if projected > cap {
            return Err(BudgetBreach::Cost { projected, cap });
        }
    }
    if let Some(cap) = token_cap {
        let projected = calls
            .iter()
            .fold(spent.total_tokens(), |acc, c| acc.saturating_add(c.tokens()));
        if projected > cap {
            return Err(BudgetBreach::Tokens { projected, cap });
        }
    }
    Ok(())
}

// =============================================================================
// SQLite backend
// =============================================================================

#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
    sem: Arc<Semaphore>,
}

impl SqliteLedger {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;\
             CREATE TABLE IF NOT EXISTS ledger_entries (\
               pass_id TEXT PRIMARY KEY,\
               run_id TEXT NOT NULL,\
               lane_id TEXT NOT NULL,\
               pass_type TEXT NOT NULL,\
               model TEXT NOT NULL,\
               input_tokens INTEGER NOT NULL,\
               output_tokens INTEGER NOT NULL,\
               cost_nanodollars INTEGER NOT NULL,\
               cached INTEGER NOT NULL,\
               bucket TEXT NOT NULL,\
               recorded_at_ms INTEGER NOT NULL \
             );\
             CREATE INDEX IF NOT EXISTS idx_ledger_run ON ledger_entries(run_id);\
             CREATE INDEX IF NOT EXISTS idx_ledger_lane_time ON ledger_entries(lane_id, recorded_at_ms);",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<R, LedgerError>,
    {
        let guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<R, LedgerError> + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self.sem.acquire().await.map_err(|_| LedgerError::Closed)?;
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.with_conn(f))
            .await
            .map_err(|e| LedgerError::Join(e.to_string()))?
    }

    fn query_entries(
        conn: &Connection,
        sql: &str,
        args: &[&dyn rusqlite::ToSql],
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(args)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(row_to_entry(row)?);
        }
        Ok(out)
    }
}

const ENTRY_COLUMNS: &str = "pass_id, run_id, lane_id, pass_type, model, input_tokens, \
     output_tokens, cost_nanodollars, cached, bucket, recorded_at_ms";

#[async_trait]
impl CostLedger for SqliteLedger {
    async fn append(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        self.blocking(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO ledger_entries (pass_id, run_id, lane_id, pass_type, model, \
                 input_tokens, output_tokens, cost_nanodollars, cached, bucket, recorded_at_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
                 ON CONFLICT(pass_id) DO NOTHING",
                params![
                    entry.pass_id.to_string(),
                    entry.run_id.to_string(),
                    entry.lane_id,
                    entry.pass_type.as_str(),
                    entry.model,
                    entry.input_tokens as i64,
                    entry.output_tokens as i64,
                    entry.cost_nanodollars,
                    entry.cached as i64,
                    entry.bucket,
                    entry.recorded_at_ms,
                ],
            )?;
            if inserted == 0 {
                return Err(LedgerError::Duplicate(entry.pass_id));
            }
            Ok(())
        })
        .await
    }

    async fn entries_for_run(&self, run_id: RunId) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.blocking(move |conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE run_id = ?1 \
                 ORDER BY recorded_at_ms, rowid"
            );
            Self::query_entries(conn, &sql, &[&run_id.to_string()])
        })
        .await
    }

    async fn aggregate(
        &self,
        period: BucketPeriod,
        lane_id: Option<&str>,
    ) -> Result<Vec<LedgerAggregate>, LedgerError> {
        let lane_id = lane_id.map(str::to_string);
        let entries = self
            .blocking(move |conn| match lane_id {
                Some(lane) => Self::query_entries(
                    conn,
                    &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries WHERE lane_id = ?1"),
                    &[&lane],
                ),
                None => Self::query_entries(
                    conn,
                    &format!("SELECT {ENTRY_COLUMNS} FROM ledger_entries"),
                    &[],
                ),
            })
            .await?;
        Ok(aggregate_entries(&entries, period))
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> Result<LedgerEntry, LedgerError> {
    let parse_id = |raw: String| {
        Uuid::parse_str(&raw).map_err(|e| LedgerError::Corrupt(format!("bad uuid {raw}: {e}")))
    };
    let pass_type: String = row.get(3)?;
    Ok(LedgerEntry {
        pass_id: parse_id(row.get(0)?)?,
        run_id: parse_id(row.get(1)?)?,
        lane_id: row.get(2)?,
        pass_type: PassType::parse(&pass_type)
            .ok_or_else(|| LedgerError::Corrupt(format!("unknown pass type {pass_type}")))?,
        model: row.get(4)?,
        input_tokens: row.get::<_, i64>(5)? as u32,
        output_tokens: row.get::<_, i64>(6)? as u32,
        cost_nanodollars: row.get(7)?,
        cached: row.get::<_, i64>(8)? != 0,
        bucket: row.get(9)?,
        recorded_at_ms: row.get(10)?,
    })
}

// =============================================================================
// Memory backend
// =============================================================================

#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry in append order.
    pub fn all(&self) -> Vec<LedgerEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CostLedger for MemoryLedger {
    async fn append(&self, entry: LedgerEntry) -> Result<(), LedgerError> {
        let mut entries = self.entries.lock().map_err(|_| LedgerError::Poisoned)?;
        if entries.iter().any(|e| e.pass_id == entry.pass_id) {
            return Err(LedgerError::Duplicate(entry.pass_id));
        }
        entries.push(entry);
        Ok(())
    }

    async fn entries_for_run(&self, run_id: RunId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let entries = self.entries.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(entries.iter().filter(|e| e.run_id == run_id).cloned().collect())
    }

    async fn aggregate(
        &self,
        period: BucketPeriod,
        lane_id: Option<&str>,
    ) -> Result<Vec<LedgerAggregate>, LedgerError> {
        let entries = self.entries.lock().map_err(|_| LedgerError::Poisoned)?;
        Ok(aggregate_entries(
            entries
                .iter()
                .filter(|e| lane_id.map_or(true, |lane| e.lane_id == lane)),
            period,
        ))
    }
}
