//! Durable run records: runs, passes, artifacts, checks.
//!
//! Same layout as the ledger: one SQLite connection behind a mutex, a
//! single-permit semaphore, and every statement run on the blocking pool.

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::model::{
    Artifact, Check, Pass, PassId, PassStatus, PassType, Run, RunId, RunStatus, RunView, Usage,
};
use crate::cache::now_ms;
use crate::ledger::LedgerError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store closed")]
    Closed,
    #[error("task join error: {0}")]
    Join(String),
    #[error("run {0} not found")]
    NotFound(RunId),
    #[error("{0}")]
    Conflict(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Terminal state written once when a run settles.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFinish {
    pub status: RunStatus,
    pub final_output: Option<String>,
    pub verify_score: Option<f64>,
    pub degraded: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

/// Settled state of one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassCompletion {
    pub status: PassStatus,
    pub usage: Usage,
    pub cached: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn set_run_status(&self, run_id: RunId, status: RunStatus) -> Result<(), StoreError>;

    async fn finish_run(&self, run_id: RunId, finish: RunFinish) -> Result<(), StoreError>;

    async fn insert_pass(&self, pass: &Pass) -> Result<(), StoreError>;

    /// Settle a running pass. A pass that already settled is a conflict.
    async fn complete_pass(&self, pass_id: PassId, done: PassCompletion) -> Result<(), StoreError>;

    async fn insert_artifacts(&self, artifacts: &[Artifact]) -> Result<(), StoreError>;

    /// Persist the verifier's checks. At most one may be the winner.
    async fn insert_checks(&self, checks: &[Check]) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError>;

    /// Run with its passes, artifacts and checks. `total_cost_nanodollars`
    /// sums the stored pass usage; callers with a ledger should prefer it.
    async fn get_view(&self, run_id: RunId) -> Result<RunView, StoreError>;

    /// Most recent runs first.
    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteRunStore {
    conn: Arc<Mutex<Connection>>,
    sem: Arc<Semaphore>,
}

impl SqliteRunStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             PRAGMA busy_timeout=5000;\
             PRAGMA foreign_keys=ON;\
             CREATE TABLE IF NOT EXISTS runs (\
               id TEXT PRIMARY KEY,\
               lane_id TEXT NOT NULL,\
               lane_version INTEGER NOT NULL,\
               goal TEXT NOT NULL,\
               context TEXT NOT NULL,\
               status TEXT NOT NULL,\
               final_output TEXT,\
               verify_score REAL,\
               degraded INTEGER NOT NULL DEFAULT 0,\
               error_code TEXT,\
               error_message TEXT,\
               created_at_ms INTEGER NOT NULL,\
               completed_at_ms INTEGER \
             );\
             CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at_ms);\
             CREATE TABLE IF NOT EXISTS passes (\
               id TEXT PRIMARY KEY,\
               run_id TEXT NOT NULL REFERENCES runs(id),\
               pass_type TEXT NOT NULL,\
               candidate_index INTEGER,\
               status TEXT NOT NULL,\
               model TEXT NOT NULL,\
               input_tokens INTEGER NOT NULL DEFAULT 0,\
               output_tokens INTEGER NOT NULL DEFAULT 0,\
               cost_nanodollars INTEGER NOT NULL DEFAULT 0,\
               cached INTEGER NOT NULL DEFAULT 0,\
               output TEXT,\
               error TEXT,\
               created_at_ms INTEGER NOT NULL,\
               completed_at_ms INTEGER \
             );\
             CREATE INDEX IF NOT EXISTS idx_passes_run ON passes(run_id);\
             CREATE TABLE IF NOT EXISTS artifacts (\
               id TEXT PRIMARY KEY,\
               run_id TEXT NOT NULL REFERENCES runs(id),\
               pass_id TEXT NOT NULL REFERENCES passes(id),\
               content TEXT NOT NULL,\
               source TEXT NOT NULL,\
               rank INTEGER NOT NULL \
             );\
             CREATE INDEX IF NOT EXISTS idx_artifacts_run ON artifacts(run_id);\
             CREATE TABLE IF NOT EXISTS checks (\
               id TEXT PRIMARY KEY,\
               run_id TEXT NOT NULL REFERENCES runs(id),\
               candidate_pass_id TEXT NOT NULL REFERENCES passes(id),\
               candidate_index INTEGER NOT NULL,\
               score REAL NOT NULL,\
               passed INTEGER NOT NULL,\
               is_winner INTEGER NOT NULL,\
               rationale TEXT NOT NULL,\
               UNIQUE(run_id, candidate_pass_id) \
             );\
             CREATE UNIQUE INDEX IF NOT EXISTS idx_checks_one_winner \
               ON checks(run_id) WHERE is_winner = 1;",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            sem: Arc::new(Semaphore::new(1)),
        })
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError>,
    {
        let mut guard = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self.sem.acquire().await.map_err(|_| StoreError::Closed)?;
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

const RUN_COLUMNS: &str = "id, lane_id, lane_version, goal, context, status, final_output, \
     verify_score, degraded, error_code, error_message, created_at_ms, completed_at_ms";

const PASS_COLUMNS: &str = "id, run_id, pass_type, candidate_index, status, model, \
     input_tokens, output_tokens, cost_nanodollars, cached, output, error, created_at_ms, \
     completed_at_ms";

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn create_run(&self, run: &Run) -> Result<(), StoreError> {
        let run = run.clone();
        let context = serde_json::to_string(&run.context)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO runs (id, lane_id, lane_version, goal, context, status, \
                 degraded, created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    run.id.to_string(),
                    run.lane_id,
                    run.lane_version as i64,
                    run.goal,
                    context,
                    run.status.as_str(),
                    run.degraded as i64,
                    run.created_at_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_run_status(&self, run_id: RunId, status: RunStatus) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE runs SET status = ?2 WHERE id = ?1",
                params![run_id.to_string(), status.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(run_id));
            }
            Ok(())
        })
        .await
    }

    async fn finish_run(&self, run_id: RunId, finish: RunFinish) -> Result<(), StoreError> {
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE runs SET status = ?2, final_output = ?3, verify_score = ?4, \
                 degraded = ?5, error_code = ?6, error_message = ?7, completed_at_ms = ?8 \
                 WHERE id = ?1 AND completed_at_ms IS NULL",
                params![
                    run_id.to_string(),
                    finish.status.as_str(),
                    finish.final_output,
                    finish.verify_score,
                    finish.degraded as i64,
                    finish.error_code,
                    finish.error_message,
                    now_ms(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict(format!("run {run_id} already finished")));
            }
            Ok(())
        })
        .await
    }

    async fn insert_pass(&self, pass: &Pass) -> Result<(), StoreError> {
        let pass = pass.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO passes (id, run_id, pass_type, candidate_index, status, model, \
                 created_at_ms) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    pass.id.to_string(),
                    pass.run_id.to_string(),
                    pass.pass_type.as_str(),
                    pass.candidate_index.map(|i| i as i64),
                    pass.status.as_str(),
                    pass.model,
                    pass.created_at_ms,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn complete_pass(&self, pass_id: PassId, done: PassCompletion) -> Result<(), StoreError> {
        if done.status == PassStatus::Running {
            return Err(StoreError::Conflict("cannot complete a pass as running".into()));
        }
        let output = done.output.as_ref().map(serde_json::to_string).transpose()?;
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE passes SET status = ?2, input_tokens = ?3, output_tokens = ?4, \
                 cost_nanodollars = ?5, cached = ?6, output = ?7, error = ?8, \
                 completed_at_ms = ?9 WHERE id = ?1 AND status = 'running'",
                params![
                    pass_id.to_string(),
                    done.status.as_str(),
                    done.usage.input_tokens as i64,
                    done.usage.output_tokens as i64,
                    done.usage.cost_nanodollars,
                    done.cached as i64,
                    output,
                    done.error,
                    now_ms(),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Conflict(format!(
                    "pass {pass_id} is not running"
                )));
            }
            Ok(())
        })
        .await
    }

    async fn insert_artifacts(&self, artifacts: &[Artifact]) -> Result<(), StoreError> {
        let artifacts = artifacts.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO artifacts (id, run_id, pass_id, content, source, rank) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )?;
                for a in &artifacts {
                    stmt.execute(params![
                        a.id.to_string(),
                        a.run_id.to_string(),
                        a.pass_id.to_string(),
                        a.content,
                        a.source,
                        a.rank as i64,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn insert_checks(&self, checks: &[Check]) -> Result<(), StoreError> {
        if checks.iter().filter(|c| c.is_winner).count() > 1 {
            return Err(StoreError::Conflict("more than one winning check".into()));
        }
        let checks = checks.to_vec();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO checks (id, run_id, candidate_pass_id, candidate_index, \
                     score, passed, is_winner, rationale) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;
                for c in &checks {
                    stmt.execute(params![
                        c.id.to_string(),
                        c.run_id.to_string(),
                        c.candidate_pass_id.to_string(),
                        c.candidate_index as i64,
                        c.score,
                        c.passed as i64,
                        c.is_winner as i64,
                        c.rationale,
                    ])?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError> {
        self.blocking(move |conn| load_run(conn, run_id)).await
    }

    async fn get_view(&self, run_id: RunId) -> Result<RunView, StoreError> {
        self.blocking(move |conn| {
            let run = load_run(conn, run_id)?;
            let id = run_id.to_string();

            let mut stmt = conn.prepare(&format!(
                "SELECT {PASS_COLUMNS} FROM passes WHERE run_id = ?1 \
                 ORDER BY created_at_ms, rowid"
            ))?;
            let mut rows = stmt.query([&id])?;
            let mut passes = Vec::new();
            while let Some(row) = rows.next()? {
                passes.push(row_to_pass(row)?);
            }

            let mut stmt = conn.prepare(
                "SELECT id, run_id, pass_id, content, source, rank FROM artifacts \
                 WHERE run_id = ?1 ORDER BY rowid",
            )?;
            let mut rows = stmt.query([&id])?;
            let mut artifacts = Vec::new();
            while let Some(row) = rows.next()? {
                artifacts.push(Artifact {
                    id: parse_uuid(row.get(0)?)?,
                    run_id: parse_uuid(row.get(1)?)?,
                    pass_id: parse_uuid(row.get(2)?)?,
                    content: row.get(3)?,
                    source: row.get(4)?,
                    rank: row.get::<_, i64>(5)? as u32,
                });
            }

            let mut stmt = conn.prepare(
                "SELECT id, run_id, candidate_pass_id, candidate_index, score, passed, \
                 is_winner, rationale FROM checks WHERE run_id = ?1 ORDER BY candidate_index",
            )?;
            let mut rows = stmt.query([&id])?;
            let mut checks = Vec::new();
            while let Some(row) = rows.next()? {
                checks.push(Check {
                    id: parse_uuid(row.get(0)?)?,
                    run_id: parse_uuid(row.get(1)?)?,
                    candidate_pass_id: parse_uuid(row.get(2)?)?,
                    candidate_index: row.get::<_, i64>(3)? as u32,
                    score: row.get(4)?,
                    passed: row.get::<_, i64>(5)? != 0,
                    is_winner: row.get::<_, i64>(6)? != 0,
                    rationale: row.get(7)?,
                });
            }

            let total_cost_nanodollars = passes.iter().map(|p| p.usage.cost_nanodollars).sum();
            Ok(RunView {
                run,
                passes,
                artifacts,
                checks,
                total_cost_nanodollars,
            })
        })
        .await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>, StoreError> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {RUN_COLUMNS} FROM runs ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1"
            ))?;
            let mut rows = stmt.query([limit as i64])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_run(row)?);
            }
            Ok(out)
        })
        .await
    }
}

fn load_run(conn: &Connection, run_id: RunId) -> Result<Run, StoreError> {
    let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1");
    let mut stmt = conn.prepare(&sql)?;
    let run = stmt
        .query_row([run_id.to_string()], |row| Ok(row_to_run(row)))
        .optional()?;
    run.ok_or(StoreError::NotFound(run_id))?
}

fn parse_uuid(raw: String) -> Result<Uuid, StoreError> {
    Uuid::parse_str(&raw).map_err(|e| StoreError::Corrupt(format!("bad uuid {raw}: {e}")))
}

fn row_to_run(row: &rusqlite::Row<'_>) -> Result<Run, StoreError> {
    let status: String = row.get(5)?;
    let context: String = row.get(4)?;
    Ok(Run {
        id: parse_uuid(row.get(0)?)?,
        lane_id: row.get(1)?,
        lane_version: row.get::<_, i64>(2)? as u32,
        goal: row.get(3)?,
        context: serde_json::from_str(&context)?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown run status {status}")))?,
        final_output: row.get(6)?,
        verify_score: row.get(7)?,
        degraded: row.get::<_, i64>(8)? != 0,
        error_code: row.get(9)?,
        error_message: row.get(10)?,
        created_at_ms: row.get(11)?,
        completed_at_ms: row.get(12)?,
    })
}

fn row_to_pass(row: &rusqlite::Row<'_>) -> Result<Pass, StoreError> {
    let pass_type: String = row.get(2)?;
    let status: String = row.get(4)?;
    let output: Option<String> = row.get(10)?;
    Ok(Pass {
        id: parse_uuid(row.get(0)?)?,
        run_id: parse_uuid(row.get(1)?)?,
        pass_type: PassType::parse(&pass_type)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown pass type {pass_type}")))?,
        candidate_index: row.get::<_, Option<i64>>(3)?.map(|i| i as u32),
        status: PassStatus::parse(&status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown pass status {status}")))?,
        model: row.get(5)?,
        usage: Usage {
            input_tokens: row.get::<_, i64>(6)? as u32,
            output_tokens: row.get::<_, i64>(7)? as u32,
            cost_nanodollars: row.get(8)?,
        },
        cached: row.get::<_, i64>(9)? != 0,
        output: output.as_deref().map(serde_json::from_str).transpose()?,
        error: row.get(11)?,
        created_at_ms: row.get(12)?,
        completed_at_ms: row.get(13)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_run() -> Run {
        Run {
            id: Uuid::new_v4(),
            lane_id: "default".into(),
            lane_version: 1,
            goal: "Summarize the incident".into(),
            context: json!({"ticket": 7}),
            status: RunStatus::Pending,
            final_output: None,
            verify_score: None,
            degraded: false,
            error_code: None,
            error_message: None,
            created_at_ms: now_ms(),
            completed_at_ms: None,
        }
    }

    fn sample_pass(run_id: RunId, pass_type: PassType, candidate: Option<u32>) -> Pass {
        Pass {
            id: Uuid::new_v4(),
            run_id,
            pass_type,
            candidate_index: candidate,
            status: PassStatus::Running,
            model: "openai/gpt-4o-mini".into(),
            usage: Usage::default(),
            cached: false,
            output: None,
            error: None,
            created_at_ms: now_ms(),
            completed_at_ms: None,
        }
    }

    fn completed(cost: i64) -> PassCompletion {
        PassCompletion {
            status: PassStatus::Completed,
            usage: Usage {
                input_tokens: 100,
                output_tokens: 50,
                cost_nanodollars: cost,
            },
            cached: false,
            output: Some(json!({"solution": "ok"})),
            error: None,
        }
    }

    #[tokio::test]
    async fn test_run_lifecycle_round_trips() {
        let store = SqliteRunStore::in_memory().unwrap();
        let run = sample_run();
        store.create_run(&run).await.unwrap();
        store.set_run_status(run.id, RunStatus::Planning).await.unwrap();

        let pass = sample_pass(run.id, PassType::Planner, None);
        store.insert_pass(&pass).await.unwrap();
        store.complete_pass(pass.id, completed(900)).await.unwrap();

        store
            .finish_run(
                run.id,
                RunFinish {
                    status: RunStatus::Completed,
                    final_output: Some("answer".into()),
                    verify_score: Some(0.9),
                    degraded: false,
                    error_code: None,
                    error_message: None,
                },
            )
            .await
            .unwrap();

        let view = store.get_view(run.id).await.unwrap();
        assert_eq!(view.run.status, RunStatus::Completed);
        assert_eq!(view.run.context, json!({"ticket": 7}));
        assert!(view.run.completed_at_ms.is_some());
        assert_eq!(view.passes.len(), 1);
        assert_eq!(view.passes[0].status, PassStatus::Completed);
        assert_eq!(view.passes[0].output, Some(json!({"solution": "ok"})));
        assert_eq!(view.total_cost_nanodollars, 900);
    }

    #[tokio::test]
    async fn test_rows_must_reference_existing_parents() {
        let store = SqliteRunStore::in_memory().unwrap();
        let orphan = sample_pass(Uuid::new_v4(), PassType::Planner, None);
        assert!(matches!(
            store.insert_pass(&orphan).await,
            Err(StoreError::Sqlite(_))
        ));

        let run = sample_run();
        store.create_run(&run).await.unwrap();
        let check = Check {
            id: Uuid::new_v4(),
            run_id: run.id,
            candidate_pass_id: Uuid::new_v4(),
            candidate_index: 0,
            score: 0.5,
            passed: true,
            is_winner: false,
            rationale: "no such pass".into(),
        };
        assert!(store.insert_checks(&[check]).await.is_err());
    }

    #[tokio::test]
    async fn test_settled_pass_is_immutable() {
        let store = SqliteRunStore::in_memory().unwrap();
        let run = sample_run();
        store.create_run(&run).await.unwrap();
        let pass = sample_pass(run.id, PassType::Solver, Some(0));
        store.insert_pass(&pass).await.unwrap();
        store.complete_pass(pass.id, completed(10)).await.unwrap();

        let err = store.complete_pass(pass.id, completed(20)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        let view = store.get_view(run.id).await.unwrap();
        assert_eq!(view.passes[0].usage.cost_nanodollars, 10);
    }

    #[tokio::test]
    async fn test_single_winner_enforced() {
        let store = SqliteRunStore::in_memory().unwrap();
        let run = sample_run();
        store.create_run(&run).await.unwrap();

        let mut checks = Vec::new();
        for i in 0..2 {
            let pass = sample_pass(run.id, PassType::Solver, Some(i));
            store.insert_pass(&pass).await.unwrap();
            checks.push(Check {
                id: Uuid::new_v4(),
                run_id: run.id,
                candidate_pass_id: pass.id,
                candidate_index: i,
                score: 0.8,
                passed: true,
                is_winner: true,
                rationale: "fine".into(),
            });
        }
        assert!(store.insert_checks(&checks).await.is_err());

        checks[1].is_winner = false;
        store.insert_checks(&checks).await.unwrap();
        let view = store.get_view(run.id).await.unwrap();
        assert_eq!(view.checks.len(), 2);
        assert_eq!(view.winner().map(|c| c.candidate_index), Some(0));
    }

    #[tokio::test]
    async fn test_finish_is_written_once() {
        let store = SqliteRunStore::in_memory().unwrap();
        let run = sample_run();
        store.create_run(&run).await.unwrap();
        let cancelled = RunFinish {
            status: RunStatus::Cancelled,
            final_output: None,
            verify_score: None,
            degraded: false,
            error_code: Some("CANCELLED".into()),
            error_message: None,
        };
        store.finish_run(run.id, cancelled.clone()).await.unwrap();
        assert!(store.finish_run(run.id, cancelled).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_run_and_listing() {
        let store = SqliteRunStore::in_memory().unwrap();
        assert!(matches!(
            store.get_run(Uuid::new_v4()).await,
            Err(StoreError::NotFound(_))
        ));

        for _ in 0..3 {
            store.create_run(&sample_run()).await.unwrap();
        }
        assert_eq!(store.list_runs(2).await.unwrap().len(), 2);
        assert_eq!(store.list_runs(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_artifacts_keep_rank() {
        let store = SqliteRunStore::in_memory().unwrap();
        let run = sample_run();
        store.create_run(&run).await.unwrap();
        let pass = sample_pass(run.id, PassType::EvidenceReranker, None);
        store.insert_pass(&pass).await.unwrap();
        let artifacts: Vec<Artifact> = (0..3)
            .map(|rank| Artifact {
                id: Uuid::new_v4(),
                run_id: run.id,
                pass_id: pass.id,
                content: format!("snippet {rank}"),
                source: "runbook.md".into(),
                rank,
            })
            .collect();
        store.insert_artifacts(&artifacts).await.unwrap();
        let view = store.get_view(run.id).await.unwrap();
        let ranks: Vec<u32> = view.artifacts.iter().map(|a| a.rank).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
    }
}
