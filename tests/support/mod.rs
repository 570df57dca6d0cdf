#![allow(dead_code)]

//! Scripted gateway and harness builders shared by integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use quorum_harness::cache::{CacheStore, MemoryResponseCache};
use quorum_harness::config::RunSettings;
use quorum_harness::gateway::{
    chat_cost, ChatGateway, ChatRequest, ChatResponse, FinishReason, ProviderError,
};
use quorum_harness::lanes::{LaneConfig, LaneRegistry, PassModels, PassTokenLimits};
use quorum_harness::ledger::{CostLedger, MemoryLedger};
use quorum_harness::run::{Orchestrator, RunEvent, RunView, Services, SqliteRunStore};

pub const INPUT_TOKENS: u32 = 100;
pub const OUTPUT_TOKENS: u32 = 50;

/// One request as the scripted gateway saw it.
#[derive(Debug, Clone)]
pub struct Call {
    /// Pass name without the `pass::` prefix, e.g. `solver`.
    pub pass: String,
    pub candidate: Option<u32>,
    /// 1-based attempt count per (pass, candidate) across the gateway's life.
    pub attempt: u32,
    pub prompt: String,
    pub model: String,
}

pub enum Reply {
    Json(Value),
    Raw(String),
    /// Non-retryable provider rejection.
    Permanent,
    /// Retryable upstream failure.
    Transient,
    /// Never answers; resolves only when the call is cancelled.
    Hang,
    Delayed(Duration, Box<Reply>),
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub pass: String,
    pub candidate: Option<u32>,
    pub started: Instant,
    pub ended: Instant,
}

type Script = dyn Fn(&Call) -> Reply + Send + Sync;

pub struct ScriptedGateway {
    script: Box<Script>,
    attempts: Mutex<HashMap<(String, Option<u32>), u32>>,
    log: Mutex<Vec<LogEntry>>,
}

impl ScriptedGateway {
    pub fn new(script: impl Fn(&Call) -> Reply + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            script: Box::new(script),
            attempts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    /// Every pass answers with [`default_reply`].
    pub fn well_behaved() -> Arc<Self> {
        Self::new(default_reply)
    }

    pub fn log(&self) -> Vec<LogEntry> {
        self.log.lock().unwrap().clone()
    }

    /// Settled calls for `pass`, cancelled ones included.
    pub fn calls(&self, pass: &str) -> usize {
        self.log().iter().filter(|e| e.pass == pass).count()
    }

    fn record(&self, call: &Call, started: Instant) {
        self.log.lock().unwrap().push(LogEntry {
            pass: call.pass.clone(),
            candidate: call.candidate,
            started,
            ended: Instant::now(),
        });
    }
}

async fn resolve(reply: Reply, cancel: &CancellationToken) -> Result<String, ProviderError> {
    let mut reply = reply;
    loop {
        match reply {
            Reply::Json(value) => return Ok(value.to_string()),
            Reply::Raw(text) => return Ok(text),
            Reply::Permanent => {
                return Err(ProviderError::invalid_request("model not available"))
            }
            Reply::Transient => {
                return Err(ProviderError::provider("scripted", "upstream 503", true))
            }
            Reply::Hang => {
                cancel.cancelled().await;
                return Err(ProviderError::Cancelled);
            }
            Reply::Delayed(delay, inner) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                    _ = tokio::time::sleep(delay) => reply = *inner,
                }
            }
        }
    }
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn chat(
        &self,
        req: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();
        let pass = req
            .attribution
            .caller
            .trim_start_matches("pass::")
            .to_string();
        let candidate = req.attribution.candidate_index;
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry((pass.clone(), candidate)).or_insert(0);
            *n += 1;
            *n
        };
        let call = Call {
            pass,
            candidate,
            attempt,
            prompt: req
                .messages
                .iter()
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
            model: req.model.model_id().to_string(),
        };

        let result = resolve((self.script)(&call), cancel).await;
        self.record(&call, started);
        let content = result?;
        Ok(ChatResponse {
            content,
            model: call.model.clone(),
            input_tokens: INPUT_TOKENS,
            output_tokens: OUTPUT_TOKENS,
            cost_nanodollars: chat_cost(&call.model, INPUT_TOKENS, OUTPUT_TOKENS),
            upstream_cost_nanodollars: None,
            latency: started.elapsed(),
            finish_reason: FinishReason::Stop,
        })
    }
}

/// A well-behaved model. The planner asks for evidence only when the caller
/// supplied documents; the verifier passes everyone, preferring low indices.
pub fn default_reply(call: &Call) -> Reply {
    match call.pass.as_str() {
        "planner" => {
            let evidence = call.prompt.contains("caller documents available");
            Reply::Json(json!({
                "restated_goal": "Explain the outage and the fix",
                "evidence_required": evidence,
                "required_outputs": ["root cause", "remediation"],
                "evidence_queries": if evidence { vec!["outage timeline"] } else { vec![] },
            }))
        }
        "evidence_retriever" => Reply::Json(json!({
            "snippets": [
                {"content": "The primary database ran out of connections at 02:10.", "source": "postmortem.md"},
                {"content": "Raise max_connections and restart the pooler.", "source": "runbook.md"},
            ]
        })),
        "evidence_reranker" => Reply::Json(json!({
            "ranking": [{"index": 1, "relevance": 0.9}, {"index": 0, "relevance": 0.6}]
        })),
        "solver" => solver_reply(call.candidate.unwrap_or(0)),
        "verifier" => verifier_reply(call, |_| true),
        other => Reply::Raw(format!("unexpected pass {other}")),
    }
}

pub fn solver_reply(index: u32) -> Reply {
    Reply::Json(json!({
        "solution": format!("answer from solver {index}"),
        "confidence": 0.8,
        "citations": ["E1"],
    }))
}

/// Candidate numbers listed in a verifier prompt.
pub fn listed_candidates(prompt: &str) -> Vec<u32> {
    prompt
        .lines()
        .filter_map(|l| l.strip_prefix("### Candidate "))
        .filter_map(|rest| rest.split_whitespace().next()?.parse().ok())
        .collect()
}

/// Score `0.95 - 0.05 * index` for every listed candidate.
pub fn verifier_reply(call: &Call, passes: impl Fn(u32) -> bool) -> Reply {
    let checks: Vec<Value> = listed_candidates(&call.prompt)
        .into_iter()
        .map(|i| {
            json!({
                "candidate": i,
                "score": 0.95 - 0.05 * i as f64,
                "pass": passes(i),
                "rationale": format!("candidate {i} checked"),
            })
        })
        .collect();
    Reply::Json(json!({ "checks": checks }))
}

pub fn test_lane(solvers: u32) -> LaneConfig {
    let model = |pass: &str| format!("test/{pass}");
    LaneConfig {
        id: "test".into(),
        version: 3,
        description: "scripted".into(),
        models: PassModels {
            planner: model("planner"),
            retriever: model("retriever"),
            reranker: model("reranker"),
            solver: model("solver"),
            verifier: model("verifier"),
        },
        max_tokens: PassTokenLimits {
            planner: 100,
            retriever: 100,
            reranker: 100,
            solver: 100,
            verifier: 100,
        },
        max_solver_parallelism: solvers,
        ..LaneConfig::default()
    }
}

pub fn test_settings() -> RunSettings {
    RunSettings {
        deadline_secs: 30,
        schema_retry_delay_ms: 0,
        ..RunSettings::default()
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub gateway: Arc<ScriptedGateway>,
    pub ledger: Arc<MemoryLedger>,
}

impl Harness {
    pub fn new(gateway: Arc<ScriptedGateway>, lane: LaneConfig) -> Self {
        Self::with_settings(gateway, lane, test_settings())
    }

    pub fn with_settings(
        gateway: Arc<ScriptedGateway>,
        lane: LaneConfig,
        settings: RunSettings,
    ) -> Self {
        Self::with_cache(gateway, lane, settings, CacheStore::new(Arc::new(MemoryResponseCache::new())))
    }

    pub fn with_cache(
        gateway: Arc<ScriptedGateway>,
        lane: LaneConfig,
        settings: RunSettings,
        cache: CacheStore,
    ) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let services = services(gateway.clone(), ledger.clone(), cache, settings);
        Self {
            orchestrator: orchestrator(services, lane),
            gateway,
            ledger,
        }
    }

    /// Submit on the `test` lane, collect every event, return them with the
    /// final record.
    pub async fn run(&self, goal: &str, context: Option<Value>) -> (Vec<RunEvent>, RunView) {
        let run_id = self
            .orchestrator
            .submit_run(goal, "test", context)
            .await
            .unwrap();
        let events = tokio::time::timeout(
            Duration::from_secs(20),
            self.orchestrator.subscribe(run_id).unwrap().collect(),
        )
        .await
        .expect("run did not finish");
        let view = self.orchestrator.wait(run_id).await.unwrap();
        (events, view)
    }
}

pub fn services(
    gateway: Arc<ScriptedGateway>,
    ledger: Arc<dyn CostLedger>,
    cache: CacheStore,
    settings: RunSettings,
) -> Services {
    Services {
        gateway,
        cache,
        ledger,
        store: Arc::new(SqliteRunStore::in_memory().unwrap()),
        settings,
        default_cache_ttl: Duration::from_secs(3600),
    }
}

pub fn orchestrator(services: Services, lane: LaneConfig) -> Orchestrator {
    Orchestrator::new(services, LaneRegistry::new(vec![lane]).unwrap())
}

/// Short tag per event, for order assertions.
pub fn kinds(events: &[RunEvent]) -> Vec<String> {
    events
        .iter()
        .map(|e| match e {
            RunEvent::Phase { phase } => format!("phase:{phase:?}").to_lowercase(),
            RunEvent::Progress { .. } => "progress".into(),
            RunEvent::Candidate { .. } => "candidate".into(),
            RunEvent::Result { .. } => "result".into(),
            RunEvent::Error { .. } => "error".into(),
            RunEvent::Done => "done".into(),
        })
        .collect()
}

pub fn error_code(events: &[RunEvent]) -> Option<String> {
    events.iter().find_map(|e| match e {
        RunEvent::Error { code, .. } => Some(code.clone()),
        _ => None,
    })
}
