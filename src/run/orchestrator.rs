//! Drives runs through plan → evidence → solve → verify.
//!
//! Each run is one spawned task. Solvers fan out inside that task with a full
//! barrier before verification, and the task is the only writer of the run's
//! events, status and final record.

use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::context::{RunContext, Services};
use super::error::{RunError, SubmitError};
use super::events::{CandidateStatus, Citation, EventEmitter, RunEvent, RunEventStream};
use super::model::{Check, PassType, Run, RunId, RunStatus, RunView};
use super::store::{RunFinish, StoreError};
use crate::cache::now_ms;
use crate::chunking::SourceDocument;
use crate::lanes::LaneRegistry;
use crate::ledger::{project_budget, ProjectedCall};
use crate::passes::evidence::{self, EvidenceItem};
use crate::passes::planner::{self, Plan};
use crate::passes::solver::{self, Candidate};
use crate::passes::verifier::{self, CandidateCheck};
use crate::passes::{PassError, PassRequest};

/// Finished runs kept in memory for late subscribers before pruning.
const RETAINED_FINISHED_RUNS: usize = 1024;

const PROGRESS_PLANNING: u8 = 5;
const PROGRESS_EVIDENCE: u8 = 20;
const PROGRESS_SOLVING: u8 = 35;
const PROGRESS_SOLVING_SPAN: u32 = 45;
const PROGRESS_VERIFYING: u8 = 85;

#[derive(Clone)]
struct RunHandle {
    events: EventEmitter,
    cancel: CancellationToken,
    finished: watch::Receiver<Option<RunStatus>>,
}

impl RunHandle {
    fn is_finished(&self) -> bool {
        self.finished.borrow().is_some()
    }
}

/// Successful end of the pipeline.
struct Completion {
    output: String,
    score: f64,
    citations: Vec<Citation>,
    degraded: bool,
}

pub struct Orchestrator {
    services: Arc<Services>,
    lanes: Arc<LaneRegistry>,
    runs: Mutex<HashMap<RunId, RunHandle>>,
}

impl Orchestrator {
    pub fn new(services: Services, lanes: LaneRegistry) -> Self {
        Self {
            services: Arc::new(services),
            lanes: Arc::new(lanes),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn lanes(&self) -> &LaneRegistry {
        &self.lanes
    }

    /// Validate, persist and start a run. Returns as soon as the run is
    /// recorded; progress is observed through [`Orchestrator::subscribe`].
    pub async fn submit_run(
        &self,
        goal: &str,
        lane_id: &str,
        context: Option<Value>,
    ) -> Result<RunId, SubmitError> {
        let (goal, context) = validate_input(&self.services, goal, context)?;
        let lane = self.lanes.get(lane_id)?;

        let run = Run {
            id: Uuid::new_v4(),
            lane_id: lane.id.clone(),
            lane_version: lane.version,
            goal: goal.clone(),
            context: context.clone(),
            status: RunStatus::Pending,
            final_output: None,
            verify_score: None,
            degraded: false,
            error_code: None,
            error_message: None,
            created_at_ms: now_ms(),
            completed_at_ms: None,
        };
        self.services.store.create_run(&run).await?;

        let cancel = CancellationToken::new();
        let events = EventEmitter::new();
        let (done_tx, done_rx) = watch::channel(None);
        let ctx = RunContext::new(
            run.id,
            goal,
            context,
            lane,
            cancel.child_token(),
            events.clone(),
            Arc::clone(&self.services),
        );

        {
            let mut runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
            if runs.len() >= RETAINED_FINISHED_RUNS {
                runs.retain(|_, h| !h.is_finished());
            }
            runs.insert(
                run.id,
                RunHandle {
                    events,
                    cancel,
                    finished: done_rx,
                },
            );
        }

        info!(run_id = %run.id, lane = %run.lane_id, lane_version = run.lane_version, "run submitted");
        tokio::spawn(run_task(ctx, done_tx));
        Ok(run.id)
    }

    /// Event stream for a run started by this orchestrator, replayed from
    /// its first event.
    pub fn subscribe(&self, run_id: RunId) -> Option<RunEventStream> {
        self.handle(run_id).map(|h| h.events.subscribe())
    }

    /// Request cancellation. Returns false for unknown or finished runs.
    pub fn cancel(&self, run_id: RunId) -> bool {
        match self.handle(run_id) {
            Some(h) if !h.is_finished() => {
                info!(%run_id, "run cancellation requested");
                h.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Wait for a run to reach a terminal state, then return its record.
    pub async fn wait(&self, run_id: RunId) -> Result<RunView, StoreError> {
        if let Some(handle) = self.handle(run_id) {
            let mut rx = handle.finished;
            while rx.borrow_and_update().is_none() {
                if rx.changed().await.is_err() {
                    break;
                }
            }
        }
        self.get_run(run_id).await
    }

    /// Run record with passes, artifacts and checks. The total cost is the
    /// ledger's sum for the run.
    pub async fn get_run(&self, run_id: RunId) -> Result<RunView, StoreError> {
        let mut view = self.services.store.get_view(run_id).await?;
        view.total_cost_nanodollars = self.services.ledger.run_total(run_id).await?.cost_nanodollars;
        Ok(view)
    }

    fn handle(&self, run_id: RunId) -> Option<RunHandle> {
        let runs = self.runs.lock().unwrap_or_else(|p| p.into_inner());
        runs.get(&run_id).cloned()
    }
}

fn validate_input(
    services: &Services,
    goal: &str,
    context: Option<Value>,
) -> Result<(String, Value), SubmitError> {
    let settings = &services.settings;
    let goal = goal.trim();
    if goal.is_empty() {
        return Err(SubmitError::Validation("goal must not be empty".into()));
    }
    let goal_chars = goal.chars().count();
    if goal_chars > settings.max_goal_chars {
        return Err(SubmitError::Validation(format!(
            "goal is {goal_chars} characters, limit is {}",
            settings.max_goal_chars
        )));
    }

    let context = match context {
        None | Some(Value::Null) => json!({}),
        Some(Value::Object(map)) => Value::Object(map),
        Some(_) => return Err(SubmitError::Validation("context must be a JSON object".into())),
    };
    let size = context.to_string().len();
    if size > settings.max_context_bytes {
        return Err(SubmitError::Validation(format!(
            "context is {size} bytes, limit is {}",
            settings.max_context_bytes
        )));
    }
    if let Some(docs) = context.get("documents") {
        serde_json::from_value::<Vec<SourceDocument>>(docs.clone()).map_err(|e| {
            SubmitError::Validation(format!(
                "context.documents must be a list of {{source, text}}: {e}"
            ))
        })?;
    }
    Ok((goal.to_string(), context))
}

async fn run_task(ctx: RunContext, done_tx: watch::Sender<Option<RunStatus>>) {
    let deadline = Duration::from_secs(ctx.services.settings.deadline_secs);
    let pipeline = drive(&ctx);
    tokio::pin!(pipeline);

    let raced = tokio::select! {
        result = &mut pipeline => Ok(result),
        _ = tokio::time::sleep(deadline) => Err(()),
    };
    let outcome = match raced {
        Ok(result) => result,
        Err(()) => {
            warn!(run_id = %ctx.run_id, ?deadline, "run deadline reached, cancelling passes");
            ctx.cancel.cancel();
            // Let in-flight passes settle as cancelled before finishing.
            let _ = pipeline.await;
            Err(RunError::Timeout(deadline))
        }
    };

    let status = finish(&ctx, outcome).await;
    done_tx.send_replace(Some(status));
}

async fn drive(ctx: &RunContext) -> Result<Completion, RunError> {
    checkpoint(ctx)?;
    ctx.transition(RunStatus::Planning).await?;
    ctx.progress(PROGRESS_PLANNING, "planning");
    let req = planner::request(ctx);
    check_budget(ctx, "planning", &[req.projected(ctx)]).await?;
    let plan = planner::run(ctx, req)
        .await
        .map_err(|e| RunError::from_pass(PassType::Planner, e))?
        .output;

    let evidence = if plan.evidence_required {
        checkpoint(ctx)?;
        ctx.transition(RunStatus::Evidence).await?;
        ctx.progress(PROGRESS_EVIDENCE, "gathering evidence");
        gather_evidence(ctx, &plan).await?
    } else {
        Vec::new()
    };

    checkpoint(ctx)?;
    ctx.transition(RunStatus::Solving).await?;
    ctx.progress(PROGRESS_SOLVING, "solving");
    let candidates = solve(ctx, &plan, &evidence).await?;

    checkpoint(ctx)?;
    ctx.transition(RunStatus::Verifying).await?;
    ctx.progress(PROGRESS_VERIFYING, "verifying");
    verify(ctx, &plan, &evidence, &candidates).await
}

fn checkpoint(ctx: &RunContext) -> Result<(), RunError> {
    if ctx.cancel.is_cancelled() {
        Err(RunError::Cancelled)
    } else {
        Ok(())
    }
}

/// Refuse a stage whose worst case would push the run over its lane's
/// cost or token cap.
async fn check_budget(
    ctx: &RunContext,
    stage: &'static str,
    calls: &[ProjectedCall],
) -> Result<(), RunError> {
    let lane = &ctx.lane;
    if lane.budget_nanodollars.is_none() && lane.token_cap.is_none() {
        return Ok(());
    }
    let spent = ctx
        .services
        .ledger
        .run_total(ctx.run_id)
        .await
        .map_err(|e| RunError::Internal(e.to_string()))?;
    project_budget(&spent, calls, lane.budget_nanodollars, lane.token_cap).map_err(|breach| {
        warn!(run_id = %ctx.run_id, stage, %breach, "stage refused by budget");
        RunError::BudgetExceeded { stage, breach }
    })
}

async fn gather_evidence(ctx: &RunContext, plan: &Plan) -> Result<Vec<EvidenceItem>, RunError> {
    let req = evidence::retrieval_request(ctx, plan);
    check_budget(
        ctx,
        "evidence",
        &[req.projected(ctx), evidence::rerank_projection(ctx)],
    )
    .await?;
    let snippets = evidence::retrieve(ctx, req)
        .await
        .map_err(|e| RunError::from_pass(PassType::EvidenceRetriever, e))?;
    checkpoint(ctx)?;
    evidence::rerank(ctx, plan, snippets)
        .await
        .map_err(|e| RunError::from_pass(PassType::EvidenceReranker, e))
}

/// Launch every solver at once and wait for all of them.
async fn solve(
    ctx: &RunContext,
    plan: &Plan,
    evidence: &[EvidenceItem],
) -> Result<Vec<Candidate>, RunError> {
    let total = ctx.lane.solver_count();
    let requests: Vec<PassRequest> = (0..total)
        .map(|i| solver::request(ctx, plan, evidence, i, total))
        .collect();
    let projected: Vec<ProjectedCall> = requests.iter().map(|r| r.projected(ctx)).collect();
    check_budget(ctx, "solving", &projected).await?;

    let settled = AtomicU32::new(0);
    let results: Vec<(u32, Result<_, PassError>)> = stream::iter((0u32..).zip(requests))
        .map(|(index, req)| {
            let settled = &settled;
            async move {
                let result = solver::run(ctx, req).await;
                let status = match &result {
                    Ok(_) => Some(CandidateStatus::Ok),
                    Err(PassError::Cancelled) => None,
                    Err(_) => Some(CandidateStatus::Error),
                };
                if let Some(status) = status {
                    ctx.events.emit(RunEvent::Candidate { index, status });
                    let done = settled.fetch_add(1, Ordering::SeqCst) + 1;
                    let percent = PROGRESS_SOLVING as u32 + PROGRESS_SOLVING_SPAN * done / total;
                    ctx.progress(percent as u8, format!("{done}/{total} solvers settled"));
                }
                (index, result)
            }
        })
        .buffer_unordered(total as usize)
        .collect()
        .await;

    checkpoint(ctx)?;

    let mut candidates = Vec::new();
    let mut last_error = None;
    for (index, result) in results {
        match result {
            Ok(outcome) => candidates.push(Candidate {
                index,
                pass_id: outcome.pass_id,
                solution: outcome.output,
            }),
            Err(err @ (PassError::Store(_) | PassError::Ledger(_))) => {
                return Err(RunError::Internal(err.to_string()));
            }
            Err(err) => last_error = Some(err.to_string()),
        }
    }
    candidates.sort_by_key(|c| c.index);

    info!(
        run_id = %ctx.run_id,
        succeeded = candidates.len(),
        attempted = total,
        "solvers settled"
    );
    if candidates.is_empty() {
        return Err(RunError::NoViableCandidates {
            attempted: total,
            last_error: last_error.unwrap_or_default(),
        });
    }
    Ok(candidates)
}

async fn verify(
    ctx: &RunContext,
    plan: &Plan,
    evidence: &[EvidenceItem],
    candidates: &[Candidate],
) -> Result<Completion, RunError> {
    let req = verifier::request(ctx, plan, evidence, candidates);
    check_budget(ctx, "verification", &[req.projected(ctx)]).await?;
    let verdict = verifier::run(ctx, req, candidates)
        .await
        .map_err(|e| RunError::from_pass(PassType::Verifier, e))?
        .output;

    let selection = verifier::select(&verdict.checks, ctx.lane.verification_threshold)
        .ok_or_else(|| RunError::Internal("verifier returned no checks".into()))?;
    persist_checks(ctx, candidates, &verdict.checks, selection.winner).await?;

    let chosen = candidates
        .iter()
        .find(|c| c.index == selection.chosen)
        .ok_or_else(|| RunError::Internal(format!("unknown candidate {}", selection.chosen)))?;

    Ok(Completion {
        output: chosen.solution.solution.clone(),
        score: selection.score,
        citations: resolve_citations(&chosen.solution.citations, evidence),
        degraded: selection.degraded,
    })
}

async fn persist_checks(
    ctx: &RunContext,
    candidates: &[Candidate],
    checks: &[CandidateCheck],
    winner: Option<u32>,
) -> Result<(), RunError> {
    let rows: Vec<Check> = checks
        .iter()
        .filter_map(|c| {
            let candidate = candidates.iter().find(|x| x.index == c.candidate)?;
            Some(Check {
                id: Uuid::new_v4(),
                run_id: ctx.run_id,
                candidate_pass_id: candidate.pass_id,
                candidate_index: c.candidate,
                score: c.score,
                passed: c.pass,
                is_winner: winner == Some(c.candidate),
                rationale: c.rationale.clone(),
            })
        })
        .collect();
    ctx.services
        .store
        .insert_checks(&rows)
        .await
        .map_err(|e| RunError::Internal(e.to_string()))
}

/// Match solver citation labels against the run's evidence. Labels with no
/// matching snippet are kept as bare sources.
pub(crate) fn resolve_citations(labels: &[String], evidence: &[EvidenceItem]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    labels
        .iter()
        .map(|l| l.trim().trim_start_matches('[').trim_end_matches(']').trim())
        .filter(|l| !l.is_empty() && seen.insert(l.to_ascii_uppercase()))
        .map(|label| {
            match evidence
                .iter()
                .find(|e| e.label.eq_ignore_ascii_case(label) || e.source == label)
            {
                Some(e) => Citation {
                    label: e.label.clone(),
                    source: e.source.clone(),
                    excerpt: Some(e.content.clone()),
                },
                None => Citation {
                    label: label.to_string(),
                    source: label.to_string(),
                    excerpt: None,
                },
            }
        })
        .collect()
}

/// Persist the terminal state, then close the event stream.
async fn finish(ctx: &RunContext, outcome: Result<Completion, RunError>) -> RunStatus {
    let (record, events) = match outcome {
        Ok(done) => {
            let low_confidence = done.degraded.then(|| RunError::LowConfidence {
                score: done.score,
                threshold: ctx.lane.verification_threshold,
            });
            let record = RunFinish {
                status: RunStatus::Completed,
                final_output: Some(done.output.clone()),
                verify_score: Some(done.score),
                degraded: done.degraded,
                error_code: low_confidence.as_ref().map(|e| e.code().to_string()),
                error_message: low_confidence.as_ref().map(|e| e.to_string()),
            };
            let events = vec![
                RunEvent::progress(100, "complete"),
                RunEvent::Result {
                    output: done.output,
                    score: done.score,
                    citations: done.citations,
                    degraded: done.degraded,
                },
            ];
            (record, events)
        }
        Err(err) => {
            let status = match err {
                RunError::Cancelled => RunStatus::Cancelled,
                _ => RunStatus::Failed,
            };
            let record = RunFinish {
                status,
                final_output: None,
                verify_score: None,
                degraded: false,
                error_code: Some(err.code().to_string()),
                error_message: Some(err.to_string()),
            };
            let events = vec![RunEvent::Error {
                code: err.code().to_string(),
                message: err.to_string(),
            }];
            (record, events)
        }
    };

    let status = record.status;
    if let Err(err) = ctx.transition(status).await {
        error!(run_id = %ctx.run_id, error = %err, "terminal transition rejected");
    }
    if let Err(err) = ctx.services.store.finish_run(ctx.run_id, record.clone()).await {
        error!(run_id = %ctx.run_id, error = %err, "failed to persist run outcome");
    }
    info!(
        run_id = %ctx.run_id,
        status = status.as_str(),
        code = record.error_code.as_deref().unwrap_or(""),
        degraded = record.degraded,
        "run finished"
    );

    for event in events {
        ctx.events.emit(event);
    }
    ctx.events.emit(RunEvent::Done);
    status
}
