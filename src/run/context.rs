//! Shared services and the per-run context handed to every pass.

use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::error::RunError;
use super::events::{EventEmitter, Phase, RunEvent};
use super::model::{RunId, RunStatus};
use super::store::RunStore;
use crate::cache::CacheStore;
use crate::chunking::SourceDocument;
use crate::config::RunSettings;
use crate::gateway::ChatGateway;
use crate::lanes::LaneConfig;
use crate::ledger::CostLedger;

/// Long-lived collaborators shared by every run.
pub struct Services {
    pub gateway: Arc<dyn ChatGateway>,
    pub cache: CacheStore,
    pub ledger: Arc<dyn CostLedger>,
    pub store: Arc<dyn RunStore>,
    pub settings: RunSettings,
    /// Used when the lane does not set `cache_ttl_secs`.
    pub default_cache_ttl: Duration,
}

/// Everything one run's passes need, passed by reference down the pipeline.
pub struct RunContext {
    pub run_id: RunId,
    pub goal: String,
    pub context: Value,
    /// Snapshot taken at submission.
    pub lane: Arc<LaneConfig>,
    /// Child of the caller-facing token; also cancelled on deadline.
    pub cancel: CancellationToken,
    pub events: EventEmitter,
    pub services: Arc<Services>,
    status: Mutex<RunStatus>,
}

impl RunContext {
    pub fn new(
        run_id: RunId,
        goal: String,
        context: Value,
        lane: Arc<LaneConfig>,
        cancel: CancellationToken,
        events: EventEmitter,
        services: Arc<Services>,
    ) -> Self {
        Self {
            run_id,
            goal,
            context,
            lane,
            cancel,
            events,
            services,
            status: Mutex::new(RunStatus::Pending),
        }
    }

    /// Move the run along its state machine, persist the new status and
    /// announce working phases.
    pub async fn transition(&self, next: RunStatus) -> Result<(), RunError> {
        {
            let mut current = self.status.lock().unwrap_or_else(|p| p.into_inner());
            if !current.can_transition_to(next) {
                return Err(RunError::Internal(format!(
                    "illegal run transition {} -> {}",
                    current.as_str(),
                    next.as_str()
                )));
            }
            *current = next;
        }

        if !next.is_terminal() {
            self.services
                .store
                .set_run_status(self.run_id, next)
                .await
                .map_err(|e| RunError::Internal(e.to_string()))?;
        }

        let phase = match next {
            RunStatus::Planning => Some(Phase::Planning),
            RunStatus::Evidence => Some(Phase::Evidence),
            RunStatus::Solving => Some(Phase::Solving),
            RunStatus::Verifying => Some(Phase::Verifying),
            _ => None,
        };
        if let Some(phase) = phase {
            tracing::info!(run_id = %self.run_id, phase = next.as_str(), "run phase");
            self.events.emit(RunEvent::Phase { phase });
        }
        Ok(())
    }

    pub fn progress(&self, percent: u8, step: impl Into<String>) {
        self.events.emit(RunEvent::progress(percent, step));
    }

    /// Lane TTL, else the service default; `None` disables caching.
    pub fn cache_ttl(&self) -> Option<Duration> {
        let secs = self
            .lane
            .cache_ttl_secs
            .unwrap_or(self.services.default_cache_ttl.as_secs());
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Caller documents under `context.documents`. Validated at submission,
    /// so malformed entries cannot reach here.
    pub fn documents(&self) -> Vec<SourceDocument> {
        self.context
            .get("documents")
            .cloned()
            .and_then(|docs| serde_json::from_value(docs).ok())
            .unwrap_or_default()
    }

    /// Structured context that goes into a pass's cache fingerprint.
    pub fn signature(&self, candidate_index: Option<u32>) -> Value {
        json!({
            "context": self.context,
            "candidate": candidate_index,
        })
    }
}
