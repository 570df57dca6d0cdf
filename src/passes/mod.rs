//! Pass executors.
//!
//! Every pass goes through [`execute`]: record the pass, serve it from the
//! response cache or call the gateway, hold the reply to a strict schema
//! (re-asking on violations), write its ledger entry and settle the record.
//! The individual modules only build prompts and validate their outputs.

pub mod evidence;
pub mod json;
pub mod planner;
pub mod solver;
pub mod verifier;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{now_ms, CachedResponse, Fingerprint, LookupCancelled};
use crate::chunking::estimate_message_tokens;
use crate::gateway::{Attribution, ChatModel, ChatRequest, Message, ProviderError};
use crate::ledger::{LedgerEntry, LedgerError, ProjectedCall};
use crate::run::context::RunContext;
use crate::run::model::{Pass, PassId, PassStatus, PassType, Usage};
use crate::run::store::{PassCompletion, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PassError {
    #[error(transparent)]
    Provider(ProviderError),
    #[error("invalid output after {attempts} attempts: {message}")]
    Schema { attempts: u32, message: String },
    #[error("cancelled")]
    Cancelled,
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("ledger: {0}")]
    Ledger(#[from] LedgerError),
}

impl From<LookupCancelled> for PassError {
    fn from(_: LookupCancelled) -> Self {
        Self::Cancelled
    }
}

impl From<ProviderError> for PassError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Cancelled => Self::Cancelled,
            other => Self::Provider(other),
        }
    }
}

/// One model call a pass wants made.
#[derive(Debug, Clone)]
pub struct PassRequest {
    pub pass_type: PassType,
    pub candidate_index: Option<u32>,
    pub messages: Vec<Message>,
    pub temperature: f32,
    /// Structured inputs that go into the cache fingerprint.
    pub signature: Value,
}

impl PassRequest {
    /// Worst-case size of this call for budget projection.
    pub fn projected(&self, ctx: &RunContext) -> ProjectedCall {
        ProjectedCall {
            model: ctx.lane.model_for(self.pass_type).to_string(),
            input_tokens: estimate_message_tokens(&self.messages),
            max_output_tokens: ctx.lane.max_tokens_for(self.pass_type),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PassOutcome<T> {
    pub pass_id: PassId,
    pub output: T,
    pub usage: Usage,
    pub cached: bool,
}

/// Run one pass to completion.
///
/// Cancelled passes are settled as cancelled and get no ledger entry; every
/// other settled pass gets exactly one, carrying the tokens of all its
/// attempts (zero when served from cache).
pub async fn execute<T, V>(
    ctx: &RunContext,
    req: PassRequest,
    validate: V,
) -> Result<PassOutcome<T>, PassError>
where
    T: DeserializeOwned + Serialize + Send,
    V: Fn(&T) -> Result<(), String> + Sync,
{
    if ctx.cancel.is_cancelled() {
        return Err(PassError::Cancelled);
    }

    let services = &ctx.services;
    let lane = &ctx.lane;
    let pass_type = req.pass_type;
    let model = lane.model_for(pass_type).to_string();
    let pass = Pass {
        id: Uuid::new_v4(),
        run_id: ctx.run_id,
        pass_type,
        candidate_index: req.candidate_index,
        status: PassStatus::Running,
        model: model.clone(),
        usage: Usage::default(),
        cached: false,
        output: None,
        error: None,
        created_at_ms: now_ms(),
        completed_at_ms: None,
    };
    services.store.insert_pass(&pass).await?;

    let fp = Fingerprint::new(
        &lane.id,
        lane.version,
        pass_type.as_str(),
        &model,
        &req.messages,
        &req.signature,
    );

    let mut usage = Usage::default();
    let lookup = {
        let spent = &mut usage;
        let (req, model, validate) = (&req, model.as_str(), &validate);
        services
            .cache
            .get_or_compute(&fp, ctx.cache_ttl(), &ctx.cancel, move || {
                call_until_valid(ctx, pass.id, req, model, validate, spent)
            })
            .await
    };

    let settled = lookup.and_then(|found| {
        serde_json::from_str::<T>(&found.response.payload)
            .map(|output| (output, found.hit))
            .map_err(|e| PassError::Schema {
                attempts: 1,
                message: format!("cached payload unreadable: {e}"),
            })
    });

    if ctx.cancel.is_cancelled() || matches!(settled, Err(PassError::Cancelled)) {
        return cancel_pass(ctx, pass.id, pass_type, usage).await;
    }

    let cached = matches!(settled, Ok((_, true)));
    let entry = LedgerEntry::new(
        pass.id,
        ctx.run_id,
        &lane.id,
        pass_type,
        &model,
        usage,
        cached,
    );
    // No await between this check and the append.
    if ctx.cancel.is_cancelled() {
        return cancel_pass(ctx, pass.id, pass_type, usage).await;
    }
    if let Err(err) = services.ledger.append(entry).await {
        let err = PassError::Ledger(err);
        warn!(
            run_id = %ctx.run_id,
            pass = pass_type.as_str(),
            error = %err,
            "ledger write failed"
        );
        fail_pass(ctx, pass.id, usage, &err).await?;
        return Err(err);
    }

    match settled {
        Ok((output, hit)) => {
            services
                .store
                .complete_pass(
                    pass.id,
                    PassCompletion {
                        status: PassStatus::Completed,
                        usage,
                        cached: hit,
                        output: serde_json::to_value(&output).ok(),
                        error: None,
                    },
                )
                .await?;
            debug!(
                run_id = %ctx.run_id,
                pass = pass_type.as_str(),
                candidate = ?req.candidate_index,
                cached = hit,
                cost = usage.cost_nanodollars,
                "pass completed"
            );
            Ok(PassOutcome {
                pass_id: pass.id,
                output,
                usage,
                cached: hit,
            })
        }
        Err(err) => {
            warn!(
                run_id = %ctx.run_id,
                pass = pass_type.as_str(),
                candidate = ?req.candidate_index,
                error = %err,
                "pass failed"
            );
            fail_pass(ctx, pass.id, usage, &err).await?;
            Err(err)
        }
    }
}

async fn cancel_pass<T>(
    ctx: &RunContext,
    pass_id: PassId,
    pass_type: PassType,
    usage: Usage,
) -> Result<PassOutcome<T>, PassError> {
    ctx.services
        .store
        .complete_pass(
            pass_id,
            PassCompletion {
                status: PassStatus::Cancelled,
                usage,
                cached: false,
                output: None,
                error: Some("cancelled".into()),
            },
        )
        .await?;
    debug!(run_id = %ctx.run_id, pass = pass_type.as_str(), "pass cancelled");
    Err(PassError::Cancelled)
}

async fn fail_pass(
    ctx: &RunContext,
    pass_id: PassId,
    usage: Usage,
    err: &PassError,
) -> Result<(), StoreError> {
    ctx.services
        .store
        .complete_pass(
            pass_id,
            PassCompletion {
                status: PassStatus::Failed,
                usage,
                cached: false,
                output: None,
                error: Some(err.to_string()),
            },
        )
        .await
}

/// Call the gateway until the reply parses and validates, or schema
/// attempts run out. Provider errors end the loop at once; the gateway has
/// already retried them.
async fn call_until_valid<T, V>(
    ctx: &RunContext,
    pass_id: PassId,
    req: &PassRequest,
    model: &str,
    validate: &V,
    usage: &mut Usage,
) -> Result<CachedResponse, PassError>
where
    T: DeserializeOwned + Serialize,
    V: Fn(&T) -> Result<(), String>,
{
    let settings = &ctx.services.settings;
    let attempts = settings.max_schema_retries + 1;
    let mut attribution = Attribution::new(req.pass_type.caller())
        .with_run(ctx.run_id)
        .with_pass(pass_id);
    if let Some(index) = req.candidate_index {
        attribution = attribution.with_candidate(index);
    }

    let mut rejection = String::new();
    for attempt in 1..=attempts {
        let mut messages = req.messages.clone();
        if attempt > 1 {
            messages.push(Message::user(format!(
                "Your previous reply was rejected: {rejection}. \
                 Reply again with only the JSON object in the required shape."
            )));
        }
        let chat = ChatRequest::new(ChatModel::openrouter(model), messages, attribution.clone())
            .temperature(req.temperature)
            .max_tokens(ctx.lane.max_tokens_for(req.pass_type))
            .json();

        let response = ctx.services.gateway.chat(chat, &ctx.cancel).await?;
        usage.add(
            response.input_tokens,
            response.output_tokens,
            response.cost_nanodollars,
        );

        let checked = json::parse_strict::<T>(&response.content)
            .and_then(|value| validate(&value).map(|()| value));
        match checked {
            Ok(value) => {
                let payload = serde_json::to_string(&value).map_err(|e| PassError::Schema {
                    attempts: attempt,
                    message: e.to_string(),
                })?;
                return Ok(CachedResponse {
                    payload,
                    model: response.model,
                    input_tokens: response.input_tokens,
                    output_tokens: response.output_tokens,
                    cost_nanodollars: response.cost_nanodollars,
                });
            }
            Err(reason) => {
                warn!(
                    run_id = %ctx.run_id,
                    pass = req.pass_type.as_str(),
                    attempt,
                    reason = %reason,
                    "schema violation"
                );
                rejection = reason;
                if attempt < attempts {
                    let delay =
                        Duration::from_millis(settings.schema_retry_delay_ms * attempt as u64);
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(PassError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    Err(PassError::Schema {
        attempts,
        message: rejection,
    })
}

/// Trimmed, non-empty, or an error naming `field`.
pub(crate) fn require_text(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("`{field}` must not be empty"))
    } else {
        Ok(())
    }
}

pub(crate) fn require_unit(field: &str, value: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("`{field}` must be within [0, 1], got {value}"))
    }
}
