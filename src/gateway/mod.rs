//! Completion gateway over one or more interchangeable chat backends.
//!
//! Every attempt runs on its own task and races the per-call timeout and the
//! caller's cancellation token. The losing side of that race is never dropped
//! on the floor: a reaper task awaits it and logs whatever it produced.

pub mod error;
pub mod openrouter;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use usage::ProviderCallRecord;

pub use error::{ErrorClass, ErrorContext, ProviderError};
pub use openrouter::{ChatProvider, OpenRouterAdapter};
pub use pricing::{chat_cost, estimate_call_cost, get_pricing, ModelPricing, DEFAULT_PRICING};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

/// The only entry point pass executors use to reach a model.
#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(
        &self,
        req: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    /// Hard deadline for a single provider attempt.
    pub call_timeout: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            call_timeout: Duration::from_secs(90),
        }
    }
}

impl From<&crate::config::GatewaySettings> for GatewayConfig {
    fn from(s: &crate::config::GatewaySettings) -> Self {
        Self {
            max_retries: s.max_retries,
            retry_base_delay: Duration::from_millis(s.retry_base_delay_ms),
            call_timeout: Duration::from_secs(s.call_timeout_secs),
        }
    }
}

type CallHandle = JoinHandle<Result<ChatResponse, ProviderError>>;

enum Race {
    Finished(Result<Result<ChatResponse, ProviderError>, tokio::task::JoinError>),
    TimedOut,
    Cancelled,
}

pub struct ProviderGateway<U: UsageSink> {
    providers: Vec<Arc<dyn ChatProvider>>,
    usage_sink: Arc<U>,
    config: GatewayConfig,
    late_outcomes: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(
        &self,
        req: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req, cancel).await
    }
}

impl<U: UsageSink> ProviderGateway<U> {
    /// Build the OpenRouter-backed gateway described by `[gateway]`.
    ///
    /// `fallback_base_urls` add further OpenAI-compatible endpoints that share
    /// the same key; attempts rotate across all of them.
    pub fn from_settings(
        settings: &crate::config::GatewaySettings,
        usage_sink: Arc<U>,
    ) -> Result<Self, ProviderError> {
        let mut providers: Vec<Arc<dyn ChatProvider>> =
            vec![Arc::new(OpenRouterAdapter::from_settings(settings)?)];
        if let Some(key) = settings.api_key.as_deref() {
            for url in &settings.fallback_base_urls {
                providers.push(Arc::new(OpenRouterAdapter::with_config(
                    key,
                    url.as_str(),
                    Duration::from_secs(settings.http_timeout_secs),
                    settings.referer.clone(),
                    settings.app_title.clone(),
                )?));
            }
        }
        Ok(Self::with_config(
            providers,
            usage_sink,
            GatewayConfig::from(settings),
        ))
    }

    pub fn with_config(
        providers: Vec<Arc<dyn ChatProvider>>,
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            providers,
            usage_sink,
            config,
            late_outcomes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of abandoned attempts (timed out or cancelled) whose eventual
    /// outcome has been awaited and logged.
    pub fn late_outcomes_observed(&self) -> u64 {
        self.late_outcomes.load(Ordering::SeqCst)
    }

    pub async fn chat(
        &self,
        req: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        if self.providers.is_empty() {
            return Err(ProviderError::config("no chat providers configured"));
        }

        let mut attempt: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ProviderError::Cancelled);
            }

            let provider = &self.providers[attempt as usize % self.providers.len()];
            let started = Instant::now();
            match self.attempt(provider, &req, cancel).await {
                Ok(resp) => {
                    self.record_usage(&req, provider.name(), attempt, Ok(&resp), started)
                        .await;
                    return Ok(resp);
                }
                // Aborted calls are not billed to anyone.
                Err(ProviderError::Cancelled) => return Err(ProviderError::Cancelled),
                Err(err) => {
                    self.record_usage(&req, provider.name(), attempt, Err(&err), started)
                        .await;

                    if !err.is_retryable() || attempt >= self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    warn!(
                        provider = provider.name(),
                        caller = req.attribution.caller,
                        attempt,
                        error = %err,
                        retry_after = ?err.retry_after(),
                        delay_ms = delay.as_millis() as u64,
                        "transient provider error, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                        _ = sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        provider: &Arc<dyn ChatProvider>,
        req: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse, ProviderError> {
        let task_provider = Arc::clone(provider);
        let owned = req.clone();
        let mut handle: CallHandle = tokio::spawn(async move { task_provider.chat(&owned).await });

        let race = tokio::select! {
            biased;
            _ = cancel.cancelled() => Race::Cancelled,
            joined = &mut handle => Race::Finished(joined),
            _ = sleep(self.config.call_timeout) => Race::TimedOut,
        };

        match race {
            Race::Finished(Ok(result)) => result,
            Race::Finished(Err(join_err)) => Err(ProviderError::provider(
                provider.name(),
                format!("provider task failed: {join_err}"),
                false,
            )),
            Race::TimedOut => {
                self.observe_late(handle, provider.name(), "timeout");
                Err(ProviderError::Timeout(self.config.call_timeout, None))
            }
            Race::Cancelled => {
                handle.abort();
                self.observe_late(handle, provider.name(), "cancelled");
                Err(ProviderError::Cancelled)
            }
        }
    }

    /// Hand an abandoned call to a reaper that awaits and logs its outcome.
    fn observe_late(&self, handle: CallHandle, provider: &'static str, reason: &'static str) {
        let counter = Arc::clone(&self.late_outcomes);
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(resp)) => debug!(
                    provider,
                    reason,
                    output_tokens = resp.output_tokens,
                    "discarding late provider response"
                ),
                Ok(Err(err)) => debug!(provider, reason, error = %err, "discarding late provider error"),
                Err(join_err) if join_err.is_cancelled() => {
                    debug!(provider, reason, "provider call aborted")
                }
                Err(join_err) => warn!(provider, reason, error = %join_err, "provider task panicked"),
            }
            counter.fetch_add(1, Ordering::SeqCst);
        });
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        provider: &'static str,
        attempt: u32,
        outcome: Result<&ChatResponse, &ProviderError>,
        started: Instant,
    ) {
        let record = ProviderCallRecord::new(provider, req.model.model_id(), req.attribution.caller)
            .run(req.attribution.run_id, req.attribution.pass_id)
            .attempt(attempt)
            .latency(started.elapsed().as_millis() as u64);

        let record = match outcome {
            Ok(resp) => record
                .tokens(resp.input_tokens, resp.output_tokens)
                .cost(resp.cost_nanodollars)
                .upstream_cost(resp.upstream_cost_nanodollars),
            Err(err) => record.request_id(err.request_id()).error(err.code()),
        };
        self.usage_sink.record(record).await;
    }
}

/// `base * 2^min(attempt, 5)` plus up to half of `base` in random jitter.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u32.pow(attempt.min(5));
    let jitter_cap = (base.as_millis() as u64) / 2;
    let jitter = if jitter_cap == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_cap)
    };
    base * multiplier + Duration::from_millis(jitter)
}
