//! OpenRouter (and any OpenAI-compatible endpoint) behind [`ChatProvider`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::chat_cost;
use super::types::{ChatRequest, ChatResponse, FinishReason};

/// One interchangeable completion backend.
///
/// Implementations must be safe to call from a spawned task; the gateway
/// owns timeouts, retries and cancellation.
#[async_trait]
pub trait ChatProvider: Send + Sync + 'static {
    /// Stable name used in logs and usage records.
    fn name(&self) -> &'static str;

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

const PROVIDER: &str = "openrouter";
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Bodies past this size are rejected while streaming.
const MAX_BODY_BYTES: usize = 1 << 20;

/// Prompts past this size never leave the process (~125k tokens).
const MAX_PROMPT_CHARS: usize = 500_000;

/// Used when a 429 carries no usable `Retry-After`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    endpoint: String,
}

impl OpenRouterAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, Duration::from_secs(120), None, None)
    }

    /// Primary endpoint from the `[gateway]` config section.
    pub fn from_settings(settings: &crate::config::GatewaySettings) -> Result<Self, ProviderError> {
        let api_key = settings
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::config("no API key: set OPENROUTER_API_KEY"))?;
        Self::with_config(
            api_key,
            settings.base_url.as_str(),
            Duration::from_secs(settings.http_timeout_secs),
            settings.referer.clone(),
            settings.app_title.clone(),
        )
    }

    /// `referer` and `app_title` become OpenRouter's attribution headers.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        http_timeout: Duration,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.into()))
            .map_err(|_| ProviderError::config("API key is not a valid header value"))?;
        headers.insert(AUTHORIZATION, bearer);
        for (name, value) in [("http-referer", referer), ("x-title", app_title)] {
            if let Some(value) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
                headers.insert(HeaderName::from_static(name), value);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("http client: {e}")))?;

        let base = base_url.into();
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base.trim_end_matches('/')),
        })
    }
}

// -----------------------------------------------------------------------------
// Wire format
// -----------------------------------------------------------------------------

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<JsonObjectFormat>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct JsonObjectFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl<'a> WireRequest<'a> {
    fn from_chat(req: &'a ChatRequest) -> Self {
        Self {
            model: req.model.model_id(),
            messages: req
                .messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req.json_mode.then_some(JsonObjectFormat {
                kind: "json_object",
            }),
        }
    }
}

#[derive(Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: Option<WireReply>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireReply {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    function: Option<WireFunction>,
}

#[derive(Deserialize)]
struct WireFunction {
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    #[serde(default)]
    cost_details: Option<WireCost>,
}

#[derive(Deserialize)]
struct WireCost {
    /// USD.
    upstream_inference_cost: Option<f64>,
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

impl WireError {
    /// Providers send the code as either a string or a number.
    fn code(&self) -> Option<String> {
        match self.code.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        }
    }
}

// -----------------------------------------------------------------------------
// Provider
// -----------------------------------------------------------------------------

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let prompt_chars = req.input_chars();
        if prompt_chars > MAX_PROMPT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "prompt is {prompt_chars} chars, limit is {MAX_PROMPT_CHARS}"
            )));
        }

        let started = Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&WireRequest::from_chat(req))
            .send()
            .await?;

        let status = response.status();
        let ctx = ErrorContext::from_status(status.as_u16())
            .with_request_id(header_str(response.headers(), "x-request-id").map(str::to_owned));
        let retry_after = header_str(response.headers(), RETRY_AFTER.as_str())
            .and_then(parse_retry_after)
            .unwrap_or(DEFAULT_RETRY_AFTER);

        let body = read_capped(response).await?;
        let envelope = serde_json::from_slice::<WireEnvelope>(&body);

        if !status.is_success() {
            let (message, ctx) = match envelope.ok().and_then(|e| e.error) {
                Some(err) => {
                    let ctx = ctx.with_code(err.code());
                    (err.message.unwrap_or_default(), ctx)
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };
            return Err(error_for_status(status, message, retry_after, ctx));
        }

        // A 200 with a garbled envelope is usually a truncated upstream reply.
        let envelope = envelope
            .map_err(|e| ProviderError::provider(PROVIDER, format!("unreadable body: {e}"), true))?;

        if let Some(err) = envelope.error {
            let message = err.message.unwrap_or_default();
            return Err(if looks_like_refusal(&message) {
                ProviderError::refused(message)
            } else {
                ProviderError::provider(PROVIDER, message, false).with_context(ctx)
            });
        }

        let choice = envelope
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::provider(PROVIDER, "reply has no choices", false))?;
        let content = choice.message.map(reply_text).unwrap_or_default();
        if looks_like_refusal(&content) {
            return Err(ProviderError::refused(content));
        }

        let usage = envelope
            .usage
            .ok_or_else(|| ProviderError::provider(PROVIDER, "reply has no usage block", false))?;
        let input_tokens = usage.prompt_tokens.unwrap_or(0);
        let output_tokens = usage.completion_tokens.unwrap_or(0);
        let upstream_cost_nanodollars = usage
            .cost_details
            .and_then(|c| c.upstream_inference_cost)
            .map(|usd| ((usd * 1e9).round() as i64).max(0));

        Ok(ChatResponse {
            content,
            model: envelope
                .model
                .unwrap_or_else(|| req.model.model_id().to_string()),
            input_tokens,
            output_tokens,
            cost_nanodollars: chat_cost(req.model.model_id(), input_tokens, output_tokens),
            upstream_cost_nanodollars,
            latency: started.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `Retry-After` in delta-seconds form. HTTP dates fall back to the default.
fn parse_retry_after(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

async fn read_capped(mut response: reqwest::Response) -> Result<Vec<u8>, ProviderError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > MAX_BODY_BYTES {
            return Err(ProviderError::provider(
                PROVIDER,
                format!("reply body over {MAX_BODY_BYTES} bytes"),
                false,
            ));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Message text, or the first non-empty tool-call arguments when a model
/// answers a JSON-mode request through a tool call.
fn reply_text(reply: WireReply) -> String {
    match reply.content {
        Some(text) if !text.trim().is_empty() => text,
        _ => reply
            .tool_calls
            .into_iter()
            .filter_map(|call| call.function?.arguments)
            .find(|args| !args.trim().is_empty())
            .unwrap_or_default(),
    }
}

fn looks_like_refusal(text: &str) -> bool {
    const OPENINGS: &[&str] = &[
        "refus",
        "i cannot",
        "i can't",
        "i won't",
        "i will not",
        "i am unable to",
        "i'm unable to",
        "unable to comply",
        "unable to assist",
        "unable to help",
        "unable to provide",
    ];
    let lower = text.trim_start().to_lowercase();
    let opening = lower.lines().next().unwrap_or("");
    OPENINGS.iter().any(|o| opening.starts_with(o)) || lower.contains("request was refused")
}

fn error_for_status(
    status: StatusCode,
    message: String,
    retry_after: Duration,
    ctx: ErrorContext,
) -> ProviderError {
    match status.as_u16() {
        429 => ProviderError::rate_limited(retry_after, ctx),
        401 | 403 => ProviderError::auth(message, ctx),
        400 | 404 | 413 | 422 => ProviderError::invalid_request(message).with_context(ctx),
        code => ProviderError::provider(PROVIDER, message, code >= 500 || code == 408).with_context(ctx),
    }
}
