use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use quorum_harness::gateway::{
    chat_cost, Attribution, ChatModel, ChatProvider, ChatRequest, ChatResponse, FinishReason,
    GatewayConfig, Message, NoopUsageSink, OpenRouterAdapter, ProviderError, ProviderGateway,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn adapter(server: &MockServer) -> OpenRouterAdapter {
    OpenRouterAdapter::with_config("sk-test", server.uri(), Duration::from_secs(5), None, None)
        .unwrap()
}

fn request() -> ChatRequest {
    ChatRequest::new(
        ChatModel::openrouter("openai/gpt-4o-mini"),
        vec![Message::system("be brief"), Message::user("hi")],
        Attribution::new("test"),
    )
}

fn ok_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
    })
}

#[tokio::test]
async fn openrouter_parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .and(body_partial_json(json!({
            "model": "openai/gpt-4o-mini",
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "{\"answer\": 42}" },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 30,
                "cost_details": { "upstream_inference_cost": 0.000002 }
            }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request().json()).await.unwrap();
    assert_eq!(resp.content, "{\"answer\": 42}");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 120);
    assert_eq!(resp.output_tokens, 30);
    assert_eq!(resp.cost_nanodollars, chat_cost("openai/gpt-4o-mini", 120, 30));
    assert_eq!(resp.cost_nanodollars, 120 * 150 + 30 * 600);
    assert_eq!(resp.upstream_cost_nanodollars, Some(2_000));
}

#[tokio::test]
async fn openrouter_uses_tool_call_arguments_when_content_is_empty() {
    let server = MockServer::start().await;
    let args = r#"{"checks": []}"#;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{"function": {"arguments": args}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let resp = adapter(&server).chat(&request().json()).await.unwrap();
    assert_eq!(resp.content, args);
    assert_eq!(resp.finish_reason, FinishReason::ToolCalls);
}

#[tokio::test]
async fn openrouter_reports_refusals_as_permanent() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(ok_body("I cannot help with that request.")),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::Refused { .. }), "{err:?}");
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn openrouter_rate_limit_keeps_error_context() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-request-id", "req-7f3a")
                .set_body_json(json!({
                    "error": { "message": "slow down", "code": "rate_limit_exceeded" }
                })),
        )
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(err.is_retryable());
    match err {
        ProviderError::RateLimited {
            retry_after,
            context,
        } => {
            assert_eq!(retry_after, Duration::from_secs(60));
            let ctx = context.expect("rate limit should carry context");
            assert_eq!(ctx.http_status, Some(429));
            assert_eq!(ctx.provider_code.as_deref(), Some("rate_limit_exceeded"));
            assert_eq!(ctx.request_id.as_deref(), Some("req-7f3a"));
        }
        other => panic!("expected RateLimited, got {other:?}"),
    }
}

#[tokio::test]
async fn openrouter_bad_request_is_not_retryable() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "unknown model", "code": "bad_request" }
        })))
        .mount(&server)
        .await;

    let err = adapter(&server).chat(&request()).await.unwrap_err();
    assert!(matches!(err, ProviderError::InvalidRequest { .. }), "{err:?}");
    assert!(!err.is_retryable());
}

/// First reply `first`, every later reply `second`.
#[derive(Clone)]
struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

fn gateway_over(
    providers: Vec<Arc<dyn ChatProvider>>,
    max_retries: u32,
    call_timeout: Duration,
) -> ProviderGateway<NoopUsageSink> {
    ProviderGateway::with_config(
        providers,
        Arc::new(NoopUsageSink),
        GatewayConfig {
            max_retries,
            retry_base_delay: Duration::ZERO,
            call_timeout,
        },
    )
}

#[tokio::test]
async fn gateway_retries_server_errors_then_succeeds() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: Arc::new(AtomicUsize::new(0)),
            first: ResponseTemplate::new(502).set_body_json(json!({
                "error": { "message": "upstream unavailable", "code": "bad_gateway" }
            })),
            second: ResponseTemplate::new(200).set_body_json(ok_body("ok")),
        })
        .mount(&server)
        .await;

    let gateway = gateway_over(vec![Arc::new(adapter(&server))], 1, Duration::from_secs(5));
    let resp = gateway
        .chat(request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.content, "ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn gateway_does_not_retry_permanent_errors() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "bad key" }
        })))
        .mount(&server)
        .await;

    let gateway = gateway_over(vec![Arc::new(adapter(&server))], 3, Duration::from_secs(5));
    let err = gateway
        .chat(request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Auth { .. }), "{err:?}");
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

/// Answers after `delay`, counting calls.
struct SlowProvider {
    name: &'static str,
    delay: Duration,
    calls: AtomicUsize,
    fail: bool,
}

impl SlowProvider {
    fn new(name: &'static str, delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            name,
            delay,
            calls: AtomicUsize::new(0),
            fail,
        })
    }
}

#[async_trait]
impl ChatProvider for SlowProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(ProviderError::provider(self.name, "upstream 503", true));
        }
        Ok(ChatResponse {
            content: format!("from {}", self.name),
            model: req.model.model_id().to_string(),
            input_tokens: 1,
            output_tokens: 1,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            latency: self.delay,
            finish_reason: FinishReason::Stop,
        })
    }
}

#[tokio::test]
async fn gateway_times_out_slow_calls_and_observes_their_late_outcome() {
    let slow = SlowProvider::new("slow", Duration::from_millis(200), false);
    let gateway = gateway_over(vec![slow.clone()], 0, Duration::from_millis(20));

    let err = gateway
        .chat(request(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Timeout(..)), "{err:?}");
    assert!(err.is_retryable());

    tokio::time::timeout(Duration::from_secs(2), async {
        while gateway.late_outcomes_observed() == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late outcome never observed");
}

#[tokio::test]
async fn gateway_cancel_aborts_in_flight_call() {
    let slow = SlowProvider::new("slow", Duration::from_secs(30), false);
    let gateway = gateway_over(vec![slow.clone()], 2, Duration::from_secs(60));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = gateway.chat(request(), &cancel).await.unwrap_err();
    assert!(matches!(err, ProviderError::Cancelled), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn gateway_rotates_providers_across_retries() {
    let primary = SlowProvider::new("primary", Duration::ZERO, true);
    let fallback = SlowProvider::new("fallback", Duration::ZERO, false);
    let gateway = gateway_over(
        vec![primary.clone(), fallback.clone()],
        2,
        Duration::from_secs(5),
    );

    let resp = gateway
        .chat(request(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.content, "from fallback");
    assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
}
