//! Provider failures and their retry classification.

use std::time::Duration;
use thiserror::Error;

/// How the retry loop and the run treat a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Timeout, rate limit, 5xx, connect failure. Eligible for bounded retry.
    Transient,
    /// Invalid request, auth failure, refusal. Surfaced immediately.
    Permanent,
    /// The caller's cancellation token fired.
    Cancelled,
}

/// What the provider told us about a failed HTTP exchange.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider-specific error code (e.g. "rate_limit_exceeded").
    pub provider_code: Option<String>,
    /// Value of the `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn from_status(status: u16) -> Self {
        Self {
            http_status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_code(self, provider_code: Option<String>) -> Self {
        Self {
            provider_code,
            ..self
        }
    }

    pub fn with_request_id(self, request_id: Option<String>) -> Self {
        Self { request_id, ..self }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        context: Option<ErrorContext>,
    },

    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("authentication failed: {message}")]
    Auth {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Content policy refusal, either flagged by the provider or detected in
    /// the reply text.
    #[error("refused: {message}")]
    Refused {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Anything else the backend reported. `retryable` decides the class.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    /// Per-call deadline elapsed before the provider answered.
    #[error("timeout after {0:?}")]
    Timeout(Duration, Option<ErrorContext>),

    /// The call was aborted through its cancellation token.
    #[error("cancelled")]
    Cancelled,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing API key, unusable base URL, no providers.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn rate_limited(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            context: None,
        }
        .with_context(context)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn auth(message: impl Into<String>, context: ErrorContext) -> Self {
        Self::Auth {
            message: message.into(),
            context: Some(context),
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
            context: None,
        }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Attaches HTTP context. Variants without a context slot are returned
    /// unchanged.
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        match &mut self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Auth { context, .. }
            | Self::Refused { context, .. }
            | Self::Provider { context, .. }
            | Self::Timeout(_, context) => *context = Some(ctx),
            Self::Cancelled | Self::Http(_) | Self::Config(_) => {}
        }
        self
    }

    pub fn class(&self) -> ErrorClass {
        use ErrorClass::*;
        match self {
            Self::Cancelled => Cancelled,
            Self::RateLimited { .. } | Self::Timeout(..) => Transient,
            Self::Provider { retryable: true, .. } => Transient,
            Self::Http(e) if e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() => {
                Transient
            }
            Self::Provider { .. }
            | Self::Http(_)
            | Self::InvalidRequest { .. }
            | Self::Auth { .. }
            | Self::Refused { .. }
            | Self::Config(_) => Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Stable short name for logs and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Auth { .. } => "auth_failed",
            Self::Refused { .. } => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Timeout(..) => "timeout",
            Self::Cancelled => "cancelled",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    /// Server-suggested wait before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Auth { context, .. }
            | Self::Refused { context, .. }
            | Self::Provider { context, .. }
            | Self::Timeout(_, context) => context.as_ref(),
            Self::Cancelled | Self::Http(_) | Self::Config(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context()?.request_id.as_deref()
    }
}
