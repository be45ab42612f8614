//! Transport failures at the oracle boundary.
//!
//! None of these abort a batch. The retry loop in [`crate::oracle`] spends the
//! whole attempt budget on every error except [`ProviderError::Config`], then
//! falls back to interpolation. [`ProviderError::is_retryable`] is the
//! provider's own verdict and only feeds logs and usage records.

use std::time::Duration;
use thiserror::Error;

/// Wait applied to a 429 that carries no usable `Retry-After` header.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// What the provider told us about a failed call.
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider error code, e.g. `RESOURCE_EXHAUSTED` or `rate_limit_exceeded`.
    pub provider_code: Option<String>,
    /// `x-request-id` / `x-goog-request-id`, for support tickets.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429.
    #[error("{provider} rate limit, retry after {retry_after:?}")]
    RateLimited {
        provider: &'static str,
        retry_after: Duration,
        context: ErrorContext,
    },

    /// The request itself is wrong (bad model id, oversized prompt); resending
    /// it cannot help.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Prompt or candidate blocked by the provider's safety filter. Reply
    /// wording is never inspected here.
    #[error("refused: {message}")]
    Refused {
        message: String,
        context: Option<ErrorContext>,
    },

    /// Any other provider-side failure.
    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing or malformed credential, unusable client settings.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Classify a non-success HTTP status.
    ///
    /// 429 is a rate limit; 400, 404, 413 and 422 mean the request is wrong;
    /// other 4xx are permanent provider errors and 5xx are retryable.
    pub fn from_status(
        provider: &'static str,
        status: u16,
        message: String,
        retry_after: Option<Duration>,
        context: ErrorContext,
    ) -> Self {
        match status {
            429 => Self::RateLimited {
                provider,
                retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
                context,
            },
            400 | 404 | 413 | 422 => Self::InvalidRequest {
                message,
                context: Some(context),
            },
            _ => Self::Provider {
                provider,
                message,
                retryable: status >= 500,
                context: Some(context),
            },
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
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

    /// Whether the provider expects a resend to succeed. Sampling is not
    /// deterministic, so a safety block may clear on the next attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Refused { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request() || e.is_body(),
            Self::InvalidRequest { .. } | Self::Config(_) => false,
        }
    }

    /// The client itself is unusable; no attempt in this run can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Short code for logs and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. } => Some(context),
            Self::InvalidRequest { context, .. }
            | Self::Refused { context, .. }
            | Self::Provider { context, .. } => context.as_ref(),
            Self::Timeout(_) | Self::Http(_) | Self::Config(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let ctx = ErrorContext::new;
        let limited = ProviderError::from_status("gemini", 429, String::new(), None, ctx());
        assert!(limited.is_retryable());
        assert!(matches!(
            limited,
            ProviderError::RateLimited { retry_after, .. } if retry_after == DEFAULT_RETRY_AFTER
        ));

        let bad = ProviderError::from_status("gemini", 404, "no such model".into(), None, ctx());
        assert!(matches!(bad, ProviderError::InvalidRequest { .. }));
        assert!(!bad.is_retryable());

        let auth = ProviderError::from_status("openrouter", 401, "bad key".into(), None, ctx());
        assert!(!auth.is_retryable());
        assert!(ProviderError::from_status("openrouter", 503, String::new(), None, ctx()).is_retryable());
    }

    #[test]
    fn retryability_follows_error_kind() {
        assert!(ProviderError::Timeout(Duration::from_secs(60)).is_retryable());
        assert!(!ProviderError::config("no key").is_retryable());
        assert!(ProviderError::refused("blocked").is_retryable());
        assert!(!ProviderError::invalid_request("too big").is_retryable());
    }

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(ProviderError::config("no key").is_fatal());
        assert!(!ProviderError::invalid_request("too big").is_fatal());
        assert!(!ProviderError::refused("blocked").is_fatal());
        assert!(!ProviderError::provider("openrouter", "bad key", false).is_fatal());
    }

    #[test]
    fn request_id_comes_from_context() {
        let err = ProviderError::from_status(
            "gemini",
            500,
            "boom".into(),
            None,
            ErrorContext::new()
                .with_status(500)
                .with_request_id(Some("req-1".into())),
        );
        assert_eq!(err.request_id(), Some("req-1"));
        assert_eq!(err.code(), "provider_error");
    }
}
