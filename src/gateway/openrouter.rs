//! OpenRouter adapter: the prompt goes out as a single user chat message.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;
use super::{
    extract_request_id, parse_retry_after, read_capped_body, TextProvider, MAX_INPUT_CHARS,
};

/// OpenRouter API adapter for chat completions.
#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl OpenRouterAdapter {
    /// Create from API key.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(
            api_key,
            ProviderKind::OpenRouter.default_endpoint(),
            Duration::from_secs(120),
        )
    }

    /// Create with custom configuration.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);
        headers.insert("X-Title", HeaderValue::from_static("ccsi-harness"));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: [ApiMessage<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

// =============================================================================
// PROVIDER IMPL
// =============================================================================

#[async_trait]
impl TextProvider for OpenRouterAdapter {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    async fn generate(&self, req: &OracleRequest) -> Result<OracleResponse, ProviderError> {
        if req.prompt.len() > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {} chars (max {MAX_INPUT_CHARS})",
                req.prompt.len()
            )));
        }

        let start = Instant::now();

        let api_req = ChatApiRequest {
            model: &req.model,
            messages: [ApiMessage {
                role: "user",
                content: &req.prompt,
            }],
            temperature: req.temperature,
            response_format: req.json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.timeout)
                } else {
                    ProviderError::Http(e)
                }
            })?;

        let status = response.status();
        let request_id = extract_request_id(response.headers());
        let retry_after = parse_retry_after(response.headers());
        let body = read_capped_body("openrouter", response).await?;

        let ctx = ErrorContext::new()
            .with_status(status.as_u16())
            .with_request_id(request_id.clone());

        if !status.is_success() {
            let parsed = serde_json::from_str::<ChatApiResponse>(&body).ok();
            let api_error = parsed.and_then(|p| p.error);
            let (message, ctx) = match api_error {
                Some(error) => {
                    let ctx = match error.code {
                        Some(code) => ctx.with_code(code.to_string().trim_matches('"')),
                        None => ctx,
                    };
                    (error.message.unwrap_or_default(), ctx)
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };

            return Err(ProviderError::from_status(
                "openrouter",
                status.as_u16(),
                message,
                retry_after,
                ctx,
            ));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider("openrouter", format!("Invalid JSON: {e}"), true)
        })?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            return Err(ProviderError::provider("openrouter", message, true));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::provider("openrouter", "No choices in response", true))?;

        let text = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();

        // Wording is left to reply validation; only a filtered, empty
        // choice counts as a refusal.
        let finish_reason = FinishReason::from(choice.finish_reason);
        if text.trim().is_empty() {
            if finish_reason == FinishReason::ContentFilter {
                return Err(ProviderError::refused("choice blocked by content filter"));
            }
            return Err(ProviderError::provider("openrouter", "Empty reply text", true));
        }

        let usage = parsed.usage;
        Ok(OracleResponse {
            text,
            input_tokens: usage.as_ref().and_then(|u| u.prompt_tokens).unwrap_or(0),
            output_tokens: usage.as_ref().and_then(|u| u.completion_tokens).unwrap_or(0),
            latency: start.elapsed(),
            finish_reason,
            request_id,
        })
    }
}
