//! Google Gemini `generateContent` adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;
use super::{
    extract_request_id, parse_retry_after, read_capped_body, TextProvider, MAX_INPUT_CHARS,
};

/// Gemini REST adapter. The API key travels in the `x-goog-api-key` header,
/// never in the URL, so it cannot leak into request logs.
#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl GeminiAdapter {
    /// Create from API key with the public endpoint.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(
            api_key,
            ProviderKind::Gemini.default_endpoint(),
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
        if api_key.trim().is_empty() {
            return Err(ProviderError::config("Gemini API key is empty"));
        }
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let mut key_value = HeaderValue::from_str(&api_key)
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        key_value.set_sensitive(true);
        headers.insert("x-goog-api-key", key_value);

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

    fn generate_url(&self, model: &str) -> String {
        format!("{}/models/{model}:generateContent", self.base_url)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    usage_metadata: Option<UsageMetadata>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    parts: Option<Vec<CandidatePart>>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u32>,
    candidates_token_count: Option<u32>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    status: Option<String>,
}

// =============================================================================
// PROVIDER IMPL
// =============================================================================

#[async_trait]
impl TextProvider for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn generate(&self, req: &OracleRequest) -> Result<OracleResponse, ProviderError> {
        if req.prompt.len() > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {} chars (max {MAX_INPUT_CHARS})",
                req.prompt.len()
            )));
        }

        let start = Instant::now();

        let generation_config = if req.temperature.is_some() || req.json_mode {
            Some(GenerationConfig {
                temperature: req.temperature,
                response_mime_type: req.json_mode.then_some("application/json"),
            })
        } else {
            None
        };
        let api_req = GenerateRequest {
            contents: [Content {
                role: "user",
                parts: [Part { text: &req.prompt }],
            }],
            generation_config,
        };

        let response = self
            .client
            .post(self.generate_url(&req.model))
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
        let body = read_capped_body("gemini", response).await?;

        let ctx = ErrorContext::new()
            .with_status(status.as_u16())
            .with_request_id(request_id.clone());

        if !status.is_success() {
            let api_error = serde_json::from_str::<GenerateResponse>(&body)
                .ok()
                .and_then(|p| p.error);
            let (message, ctx) = match api_error {
                Some(error) => {
                    let ctx = match error.status {
                        Some(code) => ctx.with_code(code),
                        None => ctx,
                    };
                    (error.message.unwrap_or_default(), ctx)
                }
                None => (format!("HTTP {}", status.as_u16()), ctx),
            };

            return Err(ProviderError::from_status(
                "gemini",
                status.as_u16(),
                message,
                retry_after,
                ctx,
            ));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::provider("gemini", format!("Invalid JSON: {e}"), true))?;

        if let Some(reason) = parsed.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::Refused {
                message: format!("prompt blocked: {reason}"),
                context: Some(ctx),
            });
        }

        let candidate = parsed
            .candidates
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::provider("gemini", "No candidates in response", true))?;

        let text: String = candidate
            .content
            .and_then(|c| c.parts)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p.text)
            .collect();

        let finish_reason = FinishReason::from(candidate.finish_reason);
        if text.trim().is_empty() {
            if finish_reason == FinishReason::ContentFilter {
                return Err(ProviderError::refused("candidate blocked by safety filter"));
            }
            return Err(ProviderError::provider("gemini", "Empty reply text", true));
        }

        let usage = parsed.usage_metadata;
        Ok(OracleResponse {
            text,
            input_tokens: usage.as_ref().and_then(|u| u.prompt_token_count).unwrap_or(0),
            output_tokens: usage
                .as_ref()
                .and_then(|u| u.candidates_token_count)
                .unwrap_or(0),
            latency: start.elapsed(),
            finish_reason,
            request_id,
        })
    }
}
