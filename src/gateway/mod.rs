//! Oracle gateway: one HTTP exchange per attempt against Gemini or OpenRouter.
//!
//! Retries live above this layer (see [`crate::oracle`]) because a reply that
//! arrives fine over HTTP can still fail validation and must be retried the
//! same way as a transport error.

pub mod error;
pub mod gemini;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::prompts::{PromptInstance, ReplyShape};
use gemini::GeminiAdapter;
use openrouter::OpenRouterAdapter;
use usage::OracleCallRecord;

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink, UsageTotals};

/// Maximum response size (1MB).
pub(crate) const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum prompt size in characters.
pub(crate) const MAX_INPUT_CHARS: usize = 500_000;

/// One vendor API.
#[async_trait]
pub trait TextProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn generate(&self, req: &OracleRequest) -> Result<OracleResponse, ProviderError>;
}

/// The oracle contract the engine depends on: a rendered prompt in, reply
/// text out.
#[async_trait]
pub trait TextOracle: Send + Sync {
    async fn request(&self, prompt: &PromptInstance) -> Result<String, ProviderError>;

    /// Stable identity of the backing model, used in reply cache keys.
    fn identity(&self) -> String;
}

/// Wraps a provider with a fixed model and usage reporting.
pub struct OracleGateway<U: UsageSink> {
    provider: Box<dyn TextProvider>,
    model: String,
    temperature: Option<f32>,
    run_id: Option<Uuid>,
    usage_sink: Arc<U>,
}

impl<U: UsageSink> OracleGateway<U> {
    pub fn new(provider: Box<dyn TextProvider>, model: impl Into<String>, usage_sink: Arc<U>) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature: None,
            run_id: None,
            usage_sink,
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Tag every usage record with this batch run.
    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn usage_sink(&self) -> &Arc<U> {
        &self.usage_sink
    }

    /// Send one request and report its usage, success or not.
    pub async fn generate(&self, req: &OracleRequest) -> Result<OracleResponse, ProviderError> {
        let started = std::time::Instant::now();
        let result = self.provider.generate(req).await;

        let record = OracleCallRecord::new(self.provider.name(), &req.model, &req.attribution);
        let record = match &result {
            Ok(resp) => record
                .tokens(resp.input_tokens, resp.output_tokens)
                .latency(resp.latency.as_millis() as u64)
                .request_id(resp.request_id.clone()),
            Err(err) => record
                .latency(started.elapsed().as_millis() as u64)
                .request_id(err.request_id().map(str::to_string))
                .failed(err.code()),
        };
        self.usage_sink.record(record).await;

        result
    }
}

#[async_trait]
impl<U: UsageSink> TextOracle for OracleGateway<U> {
    async fn request(&self, prompt: &PromptInstance) -> Result<String, ProviderError> {
        let attribution = match self.run_id {
            Some(run_id) => Attribution::new("oracle::request").with_run(run_id),
            None => Attribution::new("oracle::request"),
        };
        let mut req = OracleRequest::new(&self.model, prompt.text.as_str(), attribution);
        req.temperature = self.temperature;
        req.json_mode = prompt.shape == ReplyShape::Json;
        self.generate(&req).await.map(|resp| resp.text)
    }

    fn identity(&self) -> String {
        format!("{}/{}", self.provider.name(), self.model)
    }
}

/// Build the configured gateway. Fails when no credential is available.
pub fn build_gateway(config: &EngineConfig) -> Result<OracleGateway<TracingUsageSink>, ProviderError> {
    let api_key = config
        .api_credential
        .clone()
        .ok_or_else(|| ProviderError::config("no API credential configured (set CCSI_API_KEY)"))?;
    let endpoint = config.endpoint();

    let provider: Box<dyn TextProvider> = match config.provider {
        ProviderKind::Gemini => Box::new(GeminiAdapter::with_config(
            api_key,
            endpoint,
            config.request_timeout,
        )?),
        ProviderKind::OpenRouter => Box::new(OpenRouterAdapter::with_config(
            api_key,
            endpoint,
            config.request_timeout,
        )?),
    };

    Ok(OracleGateway::new(provider, &config.model, Arc::new(TracingUsageSink::default()))
        .with_temperature(config.temperature))
}

// =============================================================================
// SHARED HTTP HELPERS
// =============================================================================

/// Extract request ID from response headers.
pub(crate) fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    ["x-request-id", "x-goog-request-id"]
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// `Retry-After` in whole seconds; HTTP-date values are ignored.
pub(crate) fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Stream the body, enforcing [`MAX_RESPONSE_LEN`].
pub(crate) async fn read_capped_body(
    provider: &'static str,
    mut response: reqwest::Response,
) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(ProviderError::provider(
                provider,
                format!("Response too large: {new_len} bytes"),
                false,
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Uppercases the prompt and tags replies requested in JSON mode.
    struct EchoProvider;

    #[async_trait]
    impl TextProvider for EchoProvider {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn generate(&self, req: &OracleRequest) -> Result<OracleResponse, ProviderError> {
            let mut text = req.prompt.to_uppercase();
            if req.json_mode {
                text.push_str(" [json]");
            }
            Ok(OracleResponse {
                text,
                input_tokens: 3,
                output_tokens: 5,
                latency: std::time::Duration::ZERO,
                finish_reason: FinishReason::Stop,
                request_id: None,
            })
        }
    }

    fn prompt(text: &str, shape: ReplyShape) -> PromptInstance {
        PromptInstance {
            template_slug: "test",
            template_hash: String::new(),
            text: text.to_string(),
            shape,
        }
    }

    #[tokio::test]
    async fn gateway_returns_text_and_identity() {
        let gateway = OracleGateway::new(Box::new(EchoProvider), "m1", Arc::new(NoopUsageSink));
        let reply = gateway.request(&prompt("hi", ReplyShape::Delimited)).await.unwrap();
        assert_eq!(reply, "HI");
        assert_eq!(gateway.identity(), "echo/m1");
    }

    #[tokio::test]
    async fn json_prompts_request_json_mode() {
        let gateway = OracleGateway::new(Box::new(EchoProvider), "m1", Arc::new(NoopUsageSink));
        let reply = gateway.request(&prompt("hi", ReplyShape::Json)).await.unwrap();
        assert_eq!(reply, "HI [json]");
    }

    #[tokio::test]
    async fn gateway_reports_every_call() {
        let sink = Arc::new(TracingUsageSink::default());
        let gateway = OracleGateway::new(Box::new(EchoProvider), "m1", sink.clone());
        gateway.request(&prompt("a", ReplyShape::Json)).await.unwrap();
        gateway.request(&prompt("b", ReplyShape::Delimited)).await.unwrap();

        let totals = sink.totals();
        assert_eq!(totals.calls, 2);
        assert_eq!(totals.failed_calls, 0);
        assert_eq!(totals.input_tokens, 6);
        assert_eq!(totals.output_tokens, 10);
    }
}
