//! Core types for the oracle gateway.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage tracking and debugging.
///
/// Every request through the gateway carries attribution so usage records
/// can be tied back to the batch run and the code path that made the call.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Batch run this request is part of.
    pub run_id: Option<Uuid>,
    /// Which code path made this call, e.g. "repair::row" or "generate::row".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

// =============================================================================
// PROVIDERS
// =============================================================================

/// Which vendor API the gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Gemini,
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::OpenRouter => "openrouter",
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "https://generativelanguage.googleapis.com/v1beta",
            ProviderKind::OpenRouter => "https://openrouter.ai/api/v1",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gemini" => Ok(ProviderKind::Gemini),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            other => Err(format!("unknown provider {other:?} (expected gemini or openrouter)")),
        }
    }
}

// =============================================================================
// REQUEST / RESPONSE
// =============================================================================

/// A single text-in request to the oracle.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    /// Vendor model id, e.g. "gemini-2.0-flash".
    pub model: String,
    /// The full natural-language task.
    pub prompt: String,
    /// Sampling temperature; provider default when unset.
    pub temperature: Option<f32>,
    /// Whether to ask the provider for a JSON-only reply.
    pub json_mode: bool,
    /// Attribution for usage tracking.
    pub attribution: Attribution,
}

impl OracleRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>, attribution: Attribution) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            temperature: None,
            json_mode: false,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = Some(t);
        self
    }

    pub fn json(mut self) -> Self {
        self.json_mode = true;
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") | Some("max_tokens") => FinishReason::Length,
            Some("content_filter") | Some("safety") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// The oracle's text answer plus accounting.
#[derive(Debug, Clone)]
pub struct OracleResponse {
    /// Generated text.
    pub text: String,
    /// Input tokens consumed.
    pub input_tokens: u32,
    /// Output tokens generated.
    pub output_tokens: u32,
    /// Time taken for the request.
    pub latency: Duration,
    /// Why the model stopped.
    pub finish_reason: FinishReason,
    /// Provider request ID, when the provider reports one.
    pub request_id: Option<String>,
}
