//! Per-call usage reporting.
//!
//! The gateway hands every call, failed or not, to a [`UsageSink`]. The CLI
//! uses [`TracingUsageSink`], which writes one event per call into the run
//! log and keeps running totals for the end-of-run summary.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::types::Attribution;

/// How one call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    /// Carries the short error code, see [`super::ProviderError::code`].
    Failed(&'static str),
}

#[derive(Debug, Clone)]
pub struct OracleCallRecord {
    pub provider: &'static str,
    pub model: String,
    pub caller: &'static str,
    pub run_id: Option<Uuid>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub outcome: CallOutcome,
    pub request_id: Option<String>,
    pub at: DateTime<Utc>,
}

impl OracleCallRecord {
    pub fn new(provider: &'static str, model: impl Into<String>, attribution: &Attribution) -> Self {
        Self {
            provider,
            model: model.into(),
            caller: attribution.caller,
            run_id: attribution.run_id,
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: 0,
            outcome: CallOutcome::Ok,
            request_id: None,
            at: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn failed(mut self, code: &'static str) -> Self {
        self.outcome = CallOutcome::Failed(code);
        self
    }

    pub fn request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }
}

/// Receives one record per oracle call. Never fails the call it reports on.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn record(&self, record: OracleCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: OracleCallRecord) {}
}

/// Totals over every call a sink has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub failed_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Default)]
pub struct TracingUsageSink {
    calls: AtomicU64,
    failed_calls: AtomicU64,
    input_tokens: AtomicU64,
    output_tokens: AtomicU64,
}

impl TracingUsageSink {
    pub fn totals(&self) -> UsageTotals {
        UsageTotals {
            calls: self.calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            input_tokens: self.input_tokens.load(Ordering::Relaxed),
            output_tokens: self.output_tokens.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: OracleCallRecord) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.input_tokens
            .fetch_add(u64::from(record.input_tokens), Ordering::Relaxed);
        self.output_tokens
            .fetch_add(u64::from(record.output_tokens), Ordering::Relaxed);

        let run_id = record.run_id.map(|id| id.to_string()).unwrap_or_default();
        match record.outcome {
            CallOutcome::Ok => info!(
                target: "ccsi_harness::usage",
                provider = record.provider,
                model = %record.model,
                caller = record.caller,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                latency_ms = record.latency_ms,
                run_id = %run_id,
                "oracle call"
            ),
            CallOutcome::Failed(code) => {
                self.failed_calls.fetch_add(1, Ordering::Relaxed);
                warn!(
                    target: "ccsi_harness::usage",
                    provider = record.provider,
                    model = %record.model,
                    caller = record.caller,
                    error_code = code,
                    request_id = record.request_id.as_deref().unwrap_or(""),
                    run_id = %run_id,
                    "oracle call failed"
                );
            }
        }
    }
}
