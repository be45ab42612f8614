//! Query the oracle until a reply validates or the attempt budget runs out.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Attempting(n) --valid reply---------------------> Succeeded
//! Attempting(n) --failure, n < max----------------> Attempting(n + 1)
//! Attempting(n) --failure, n == max or fatal------> ExhaustedFallback
//! ```
//!
//! Validation failures and transport errors are retried alike; only a
//! configuration error ends the loop early. Between `Attempting(n)` and
//! `Attempting(n + 1)` the loop sleeps `backoff_base * n`. Exhaustion is an
//! ordinary outcome, not an error.

use std::fmt;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::gateway::{ProviderError, TextOracle};
use crate::prompts::PromptInstance;
use crate::response::{parse_oracle_reply, ScoreRecord, ValidationError, ValidationRules};

/// Attempt budget and linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first one included. Zero is treated as one.
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
        }
    }

    /// Pause after failed attempt `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff_base.saturating_mul(attempt)
    }

    fn cap(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2))
    }
}

impl From<&EngineConfig> for RetryPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self::new(config.max_retries, config.retry_backoff_base)
    }
}

/// Why one attempt did not produce an answer.
#[derive(Debug)]
pub enum AttemptFailure {
    Transport(ProviderError),
    Invalid(ValidationError),
}

impl AttemptFailure {
    fn is_fatal(&self) -> bool {
        match self {
            AttemptFailure::Transport(err) => err.is_fatal(),
            AttemptFailure::Invalid(_) => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AttemptFailure::Transport(err) => err.code(),
            AttemptFailure::Invalid(err) => err.code(),
        }
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Transport(err) => write!(f, "transport: {err}"),
            AttemptFailure::Invalid(err) => write!(f, "validation: {err}"),
        }
    }
}

/// Retry loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Attempting(u32),
    Succeeded,
    ExhaustedFallback,
}

impl AttemptState {
    pub fn start() -> Self {
        AttemptState::Attempting(1)
    }

    /// Transition after an attempt; `failure` is `None` when the reply validated.
    pub fn advance(self, failure: Option<&AttemptFailure>, policy: &RetryPolicy) -> Self {
        let AttemptState::Attempting(n) = self else {
            return self;
        };
        match failure {
            None => AttemptState::Succeeded,
            Some(f) if f.is_fatal() || n >= policy.cap() => AttemptState::ExhaustedFallback,
            Some(_) => AttemptState::Attempting(n + 1),
        }
    }
}

/// Final result of [`query_with_retry`].
#[derive(Debug)]
pub enum OracleOutcome {
    Accepted {
        record: ScoreRecord,
        /// The reply text that validated, kept for the reply cache.
        raw: String,
        attempts: u32,
    },
    NoAnswer {
        attempts: u32,
        last_failure: AttemptFailure,
    },
}

impl OracleOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            OracleOutcome::Accepted { attempts, .. } | OracleOutcome::NoAnswer { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Ask `oracle` with `prompt` until a reply passes `rules`. `label` names
/// the record in log lines.
pub async fn query_with_retry(
    oracle: &dyn TextOracle,
    prompt: &PromptInstance,
    rules: &ValidationRules,
    policy: &RetryPolicy,
    label: &str,
) -> OracleOutcome {
    let mut attempt = 1;
    loop {
        let failure = match oracle.request(prompt).await {
            Ok(raw) => match parse_oracle_reply(&raw, rules) {
                Ok(record) => {
                    debug!(record = label, attempt, "oracle reply accepted");
                    return OracleOutcome::Accepted {
                        record,
                        raw,
                        attempts: attempt,
                    };
                }
                Err(err) => {
                    warn!(
                        record = label,
                        attempt,
                        reason = err.code(),
                        raw_reply = %raw,
                        "oracle reply rejected: {err}"
                    );
                    AttemptFailure::Invalid(err)
                }
            },
            Err(err) => {
                warn!(
                    record = label,
                    attempt,
                    code = err.code(),
                    provider_retryable = err.is_retryable(),
                    "oracle request failed: {err}"
                );
                AttemptFailure::Transport(err)
            }
        };

        match AttemptState::Attempting(attempt).advance(Some(&failure), policy) {
            AttemptState::Attempting(next) => {
                sleep(policy.delay_after(attempt)).await;
                attempt = next;
            }
            AttemptState::Succeeded | AttemptState::ExhaustedFallback => {
                return OracleOutcome::NoAnswer {
                    attempts: attempt,
                    last_failure: failure,
                };
            }
        }
    }
}
