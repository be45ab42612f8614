#![forbid(unsafe_code)]

//! # ccsi-harness
//!
//! Assembles and repairs the Civilizational Cohesion and Social Inclusivity
//! Index (CCSI): one row per (era, region), 25 qualitative indicators scored
//! 0–4 in five dimensions, with derived dimension and index totals.
//!
//! A generative language model acts as a scoring oracle. Its replies are
//! never trusted blindly: every answer is validated (25 in-range scores, a
//! substantive note, enough distinct sources) and retried with linear
//! backoff. When the oracle cannot deliver, the row falls back to a
//! deterministic interpolation from neighbouring eras and same-era regions.
//!
//! The pieces, bottom-up:
//!
//! - [`indicators`] and [`catalog`]: the fixed indicator, era and region tables
//! - [`dataset`]: records, CSV / JSON Lines IO, totals
//! - [`interpolate`]: neighbour baselines
//! - [`gateway`], [`response`], [`oracle`]: one HTTP exchange, reply
//!   validation, and the retry state machine
//! - [`repair`]: the row repair engine and grid generation

pub mod cache;
pub mod catalog;
pub mod config;
pub mod dataset;
pub mod gateway;
pub mod indicators;
pub mod interpolate;
pub mod logging;
pub mod oracle;
pub mod prompts;
pub mod repair;
pub mod response;

pub use cache::{ReplyCache, ReplyCacheKey, SqliteReplyCache};
pub use catalog::{EraId, RecordKey};
pub use config::{ConfigError, EngineConfig};
pub use dataset::{Dataset, DatasetError, IndicatorRecord};
pub use gateway::{build_gateway, OracleGateway, ProviderError, TextOracle, UsageSink};
pub use indicators::{ScoreVector, Totals};
pub use interpolate::{interpolate_baseline, Baseline};
pub use oracle::{query_with_retry, AttemptState, OracleOutcome, RetryPolicy};
pub use repair::{GenerationPlan, Provenance, RepairReport, RepairedRow, RowRepairEngine};
pub use response::{parse_oracle_reply, ScoreRecord, ValidationError, ValidationRules};
