//! The row repair engine.
//!
//! For each record that needs repair the engine computes an interpolated
//! baseline, asks the oracle for a baseline-seeded rescoring and either writes
//! the validated answer or falls back to the baseline. Records are handled
//! strictly one at a time and a failing record never stops the batch.
//!
//! The same machinery generates rows that are missing from the catalog grid
//! (see [`GenerationPlan`]).

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{ReplyCache, ReplyCacheKey};
use crate::catalog::{historical_grid, modern_grid, RecordKey};
use crate::config::EngineConfig;
use crate::dataset::{Dataset, DatasetError, IndicatorRecord};
use crate::gateway::TextOracle;
use crate::indicators::ScoreVector;
use crate::interpolate::{interpolate_baseline, Baseline};
use crate::oracle::{query_with_retry, OracleOutcome, RetryPolicy};
use crate::prompts::{PromptInstance, PromptTemplate, RowContext, MODERN_V1, REPAIR_V1, SCORE_V1};
use crate::response::{parse_oracle_reply, ScoreRecord, ValidationRules};

pub const INTERPOLATED_NOTE: &str =
    "Automatically interpolated row; oracle reply unavailable after retries.";
pub const INTERPOLATED_SOURCES: &str =
    "Interpolated from neighbouring eras and regions; see surrounding Sources_List entries.";

pub const HISTORICAL_FALLBACK_NOTE: &str = "Parsing failed; placeholder summary.";
pub const HISTORICAL_FALLBACK_SOURCES: &str = "Parsing failed; placeholder sources.";

pub const MODERN_FALLBACK_SCORE: u8 = 2;
/// Modern-row notes are shorter; the plan caps the configured minimum here.
pub const MODERN_MIN_NOTE_LENGTH: usize = 60;
pub const MODERN_FALLBACK_NOTE: &str =
    "Fallback: scores set to moderate (2) for all indicators; oracle reply unavailable after retries.";
pub const MODERN_FALLBACK_SOURCES: &str =
    "Fallback: generic reference to Census of India; NSSO/PLFS; NFHS; state development reports.";

// =============================================================================
// Results
// =============================================================================

/// Where a row's final scores came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// A live oracle reply passed validation.
    Oracle,
    /// A cached reply passed validation; no outbound call.
    Cached,
    /// No usable reply; deterministic fallback.
    Fallback,
}

/// The decided content for one record, not yet written to the dataset.
#[derive(Debug, Clone)]
pub struct RepairedRow {
    pub key: RecordKey,
    pub scores: ScoreVector,
    pub notes: String,
    pub sources: String,
    pub interpolated: bool,
    pub provenance: Provenance,
    /// Live oracle attempts spent on this row.
    pub attempts: u32,
}

impl RepairedRow {
    fn from_answer(key: RecordKey, record: ScoreRecord, provenance: Provenance, attempts: u32) -> Self {
        Self {
            key,
            sources: record.sources_joined(),
            scores: record.scores,
            notes: record.notes,
            interpolated: false,
            provenance,
            attempts,
        }
    }

    /// Write scores, note, sources and the interpolation flag. Totals are
    /// left to the batch-level recompute.
    pub fn apply_to(&self, record: &mut IndicatorRecord) {
        record.set_scores(&self.scores);
        record.notes = self.notes.clone();
        record.sources = self.sources.clone();
        record.interpolated = self.interpolated;
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RepairReport {
    pub run_id: Option<Uuid>,
    pub selected: usize,
    pub oracle: usize,
    pub cached: usize,
    pub interpolated: usize,
    pub oracle_attempts: u32,
    pub totals_changed: usize,
}

impl RepairReport {
    fn count(&mut self, row: &RepairedRow) {
        self.oracle_attempts += row.attempts;
        match row.provenance {
            Provenance::Oracle => self.oracle += 1,
            Provenance::Cached => self.cached += 1,
            Provenance::Fallback => self.interpolated += 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationReport {
    pub run_id: Option<Uuid>,
    pub skipped_existing: usize,
    pub generated: usize,
    pub oracle: usize,
    pub cached: usize,
    pub fallback: usize,
}

// =============================================================================
// Generation plans
// =============================================================================

/// Which catalog grid to fill, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPlan {
    /// `E01..E28` over the historical regions, delimited replies. Failed rows
    /// get placeholder text so a later repair pass picks them up.
    Historical,
    /// `M01..M05` over the modern regions, JSON replies with modern proxies.
    Modern,
}

impl GenerationPlan {
    pub fn grid(self) -> Vec<RecordKey> {
        match self {
            GenerationPlan::Historical => historical_grid(),
            GenerationPlan::Modern => modern_grid(),
        }
    }

    pub fn template(self) -> PromptTemplate {
        match self {
            GenerationPlan::Historical => SCORE_V1,
            GenerationPlan::Modern => MODERN_V1,
        }
    }

    /// Acceptance rules for replies generated under this plan.
    pub fn rules(self, base: ValidationRules) -> ValidationRules {
        match self {
            GenerationPlan::Historical => base,
            GenerationPlan::Modern => ValidationRules {
                min_note_length: base.min_note_length.min(MODERN_MIN_NOTE_LENGTH),
                ..base
            },
        }
    }

    fn fallback(self, key: RecordKey) -> RepairedRow {
        let (scores, notes, sources) = match self {
            GenerationPlan::Historical => (
                ScoreVector::zero(),
                HISTORICAL_FALLBACK_NOTE,
                HISTORICAL_FALLBACK_SOURCES,
            ),
            GenerationPlan::Modern => (
                ScoreVector::uniform(MODERN_FALLBACK_SCORE),
                MODERN_FALLBACK_NOTE,
                MODERN_FALLBACK_SOURCES,
            ),
        };
        RepairedRow {
            key,
            scores,
            notes: notes.to_string(),
            sources: sources.to_string(),
            interpolated: false,
            provenance: Provenance::Fallback,
            attempts: 0,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

enum Answer {
    Live { record: ScoreRecord, attempts: u32 },
    Cached(ScoreRecord),
    None { attempts: u32 },
}

pub struct RowRepairEngine {
    /// `None` runs offline: every row takes the fallback.
    oracle: Option<Arc<dyn TextOracle>>,
    cache: Option<Arc<dyn ReplyCache>>,
    rules: ValidationRules,
    policy: RetryPolicy,
    inter_call_delay: Duration,
    run_id: Option<Uuid>,
}

impl RowRepairEngine {
    pub fn new(oracle: Arc<dyn TextOracle>, config: &EngineConfig) -> Self {
        Self {
            oracle: Some(oracle),
            ..Self::offline(config)
        }
    }

    /// An engine that never calls out: repairs write the interpolated
    /// baseline and generation writes each plan's fallback.
    pub fn offline(config: &EngineConfig) -> Self {
        Self {
            oracle: None,
            cache: None,
            rules: ValidationRules::from(config),
            policy: RetryPolicy::from(config),
            inter_call_delay: config.inter_call_delay,
            run_id: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn ReplyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Stamp reports with this batch run id.
    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn rules(&self) -> &ValidationRules {
        &self.rules
    }

    /// Decide the new content for one record without touching the dataset.
    ///
    /// Returns `None` if `key` is not in the dataset.
    pub async fn repair_row(&self, dataset: &Dataset, key: &RecordKey) -> Option<RepairedRow> {
        let record = dataset.get(&key.era, &key.region)?;
        let baseline = interpolate_baseline(dataset, &key.era, &key.region);
        debug!(
            record = %key,
            predecessor = ?baseline.predecessor,
            successor = ?baseline.successor,
            peers = baseline.peer_regions.len(),
            "baseline computed"
        );

        let prompt = REPAIR_V1.render(&RowContext {
            era: &key.era,
            region: &key.region,
            start_year: record.start_year,
            end_year: record.end_year,
            baseline: Some(&baseline.scores),
        });

        Some(match self.ask(&prompt, key, &self.rules).await {
            Answer::Live { record, attempts } => {
                RepairedRow::from_answer(key.clone(), record, Provenance::Oracle, attempts)
            }
            Answer::Cached(record) => {
                RepairedRow::from_answer(key.clone(), record, Provenance::Cached, 0)
            }
            Answer::None { attempts } => interpolated_row(key.clone(), &baseline, attempts),
        })
    }

    /// Repair every record that needs it, in dataset order, then recompute
    /// totals dataset-wide.
    pub async fn repair_all(&self, dataset: &mut Dataset) -> RepairReport {
        let selected = dataset.records_needing_repair();
        let mut report = RepairReport {
            run_id: self.run_id,
            selected: selected.len(),
            ..RepairReport::default()
        };
        info!(rows = selected.len(), "repairing records");

        let mut pending_delay = false;
        for key in &selected {
            if pending_delay {
                sleep(self.inter_call_delay).await;
            }

            let Some(row) = self.repair_row(dataset, key).await else {
                continue;
            };
            if let Some(record) = dataset.get_mut(&key.era, &key.region) {
                row.apply_to(record);
            }
            info!(
                record = %key,
                provenance = ?row.provenance,
                attempts = row.attempts,
                "record repaired"
            );
            pending_delay = row.attempts > 0;
            report.count(&row);
        }

        report.totals_changed = dataset.recompute_totals();
        info!(
            oracle = report.oracle,
            cached = report.cached,
            interpolated = report.interpolated,
            "repair batch finished"
        );
        report
    }

    /// Add every grid cell of `plan` not yet in the dataset, in grid order.
    ///
    /// `checkpoint` runs after each new row, with totals already recomputed;
    /// a checkpoint error aborts the batch.
    pub async fn generate_missing<F>(
        &self,
        dataset: &mut Dataset,
        plan: GenerationPlan,
        mut checkpoint: F,
    ) -> Result<GenerationReport, DatasetError>
    where
        F: FnMut(&Dataset) -> Result<(), DatasetError>,
    {
        let mut report = GenerationReport {
            run_id: self.run_id,
            ..GenerationReport::default()
        };
        let template = plan.template();
        let rules = plan.rules(self.rules);

        let mut pending_delay = false;
        for key in plan.grid() {
            if dataset.contains(&key) {
                debug!(record = %key, "already present; skipping");
                report.skipped_existing += 1;
                continue;
            }
            if pending_delay {
                sleep(self.inter_call_delay).await;
            }

            let mut record = IndicatorRecord::placeholder(key.era.clone(), key.region.clone());
            let prompt = template.render(&RowContext {
                era: &key.era,
                region: &key.region,
                start_year: record.start_year,
                end_year: record.end_year,
                baseline: None,
            });

            let row = match self.ask(&prompt, &key, &rules).await {
                Answer::Live { record, attempts } => {
                    report.oracle += 1;
                    RepairedRow::from_answer(key.clone(), record, Provenance::Oracle, attempts)
                }
                Answer::Cached(record) => {
                    report.cached += 1;
                    RepairedRow::from_answer(key.clone(), record, Provenance::Cached, 0)
                }
                Answer::None { attempts } => {
                    report.fallback += 1;
                    RepairedRow {
                        attempts,
                        ..plan.fallback(key.clone())
                    }
                }
            };
            pending_delay = row.attempts > 0;

            row.apply_to(&mut record);
            dataset.insert(record)?;
            report.generated += 1;
            info!(record = %key, provenance = ?row.provenance, "record generated");

            dataset.recompute_totals();
            checkpoint(dataset)?;
        }

        Ok(report)
    }

    /// Cache first, then the live oracle through the retry state machine.
    async fn ask(&self, prompt: &PromptInstance, key: &RecordKey, rules: &ValidationRules) -> Answer {
        let label = key.to_string();
        let Some(oracle) = self.oracle.as_deref() else {
            debug!(record = %label, "offline; using fallback");
            return Answer::None { attempts: 0 };
        };
        let cache_key = self
            .cache
            .as_ref()
            .map(|_| ReplyCacheKey::new(&oracle.identity(), prompt, key));

        if let (Some(cache), Some(cache_key)) = (&self.cache, &cache_key) {
            match cache.get(cache_key).await {
                Ok(Some(raw)) => match parse_oracle_reply(&raw, rules) {
                    Ok(record) => {
                        debug!(record = %label, "reply served from cache");
                        return Answer::Cached(record);
                    }
                    Err(err) => {
                        debug!(record = %label, error = %err, "cached reply no longer validates");
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    warn!(error = %err, "Cache read failed; falling back to live oracle");
                }
            }
        }

        match query_with_retry(oracle, prompt, rules, &self.policy, &label).await {
            OracleOutcome::Accepted {
                record,
                raw,
                attempts,
            } => {
                if let (Some(cache), Some(cache_key)) = (&self.cache, &cache_key) {
                    if let Err(err) = cache.put(cache_key, &raw).await {
                        warn!(error = %err, "Cache write failed");
                    }
                }
                Answer::Live { record, attempts }
            }
            OracleOutcome::NoAnswer {
                attempts,
                last_failure,
            } => {
                warn!(
                    record = %label,
                    attempts,
                    reason = last_failure.code(),
                    "no usable oracle reply; using fallback: {last_failure}"
                );
                Answer::None { attempts }
            }
        }
    }
}

fn interpolated_row(key: RecordKey, baseline: &Baseline, attempts: u32) -> RepairedRow {
    if baseline.is_last_resort() {
        warn!(record = %key, "no usable neighbours; interpolated row is all zeros");
    }
    RepairedRow {
        key,
        scores: baseline.scores,
        notes: INTERPOLATED_NOTE.to_string(),
        sources: INTERPOLATED_SOURCES.to_string(),
        interpolated: true,
        provenance: Provenance::Fallback,
        attempts,
    }
}
