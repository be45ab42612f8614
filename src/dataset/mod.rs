//! The CCSI dataset: sparse (era, region) records with derived totals.

pub mod table;

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::catalog::{EraId, RecordKey};
use crate::indicators::{ScoreVector, Totals, INDICATOR_COUNT};

pub use table::{TableFormat, BASE_COLUMNS};

/// Marker the generator writes into notes/sources when a reply could not be used.
pub const PLACEHOLDER_MARKER: &str = "Parsing failed";

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error on line {line}: {source}")]
    Json {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed table: {0}")]
    Malformed(String),
    #[error("missing required column {0:?}")]
    MissingColumn(&'static str),
    #[error("row {row}: {message}")]
    Row { row: usize, message: String },
    #[error("duplicate record {0}")]
    DuplicateKey(RecordKey),
    #[error("unsupported dataset format for {0:?} (expected .csv or .jsonl)")]
    UnsupportedFormat(String),
}

// =============================================================================
// Records
// =============================================================================

/// One (era, region) row of the dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorRecord {
    pub era: EraId,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    pub region: String,
    /// Indicator scores in column order; `None` marks a missing or unreadable cell.
    pub scores: [Option<u8>; INDICATOR_COUNT],
    #[serde(default)]
    pub totals: Totals,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub interpolated: bool,
    #[serde(default)]
    pub sources: String,
    /// Columns this crate does not know about, carried through unchanged.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl IndicatorRecord {
    /// An empty row for a catalogued cell, with years filled from the era table.
    pub fn placeholder(era: EraId, region: impl Into<String>) -> Self {
        let years = era.years();
        Self {
            era,
            start_year: years.map(|(s, _)| s),
            end_year: years.map(|(_, e)| e),
            region: region.into(),
            scores: [None; INDICATOR_COUNT],
            totals: Totals::default(),
            notes: String::new(),
            interpolated: false,
            sources: String::new(),
            extra: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.era.clone(), self.region.clone())
    }

    pub fn matches(&self, era: &EraId, region: &str) -> bool {
        &self.era == era && self.region == region
    }

    /// The full score vector, if every indicator is present and in range.
    pub fn score_vector(&self) -> Option<ScoreVector> {
        let mut raw = [0u8; INDICATOR_COUNT];
        for (slot, score) in raw.iter_mut().zip(self.scores.iter()) {
            *slot = (*score)?;
        }
        ScoreVector::new(raw).ok()
    }

    /// Failed or empty rows: a placeholder marker in notes/sources, or no
    /// non-zero indicator at all.
    pub fn needs_repair(&self) -> bool {
        if self.notes.contains(PLACEHOLDER_MARKER) || self.sources.contains(PLACEHOLDER_MARKER) {
            return true;
        }
        self.scores.iter().all(|s| matches!(s, None | Some(0)))
    }

    /// Usable as an interpolation neighbour.
    pub fn has_valid_indicators(&self) -> bool {
        !self.needs_repair() && self.score_vector().is_some()
    }

    pub fn set_scores(&mut self, scores: &ScoreVector) {
        for (slot, value) in self.scores.iter_mut().zip(scores.as_array()) {
            *slot = Some(*value);
        }
    }

    pub fn computed_totals(&self) -> Totals {
        Totals::from_scores(&self.scores)
    }

    pub fn recompute_totals(&mut self) {
        self.totals = self.computed_totals();
    }

    pub fn totals_consistent(&self) -> bool {
        self.totals == self.computed_totals()
    }

    /// Number of indicator cells that are missing or unreadable.
    pub fn missing_scores(&self) -> usize {
        self.scores.iter().filter(|s| s.is_none()).count()
    }
}

// =============================================================================
// Dataset
// =============================================================================

/// Row counts by era series, as reported for the working dataset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SeriesCounts {
    pub historical: usize,
    pub modern: usize,
    pub other: usize,
}

impl SeriesCounts {
    pub fn total(&self) -> usize {
        self.historical + self.modern + self.other
    }
}

/// Ordered collection of records, unique by (era, region).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    records: Vec<IndicatorRecord>,
    extra_columns: Vec<String>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<IndicatorRecord>) -> Result<Self, DatasetError> {
        let mut dataset = Self::new();
        for record in records {
            dataset.insert(record)?;
        }
        Ok(dataset)
    }

    pub fn records(&self) -> &[IndicatorRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Unknown columns in first-seen order.
    pub fn extra_columns(&self) -> &[String] {
        &self.extra_columns
    }

    pub fn position(&self, era: &EraId, region: &str) -> Option<usize> {
        self.records.iter().position(|r| r.matches(era, region))
    }

    pub fn get(&self, era: &EraId, region: &str) -> Option<&IndicatorRecord> {
        self.records.iter().find(|r| r.matches(era, region))
    }

    pub fn get_mut(&mut self, era: &EraId, region: &str) -> Option<&mut IndicatorRecord> {
        self.records.iter_mut().find(|r| r.matches(era, region))
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.position(&key.era, &key.region).is_some()
    }

    pub fn insert(&mut self, record: IndicatorRecord) -> Result<(), DatasetError> {
        if self.contains(&record.key()) {
            return Err(DatasetError::DuplicateKey(record.key()));
        }
        for name in record.extra.keys() {
            if !self.extra_columns.contains(name) {
                self.extra_columns.push(name.clone());
            }
        }
        self.records.push(record);
        Ok(())
    }

    /// Keys of rows needing repair, in dataset order.
    pub fn records_needing_repair(&self) -> Vec<RecordKey> {
        self.records
            .iter()
            .filter(|r| r.needs_repair())
            .map(IndicatorRecord::key)
            .collect()
    }

    /// Recompute D1..D5 and CCSI totals for every row; returns how many changed.
    ///
    /// Missing indicator cells count as zero, so this never fails partway.
    pub fn recompute_totals(&mut self) -> usize {
        let mut changed = 0;
        for record in &mut self.records {
            let totals = record.computed_totals();
            if record.totals != totals {
                record.totals = totals;
                changed += 1;
            }
        }
        changed
    }

    /// Keys of rows whose stored totals disagree with their indicators.
    pub fn inconsistent_totals(&self) -> Vec<RecordKey> {
        self.records
            .iter()
            .filter(|r| !r.totals_consistent())
            .map(IndicatorRecord::key)
            .collect()
    }

    /// Drop hypothetical future eras (`E23` onward), keeping row order.
    pub fn without_future_eras(&self) -> Dataset {
        Dataset {
            records: self
                .records
                .iter()
                .filter(|r| !r.era.is_future_scenario())
                .cloned()
                .collect(),
            extra_columns: self.extra_columns.clone(),
        }
    }

    pub fn series_counts(&self) -> SeriesCounts {
        let mut counts = SeriesCounts::default();
        for record in &self.records {
            match record.era.series() {
                'E' => counts.historical += 1,
                'M' => counts.modern += 1,
                _ => counts.other += 1,
            }
        }
        counts
    }

    /// Load a `.csv` or `.jsonl` dataset, choosing the codec by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let format = TableFormat::from_path(path)?;
        let raw = std::fs::read_to_string(path)?;
        let dataset = format.decode(&raw)?;
        info!(path = %path.display(), rows = dataset.len(), "loaded dataset");
        Ok(dataset)
    }

    /// Load if the file exists, otherwise start empty.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "no existing dataset found");
            Ok(Self::new())
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DatasetError> {
        let path = path.as_ref();
        let format = TableFormat::from_path(path)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, format.encode(self)?)?;
        info!(path = %path.display(), rows = self.len(), "saved dataset");
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
