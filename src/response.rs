//! Parsing and validation of oracle replies.
//!
//! Two payload shapes are accepted:
//!
//! - a JSON object `{"scores": [...], "notes": "...", "sources": [...]}`,
//!   possibly wrapped in code fences or surrounded by prose;
//! - a delimited record `scores_csv|notes|sources` on the last non-empty
//!   line, sources separated by `;`.
//!
//! Scores are coerced to integers (floats round half away from zero) and must
//! already lie in range. Out-of-range scores are rejected, never clamped.

use serde_json::Value;
use thiserror::Error;

use crate::config::EngineConfig;
use crate::indicators::{ScoreVector, INDICATOR_COUNT, SCORE_MAX, SCORE_MIN};

/// Why a reply was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("unparseable reply: {0}")]
    Unparseable(String),
    #[error("expected {expected} scores, got {got}")]
    ScoreCount { expected: usize, got: usize },
    #[error("score #{index} is not numeric")]
    ScoreNotNumeric { index: usize },
    #[error("score #{index} = {value} is outside [0, 4]")]
    ScoreOutOfRange { index: usize, value: i64 },
    #[error("note has {len} characters, need at least {min}")]
    NoteTooShort { len: usize, min: usize },
    #[error("{got} distinct sources, need at least {min}")]
    TooFewSources { got: usize, min: usize },
}

impl ValidationError {
    /// Short code for logs and reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unparseable(_) => "unparseable",
            Self::ScoreCount { .. } => "score_count",
            Self::ScoreNotNumeric { .. } => "score_not_numeric",
            Self::ScoreOutOfRange { .. } => "score_out_of_range",
            Self::NoteTooShort { .. } => "note_too_short",
            Self::TooFewSources { .. } => "too_few_sources",
        }
    }
}

/// Acceptance thresholds for notes and sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidationRules {
    pub min_note_length: usize,
    pub min_source_count: usize,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            min_note_length: 80,
            min_source_count: 3,
        }
    }
}

impl From<&EngineConfig> for ValidationRules {
    fn from(config: &EngineConfig) -> Self {
        Self {
            min_note_length: config.min_note_length,
            min_source_count: config.min_source_count,
        }
    }
}

/// A fully validated oracle answer.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreRecord {
    pub scores: ScoreVector,
    pub notes: String,
    /// Distinct, trimmed, in reply order.
    pub sources: Vec<String>,
}

impl ScoreRecord {
    /// Sources in the persisted `Sources_List` form.
    pub fn sources_joined(&self) -> String {
        self.sources.join("; ")
    }
}

/// Parse and validate one raw reply.
pub fn parse_oracle_reply(raw: &str, rules: &ValidationRules) -> Result<ScoreRecord, ValidationError> {
    let draft = match parse_json_payload(raw) {
        Some(draft) => draft?,
        None => parse_delimited_payload(raw)?,
    };
    draft.validate(rules)
}

/// Fields pulled out of a reply before any checks.
struct Draft {
    scores: Vec<Cell>,
    notes: String,
    sources: Vec<String>,
}

/// One score as it appeared in the reply.
enum Cell {
    Number(f64),
    Other,
}

impl Draft {
    fn validate(self, rules: &ValidationRules) -> Result<ScoreRecord, ValidationError> {
        if self.scores.len() != INDICATOR_COUNT {
            return Err(ValidationError::ScoreCount {
                expected: INDICATOR_COUNT,
                got: self.scores.len(),
            });
        }

        let mut scores = [0u8; INDICATOR_COUNT];
        for (index, (slot, cell)) in scores.iter_mut().zip(&self.scores).enumerate() {
            let value = match cell {
                Cell::Number(v) if v.is_finite() => v.round(),
                _ => return Err(ValidationError::ScoreNotNumeric { index }),
            };
            if value < f64::from(SCORE_MIN) || value > f64::from(SCORE_MAX) {
                return Err(ValidationError::ScoreOutOfRange {
                    index,
                    value: value as i64,
                });
            }
            *slot = value as u8;
        }
        let scores = ScoreVector::new(scores).map_err(|e| ValidationError::Unparseable(e.to_string()))?;

        let notes = self.notes.trim().to_string();
        let len = notes.chars().count();
        if len < rules.min_note_length {
            return Err(ValidationError::NoteTooShort {
                len,
                min: rules.min_note_length,
            });
        }

        let mut sources: Vec<String> = Vec::with_capacity(self.sources.len());
        for source in self.sources {
            let source = source.trim();
            if !source.is_empty() && !sources.iter().any(|s| s == source) {
                sources.push(source.to_string());
            }
        }
        if sources.len() < rules.min_source_count {
            return Err(ValidationError::TooFewSources {
                got: sources.len(),
                min: rules.min_source_count,
            });
        }

        Ok(ScoreRecord {
            scores,
            notes,
            sources,
        })
    }
}

// =============================================================================
// JSON SHAPE
// =============================================================================

/// `None` when the reply holds no JSON object with a `scores` key, so the
/// delimited shape gets a chance.
fn parse_json_payload(raw: &str) -> Option<Result<Draft, ValidationError>> {
    let candidate = extract_json(strip_code_fence(raw));
    let value: Value = serde_json::from_str(candidate).ok()?;
    let object = value.as_object()?;
    let scores = object.get("scores")?;

    let Some(scores) = scores.as_array() else {
        return Some(Err(ValidationError::Unparseable(
            "\"scores\" is not an array".to_string(),
        )));
    };
    let scores = scores.iter().map(json_cell).collect();

    let notes = object
        .get("notes")
        .or_else(|| object.get("note"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let sources = match object.get("sources") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Some(Value::String(joined)) => split_sources(joined),
        _ => Vec::new(),
    };

    Some(Ok(Draft {
        scores,
        notes,
        sources,
    }))
}

fn json_cell(value: &Value) -> Cell {
    match value {
        Value::Number(n) => n.as_f64().map_or(Cell::Other, Cell::Number),
        Value::String(s) => text_cell(s),
        _ => Cell::Other,
    }
}

fn text_cell(s: &str) -> Cell {
    s.trim().parse::<f64>().map_or(Cell::Other, Cell::Number)
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

/// Locate the first balanced JSON object in a reply that may carry prose.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        if let Some(end) = find_matching_brace(remainder) {
            return &remainder[..end];
        }
    }
    trimmed
}

/// Find the byte offset just past the matching closing brace, respecting
/// JSON strings so braces within `"..."` are not counted.
fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if c == '\\' && in_string {
            escape = true;
            continue;
        }
        if c == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// DELIMITED SHAPE
// =============================================================================

fn parse_delimited_payload(raw: &str) -> Result<Draft, ValidationError> {
    let last_line = raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .last()
        .ok_or_else(|| ValidationError::Unparseable("empty reply".to_string()))?;

    let parts: Vec<&str> = last_line.split('|').collect();
    let [scores, notes, sources] = parts.as_slice() else {
        return Err(ValidationError::Unparseable(format!(
            "expected scores|notes|sources, got {} fields",
            parts.len()
        )));
    };

    Ok(Draft {
        scores: scores.split(',').map(text_cell).collect(),
        notes: notes.to_string(),
        sources: split_sources(sources),
    })
}

fn split_sources(joined: &str) -> Vec<String> {
    joined.split(';').map(|s| s.trim().to_string()).collect()
}

// =============================================================================
// TESTS
// =============================================================================
