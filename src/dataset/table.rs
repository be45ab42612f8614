//! Tabular codecs for the dataset: RFC-4180 CSV and JSON Lines.
//!
//! Column order and presence are a compatibility contract with the analysis
//! scripts downstream, so the CSV layout is fixed:
//! identifiers, 25 indicators, 6 totals, notes, interpolated flag, sources,
//! then any unknown columns carried through from the input.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use tracing::warn;

use super::{Dataset, DatasetError, IndicatorRecord};
use crate::catalog::EraId;
use crate::indicators::{Totals, INDICATOR_COLUMNS, INDICATOR_COUNT, SCORE_MAX, TOTAL_COLUMNS};

pub const BASE_COLUMNS: [&str; 4] = ["Era_ID", "Era_Start_Year", "Era_End_Year", "Region"];
pub const NOTES_COLUMN: &str = "Notes";
pub const INTERPOLATED_COLUMN: &str = "Interpolated";
pub const SOURCES_COLUMN: &str = "Sources_List";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    JsonLines,
}

impl TableFormat {
    pub fn from_path(path: &Path) -> Result<Self, DatasetError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("csv") => Ok(Self::Csv),
            Some("jsonl") | Some("ndjson") => Ok(Self::JsonLines),
            _ => Err(DatasetError::UnsupportedFormat(path.display().to_string())),
        }
    }

    pub fn decode(self, raw: &str) -> Result<Dataset, DatasetError> {
        match self {
            Self::Csv => decode_csv(raw),
            Self::JsonLines => decode_jsonl(raw),
        }
    }

    pub fn encode(self, dataset: &Dataset) -> Result<String, DatasetError> {
        match self {
            Self::Csv => Ok(encode_csv(dataset)),
            Self::JsonLines => encode_jsonl(dataset),
        }
    }
}

/// Full header in write order for a dataset with the given unknown columns.
pub fn header(extra_columns: &[String]) -> Vec<String> {
    BASE_COLUMNS
        .iter()
        .chain(INDICATOR_COLUMNS.iter())
        .chain(TOTAL_COLUMNS.iter())
        .chain([NOTES_COLUMN, INTERPOLATED_COLUMN, SOURCES_COLUMN].iter())
        .map(|c| c.to_string())
        .chain(extra_columns.iter().cloned())
        .collect()
}

fn is_known_column(name: &str) -> bool {
    BASE_COLUMNS.contains(&name)
        || INDICATOR_COLUMNS.contains(&name)
        || TOTAL_COLUMNS.contains(&name)
        || [NOTES_COLUMN, INTERPOLATED_COLUMN, SOURCES_COLUMN].contains(&name)
}

// =============================================================================
// CSV
// =============================================================================

/// Split CSV text into records of fields, honouring quoted fields that contain
/// delimiters, doubled quotes, or line breaks. Blank lines are skipped.
pub fn parse_csv(raw: &str) -> Result<Vec<Vec<String>>, DatasetError> {
    let raw = raw.strip_prefix('\u{feff}').unwrap_or(raw);
    let mut rows = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut field_started = false;
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                field_started = true;
            }
            ',' => {
                row.push(std::mem::take(&mut field));
                field_started = true;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' | '\r' => {
                if field_started || !field.is_empty() || !row.is_empty() {
                    row.push(std::mem::take(&mut field));
                    rows.push(std::mem::take(&mut row));
                }
                field_started = false;
            }
            _ => {
                field.push(c);
                field_started = true;
            }
        }
    }

    if in_quotes {
        return Err(DatasetError::Malformed(
            "unterminated quoted field at end of input".to_string(),
        ));
    }
    if field_started || !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    Ok(rows)
}

fn quote_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_row(out: &mut String, fields: &[String]) {
    let line: Vec<String> = fields.iter().map(|f| quote_field(f)).collect();
    out.push_str(&line.join(","));
    out.push('\n');
}

fn encode_csv(dataset: &Dataset) -> String {
    let extra = dataset.extra_columns();
    let mut out = String::new();
    write_row(&mut out, &header(extra));

    for record in dataset.records() {
        let mut fields: Vec<String> = Vec::with_capacity(40 + extra.len());
        fields.push(record.era.to_string());
        fields.push(record.start_year.map(|y| y.to_string()).unwrap_or_default());
        fields.push(record.end_year.map(|y| y.to_string()).unwrap_or_default());
        fields.push(record.region.clone());
        fields.extend(
            record
                .scores
                .iter()
                .map(|s| s.map(|v| v.to_string()).unwrap_or_default()),
        );
        fields.extend(record.totals.as_columns().iter().map(|t| t.to_string()));
        fields.push(record.notes.clone());
        fields.push(if record.interpolated { "1" } else { "0" }.to_string());
        fields.push(record.sources.clone());
        for name in extra {
            fields.push(record.extra.get(name).cloned().unwrap_or_default());
        }
        write_row(&mut out, &fields);
    }
    out
}

fn decode_csv(raw: &str) -> Result<Dataset, DatasetError> {
    let mut rows = parse_csv(raw)?.into_iter();
    let header = match rows.next() {
        Some(h) => h,
        None => return Ok(Dataset::new()),
    };
    let columns: HashMap<&str, usize> = header
        .iter()
        .enumerate()
        .map(|(i, name)| (name.trim(), i))
        .collect();
    let era_col = *columns
        .get("Era_ID")
        .ok_or(DatasetError::MissingColumn("Era_ID"))?;
    let region_col = *columns
        .get("Region")
        .ok_or(DatasetError::MissingColumn("Region"))?;

    for name in INDICATOR_COLUMNS {
        if !columns.contains_key(name) {
            warn!(column = name, "indicator column missing; values treated as 0");
        }
    }

    let extra_cols: Vec<(usize, String)> = header
        .iter()
        .enumerate()
        .filter(|(_, name)| !is_known_column(name.trim()))
        .map(|(i, name)| (i, name.trim().to_string()))
        .collect();

    let mut dataset = Dataset::new();
    for (idx, fields) in rows.enumerate() {
        // Header is line 1.
        let row_no = idx + 2;
        let cell = |name: &str| cell_value(&columns, &fields, name);

        let era_raw = fields.get(era_col).map(|s| s.as_str()).unwrap_or("");
        let era: EraId = era_raw.parse().map_err(|e| DatasetError::Row {
            row: row_no,
            message: format!("{e}"),
        })?;
        let region = fields
            .get(region_col)
            .map(|s| s.trim().to_string())
            .unwrap_or_default();
        if region.is_empty() {
            return Err(DatasetError::Row {
                row: row_no,
                message: "empty Region".to_string(),
            });
        }

        let mut scores = [None; INDICATOR_COUNT];
        for (slot, name) in scores.iter_mut().zip(INDICATOR_COLUMNS) {
            let raw = cell(name);
            match parse_score_cell(raw) {
                Ok(value) => *slot = value,
                Err(reason) => {
                    warn!(row = row_no, column = name, value = raw, %reason, "unreadable indicator; treated as 0");
                }
            }
        }

        let computed = Totals::from_scores(&scores);
        let stored: Vec<Option<u32>> = TOTAL_COLUMNS
            .iter()
            .map(|name| parse_number(cell(name)).map(|v| v.max(0.0).round() as u32))
            .collect();
        let totals = if stored.iter().all(Option::is_some) {
            let v: Vec<u32> = stored.into_iter().flatten().collect();
            Totals {
                dimensions: [v[0], v[1], v[2], v[3], v[4]],
                ccsi: v[5],
            }
        } else {
            computed
        };

        let extra: BTreeMap<String, String> = extra_cols
            .iter()
            .map(|(i, name)| (name.clone(), fields.get(*i).cloned().unwrap_or_default()))
            .collect();

        let record = IndicatorRecord {
            era,
            start_year: parse_number(cell("Era_Start_Year")).map(|v| v.round() as i32),
            end_year: parse_number(cell("Era_End_Year")).map(|v| v.round() as i32),
            region,
            scores,
            totals,
            notes: cell(NOTES_COLUMN).to_string(),
            interpolated: parse_flag(cell(INTERPOLATED_COLUMN)),
            sources: cell(SOURCES_COLUMN).to_string(),
            extra,
        };
        dataset.insert(record)?;
    }

    // Preserve the input order of unknown columns even when every value is blank.
    for (_, name) in extra_cols {
        if !dataset.extra_columns.contains(&name) {
            dataset.extra_columns.push(name);
        }
    }
    Ok(dataset)
}

fn cell_value<'a>(columns: &HashMap<&str, usize>, fields: &'a [String], name: &str) -> &'a str {
    columns
        .get(name)
        .and_then(|i| fields.get(*i))
        .map(|s| s.trim())
        .unwrap_or("")
}

fn parse_number(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Blank cells are missing; numeric cells must be whole numbers within range.
fn parse_score_cell(raw: &str) -> Result<Option<u8>, String> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    let value: f64 = raw.parse().map_err(|_| "not a number".to_string())?;
    if !value.is_finite() || value.fract() != 0.0 {
        return Err("not a whole number".to_string());
    }
    if value < 0.0 || value > f64::from(SCORE_MAX) {
        return Err(format!("outside 0..={SCORE_MAX}"));
    }
    Ok(Some(value as u8))
}

fn parse_flag(raw: &str) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" => true,
        other => parse_number(other).map(|v| v != 0.0).unwrap_or(false),
    }
}

// =============================================================================
// JSON Lines
// =============================================================================

fn decode_jsonl(raw: &str) -> Result<Dataset, DatasetError> {
    let mut dataset = Dataset::new();
    for (idx, line) in raw.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: IndicatorRecord = serde_json::from_str(line).map_err(|source| {
            DatasetError::Json {
                line: idx + 1,
                source,
            }
        })?;
        dataset.insert(record)?;
    }
    Ok(dataset)
}

fn encode_jsonl(dataset: &Dataset) -> Result<String, DatasetError> {
    let mut out = String::new();
    for (idx, record) in dataset.records().iter().enumerate() {
        let line = serde_json::to_string(record).map_err(|source| DatasetError::Json {
            line: idx + 1,
            source,
        })?;
        out.push_str(&line);
        out.push('\n');
    }
    Ok(out)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::ScoreVector;

    #[test]
    fn parse_csv_handles_quotes_and_newlines() {
        let raw = "a,b,c\r\n1,\"x, y\",\"say \"\"hi\"\"\"\n2,\"multi\nline\",\n\n";
        let rows = parse_csv(raw).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec!["1", "x, y", "say \"hi\""]);
        assert_eq!(rows[2], vec!["2", "multi\nline", ""]);
    }

    #[test]
    fn parse_csv_rejects_unterminated_quote() {
        assert!(parse_csv("a,b\n1,\"oops\n").is_err());
    }

    #[test]
    fn score_cells_accept_whole_floats_and_reject_garbage() {
        assert_eq!(parse_score_cell("3"), Ok(Some(3)));
        assert_eq!(parse_score_cell("3.0"), Ok(Some(3)));
        assert_eq!(parse_score_cell(""), Ok(None));
        assert_eq!(parse_score_cell("NaN"), Ok(None));
        assert!(parse_score_cell("2.5").is_err());
        assert!(parse_score_cell("7").is_err());
        assert!(parse_score_cell("high").is_err());
    }

    #[test]
    fn header_places_interpolated_before_sources() {
        let h = header(&["Reviewer".to_string()]);
        assert_eq!(h.len(), 4 + 25 + 6 + 3 + 1);
        let interp = h.iter().position(|c| c == INTERPOLATED_COLUMN).unwrap();
        let sources = h.iter().position(|c| c == SOURCES_COLUMN).unwrap();
        assert_eq!(interp + 1, sources);
        assert_eq!(h.last().map(String::as_str), Some("Reviewer"));
    }

    #[test]
    fn csv_round_trip_preserves_rows_and_extras() {
        let mut record = IndicatorRecord::placeholder(EraId::historical(4), "Deccan");
        record.set_scores(&ScoreVector::uniform(2));
        record.recompute_totals();
        record.notes = "Satavahana trade, \"guild\" networks.".to_string();
        record.sources = "Thapar (2002); Ray (1986)".to_string();
        record.interpolated = true;
        record.extra.insert("Reviewer".to_string(), "ak".to_string());
        let dataset = Dataset::from_records(vec![record]).unwrap();

        let encoded = TableFormat::Csv.encode(&dataset).unwrap();
        let decoded = TableFormat::Csv.decode(&encoded).unwrap();
        assert_eq!(decoded, dataset);
    }

    #[test]
    fn csv_without_optional_columns_computes_totals() {
        let mut raw = String::from("Era_ID,Region");
        for name in INDICATOR_COLUMNS {
            raw.push(',');
            raw.push_str(name);
        }
        raw.push_str("\nE05,Deccan");
        for _ in 0..INDICATOR_COUNT {
            raw.push_str(",1");
        }
        raw.push('\n');

        let dataset = TableFormat::Csv.decode(&raw).unwrap();
        let record = &dataset.records()[0];
        assert_eq!(record.totals.ccsi, 25);
        assert!(!record.interpolated);
        assert_eq!(record.start_year, None);
    }

    #[test]
    fn jsonl_round_trip() {
        let mut record = IndicatorRecord::placeholder(EraId::modern(2), "West Bengal");
        record.set_scores(&ScoreVector::uniform(3));
        record.recompute_totals();
        let dataset = Dataset::from_records(vec![record]).unwrap();

        let encoded = TableFormat::JsonLines.encode(&dataset).unwrap();
        assert_eq!(encoded.lines().count(), 1);
        let decoded = TableFormat::JsonLines.decode(&encoded).unwrap();
        assert_eq!(decoded, dataset);
    }
}
