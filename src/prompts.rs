//! Prompt templates for the scoring oracle.
//!
//! Domain logic for rendering row prompts. Provider-agnostic.

use crate::catalog::EraId;
use crate::indicators::{Dimension, ScoreVector, INDICATOR_COLUMNS};

// =============================================================================
// Row context
// =============================================================================

/// The record a prompt asks about.
#[derive(Debug, Clone)]
pub struct RowContext<'a> {
    pub era: &'a EraId,
    pub region: &'a str,
    pub start_year: Option<i32>,
    pub end_year: Option<i32>,
    /// Interpolated starting point; only the repair template uses it.
    pub baseline: Option<&'a ScoreVector>,
}

/// Rendered prompt ready for the oracle.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: &'static str,
    pub template_hash: String,
    pub text: String,
    /// Lets providers with a JSON mode constrain the reply.
    pub shape: ReplyShape,
}

/// Which payload shape a template asks the oracle for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    Json,
    Delimited,
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn year_label(year: Option<i32>) -> String {
    match year {
        Some(y) if y < 0 => format!("{} BCE", -y),
        Some(y) => format!("{y} CE"),
        None => "unknown".to_string(),
    }
}

fn dimension_outline() -> String {
    Dimension::ALL
        .iter()
        .map(|d| format!("{} = {} (5 indicators)", d.code(), d.title()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn indicator_order() -> String {
    INDICATOR_COLUMNS
        .chunks(5)
        .map(|chunk| chunk.join(", "))
        .collect::<Vec<_>>()
        .join(",\n")
}

fn baseline_json(baseline: Option<&ScoreVector>) -> String {
    let Some(baseline) = baseline else {
        return "{}".to_string();
    };
    // Catalog order, not alphabetical.
    let body = INDICATOR_COLUMNS
        .iter()
        .zip(baseline.as_array())
        .map(|(name, v)| format!("  \"{name}\": {v}"))
        .collect::<Vec<_>>()
        .join(",\n");
    format!("{{\n{body}\n}}")
}

// =============================================================================
// Prompt templates
// =============================================================================

/// A prompt template with placeholders.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub shape: ReplyShape,
    pub body: &'static str,
}

impl PromptTemplate {
    /// Hash of the template text; part of every reply cache key.
    pub fn hash(&self) -> String {
        blake3::hash(format!("{}\n{}", self.slug, self.body).as_bytes())
            .to_hex()
            .to_string()
    }

    pub fn render(&self, row: &RowContext<'_>) -> PromptInstance {
        let text = self
            .body
            .replace("{era}", &escape_xml_chars(&row.era.to_string()))
            .replace("{region}", &escape_xml_chars(row.region))
            .replace("{start_year}", &year_label(row.start_year))
            .replace("{end_year}", &year_label(row.end_year))
            .replace("{dimensions}", &dimension_outline())
            .replace("{indicator_order}", &indicator_order())
            .replace("{scale}", SCALE)
            .replace("{baseline}", &baseline_json(row.baseline));

        PromptInstance {
            template_slug: self.slug,
            template_hash: self.hash(),
            text: text.trim().to_string(),
            shape: self.shape,
        }
    }
}

// =============================================================================
// Standard prompts
// =============================================================================

const SCALE: &str = "0 = absent or extremely weak, 1 = very weak, 2 = moderate, 3 = strong, 4 = very strong or dominant";

/// Baseline-seeded repair of an existing row.
pub const REPAIR_V1: PromptTemplate = PromptTemplate {
    slug: "repair_v1",
    shape: ReplyShape::Json,
    body: r#"You are an expert historian of the Indian subcontinent, helping to maintain the Civilizational Cohesion and Social Inclusivity Index (CCSI). Each row scores one era in one region on 25 indicators, each an integer from 0 to 4, grouped into five dimensions:

{dimensions}

<row>
Era_ID: {era}
Region: {region}
Period: {start_year} to {end_year}
</row>

The baseline below was interpolated from neighbouring eras in the same region and from the same era in other regions:

<baseline>
{baseline}
</baseline>

Task:
1. Adjust the baseline so every score is historically plausible for this row and consistent with its neighbours. Scale: {scale}.
2. Write an academic note of 3 to 5 sentences on social structure, inclusivity, economy, political cohesion and culture in this era and region.
3. List 6 to 12 scholarly sources as full references (Author, Initials. (Year). Title. Publisher or journal). No Wikipedia or blogs.

Return ONLY a JSON object, no prose and no code fences:
{"scores": [25 integers in this order:
{indicator_order}
], "notes": "...", "sources": ["...", "..."]}"#,
};

/// Fresh scoring of a historical row, answered on one delimited line.
pub const SCORE_V1: PromptTemplate = PromptTemplate {
    slug: "score_v1",
    shape: ReplyShape::Delimited,
    body: r#"You are an expert historian of the Indian subcontinent scoring rows of the Civilizational Cohesion and Social Inclusivity Index (CCSI). Score 25 indicators, each an integer from 0 to 4, grouped into five dimensions:

{dimensions}

<row>
Era_ID: {era}
Region: {region}
Period: {start_year} to {end_year}
</row>

Scale: {scale}.

Indicators, in order:
{indicator_order}

Also write an academic note of 3 to 5 sentences on the row, and cite at least 3 scholarly sources.

You may reason first, but the LAST line of your reply must be exactly:
scores_csv|notes|sources
where scores_csv is the 25 integers separated by commas, notes contains no '|' characters, and sources are separated by ';'."#,
};

/// Scoring of a modern (2000-2025) row with contemporary proxies.
pub const MODERN_V1: PromptTemplate = PromptTemplate {
    slug: "modern_v1",
    shape: ReplyShape::Json,
    body: r#"You are a socio-historical analyst and political sociologist extending the Civilizational Cohesion and Social Inclusivity Index (CCSI) into 2000-2025. Each row is a five-year slice in one region of India, scored on 25 indicators (integers 0 to 4) in five dimensions:

{dimensions}

<row>
Era_ID: {era}
Region: {region}
Period: {start_year} to {end_year}
</row>

Scale: {scale}.

Read the indicators through contemporary proxies: income and job mobility across class and caste; permeability of caste, gender and community boundaries; access to elite education and the formal sector; medium of instruction and digital access; sector diversity, credit access and welfare coverage (PDS, MGNREGA, DBT); state capacity, coalition stability, insurgency and federal friction; practical religious freedom, inter-dining and inter-marriage, pluralism against hardened hierarchy.

Strong political or communal polarisation lowers cohesion: it reduces D4 conflict management and D5 social contact, freedom of worship and equality norms, and sometimes D1 status fluidity and intergroup transferability. Treat it as a factor without taking sides.

Task:
1. Assign the 25 scores.
2. Write an academic note of 3 to 6 sentences covering mobility, education, economy, cohesion against polarisation, and pluralism.
3. Suggest 6 to 12 scholarly or official sources (Census, NSSO/PLFS, NFHS, CSDS, well-known books or papers). No Wikipedia or blogs.

Return ONLY a JSON object, no prose and no code fences:
{"scores": [25 integers in this order:
{indicator_order}
], "notes": "...", "sources": ["...", "..."]}"#,
};

// =============================================================================
// TESTS
// =============================================================================
