//! The 25 CCSI indicators, their five dimensions, and derived totals.
//!
//! Indicator order is part of the dataset's column contract and of the
//! oracle reply format, so everything here is indexed by position.

use serde::{Deserialize, Serialize};

/// Number of indicators per record.
pub const INDICATOR_COUNT: usize = 25;

/// Number of indicators in each dimension.
pub const DIMENSION_WIDTH: usize = 5;

/// Lowest legal indicator score.
pub const SCORE_MIN: u8 = 0;

/// Highest legal indicator score.
pub const SCORE_MAX: u8 = 4;

/// Indicator column names in dataset order.
pub const INDICATOR_COLUMNS: [&str; INDICATOR_COUNT] = [
    "D1_SM_OccupationalMobility",
    "D1_SM_StatusFluidity",
    "D1_SM_InstitutionalMobility",
    "D1_SM_IntergroupTransferability",
    "D1_SM_MeritocraticPathways",
    "D2_ED_KnowledgeGatekeeping",
    "D2_ED_LanguageOfTransmission",
    "D2_ED_EducationalInfrastructure",
    "D2_ED_PedagogicalInclusivity",
    "D2_ED_IntellectualPluralism",
    "D3_EC_OccupationalPlurality",
    "D3_EC_GuildMarketAccessibility",
    "D3_EC_InternalMarketIntegration",
    "D3_EC_ExternalTradeLinkages",
    "D3_EC_StateRedistributionWelfare",
    "D4_PO_AdminIntegration",
    "D4_PO_SuccessionStability",
    "D4_PO_TerritorialContinuity",
    "D4_PO_ConflictManagement",
    "D4_PO_DiplomaticStability",
    "D5_CU_FreedomOfWorship",
    "D5_CU_RitualInclusivity",
    "D5_CU_SocialContactNorms",
    "D5_CU_SyncretismHybridization",
    "D5_CU_NormativeHierarchyVsEquality",
];

/// Derived total columns in dataset order.
pub const TOTAL_COLUMNS: [&str; 6] = [
    "D1_Total",
    "D2_Total",
    "D3_Total",
    "D4_Total",
    "D5_Total",
    "CCSI_Total",
];

// =============================================================================
// Dimensions
// =============================================================================

/// One of the five fixed indicator groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    SocialMobility,
    Education,
    Economy,
    Polity,
    Culture,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Dimension::SocialMobility,
        Dimension::Education,
        Dimension::Economy,
        Dimension::Polity,
        Dimension::Culture,
    ];

    pub fn index(self) -> usize {
        match self {
            Dimension::SocialMobility => 0,
            Dimension::Education => 1,
            Dimension::Economy => 2,
            Dimension::Polity => 3,
            Dimension::Culture => 4,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Dimension::SocialMobility => "D1",
            Dimension::Education => "D2",
            Dimension::Economy => "D3",
            Dimension::Polity => "D4",
            Dimension::Culture => "D5",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Dimension::SocialMobility => "Social Mobility",
            Dimension::Education => "Education & Knowledge Regime",
            Dimension::Economy => "Economic Structure",
            Dimension::Polity => "Polity & State Cohesion",
            Dimension::Culture => "Culture, Religion & Hierarchy",
        }
    }

    /// Indicator positions belonging to this dimension.
    pub fn range(self) -> std::ops::Range<usize> {
        let start = self.index() * DIMENSION_WIDTH;
        start..start + DIMENSION_WIDTH
    }

    pub fn columns(self) -> &'static [&'static str] {
        &INDICATOR_COLUMNS[self.range()]
    }
}

// =============================================================================
// Score vectors
// =============================================================================

/// A complete, validated vector of 25 indicator scores.
///
/// Construction goes through [`ScoreVector::new`] or [`ScoreVector::clamped`],
/// so every element is guaranteed to lie in `[SCORE_MIN, SCORE_MAX]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct ScoreVector([u8; INDICATOR_COUNT]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScoreVectorError {
    #[error("expected {INDICATOR_COUNT} scores, got {0}")]
    Length(usize),
    #[error("score {value} at position {index} is outside [{SCORE_MIN},{SCORE_MAX}]")]
    OutOfRange { index: usize, value: u8 },
}

impl ScoreVector {
    pub fn new(scores: [u8; INDICATOR_COUNT]) -> Result<Self, ScoreVectorError> {
        if let Some((index, &value)) = scores.iter().enumerate().find(|(_, v)| **v > SCORE_MAX) {
            return Err(ScoreVectorError::OutOfRange { index, value });
        }
        Ok(Self(scores))
    }

    /// Every indicator set to the same (clamped) value.
    pub fn uniform(value: u8) -> Self {
        Self([value.min(SCORE_MAX); INDICATOR_COUNT])
    }

    pub fn zero() -> Self {
        Self([SCORE_MIN; INDICATOR_COUNT])
    }

    /// Round half away from zero, then clamp into the legal range.
    pub fn clamped(values: &[f64; INDICATOR_COUNT]) -> Self {
        let mut out = [SCORE_MIN; INDICATOR_COUNT];
        for (slot, value) in out.iter_mut().zip(values) {
            *slot = round_and_clamp(*value);
        }
        Self(out)
    }

    pub fn as_array(&self) -> &[u8; INDICATOR_COUNT] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.0.get(index).copied()
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.iter().all(|v| *v == 0)
    }

    pub fn to_f64(&self) -> [f64; INDICATOR_COUNT] {
        let mut out = [0.0; INDICATOR_COUNT];
        for (slot, value) in out.iter_mut().zip(self.0.iter()) {
            *slot = f64::from(*value);
        }
        out
    }

    pub fn totals(&self) -> Totals {
        Totals::from_scores(&self.0.map(Some))
    }
}

impl TryFrom<Vec<u8>> for ScoreVector {
    type Error = ScoreVectorError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let arr: [u8; INDICATOR_COUNT] = value
            .try_into()
            .map_err(|v: Vec<u8>| ScoreVectorError::Length(v.len()))?;
        Self::new(arr)
    }
}

impl From<ScoreVector> for Vec<u8> {
    fn from(value: ScoreVector) -> Self {
        value.0.to_vec()
    }
}

/// `f64::round` rounds half away from zero, which is the rule used for
/// baselines and coerced oracle scores alike.
pub fn round_and_clamp(value: f64) -> u8 {
    if !value.is_finite() {
        return SCORE_MIN;
    }
    value
        .round()
        .clamp(f64::from(SCORE_MIN), f64::from(SCORE_MAX)) as u8
}

// =============================================================================
// Totals
// =============================================================================

/// Dimension subtotals plus the headline CCSI total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub dimensions: [u32; 5],
    pub ccsi: u32,
}

impl Totals {
    /// Missing scores count as zero.
    pub fn from_scores(scores: &[Option<u8>; INDICATOR_COUNT]) -> Self {
        let mut dimensions = [0u32; 5];
        for dim in Dimension::ALL {
            dimensions[dim.index()] = scores[dim.range()]
                .iter()
                .map(|s| u32::from(s.unwrap_or(0)))
                .sum();
        }
        Self {
            dimensions,
            ccsi: dimensions.iter().sum(),
        }
    }

    pub fn dimension(&self, dim: Dimension) -> u32 {
        self.dimensions[dim.index()]
    }

    /// Values in `TOTAL_COLUMNS` order.
    pub fn as_columns(&self) -> [u32; 6] {
        let d = self.dimensions;
        [d[0], d[1], d[2], d[3], d[4], self.ccsi]
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_partition_indicators() {
        let mut seen = [false; INDICATOR_COUNT];
        for dim in Dimension::ALL {
            for idx in dim.range() {
                assert!(!seen[idx]);
                seen[idx] = true;
                assert!(INDICATOR_COLUMNS[idx].starts_with(dim.code()));
            }
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn round_half_away_from_zero_then_clamp() {
        assert_eq!(round_and_clamp(2.5), 3);
        assert_eq!(round_and_clamp(2.49), 2);
        assert_eq!(round_and_clamp(4.6), 4);
        assert_eq!(round_and_clamp(-0.7), 0);
        assert_eq!(round_and_clamp(f64::NAN), 0);
    }

    #[test]
    fn score_vector_rejects_out_of_range() {
        let mut raw = [1u8; INDICATOR_COUNT];
        raw[7] = 5;
        assert_eq!(
            ScoreVector::new(raw),
            Err(ScoreVectorError::OutOfRange { index: 7, value: 5 })
        );
    }

    #[test]
    fn score_vector_serde_checks_length() {
        let err = serde_json::from_str::<ScoreVector>("[1,2,3]");
        assert!(err.is_err());
        let ok: ScoreVector = serde_json::from_str(&format!("[{}]", ["2"; 25].join(","))).unwrap();
        assert_eq!(ok, ScoreVector::uniform(2));
    }

    #[test]
    fn totals_sum_dimensions() {
        let mut raw = [0u8; INDICATOR_COUNT];
        for (i, slot) in raw.iter_mut().enumerate() {
            *slot = (i % 5) as u8;
        }
        let totals = ScoreVector::new(raw).unwrap().totals();
        assert_eq!(totals.dimensions, [10; 5]);
        assert_eq!(totals.ccsi, 50);
    }

    #[test]
    fn totals_treat_missing_as_zero() {
        let mut scores = [Some(4u8); INDICATOR_COUNT];
        scores[0] = None;
        scores[24] = None;
        let totals = Totals::from_scores(&scores);
        assert_eq!(totals.dimension(Dimension::SocialMobility), 16);
        assert_eq!(totals.dimension(Dimension::Culture), 16);
        assert_eq!(totals.ccsi, 92);
    }
}
