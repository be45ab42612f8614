//! Era identifiers, year ranges, and the region grids the dataset is built on.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// First historical era number treated as a hypothetical future scenario.
pub const FIRST_FUTURE_ERA: u32 = 23;

/// An era identifier such as `E07` or `M02`.
///
/// The letter names the series (historical `E`, modern `M`); the number is the
/// era's rank within that series. Temporal neighbours are only meaningful
/// within one series.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EraId {
    series: char,
    rank: u32,
    // Zero-padded digit count, kept so ids are written back as they were read.
    width: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid era id {0:?}: expected a letter followed by digits, e.g. E07")]
pub struct EraIdError(pub String);

impl EraId {
    pub fn new(series: char, rank: u32) -> Self {
        Self {
            series: series.to_ascii_uppercase(),
            rank,
            width: 2,
        }
    }

    pub fn historical(rank: u32) -> Self {
        Self::new('E', rank)
    }

    pub fn modern(rank: u32) -> Self {
        Self::new('M', rank)
    }

    pub fn series(&self) -> char {
        self.series
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn same_series(&self, other: &EraId) -> bool {
        self.series == other.series
    }

    pub fn is_future_scenario(&self) -> bool {
        self.series == 'E' && self.rank >= FIRST_FUTURE_ERA
    }

    /// Year bounds for catalogued eras; negative years are BCE.
    pub fn years(&self) -> Option<(i32, i32)> {
        let table: &[(i32, i32)] = match self.series {
            'E' => &HISTORICAL_ERA_YEARS,
            'M' => &MODERN_ERA_YEARS,
            _ => return None,
        };
        let idx = usize::try_from(self.rank).ok()?.checked_sub(1)?;
        table.get(idx).copied()
    }
}

impl FromStr for EraId {
    type Err = EraIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let mut chars = trimmed.chars();
        let series = chars
            .next()
            .filter(|c| c.is_ascii_alphabetic())
            .ok_or_else(|| EraIdError(s.to_string()))?;
        let digits = chars.as_str();
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(EraIdError(s.to_string()));
        }
        let rank = digits.parse().map_err(|_| EraIdError(s.to_string()))?;
        Ok(Self {
            series: series.to_ascii_uppercase(),
            rank,
            width: digits.len(),
        })
    }
}

impl TryFrom<String> for EraId {
    type Error = EraIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EraId> for String {
    fn from(value: EraId) -> Self {
        value.to_string()
    }
}

impl fmt::Display for EraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:0width$}", self.series, self.rank, width = self.width)
    }
}

impl PartialEq for EraId {
    fn eq(&self, other: &Self) -> bool {
        self.series == other.series && self.rank == other.rank
    }
}

impl Eq for EraId {}

impl Hash for EraId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.series.hash(state);
        self.rank.hash(state);
    }
}

impl PartialOrd for EraId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EraId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.series
            .cmp(&other.series)
            .then(self.rank.cmp(&other.rank))
    }
}

// =============================================================================
// Catalog tables
// =============================================================================

const HISTORICAL_ERA_YEARS: [(i32, i32); 28] = [
    (-1500, -1000),
    (-1000, -500),
    (-500, -200),
    (-200, 100),
    (100, 300),
    (300, 500),
    (500, 700),
    (700, 900),
    (900, 1100),
    (1100, 1300),
    (1300, 1500),
    (1500, 1700),
    (1700, 1800),
    (1800, 1850),
    (1850, 1900),
    (1900, 1920),
    (1920, 1947),
    (1947, 1960),
    (1960, 1980),
    (1980, 2000),
    (2000, 2020),
    (2020, 2040),
    (2040, 2060),
    (2060, 2080),
    (2080, 2100),
    (2100, 2120),
    (2120, 2140),
    (2140, 2160),
];

const MODERN_ERA_YEARS: [(i32, i32); 5] = [
    (2000, 2005),
    (2005, 2010),
    (2010, 2015),
    (2015, 2020),
    (2020, 2025),
];

/// Historical regions with the first era each one is scored from.
const HISTORICAL_REGIONS: [(&str, u32); 5] = [
    ("Gangetic North", 1),
    ("Northwest (Punjab–Gandhāra)", 1),
    ("Deccan", 3),
    ("Tamilakam", 4),
    ("Northeast", 6),
];

const MODERN_REGIONS: [&str; 9] = [
    "Gangetic North",
    "Northwest (Punjab–Gandhāra)",
    "Western India",
    "Central India",
    "Deccan",
    "Tamilakam",
    "Northeast",
    "West Bengal",
    "Jammu & Kashmir",
];

/// Identity of one record: an (era, region) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKey {
    pub era: EraId,
    pub region: String,
}

impl RecordKey {
    pub fn new(era: EraId, region: impl Into<String>) -> Self {
        Self {
            era,
            region: region.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {}", self.era, self.region)
    }
}

/// Region-major grid of historical cells, `E01..E28` clipped per region.
pub fn historical_grid() -> Vec<RecordKey> {
    let last = HISTORICAL_ERA_YEARS.len() as u32;
    HISTORICAL_REGIONS
        .iter()
        .flat_map(|(region, first)| {
            (*first..=last).map(move |rank| RecordKey::new(EraId::historical(rank), *region))
        })
        .collect()
}

/// Era-major grid of modern cells, `M01..M05` for every modern region.
pub fn modern_grid() -> Vec<RecordKey> {
    let last = MODERN_ERA_YEARS.len() as u32;
    (1..=last)
        .flat_map(|rank| {
            MODERN_REGIONS
                .iter()
                .map(move |region| RecordKey::new(EraId::modern(rank), *region))
        })
        .collect()
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display_round_trip() {
        let era: EraId = "E07".parse().unwrap();
        assert_eq!(era.series(), 'E');
        assert_eq!(era.rank(), 7);
        assert_eq!(era.to_string(), "E07");

        let lower: EraId = " m3 ".parse().unwrap();
        assert_eq!(lower.to_string(), "M3");
        assert_eq!(lower, EraId::modern(3));
    }

    #[test]
    fn rejects_malformed_ids() {
        assert!("".parse::<EraId>().is_err());
        assert!("07".parse::<EraId>().is_err());
        assert!("E".parse::<EraId>().is_err());
        assert!("E7a".parse::<EraId>().is_err());
    }

    #[test]
    fn ordering_is_series_then_rank() {
        let mut eras = vec![
            EraId::modern(1),
            EraId::historical(10),
            EraId::historical(2),
        ];
        eras.sort();
        assert_eq!(
            eras,
            vec![EraId::historical(2), EraId::historical(10), EraId::modern(1)]
        );
    }

    #[test]
    fn years_come_from_catalog() {
        assert_eq!(EraId::historical(1).years(), Some((-1500, -1000)));
        assert_eq!(EraId::historical(5).years(), Some((100, 300)));
        assert_eq!(EraId::modern(5).years(), Some((2020, 2025)));
        assert_eq!(EraId::historical(29).years(), None);
        assert_eq!(EraId::historical(0).years(), None);
        assert_eq!(EraId::new('X', 1).years(), None);
    }

    #[test]
    fn future_scenarios_start_at_e23() {
        assert!(!EraId::historical(22).is_future_scenario());
        assert!(EraId::historical(23).is_future_scenario());
        assert!(!EraId::modern(23).is_future_scenario());
    }

    #[test]
    fn grids_respect_region_coverage() {
        let grid = historical_grid();
        assert_eq!(grid.len(), 28 + 28 + 26 + 25 + 23);
        let deccan_first = grid.iter().find(|c| c.region == "Deccan").unwrap();
        assert_eq!(deccan_first.era, EraId::historical(3));

        let modern = modern_grid();
        assert_eq!(modern.len(), 5 * 9);
        assert_eq!(modern[0].era, EraId::modern(1));
        assert_eq!(modern[9].era, EraId::modern(2));
    }
}
