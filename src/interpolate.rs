//! Deterministic baseline scores from neighbouring records.
//!
//! The baseline seeds the repair prompt and is the unconditional fallback when
//! the oracle has no usable answer. It blends three terms:
//!
//! - the nearest earlier era in the same region,
//! - the nearest later era in the same region,
//! - the element-wise mean of the same era across other regions.
//!
//! Only records with valid indicators take part. Absent terms drop out and the
//! remaining weights are renormalised. With no terms at all the baseline is
//! the zero vector.

use serde::Serialize;

use crate::catalog::EraId;
use crate::dataset::{Dataset, IndicatorRecord};
use crate::indicators::{ScoreVector, INDICATOR_COUNT};

// Weights are kept in tenths so the renormalised average of integer inputs is
// exact (0.4 / 0.4 / 0.2).
const PREDECESSOR_WEIGHT: u32 = 4;
const SUCCESSOR_WEIGHT: u32 = 4;
const PEER_WEIGHT: u32 = 2;

/// Which neighbour a baseline term came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborTerm {
    Predecessor,
    Successor,
    SameEraPeers,
}

impl NeighborTerm {
    fn raw_weight(self) -> u32 {
        match self {
            NeighborTerm::Predecessor => PREDECESSOR_WEIGHT,
            NeighborTerm::Successor => SUCCESSOR_WEIGHT,
            NeighborTerm::SameEraPeers => PEER_WEIGHT,
        }
    }
}

/// Weights renormalised over the terms that exist; sums to 1 unless empty.
pub fn normalized_weights(present: &[NeighborTerm]) -> Vec<(NeighborTerm, f64)> {
    let total: u32 = present.iter().map(|t| t.raw_weight()).sum();
    if total == 0 {
        return Vec::new();
    }
    present
        .iter()
        .map(|t| (*t, f64::from(t.raw_weight()) / f64::from(total)))
        .collect()
}

/// A baseline together with what it was built from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Baseline {
    pub scores: ScoreVector,
    pub predecessor: Option<EraId>,
    pub successor: Option<EraId>,
    pub peer_regions: Vec<String>,
}

impl Baseline {
    pub fn terms(&self) -> Vec<NeighborTerm> {
        let mut terms = Vec::with_capacity(3);
        if self.predecessor.is_some() {
            terms.push(NeighborTerm::Predecessor);
        }
        if self.successor.is_some() {
            terms.push(NeighborTerm::Successor);
        }
        if !self.peer_regions.is_empty() {
            terms.push(NeighborTerm::SameEraPeers);
        }
        terms
    }

    /// True when no neighbour contributed and the scores are the zero vector.
    pub fn is_last_resort(&self) -> bool {
        self.terms().is_empty()
    }
}

/// Compute the baseline for `(era, region)` from a dataset snapshot.
///
/// The target row itself (if present) never contributes.
pub fn interpolate_baseline(dataset: &Dataset, era: &EraId, region: &str) -> Baseline {
    let usable = |r: &&IndicatorRecord| r.has_valid_indicators() && r.era.same_series(era);

    let predecessor = dataset
        .records()
        .iter()
        .filter(usable)
        .filter(|r| r.region == region && r.era < *era)
        .max_by(|a, b| a.era.cmp(&b.era));
    let successor = dataset
        .records()
        .iter()
        .filter(usable)
        .filter(|r| r.region == region && r.era > *era)
        .min_by(|a, b| a.era.cmp(&b.era));
    let peers: Vec<&IndicatorRecord> = dataset
        .records()
        .iter()
        .filter(usable)
        .filter(|r| r.region != region && r.era == *era)
        .collect();

    let mut numerator = [0.0f64; INDICATOR_COUNT];
    let mut denominator = 0u32;

    let mut add_term = |values: [f64; INDICATOR_COUNT], term: NeighborTerm| {
        let w = term.raw_weight();
        for (acc, v) in numerator.iter_mut().zip(values) {
            *acc += f64::from(w) * v;
        }
        denominator += w;
    };

    if let Some(vector) = predecessor.and_then(|r| r.score_vector()) {
        add_term(vector.to_f64(), NeighborTerm::Predecessor);
    }
    if let Some(vector) = successor.and_then(|r| r.score_vector()) {
        add_term(vector.to_f64(), NeighborTerm::Successor);
    }
    if !peers.is_empty() {
        add_term(element_mean(&peers), NeighborTerm::SameEraPeers);
    }

    let scores = if denominator == 0 {
        ScoreVector::zero()
    } else {
        let mut blended = [0.0f64; INDICATOR_COUNT];
        for (out, acc) in blended.iter_mut().zip(numerator) {
            *out = acc / f64::from(denominator);
        }
        ScoreVector::clamped(&blended)
    };

    Baseline {
        scores,
        predecessor: predecessor.map(|r| r.era.clone()),
        successor: successor.map(|r| r.era.clone()),
        peer_regions: peers.iter().map(|r| r.region.clone()).collect(),
    }
}

fn element_mean(records: &[&IndicatorRecord]) -> [f64; INDICATOR_COUNT] {
    let mut sum = [0.0f64; INDICATOR_COUNT];
    let mut n = 0usize;
    for vector in records.iter().filter_map(|r| r.score_vector()) {
        for (acc, v) in sum.iter_mut().zip(vector.to_f64()) {
            *acc += v;
        }
        n += 1;
    }
    if n > 0 {
        for acc in &mut sum {
            *acc /= n as f64;
        }
    }
    sum
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weights_sum_to_one_for_every_subset() {
        use NeighborTerm::*;
        let subsets: [&[NeighborTerm]; 7] = [
            &[Predecessor],
            &[Successor],
            &[SameEraPeers],
            &[Predecessor, Successor],
            &[Predecessor, SameEraPeers],
            &[Successor, SameEraPeers],
            &[Predecessor, Successor, SameEraPeers],
        ];
        for subset in subsets {
            let sum: f64 = normalized_weights(subset).iter().map(|(_, w)| w).sum();
            assert!((sum - 1.0).abs() < 1e-12, "{subset:?} sums to {sum}");
        }
        assert!(normalized_weights(&[]).is_empty());
    }

    #[test]
    fn full_weights_match_nominal_split() {
        use NeighborTerm::*;
        let w = normalized_weights(&[Predecessor, Successor, SameEraPeers]);
        assert!((w[0].1 - 0.4).abs() < 1e-12);
        assert!((w[1].1 - 0.4).abs() < 1e-12);
        assert!((w[2].1 - 0.2).abs() < 1e-12);
    }

    #[test]
    fn empty_dataset_yields_zero_vector() {
        let baseline = interpolate_baseline(&Dataset::new(), &EraId::historical(5), "Deccan");
        assert_eq!(baseline.scores, ScoreVector::zero());
        assert!(baseline.is_last_resort());
    }
}
