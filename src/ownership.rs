//! Assignment of patches to ranks
//!
//! Each rank owns a contiguous range of the space-filling curve, so the
//! whole assignment is described by the number of patches per rank.

use std::ops::Range;
use serde::{Deserialize, Serialize};

use crate::comm::Messenger;
use crate::error::{ConfigError, FatalError};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OwnershipMap {
    counts: Vec<usize>,
}

impl OwnershipMap {
    /// Splits `total` patches as evenly as possible, the first ranks
    /// taking one extra patch each.
    pub fn even(total: usize, nranks: usize) -> Result<Self, ConfigError> {
        if nranks == 0 || total < nranks {
            return Err(ConfigError::Decomposition(format!(
                "{} patches cannot be shared between {} ranks", total, nranks
            )));
        }
        let base = total / nranks;
        let rem = total % nranks;
        let counts = (0..nranks).map(|r| base + if r < rem {1} else {0}).collect();
        Ok(OwnershipMap {counts})
    }

    pub fn from_counts(counts: Vec<usize>) -> Result<Self, FatalError> {
        if counts.is_empty() || counts.iter().any(|&c| c == 0) {
            return Err(FatalError::OwnershipNotPartition(format!("every rank must own a patch: {:?}", counts)));
        }
        Ok(OwnershipMap {counts})
    }

    /// Cuts the curve into contiguous ranges of roughly equal total cost.
    /// The cut for rank `r` is placed where the cumulative cost is
    /// nearest `r * total / nranks`, leaving every rank at least one patch.
    pub fn balanced(costs: &[f64], nranks: usize) -> Result<Self, ConfigError> {
        let npatches = costs.len();
        if nranks == 0 || npatches < nranks {
            return OwnershipMap::even(npatches, nranks);
        }

        let cumsum: Vec<f64> = costs.iter()
            .scan(0.0f64, |total, c| {*total += c.max(0.0); Some(*total)})
            .collect();
        let total = cumsum.last().copied().unwrap_or(0.0);
        if !(total > 0.0) || !total.is_finite() {
            return OwnershipMap::even(npatches, nranks);
        }

        // Each rank should get this much, approx:
        let target = total / (nranks as f64);
        // cost of the patches before cut `c`
        let before = |c: usize| if c == 0 {0.0} else {cumsum[c-1]};

        let mut cuts: Vec<usize> = vec![0];
        for r in 1..nranks {
            let goal = target * (r as f64);
            let lo = cuts[r-1] + 1;
            let hi = npatches - (nranks - r);
            let mut best = lo;
            let mut best_err = std::f64::INFINITY;
            for c in lo..=hi {
                let err = (before(c) - goal).abs();
                if err < best_err {
                    best = c;
                    best_err = err;
                } else if before(c) > goal {
                    break;
                }
            }
            cuts.push(best);
        }
        cuts.push(npatches);

        let counts = cuts.windows(2).map(|w| w[1] - w[0]).collect();
        Ok(OwnershipMap {counts})
    }

    pub fn nranks(&self) -> usize {
        self.counts.len()
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn counts(&self) -> &[usize] {
        &self.counts
    }

    pub fn offset(&self, rank: usize) -> usize {
        self.counts[..rank].iter().sum()
    }

    /// The curve indices owned by `rank`.
    pub fn range(&self, rank: usize) -> Range<usize> {
        let start = self.offset(rank);
        start..(start + self.counts[rank])
    }

    pub fn owner(&self, index: usize) -> usize {
        let mut end = 0;
        for (rank, count) in self.counts.iter().enumerate() {
            end += count;
            if index < end {
                return rank;
            }
        }
        panic!("patch {} is beyond the end of the curve ({} patches)", index, end);
    }

    /// Checks that the patches held by each rank are exactly those the
    /// map assigns to it, and that together they cover the lattice once.
    pub fn check_partition(&self, held: &[Vec<usize>]) -> Result<(), FatalError> {
        if held.len() != self.nranks() {
            return Err(FatalError::OwnershipNotPartition(format!(
                "map has {} ranks, {} reported", self.nranks(), held.len()
            )));
        }

        let total = self.total();
        let mut seen = vec![false; total];
        for (rank, indices) in held.iter().enumerate() {
            let mut sorted = indices.clone();
            sorted.sort_unstable();
            if !sorted.iter().copied().eq(self.range(rank)) {
                return Err(FatalError::OwnershipNotPartition(format!(
                    "rank {} holds {:?}, expected {:?}", rank, sorted, self.range(rank)
                )));
            }
            for &i in &sorted {
                if i >= total || seen[i] {
                    return Err(FatalError::OwnershipNotPartition(format!("patch {} is owned twice", i)));
                }
                seen[i] = true;
            }
        }

        match seen.iter().position(|s| !s) {
            Some(gap) => Err(FatalError::OwnershipNotPartition(format!("patch {} is not owned", gap))),
            None => Ok(()),
        }
    }
}

/// Collective version of [`OwnershipMap::check_partition`].
pub fn verify_partition<M: Messenger>(comm: &M, map: &OwnershipMap, local: &[usize]) -> Result<(), FatalError> {
    let local: Vec<u64> = local.iter().map(|&i| i as u64).collect();
    let held: Vec<Vec<usize>> = comm.all_gather(&local)
        .into_iter()
        .map(|v| v.into_iter().map(|i| i as usize).collect())
        .collect();
    map.check_partition(&held)
}
