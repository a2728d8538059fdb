// Copyright 2026 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::collections::BTreeMap;

use smallvec::SmallVec;

/// A set of sectors stored as disjoint, non adjacent half-open runs.
#[derive(Debug, Default, Clone)]
pub struct SectorBitmap {
    // Run start -> run end.
    runs: BTreeMap<u64, u64>,
}

impl SectorBitmap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks sectors `[start, end)`.
    pub fn set(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }

        let touching: SmallVec<[u64; 4]> = self
            .runs
            .range(..=end)
            .rev()
            .take_while(|&(_, &run_end)| run_end >= start)
            .map(|(&run_start, _)| run_start)
            .collect();

        let mut merged = (start, end);
        for run_start in touching {
            if let Some(run_end) = self.runs.remove(&run_start) {
                merged = (merged.0.min(run_start), merged.1.max(run_end));
            }
        }
        self.runs.insert(merged.0, merged.1);
    }

    #[cfg(test)]
    pub fn is_set(&self, sector: u64) -> bool {
        self.run_at(sector, sector.saturating_add(1)).0
    }

    /// Returns whether `sector` is marked and where the run of sectors
    /// sharing its state ends, capped at `limit`.
    pub fn run_at(&self, sector: u64, limit: u64) -> (bool, u64) {
        if let Some((_, &run_end)) = self.runs.range(..=sector).next_back() {
            if run_end > sector {
                return (true, run_end.min(limit));
            }
        }
        match self.runs.range(sector..).next() {
            Some((&next_start, _)) => (false, next_start.min(limit)),
            None => (false, limit),
        }
    }

    /// Number of marked sectors.
    pub fn count(&self) -> u64 {
        self.runs.iter().map(|(start, end)| end - start).sum()
    }

    #[cfg(test)]
    pub fn runs(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.runs.iter().map(|(&start, &end)| (start, end))
    }
}
