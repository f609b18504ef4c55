//! Width-indexed bookkeeping shared by every width-switchable layer.
use crate::{ErrorKind, Result};
use serde::{Deserialize, Serialize};

/// Returns the channel count used by `ratio` of a layer having `full` channels.
///
/// Positive ratios always keep at least one channel; a zero ratio is a placeholder.
pub fn channels_for(ratio: f64, full: usize) -> usize {
    if ratio <= 0.0 {
        0
    } else {
        ((full as f64 * ratio) as usize).max(1)
    }
}

/// Candidate width ratios of a layer and the index of the current one.
#[derive(Debug, Clone, PartialEq)]
pub struct WidthSet {
    ratios: Vec<f64>,
    channels: Vec<usize>,
    full: usize,
    curr: usize,
}
impl WidthSet {
    /// Makes a new `WidthSet` for a layer having `full` output channels.
    pub fn new(ratios: &[f64], full: usize) -> Result<Self> {
        track_assert!(!ratios.is_empty(), ErrorKind::InvalidInput);
        for (i, r) in ratios.iter().enumerate() {
            track_assert!(
                *r > 0.0 && *r <= 1.0,
                ErrorKind::InvalidInput,
                "width ratio {} is out of (0, 1]",
                r
            );
            track_assert!(
                !ratios[..i].contains(r),
                ErrorKind::InvalidInput,
                "duplicated width ratio {}",
                r
            );
        }
        let channels = ratios.iter().map(|&r| channels_for(r, full)).collect();
        Ok(Self {
            ratios: ratios.to_vec(),
            channels,
            full,
            curr: 0,
        })
    }

    pub fn n_widths(&self) -> usize {
        self.ratios.len()
    }

    pub fn ratios(&self) -> &[f64] {
        &self.ratios
    }

    /// Channel counts, one per width index.
    pub fn channels(&self) -> &[usize] {
        &self.channels
    }

    pub fn full(&self) -> usize {
        self.full
    }

    pub fn curr_idx(&self) -> usize {
        self.curr
    }

    pub fn curr_ratio(&self) -> f64 {
        self.ratios[self.curr]
    }

    /// Channel count of the current width.
    pub fn curr_width(&self) -> usize {
        self.channels[self.curr]
    }

    pub fn ratio_by_idx(&self, idx: usize) -> Option<f64> {
        self.ratios.get(idx).copied()
    }

    pub fn width_by_idx(&self, idx: usize) -> Option<usize> {
        self.channels.get(idx).copied()
    }

    pub fn set_curr_idx(&mut self, idx: usize) -> Result<()> {
        track_assert!(
            idx < self.n_widths(),
            ErrorKind::InvalidInput,
            "width index {} is out of range [0, {})",
            idx,
            self.n_widths()
        );
        self.curr = idx;
        Ok(())
    }

    /// Returns the index of `ratio` (exact match).
    pub fn ratio_idx(&self, ratio: f64) -> Result<usize> {
        let idx = track_assert_some!(
            self.ratios.iter().position(|&r| r == ratio),
            ErrorKind::InvalidInput,
            "width ratio {} is not registered (known: {:?})",
            ratio,
            self.ratios
        );
        Ok(idx)
    }

    /// Appends a candidate width and returns its index.
    ///
    /// Unlike `new`, zero ratios are accepted here since they are used as index placeholders.
    pub fn add_width(&mut self, ratio: f64) -> usize {
        self.ratios.push(ratio);
        self.channels.push(channels_for(ratio, self.full));
        self.ratios.len() - 1
    }
}

/// Number of times each width index of a layer has been selected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardCounters {
    counts: Vec<u64>,
}
impl ForwardCounters {
    pub fn new(n_widths: usize) -> Self {
        Self {
            counts: vec![0; n_widths],
        }
    }

    pub fn increment(&mut self, idx: usize) {
        if idx >= self.counts.len() {
            self.counts.resize(idx + 1, 0);
        }
        self.counts[idx] += 1;
    }

    pub fn add_width(&mut self) {
        self.counts.push(0);
    }

    pub fn reset(&mut self) {
        self.counts.iter_mut().for_each(|c| *c = 0);
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Returns `(ratio, count)` pairs; indices sharing a ratio are merged.
    pub fn by_ratio(&self, ratios: &[f64]) -> Vec<(f64, u64)> {
        let mut merged: Vec<(f64, u64)> = Vec::new();
        for (&ratio, &count) in ratios.iter().zip(self.counts.iter()) {
            match merged.iter_mut().find(|(r, _)| *r == ratio) {
                Some(entry) => entry.1 += count,
                None => merged.push((ratio, count)),
            }
        }
        merged
    }
}

/// FLOPs of a single `(input channels, output channels)` combination.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlopsEntry {
    pub in_channels: usize,
    pub out_channels: usize,
    pub flops: f64,
}

/// Precomputed FLOPs of a layer for every width combination it can run with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlopsTable {
    entries: Vec<FlopsEntry>,
}
impl FlopsTable {
    pub fn get(&self, in_channels: usize, out_channels: usize) -> Option<f64> {
        self.entries
            .iter()
            .find(|e| e.in_channels == in_channels && e.out_channels == out_channels)
            .map(|e| e.flops)
    }

    /// Inserts `flops` unless the combination is already known.
    pub fn insert(&mut self, in_channels: usize, out_channels: usize, flops: f64) {
        if self.get(in_channels, out_channels).is_none() {
            self.entries.push(FlopsEntry {
                in_channels,
                out_channels,
                flops,
            });
        }
    }

    pub fn entries(&self) -> &[FlopsEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trackable::result::TopLevelResult;

    #[test]
    fn width_set_works() -> TopLevelResult {
        let mut widths = track!(WidthSet::new(&[0.25, 0.5, 0.75, 1.0], 64))?;
        assert_eq!(widths.channels(), &[16, 32, 48, 64]);
        assert_eq!(widths.curr_ratio(), 0.25);

        track!(widths.set_curr_idx(2))?;
        assert_eq!(widths.curr_ratio(), 0.75);
        assert_eq!(widths.curr_width(), 48);
        assert_eq!(track!(widths.ratio_idx(0.75))?, 2);

        assert!(widths.set_curr_idx(4).is_err());
        assert_eq!(widths.curr_idx(), 2);
        assert!(widths.ratio_idx(0.3).is_err());
        Ok(())
    }

    #[test]
    fn invalid_ratios_are_rejected() {
        assert!(WidthSet::new(&[], 16).is_err());
        assert!(WidthSet::new(&[0.0, 1.0], 16).is_err());
        assert!(WidthSet::new(&[0.5, 1.5], 16).is_err());
        assert!(WidthSet::new(&[0.5, 0.5], 16).is_err());
    }

    #[test]
    fn added_widths_are_indexable() -> TopLevelResult {
        let mut widths = track!(WidthSet::new(&[0.5, 1.0], 16))?;
        assert_eq!(widths.add_width(0.75), 2);
        assert_eq!(widths.ratio_by_idx(2), Some(0.75));
        assert_eq!(widths.width_by_idx(2), Some(12));

        assert_eq!(widths.add_width(0.0), 3);
        assert_eq!(widths.width_by_idx(3), Some(0));
        Ok(())
    }

    #[test]
    fn forward_counters_merge_equal_ratios() {
        let mut counters = ForwardCounters::new(3);
        counters.increment(0);
        counters.increment(2);
        counters.increment(2);
        assert_eq!(counters.total(), 3);
        assert_eq!(
            counters.by_ratio(&[0.5, 1.0, 0.5]),
            vec![(0.5, 3), (1.0, 0)]
        );

        counters.reset();
        assert_eq!(counters.total(), 0);
    }

    #[test]
    fn flops_table_keeps_first_value() {
        let mut table = FlopsTable::default();
        table.insert(3, 16, 10.0);
        table.insert(3, 16, 20.0);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(3, 16), Some(10.0));
        assert_eq!(table.get(16, 3), None);
    }
}
