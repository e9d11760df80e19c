//! Fixed-width bin histograms.

use std::sync::Arc;

/// Bin layout for a [`BinHistogram`].
///
/// The layout covers `[min_val, max_val)` with bins of `bin_width`, plus one
/// underflow slot below `min_val` and one overflow slot at or above `max_val`.
/// `num_bins` is the total slot count including both edge slots.
#[derive(Debug, Clone, PartialEq)]
pub struct BinConfig {
    min_val: f64,
    max_val: f64,
    bin_width: f64,
    num_bins: usize,
}

impl BinConfig {
    /// Creates a new `BinConfig`.
    ///
    /// Returns `None` when the range is empty or the width is not a positive
    /// finite number.
    pub fn new(min_val: f64, max_val: f64, bin_width: f64) -> Option<BinConfig> {
        if !(min_val.is_finite() && max_val.is_finite() && bin_width.is_finite()) {
            return None;
        }
        if max_val <= min_val || bin_width <= 0.0 {
            return None;
        }

        let interior = ((max_val - min_val) / bin_width).ceil() as usize;

        Some(BinConfig { min_val, max_val, bin_width, num_bins: interior + 2 })
    }

    /// Lower edge of the covered range.
    pub fn min_val(&self) -> f64 {
        self.min_val
    }

    /// Upper edge of the covered range.
    pub fn max_val(&self) -> f64 {
        self.max_val
    }

    /// Width of each interior bin.
    pub fn bin_width(&self) -> f64 {
        self.bin_width
    }

    /// Total number of slots, including underflow and overflow.
    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    fn slot(&self, sample: f64) -> usize {
        if sample < self.min_val {
            0
        } else if sample >= self.max_val {
            self.num_bins - 1
        } else {
            let idx = ((sample - self.min_val) / self.bin_width) as usize + 1;
            // A sample just under max_val can land on the overflow slot when
            // the range is not an exact multiple of the width.
            idx.min(self.num_bins - 2)
        }
    }
}

/// A bucketed histogram over a fixed-width [`BinConfig`].
///
/// Unlike a quantile sketch, this tracks exact per-bin counts for a
/// pre-declared layout, which is what downstream systems that want raw bins
/// consume.
#[derive(Debug, Clone)]
pub struct BinHistogram {
    config: Arc<BinConfig>,
    counts: Vec<u64>,
}

impl BinHistogram {
    /// Creates a new `BinHistogram` with all slots at zero.
    pub fn new(config: Arc<BinConfig>) -> BinHistogram {
        let counts = vec![0u64; config.num_bins()];
        BinHistogram { config, counts }
    }

    /// Records a single sample.
    pub fn record(&mut self, sample: f64) {
        let slot = self.config.slot(sample);
        self.counts[slot] += 1;
    }

    /// Gets the layout this histogram was built from.
    pub fn config(&self) -> &BinConfig {
        &self.config
    }

    /// Gets the raw slot counts: `[underflow, interior.., overflow]`.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Count of samples below the covered range.
    pub fn underflow(&self) -> u64 {
        self.counts[0]
    }

    /// Count of samples at or above the covered range.
    pub fn overflow(&self) -> u64 {
        self.counts[self.counts.len() - 1]
    }

    /// Iterates the interior bins as `(lower_bound, count)` pairs.
    pub fn interior(&self) -> impl Iterator<Item = (f64, u64)> + '_ {
        let min_val = self.config.min_val();
        let width = self.config.bin_width();
        self.counts[1..self.counts.len() - 1]
            .iter()
            .enumerate()
            .map(move |(i, count)| (min_val + width * i as f64, *count))
    }

    /// Total number of recorded samples across all slots.
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}
