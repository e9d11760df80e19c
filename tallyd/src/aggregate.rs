//! Per-metric aggregation state.
//!
//! One aggregator instance exists per metric name within a flush window, and
//! every structure here is fixed-memory: counters and gauges are a handful of
//! scalars, timers use a quantile sketch plus an optional pre-declared bin
//! array, sets use a fixed-register cardinality estimator.

use std::sync::Arc;

use tally_util::{BinConfig, BinHistogram, Summary};
use thiserror::Error;

/// Errors from routing a sample into an aggregator.
#[derive(Debug, Error, PartialEq)]
pub enum SampleError {
    /// Timers reject NaN and infinite observations.
    #[error("timer samples must be finite")]
    NonFiniteTimer,

    /// The kind cannot be routed as a numeric sample.
    #[error("samples of this kind have no numeric aggregator")]
    UnsupportedKind,
}

/// Summed occurrence counts, with enough moments for mean and stddev.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    sum_sq: f64,
}

impl Counter {
    /// Adds a sample. Sampled values arrive pre-magnified by the parser, so
    /// each call contributes `value/rate` to the sum but only one observation
    /// to the count.
    pub fn add_sample(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.sum_sq += value * value;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Sample standard deviation over the received values.
    pub fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        let n = self.count as f64;
        let variance = (n * self.sum_sq - self.sum * self.sum) / (n * (n - 1.0));
        variance.max(0.0).sqrt()
    }
}

/// Point-in-time value plus the history of samples within the flush window.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    count: u64,
    sum: f64,
    value: f64,
    min: f64,
    max: f64,
}

impl Gauge {
    /// Adds a sample. Delta samples add to the current value; plain samples
    /// replace it. History (sum, min, max, count) tracks the raw sample
    /// values either way.
    pub fn add_sample(&mut self, sample: f64, delta: bool) {
        if delta {
            self.value += sample;
        } else {
            self.value = sample;
        }
        if self.count == 0 {
            self.min = sample;
            self.max = sample;
        } else {
            self.min = self.min.min(sample);
            self.max = self.max.max(sample);
        }
        self.sum += sample;
        self.count += 1;
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

/// Last-write-wins value, no history.
#[derive(Debug, Clone, Default)]
pub struct GaugeDirect {
    value: f64,
}

impl GaugeDirect {
    pub fn add_sample(&mut self, sample: f64) {
        self.value = sample;
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Timer state: a quantile sketch, running moments, and optionally a
/// fixed-width bin histogram attached at creation time.
pub struct TimerHist {
    summary: Summary,
    count: u64,
    sum: f64,
    sum_sq: f64,
    histogram: Option<BinHistogram>,
}

impl TimerHist {
    /// Creates a timer with the given sketch error bound and optional bin
    /// layout.
    pub fn new(eps: f64, bins: Option<Arc<BinConfig>>) -> TimerHist {
        TimerHist {
            summary: Summary::with_eps(eps),
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            histogram: bins.map(BinHistogram::new),
        }
    }

    /// Adds a sample, weighting the count by `1/rate` for sampled input.
    ///
    /// Non-finite samples are rejected and leave the timer untouched.
    pub fn add_sample(&mut self, value: f64, rate: f64) -> Result<(), SampleError> {
        if !value.is_finite() {
            return Err(SampleError::NonFiniteTimer);
        }

        if let Some(histogram) = &mut self.histogram {
            histogram.record(value);
        }
        self.summary.add(value);

        let weight = if rate > 0.0 && rate <= 1.0 { (1.0 / rate) as u64 } else { 1 };
        self.count += weight.max(1);
        self.sum += value;
        self.sum_sq += value * value;
        Ok(())
    }

    /// Observation count, magnified by sample rates.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Sum of the raw sample values.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.summary.min().unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.summary.max().unwrap_or(0.0)
    }

    /// Estimated value at quantile `q`, or 0.0 when the timer is empty.
    pub fn query(&self, q: f64) -> f64 {
        self.summary.quantile(q).unwrap_or(0.0)
    }

    /// The attached bin histogram, if one was configured for this name.
    pub fn histogram(&self) -> Option<&BinHistogram> {
        self.histogram.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use approx::assert_relative_eq;
    use tally_util::BinConfig;

    use super::{Counter, Gauge, GaugeDirect, SampleError, TimerHist};

    #[test]
    fn counter_basic() {
        let mut counter = Counter::default();
        counter.add_sample(1.0);
        counter.add_sample(4.0);

        assert_eq!(counter.count(), 2);
        assert_relative_eq!(counter.sum(), 5.0);
        assert_relative_eq!(counter.mean(), 2.5);
        assert_relative_eq!(counter.min(), 1.0);
        assert_relative_eq!(counter.max(), 4.0);
    }

    #[test]
    fn counter_magnification() {
        // The parser pre-multiplies sampled values; "a:1|c" then "a:2|c|@0.5"
        // arrive as 1.0 and 4.0.
        let mut counter = Counter::default();
        counter.add_sample(1.0);
        counter.add_sample(2.0 / 0.5);

        assert_eq!(counter.count(), 2);
        assert_relative_eq!(counter.sum(), 5.0);
    }

    #[test]
    fn counter_stddev() {
        let mut counter = Counter::default();
        assert_relative_eq!(counter.stddev(), 0.0);
        counter.add_sample(2.0);
        assert_relative_eq!(counter.stddev(), 0.0);
        counter.add_sample(4.0);
        counter.add_sample(6.0);
        assert_relative_eq!(counter.stddev(), 2.0);
    }

    #[test]
    fn gauge_arithmetic() {
        let mut gauge = Gauge::default();
        gauge.add_sample(10.0, false);
        gauge.add_sample(5.0, true);
        gauge.add_sample(-3.0, true);

        assert_relative_eq!(gauge.value(), 12.0);
        assert_eq!(gauge.count(), 3);
        assert_relative_eq!(gauge.sum(), 12.0);
        assert_relative_eq!(gauge.min(), -3.0);
        assert_relative_eq!(gauge.max(), 10.0);
        assert_relative_eq!(gauge.mean(), 4.0);
    }

    #[test]
    fn gauge_replacement() {
        let mut gauge = Gauge::default();
        gauge.add_sample(10.0, false);
        gauge.add_sample(3.0, false);

        assert_relative_eq!(gauge.value(), 3.0);
        assert_eq!(gauge.count(), 2);
        assert_relative_eq!(gauge.sum(), 13.0);
    }

    #[test]
    fn gauge_direct_last_write_wins() {
        let mut gauge = GaugeDirect::default();
        gauge.add_sample(10.0);
        gauge.add_sample(3.0);
        assert_relative_eq!(gauge.value(), 3.0);
    }

    #[test]
    fn timer_rejects_non_finite() {
        let mut timer = TimerHist::new(0.01, None);
        timer.add_sample(100.0, 1.0).unwrap();

        assert_eq!(timer.add_sample(f64::NAN, 1.0), Err(SampleError::NonFiniteTimer));
        assert_eq!(timer.add_sample(f64::INFINITY, 1.0), Err(SampleError::NonFiniteTimer));
        assert_eq!(timer.add_sample(f64::NEG_INFINITY, 1.0), Err(SampleError::NonFiniteTimer));

        // State is untouched by the rejected samples.
        assert_eq!(timer.count(), 1);
        assert_relative_eq!(timer.sum(), 100.0);
    }

    #[test]
    fn timer_rate_magnifies_count_only() {
        let mut timer = TimerHist::new(0.01, None);
        timer.add_sample(100.0, 0.5).unwrap();

        assert_eq!(timer.count(), 2);
        assert_relative_eq!(timer.sum(), 100.0);
    }

    #[test]
    fn timer_quantiles_and_extremes() {
        let mut timer = TimerHist::new(0.01, None);
        for i in 1..=100 {
            timer.add_sample(i as f64, 1.0).unwrap();
        }

        assert_eq!(timer.count(), 100);
        assert_relative_eq!(timer.min(), 1.0);
        assert_relative_eq!(timer.max(), 100.0);
        assert_relative_eq!(timer.mean(), 50.5);

        let median = timer.query(0.5);
        assert!((median - 50.0).abs() <= 50.0 * 0.05, "median was {median}");
    }

    #[test]
    fn timer_histogram_counts_match_samples() {
        let bins = Arc::new(BinConfig::new(0.0, 100.0, 10.0).expect("valid layout"));
        let mut timer = TimerHist::new(0.01, Some(bins));

        for i in 0..50 {
            timer.add_sample(i as f64 * 3.0, 1.0).unwrap();
        }

        let histogram = timer.histogram().expect("histogram was configured");
        assert_eq!(histogram.total(), 50);
        assert_eq!(histogram.underflow(), 0);
        // Samples 34..=49 map to 102.0..=147.0, at or above the range.
        assert_eq!(histogram.overflow(), 16);
    }

    #[test]
    fn empty_timer_queries_zero() {
        let timer = TimerHist::new(0.01, None);
        assert_relative_eq!(timer.query(0.5), 0.0);
        assert_relative_eq!(timer.min(), 0.0);
        assert_relative_eq!(timer.mean(), 0.0);
    }
}
