use sketches_ddsketch::{Config, DDSketch};

const DEFAULT_MAX_BUCKETS: u32 = 2048;
const DEFAULT_MIN_VALUE: f64 = 1.0e-9;

/// A quantile sketch with relative-error guarantees.
///
/// Based on [DDSketch][ddsketch], `Summary` provides quantiles over an arbitrary
/// distribution of floating-point numbers, including negative numbers, using a
/// fixed-memory sketch. The error is relative: for a true value `v` at some
/// quantile, the estimate is within `v * eps` of `v`, regardless of the
/// absolute range of the inputs.
///
/// Negative values are supported by keeping two sketches, one per sign, plus a
/// counter for the zero band. Values whose magnitude is below `min_value` are
/// counted as zeroes.
///
/// [ddsketch]: https://arxiv.org/abs/1908.10693
#[derive(Clone)]
pub struct Summary {
    negative: DDSketch,
    positive: DDSketch,
    min_value: f64,
    zeroes: usize,
    min: Option<f64>,
    max: Option<f64>,
}

impl Summary {
    /// Creates a new [`Summary`].
    ///
    /// `eps` is the desired relative error. `max_buckets` bounds the number of
    /// subbuckets each underlying sketch may allocate, which bounds memory:
    /// each bucket costs eight bytes. `min_value` is the smallest magnitude
    /// distinguished from zero.
    pub fn new(eps: f64, max_buckets: u32, min_value: f64) -> Summary {
        let config = Config::new(eps, max_buckets, min_value.abs());

        Summary {
            negative: DDSketch::new(config.clone()),
            positive: DDSketch::new(config),
            min_value: min_value.abs(),
            zeroes: 0,
            min: None,
            max: None,
        }
    }

    /// Creates a new [`Summary`] with the given relative error and default
    /// bucket bound (2048) and zero threshold (1.0e-9).
    pub fn with_eps(eps: f64) -> Summary {
        Summary::new(eps, DEFAULT_MAX_BUCKETS, DEFAULT_MIN_VALUE)
    }

    /// Adds a sample to the summary.
    ///
    /// Non-finite values are ignored; callers that need to reject them should
    /// do so before adding.
    pub fn add(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }

        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));

        let vabs = value.abs();
        if vabs <= self.min_value {
            self.zeroes += 1;
        } else if value > 0.0 {
            self.positive.add(vabs);
        } else {
            self.negative.add(vabs);
        }
    }

    /// Gets the estimated value at the given quantile.
    ///
    /// Returns `None` if the sketch is empty or the quantile is outside of
    /// `[0.0, 1.0]`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if !(0.0..=1.0).contains(&q) {
            return None;
        }

        let ncount = self.negative.count();
        let pcount = self.positive.count();
        let zcount = self.zeroes;
        let total = ncount + pcount + zcount;
        if total == 0 {
            return None;
        }

        // 1-based rank of the requested quantile over the merged value order:
        // negatives ascending, then the zero band, then positives ascending.
        let rank = ((q * total as f64).ceil() as usize).clamp(1, total);

        if rank <= ncount {
            // The negative side stores magnitudes, so the order inverts.
            let nq = 1.0 - (rank as f64 / ncount as f64);
            self.negative.quantile(nq.clamp(0.0, 1.0)).ok().flatten().map(|v| -v)
        } else if rank <= ncount + zcount {
            Some(0.0)
        } else {
            let pq = (rank - ncount - zcount) as f64 / pcount as f64;
            self.positive.quantile(pq.clamp(0.0, 1.0)).ok().flatten()
        }
    }

    /// Gets the minimum value this summary has seen so far.
    pub fn min(&self) -> Option<f64> {
        self.min
    }

    /// Gets the maximum value this summary has seen so far.
    pub fn max(&self) -> Option<f64> {
        self.max
    }

    /// Gets the number of samples in this summary.
    pub fn count(&self) -> usize {
        self.negative.count() + self.positive.count() + self.zeroes
    }

    /// Whether or not this summary is empty.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::Summary;

    #[test]
    fn empty() {
        let summary = Summary::with_eps(0.01);
        assert!(summary.is_empty());
        assert_eq!(summary.count(), 0);
        assert_eq!(summary.min(), None);
        assert_eq!(summary.max(), None);
        assert_eq!(summary.quantile(0.5), None);
    }

    #[test]
    fn out_of_range_quantile() {
        let mut summary = Summary::with_eps(0.01);
        summary.add(42.0);
        assert_eq!(summary.quantile(-0.1), None);
        assert_eq!(summary.quantile(1.1), None);
    }

    #[test]
    fn single_value() {
        let mut summary = Summary::with_eps(0.01);
        summary.add(42.0);

        assert_eq!(summary.count(), 1);
        assert_eq!(summary.min(), Some(42.0));
        assert_eq!(summary.max(), Some(42.0));

        let median = summary.quantile(0.5).expect("non-empty");
        assert!((median - 42.0).abs() <= 42.0 * 0.01);
    }

    #[test]
    fn uniform_median() {
        let mut summary = Summary::with_eps(0.01);
        for i in 1..=1000 {
            summary.add(i as f64);
        }

        assert_eq!(summary.count(), 1000);
        let median = summary.quantile(0.5).expect("non-empty");
        assert!((median - 500.0).abs() <= 500.0 * 0.05, "median was {median}");

        let p99 = summary.quantile(0.99).expect("non-empty");
        assert!((p99 - 990.0).abs() <= 990.0 * 0.05, "p99 was {p99}");
    }

    #[test]
    fn negative_values() {
        let mut summary = Summary::with_eps(0.01);
        for i in 1..=100 {
            summary.add(-(i as f64));
        }

        assert_eq!(summary.min(), Some(-100.0));
        assert_eq!(summary.max(), Some(-1.0));

        let median = summary.quantile(0.5).expect("non-empty");
        assert!(median < 0.0);
        assert!((median + 50.0).abs() <= 50.0 * 0.06, "median was {median}");
    }

    #[test]
    fn zero_band() {
        let mut summary = Summary::with_eps(0.01);
        summary.add(0.0);
        summary.add(0.0);
        summary.add(0.0);

        assert_eq!(summary.count(), 3);
        assert_eq!(summary.quantile(0.5), Some(0.0));
    }

    #[test]
    fn non_finite_ignored() {
        let mut summary = Summary::with_eps(0.01);
        summary.add(f64::NAN);
        summary.add(f64::INFINITY);
        assert!(summary.is_empty());
    }
}
