use thiserror::Error;

/// Tolerance for deciding that a scaled quantile has landed on an integer.
const CONVERGENCE_EPS: f64 = 1e-4;

/// Give up once the scaled value exceeds this; anything further left of the
/// decimal point than nine digits is not a percentile label anyone wants.
const MAX_SCALED: f64 = 1.0e9;

/// Errors from [`to_percentile`].
#[derive(Debug, Error, PartialEq)]
pub enum PercentileError {
    /// The quantile was outside of `[0.0, 1.0]`.
    #[error("quantile {0} is out of range")]
    OutOfRange(f64),

    /// The quantile never landed on an integer representation.
    #[error("quantile {0} does not converge to an integer percentile")]
    NoConvergence(f64),
}

/// Converts a quantile into its integer percentile representation.
///
/// Monitoring systems abbreviate quantiles as percentile labels: `0.5` is
/// `p50`, `0.999` is `p999`, `0.9999` is `p9999`. This finds the smallest
/// integer representation of `q * 100 * 10^k` that is within `1e-4` of an
/// integer, so that metric name suffixes stay stable for the usual quantile
/// choices while still rejecting values like `0.99999999999` that would never
/// settle.
pub fn to_percentile(quantile: f64) -> Result<u64, PercentileError> {
    if !(0.0..=1.0).contains(&quantile) {
        return Err(PercentileError::OutOfRange(quantile));
    }

    let mut scaled = quantile * 100.0;
    while scaled <= MAX_SCALED {
        if scaled - scaled.floor() < CONVERGENCE_EPS {
            return Ok(scaled.floor() as u64);
        }
        scaled *= 10.0;
    }

    Err(PercentileError::NoConvergence(quantile))
}

#[cfg(test)]
mod tests {
    use super::{to_percentile, PercentileError};

    #[test]
    fn common_quantiles() {
        assert_eq!(to_percentile(0.5), Ok(50));
        assert_eq!(to_percentile(0.95), Ok(95));
        assert_eq!(to_percentile(0.99), Ok(99));
        assert_eq!(to_percentile(0.999), Ok(999));
        assert_eq!(to_percentile(0.9999), Ok(9999));
    }

    #[test]
    fn edges() {
        assert_eq!(to_percentile(0.0), Ok(0));
        assert_eq!(to_percentile(1.0), Ok(100));
    }

    #[test]
    fn out_of_range() {
        assert_eq!(to_percentile(-0.1), Err(PercentileError::OutOfRange(-0.1)));
        assert_eq!(to_percentile(1.1), Err(PercentileError::OutOfRange(1.1)));
    }

    #[test]
    fn no_convergence() {
        assert_eq!(
            to_percentile(0.99999999999),
            Err(PercentileError::NoConvergence(0.99999999999))
        );
    }
}
