//! Daemon configuration.
//!
//! These are plain in-memory structs: loading them from a config file is the
//! caller's concern. [`DaemonConfig::validate`] applies the same sanity
//! checks a file loader would, so sinks can trust the values they read.

use std::sync::Arc;
use std::time::Duration;

use radix_trie::Trie;
use tally_util::quantile::to_percentile;
use tally_util::{cardinality, BinConfig};
use thiserror::Error;

use crate::parser::MetricKind;

/// Default quantiles reported for timers.
pub const DEFAULT_QUANTILES: [f64; 3] = [0.5, 0.95, 0.99];

/// Default relative error bound for timer sketches.
pub const DEFAULT_TIMER_EPS: f64 = 0.01;

/// Errors from configuration validation or sink construction.
#[derive(Debug, Error)]
pub enum BuildError {
    /// A setting failed validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfiguration {
        /// Details about the invalid setting.
        reason: String,
    },

    /// A sink worker thread could not be spawned.
    #[error("failed to spawn sink worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Name prefixes applied per metric kind at emission time.
#[derive(Debug, Clone)]
pub struct Prefixes {
    pub counter: String,
    pub timer: String,
    pub gauge: String,
    pub set: String,
    pub key_val: String,
}

impl Prefixes {
    /// The prefix for the given kind. Direct gauges share the gauge prefix.
    pub fn for_kind(&self, kind: MetricKind) -> &str {
        match kind {
            MetricKind::Counter => &self.counter,
            MetricKind::Timer => &self.timer,
            MetricKind::Gauge | MetricKind::GaugeDelta | MetricKind::GaugeDirect => &self.gauge,
            MetricKind::Set => &self.set,
            MetricKind::KeyVal => &self.key_val,
        }
    }

    /// No prefixes at all; emitted names are the raw metric names.
    pub fn none() -> Prefixes {
        Prefixes {
            counter: String::new(),
            timer: String::new(),
            gauge: String::new(),
            set: String::new(),
            key_val: String::new(),
        }
    }
}

impl Default for Prefixes {
    fn default() -> Prefixes {
        Prefixes {
            counter: "counts.".to_string(),
            timer: "timers.".to_string(),
            gauge: "gauges.".to_string(),
            set: "sets.".to_string(),
            key_val: "kv.".to_string(),
        }
    }
}

/// Top-level daemon configuration.
pub struct DaemonConfig {
    /// Relative error bound for timer quantile sketches.
    pub timer_eps: f64,

    /// Quantiles reported for timers, each in `(0, 1)`.
    pub quantiles: Vec<f64>,

    /// Bin layouts attached to timers by longest-prefix match on the name.
    pub histograms: Trie<String, Arc<BinConfig>>,

    /// Register precision for set cardinality estimators.
    pub set_precision: u8,

    /// Time between registry rotations.
    pub flush_interval: Duration,

    /// Emit count/mean/sum/lower/upper/rate for counters instead of the sum.
    pub extended_counters: bool,

    /// Per-kind name prefixes.
    pub prefixes: Prefixes,

    /// When set, every received sample also bumps this counter.
    pub input_counter: Option<String>,

    /// Downstream sinks, flushed in order.
    pub sinks: Vec<SinkConfig>,
}

impl Default for DaemonConfig {
    fn default() -> DaemonConfig {
        DaemonConfig {
            timer_eps: DEFAULT_TIMER_EPS,
            quantiles: DEFAULT_QUANTILES.to_vec(),
            histograms: Trie::new(),
            set_precision: cardinality::DEFAULT_PRECISION,
            flush_interval: Duration::from_secs(10),
            extended_counters: false,
            prefixes: Prefixes::default(),
            input_counter: None,
            sinks: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// The flush interval in (fractional) seconds, as used by rate fields.
    pub fn flush_interval_secs(&self) -> f64 {
        self.flush_interval.as_secs_f64()
    }

    /// Checks the settings a file loader cannot express as types.
    pub fn validate(&self) -> Result<(), BuildError> {
        if !(self.timer_eps > 0.0 && self.timer_eps < 0.5) {
            return Err(BuildError::InvalidConfiguration {
                reason: format!("timer_eps {} must be in (0, 0.5)", self.timer_eps),
            });
        }

        for &q in &self.quantiles {
            if !(q > 0.0 && q < 1.0) {
                return Err(BuildError::InvalidConfiguration {
                    reason: format!("quantile {q} must be in (0, 1)"),
                });
            }
            if to_percentile(q).is_err() {
                return Err(BuildError::InvalidConfiguration {
                    reason: format!("quantile {q} has no percentile representation"),
                });
            }
        }

        if !(4..=18).contains(&self.set_precision) {
            return Err(BuildError::InvalidConfiguration {
                reason: format!("set_precision {} must be in [4, 18]", self.set_precision),
            });
        }

        if self.flush_interval.is_zero() {
            return Err(BuildError::InvalidConfiguration {
                reason: "flush_interval must be positive".to_string(),
            });
        }

        for sink in &self.sinks {
            sink.validate()?;
        }

        Ok(())
    }
}

/// One configured sink.
#[derive(Debug, Clone)]
pub enum SinkConfig {
    Stream(StreamSinkConfig),
    Http(HttpSinkConfig),
}

impl SinkConfig {
    fn validate(&self) -> Result<(), BuildError> {
        match self {
            SinkConfig::Stream(stream) => {
                if stream.command.is_empty() {
                    return Err(BuildError::InvalidConfiguration {
                        reason: "stream sink requires a command".to_string(),
                    });
                }
            }
            SinkConfig::Http(http) => {
                if http.post_url.is_empty() {
                    return Err(BuildError::InvalidConfiguration {
                        reason: "http sink requires a post_url".to_string(),
                    });
                }
                if http.workers == 0 {
                    return Err(BuildError::InvalidConfiguration {
                        reason: "http sink requires at least one worker".to_string(),
                    });
                }
                if http.max_buffer_size == 0 {
                    return Err(BuildError::InvalidConfiguration {
                        reason: "http sink requires a non-zero queue capacity".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Stream sink: pipe flushed metrics to a child process.
#[derive(Debug, Clone)]
pub struct StreamSinkConfig {
    /// Shell command launched per flush; metrics are written to its stdin.
    pub command: String,
}

/// OAuth2 client-credentials settings for the HTTP sink.
#[derive(Debug, Clone)]
pub struct OauthConfig {
    pub token_url: String,
    pub key: String,
    pub secret: String,
}

/// HTTP sink: batch flushed metrics into form-urlencoded JSON POSTs.
#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Endpoint receiving the metric batches.
    pub post_url: String,

    /// Form field name carrying the JSON document.
    pub metrics_name: String,

    /// Form field name carrying the formatted flush time.
    pub timestamp_name: String,

    /// strftime-style format for the flush time.
    pub timestamp_format: String,

    /// Extra form fields appended to every request body.
    pub params: Vec<(String, String)>,

    /// When set, requests carry a bearer token from this token endpoint.
    pub oauth: Option<OauthConfig>,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Byte capacity of the outbound work queue.
    pub max_buffer_size: usize,

    /// Smear initial sends over `[0, send_backoff_ms)` to decorrelate bursts.
    pub send_backoff_ms: u64,

    /// Emit a zero-valued metric only every this many flushes; 0 disables.
    pub elide_interval: u32,

    /// Number of sender threads.
    pub workers: usize,
}

impl Default for HttpSinkConfig {
    fn default() -> HttpSinkConfig {
        HttpSinkConfig {
            post_url: String::new(),
            metrics_name: "metrics".to_string(),
            timestamp_name: "timestamp".to_string(),
            timestamp_format: "%Y-%m-%dT%H:%M:%S".to_string(),
            params: Vec::new(),
            oauth: None,
            timeout: Duration::from_secs(30),
            max_buffer_size: 10 * 1024 * 1024,
            send_backoff_ms: 0,
            elide_interval: 0,
            workers: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DaemonConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn rejects_bad_quantiles() {
        let mut config = DaemonConfig::default();
        config.quantiles = vec![0.5, 1.0];
        assert!(config.validate().is_err());

        config.quantiles = vec![0.99999999999];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_eps() {
        let mut config = DaemonConfig::default();
        config.timer_eps = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_stream_command() {
        let mut config = DaemonConfig::default();
        config.sinks = vec![SinkConfig::Stream(StreamSinkConfig { command: String::new() })];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_http_sink_without_url() {
        let mut config = DaemonConfig::default();
        config.sinks = vec![SinkConfig::Http(HttpSinkConfig::default())];
        assert!(config.validate().is_err());
    }

    #[test]
    fn prefixes_by_kind() {
        let prefixes = Prefixes::default();
        assert_eq!(prefixes.for_kind(MetricKind::Counter), "counts.");
        assert_eq!(prefixes.for_kind(MetricKind::GaugeDelta), "gauges.");
        assert_eq!(prefixes.for_kind(MetricKind::GaugeDirect), "gauges.");
        assert_eq!(prefixes.for_kind(MetricKind::KeyVal), "kv.");
    }
}
