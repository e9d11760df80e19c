//! The per-flush metrics registry.
//!
//! One registry lives behind the ingest path at a time; the flush
//! orchestrator swaps in a fresh one each tick and hands the old one to the
//! sinks as a frozen snapshot. The registry itself is not synchronized; the
//! pipeline serializes access.

use std::ops::ControlFlow;
use std::sync::Arc;

use hashbrown::HashMap;
use tally_util::Estimator;

use crate::aggregate::{Counter, Gauge, GaugeDirect, SampleError, TimerHist};
use crate::config::DaemonConfig;
use crate::parser::MetricKind;

/// A borrowed view of one aggregator during iteration.
pub enum MetricValue<'a> {
    Counter(&'a Counter),
    Timer(&'a TimerHist),
    Gauge(&'a Gauge),
    GaugeDirect(&'a GaugeDirect),
    Set(&'a Estimator),
    KeyVal(f64),
}

impl MetricValue<'_> {
    /// The kind of the underlying aggregator.
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Timer(_) => MetricKind::Timer,
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::GaugeDirect(_) => MetricKind::GaugeDirect,
            MetricValue::Set(_) => MetricKind::Set,
            MetricValue::KeyVal(_) => MetricKind::KeyVal,
        }
    }
}

/// Name-to-aggregator maps, one per kind.
///
/// The same name may exist under several kinds at once. Lookup misses create
/// a freshly initialized aggregator before the first sample is applied.
pub struct Registry {
    config: Arc<DaemonConfig>,
    counters: HashMap<String, Counter>,
    timers: HashMap<String, TimerHist>,
    gauges: HashMap<String, Gauge>,
    gauges_direct: HashMap<String, GaugeDirect>,
    sets: HashMap<String, Estimator>,
    key_vals: HashMap<String, f64>,
}

impl Registry {
    /// Creates an empty registry sharing the daemon's aggregation settings.
    pub fn new(config: Arc<DaemonConfig>) -> Registry {
        Registry {
            config,
            counters: HashMap::new(),
            timers: HashMap::new(),
            gauges: HashMap::new(),
            gauges_direct: HashMap::new(),
            sets: HashMap::new(),
            key_vals: HashMap::new(),
        }
    }

    /// Routes one numeric sample, creating the aggregator on first sight.
    ///
    /// `rate` only affects counters (already magnified by the parser) and
    /// timers (count weighting). Set samples are not numeric; use
    /// [`set_update`](Self::set_update).
    pub fn add_sample(
        &mut self,
        kind: MetricKind,
        name: &str,
        value: f64,
        rate: f64,
    ) -> Result<(), SampleError> {
        match kind {
            MetricKind::Counter => {
                self.counters.entry_ref(name).or_default().add_sample(value);
                Ok(())
            }
            MetricKind::Timer => {
                if !value.is_finite() {
                    // Reject before the lookup so an invalid first sample
                    // does not create an empty timer.
                    return Err(SampleError::NonFiniteTimer);
                }
                let timer = self.timers.entry_ref(name).or_insert_with(|| {
                    let bins = self.config.histograms.get_ancestor_value(&name.to_string());
                    TimerHist::new(self.config.timer_eps, bins.cloned())
                });
                timer.add_sample(value, rate)
            }
            MetricKind::Gauge => {
                self.gauges.entry_ref(name).or_default().add_sample(value, false);
                Ok(())
            }
            MetricKind::GaugeDelta => {
                self.gauges.entry_ref(name).or_default().add_sample(value, true);
                Ok(())
            }
            MetricKind::GaugeDirect => {
                self.gauges_direct.entry_ref(name).or_default().add_sample(value);
                Ok(())
            }
            MetricKind::KeyVal => {
                self.key_vals.insert(name.to_string(), value);
                Ok(())
            }
            MetricKind::Set => Err(SampleError::UnsupportedKind),
        }
    }

    /// Adds an element observation to the named set.
    pub fn set_update(&mut self, name: &str, element: &str) {
        let set = self
            .sets
            .entry_ref(name)
            .or_insert_with(|| Estimator::new(self.config.set_precision));
        set.add(element.as_bytes());
    }

    /// Visits every metric in kind order: counters, timers, gauges, direct
    /// gauges, sets, then key/value passthroughs. The callback can stop the
    /// walk early with `ControlFlow::Break`.
    pub fn iter<F>(&self, mut f: F) -> ControlFlow<()>
    where
        F: FnMut(&str, MetricValue<'_>) -> ControlFlow<()>,
    {
        for (name, counter) in &self.counters {
            f(name, MetricValue::Counter(counter))?;
        }
        for (name, timer) in &self.timers {
            f(name, MetricValue::Timer(timer))?;
        }
        for (name, gauge) in &self.gauges {
            f(name, MetricValue::Gauge(gauge))?;
        }
        for (name, gauge) in &self.gauges_direct {
            f(name, MetricValue::GaugeDirect(gauge))?;
        }
        for (name, set) in &self.sets {
            f(name, MetricValue::Set(set))?;
        }
        for (name, value) in &self.key_vals {
            f(name, MetricValue::KeyVal(*value))?;
        }
        ControlFlow::Continue(())
    }

    /// Total number of metrics across all kinds.
    pub fn num_metrics(&self) -> usize {
        self.counters.len()
            + self.timers.len()
            + self.gauges.len()
            + self.gauges_direct.len()
            + self.sets.len()
            + self.key_vals.len()
    }
}
