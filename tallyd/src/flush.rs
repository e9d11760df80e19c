//! Registry rotation and the flush pipeline.
//!
//! The pipeline owns the process-wide "current" registry. Ingest routes
//! samples into it under a lock; each flush tick swaps in a fresh registry
//! under the same lock and hands the old one, now a frozen snapshot, to a
//! detached drain thread that runs the sinks and then drops it.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::aggregate::SampleError;
use crate::config::DaemonConfig;
use crate::parser::MetricKind;
use crate::registry::Registry;
use crate::sink::Sink;

/// The sink list shared between the flush ticks and drain threads.
pub type Sinks = Arc<Vec<Box<dyn Sink>>>;

struct FlushOp {
    snapshot: Registry,
    sinks: Sinks,
}

/// Owner of the current registry and the rotation protocol.
pub struct Pipeline {
    current: Mutex<Option<Registry>>,
    config: Arc<DaemonConfig>,
}

impl Pipeline {
    /// Creates a pipeline with an empty current registry.
    pub fn new(config: Arc<DaemonConfig>) -> Pipeline {
        Pipeline {
            current: Mutex::new(Some(Registry::new(Arc::clone(&config)))),
            config,
        }
    }

    /// The daemon configuration this pipeline was built with.
    pub fn config(&self) -> &Arc<DaemonConfig> {
        &self.config
    }

    /// Routes one numeric sample into the current registry.
    ///
    /// Samples arriving after [`final_flush`](Self::final_flush) are
    /// silently dropped; the listeners are already shutting down.
    pub fn add_sample(
        &self,
        kind: MetricKind,
        name: &str,
        value: f64,
        rate: f64,
    ) -> Result<(), SampleError> {
        match self.current.lock().as_mut() {
            Some(registry) => registry.add_sample(kind, name, value, rate),
            None => Ok(()),
        }
    }

    /// Adds an element observation to the named set in the current registry.
    pub fn set_update(&self, name: &str, element: &str) {
        if let Some(registry) = self.current.lock().as_mut() {
            registry.set_update(name, element);
        }
    }

    /// Rotates the registry and drains the old one on a background thread.
    ///
    /// The swap happens under the registry lock, so every sample routed
    /// before this returns lands in exactly one of the two registries. If
    /// the drain thread cannot be spawned, the swap is rolled back and the
    /// samples are kept for the next tick.
    pub fn flush_tick(&self, sinks: &Sinks) {
        let fresh = Registry::new(Arc::clone(&self.config));

        // The drain thread waits for its snapshot on a channel so a failed
        // spawn leaves the snapshot in our hands for rollback.
        let (handoff, incoming) = mpsc::sync_channel::<FlushOp>(1);
        let spawned = thread::Builder::new().name("tallyd-flush".to_string()).spawn(move || {
            if let Ok(op) = incoming.recv() {
                drain(op.snapshot, &op.sinks);
            }
        });

        let mut current = self.current.lock();
        let Some(old) = current.take() else {
            return;
        };

        match spawned {
            Ok(_detached) => {
                *current = Some(fresh);
                drop(current);

                if handoff.send(FlushOp { snapshot: old, sinks: Arc::clone(sinks) }).is_err() {
                    warn!("flush thread went away before the snapshot handoff");
                }
            }
            Err(e) => {
                *current = Some(old);
                warn!(error = %e, "failed to spawn flush thread, keeping samples for next tick");
            }
        }
    }

    /// Flushes the final snapshot synchronously and closes every sink.
    ///
    /// The current registry is cleared; later samples are dropped.
    pub fn final_flush(&self, sinks: &Sinks) {
        let old = self.current.lock().take();
        if let Some(snapshot) = old {
            info!(metrics = snapshot.num_metrics(), "final flush");
            drain(snapshot, sinks);
        }

        for sink in sinks.iter() {
            sink.close();
        }
    }
}

/// Runs every sink against the snapshot, then destroys it.
fn drain(snapshot: Registry, sinks: &[Box<dyn Sink>]) {
    let now = SystemTime::now();
    debug!(metrics = snapshot.num_metrics(), "draining snapshot");

    for sink in sinks {
        if let Err(e) = sink.flush(&snapshot, now) {
            warn!(sink = sink.name(), error = %e, "sink flush failed");
        }
    }

    drop(snapshot);
}
