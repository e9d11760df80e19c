//! Flush consumers.
//!
//! A sink receives each frozen snapshot once per flush and may keep
//! background state of its own (the HTTP sink runs a worker pool). Sinks are
//! composed into a list and driven in order by the flush pipeline.

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::SystemTime;

use thiserror::Error;

use crate::config::{BuildError, DaemonConfig, SinkConfig};
use crate::registry::Registry;

mod http;
mod stream;

pub use http::HttpSink;
pub use stream::StreamSink;

/// Errors surfaced from one sink flush.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Writing to the sink's output failed mid-flush.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// The stream sink's child process exited non-zero.
    #[error("command {command:?} exited with {status}")]
    Command { command: String, status: ExitStatus },

    /// A metrics batch could not be serialized.
    #[error("failed to serialize metrics: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A consumer of flush snapshots.
pub trait Sink: Send + Sync {
    /// Short name used in log records.
    fn name(&self) -> &str;

    /// Emits one snapshot. Failures are logged by the pipeline; the snapshot
    /// is destroyed regardless.
    fn flush(&self, snapshot: &Registry, now: SystemTime) -> Result<(), SinkError>;

    /// Called exactly once at shutdown, after the final flush.
    fn close(&self) {}
}

/// Builds the configured sinks, in configuration order.
pub fn build_sinks(config: &Arc<DaemonConfig>) -> Result<Vec<Box<dyn Sink>>, BuildError> {
    let mut sinks: Vec<Box<dyn Sink>> = Vec::with_capacity(config.sinks.len());
    for sink_config in &config.sinks {
        match sink_config {
            SinkConfig::Stream(stream) => {
                sinks.push(Box::new(StreamSink::new(stream.clone(), Arc::clone(config))));
            }
            SinkConfig::Http(http) => {
                sinks.push(Box::new(HttpSink::spawn(http.clone(), Arc::clone(config))?));
            }
        }
    }
    Ok(sinks)
}
