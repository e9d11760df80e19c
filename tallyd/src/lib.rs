//! A statsd-compatible metrics aggregation daemon.
//!
//! Clients push observations over newline-delimited text streams; `tallyd`
//! aggregates them in memory per flush interval and emits summary statistics
//! (counts, sums, quantiles, histogram bins, set cardinalities, gauges) to
//! one or more downstream sinks.
//!
//! The crate is organized along the data path:
//!
//!  - [`parser`] turns one protocol line into a typed sample.
//!  - [`conn`] drives the parser over a buffered connection stream.
//!  - [`aggregate`] and [`registry`] hold the per-flush summary state.
//!  - [`flush`] rotates the registry and drains frozen snapshots to sinks.
//!  - [`sink`] implements the stream (child process) and HTTP consumers,
//!    with [`elide`] suppressing repeated zero-valued metrics.

pub mod aggregate;
pub mod config;
pub mod conn;
pub mod elide;
pub mod flush;
pub mod parser;
pub mod registry;
pub mod sink;

pub use config::DaemonConfig;
pub use flush::Pipeline;
pub use parser::MetricKind;
