//! Summary data structures and queueing helpers used by the tally daemon.
//!
//! Everything in this crate is usable on its own: none of the types know
//! anything about the wire protocol, the flush cycle, or the sinks.

pub mod cardinality;
pub mod histogram;
pub mod lifoq;
pub mod quantile;
pub mod summary;

pub use cardinality::Estimator;
pub use histogram::{BinConfig, BinHistogram};
pub use lifoq::LifoQueue;
pub use quantile::to_percentile;
pub use summary::Summary;
