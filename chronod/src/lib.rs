//! chronod: a write-optimized time-series storage daemon.
//!
//! Samples arrive over TCP or UDP in a RESP-like framed dialect or an
//! OpenTSDB-style line dialect, flow through lock-free per-session
//! queues into a single writer thread, get reordered inside a sliding
//! window and land as compressed chunks in a ring of fixed-size paged
//! volumes.

pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod protocol;
pub mod server;
pub mod storage;
pub mod types;

pub use config::Config;
pub use error::StorageError;
pub use metrics::Metrics;
pub use types::Sample;
