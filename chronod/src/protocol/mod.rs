//! Wire protocol: framing substrate and the two ingestion dialects.

pub mod parser;
pub mod resp;
pub mod stream;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Sample, SeriesId};

/// Where parsed samples go. Sessions implement this on top of their
/// series cache and pipeline spout; `write` may suspend in back-pressure.
///
/// A parse pass fails with [`crate::error::StorageError::ParseError`]
/// on a framing violation (the session answers `-PARSER` and closes)
/// or with the storage error a synchronous write rejection produced
/// (answered `-DB`; the connection stays open).
#[async_trait]
pub trait ProtocolSink: Send {
    fn resolve(&mut self, name: &str) -> Result<SeriesId>;
    async fn write(&mut self, sample: Sample) -> Result<()>;
}
