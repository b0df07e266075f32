//! The two ingestion dialects on top of the framing substrate.
//!
//! Both parsers follow the same control flow: parse one complete record,
//! commit it with `consume`, emit its samples, loop; when bytes run out
//! mid-record, `discard` rewinds to the last commit point and the caller
//! feeds more data. A malformed record on a frame boundary is fatal for
//! the connection and surfaces as `StorageError::ParseError`.

use log::debug;

use super::resp::{self, FrameError, RespType};
use super::stream::{LineRead, ReadBuffer};
use super::ProtocolSink;
use crate::error::StorageError;
use crate::types::{Sample, SeriesId, Timestamp};

/// Seconds to nanoseconds (line dialect timestamps).
const NS_PER_SECOND: u64 = 1_000_000_000;

fn lift<T>(result: Result<T, FrameError>) -> Result<Option<T>, StorageError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(FrameError::Incomplete) => Ok(None),
        Err(FrameError::Fatal { message, pos }) => {
            Err(StorageError::ParseError { message, pos })
        }
    }
}

/// RESP-like dialect: records are `(name, timestamp, value)` triplets of
/// top-level items, with bulk fan-out when the name is a `|`-separated
/// list and the value an array.
pub struct RespParser {
    rdbuf: ReadBuffer,
    scratch: Vec<u8>,
}

enum RecordStep {
    Done,
    NeedMore,
}

impl RespParser {
    pub fn new() -> Self {
        Self {
            rdbuf: ReadBuffer::new(),
            scratch: Vec::new(),
        }
    }

    pub fn buffer(&mut self) -> &mut ReadBuffer {
        &mut self.rdbuf
    }

    fn fatal(&self, message: &str) -> StorageError {
        let (message, pos) = self.rdbuf.error_context(message);
        StorageError::ParseError { message, pos }
    }

    /// Parse every complete record currently buffered.
    pub async fn parse_next<S: ProtocolSink>(
        &mut self,
        sink: &mut S,
    ) -> Result<(), StorageError> {
        loop {
            match self.parse_record(sink).await? {
                RecordStep::Done => {}
                RecordStep::NeedMore => {
                    self.rdbuf.discard();
                    return Ok(());
                }
            }
        }
    }

    async fn parse_record<S: ProtocolSink>(
        &mut self,
        sink: &mut S,
    ) -> Result<RecordStep, StorageError> {
        // Series name (or |-separated list of names).
        match resp::next_type(&self.rdbuf) {
            None => return Ok(RecordStep::NeedMore),
            Some(RespType::String) => {
                if lift(resp::read_string(&mut self.rdbuf, &mut self.scratch))?.is_none() {
                    return Ok(RecordStep::NeedMore);
                }
            }
            Some(RespType::BulkString) => {
                if lift(resp::read_bulkstr(&mut self.rdbuf, &mut self.scratch))?.is_none() {
                    return Ok(RecordStep::NeedMore);
                }
            }
            Some(_) => return Err(self.fatal("unexpected parameter id format")),
        }
        let ids = self.resolve_names(sink)?;

        // Timestamp.
        let timestamp = match resp::next_type(&self.rdbuf) {
            None => return Ok(RecordStep::NeedMore),
            Some(RespType::Integer) => match lift(resp::read_int(&mut self.rdbuf))? {
                None => return Ok(RecordStep::NeedMore),
                Some(v) => v,
            },
            Some(RespType::String) => {
                if lift(resp::read_string(&mut self.rdbuf, &mut self.scratch))?.is_none() {
                    return Ok(RecordStep::NeedMore);
                }
                match std::str::from_utf8(&self.scratch)
                    .ok()
                    .and_then(|s| s.parse::<Timestamp>().ok())
                {
                    Some(v) => v,
                    None => {
                        return Err(self.fatal("unexpected parameter timestamp format"))
                    }
                }
            }
            Some(_) => return Err(self.fatal("unexpected parameter timestamp format")),
        };

        // Value, or an array of values in bulk mode.
        let values = match resp::next_type(&self.rdbuf) {
            None => return Ok(RecordStep::NeedMore),
            Some(RespType::Integer) => match lift(resp::read_int(&mut self.rdbuf))? {
                None => return Ok(RecordStep::NeedMore),
                Some(v) => vec![v as f64],
            },
            Some(RespType::String) => {
                if lift(resp::read_string(&mut self.rdbuf, &mut self.scratch))?.is_none() {
                    return Ok(RecordStep::NeedMore);
                }
                match self.parse_float() {
                    Some(v) => vec![v],
                    None => return Err(self.fatal("unexpected parameter value format")),
                }
            }
            Some(RespType::Array) => {
                let declared = match lift(resp::read_array_size(&mut self.rdbuf))? {
                    None => return Ok(RecordStep::NeedMore),
                    Some(n) => n as usize,
                };
                if declared != ids.len() {
                    return Err(self.fatal("array size does not match the name list"));
                }
                let mut values = Vec::with_capacity(declared);
                for _ in 0..declared {
                    match resp::next_type(&self.rdbuf) {
                        None => return Ok(RecordStep::NeedMore),
                        Some(RespType::Integer) => {
                            match lift(resp::read_int(&mut self.rdbuf))? {
                                None => return Ok(RecordStep::NeedMore),
                                Some(v) => values.push(v as f64),
                            }
                        }
                        Some(RespType::String) => {
                            if lift(resp::read_string(&mut self.rdbuf, &mut self.scratch))?
                                .is_none()
                            {
                                return Ok(RecordStep::NeedMore);
                            }
                            match self.parse_float() {
                                Some(v) => values.push(v),
                                None => {
                                    return Err(
                                        self.fatal("unexpected parameter value format")
                                    )
                                }
                            }
                        }
                        Some(_) => {
                            return Err(self.fatal("unexpected parameter value format"))
                        }
                    }
                }
                values
            }
            Some(_) => return Err(self.fatal("unexpected parameter value format")),
        };
        if values.len() != ids.len() {
            return Err(self.fatal("value count does not match the name list"));
        }

        // The record is complete: commit the frame before emitting so a
        // database-side rejection cannot replay it.
        self.rdbuf.consume();
        for (id, value) in ids.iter().zip(values) {
            sink.write(Sample::new(*id, timestamp, value)).await?;
        }
        Ok(RecordStep::Done)
    }

    fn resolve_names<S: ProtocolSink>(
        &mut self,
        sink: &mut S,
    ) -> Result<Vec<SeriesId>, StorageError> {
        let raw = match std::str::from_utf8(&self.scratch) {
            Ok(raw) => raw,
            Err(_) => return Err(self.fatal("series name is not valid utf-8")),
        };
        let mut ids = Vec::new();
        let mut failure: Option<String> = None;
        for name in raw.split('|') {
            let name = name.trim();
            if name.is_empty() {
                failure = Some("empty series name in list".to_string());
                break;
            }
            match sink.resolve(name) {
                Ok(id) => ids.push(id),
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }
        match failure {
            Some(message) => Err(self.fatal(&message)),
            None => Ok(ids),
        }
    }

    fn parse_float(&self) -> Option<f64> {
        std::str::from_utf8(&self.scratch)
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
    }
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Line-oriented dialect:
/// `put <metric> <tag>=<value>... <ts_seconds> <value> [<tag>=<value>...]`.
/// Timestamps are seconds and scale to nanoseconds on emission.
pub struct LineParser {
    rdbuf: ReadBuffer,
}

impl LineParser {
    pub fn new() -> Self {
        Self {
            rdbuf: ReadBuffer::new(),
        }
    }

    pub fn buffer(&mut self) -> &mut ReadBuffer {
        &mut self.rdbuf
    }

    pub async fn parse_next<S: ProtocolSink>(
        &mut self,
        sink: &mut S,
    ) -> Result<(), StorageError> {
        enum Step {
            Partial,
            Overrun,
            Line(Vec<u8>),
        }
        loop {
            let step = match self.rdbuf.read_line(resp::STRING_LENGTH_MAX) {
                LineRead::Partial => Step::Partial,
                LineRead::Overrun => Step::Overrun,
                LineRead::Complete(bytes) => Step::Line(bytes.to_vec()),
            };
            match step {
                Step::Partial => {
                    self.rdbuf.discard();
                    return Ok(());
                }
                Step::Overrun => {
                    let (message, pos) = self.rdbuf.error_context("line is too long");
                    return Err(StorageError::ParseError { message, pos });
                }
                Step::Line(bytes) => {
                    self.rdbuf.consume();
                    self.handle_line(&bytes, sink).await?;
                }
            }
        }
    }

    async fn handle_line<S: ProtocolSink>(
        &mut self,
        line: &[u8],
        sink: &mut S,
    ) -> Result<(), StorageError> {
        let text = std::str::from_utf8(line)
            .map_err(|_| line_error("line is not valid utf-8", line))?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let mut tokens = trimmed.split_ascii_whitespace();
        match tokens.next() {
            Some("put") => {}
            _ => return Err(line_error("expected 'put'", line)),
        }
        let metric = tokens
            .next()
            .ok_or_else(|| line_error("missing metric name", line))?;

        let mut tags: Vec<&str> = Vec::new();
        let mut timestamp: Option<u64> = None;
        let mut value: Option<f64> = None;
        for token in tokens {
            if token.contains('=') {
                tags.push(token);
            } else if timestamp.is_none() {
                timestamp = Some(
                    token
                        .parse::<u64>()
                        .map_err(|_| line_error("can't parse timestamp", line))?,
                );
            } else if value.is_none() {
                value = Some(
                    token
                        .parse::<f64>()
                        .map_err(|_| line_error("can't parse value", line))?,
                );
            } else {
                return Err(line_error("trailing token", line));
            }
        }
        let seconds = timestamp.ok_or_else(|| line_error("missing timestamp", line))?;
        let value = value.ok_or_else(|| line_error("missing value", line))?;
        if tags.is_empty() {
            return Err(line_error("empty tag block", line));
        }

        let mut name = String::with_capacity(metric.len() + 16 * tags.len());
        name.push_str(metric);
        for tag in tags {
            name.push(' ');
            name.push_str(tag);
        }
        let id = sink
            .resolve(&name)
            .map_err(|e| line_error(&e.to_string(), line))?;

        let ns = seconds.saturating_mul(NS_PER_SECOND);
        debug!("put {name} ts={ns} value={value}");
        sink.write(Sample::new(id, ns, value)).await
    }
}

impl Default for LineParser {
    fn default() -> Self {
        Self::new()
    }
}

fn line_error(message: &str, line: &[u8]) -> StorageError {
    let mut excerpt = String::new();
    for &byte in line.iter().take(super::stream::MAX_LINE_CONTEXT) {
        match byte {
            b'\r' => excerpt.push_str("\\r"),
            b'\n' => excerpt.push_str("\\n"),
            other => excerpt.push(other as char),
        }
    }
    let rendered = format!("{message} - {excerpt}");
    let pos = message.len() + 3;
    StorageError::ParseError {
        message: rendered,
        pos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as StorageResult;
    use crate::storage::series::{SeriesRegistry, SeriesSession};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct TestSink {
        session: SeriesSession,
        out: Vec<Sample>,
        fail_with: Option<StorageError>,
    }

    impl TestSink {
        fn new() -> Self {
            Self {
                session: SeriesSession::new(Arc::new(SeriesRegistry::new())),
                out: Vec::new(),
                fail_with: None,
            }
        }
    }

    #[async_trait]
    impl ProtocolSink for TestSink {
        fn resolve(&mut self, name: &str) -> StorageResult<u64> {
            self.session.resolve(name)
        }

        async fn write(&mut self, sample: Sample) -> StorageResult<()> {
            if let Some(e) = self.fail_with.clone() {
                return Err(e);
            }
            self.out.push(sample);
            Ok(())
        }
    }

    fn feed(buf: &mut ReadBuffer, bytes: &[u8]) {
        let tail = buf.pull();
        tail[..bytes.len()].copy_from_slice(bytes);
        buf.push(bytes.len());
    }

    #[tokio::test]
    async fn single_triplet() {
        let mut parser = RespParser::new();
        let mut sink = TestSink::new();
        feed(parser.buffer(), b"+sensor host=a\r\n:1000\r\n+42.5\r\n");
        parser.parse_next(&mut sink).await.unwrap();
        assert_eq!(sink.out, vec![Sample::new(1024, 1000, 42.5)]);
    }

    #[tokio::test]
    async fn bulk_fan_out() {
        let mut parser = RespParser::new();
        let mut sink = TestSink::new();
        feed(parser.buffer(), b"+m h=a|m h=b\r\n:500\r\n*2\r\n+1.0\r\n+2.0\r\n");
        parser.parse_next(&mut sink).await.unwrap();
        assert_eq!(sink.out.len(), 2);
        assert_eq!(sink.out[0], Sample::new(1024, 500, 1.0));
        assert_eq!(sink.out[1], Sample::new(1025, 500, 2.0));
    }

    #[tokio::test]
    async fn fragmentation_is_transparent() {
        let payload = b"+sensor host=a\r\n:1000\r\n+42.5\r\n";
        for split in 1..payload.len() {
            let mut parser = RespParser::new();
            let mut sink = TestSink::new();
            feed(parser.buffer(), &payload[..split]);
            parser.parse_next(&mut sink).await.unwrap();
            feed(parser.buffer(), &payload[split..]);
            parser.parse_next(&mut sink).await.unwrap();
            assert_eq!(
                sink.out,
                vec![Sample::new(1024, 1000, 42.5)],
                "split at byte {split}"
            );
        }
    }

    #[tokio::test]
    async fn several_records_in_one_buffer() {
        let mut parser = RespParser::new();
        let mut sink = TestSink::new();
        feed(
            parser.buffer(),
            b"+cpu host=a\r\n:1\r\n:10\r\n+cpu host=a\r\n:2\r\n+0.5\r\n",
        );
        parser.parse_next(&mut sink).await.unwrap();
        assert_eq!(sink.out.len(), 2);
        assert_eq!(sink.out[0].value, 10.0);
        assert_eq!(sink.out[1].value, 0.5);
    }

    #[tokio::test]
    async fn bulk_name_via_bulk_string() {
        let mut parser = RespParser::new();
        let mut sink = TestSink::new();
        feed(parser.buffer(), b"$13\r\nsensor host=a\r\n:7\r\n:3\r\n");
        parser.parse_next(&mut sink).await.unwrap();
        assert_eq!(sink.out, vec![Sample::new(1024, 7, 3.0)]);
    }

    #[tokio::test]
    async fn error_item_is_fatal() {
        let mut parser = RespParser::new();
        let mut sink = TestSink::new();
        feed(parser.buffer(), b"-rejected\r\n");
        let err = parser.parse_next(&mut sink).await.unwrap_err();
        assert!(matches!(err, StorageError::ParseError { .. }));
    }

    #[tokio::test]
    async fn malformed_series_name_is_fatal() {
        let mut parser = RespParser::new();
        let mut sink = TestSink::new();
        feed(parser.buffer(), b"+metric_without_tags\r\n:1\r\n:1\r\n");
        let err = parser.parse_next(&mut sink).await.unwrap_err();
        match err {
            StorageError::ParseError { message, .. } => {
                assert!(message.contains("tag"), "unexpected message: {message}")
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn array_size_mismatch_is_fatal() {
        let mut parser = RespParser::new();
        let mut sink = TestSink::new();
        feed(parser.buffer(), b"+m h=a|m h=b\r\n:1\r\n*3\r\n");
        let err = parser.parse_next(&mut sink).await.unwrap_err();
        assert!(matches!(err, StorageError::ParseError { .. }));
    }

    #[tokio::test]
    async fn db_rejection_does_not_replay_the_record() {
        let mut parser = RespParser::new();
        let mut sink = TestSink::new();
        sink.fail_with = Some(StorageError::LateWrite);
        feed(parser.buffer(), b"+cpu host=a\r\n:1\r\n:1\r\n");
        let err = parser.parse_next(&mut sink).await.unwrap_err();
        assert_eq!(err, StorageError::LateWrite);
        // The frame was committed; the next pass finds nothing to redo.
        sink.fail_with = None;
        parser.parse_next(&mut sink).await.unwrap();
        assert!(sink.out.is_empty());
    }

    #[tokio::test]
    async fn put_line_scales_seconds() {
        let mut parser = LineParser::new();
        let mut sink = TestSink::new();
        feed(parser.buffer(), b"put cpu region=eu 1700000000 0.75\n");
        parser.parse_next(&mut sink).await.unwrap();
        assert_eq!(
            sink.out,
            vec![Sample::new(1024, 1_700_000_000_000_000_000, 0.75)]
        );
    }

    #[tokio::test]
    async fn put_line_collects_trailing_tags() {
        let mut parser = LineParser::new();
        let mut sink = TestSink::new();
        feed(
            parser.buffer(),
            b"put cpu  host=a   1700000000  0.5 dc=eu\n",
        );
        parser.parse_next(&mut sink).await.unwrap();
        assert_eq!(sink.out.len(), 1);
        let name = sink.session.resolve("cpu dc=eu host=a").unwrap();
        assert_eq!(sink.out[0].series_id, name);
    }

    #[tokio::test]
    async fn put_line_requires_tags() {
        let mut parser = LineParser::new();
        let mut sink = TestSink::new();
        feed(parser.buffer(), b"put cpu 1700000000 0.75\n");
        let err = parser.parse_next(&mut sink).await.unwrap_err();
        match err {
            StorageError::ParseError { message, .. } => {
                assert!(message.contains("empty tag block"))
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_line_fragmentation() {
        let payload = b"put cpu region=eu 1700000000 0.75\n";
        for split in 1..payload.len() {
            let mut parser = LineParser::new();
            let mut sink = TestSink::new();
            feed(parser.buffer(), &payload[..split]);
            parser.parse_next(&mut sink).await.unwrap();
            feed(parser.buffer(), &payload[split..]);
            parser.parse_next(&mut sink).await.unwrap();
            assert_eq!(sink.out.len(), 1, "split at byte {split}");
        }
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let mut parser = LineParser::new();
        let mut sink = TestSink::new();
        feed(
            parser.buffer(),
            b"\nput cpu host=a 100 1.0\n\r\nput cpu host=a 101 2.0\n",
        );
        parser.parse_next(&mut sink).await.unwrap();
        assert_eq!(sink.out.len(), 2);
    }
}
