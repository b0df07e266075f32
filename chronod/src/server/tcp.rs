//! TCP ingress: an acceptor task per listener, one session task per
//! connection.
//!
//! A session owns a socket, a parser and a spout. Parse failures are
//! answered with `-PARSER <message>` plus a caret line, then the
//! connection closes. Database errors surface asynchronously through
//! the spout's error callback and are written back as `-DB <message>`
//! without closing the connection. Successful streams receive no reply.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use super::SessionSink;
use crate::error::StorageError;
use crate::pipeline::IngestionPipeline;
use crate::protocol::parser::{LineParser, RespParser};
use crate::storage::DbHandle;

/// Which dialect a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Resp,
    Line,
}

/// Accept connections forever, spawning one session task each.
pub async fn serve_listener(
    listener: TcpListener,
    dialect: Dialect,
    pipeline: Arc<IngestionPipeline>,
    db: DbHandle,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {addr} ({dialect:?} dialect)");
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!("accepted {peer}");
                let pipeline = pipeline.clone();
                let db = db.clone();
                tokio::spawn(async move {
                    db.metrics().session_opened();
                    run_session(stream, dialect, &pipeline, &db).await;
                    db.metrics().session_closed();
                    debug!("session {peer} finished");
                });
            }
            Err(e) => {
                error!("accept error: {e}");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

async fn write_reply(writer: &mut OwnedWriteHalf, reply: &str) {
    if let Err(e) = writer.write_all(reply.as_bytes()).await {
        warn!("error sending error reply to client: {e}");
    }
}

async fn run_session(
    stream: TcpStream,
    dialect: Dialect,
    pipeline: &IngestionPipeline,
    db: &DbHandle,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut sink = SessionSink::new(db, pipeline);

    // Database errors travel from the writer thread to this channel and
    // are answered on the connection's write half.
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<StorageError>();
    sink.spout().set_error_cb(Arc::new(move |error, _sequence| {
        let _ = err_tx.send(error);
    }));

    let mut resp_parser = (dialect == Dialect::Resp).then(RespParser::new);
    let mut line_parser = (dialect == Dialect::Line).then(LineParser::new);
    let metrics = db.metrics().clone();

    loop {
        // Forward any pending database errors before blocking on reads.
        while let Ok(db_error) = err_rx.try_recv() {
            metrics.inc_db_error();
            write_reply(&mut writer, &format!("-DB {db_error}\r\n")).await;
        }

        let buffer = match (&mut resp_parser, &mut line_parser) {
            (Some(p), _) => p.buffer(),
            (_, Some(p)) => p.buffer(),
            _ => unreachable!("one parser per dialect"),
        };
        let tail = buffer.pull();
        let nread = match reader.read(tail).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!("socket read error: {e}");
                break;
            }
        };
        buffer.push(nread);
        metrics.add_bytes(nread as u64);

        let outcome = match (&mut resp_parser, &mut line_parser) {
            (Some(p), _) => p.parse_next(&mut sink).await,
            (_, Some(p)) => p.parse_next(&mut sink).await,
            _ => unreachable!("one parser per dialect"),
        };
        match outcome {
            Ok(()) => {}
            Err(StorageError::ParseError { message, pos }) => {
                metrics.inc_parser_error();
                warn!("protocol error: {message}");
                let mut caret = " ".repeat(pos);
                caret.push('^');
                let reply = format!("-PARSER {message}\r\n-PARSER {caret}\r\n");
                write_reply(&mut writer, &reply).await;
                break;
            }
            Err(StorageError::Closed) => break,
            Err(db_error) => {
                metrics.inc_db_error();
                write_reply(&mut writer, &format!("-DB {db_error}\r\n")).await;
            }
        }
    }
}
