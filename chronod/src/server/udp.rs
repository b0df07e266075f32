//! UDP ingress: a fixed set of worker tasks sharing one port through
//! `SO_REUSEPORT`.
//!
//! Each worker owns its socket, a reusable receive buffer and a spout.
//! A fresh parser is created per datagram so a malformed packet cannot
//! poison the ones that follow. There are no replies; failures are
//! counted and logged.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use bytes::BytesMut;
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use super::SessionSink;
use crate::error::StorageError;
use crate::pipeline::IngestionPipeline;
use crate::protocol::parser::RespParser;
use crate::storage::DbHandle;

/// Largest datagram group a worker accepts in one receive.
const RECV_BUFFER_SIZE: usize = 64 * 1024;

/// Bind a UDP socket with port reuse so every worker can own one.
pub fn bind_reuseport(port: u16) -> anyhow::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .context("creating UDP socket")?;
    socket
        .set_reuse_port(true)
        .context("setting SO_REUSEPORT")?;
    socket
        .set_nonblocking(true)
        .context("setting non-blocking mode")?;
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    socket
        .bind(&addr.into())
        .with_context(|| format!("binding UDP port {port}"))?;
    UdpSocket::from_std(socket.into()).context("registering UDP socket")
}

/// Receive loop of one worker.
pub async fn run_udp_worker(
    worker_id: usize,
    socket: UdpSocket,
    pipeline: Arc<IngestionPipeline>,
    db: DbHandle,
) {
    info!("UDP worker {worker_id} started");
    let metrics = db.metrics().clone();
    let mut sink = SessionSink::new(&db, &pipeline);
    let mut scratch = BytesMut::zeroed(RECV_BUFFER_SIZE);

    loop {
        let (nread, peer) = match socket.recv_from(&mut scratch).await {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP worker {worker_id} receive error: {e}");
                continue;
            }
        };
        metrics.inc_udp_packet();
        metrics.add_bytes(nread as u64);

        // One parser per datagram group: framing state never leaks from
        // one packet into the next.
        let mut parser = RespParser::new();
        let mut fed = 0;
        while fed < nread {
            let tail = parser.buffer().pull();
            let step = tail.len().min(nread - fed);
            tail[..step].copy_from_slice(&scratch[fed..fed + step]);
            parser.buffer().push(step);
            fed += step;
        }

        match parser.parse_next(&mut sink).await {
            Ok(()) => {}
            Err(StorageError::ParseError { message, .. }) => {
                metrics.inc_parser_error();
                debug!("UDP worker {worker_id}: bad datagram from {peer}: {message}");
            }
            Err(db_error) => {
                metrics.inc_db_error();
                debug!("UDP worker {worker_id}: database error: {db_error}");
            }
        }
    }
}
