//! TCP and UDP ingress.

pub mod tcp;
pub mod udp;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ServerConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::pipeline::{IngestionPipeline, Spout};
use crate::protocol::ProtocolSink;
use crate::storage::series::SeriesSession;
use crate::storage::DbHandle;
use crate::types::{Sample, SeriesId};

/// Sink wired to one connection: its series cache and its spout.
pub struct SessionSink {
    series: SeriesSession,
    spout: Spout,
    metrics: Arc<Metrics>,
}

impl SessionSink {
    pub fn new(db: &DbHandle, pipeline: &IngestionPipeline) -> Self {
        Self {
            series: db.open_session(),
            spout: pipeline.make_spout(),
            metrics: db.metrics().clone(),
        }
    }

    pub fn spout(&self) -> &Spout {
        &self.spout
    }
}

#[async_trait]
impl ProtocolSink for SessionSink {
    fn resolve(&mut self, name: &str) -> Result<SeriesId> {
        self.series.resolve(name)
    }

    async fn write(&mut self, sample: Sample) -> Result<()> {
        self.metrics.record_sample();
        self.spout.write(sample).await
    }
}

/// Bind and launch every ingress task: the RESP TCP listener, the line
/// protocol TCP listener and the UDP workers. Returns their handles so
/// the caller can abort them at shutdown.
pub async fn start_servers(
    config: &ServerConfig,
    pipeline: Arc<IngestionPipeline>,
    db: DbHandle,
) -> anyhow::Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();

    let resp_listener = TcpListener::bind(("0.0.0.0", config.tcp_port))
        .await
        .with_context(|| format!("binding TCP port {}", config.tcp_port))?;
    handles.push(tokio::spawn(tcp::serve_listener(
        resp_listener,
        tcp::Dialect::Resp,
        pipeline.clone(),
        db.clone(),
    )));

    let line_listener = TcpListener::bind(("0.0.0.0", config.line_port))
        .await
        .with_context(|| format!("binding TCP port {}", config.line_port))?;
    handles.push(tokio::spawn(tcp::serve_listener(
        line_listener,
        tcp::Dialect::Line,
        pipeline.clone(),
        db.clone(),
    )));

    for worker_id in 0..config.nworkers.max(1) {
        let socket = udp::bind_reuseport(config.udp_port)?;
        handles.push(tokio::spawn(udp::run_udp_worker(
            worker_id,
            socket,
            pipeline.clone(),
            db.clone(),
        )));
    }

    Ok(handles)
}
