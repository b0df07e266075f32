use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::SystemTime;

/// Global counters for the daemon.
///
/// Counters are updated from the hot path so all fields are atomic.
pub struct Metrics {
    pub samples_received: AtomicU64,
    pub samples_written: AtomicU64,
    pub samples_dropped: AtomicU64,
    pub late_writes: AtomicU64,
    pub parser_errors: AtomicU64,
    pub db_errors: AtomicU64,
    pub bytes_ingested: AtomicU64,
    pub udp_packets: AtomicU64,
    pub chunks_written: AtomicU64,
    pub volume_rotations: AtomicU64,
    pub sessions_active: AtomicUsize,
    pub start_time: SystemTime,
    // Per-second tracking
    samples_this_sec: AtomicU64,
    samples_per_sec: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            samples_received: AtomicU64::new(0),
            samples_written: AtomicU64::new(0),
            samples_dropped: AtomicU64::new(0),
            late_writes: AtomicU64::new(0),
            parser_errors: AtomicU64::new(0),
            db_errors: AtomicU64::new(0),
            bytes_ingested: AtomicU64::new(0),
            udp_packets: AtomicU64::new(0),
            chunks_written: AtomicU64::new(0),
            volume_rotations: AtomicU64::new(0),
            sessions_active: AtomicUsize::new(0),
            start_time: SystemTime::now(),
            samples_this_sec: AtomicU64::new(0),
            samples_per_sec: AtomicU64::new(0),
        }
    }

    pub fn record_sample(&self) {
        self.samples_received.fetch_add(1, Ordering::Relaxed);
        self.samples_this_sec.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, nbytes: u64) {
        self.bytes_ingested.fetch_add(nbytes, Ordering::Relaxed);
    }

    pub fn inc_written(&self) {
        self.samples_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_dropped(&self) {
        self.samples_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_late_write(&self) {
        self.late_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_parser_error(&self) {
        self.parser_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_db_error(&self) {
        self.db_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_udp_packet(&self) {
        self.udp_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_chunk(&self) {
        self.chunks_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rotation(&self) {
        self.volume_rotations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_opened(&self) {
        self.sessions_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Called once per second to refresh the samples-per-second metric.
    pub fn rollup(&self) {
        let per_sec = self.samples_this_sec.swap(0, Ordering::Relaxed);
        self.samples_per_sec.store(per_sec, Ordering::Relaxed);
    }

    pub fn samples_per_sec(&self) -> u64 {
        self.samples_per_sec.load(Ordering::Relaxed)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().map(|d| d.as_secs()).unwrap_or(0)
    }

    /// One-line summary for the periodic stats log.
    pub fn summary(&self) -> String {
        format!(
            "rate={}/s received={} written={} late={} dropped={} chunks={} rotations={} sessions={} parser_errors={} db_errors={}",
            self.samples_per_sec(),
            self.samples_received.load(Ordering::Relaxed),
            self.samples_written.load(Ordering::Relaxed),
            self.late_writes.load(Ordering::Relaxed),
            self.samples_dropped.load(Ordering::Relaxed),
            self.chunks_written.load(Ordering::Relaxed),
            self.volume_rotations.load(Ordering::Relaxed),
            self.sessions_active.load(Ordering::Relaxed),
            self.parser_errors.load(Ordering::Relaxed),
            self.db_errors.load(Ordering::Relaxed),
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
