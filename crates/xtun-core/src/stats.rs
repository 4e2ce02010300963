//! Statistics Aggregator
//!
//! Lock-free traffic counters fed by the packet relay, rate sampling for
//! the status surfaces and the history of finished sessions.

use crate::session::{SessionHistory, SessionRecord, TunnelSession};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Minimum interval between two rate computations
pub const RATE_INTERVAL: Duration = Duration::from_secs(1);

/// Point-in-time view of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    /// Bytes per second
    pub upload_rate: f64,
    /// Bytes per second
    pub download_rate: f64,
    /// Milliseconds, `None` until measured
    pub server_latency: Option<u64>,
}

#[derive(Debug)]
struct RateSample {
    at: Instant,
    bytes_received: u64,
    bytes_sent: u64,
    upload_rate: f64,
    download_rate: f64,
}

impl RateSample {
    fn zero() -> Self {
        Self {
            at: Instant::now(),
            bytes_received: 0,
            bytes_sent: 0,
            upload_rate: 0.0,
            download_rate: 0.0,
        }
    }
}

/// Traffic statistics for the running tunnel.
pub struct StatisticsAggregator {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_sent: AtomicU64,
    latency_ms: AtomicI64,
    sample: Mutex<RateSample>,
    history: Mutex<SessionHistory>,
    updates: broadcast::Sender<StatisticsSnapshot>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(16);
        Self {
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            latency_ms: AtomicI64::new(-1),
            sample: Mutex::new(RateSample::zero()),
            history: Mutex::new(SessionHistory::new()),
            updates,
        }
    }

    /// Start from an existing history (loaded from storage).
    pub fn with_history(history: SessionHistory) -> Self {
        let stats = Self::new();
        *lock(&stats.history) = history;
        stats
    }

    /// Count packets handed to the engine.
    pub fn record_sent(&self, packets: u64, bytes: u64) {
        self.packets_sent.fetch_add(packets, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Count packets written back to the tunnel interface.
    pub fn record_received(&self, packets: u64, bytes: u64) {
        self.packets_received.fetch_add(packets, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Record the measured round trip to the server.
    pub fn set_latency(&self, latency: Option<Duration>) {
        let ms = latency.map_or(-1, |d| d.as_millis().min(i64::MAX as u128) as i64);
        self.latency_ms.store(ms, Ordering::Relaxed);
    }

    pub fn latency(&self) -> Option<u64> {
        u64::try_from(self.latency_ms.load(Ordering::Relaxed)).ok()
    }

    /// Current counters and rates.
    ///
    /// Rates are recomputed at most once per [`RATE_INTERVAL`]; calls in
    /// between return the previous rates. Every snapshot is published to
    /// subscribers.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        let bytes_received = self.bytes_received();
        let bytes_sent = self.bytes_sent();

        let (upload_rate, download_rate) = {
            let mut sample = lock(&self.sample);
            let elapsed = sample.at.elapsed();
            if elapsed >= RATE_INTERVAL {
                let secs = elapsed.as_secs_f64();
                sample.upload_rate = bytes_sent.saturating_sub(sample.bytes_sent) as f64 / secs;
                sample.download_rate =
                    bytes_received.saturating_sub(sample.bytes_received) as f64 / secs;
                sample.bytes_sent = bytes_sent;
                sample.bytes_received = bytes_received;
                sample.at = Instant::now();
            }
            (sample.upload_rate, sample.download_rate)
        };

        let snapshot = StatisticsSnapshot {
            bytes_received,
            bytes_sent,
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            upload_rate,
            download_rate,
            server_latency: self.latency(),
        };

        // No subscribers is fine
        let _ = self.updates.send(snapshot);
        snapshot
    }

    /// Zero every counter for a new session.
    pub fn reset(&self) {
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.latency_ms.store(-1, Ordering::Relaxed);
        *lock(&self.sample) = RateSample::zero();
    }

    /// Close a session: build its record and append it to history.
    pub fn finalize(&self, session: &TunnelSession) -> SessionRecord {
        let record = SessionRecord::finish(session, self.bytes_received(), self.bytes_sent());
        lock(&self.history).push(record.clone());
        record
    }

    /// Copy of the session history.
    pub fn history(&self) -> SessionHistory {
        lock(&self.history).clone()
    }

    /// Receive every published snapshot.
    pub fn subscribe(&self) -> broadcast::Receiver<StatisticsSnapshot> {
        self.updates.subscribe()
    }
}

impl Default for StatisticsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
