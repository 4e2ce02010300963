//! Tunnel sessions and their history.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use uuid::Uuid;

/// Number of finished sessions kept in history
pub const HISTORY_CAPACITY: usize = 100;

/// One Connected period
#[derive(Debug, Clone)]
pub struct TunnelSession {
    pub id: Uuid,
    pub server_name: String,
    started_at: Instant,
    started_wall: SystemTime,
}

impl TunnelSession {
    pub fn begin(server_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            server_name: server_name.into(),
            started_at: Instant::now(),
            started_wall: SystemTime::now(),
        }
    }

    /// Time since the session began.
    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Wall-clock start time
    pub fn started_wall(&self) -> SystemTime {
        self.started_wall
    }
}

/// A finished session as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: Uuid,
    pub server_name: String,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    /// Seconds
    pub duration: f64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl SessionRecord {
    /// Close a session with its final counters.
    pub fn finish(session: &TunnelSession, bytes_received: u64, bytes_sent: u64) -> Self {
        let duration = session.elapsed();
        Self {
            id: session.id,
            server_name: session.server_name.clone(),
            start_time: session.started_wall,
            end_time: session.started_wall + duration,
            duration: duration.as_secs_f64(),
            bytes_received,
            bytes_sent,
        }
    }
}

/// Bounded history, newest last.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct SessionHistory {
    records: VecDeque<SessionRecord>,
}

/// Stored lists go through `push`, so an oversized list keeps only its newest entries.
impl<'de> Deserialize<'de> for SessionHistory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let records = Vec::<SessionRecord>::deserialize(deserializer)?;
        let mut history = SessionHistory::new();
        for record in records {
            history.push(record);
        }
        Ok(history)
    }
}

impl SessionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record, dropping the oldest once full.
    pub fn push(&mut self, record: SessionRecord) {
        while self.records.len() >= HISTORY_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn latest(&self) -> Option<&SessionRecord> {
        self.records.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionRecord> {
        self.records.iter()
    }

    /// Total bytes across all recorded sessions, as (received, sent).
    pub fn totals(&self) -> (u64, u64) {
        self.records.iter().fold((0, 0), |(rx, tx), r| {
            (rx.saturating_add(r.bytes_received), tx.saturating_add(r.bytes_sent))
        })
    }
}
