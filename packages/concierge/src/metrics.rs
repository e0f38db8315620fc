//! Server metrics for observability
//!
//! Counters are fed from each finished turn's report.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use turn_relay::{TurnOutcome, TurnReport};

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Turn metrics
    /// Turns currently streaming
    pub active_turns: AtomicU64,
    pub turns_started: AtomicU64,
    pub turns_completed: AtomicU64,
    /// Client went away or the turn was cancelled
    pub turns_cancelled: AtomicU64,
    /// Ended with the apology frame
    pub turns_failed: AtomicU64,

    // Stream metrics
    pub frames: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub abandoned_reassemblies: AtomicU64,

    // Marker metrics
    pub markers_completed: AtomicU64,
    /// Unterminated or oversized
    pub markers_dropped: AtomicU64,
    pub dispatch_applied: AtomicU64,
    pub dispatch_rejected: AtomicU64,
    pub dispatch_failed: AtomicU64,
    /// Queued markers discarded by cancellation
    pub dispatch_dropped: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn turn_started(&self) {
        self.active_turns.fetch_add(1, Ordering::Relaxed);
        self.turns_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Fold a finished turn into the counters.
    pub fn turn_finished(&self, report: &TurnReport) {
        self.active_turns.fetch_sub(1, Ordering::Relaxed);
        let outcome = match report.outcome {
            TurnOutcome::Completed => &self.turns_completed,
            TurnOutcome::Cancelled => &self.turns_cancelled,
            TurnOutcome::Failed => &self.turns_failed,
        };
        outcome.fetch_add(1, Ordering::Relaxed);

        let relay = &report.relay;
        self.frames.fetch_add(relay.frames, Ordering::Relaxed);
        self.malformed_frames
            .fetch_add(relay.malformed_frames, Ordering::Relaxed);
        self.abandoned_reassemblies
            .fetch_add(relay.abandoned_reassemblies, Ordering::Relaxed);
        self.markers_completed
            .fetch_add(relay.markers_completed, Ordering::Relaxed);
        self.markers_dropped
            .fetch_add(relay.markers_dropped, Ordering::Relaxed);

        let dispatch = &report.dispatch;
        self.dispatch_applied
            .fetch_add(dispatch.applied(), Ordering::Relaxed);
        self.dispatch_rejected
            .fetch_add(dispatch.rejected(), Ordering::Relaxed);
        self.dispatch_failed
            .fetch_add(dispatch.failed(), Ordering::Relaxed);
        self.dispatch_dropped
            .fetch_add(dispatch.dropped_on_cancel, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            turns: TurnMetrics {
                active: self.active_turns.load(Ordering::Relaxed),
                started: self.turns_started.load(Ordering::Relaxed),
                completed: self.turns_completed.load(Ordering::Relaxed),
                cancelled: self.turns_cancelled.load(Ordering::Relaxed),
                failed: self.turns_failed.load(Ordering::Relaxed),
            },
            stream: StreamMetrics {
                frames: self.frames.load(Ordering::Relaxed),
                malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
                abandoned_reassemblies: self.abandoned_reassemblies.load(Ordering::Relaxed),
            },
            markers: MarkerMetrics {
                completed: self.markers_completed.load(Ordering::Relaxed),
                dropped: self.markers_dropped.load(Ordering::Relaxed),
                applied: self.dispatch_applied.load(Ordering::Relaxed),
                rejected: self.dispatch_rejected.load(Ordering::Relaxed),
                failed: self.dispatch_failed.load(Ordering::Relaxed),
                dropped_on_cancel: self.dispatch_dropped.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub turns: TurnMetrics,
    pub stream: StreamMetrics,
    pub markers: MarkerMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub active: u64,
    pub started: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMetrics {
    pub frames: u64,
    pub malformed_frames: u64,
    pub abandoned_reassemblies: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkerMetrics {
    pub completed: u64,
    pub dropped: u64,
    pub applied: u64,
    pub rejected: u64,
    pub failed: u64,
    pub dropped_on_cancel: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub active_turns: u64,
    pub sessions: u64,
    pub open_conflict_cases: u64,
    pub uptime_secs: u64,
}
