use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::info;

/// Remote link state as last observed by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Debug)]
struct LinkState {
    connection: ConnectionStatus,
    last_error: Option<String>,
    last_sent: Option<DateTime<Utc>>,
}

/// Shipping counters shared between the hub-facing intake and the delivery worker.
///
/// Cheap to clone; all clones observe the same counters. Counters are atomics,
/// the link state sits behind one lock so `connection_status` and
/// `last_error` always change together.
#[derive(Clone)]
pub struct DiagnosticCounters {
    /// Events accepted by the remote endpoint (lifetime counter)
    events_sent: Arc<AtomicU64>,

    /// Events discarded: failed deliveries and intake after teardown
    events_dropped: Arc<AtomicU64>,

    /// Events buffered or awaiting delivery right now
    events_queued: Arc<AtomicU64>,

    link: Arc<RwLock<LinkState>>,
}

impl DiagnosticCounters {
    pub fn new() -> Self {
        Self {
            events_sent: Arc::new(AtomicU64::new(0)),
            events_dropped: Arc::new(AtomicU64::new(0)),
            events_queued: Arc::new(AtomicU64::new(0)),
            link: Arc::new(RwLock::new(LinkState {
                connection: ConnectionStatus::Disconnected,
                last_error: None,
                last_sent: None,
            })),
        }
    }

    /// Events entered the active batch.
    pub fn record_enqueued(&self, count: u64) {
        self.events_queued.fetch_add(count, Ordering::Relaxed);
    }

    /// Events left the queue after delivery accounting (sent or dropped).
    pub fn record_dequeued(&self, count: u64) {
        // Saturate instead of wrapping if accounting ever double-counts
        let _ = self
            .events_queued
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |queued| {
                Some(queued.saturating_sub(count))
            });
    }

    /// A batch was accepted: link is up and the last error is cleared.
    pub fn record_sent(&self, count: u64) {
        self.events_sent.fetch_add(count, Ordering::Relaxed);

        let mut link = self.link_write();
        link.connection = ConnectionStatus::Connected;
        link.last_error = None;
        link.last_sent = Some(Utc::now());
    }

    /// Events were discarded. `disconnect` flips the link to disconnected.
    pub fn record_dropped(&self, count: u64, error: impl Into<String>, disconnect: bool) {
        self.events_dropped.fetch_add(count, Ordering::Relaxed);

        let mut link = self.link_write();
        link.last_error = Some(error.into());
        if disconnect {
            link.connection = ConnectionStatus::Disconnected;
        }
    }

    /// A single attempt failed but the batch is still being retried.
    pub fn record_error(&self, error: impl Into<String>) {
        self.link_write().last_error = Some(error.into());
    }

    pub fn mark_connected(&self) {
        self.link_write().connection = ConnectionStatus::Connected;
    }

    pub fn mark_disconnected(&self, error: impl Into<String>) {
        let mut link = self.link_write();
        link.connection = ConnectionStatus::Disconnected;
        link.last_error = Some(error.into());
    }

    pub fn events_sent(&self) -> u64 {
        self.events_sent.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    pub fn events_queued(&self) -> u64 {
        self.events_queued.load(Ordering::Relaxed)
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.link_read().connection
    }

    pub fn last_error(&self) -> Option<String> {
        self.link_read().last_error.clone()
    }

    pub fn last_sent(&self) -> Option<DateTime<Utc>> {
        self.link_read().last_sent
    }

    /// Point-in-time copy for display.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let link = self.link_read();
        DiagnosticsSnapshot {
            events_sent: self.events_sent(),
            events_dropped: self.events_dropped(),
            events_queued: self.events_queued(),
            connection_status: link.connection,
            last_error: link.last_error.clone(),
            last_sent: link.last_sent,
        }
    }

    fn link_read(&self) -> RwLockReadGuard<'_, LinkState> {
        self.link.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn link_write(&self) -> RwLockWriteGuard<'_, LinkState> {
        self.link.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for DiagnosticCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the diagnostic counters at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub events_sent: u64,
    pub events_dropped: u64,
    pub events_queued: u64,
    pub connection_status: ConnectionStatus,
    pub last_error: Option<String>,
    pub last_sent: Option<DateTime<Utc>>,
}

/// Periodically log a diagnostics snapshot.
///
/// Runs until the task is aborted.
pub async fn run_diagnostics_reporter(counters: DiagnosticCounters, period: Duration) {
    let period = period.max(Duration::from_secs(1));
    let mut ticker = interval_at(Instant::now() + period, period);

    // Skip missed ticks to prevent a burst of reports after a stall
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        let snapshot = counters.snapshot();
        info!(
            events_sent = snapshot.events_sent,
            events_dropped = snapshot.events_dropped,
            events_queued = snapshot.events_queued,
            connection_status = ?snapshot.connection_status,
            last_error = snapshot.last_error.as_deref().unwrap_or(""),
            "Shipping diagnostics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_initial_state() {
        let counters = DiagnosticCounters::new();
        let snapshot = counters.snapshot();

        assert_eq!(snapshot.events_sent, 0);
        assert_eq!(snapshot.events_dropped, 0);
        assert_eq!(snapshot.events_queued, 0);
        assert_eq!(snapshot.connection_status, ConnectionStatus::Disconnected);
        assert!(snapshot.last_error.is_none());
        assert!(snapshot.last_sent.is_none());
    }

    #[test]
    fn test_sent_clears_error_and_connects() {
        let counters = DiagnosticCounters::new();
        counters.record_error("HTTP 503: busy");
        assert_eq!(counters.last_error().as_deref(), Some("HTTP 503: busy"));

        counters.record_sent(10);

        assert_eq!(counters.events_sent(), 10);
        assert_eq!(counters.connection_status(), ConnectionStatus::Connected);
        assert!(counters.last_error().is_none());
        assert!(counters.last_sent().is_some());
    }

    #[test]
    fn test_dropped_with_and_without_disconnect() {
        let counters = DiagnosticCounters::new();
        counters.mark_connected();

        counters.record_dropped(3, "HTTP 401: unauthorized", false);
        assert_eq!(counters.events_dropped(), 3);
        assert_eq!(counters.connection_status(), ConnectionStatus::Connected);
        assert_eq!(counters.last_error().as_deref(), Some("HTTP 401: unauthorized"));

        counters.record_dropped(2, "timed out", true);
        assert_eq!(counters.events_dropped(), 5);
        assert_eq!(counters.connection_status(), ConnectionStatus::Disconnected);
        assert_eq!(counters.last_error().as_deref(), Some("timed out"));
    }

    #[test]
    fn test_queue_depth_saturates() {
        let counters = DiagnosticCounters::new();
        counters.record_enqueued(2);
        counters.record_dequeued(5);
        assert_eq!(counters.events_queued(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let counters = DiagnosticCounters::new();
        let other = counters.clone();

        other.record_enqueued(4);
        other.mark_disconnected("connection refused");

        assert_eq!(counters.events_queued(), 4);
        assert_eq!(counters.last_error().as_deref(), Some("connection refused"));
    }

    #[test]
    fn test_snapshot_serializes_lowercase_status() {
        let counters = DiagnosticCounters::new();
        counters.mark_connected();
        let value = serde_json::to_value(counters.snapshot()).unwrap();
        assert_eq!(value["connection_status"], "connected");
        assert_eq!(value["last_error"], serde_json::Value::Null);
    }

    #[test]
    fn test_concurrent_access() {
        let counters = DiagnosticCounters::new();
        let mut handles = vec![];

        // Half the threads enqueue, half account deliveries
        for i in 0..10 {
            let c = counters.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    if i % 2 == 0 {
                        c.record_enqueued(1);
                        c.record_sent(1);
                    } else {
                        c.record_enqueued(1);
                        c.record_dropped(1, format!("worker {}", i), true);
                    }
                    c.record_dequeued(1);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counters.events_sent(), 500);
        assert_eq!(counters.events_dropped(), 500);
        assert_eq!(counters.events_queued(), 0);
    }
}
