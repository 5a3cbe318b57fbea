//! Size/time bounded batching in front of a single delivery slot.
//!
//! Intake (`enqueue`) is synchronous and never waits on the network: it
//! appends to the active batch under a short std mutex and, once the batch
//! is full, swaps it out onto an unbounded FIFO. One background worker owns
//! the interval timer and the delivery path, so at most one batch is being
//! delivered at any time and batches leave in creation order.

use crate::diagnostics::DiagnosticCounters;
use crate::event::StateChangeEvent;
use crate::ingest::{BatchSink, Outcome};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};


/// Shortest timer period; a zero interval degenerates to this.
pub const MIN_TICK: Duration = Duration::from_millis(10);

/// Batching limits
#[derive(Debug, Clone, PartialEq)]
pub struct BatchConfig {
    /// Flush as soon as the active batch holds this many events
    pub batch_size: usize,
    /// Timer period for time-triggered flushes
    pub batch_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval: Duration::from_secs(5),
        }
    }
}

/// Ordered events accumulated between two flushes.
#[derive(Debug)]
pub struct Batch {
    sequence: u64,
    events: Vec<StateChangeEvent>,
    started_at: Option<Instant>,
}

impl Batch {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence,
            events: Vec::new(),
            started_at: None,
        }
    }

    /// Build a batch from events already in admission order.
    pub fn from_events(sequence: u64, events: Vec<StateChangeEvent>) -> Self {
        let started_at = if events.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        Self {
            sequence,
            events,
            started_at,
        }
    }

    pub fn push(&mut self, event: StateChangeEvent) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
        self.events.push(event);
    }

    /// Creation order; strictly increasing across flushes.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn events(&self) -> &[StateChangeEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Time since the first event was added (zero for an empty batch).
    pub fn age(&self) -> Duration {
        self.started_at
            .map(|started| started.elapsed())
            .unwrap_or_default()
    }
}

/// Why a batch was cut.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Size,
    Interval,
    Manual,
    Shutdown,
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Interval => "interval",
            FlushTrigger::Manual => "manual",
            FlushTrigger::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

struct Intake {
    active: Batch,
    next_sequence: u64,
    /// A batch was cut since the last timer tick
    flushed_since_tick: bool,
    /// Hand-off to the worker; `None` once teardown has begun
    flushed_tx: Option<mpsc::UnboundedSender<Batch>>,
}

struct Shared {
    intake: Mutex<Intake>,
    batch_size: usize,
    counters: DiagnosticCounters,
}

impl Shared {
    fn lock_intake(&self) -> MutexGuard<'_, Intake> {
        self.intake.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, event: StateChangeEvent) -> bool {
        let mut intake = self.lock_intake();

        if intake.flushed_tx.is_none() {
            drop(intake);
            self.counters
                .record_dropped(1, "event received after shutdown", false);
            return false;
        }

        intake.active.push(event);
        self.counters.record_enqueued(1);

        if intake.active.len() >= self.batch_size {
            self.flush_locked(&mut intake, FlushTrigger::Size);
        }
        true
    }

    fn flush(&self, trigger: FlushTrigger) {
        let mut intake = self.lock_intake();
        if intake.flushed_tx.is_some() {
            self.flush_locked(&mut intake, trigger);
        }
    }

    /// Timer tick: cut the active batch unless a flush already happened
    /// during this interval.
    fn tick(&self) {
        let mut intake = self.lock_intake();
        if intake.flushed_tx.is_none() {
            return;
        }

        if intake.flushed_since_tick {
            intake.flushed_since_tick = false;
            trace!(
                pending = intake.active.len(),
                "Batch already flushed this interval, skipping tick"
            );
            return;
        }

        self.flush_locked(&mut intake, FlushTrigger::Interval);
        intake.flushed_since_tick = false;
    }

    /// Swap the active batch for an empty one and queue it for delivery.
    fn flush_locked(&self, intake: &mut Intake, trigger: FlushTrigger) {
        if intake.active.is_empty() {
            return;
        }

        let next = Batch::new(intake.next_sequence);
        intake.next_sequence += 1;
        let batch = std::mem::replace(&mut intake.active, next);
        let count = batch.len();
        intake.flushed_since_tick = true;

        debug!(
            sequence = batch.sequence(),
            batch_len = count,
            age_ms = batch.age().as_millis() as u64,
            trigger = %trigger,
            "Batch flushed"
        );

        let queued = match &intake.flushed_tx {
            Some(tx) => tx.send(batch).is_ok(),
            None => false,
        };

        if !queued {
            // Worker is gone; account the events instead of losing them silently
            error!(batch_len = count, "Delivery worker stopped, dropping batch");
            self.counters
                .record_dropped(count as u64, "delivery worker stopped", false);
            self.counters.record_dequeued(count as u64);
        }
    }
}

/// Handle to the batching queue. Clones share the same queue and worker.
#[derive(Clone)]
pub struct BatchingQueue {
    shared: Arc<Shared>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BatchingQueue {
    /// Start the queue and its delivery worker on the current tokio runtime.
    pub fn start(
        config: BatchConfig,
        sink: Arc<dyn BatchSink>,
        counters: DiagnosticCounters,
    ) -> Self {
        let (flushed_tx, flushed_rx) = mpsc::unbounded_channel();
        let tick = config.batch_interval.max(MIN_TICK);

        let shared = Arc::new(Shared {
            intake: Mutex::new(Intake {
                active: Batch::new(0),
                next_sequence: 1,
                flushed_since_tick: false,
                flushed_tx: Some(flushed_tx),
            }),
            batch_size: config.batch_size.max(1),
            counters,
        });

        info!(
            batch_size = shared.batch_size,
            batch_interval_ms = tick.as_millis() as u64,
            "Starting batching worker"
        );

        let worker = Worker {
            shared: Arc::clone(&shared),
            sink,
            flushed_rx,
            tick,
        };
        let handle = tokio::spawn(worker.run());

        Self {
            shared,
            worker: Arc::new(Mutex::new(Some(handle))),
        }
    }

    /// Append an admitted event; flushes immediately when the batch is full.
    ///
    /// Never blocks on delivery. Returns false (and counts the event as
    /// dropped) once shutdown has begun.
    pub fn enqueue(&self, event: StateChangeEvent) -> bool {
        self.shared.enqueue(event)
    }

    /// Cut the active batch now, regardless of size or age.
    pub fn flush(&self) {
        self.shared.flush(FlushTrigger::Manual);
    }

    /// Events in the active (not yet flushed) batch.
    pub fn active_len(&self) -> usize {
        self.shared.lock_intake().active.len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_intake().flushed_tx.is_none()
    }

    /// Stop intake, flush the active batch and wait for queued deliveries.
    ///
    /// In-flight delivery is never aborted: every queued batch finishes on
    /// its own retry budget before the worker exits.
    pub async fn shutdown(&self) {
        {
            let mut intake = self.shared.lock_intake();
            if intake.flushed_tx.is_some() {
                self.shared.flush_locked(&mut intake, FlushTrigger::Shutdown);
                intake.flushed_tx = None;
            }
        }

        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "Batching worker terminated abnormally");
            }
        }
    }
}

struct Worker {
    shared: Arc<Shared>,
    sink: Arc<dyn BatchSink>,
    flushed_rx: mpsc::UnboundedReceiver<Batch>,
    tick: Duration,
}

impl Worker {
    async fn run(mut self) {
        // First tick one period out; an immediate tick would cut a batch at startup
        let mut ticker = interval_at(Instant::now() + self.tick, self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                maybe_batch = self.flushed_rx.recv() => {
                    match maybe_batch {
                        Some(batch) => self.deliver(batch).await,
                        None => break, // intake closed and queue drained
                    }
                }
                _ = ticker.tick() => {
                    self.shared.tick();
                }
            }
        }

        info!("Batching worker stopped");
    }

    async fn deliver(&self, batch: Batch) {
        let count = batch.len();
        let sequence = batch.sequence();

        // A panicking sink loses only its own batch
        let sink = Arc::clone(&self.sink);
        let outcome = match tokio::spawn(async move { sink.deliver(batch).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(sequence = sequence, error = %e, "Batch delivery task failed");
                Outcome::default()
            }
        };

        let accounted = outcome.sent + outcome.dropped;
        if accounted < count {
            let missing = count - accounted;
            warn!(
                sequence = sequence,
                batch_len = count,
                missing = missing,
                "Sink under-reported batch outcome, counting remainder as dropped"
            );
            self.shared.counters.record_dropped(
                missing as u64,
                format!("batch {} outcome incomplete", sequence),
                false,
            );
        }

        self.shared.counters.record_dequeued(count as u64);
    }
}
