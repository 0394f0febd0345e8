//! Write buffer for page-view events
//!
//! Producers `enqueue` events without waiting on storage. Pending events are
//! written to an [`EventSink`] in one bulk insert when either the capacity
//! threshold is reached or the flush timer fires, whichever comes first.
//!
//! Invariants:
//! - at most one bulk write runs at a time (`flushing` is tested and set under
//!   the same lock that drains `pending`)
//! - a failed batch goes back in front of newer events, order preserved
//! - the write itself runs on its own task, so dropping a `flush()` future
//!   never aborts an in-flight insert

use crate::error::CoreError;
use crate::models::{ColumnLimits, ViewEvent};
use crate::sink::EventSink;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Configuration for the event buffer
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Pending length that triggers an immediate flush
    pub capacity: usize,

    /// Delay between the first buffered event and the timed flush
    pub flush_interval: Duration,

    /// Column sizes enforced right before the bulk insert
    pub column_limits: ColumnLimits,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            flush_interval: Duration::from_secs(2 * 60),
            column_limits: ColumnLimits::default(),
        }
    }
}

/// Result of a flush attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending
    Empty,
    /// Another flush holds the write slot; nothing was drained
    AlreadyFlushing,
    /// Batch of this many events persisted
    Flushed(usize),
    /// Write failed; this many events went back to the front of the queue
    Requeued(usize),
}

/// Counters exposed for logging and the CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub enqueued: u64,
    pub flushes: u64,
    pub flushed_events: u64,
    pub failed_flushes: u64,
    pub requeued_events: u64,
    pub truncated_fields: u64,
    pub pending: usize,
}

struct FlushTimer {
    id: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct BufferState {
    pending: Vec<ViewEvent>,
    timer: Option<FlushTimer>,
    next_timer_id: u64,
    flushing: bool,
    stats: BufferStats,
}

enum Drain {
    Batch(Vec<ViewEvent>),
    Empty,
    Busy,
}

impl BufferState {
    /// Take the whole pending list and claim the write slot
    fn drain(&mut self) -> Drain {
        if self.flushing {
            return Drain::Busy;
        }
        if self.pending.is_empty() {
            return Drain::Empty;
        }

        self.flushing = true;
        self.cancel_timer();
        Drain::Batch(std::mem::take(&mut self.pending))
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
            trace!(timer_id = timer.id, "Flush timer cancelled");
        }
    }

    /// Put a failed batch back ahead of anything enqueued meanwhile
    fn requeue(&mut self, mut batch: Vec<ViewEvent>) {
        self.stats.requeued_events += batch.len() as u64;
        batch.append(&mut self.pending);
        self.pending = batch;
    }
}

/// Requeues the batch and releases the write slot if the write future is
/// dropped or the sink panics before completion. The flush timer is re-armed
/// so the batch is retried without waiting for new events.
struct InFlightBatch<'a, S: EventSink> {
    shared: &'a Arc<Shared<S>>,
    batch: Option<Vec<ViewEvent>>,
}

impl<S: EventSink> InFlightBatch<'_, S> {
    fn take(&mut self) -> Vec<ViewEvent> {
        self.batch.take().unwrap_or_default()
    }
}

impl<S: EventSink> Drop for InFlightBatch<'_, S> {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            warn!(
                events = batch.len(),
                "Flush interrupted mid-write, re-queueing batch"
            );
            {
                let mut state = self.shared.state.lock();
                state.stats.failed_flushes += 1;
                state.requeue(batch);
                state.flushing = false;
                if !state.pending.is_empty() {
                    self.shared.ensure_timer(&mut state);
                }
            }
            self.shared.flush_done.notify_waiters();
        }
    }
}

struct Shared<S> {
    sink: S,
    config: BufferConfig,
    state: Mutex<BufferState>,
    /// Signalled after every completed write
    flush_done: Notify,
    runtime: Handle,
}

impl<S: EventSink> Shared<S> {
    fn ensure_timer(self: &Arc<Self>, state: &mut BufferState) {
        if state.timer.is_some() {
            return;
        }

        let id = state.next_timer_id;
        state.next_timer_id += 1;

        let shared = Arc::clone(self);
        let delay = self.config.flush_interval;
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.on_timer(id);
        });

        state.timer = Some(FlushTimer { id, handle });
        trace!(timer_id = id, delay_ms = delay.as_millis() as u64, "Flush timer scheduled");
    }

    fn on_timer(self: &Arc<Self>, id: u64) {
        let batch = {
            let mut state = self.state.lock();
            // Cancelled or replaced while we were waking up
            if state.timer.as_ref().map(|timer| timer.id) != Some(id) {
                return;
            }
            state.timer = None;

            debug!(
                timer_id = id,
                pending = state.pending.len(),
                "Flush timer fired"
            );
            match state.drain() {
                Drain::Batch(batch) => batch,
                Drain::Empty | Drain::Busy => return,
            }
        };

        self.spawn_write(batch);
    }

    fn spawn_write(self: &Arc<Self>, batch: Vec<ViewEvent>) -> JoinHandle<FlushOutcome> {
        let shared = Arc::clone(self);
        self.runtime
            .spawn(async move { shared.write_batch(batch).await })
    }

    async fn write_batch(self: &Arc<Self>, mut batch: Vec<ViewEvent>) -> FlushOutcome {
        let count = batch.len();
        let truncated: usize = batch
            .iter_mut()
            .map(|event| event.truncate_to(&self.config.column_limits))
            .sum();

        let attempt = batch.clone();
        let mut in_flight = InFlightBatch {
            shared: self,
            batch: Some(batch),
        };

        let started = Instant::now();
        let result = self.sink.insert_batch(attempt).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let outcome = {
            let mut state = self.state.lock();
            let batch = in_flight.take();
            state.flushing = false;
            state.stats.truncated_fields += truncated as u64;

            let outcome = match result {
                Ok(written) => {
                    state.stats.flushes += 1;
                    state.stats.flushed_events += count as u64;
                    info!(events = count, written, elapsed_ms, "Flushed view events");
                    FlushOutcome::Flushed(count)
                }
                Err(e) => {
                    state.stats.failed_flushes += 1;
                    error!(
                        error = %e,
                        events = count,
                        elapsed_ms,
                        "View event flush failed, re-queueing batch"
                    );
                    state.requeue(batch);
                    FlushOutcome::Requeued(count)
                }
            };

            // Events that arrived during the write, or the requeued batch,
            // still need a trigger.
            let next = if matches!(outcome, FlushOutcome::Flushed(_))
                && state.pending.len() >= self.config.capacity
            {
                match state.drain() {
                    Drain::Batch(next) => Some(next),
                    Drain::Empty | Drain::Busy => None,
                }
            } else {
                if !state.pending.is_empty() {
                    self.ensure_timer(&mut state);
                }
                None
            };

            if let Some(next) = next {
                drop(state);
                self.spawn_write(next);
            }
            outcome
        };

        self.flush_done.notify_waiters();
        outcome
    }
}

/// Batched page-view writer (one per process, cheap to clone)
pub struct EventBuffer<S: EventSink> {
    shared: Arc<Shared<S>>,
}

impl<S: EventSink> Clone for EventBuffer<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: EventSink> EventBuffer<S> {
    /// Create a buffer bound to the current tokio runtime
    pub fn new(sink: S, config: BufferConfig) -> Result<Self, CoreError> {
        let runtime = Handle::try_current().map_err(|e| CoreError::NoRuntime {
            message: e.to_string(),
        })?;
        Ok(Self::with_runtime(sink, config, runtime))
    }

    /// Create a buffer that schedules its timer and writes on `runtime`
    pub fn with_runtime(sink: S, config: BufferConfig, runtime: Handle) -> Self {
        debug!(
            capacity = config.capacity,
            flush_interval_secs = config.flush_interval.as_secs(),
            "Event buffer created"
        );

        Self {
            shared: Arc::new(Shared {
                sink,
                config,
                state: Mutex::new(BufferState::default()),
                flush_done: Notify::new(),
                runtime,
            }),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.shared.config
    }

    pub fn sink(&self) -> &S {
        &self.shared.sink
    }

    /// Append an event. Never blocks on storage and never fails.
    ///
    /// Reaching capacity drains the pending list right here and hands it to a
    /// background write; otherwise a flush timer is armed if none is pending.
    pub fn enqueue(&self, event: ViewEvent) {
        let batch = {
            let mut state = self.shared.state.lock();
            state.pending.push(event);
            state.stats.enqueued += 1;

            if state.pending.len() >= self.shared.config.capacity {
                debug!(
                    pending = state.pending.len(),
                    capacity = self.shared.config.capacity,
                    "Buffer capacity reached, flushing"
                );
                match state.drain() {
                    Drain::Batch(batch) => Some(batch),
                    Drain::Empty | Drain::Busy => None,
                }
            } else {
                self.shared.ensure_timer(&mut state);
                None
            }
        };

        if let Some(batch) = batch {
            self.shared.spawn_write(batch);
        }
    }

    /// Drain everything pending and write it as one batch.
    ///
    /// Errors from the sink are logged and turned into a re-queue, never
    /// returned.
    pub async fn flush(&self) -> FlushOutcome {
        let batch = {
            let mut state = self.shared.state.lock();
            match state.drain() {
                Drain::Batch(batch) => batch,
                Drain::Empty => return FlushOutcome::Empty,
                Drain::Busy => {
                    debug!("Flush already in progress, skipping");
                    return FlushOutcome::AlreadyFlushing;
                }
            }
        };

        let count = batch.len();
        match self.shared.spawn_write(batch).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // A panicking sink hands the batch back through the in-flight guard
                error!(error = %e, events = count, "Flush task did not complete");
                FlushOutcome::Requeued(count)
            }
        }
    }

    /// Cancel the timer and make a best-effort final flush.
    ///
    /// Waits for a write that is already running, then flushes what is left.
    /// A failing store leaves the events pending; nothing is retried here.
    pub async fn shutdown(&self) -> FlushOutcome {
        let pending = {
            let mut state = self.shared.state.lock();
            state.cancel_timer();
            state.pending.len()
        };
        info!(pending, "Event buffer shutting down, final flush");

        loop {
            let done = self.shared.flush_done.notified();
            match self.flush().await {
                FlushOutcome::AlreadyFlushing => done.await,
                outcome => {
                    self.shared.state.lock().cancel_timer();
                    return outcome;
                }
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    pub fn is_flushing(&self) -> bool {
        self.shared.state.lock().flushing
    }

    pub fn has_timer(&self) -> bool {
        self.shared.state.lock().timer.is_some()
    }

    pub fn stats(&self) -> BufferStats {
        let state = self.shared.state.lock();
        BufferStats {
            pending: state.pending.len(),
            ..state.stats
        }
    }
}
