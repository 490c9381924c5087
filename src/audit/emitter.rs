use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{AuditEvent, AuditSink};
use crate::config::AuditConfig;
use crate::context::HostContext;
use crate::error::SprocError;

/// Queues audit events and writes them to a sink from a background task.
///
/// [`record`](Self::record) never waits on I/O. Events stay buffered while the sink is
/// unavailable and are retried after `retry_delay`; once `buffer_capacity` events are
/// pending, further events are refused with `SprocError::AuditBufferFull` and counted in
/// [`lost_events`](Self::lost_events). Events the sink refuses outright are dropped and
/// counted there too, so they never hold up the events behind them.
pub struct AuditEmitter {
    tx: mpsc::UnboundedSender<AuditEvent>,
    pending: Arc<watch::Sender<usize>>,
    capacity: usize,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
    host: HostContext,
}

#[derive(Debug, Default)]
struct Counters {
    lost: AtomicU64,
    written: AtomicU64,
}

struct Writer {
    sink: Arc<dyn AuditSink>,
    pending: Arc<watch::Sender<usize>>,
    counters: Arc<Counters>,
    batch_size: usize,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

impl AuditEmitter {
    /// Start an emitter writing to `sink`.
    ///
    /// # Errors
    /// Returns `SprocError::Configuration` when called outside a Tokio runtime.
    pub fn new(
        sink: Arc<dyn AuditSink>,
        config: &AuditConfig,
        host: HostContext,
    ) -> Result<Self, SprocError> {
        let handle = Handle::try_current().map_err(|e| {
            SprocError::Configuration(format!("audit emitter needs a Tokio runtime: {e}"))
        })?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(0usize);
        let pending = Arc::new(pending);
        let counters = Arc::new(Counters::default());
        let shutdown = CancellationToken::new();

        let writer = Writer {
            sink,
            pending: pending.clone(),
            counters: counters.clone(),
            batch_size: config.batch_size.max(1),
            retry_delay: config.retry_delay(),
            shutdown: shutdown.clone(),
        };
        let worker = handle.spawn(writer.run(rx));

        Ok(Self {
            tx,
            pending,
            capacity: config.buffer_capacity.max(1),
            counters,
            shutdown,
            worker: Mutex::new(Some(worker)),
            host,
        })
    }

    /// Host identity stamped on the events this emitter's callers build.
    #[must_use]
    pub fn host(&self) -> &HostContext {
        &self.host
    }

    /// Queue one event for writing.
    ///
    /// # Errors
    /// - `SprocError::AuditBufferFull` if `buffer_capacity` events are already pending;
    ///   the event is lost and counted,
    /// - `SprocError::InvalidState` after [`shutdown`](Self::shutdown).
    pub fn record(&self, event: AuditEvent) -> Result<(), SprocError> {
        let mut accepted = false;
        self.pending.send_if_modified(|n| {
            if *n >= self.capacity {
                false
            } else {
                *n += 1;
                accepted = true;
                true
            }
        });

        if !accepted {
            let lost = self.counters.lost.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::error!(
                correlation_id = event.correlation_id(),
                event_id = %event.event_id(),
                capacity = self.capacity,
                lost_total = lost,
                "audit buffer full, event dropped"
            );
            return Err(SprocError::AuditBufferFull(format!(
                "{} events pending",
                self.capacity
            )));
        }

        if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
            self.counters.lost.fetch_add(1, Ordering::SeqCst);
            tracing::error!(
                correlation_id = event.correlation_id(),
                "audit event recorded after shutdown, event dropped"
            );
            return Err(SprocError::InvalidState(
                "audit emitter has been shut down".into(),
            ));
        }
        Ok(())
    }

    /// Events refused or abandoned since start.
    #[must_use]
    pub fn lost_events(&self) -> u64 {
        self.counters.lost.load(Ordering::SeqCst)
    }

    /// Events the sink accepted since start.
    #[must_use]
    pub fn written_events(&self) -> u64 {
        self.counters.written.load(Ordering::SeqCst)
    }

    /// Events queued or being written.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until every event recorded so far has been written or dropped.
    ///
    /// While the sink stays unavailable this keeps waiting; bound it with
    /// `tokio::time::timeout` if needed.
    ///
    /// # Errors
    /// Returns `SprocError::InvalidState` if the writer task is gone.
    pub async fn flush(&self) -> Result<(), SprocError> {
        let mut rx = self.pending.subscribe();
        rx.wait_for(|n| *n == 0)
            .await
            .map(|_| ())
            .map_err(|_| SprocError::InvalidState("audit writer stopped".into()))
    }

    /// Stop accepting events, write what is buffered with one last attempt, and wait for
    /// the writer to exit. Events the sink refuses at this point are counted as lost.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker
            && let Err(e) = worker.await
        {
            tracing::error!(error = %e, "audit writer task failed");
        }
    }
}

impl Drop for AuditEmitter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl Writer {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<AuditEvent>) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let mut closing = false;
        loop {
            let received = tokio::select! {
                biased;
                n = rx.recv_many(&mut batch, self.batch_size) => n,
                () = self.shutdown.cancelled(), if !closing => {
                    rx.close();
                    closing = true;
                    continue;
                }
            };
            if received == 0 {
                break;
            }
            self.deliver(&batch).await;
            let done = batch.len();
            batch.clear();
            self.pending.send_modify(|n| *n = n.saturating_sub(done));
        }
        tracing::debug!("audit writer stopped");
    }

    async fn deliver(&self, batch: &[AuditEvent]) {
        let err = match self.write(batch).await {
            Ok(()) => {
                self.counters
                    .written
                    .fetch_add(batch.len() as u64, Ordering::SeqCst);
                return;
            }
            Err(err) => err,
        };
        if batch.len() == 1 || err.is_retryable() {
            self.abandon(batch, &err);
            return;
        }

        // The sink refused the content of the batch; find the events it refuses.
        tracing::warn!(
            events = batch.len(),
            error = %err.detailed_message(),
            "audit sink rejected a batch, writing its events one by one"
        );
        for event in batch {
            let single = std::slice::from_ref(event);
            match self.write(single).await {
                Ok(()) => {
                    self.counters.written.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => self.abandon(single, &err),
            }
        }
    }

    /// Write `events`, retrying while the sink is unavailable and the emitter is running.
    async fn write(&self, events: &[AuditEvent]) -> Result<(), SprocError> {
        let mut failures = 0u32;
        loop {
            let err = match self.sink.write_batch(events).await {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() || self.shutdown.is_cancelled() => {
                    return Err(err);
                }
                Err(err) => err,
            };
            failures += 1;
            tracing::warn!(
                events = events.len(),
                failures,
                error = %err.detailed_message(),
                "audit sink write failed, will retry"
            );
            tokio::select! {
                () = tokio::time::sleep(self.retry_delay) => {}
                () = self.shutdown.cancelled() => {}
            }
        }
    }

    fn abandon(&self, events: &[AuditEvent], err: &SprocError) {
        self.counters
            .lost
            .fetch_add(events.len() as u64, Ordering::SeqCst);
        let event_ids: Vec<String> = events.iter().map(|e| e.event_id().to_string()).collect();
        if err.is_retryable() {
            tracing::error!(
                events = events.len(),
                ?event_ids,
                error = %err.detailed_message(),
                "audit sink unavailable at shutdown, events lost"
            );
        } else {
            tracing::error!(
                events = events.len(),
                ?event_ids,
                error = %err.detailed_message(),
                "audit sink refused events, events lost"
            );
        }
    }
}
