//! Dual-path output writer.
//!
//! Shell output takes two paths: synchronously to the client sink (the user
//! sees it immediately) and asynchronously into the monitor via a bounded
//! per-session mirror queue drained by a background task. Monitoring can lag
//! or lose data under pressure; the interactive path cannot.

use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tsm_core::SessionKey;

use crate::config::MonitorConfig;
use crate::monitor::TerminalMonitor;

/// The interactive half of the split: whatever transports bytes to the
/// user's terminal (WebSocket, PTY fd, ...).
#[async_trait::async_trait]
pub trait ClientSink: Send + Sync {
    async fn write(&self, data: &[u8]) -> std::io::Result<()>;
}

/// Bounded FIFO of output chunks awaiting monitoring.
///
/// Overflow evicts the oldest chunk: recent output is worth more to command
/// detection than stale output.
struct MirrorQueue {
    capacity: usize,
    inner: std::sync::Mutex<VecDeque<Vec<u8>>>,
    notify: Notify,
}

impl MirrorQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: std::sync::Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Vec<u8>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Pushes a chunk, evicting the oldest when full. Returns true if an
    /// eviction happened.
    fn push(&self, chunk: Vec<u8>) -> bool {
        let evicted = {
            let mut queue = self.lock();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(chunk);
            evicted
        };
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<Vec<u8>> {
        self.lock().pop_front()
    }

    fn clear(&self) -> usize {
        let mut queue = self.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}

/// Fans one session's output to the client (sync) and the monitor (async).
pub struct DualPathWriter {
    key: SessionKey,
    sink: Arc<dyn ClientSink>,
    queue: Arc<MirrorQueue>,
    cancel: CancellationToken,
    drain: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_grace: std::time::Duration,
}

impl DualPathWriter {
    /// Creates the writer and spawns its drain task, which feeds mirrored
    /// chunks into [`TerminalMonitor::process_output`] until closed.
    pub fn new(
        sink: Arc<dyn ClientSink>,
        monitor: Arc<TerminalMonitor>,
        key: SessionKey,
        cancel: CancellationToken,
        config: &MonitorConfig,
    ) -> Self {
        let queue = Arc::new(MirrorQueue::new(config.mirror_queue_capacity));

        let drain = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            let key = key.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = queue.notify.notified() => {
                            while let Some(chunk) = queue.pop() {
                                monitor.process_output(&key, &chunk).await;
                            }
                        }
                    }
                }
                debug!(session = %key, "mirror drain task exiting");
            })
        };

        Self {
            key,
            sink,
            queue,
            cancel,
            drain: tokio::sync::Mutex::new(Some(drain)),
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Writes a chunk to the client and mirrors it for monitoring.
    ///
    /// The client write happens first and its error is the caller's; the
    /// mirror copy is best-effort and never fails the write.
    pub async fn write(&self, data: &[u8]) -> std::io::Result<()> {
        self.sink.write(data).await?;

        if self.cancel.is_cancelled() {
            return Ok(());
        }
        if self.queue.push(data.to_vec()) {
            warn!(session = %self.key, "mirror queue full, evicted oldest chunk");
        }
        Ok(())
    }

    /// Stops mirroring: cancels the drain task, discards queued chunks, and
    /// waits for the task to exit (bounded by the shutdown grace period).
    pub async fn close(&self) {
        self.cancel.cancel();
        let dropped = self.queue.clear();
        if dropped > 0 {
            debug!(session = %self.key, dropped, "discarded unmonitored output on close");
        }

        let handle = self.drain.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(self.shutdown_grace, handle).await.is_err() {
                warn!(session = %self.key, "mirror drain task did not stop in time");
            }
        }
    }
}
