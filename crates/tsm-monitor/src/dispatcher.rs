//! Bounded analysis job queue and worker pool.
//!
//! Completed commands are submitted as jobs; a fixed pool of workers pulls
//! them off a bounded channel and streams each through the analysis service,
//! forwarding non-silent responses to the sidebar channel. Submission never
//! blocks: a full queue drops the job and logs a warning. Terminal I/O must
//! not slow down because analysis is behind.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use tsm_core::{AnalysisRequest, AnalysisService, DomainError, DomainResult, SidebarMessage};

use crate::config::MonitorConfig;

/// A unit of analysis work with a cancellation handle.
///
/// The token is typically the session's: tearing a session down cancels any
/// of its jobs still queued or streaming.
pub struct AnalysisJob {
    pub request: AnalysisRequest,
    pub cancel: CancellationToken,
}

impl AnalysisJob {
    pub fn new(request: AnalysisRequest, cancel: CancellationToken) -> Self {
        Self { request, cancel }
    }
}

/// Fan-out point between command detection and the analysis service.
pub struct AnalysisDispatcher {
    /// Taken (and dropped) on stop so workers see channel closure and drain.
    job_tx: std::sync::Mutex<Option<mpsc::Sender<AnalysisJob>>>,
    /// Keeps the queue open even when the pool is empty (dispatch disabled).
    _job_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<AnalysisJob>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    shutdown_grace: std::time::Duration,
}

impl AnalysisDispatcher {
    /// Spawns the worker pool. With no service configured the dispatcher is
    /// inert: jobs are accepted and discarded by workers.
    pub fn new(
        service: Option<Arc<dyn AnalysisService>>,
        sidebar_tx: mpsc::Sender<SidebarMessage>,
        config: &MonitorConfig,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<AnalysisJob>(config.job_queue_capacity);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let mut workers = Vec::with_capacity(config.worker_pool_size);
        for worker_id in 0..config.worker_pool_size {
            let job_rx = Arc::clone(&job_rx);
            let service = service.clone();
            let sidebar_tx = sidebar_tx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    // Hold the receiver lock only while waiting for one job so
                    // idle workers share the queue fairly.
                    let job = { job_rx.lock().await.recv().await };
                    let Some(job) = job else {
                        debug!(worker_id, "analysis worker exiting");
                        break;
                    };
                    if let Some(service) = &service {
                        process_job(service.as_ref(), &sidebar_tx, job).await;
                    }
                }
            }));
        }

        Self {
            job_tx: std::sync::Mutex::new(Some(job_tx)),
            _job_rx: job_rx,
            workers: tokio::sync::Mutex::new(workers),
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Enqueues a job without blocking. A full queue drops the job with a
    /// warning (that is the contract, not a failure); a stopped dispatcher
    /// reports [`DomainError::Stopped`].
    pub fn submit(&self, job: AnalysisJob) -> DomainResult<()> {
        let tx = {
            let guard = match self.job_tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.clone()
        };
        let Some(tx) = tx else {
            return Err(DomainError::Stopped);
        };
        let key = job.request.key.clone();
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(session = %key, "analysis queue full, dropping job");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DomainError::Stopped),
        }
    }

    /// Closes the queue and waits for workers to drain what is already
    /// enqueued, up to the shutdown grace period.
    pub async fn stop(&self) {
        {
            let mut guard = match self.job_tx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.take();
        }

        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            for handle in workers.drain(..) {
                if let Err(e) = handle.await {
                    if !e.is_cancelled() {
                        error!(error = %e, "analysis worker panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!("analysis workers did not drain within shutdown grace, aborting");
            for handle in workers.drain(..) {
                handle.abort();
            }
        }
    }
}

/// Streams one job through the service, forwarding non-silent responses.
async fn process_job(
    service: &dyn AnalysisService,
    sidebar_tx: &mpsc::Sender<SidebarMessage>,
    job: AnalysisJob,
) {
    if job.cancel.is_cancelled() {
        debug!(session = %job.request.key, "analysis job cancelled before start");
        return;
    }

    let key = job.request.key.clone();
    let mut stream = service.process(job.request);

    loop {
        let chunk = tokio::select! {
            biased;
            _ = job.cancel.cancelled() => {
                debug!(session = %key, "analysis stream cancelled");
                break;
            }
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            break;
        };
        match chunk {
            Ok(response) if response.is_silent() => {}
            Ok(response) => {
                let message = SidebarMessage {
                    key: key.clone(),
                    response,
                };
                if let Err(mpsc::error::TrySendError::Full(_)) = sidebar_tx.try_send(message) {
                    warn!(session = %key, "sidebar channel full, dropping response");
                }
            }
            Err(e) => {
                error!(session = %key, error = %e, "analysis stream failed");
                break;
            }
        }
    }
}
