//! Worker pool with structured concurrency.
//!
//! Each worker repeatedly claims one due delivery and runs the handler on it.
//! Cancellation is checked between claims only, so stopping the pool halts
//! new pulls immediately while in-flight handlers run to completion.

use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    queue::{DeliveryHandler, QueueCore},
};

/// Supervised set of queue workers.
pub(crate) struct WorkerPool {
    worker_count: usize,
    poll_interval: Duration,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(worker_count: usize, poll_interval: Duration) -> Self {
        Self {
            worker_count,
            poll_interval,
            cancellation_token: CancellationToken::new(),
            worker_handles: Vec::new(),
        }
    }

    /// Spawns every worker. Returns immediately.
    pub(crate) fn spawn_workers(
        &mut self,
        core: Arc<QueueCore>,
        handler: Arc<dyn DeliveryHandler>,
    ) {
        info!(worker_count = self.worker_count, "spawning delivery workers");

        for worker_id in 0..self.worker_count {
            let core = core.clone();
            let handler = handler.clone();
            let token = self.cancellation_token.clone();
            let poll_interval = self.poll_interval;

            let handle = tokio::spawn(async move {
                info!(worker_id, "delivery worker starting");
                run_worker(worker_id, core, handler, poll_interval, token).await;
                info!(worker_id, "delivery worker stopped");
            });

            self.worker_handles.push(handle);
        }
    }

    /// Cancels every worker and waits for them to finish their current
    /// delivery.
    ///
    /// # Errors
    ///
    /// Returns `WorkerPanic` for the first worker that panicked.
    pub(crate) async fn shutdown_graceful(mut self) -> Result<()> {
        info!(worker_count = self.worker_handles.len(), "initiating graceful worker shutdown");
        self.cancellation_token.cancel();

        let mut first_panic = None;
        for (worker_id, handle) in std::mem::take(&mut self.worker_handles).into_iter().enumerate()
        {
            if let Err(join_error) = handle.await {
                error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                first_panic.get_or_insert(DeliveryError::WorkerPanic {
                    worker_id,
                    error: join_error.to_string(),
                });
            }
        }

        info!("worker pool shutdown completed");
        first_panic.map_or(Ok(()), Err)
    }

    /// Workers whose task has not finished.
    pub(crate) fn active_workers(&self) -> usize {
        self.worker_handles.iter().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.active_workers();
        if active > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    core: Arc<QueueCore>,
    handler: Arc<dyn DeliveryHandler>,
    poll_interval: Duration,
    token: CancellationToken,
) {
    while !token.is_cancelled() {
        match core.process_next(handler.as_ref()).await {
            Ok(true) => continue,
            Ok(false) => {},
            Err(e) => warn!(worker_id, error = %e, "failed to process delivery"),
        }

        tokio::select! {
            () = token.cancelled() => {
                debug!(worker_id, "worker cancelled while idle");
                break;
            }
            () = tokio::time::sleep(poll_interval) => {}
        }
    }
}
