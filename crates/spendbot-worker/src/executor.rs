//! Job executor.
//!
//! Runs `concurrency` worker loops against the shared queue plus a retry
//! scheduler that moves due retries back onto the FIFO.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use spendbot_queue::JobQueue;

use crate::config::WorkerConfig;
use crate::error::WorkerResult;
use crate::metrics;
use crate::processor::JobProcessor;

/// Pause after a store error before dequeuing again.
const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Job executor that processes jobs from the queue.
pub struct JobExecutor {
    config: WorkerConfig,
    queue: Arc<JobQueue>,
    processor: Arc<JobProcessor>,
    shutdown: watch::Sender<bool>,
    worker_name: String,
}

impl JobExecutor {
    pub fn new(config: WorkerConfig, processor: Arc<JobProcessor>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            queue: processor.queue().clone(),
            config,
            processor,
            shutdown,
            worker_name: format!("worker-{}", Uuid::new_v4()),
        }
    }

    pub fn name(&self) -> &str {
        &self.worker_name
    }

    /// Run until [`JobExecutor::shutdown`] is called, then wait for
    /// in-flight jobs up to the shutdown timeout.
    pub async fn run(&self) -> WorkerResult<()> {
        self.queue.ping().await?;
        info!(
            "Starting job executor '{}' with {} workers",
            self.worker_name, self.config.concurrency
        );

        let scheduler = tokio::spawn(Self::retry_scheduler(
            Arc::clone(&self.queue),
            self.config.retry_poll_interval,
            self.shutdown.subscribe(),
        ));

        let workers: Vec<_> = (0..self.config.concurrency)
            .map(|slot| {
                tokio::spawn(Self::worker_loop(
                    slot,
                    Arc::clone(&self.queue),
                    Arc::clone(&self.processor),
                    self.shutdown.subscribe(),
                ))
            })
            .collect();

        let mut shutdown_rx = self.shutdown.subscribe();
        while !*shutdown_rx.borrow_and_update() {
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }

        info!("Shutdown signal received, waiting for in-flight jobs...");
        if tokio::time::timeout(self.config.shutdown_timeout, join_all(workers))
            .await
            .is_err()
        {
            warn!(
                "Jobs still running after {:?}, stopping anyway",
                self.config.shutdown_timeout
            );
        }
        scheduler.abort();

        info!("Job executor '{}' stopped", self.worker_name);
        Ok(())
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Dequeue and process until shutdown. The shutdown flag is checked
    /// between jobs; `dequeue` is bounded, so a quiet loop notices within one
    /// dequeue timeout. A dequeue is never abandoned mid-flight; the popped
    /// ID would sit in the claims set until `reclaim_stale` picks it up.
    async fn worker_loop(
        slot: usize,
        queue: Arc<JobQueue>,
        processor: Arc<JobProcessor>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(slot = slot, "Worker loop started");
        while !*shutdown.borrow() {
            match queue.dequeue().await {
                Ok(Some(job)) => {
                    let job_id = job.job_id.clone();
                    if let Err(e) = processor.process(job).await {
                        error!(job_id = %job_id, "Failed to record job outcome: {}", e);
                        if e.is_unavailable() {
                            Self::pause(&mut shutdown).await;
                        }
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!(slot = slot, "Dequeue failed: {}", e);
                    Self::pause(&mut shutdown).await;
                }
            }
        }
        debug!(slot = slot, "Worker loop stopped");
    }

    async fn pause(shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = shutdown.changed() => {}
            _ = tokio::time::sleep(STORE_ERROR_BACKOFF) => {}
        }
    }

    async fn retry_scheduler(
        queue: Arc<JobQueue>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = queue.process_retry_queue().await {
                        warn!("Failed to move due retries: {}", e);
                        continue;
                    }
                    if let Err(e) = queue.reclaim_stale().await {
                        warn!("Failed to reclaim stale jobs: {}", e);
                    }
                    if let (Ok(pending), Ok(retry), Ok(dlq)) =
                        (queue.queue_len().await, queue.retry_len().await, queue.dlq_len().await)
                    {
                        metrics::set_queue_lengths(pending, retry, dlq);
                    }
                }
            }
        }
    }
}
