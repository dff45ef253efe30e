//! Job queue: FIFO, metadata, idempotency index, retry schedule and DLQ.
//!
//! Key layout (all under `QueueConfig::key_prefix`):
//! - `{p}:queue`          list of ready job IDs
//! - `{p}:claims`         sorted set of claimed job IDs scored by claim time (ms)
//! - `{p}:retry`          sorted set of job IDs scored by retry time (ms)
//! - `{p}:job:{id}`       job metadata JSON
//! - `{p}:idem:{key}`     idempotency key -> job ID
//! - `{p}:dlq`            sorted set of dead-lettered job IDs scored by failure time (ms)
//! - `{p}:dlq:{id}`       dead letter entry JSON
//!
//! A job ID lives in exactly one of `queue`, `claims` or `retry` until the
//! job is terminal. Each transition swaps the metadata and moves the ID in
//! one atomic store call; `reclaim_stale` recovers claims whose worker died.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use spendbot_models::{DeadLetter, Job, JobId, JobKind, JobSnapshot, JobStatus, SharedClock};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::store::{SharedStore, WriteOp};

/// Compare-and-swap attempts before an update gives up.
const MAX_CAS_RETRIES: usize = 16;

pub const CANCELLED_ERROR: &str = "cancelled";

/// Error recorded on a running job whose claim outlived the visibility timeout.
pub const RECLAIMED_ERROR: &str = "worker lost: visibility timeout expired";

/// What `complete_job` did with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    /// Failed, back in the retry schedule
    RetryScheduled {
        attempt: u32,
        next_retry_at: DateTime<Utc>,
    },
    /// Failed for the last time and copied to the DLQ
    DeadLettered { attempts: u32 },
}

/// Job queue client.
pub struct JobQueue {
    store: SharedStore,
    clock: SharedClock,
    config: QueueConfig,
}

impl JobQueue {
    pub fn new(config: QueueConfig, store: SharedStore, clock: SharedClock) -> Self {
        Self { store, clock, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    fn queue_key(&self) -> String {
        format!("{}:queue", self.config.key_prefix)
    }

    fn claims_key(&self) -> String {
        format!("{}:claims", self.config.key_prefix)
    }

    fn retry_key(&self) -> String {
        format!("{}:retry", self.config.key_prefix)
    }

    fn dlq_key(&self) -> String {
        format!("{}:dlq", self.config.key_prefix)
    }

    fn job_key(&self, job_id: &JobId) -> String {
        format!("{}:job:{}", self.config.key_prefix, job_id)
    }

    fn idempotency_key(&self, key: &str) -> String {
        format!("{}:idem:{}", self.config.key_prefix, key)
    }

    fn dead_letter_key(&self, job_id: &JobId) -> String {
        format!("{}:dlq:{}", self.config.key_prefix, job_id)
    }

    fn release_claim(&self, job_id: &JobId) -> WriteOp {
        WriteOp::ZRem {
            set: self.claims_key(),
            member: job_id.to_string(),
        }
    }

    /// Enqueue a job, or return the job already registered under
    /// `idempotency_key` while its mapping is alive.
    pub async fn enqueue(
        &self,
        kind: JobKind,
        payload: serde_json::Value,
        user_id: &str,
        idempotency_key: &str,
    ) -> QueueResult<JobId> {
        if user_id.trim().is_empty() {
            return Err(QueueError::validation("user_id is required"));
        }
        if idempotency_key.trim().is_empty() {
            return Err(QueueError::validation("idempotency_key is required"));
        }

        let job = Job::new(kind, payload, user_id, idempotency_key, self.clock.now());
        let serialized = serde_json::to_string(&job)?;
        let idem_key = self.idempotency_key(idempotency_key);

        // Reserve the idempotency key first so concurrent duplicates race on
        // a single atomic SET NX.
        let reserved = self
            .store
            .set_nx_ex(&idem_key, job.job_id.as_str(), self.config.job_ttl)
            .await?;
        if !reserved {
            return match self.store.get(&idem_key).await? {
                Some(existing) => {
                    info!(
                        job_id = %existing,
                        idempotency_key = %idempotency_key,
                        "Duplicate enqueue, returning existing job"
                    );
                    Ok(JobId::from_string(existing))
                }
                None => Err(QueueError::enqueue_failed(
                    "idempotency mapping expired during enqueue",
                )),
            };
        }

        let persisted = self
            .store
            .apply(&[
                WriteOp::SetEx {
                    key: self.job_key(&job.job_id),
                    value: serialized,
                    ttl: self.config.job_ttl,
                },
                WriteOp::PushBack {
                    list: self.queue_key(),
                    value: job.job_id.to_string(),
                },
            ])
            .await;
        if let Err(e) = persisted {
            warn!(job_id = %job.job_id, "Enqueue failed, releasing idempotency key: {}", e);
            self.store.del(&idem_key).await.ok();
            return Err(e);
        }

        info!(
            job_id = %job.job_id,
            job_type = %job.kind,
            user_id = %job.user_id,
            "Enqueued job"
        );
        Ok(job.job_id)
    }

    /// Take ownership of the next ready job, waiting at most
    /// `dequeue_timeout`. The pop is atomic in the store, so each job ID is
    /// handed to exactly one caller, and it lands in the claims set in the
    /// same step.
    pub async fn dequeue(&self) -> QueueResult<Option<Job>> {
        let claimed_at = self.clock.now_millis();
        let Some(raw_id) = self
            .store
            .claim_front(
                &self.queue_key(),
                &self.claims_key(),
                claimed_at,
                self.config.dequeue_timeout,
            )
            .await?
        else {
            return Ok(None);
        };
        let job_id = JobId::from_string(raw_id);
        let now = self.clock.now();
        let claims = self.claims_key();

        let claimed = self
            .update_job(&job_id, |job| {
                expect_status(job, JobStatus::Queued)?;
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.updated_at = now;
                job.next_retry_at = None;
                Ok(vec![WriteOp::ZAdd {
                    set: claims.clone(),
                    member: job.job_id.to_string(),
                    score: now.timestamp_millis(),
                }])
            })
            .await;

        match claimed {
            Ok(job) => {
                debug!(job_id = %job.job_id, attempt = job.attempts, "Dequeued job");
                Ok(Some(job))
            }
            // Cancelled while waiting in the list, or a stale duplicate of a
            // job another worker already runs.
            Err(QueueError::InvalidState { status, .. }) => {
                debug!(job_id = %job_id, status = %status, "Skipping non-queued job");
                if status != JobStatus::Running {
                    self.drop_claim(&job_id).await;
                }
                Ok(None)
            }
            Err(QueueError::JobNotFound(_)) => {
                warn!(job_id = %job_id, "Dequeued job without metadata (expired?)");
                self.drop_claim(&job_id).await;
                Ok(None)
            }
            // The claim entry stays; `reclaim_stale` puts the job back.
            Err(e) => Err(e),
        }
    }

    /// Best effort; a leftover claim is cleaned up by `reclaim_stale`.
    async fn drop_claim(&self, job_id: &JobId) {
        if let Err(e) = self.store.zrem(&self.claims_key(), job_id.as_str()).await {
            debug!(job_id = %job_id, "Could not drop claim: {}", e);
        }
    }

    /// Record the outcome of a running job.
    pub async fn complete_job(
        &self,
        job_id: &JobId,
        success: bool,
        result_ref: Option<String>,
        error: Option<String>,
    ) -> QueueResult<Completion> {
        let now = self.clock.now();
        let mut completion = Completion::Succeeded;

        let job = self
            .update_job(job_id, |job| {
                expect_status(job, JobStatus::Running)?;
                if success {
                    job.status = JobStatus::Succeeded;
                    job.result_ref = result_ref.clone();
                    job.error = None;
                    job.updated_at = now;
                    completion = Completion::Succeeded;
                    Ok(vec![self.release_claim(&job.job_id)])
                } else {
                    let (settled, ops) = self.settle_failure(job, error.clone(), now)?;
                    completion = settled;
                    Ok(ops)
                }
            })
            .await?;

        self.log_completion(&job, &completion);
        Ok(completion)
    }

    /// Apply the retry/DLQ policy to a failed attempt of a running job.
    /// Returns the outcome and the writes that must land with it.
    fn settle_failure(
        &self,
        job: &mut Job,
        error: Option<String>,
        now: DateTime<Utc>,
    ) -> QueueResult<(Completion, Vec<WriteOp>)> {
        job.updated_at = now;
        job.error = error;
        let mut ops = vec![self.release_claim(&job.job_id)];

        if job.attempts < self.config.max_attempts {
            let next_retry_at = now + to_chrono(self.config.backoff_for(job.attempts));
            job.status = JobStatus::Queued;
            job.next_retry_at = Some(next_retry_at);
            ops.push(WriteOp::ZAdd {
                set: self.retry_key(),
                member: job.job_id.to_string(),
                score: next_retry_at.timestamp_millis(),
            });
            return Ok((
                Completion::RetryScheduled {
                    attempt: job.attempts,
                    next_retry_at,
                },
                ops,
            ));
        }

        job.status = JobStatus::Failed;
        job.next_retry_at = None;
        let entry = DeadLetter {
            job: job.clone(),
            error: job.error.clone().unwrap_or_default(),
            attempts: job.attempts,
            failed_at: now,
        };
        ops.push(WriteOp::SetEx {
            key: self.dead_letter_key(&job.job_id),
            value: serde_json::to_string(&entry)?,
            ttl: self.config.dlq_ttl,
        });
        ops.push(WriteOp::ZAdd {
            set: self.dlq_key(),
            member: job.job_id.to_string(),
            score: now.timestamp_millis(),
        });
        ops.push(WriteOp::ZRemRangeByScore {
            set: self.dlq_key(),
            max: self.dlq_cutoff_ms(now),
        });
        Ok((
            Completion::DeadLettered {
                attempts: job.attempts,
            },
            ops,
        ))
    }

    fn log_completion(&self, job: &Job, completion: &Completion) {
        match completion {
            Completion::Succeeded => {
                info!(job_id = %job.job_id, "Job succeeded");
            }
            Completion::RetryScheduled {
                attempt,
                next_retry_at,
            } => {
                info!(
                    job_id = %job.job_id,
                    attempt = attempt,
                    max_attempts = self.config.max_attempts,
                    next_retry_at = %next_retry_at,
                    "Job failed, retry scheduled"
                );
            }
            Completion::DeadLettered { attempts } => {
                warn!(
                    job_id = %job.job_id,
                    attempts = attempts,
                    error = job.error.as_deref().unwrap_or(""),
                    "Job exceeded max attempts, moved to DLQ"
                );
            }
        }
    }

    /// Dead letters failed at or before this instant are past their TTL.
    fn dlq_cutoff_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - to_chrono(self.config.dlq_ttl)).timestamp_millis()
    }

    /// Put a running job back into the retry schedule without consuming an
    /// attempt. Used when the worker declines to run it yet (rate limited).
    pub async fn reschedule(&self, job_id: &JobId, delay: Duration) -> QueueResult<DateTime<Utc>> {
        let now = self.clock.now();
        let next_retry_at = now + to_chrono(delay);
        let retry = self.retry_key();

        self.update_job(job_id, |job| {
            expect_status(job, JobStatus::Running)?;
            job.status = JobStatus::Queued;
            job.attempts = job.attempts.saturating_sub(1);
            job.next_retry_at = Some(next_retry_at);
            job.updated_at = now;
            Ok(vec![
                self.release_claim(&job.job_id),
                WriteOp::ZAdd {
                    set: retry.clone(),
                    member: job.job_id.to_string(),
                    score: next_retry_at.timestamp_millis(),
                },
            ])
        })
        .await?;

        debug!(job_id = %job_id, next_retry_at = %next_retry_at, "Job rescheduled");
        Ok(next_retry_at)
    }

    /// Move every due retry back onto the FIFO. Returns how many moved.
    ///
    /// Safe to run from several schedulers: each move is one atomic store
    /// call and only the caller that removed the ID pushes it.
    pub async fn process_retry_queue(&self) -> QueueResult<usize> {
        let now_ms = self.clock.now_millis();
        let retry = self.retry_key();
        let queue = self.queue_key();
        let due = self
            .store
            .zrange_by_score(&retry, now_ms, self.config.retry_batch_size)
            .await?;

        let mut moved = 0;
        for job_id in due {
            if self.store.zmove_to_list(&retry, &job_id, &queue).await? {
                moved += 1;
            }
        }

        if moved > 0 {
            debug!("Moved {} due retries to the queue", moved);
        }
        Ok(moved)
    }

    /// Recover claims older than `visibility_timeout`.
    ///
    /// A stale running job counts as a failed attempt and goes through the
    /// retry/DLQ policy. A claimed job that never reached running goes back
    /// on the queue. Claims of terminal or missing jobs are dropped.
    /// Returns how many jobs were recovered.
    pub async fn reclaim_stale(&self) -> QueueResult<usize> {
        let now = self.clock.now();
        let cutoff = now - to_chrono(self.config.visibility_timeout);
        let stale = self
            .store
            .zrange_by_score(&self.claims_key(), cutoff.timestamp_millis(), self.config.retry_batch_size)
            .await?;

        let mut reclaimed = 0;
        for raw_id in stale {
            let job_id = JobId::from_string(raw_id);
            if self.reclaim(&job_id, cutoff, now).await? {
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            warn!("Reclaimed {} jobs past the visibility timeout", reclaimed);
        }
        Ok(reclaimed)
    }

    async fn reclaim(&self, job_id: &JobId, cutoff: DateTime<Utc>, now: DateTime<Utc>) -> QueueResult<bool> {
        let Some(seen) = self.get_job(job_id).await? else {
            self.store.zrem(&self.claims_key(), job_id.as_str()).await?;
            return Ok(false);
        };
        if seen.status.is_terminal() {
            self.store.zrem(&self.claims_key(), job_id.as_str()).await?;
            return Ok(false);
        }
        // A fresh claim or update happened after the range read.
        if seen.updated_at > cutoff {
            return Ok(false);
        }

        let queue = self.queue_key();
        let mut completion = None;
        let reclaimed = self
            .update_job(job_id, |job| {
                expect_status(job, seen.status)?;
                if job.updated_at != seen.updated_at {
                    return Err(QueueError::Conflict(job.job_id.clone()));
                }
                match job.status {
                    JobStatus::Running => {
                        let (settled, ops) =
                            self.settle_failure(job, Some(RECLAIMED_ERROR.to_string()), now)?;
                        completion = Some(settled);
                        Ok(ops)
                    }
                    _ => {
                        job.updated_at = now;
                        Ok(vec![
                            self.release_claim(&job.job_id),
                            WriteOp::PushBack {
                                list: queue.clone(),
                                value: job.job_id.to_string(),
                            },
                        ])
                    }
                }
            })
            .await;

        match reclaimed {
            Ok(job) => {
                match &completion {
                    Some(completion) => self.log_completion(&job, completion),
                    None => info!(job_id = %job_id, "Requeued job stuck between claim and start"),
                }
                Ok(true)
            }
            Err(QueueError::InvalidState { .. })
            | Err(QueueError::JobNotFound(_))
            | Err(QueueError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn get_job(&self, job_id: &JobId) -> QueueResult<Option<Job>> {
        match self.store.get(&self.job_key(job_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn get_job_status(&self, job_id: &JobId) -> QueueResult<Option<JobSnapshot>> {
        Ok(self.get_job(job_id).await?.map(|job| job.snapshot()))
    }

    /// Cancel a job that no worker has picked up yet.
    pub async fn cancel_job(&self, job_id: &JobId) -> QueueResult<bool> {
        let now = self.clock.now();
        let retry = self.retry_key();
        let cancelled = self
            .update_job(job_id, |job| {
                expect_status(job, JobStatus::Queued)?;
                job.status = JobStatus::Failed;
                job.error = Some(CANCELLED_ERROR.to_string());
                job.next_retry_at = None;
                job.updated_at = now;
                // The FIFO entry, if any, is skipped by `dequeue`.
                Ok(vec![
                    WriteOp::ZRem {
                        set: retry.clone(),
                        member: job.job_id.to_string(),
                    },
                    self.release_claim(&job.job_id),
                ])
            })
            .await;

        match cancelled {
            Ok(_) => {
                info!(job_id = %job_id, "Job cancelled");
                Ok(true)
            }
            Err(QueueError::InvalidState { .. }) | Err(QueueError::JobNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Most recent dead letters still within their TTL, oldest first.
    pub async fn dead_letters(&self, limit: usize) -> QueueResult<Vec<DeadLetter>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.prune_dead_letters().await?;
        let ids = self.store.zrange_last(&self.dlq_key(), limit).await?;

        let mut entries = Vec::with_capacity(ids.len());
        for id in ids {
            let key = self.dead_letter_key(&JobId::from_string(id));
            if let Some(raw) = self.store.get(&key).await? {
                entries.push(serde_json::from_str(&raw)?);
            }
        }
        Ok(entries)
    }

    async fn prune_dead_letters(&self) -> QueueResult<()> {
        let cutoff = self.dlq_cutoff_ms(self.clock.now());
        let pruned = self.store.zrem_range_by_score(&self.dlq_key(), cutoff).await?;
        if pruned > 0 {
            debug!("Pruned {} expired dead letters", pruned);
        }
        Ok(())
    }

    pub async fn queue_len(&self) -> QueueResult<u64> {
        self.store.list_len(&self.queue_key()).await
    }

    pub async fn retry_len(&self) -> QueueResult<u64> {
        self.store.zcard(&self.retry_key()).await
    }

    /// Jobs currently claimed by a worker.
    pub async fn claimed_len(&self) -> QueueResult<u64> {
        self.store.zcard(&self.claims_key()).await
    }

    pub async fn dlq_len(&self) -> QueueResult<u64> {
        self.prune_dead_letters().await?;
        self.store.zcard(&self.dlq_key()).await
    }

    pub async fn ping(&self) -> QueueResult<()> {
        self.store.ping().await
    }

    /// Read-modify-write a job under compare-and-swap. `apply` mutates the
    /// job and returns the writes that must land atomically with it.
    async fn update_job<F>(&self, job_id: &JobId, mut apply: F) -> QueueResult<Job>
    where
        F: FnMut(&mut Job) -> QueueResult<Vec<WriteOp>> + Send,
    {
        let key = self.job_key(job_id);
        for _ in 0..MAX_CAS_RETRIES {
            let Some(current) = self.store.get(&key).await? else {
                return Err(QueueError::JobNotFound(job_id.clone()));
            };
            let mut job: Job = serde_json::from_str(&current)?;
            let ops = apply(&mut job)?;
            let updated = serde_json::to_string(&job)?;
            if self
                .store
                .compare_and_swap_with(&key, &current, &updated, self.config.job_ttl, &ops)
                .await?
            {
                return Ok(job);
            }
            debug!(job_id = %job_id, "Job changed concurrently, retrying update");
        }
        Err(QueueError::Conflict(job_id.clone()))
    }
}

fn expect_status(job: &Job, expected: JobStatus) -> QueueResult<()> {
    if job.status == expected {
        Ok(())
    } else {
        Err(QueueError::InvalidState {
            job_id: job.job_id.clone(),
            status: job.status,
            expected,
        })
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0))
}
