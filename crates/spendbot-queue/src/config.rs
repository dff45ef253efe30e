//! Queue configuration.

use std::time::Duration;

/// Queue configuration.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Redis URL
    pub redis_url: String,
    /// Namespace for every key the queue writes
    pub key_prefix: String,
    /// Attempts before a job is dead-lettered
    pub max_attempts: u32,
    /// Retry delay per attempt; the last entry repeats
    pub backoff_schedule: Vec<Duration>,
    /// TTL of job metadata and idempotency mappings
    pub job_ttl: Duration,
    /// TTL of dead letter entries
    pub dlq_ttl: Duration,
    /// How long `dequeue` blocks before returning empty-handed
    pub dequeue_timeout: Duration,
    /// How long a claimed job may go without an update before
    /// `reclaim_stale` treats its worker as lost
    pub visibility_timeout: Duration,
    /// Max jobs moved per `process_retry_queue` call
    pub retry_batch_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            key_prefix: "spendbot".to_string(),
            max_attempts: 3,
            backoff_schedule: vec![
                Duration::from_secs(1),
                Duration::from_secs(5),
                Duration::from_secs(30),
            ],
            job_ttl: Duration::from_secs(24 * 3600),
            dlq_ttl: Duration::from_secs(7 * 24 * 3600),
            dequeue_timeout: Duration::from_secs(1),
            visibility_timeout: Duration::from_secs(300),
            retry_batch_size: 100,
        }
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: std::env::var("QUEUE_PREFIX").unwrap_or(defaults.key_prefix),
            max_attempts: std::env::var("QUEUE_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_attempts),
            backoff_schedule: std::env::var("QUEUE_BACKOFF_SECS")
                .ok()
                .and_then(|s| parse_backoff(&s))
                .unwrap_or(defaults.backoff_schedule),
            job_ttl: positive_env("QUEUE_JOB_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.job_ttl),
            dlq_ttl: positive_env("QUEUE_DLQ_TTL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.dlq_ttl),
            // Zero would make BLPOP-style waits block forever.
            dequeue_timeout: positive_env("QUEUE_DEQUEUE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dequeue_timeout),
            visibility_timeout: positive_env("QUEUE_VISIBILITY_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.visibility_timeout),
            retry_batch_size: defaults.retry_batch_size,
        }
    }

    /// Delay before the retry that follows `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        if self.backoff_schedule.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt.max(1) as usize - 1).min(self.backoff_schedule.len() - 1);
        self.backoff_schedule[idx]
    }
}

fn positive_env(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| parse_positive(&s))
}

fn parse_positive(raw: &str) -> Option<u64> {
    raw.trim().parse().ok().filter(|n: &u64| *n > 0)
}

/// Parse a comma-separated list of seconds, e.g. `"1,5,30"`.
fn parse_backoff(raw: &str) -> Option<Vec<Duration>> {
    let schedule: Option<Vec<Duration>> = raw
        .split(',')
        .map(|s| s.trim().parse::<u64>().ok().map(Duration::from_secs))
        .collect();
    schedule.filter(|s| !s.is_empty())
}
