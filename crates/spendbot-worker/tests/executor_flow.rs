//! End-to-end worker flow against the in-memory store.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use spendbot_models::{JobId, JobKind, JobStatus, ManualClock};
use spendbot_queue::{JobQueue, MemoryStore, QueueConfig};
use spendbot_storage::LocalResultStore;
use spendbot_worker::{
    CircuitBreaker, CircuitBreakerConfig, HandlerRegistry, JobExecutor, JobProcessor, Provider,
    ProviderError, ProviderRequest, WorkerConfig,
};

/// Fails the first `failures` calls with a server error, then succeeds.
struct FlakyProvider {
    failures: Mutex<VecDeque<ProviderError>>,
    calls: AtomicUsize,
}

impl FlakyProvider {
    fn new(failures: usize) -> Arc<Self> {
        let errors = (0..failures)
            .map(|_| ProviderError::Server {
                status: 502,
                message: "bad gateway".to_string(),
            })
            .collect();
        Arc::new(Self {
            failures: Mutex::new(errors),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Provider for FlakyProvider {
    async fn call(&self, request: &ProviderRequest) -> Result<Value, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(json!({"category": "groceries", "echo": request.input}))
    }
}

struct Setup {
    clock: Arc<ManualClock>,
    queue: Arc<JobQueue>,
    executor: Arc<JobExecutor>,
    provider: Arc<FlakyProvider>,
    _results: tempfile::TempDir,
}

fn setup(provider_failures: usize, concurrency: usize) -> Setup {
    let clock = Arc::new(ManualClock::at_epoch());
    let store = Arc::new(MemoryStore::with_clock(clock.clone()));
    let queue_config = QueueConfig {
        // Zero backoff keeps retries due under the frozen clock.
        backoff_schedule: vec![Duration::ZERO],
        dequeue_timeout: Duration::from_millis(20),
        ..QueueConfig::default()
    };
    let queue = Arc::new(JobQueue::new(queue_config, store, clock.clone()));
    let breaker = Arc::new(CircuitBreaker::new(
        "provider",
        CircuitBreakerConfig::default(),
        clock.clone(),
    ));

    let provider = FlakyProvider::new(provider_failures);
    let results = tempfile::tempdir().unwrap();
    let processor = JobProcessor::new(
        queue.clone(),
        breaker,
        HandlerRegistry::with_provider(provider.clone()),
    )
    .with_result_store(Arc::new(LocalResultStore::new(results.path())));

    let config = WorkerConfig {
        concurrency,
        retry_poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    };
    Setup {
        clock,
        queue,
        executor: Arc::new(JobExecutor::new(config, Arc::new(processor))),
        provider,
        _results: results,
    }
}

async fn wait_for_terminal(queue: &JobQueue, ids: &[JobId]) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut done = 0;
            for id in ids {
                let job = queue.get_job(id).await.unwrap().unwrap();
                if job.is_terminal() {
                    done += 1;
                }
            }
            if done == ids.len() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("jobs did not finish in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn executor_processes_and_retries_jobs() {
    let s = setup(2, 3);
    let mut ids = Vec::new();
    for i in 0..6 {
        let id = s
            .queue
            .enqueue(
                JobKind::Categorize,
                json!({"text": format!("item {}", i)}),
                "u1",
                &format!("key-{}", i),
            )
            .await
            .unwrap();
        ids.push(id);
    }

    let executor = s.executor.clone();
    let run = tokio::spawn(async move { executor.run().await });

    wait_for_terminal(&s.queue, &ids).await;
    s.executor.shutdown();
    run.await.unwrap().unwrap();

    for id in &ids {
        let job = s.queue.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert!(job.result_ref.is_some());
        assert!(job.attempts >= 1 && job.attempts <= 3);
    }
    // Two failed calls were retried, so six jobs took eight calls.
    assert_eq!(s.provider.calls.load(Ordering::SeqCst), 8);
    assert_eq!(s.queue.dlq_len().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn persistent_failure_ends_in_dlq() {
    let s = setup(100, 1);
    let id = s
        .queue
        .enqueue(JobKind::Categorize, json!({"text": "rent"}), "u1", "k1")
        .await
        .unwrap();

    let executor = s.executor.clone();
    let run = tokio::spawn(async move { executor.run().await });

    wait_for_terminal(&s.queue, std::slice::from_ref(&id)).await;
    s.executor.shutdown();
    run.await.unwrap().unwrap();

    let job = s.queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempts, 3);
    assert_eq!(s.provider.calls.load(Ordering::SeqCst), 3);

    let dead = s.queue.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempts, 3);
}

#[tokio::test]
async fn shutdown_before_work_returns_promptly() {
    let s = setup(0, 2);
    s.executor.shutdown();
    tokio::time::timeout(Duration::from_secs(2), s.executor.run())
        .await
        .expect("executor should stop")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn scheduler_recovers_job_from_a_lost_worker() {
    let s = setup(0, 1);
    let id = s
        .queue
        .enqueue(JobKind::Categorize, json!({"text": "coffee"}), "u1", "k1")
        .await
        .unwrap();

    // A worker claims the job and dies before recording an outcome.
    let lost = s.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(lost.job_id, id);
    s.clock.advance_secs(s.queue.config().visibility_timeout.as_secs() as i64);

    let executor = s.executor.clone();
    let run = tokio::spawn(async move { executor.run().await });

    wait_for_terminal(&s.queue, std::slice::from_ref(&id)).await;
    s.executor.shutdown();
    run.await.unwrap().unwrap();

    let job = s.queue.get_job(&id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.attempts, 2);
    assert_eq!(s.provider.calls.load(Ordering::SeqCst), 1);
    assert_eq!(s.queue.claimed_len().await.unwrap(), 0);
}
