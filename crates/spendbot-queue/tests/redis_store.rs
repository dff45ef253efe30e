//! Redis-backed queue and limiter tests.
//!
//! Run with a local Redis: `cargo test -p spendbot-queue -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use spendbot_models::{JobKind, JobStatus, SystemClock};
use spendbot_queue::{
    Completion, DualScopeLimiter, JobQueue, QueueConfig, RateLimitConfig, RedisStore, SharedStore,
    Store, WriteOp,
};
use uuid::Uuid;

fn redis_store() -> Arc<RedisStore> {
    dotenvy::dotenv().ok();
    Arc::new(RedisStore::from_env().expect("Failed to create Redis store"))
}

/// Each test gets its own key prefix so runs never see each other's jobs.
fn test_queue(store: Arc<RedisStore>) -> JobQueue {
    let config = QueueConfig {
        key_prefix: format!("spendbot-test-{}", Uuid::new_v4()),
        backoff_schedule: vec![Duration::ZERO],
        dequeue_timeout: Duration::from_millis(200),
        ..QueueConfig::default()
    };
    JobQueue::new(config, store, SystemClock::shared())
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_ping() {
    let store = redis_store();
    store.ping().await.expect("Redis ping failed");
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_compare_and_swap() {
    let store = redis_store();
    let key = format!("spendbot-test:cas:{}", Uuid::new_v4());
    let ttl = Duration::from_secs(30);

    store.set_ex(&key, "a", ttl).await.unwrap();
    assert!(!store.compare_and_swap(&key, "x", "b", ttl).await.unwrap());
    assert!(store.compare_and_swap(&key, "a", "b", ttl).await.unwrap());
    assert_eq!(store.get(&key).await.unwrap().as_deref(), Some("b"));
    store.del(&key).await.unwrap();
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_compare_and_swap_applies_ops_atomically() {
    let store = redis_store();
    let ns = format!("spendbot-test:{}", Uuid::new_v4());
    let key = format!("{}:job", ns);
    let set = format!("{}:retry", ns);
    let list = format!("{}:queue", ns);
    let ttl = Duration::from_secs(30);
    let ops = [
        WriteOp::ZAdd {
            set: set.clone(),
            member: "job-1".into(),
            score: 10,
        },
        WriteOp::PushBack {
            list: list.clone(),
            value: "job-1".into(),
        },
        WriteOp::SetEx {
            key: format!("{}:extra", ns),
            value: "x".into(),
            ttl,
        },
    ];

    store.set_ex(&key, "a", ttl).await.unwrap();
    assert!(!store.compare_and_swap_with(&key, "x", "b", ttl, &ops).await.unwrap());
    assert_eq!(store.zcard(&set).await.unwrap(), 0);
    assert_eq!(store.list_len(&list).await.unwrap(), 0);

    assert!(store.compare_and_swap_with(&key, "a", "b", ttl, &ops).await.unwrap());
    assert_eq!(store.zrange_by_score(&set, 10, 10).await.unwrap(), vec!["job-1"]);
    assert_eq!(store.list_len(&list).await.unwrap(), 1);
    assert_eq!(store.get(&format!("{}:extra", ns)).await.unwrap().as_deref(), Some("x"));

    assert!(store.zmove_to_list(&set, "job-1", &list).await.unwrap());
    assert!(!store.zmove_to_list(&set, "job-1", &list).await.unwrap());
    assert_eq!(store.list_len(&list).await.unwrap(), 2);
    for k in [key, set, list, format!("{}:extra", ns)] {
        store.del(&k).await.unwrap();
    }
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_enqueue_is_idempotent() {
    let queue = test_queue(redis_store());
    let key = Uuid::new_v4().to_string();

    let first = queue
        .enqueue(JobKind::Analysis, json!({"month": "2024-01"}), "user-1", &key)
        .await
        .unwrap();
    let second = queue
        .enqueue(JobKind::Analysis, json!({"month": "2024-01"}), "user-1", &key)
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(queue.queue_len().await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_job_lifecycle_to_dlq() {
    let queue = test_queue(redis_store());
    let job_id = queue
        .enqueue(JobKind::Receipt, json!({"image_url": "https://x/r.png"}), "user-1", "k1")
        .await
        .unwrap();

    for attempt in 1..=queue.max_attempts() {
        queue.process_retry_queue().await.unwrap();
        let job = queue.dequeue().await.unwrap().expect("job should be ready");
        assert_eq!(job.job_id, job_id);
        assert_eq!(job.attempts, attempt);

        let outcome = queue
            .complete_job(&job_id, false, None, Some("boom".to_string()))
            .await
            .unwrap();
        if attempt < queue.max_attempts() {
            assert!(matches!(outcome, Completion::RetryScheduled { .. }));
        } else {
            assert_eq!(outcome, Completion::DeadLettered { attempts: attempt });
        }
    }

    let status = queue.get_job_status(&job_id).await.unwrap().unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(queue.dlq_len().await.unwrap(), 1);

    let dead = queue.dead_letters(10).await.unwrap();
    assert_eq!(dead[0].job.job_id, job_id);
    assert_eq!(dead[0].error, "boom");
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_blocking_dequeue_times_out() {
    let queue = test_queue(redis_store());
    let started = std::time::Instant::now();
    assert!(queue.dequeue().await.unwrap().is_none());
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_stale_claim_is_reclaimed() {
    let store = redis_store();
    let config = QueueConfig {
        key_prefix: format!("spendbot-test-{}", Uuid::new_v4()),
        backoff_schedule: vec![Duration::ZERO],
        dequeue_timeout: Duration::from_millis(200),
        visibility_timeout: Duration::from_secs(1),
        ..QueueConfig::default()
    };
    let queue = JobQueue::new(config, store, SystemClock::shared());
    let job_id = queue
        .enqueue(JobKind::Analysis, json!({"month": "2024-02"}), "user-1", "k1")
        .await
        .unwrap();
    queue.dequeue().await.unwrap().expect("job should be ready");
    assert_eq!(queue.claimed_len().await.unwrap(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(queue.reclaim_stale().await.unwrap(), 1);
    assert_eq!(queue.claimed_len().await.unwrap(), 0);

    queue.process_retry_queue().await.unwrap();
    let job = queue.dequeue().await.unwrap().expect("job should be retried");
    assert_eq!(job.job_id, job_id);
    assert_eq!(job.attempts, 2);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_dual_scope_limiter_shares_state() {
    let store: SharedStore = redis_store();
    let name = format!("test-{}", Uuid::new_v4());
    let make = || {
        DualScopeLimiter::with_configs(
            &name,
            RateLimitConfig::new(2, 60),
            RateLimitConfig::new(100, 60),
            store.clone(),
            SystemClock::shared(),
        )
    };

    // Two limiter instances stand in for two processes.
    let a = make();
    let b = make();
    assert!(a.allow("user-1").await.allowed);
    assert!(b.allow("user-1").await.allowed);

    let denied = a.allow("user-1").await;
    assert!(!denied.allowed);
    assert!(denied.retry_in_secs > 0 && denied.retry_in_secs <= 60);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_dual_scope_global_denial_keeps_user_slot() {
    let store: SharedStore = redis_store();
    let limiter = DualScopeLimiter::with_configs(
        &format!("test-{}", Uuid::new_v4()),
        RateLimitConfig::new(5, 60),
        RateLimitConfig::new(1, 60),
        store,
        SystemClock::shared(),
    );

    assert!(limiter.allow("user-1").await.allowed);
    assert!(!limiter.allow("user-2").await.allowed);
    assert_eq!(limiter.per_user().get_remaining("user-2").await, 5);
}
