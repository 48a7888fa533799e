//! Integration tests for the Redis backing store.
//!
//! These tests need a running Redis server.
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_backend -- --ignored

use std::time::Duration;

use applyflow::scheduler::{
    Job, JobKind, QueueBackend, QueueName, QueueSettings, RedisBackend, RetryDecision,
};
use applyflow::JobError;

async fn create_test_backend(prefix: &str) -> RedisBackend {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
    let backend = RedisBackend::connect(
        &url,
        prefix,
        QueueSettings::default_map(),
        Duration::from_secs(30),
    )
    .await
    .expect("Redis should be reachable for integration tests");
    for queue in QueueName::ALL {
        backend.clear(queue).await.expect("clear should succeed");
    }
    backend
}

fn create_test_job(name: &str) -> Job {
    Job::new("user-1", name, JobKind::Standard, serde_json::json!({"mode": "ok"}))
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_backend -- --ignored
async fn test_enqueue_dequeue_counts_attempts() {
    let backend = create_test_backend("applyflow-test-dequeue").await;
    let job = create_test_job("posting-1");
    let job_id = job.id;

    backend
        .enqueue(QueueName::High, job, Duration::ZERO)
        .await
        .expect("enqueue should succeed");
    assert_eq!(backend.counts(QueueName::High).await.unwrap().waiting, 1);

    let delivered = backend
        .dequeue(QueueName::High, Duration::from_secs(1))
        .await
        .expect("dequeue should succeed")
        .expect("job should be delivered");
    assert_eq!(delivered.id, job_id);
    assert_eq!(delivered.attempts(), 1);
    assert_eq!(delivered.metadata.origin_queue, Some(QueueName::High));

    let counts = backend.counts(QueueName::High).await.unwrap();
    assert_eq!(counts.waiting, 0);
    assert_eq!(counts.active, 1);
}

#[tokio::test]
#[ignore]
async fn test_fail_routes_to_retry_or_dead_letter() {
    let backend = create_test_backend("applyflow-test-fail").await;

    backend
        .enqueue(QueueName::Standard, create_test_job("posting-2"), Duration::ZERO)
        .await
        .unwrap();
    let job = backend
        .dequeue(QueueName::Standard, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let decision = backend
        .fail(QueueName::Standard, job, &JobError::TransientIo("timeout".into()))
        .await
        .unwrap();
    assert!(matches!(
        decision,
        RetryDecision::Retry {
            queue: QueueName::Retry,
            ..
        }
    ));
    assert_eq!(backend.counts(QueueName::Retry).await.unwrap().delayed, 1);

    backend
        .enqueue(QueueName::Standard, create_test_job("posting-3"), Duration::ZERO)
        .await
        .unwrap();
    let job = backend
        .dequeue(QueueName::Standard, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();
    let decision = backend
        .fail(QueueName::Standard, job, &JobError::Fatal("form changed".into()))
        .await
        .unwrap();
    assert_eq!(decision, RetryDecision::DeadLettered { attempts: 1 });

    let dead = backend.peek_dead_letter(QueueName::Standard, 10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert!(backend
        .peek_dead_letter(QueueName::Standard, 0)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(backend.counts(QueueName::Standard).await.unwrap().failed, 1);
}

#[tokio::test]
#[ignore]
async fn test_pause_blocks_delivery() {
    let backend = create_test_backend("applyflow-test-pause").await;
    backend
        .enqueue(QueueName::Immediate, create_test_job("posting-4"), Duration::ZERO)
        .await
        .unwrap();

    backend.pause(QueueName::Immediate).await.unwrap();
    assert!(backend.is_paused(QueueName::Immediate).await.unwrap());
    let delivered = backend
        .dequeue(QueueName::Immediate, Duration::from_millis(200))
        .await
        .unwrap();
    assert!(delivered.is_none());

    backend.resume(QueueName::Immediate).await.unwrap();
    let delivered = backend
        .dequeue(QueueName::Immediate, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(delivered.is_some());
}

#[tokio::test]
#[ignore]
async fn test_recover_requeues_active_jobs() {
    let backend = create_test_backend("applyflow-test-recover").await;
    backend
        .enqueue(QueueName::Standard, create_test_job("posting-5"), Duration::ZERO)
        .await
        .unwrap();
    let _abandoned = backend
        .dequeue(QueueName::Standard, Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    let recovered = backend.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let counts = backend.counts(QueueName::Standard).await.unwrap();
    assert_eq!(counts.active, 0);
    assert_eq!(counts.waiting, 1);
}
