//! Redis work queue integration tests.
//!
//! Run with `cargo test -- --ignored` against a local Redis (`REDIS_URL`).

use std::time::Duration;

use squish_models::JobId;
use squish_queue::{Priority, QueueConfig, RedisQueue, Redelivery, WorkQueue};

fn test_queue(max_attempts: u32) -> RedisQueue {
    let config = QueueConfig {
        prefix: format!("squish-test:{}", JobId::new()),
        ..QueueConfig::from_env()
    }
    .with_max_attempts(max_attempts)
    .with_visibility_timeout(Duration::from_millis(200));
    RedisQueue::new(config).expect("redis client")
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_lease_order_and_ack() {
    let q = test_queue(3);
    let low = JobId::new();
    let high = JobId::new();
    q.enqueue(&low, Priority::new(1).unwrap()).await.unwrap();
    q.enqueue(&high, Priority::new(9).unwrap()).await.unwrap();
    assert!(!q.enqueue(&high, Priority::new(9).unwrap()).await.unwrap());

    assert_eq!(q.position(&high).await.unwrap(), Some(0));

    let leases = q.lease("w1", 2).await.unwrap();
    assert_eq!(leases[0].job_id, high);
    assert_eq!(leases[1].job_id, low);

    for lease in &leases {
        assert!(q.ack(lease).await.unwrap());
    }
    let stats = q.stats().await.unwrap();
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.active, 0);
}

#[tokio::test]
#[ignore = "requires Redis"]
async fn test_redis_expiry_and_dead_letter() {
    let q = test_queue(1);
    let id = JobId::new();
    q.enqueue(&id, Priority::default()).await.unwrap();
    let lease = q.lease("w1", 1).await.unwrap().remove(0);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let released = q.reclaim_expired().await.unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].outcome, Redelivery::DeadLettered { attempts: 1 });
    assert!(!q.ack(&lease).await.unwrap());
    assert_eq!(q.stats().await.unwrap().failed, 1);
}
