#![allow(clippy::unwrap_used)]

//! Integration tests for the **command queue** against the in-memory
//! broker.
//!
//! ## Key properties verified
//!
//! - **At-most-one in flight:** concurrent claimants never receive the
//!   same command id.
//! - **Ordering:** pending commands drain by (priority asc, created-at
//!   asc).
//! - **Leases:** expired leases are recycled by the reaper path and the
//!   original claim token stops working.
//! - **Result submission:** idempotence and the NOT_FOUND / INVALID_CLAIM
//!   / ALREADY_COMPLETED taxonomy.
//! - **Notifications:** control-channel events carry the originating
//!   correlation id.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use fleet_gateway::broker::{Broker, MemoryBroker};
use fleet_gateway::queue::{CommandQueue, CommandResult, QueueError};
use fleet_gateway::trace::CorrelationId;
use time::OffsetDateTime;

fn queue() -> (CommandQueue, Arc<MemoryBroker>) {
    let broker = Arc::new(MemoryBroker::new());
    (
        CommandQueue::new(Arc::clone(&broker) as Arc<dyn Broker>),
        broker,
    )
}

async fn enqueue(queue: &CommandQueue, device: &str, priority: i64) -> String {
    queue
        .enqueue(device, "tenant-1", "diagnostic", serde_json::json!({}), priority, CorrelationId::new())
        .await
        .unwrap()
        .id
}

#[tokio::test(flavor = "multi_thread")]
async fn contended_claims_are_disjoint() {
    let (queue, _broker) = queue();

    let c1 = enqueue(&queue, "d1", 1).await;
    let c2 = enqueue(&queue, "d1", 1).await;
    let c3 = enqueue(&queue, "d1", 2).await;

    let (a, b) = tokio::join!(
        {
            let queue = queue.clone();
            async move { queue.claim("d1", 2, 60_000).await.unwrap() }
        },
        {
            let queue = queue.clone();
            async move { queue.claim("d1", 2, 60_000).await.unwrap() }
        },
    );

    let ids_a: HashSet<String> = a.iter().map(|claim| claim.record.id.clone()).collect();
    let ids_b: HashSet<String> = b.iter().map(|claim| claim.record.id.clone()).collect();

    // No command id appears in both responses.
    assert!(ids_a.is_disjoint(&ids_b));

    let mut all: Vec<String> = ids_a.union(&ids_b).cloned().collect();
    all.sort();
    let mut expected = vec![c1.clone(), c2.clone(), c3.clone()];
    expected.sort();
    assert_eq!(all, expected);

    // Equal-priority FIFO: whichever claim ran first got [c1, c2].
    let winner = if a.len() == 2 { &a } else { &b };
    let winner_ids: Vec<&str> = winner.iter().map(|claim| claim.record.id.as_str()).collect();
    assert_eq!(winner_ids, vec![c1.as_str(), c2.as_str()]);
}

#[tokio::test]
async fn expired_lease_is_recycled_and_old_token_rejected() {
    let (queue, _broker) = queue();

    let c4 = enqueue(&queue, "d1", 1).await;

    let claimed = queue.claim("d1", 1, 60_000).await.unwrap();
    assert_eq!(claimed.len(), 1);
    let original_token = claimed[0].claim_token.clone();

    // Nothing to recycle before the deadline.
    let recycled = queue.requeue_expired(OffsetDateTime::now_utc()).await.unwrap();
    assert_eq!(recycled, 0);

    // 61 seconds later the reaper pass recycles the lease.
    let recycled = queue
        .requeue_expired(OffsetDateTime::now_utc() + Duration::from_millis(61_000))
        .await
        .unwrap();
    assert_eq!(recycled, 1);

    let reclaimed = queue.claim("d1", 1, 60_000).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].record.id, c4);
    assert_ne!(reclaimed[0].claim_token, original_token);

    let result = queue
        .submit_result(&c4, &original_token, "d1", CommandResult::success("late"), CorrelationId::new())
        .await;
    assert!(matches!(result, Err(QueueError::InvalidClaim)));

    let record = queue
        .submit_result(&c4, &reclaimed[0].claim_token, "d1", CommandResult::success("done"), CorrelationId::new())
        .await
        .unwrap();
    assert_eq!(record.result.as_ref().unwrap().output.as_deref(), Some("done"));
}

#[tokio::test]
async fn submit_result_taxonomy() {
    let (queue, _broker) = queue();

    let c1 = enqueue(&queue, "d1", 1).await;
    let claimed = queue.claim("d1", 1, 60_000).await.unwrap();
    let token = claimed[0].claim_token.clone();

    let missing = queue
        .submit_result("cmd_ffffffffffffffffffffffffffffffff", &token, "d1", CommandResult::success(""), CorrelationId::new())
        .await;
    assert!(matches!(missing, Err(QueueError::NotFound)));

    // A leaked token presented by another device reads as nonexistent.
    let foreign = queue
        .submit_result(&c1, &token, "d2", CommandResult::success(""), CorrelationId::new())
        .await;
    assert!(matches!(foreign, Err(QueueError::NotFound)));

    let bad_token = queue
        .submit_result(&c1, "bogus", "d1", CommandResult::success(""), CorrelationId::new())
        .await;
    assert!(matches!(bad_token, Err(QueueError::InvalidClaim)));

    queue
        .submit_result(&c1, &token, "d1", CommandResult::failure("exit 1"), CorrelationId::new())
        .await
        .unwrap();

    let again = queue
        .submit_result(&c1, &token, "d1", CommandResult::failure("exit 1"), CorrelationId::new())
        .await;
    assert!(matches!(again, Err(QueueError::AlreadyCompleted)));
}

#[tokio::test]
async fn notifications_carry_the_correlation_id() {
    let (queue, broker) = queue();

    let mut control = broker.subscribe("device:d1:control").await.unwrap();
    let mut updates = broker.subscribe("device:d1:updates").await.unwrap();

    let correlation_id = CorrelationId::new();

    let record = queue
        .enqueue("d1", "tenant-1", "diagnostic", serde_json::json!({}), 1, correlation_id)
        .await
        .unwrap();

    let notification = control.recv().await.unwrap();
    assert_eq!(notification["type"], "new_command");
    assert_eq!(notification["commandId"], record.id.as_str());
    assert_eq!(notification["requestId"], correlation_id.as_uuid().to_string().as_str());

    let claimed = queue.claim("d1", 1, 60_000).await.unwrap();
    queue
        .submit_result(&record.id, &claimed[0].claim_token, "d1", CommandResult::success("ok"), correlation_id)
        .await
        .unwrap();

    let event = updates.recv().await.unwrap();
    assert_eq!(event["type"], "command_completed");
    assert_eq!(event["requestId"], correlation_id.as_uuid().to_string().as_str());
}

#[tokio::test]
async fn result_output_is_sanitized_before_publication() {
    let (queue, broker) = queue();

    let c1 = enqueue(&queue, "d1", 1).await;
    let mut updates = broker.subscribe("device:d1:updates").await.unwrap();

    let claimed = queue.claim("d1", 1, 60_000).await.unwrap();

    queue
        .submit_result(
            &c1,
            &claimed[0].claim_token,
            "d1",
            CommandResult::success("reached 8.8.8.8 from 192.168.1.1, contact ops@example.com"),
            CorrelationId::new(),
        )
        .await
        .unwrap();

    let event = updates.recv().await.unwrap();
    let output = event["result"]["output"].as_str().unwrap();

    assert!(output.contains("<IP_REDACTED>"));
    assert!(output.contains("192.168.*.*"));
    assert!(output.contains("<EMAIL_REDACTED>"));
    assert!(!output.contains("8.8.8.8"));
    assert!(!output.contains("ops@example.com"));
}
