use std::time::Duration;

use super::*;
use crate::model::partition_for;
use crate::test_utils::{memory_store, sample_record};

fn claim(owner: &str) -> LeaseClaim {
    LeaseClaim::new(owner, Duration::from_secs(30))
}

fn entry_for(record_id: &str, partition: u32) -> NewOutboxEntry {
    NewOutboxEntry {
        partition,
        record_id: record_id.to_string(),
        payload: serde_json::to_vec(&sample_record(record_id)).unwrap(),
    }
}

#[tokio::test]
async fn test_append_assigns_increasing_sequences() {
    let store = memory_store().await;

    let first = store.append(entry_for("a", 0)).await.unwrap();
    let second = store.append(entry_for("b", 1)).await.unwrap();
    let third = store.append(entry_for("c", 0)).await.unwrap();

    assert!(first < second);
    assert!(second < third);
    assert_eq!(store.count_entries(None).await.unwrap(), 3);
    assert_eq!(
        store
            .count_entries(Some(OutboxStatus::Pending))
            .await
            .unwrap(),
        3
    );
}

#[tokio::test]
async fn test_write_atomic_commits_record_and_entry() {
    let store = memory_store().await;
    let record = sample_record("order-1");
    let entry = NewOutboxEntry::for_record(&record, 4).unwrap();

    let sequence = store
        .write_atomic(&record, entry, WriteMode::Reject)
        .await
        .unwrap();

    let stored = store.get_record("order-1").await.unwrap().unwrap();
    assert_eq!(stored, record);

    let entry = store.get_entry(sequence).await.unwrap().unwrap();
    assert_eq!(entry.record_id, "order-1");
    assert_eq!(entry.partition, partition_for("order-1", 4));
    assert_eq!(entry.status, OutboxStatus::Pending);
    assert_eq!(entry.attempts, 0);
    assert!(entry.last_attempt_at.is_none());

    let snapshot: Record = serde_json::from_slice(&entry.payload).unwrap();
    assert_eq!(snapshot, record);
}

#[tokio::test]
async fn test_write_atomic_rejects_duplicate_without_second_entry() {
    let store = memory_store().await;
    let record = sample_record("dup");

    store
        .write_atomic(
            &record,
            NewOutboxEntry::for_record(&record, 1).unwrap(),
            WriteMode::Reject,
        )
        .await
        .unwrap();

    let result = store
        .write_atomic(
            &record,
            NewOutboxEntry::for_record(&record, 1).unwrap(),
            WriteMode::Reject,
        )
        .await;

    assert!(matches!(result, Err(StorageError::Duplicate { ref id }) if id == "dup"));
    assert_eq!(store.count_records().await.unwrap(), 1);
    assert_eq!(store.count_entries(None).await.unwrap(), 1);
}

#[tokio::test]
async fn test_write_atomic_overwrite_appends_new_entry() {
    let store = memory_store().await;
    let first = sample_record("k");
    let mut second = sample_record("k");
    second.value = serde_json::json!({"valor": "updated"});

    let s1 = store
        .write_atomic(
            &first,
            NewOutboxEntry::for_record(&first, 1).unwrap(),
            WriteMode::Overwrite,
        )
        .await
        .unwrap();
    let s2 = store
        .write_atomic(
            &second,
            NewOutboxEntry::for_record(&second, 1).unwrap(),
            WriteMode::Overwrite,
        )
        .await
        .unwrap();

    assert!(s2 > s1);
    assert_eq!(store.count_records().await.unwrap(), 1);
    assert_eq!(store.count_entries(None).await.unwrap(), 2);
    let stored = store.get_record("k").await.unwrap().unwrap();
    assert_eq!(stored.value, serde_json::json!({"valor": "updated"}));
}

#[tokio::test]
async fn test_injected_failure_after_record_rolls_back() {
    let store = memory_store().await;
    let record = sample_record("half");
    store.faults().arm(FailPoint::AfterRecordUpsert);

    let result = store
        .write_atomic(
            &record,
            NewOutboxEntry::for_record(&record, 1).unwrap(),
            WriteMode::Reject,
        )
        .await;

    assert!(matches!(
        result,
        Err(StorageError::Injected(FailPoint::AfterRecordUpsert))
    ));
    assert!(store.get_record("half").await.unwrap().is_none());
    assert_eq!(store.count_entries(None).await.unwrap(), 0);
}

#[tokio::test]
async fn test_injected_failure_before_commit_rolls_back() {
    let store = memory_store().await;
    let record = sample_record("late");
    store.faults().arm(FailPoint::AfterOutboxAppend);

    let result = store
        .write_atomic(
            &record,
            NewOutboxEntry::for_record(&record, 1).unwrap(),
            WriteMode::Reject,
        )
        .await;

    assert!(matches!(
        result,
        Err(StorageError::Injected(FailPoint::AfterOutboxAppend))
    ));
    assert_eq!(store.count_records().await.unwrap(), 0);
    assert_eq!(store.count_entries(None).await.unwrap(), 0);

    // Same id succeeds once the fault has fired.
    store
        .write_atomic(
            &record,
            NewOutboxEntry::for_record(&record, 1).unwrap(),
            WriteMode::Reject,
        )
        .await
        .unwrap();
    assert_eq!(store.count_records().await.unwrap(), 1);
}

#[tokio::test]
async fn test_fetch_pending_orders_by_sequence_within_partition() {
    let store = memory_store().await;
    let mut expected = Vec::new();
    for i in 0..5 {
        expected.push(store.append(entry_for(&format!("p0-{}", i), 0)).await.unwrap());
        store.append(entry_for(&format!("p1-{}", i), 1)).await.unwrap();
    }

    let batch = store
        .fetch_pending(0, 10, &claim("w1"))
        .await
        .unwrap()
        .unwrap();

    let sequences: Vec<i64> = batch.entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, expected);
    assert!(batch.entries.iter().all(|e| e.partition == 0));
    assert_eq!(batch.lease.partition, 0);
    assert_eq!(batch.lease.owner, "w1");
}

#[tokio::test]
async fn test_fetch_pending_respects_limit_and_skips_published() {
    let store = memory_store().await;
    let first = store.append(entry_for("a", 0)).await.unwrap();
    let second = store.append(entry_for("b", 0)).await.unwrap();
    let third = store.append(entry_for("c", 0)).await.unwrap();

    let batch = store.fetch_pending(0, 1, &claim("w1")).await.unwrap().unwrap();
    assert_eq!(batch.entries.len(), 1);
    assert_eq!(batch.entries[0].sequence, first);

    store.mark_published(first, &batch.lease).await.unwrap();

    let batch = store.fetch_pending(0, 10, &claim("w1")).await.unwrap().unwrap();
    let sequences: Vec<i64> = batch.entries.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![second, third]);
}

#[tokio::test]
async fn test_lease_excludes_other_workers() {
    let store = memory_store().await;
    store.append(entry_for("a", 3)).await.unwrap();

    let held = store.fetch_pending(3, 10, &claim("w1")).await.unwrap();
    assert!(held.is_some());

    let contended = store.fetch_pending(3, 10, &claim("w2")).await.unwrap();
    assert!(contended.is_none(), "second worker must not see leased entries");

    // Owner renews its own lease.
    let renewed = store.fetch_pending(3, 10, &claim("w1")).await.unwrap();
    assert_eq!(renewed.unwrap().entries.len(), 1);

    // Other partitions are unaffected.
    assert!(store
        .fetch_pending(4, 10, &claim("w2"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_expired_lease_can_be_taken_over() {
    let store = memory_store().await;
    let sequence = store.append(entry_for("a", 0)).await.unwrap();

    let short = LeaseClaim::new("crashed", Duration::from_millis(50));
    let stale = store.fetch_pending(0, 10, &short).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;

    let batch = store
        .fetch_pending(0, 10, &claim("rescuer"))
        .await
        .unwrap()
        .expect("expired lease should be re-leasable");
    assert_eq!(batch.entries[0].sequence, sequence);

    // The crashed worker's lease no longer authorizes publication.
    let result = store.mark_published(sequence, &stale.lease).await;
    assert!(matches!(
        result,
        Err(StorageError::LeaseExpired { partition: 0 })
    ));

    assert_eq!(
        store.mark_published(sequence, &batch.lease).await.unwrap(),
        MarkOutcome::Published
    );
}

#[tokio::test]
async fn test_mark_published_is_idempotent() {
    let store = memory_store().await;
    let sequence = store.append(entry_for("a", 0)).await.unwrap();
    let batch = store.fetch_pending(0, 10, &claim("w1")).await.unwrap().unwrap();

    assert_eq!(
        store.mark_published(sequence, &batch.lease).await.unwrap(),
        MarkOutcome::Published
    );
    assert_eq!(
        store.mark_published(sequence, &batch.lease).await.unwrap(),
        MarkOutcome::AlreadyPublished
    );

    // Even without a live lease, a published entry is a no-op.
    store.release_lease(&batch.lease).await.unwrap();
    assert_eq!(
        store.mark_published(sequence, &batch.lease).await.unwrap(),
        MarkOutcome::AlreadyPublished
    );

    let entry = store.get_entry(sequence).await.unwrap().unwrap();
    assert_eq!(entry.status, OutboxStatus::Published);
    assert_eq!(
        store
            .count_entries(Some(OutboxStatus::Published))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_mark_published_unknown_sequence() {
    let store = memory_store().await;
    let batch = store.fetch_pending(0, 10, &claim("w1")).await.unwrap().unwrap();

    let result = store.mark_published(999, &batch.lease).await;
    assert!(matches!(result, Err(StorageError::EntryNotFound(999))));
}

#[tokio::test]
async fn test_record_attempt_accumulates() {
    let store = memory_store().await;
    let sequence = store.append(entry_for("a", 0)).await.unwrap();

    store.record_attempt(sequence, 2).await.unwrap();
    store.record_attempt(sequence, 1).await.unwrap();

    let entry = store.get_entry(sequence).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 3);
    assert!(entry.last_attempt_at.is_some());
    assert_eq!(entry.status, OutboxStatus::Pending);

    assert!(matches!(
        store.record_attempt(12345, 1).await,
        Err(StorageError::EntryNotFound(12345))
    ));
}

#[tokio::test]
async fn test_release_lease_hands_partition_over() {
    let store = memory_store().await;
    store.append(entry_for("a", 2)).await.unwrap();

    let batch = store.fetch_pending(2, 10, &claim("w1")).await.unwrap().unwrap();
    store.release_lease(&batch.lease).await.unwrap();

    assert!(store
        .fetch_pending(2, 10, &claim("w2"))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_pending_partitions() {
    let store = memory_store().await;
    let s = store.append(entry_for("a", 5)).await.unwrap();
    store.append(entry_for("b", 2)).await.unwrap();
    store.append(entry_for("c", 5)).await.unwrap();

    assert_eq!(store.pending_partitions().await.unwrap(), vec![2, 5]);

    let batch = store.fetch_pending(2, 10, &claim("w1")).await.unwrap().unwrap();
    for entry in &batch.entries {
        store.mark_published(entry.sequence, &batch.lease).await.unwrap();
    }
    assert_eq!(store.pending_partitions().await.unwrap(), vec![5]);
    assert!(store.get_entry(s).await.unwrap().is_some());
}

#[tokio::test]
async fn test_record_sink_apply_is_idempotent() {
    let store = memory_store().await;
    let record = sample_record("replica-1");

    store.apply(&record).await.unwrap();
    store.apply(&record).await.unwrap();

    assert_eq!(store.count_records().await.unwrap(), 1);
    assert_eq!(store.count_entries(None).await.unwrap(), 0);
    assert_eq!(store.get_record("replica-1").await.unwrap().unwrap(), record);
}

#[tokio::test]
async fn test_renew_lease_extends_live_lease() {
    let store = memory_store().await;
    store.append(entry_for("a", 0)).await.unwrap();

    let short = LeaseClaim::new("w1", Duration::from_millis(50));
    let batch = store.fetch_pending(0, 10, &short).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    let renewed = store
        .renew_lease(&batch.lease, Duration::from_secs(30))
        .await
        .unwrap()
        .expect("live lease should renew");
    assert!(renewed.expires_at > batch.lease.expires_at);

    // Past the original expiry the renewed lease still excludes others.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store
        .fetch_pending(0, 10, &claim("w2"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_renew_lease_never_revives_expired_lease() {
    let store = memory_store().await;
    store.append(entry_for("a", 0)).await.unwrap();

    let short = LeaseClaim::new("w1", Duration::from_millis(20));
    let batch = store.fetch_pending(0, 10, &short).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(store
        .renew_lease(&batch.lease, Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_renew_lease_fails_after_takeover() {
    let store = memory_store().await;
    store.append(entry_for("a", 0)).await.unwrap();

    let short = LeaseClaim::new("w1", Duration::from_millis(20));
    let stale = store.fetch_pending(0, 10, &short).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let taken = store.fetch_pending(0, 10, &claim("w2")).await.unwrap().unwrap();

    assert!(store
        .renew_lease(&stale.lease, Duration::from_secs(30))
        .await
        .unwrap()
        .is_none());
    assert!(store
        .renew_lease(&taken.lease, Duration::from_secs(30))
        .await
        .unwrap()
        .is_some());
}
