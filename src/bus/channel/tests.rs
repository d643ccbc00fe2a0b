use super::*;
use crate::test_utils::RecordingHandler;
use std::time::Duration;

#[tokio::test]
async fn test_channel_publish_no_receivers() {
    let log = ChannelEventLog::new();

    // Should not error even with no receivers
    let delivery = log.publish("orders", "k1", b"a".to_vec()).await.unwrap();
    assert_eq!(delivery, Delivery { partition: 0, offset: 0 });
}

#[tokio::test]
async fn test_offsets_are_per_topic() {
    let log = ChannelEventLog::new();

    log.publish("orders", "k1", b"a".to_vec()).await.unwrap();
    log.publish("orders", "k2", b"b".to_vec()).await.unwrap();
    let other = log.publish("audit", "k1", b"c".to_vec()).await.unwrap();

    assert_eq!(other.offset, 0);
    let orders = log.messages("orders").await;
    assert_eq!(orders.len(), 2);
    assert_eq!(orders[1].offset, 1);
    assert_eq!(orders[1].key, "k2");
    assert_eq!(orders[1].payload, b"b".to_vec());
    assert!(log.messages("missing").await.is_empty());
}

#[tokio::test]
async fn test_channel_subscribe_and_receive() {
    let log = ChannelEventLog::new();

    let handler = RecordingHandler::new();
    let count = handler.count();
    log.subscribe(Box::new(handler.clone())).await.unwrap();
    log.start_consuming().await.unwrap();

    log.publish("orders", "k1", b"a".to_vec()).await.unwrap();
    log.publish("orders", "k1", b"b".to_vec()).await.unwrap();

    // Give handler time to process
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(count.load(Ordering::SeqCst), 2);
    let received = handler.messages().await;
    assert_eq!(received[0].offset, 0);
    assert_eq!(received[1].offset, 1);
}

#[tokio::test]
async fn test_start_consuming_twice_is_noop() {
    let log = ChannelEventLog::new();
    let handler = RecordingHandler::new();
    let count = handler.count();
    log.subscribe(Box::new(handler)).await.unwrap();

    log.start_consuming().await.unwrap();
    log.start_consuming().await.unwrap();

    log.publish("orders", "k1", b"a".to_vec()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_fail_next_is_transient_and_counted() {
    let log = ChannelEventLog::new();
    log.fail_next(2);

    let first = log.publish("orders", "k", b"a".to_vec()).await;
    let second = log.publish("orders", "k", b"a".to_vec()).await;
    let third = log.publish("orders", "k", b"a".to_vec()).await;

    assert!(matches!(first, Err(BusError::Publish(_))));
    assert!(second.unwrap_err().is_transient());
    assert_eq!(third.unwrap().offset, 0);
    assert_eq!(log.publish_attempts(), 3);
    assert_eq!(log.messages("orders").await.len(), 1);
}

#[tokio::test]
async fn test_reject_next_is_permanent() {
    let log = ChannelEventLog::new();
    log.reject_next(1);

    let err = log.publish("orders", "k", b"a".to_vec()).await.unwrap_err();
    assert!(matches!(err, BusError::Rejected(_)));
    assert!(!err.is_transient());
    assert!(log.publish("orders", "k", b"a".to_vec()).await.is_ok());
}

#[tokio::test]
async fn test_unavailable_until_cleared() {
    let log = ChannelEventLog::new();
    log.set_unavailable(true);

    for _ in 0..3 {
        assert!(matches!(
            log.publish("orders", "k", b"a".to_vec()).await,
            Err(BusError::Unavailable(_))
        ));
    }

    log.set_unavailable(false);
    assert!(log.publish("orders", "k", b"a".to_vec()).await.is_ok());
    assert_eq!(log.messages("orders").await.len(), 1);
}

#[tokio::test]
async fn test_failed_message_is_redelivered_after_sink_recovers() {
    use crate::idempotency::{IdempotencyConfig, IdempotencyGuard};
    use crate::model::EventEnvelope;
    use crate::sync::SyncHandler;
    use crate::test_utils::{sample_record, CountingSink};

    let log = ChannelEventLog::new();
    let sink = Arc::new(CountingSink::new());
    let guard = Arc::new(IdempotencyGuard::new(&IdempotencyConfig::default()));
    let handler = SyncHandler::new(sink.clone(), guard);
    log.subscribe(Box::new(handler.clone())).await.unwrap();
    log.start_consuming().await.unwrap();

    sink.set_fail(true);
    let envelope = EventEnvelope {
        sequence: 1,
        partition: 0,
        record_id: "r-1".to_string(),
        record: sample_record("r-1"),
    };
    log.publish("carga_topic", "r-1", envelope.encode().unwrap())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sink.applied_count().await, 0);

    sink.set_fail(false);
    for _ in 0..50 {
        if sink.applied_count().await == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert_eq!(sink.applied_count().await, 1);
    assert_eq!(handler.applied(), 1);
}

#[tokio::test]
async fn test_redelivery_preserves_order() {
    use futures::future::BoxFuture;

    /// Fails the first delivery of offset 0, records everything else.
    struct FlakyFirst {
        failed_once: Arc<AtomicBool>,
        inner: RecordingHandler,
    }

    impl EventHandler for FlakyFirst {
        fn handle(&self, message: Arc<EventMessage>) -> BoxFuture<'static, Result<()>> {
            if message.offset == 0 && !self.failed_once.swap(true, Ordering::SeqCst) {
                return Box::pin(async { Err(BusError::Unavailable("not yet".to_string())) });
            }
            self.inner.handle(message)
        }
    }

    let log = ChannelEventLog::new();
    let recorder = RecordingHandler::new();
    log.subscribe(Box::new(FlakyFirst {
        failed_once: Arc::new(AtomicBool::new(false)),
        inner: recorder.clone(),
    }))
    .await
    .unwrap();
    log.start_consuming().await.unwrap();

    log.publish("orders", "k1", b"a".to_vec()).await.unwrap();
    log.publish("orders", "k1", b"b".to_vec()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    let offsets: Vec<i64> = recorder.messages().await.iter().map(|m| m.offset).collect();
    assert_eq!(offsets, vec![0, 1]);
}
