//! carga-sync: replica synchronization consumer
//!
//! Joins the Kafka consumer group for the outbox topic and upserts every
//! relayed record into a replica SQLite database. Redeliveries of the same
//! outbox entry are applied once.
//!
//! ## Configuration
//! - First argument or CARGA_CONFIG: YAML config file (optional)
//! - CARGA__SYNC__REPLICA_PATH: replica database (default: ./data/replica.db)
//! - CARGA__MESSAGING__KAFKA__GROUP_ID: consumer group (default: carga-sync)

use std::sync::Arc;

use tracing::info;

use carga::bus::{init_event_log, EventLogMode};
use carga::config::{Config, MessagingType, StorageConfig};
use carga::idempotency::IdempotencyGuard;
use carga::storage::init_storage;
use carga::sync::SyncHandler;
use carga::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    if config.messaging.messaging_type != MessagingType::Kafka {
        return Err("carga-sync consumes from Kafka; set messaging.type to kafka".into());
    }

    let replica = init_storage(&StorageConfig::file(config.sync.replica_path.clone())).await?;
    let guard = Arc::new(IdempotencyGuard::new(&config.idempotency));
    let handler = SyncHandler::new(replica, guard);

    let mode = EventLogMode::Subscriber {
        group_id: config.messaging.kafka.group_id.clone(),
    };
    let log = connect_with_retry("kafka", || {
        init_event_log(&config.messaging, mode.clone())
    })
    .await?;

    log.subscribe(Box::new(handler.clone())).await?;
    log.start_consuming().await?;

    info!(
        topic = %config.messaging.topic,
        group_id = %config.messaging.kafka.group_id,
        replica = %config.sync.replica_path,
        "carga-sync started"
    );

    tokio::signal::ctrl_c().await?;

    info!(
        applied = handler.applied(),
        skipped = handler.skipped(),
        "carga-sync stopped"
    );
    Ok(())
}
