//! carga-relay: outbox relay workers
//!
//! Drains the outbox of the primary SQLite database into the configured
//! event log. Several processes may point at the same database; partition
//! leases keep each partition with one worker at a time.
//!
//! ## Configuration
//! - First argument or CARGA_CONFIG: YAML config file (optional)
//! - CARGA__RELAY__WORKERS: worker tasks in this process (default: 1)
//! - CARGA__STORAGE__PATH: primary database (default: ./data/carga.db)
//! - CARGA__MESSAGING__TYPE: channel | kafka

use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use carga::bus::{init_event_log, EventLogMode};
use carga::config::{Config, MessagingType};
use carga::relay::{spawn_workers, RelayAlert};
use carga::storage::init_storage;
use carga::utils::bootstrap::{connect_with_retry, init_tracing};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let mut config = Config::load(config_path.as_deref())?;
    config.relay.topic = config.messaging.topic.clone();

    let store = init_storage(&config.storage).await?;

    if config.messaging.messaging_type == MessagingType::Channel {
        warn!("Channel event log is in-process only; published entries leave no trace outside this process");
    }

    let log = connect_with_retry("event log", || {
        init_event_log(&config.messaging, EventLogMode::Publisher)
    })
    .await?;

    let handles = spawn_workers(store, log, config.relay.clone(), config.relay.workers);

    for handle in &handles {
        let worker_id = handle.relay().worker_id().to_string();
        let mut alerts = handle.relay().alerts();
        tokio::spawn(async move {
            loop {
                match alerts.recv().await {
                    Ok(alert) => report_alert(&alert),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(worker_id = %worker_id, missed, "Relay alerts dropped")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    info!(
        workers = handles.len(),
        topic = %config.relay.topic,
        lease_duration_ms = config.relay.lease_duration_ms,
        "carga-relay started"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, finishing in-flight batches");

    for handle in handles {
        handle.shutdown().await;
    }

    info!("carga-relay stopped");
    Ok(())
}

fn report_alert(alert: &RelayAlert) {
    error!(
        worker_id = %alert.worker_id,
        partition = alert.partition,
        sequence = alert.sequence,
        record_id = %alert.record_id,
        attempts = alert.attempts,
        error = %alert.error,
        "Partition stalled, operator attention required"
    );
}
