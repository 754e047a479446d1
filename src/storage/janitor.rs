//! Expired-Row Janitor
//!
//! Reaps rows whose `expires_at` has passed, once per second across every
//! data table and `kv_meta`. The lazy liveness check in every read means
//! an expired row is never *visible* between ticks; the janitor only
//! reclaims the storage.

use crate::storage::{schema, Store};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Sweep interval.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the running janitor task. Stopping is idempotent; dropping
/// the handle stops the task too.
#[derive(Debug)]
pub struct Janitor {
    shutdown_tx: watch::Sender<bool>,
}

impl Janitor {
    pub fn start(store: Store) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweep_loop(store, shutdown_rx));
        info!("storage janitor started");
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweep_loop(store: Store, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("storage janitor stopped");
                    return;
                }
            }
        }

        match sweep_once(&store).await {
            Ok(reaped) if reaped > 0 => debug!(reaped, "expired rows reaped"),
            Ok(_) => {}
            // Transient pool/DB failures just skip a tick
            Err(e) => warn!(error = %e, "janitor sweep failed"),
        }
    }
}

async fn sweep_once(store: &Store) -> Result<u64, crate::storage::StorageError> {
    let client = store.client().await?;
    let mut reaped = 0;
    for table in schema::DATA_TABLES {
        reaped += client
            .execute(
                &format!("DELETE FROM {table} WHERE expires_at <= now()"),
                &[],
            )
            .await?;
    }
    reaped += client
        .execute("DELETE FROM kv_meta WHERE expires_at <= now()", &[])
        .await?;
    Ok(reaped)
}

/// Starts the janitor with the default interval.
pub fn start_janitor(store: Store) -> Janitor {
    Janitor::start(store)
}
