//! The lifecycle sweeper: a once-per-second maintenance tick.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::QueryRegistry;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

pub struct LifecycleSweeper {
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleSweeper {
    /// Spawn the sweeper loop on the current runtime.
    pub fn start(registry: Arc<QueryRegistry>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.run_maintenance(),
                    _ = shutdown_rx.changed() => {
                        debug!("sweeper shutting down");
                        return;
                    }
                }
            }
        });
        info!("lifecycle sweeper started");
        Self {
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Signal the loop and wait out a short grace window before
    /// aborting a tick that will not finish.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}
