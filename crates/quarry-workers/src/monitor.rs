//! Cancellation monitor: a background loop that observes canceled tasks and
//! reclaims their resources within a bounded number of ticks. Stage workers
//! check task status inline at message boundaries; this loop is what kills
//! long-running fuzzer containers and clears residual control-plane keys.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quarry_core::control::ControlPlane;
use quarry_core::coord::CoordStore;
use quarry_core::db::Store;
use quarry_core::docker;
use quarry_core::types::TaskStatus;

pub struct Monitor {
    pub cs: Arc<CoordStore>,
    pub db: Arc<Store>,
    pub interval: Duration,
}

impl Monitor {
    pub fn new(cs: Arc<CoordStore>, db: Arc<Store>, interval_s: u64) -> Self {
        Self {
            cs,
            db,
            interval: Duration::from_secs(interval_s),
        }
    }

    /// Run until cancellation. Each tick sweeps tasks that turned canceled
    /// since the last pass.
    pub async fn run(self, cancel: CancellationToken) {
        let mut swept: HashSet<String> = HashSet::new();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("monitor stopping");
                    return;
                }
                () = tokio::time::sleep(self.interval) => {}
            }
            if let Err(e) = self.tick(&mut swept).await {
                warn!("monitor tick failed: {e:#}");
            }
        }
    }

    async fn tick(&self, swept: &mut HashSet<String>) -> anyhow::Result<()> {
        let control = ControlPlane::new(Arc::clone(&self.cs), Arc::clone(&self.db));
        let canceled = self.db.list_tasks_by_status(&[TaskStatus::Canceled]).await?;
        for task in canceled {
            if swept.contains(&task.id) {
                continue;
            }
            info!("sweeping canceled task {}", task.id);

            // Kill every fuzzer container carrying the task id in its name,
            // across the local daemon and the remote host pool.
            docker::sweep_containers(&self.cs, &task.id).await;

            // Residual control-plane keys go away so late observers read
            // "not active" and the retry counter resets.
            control.purge_task_keys(&task.id).await?;

            swept.insert(task.id);
        }
        Ok(())
    }
}
