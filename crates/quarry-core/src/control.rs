//! Control plane: task create/cancel signals are canonical status writes in
//! the coordination store. Workers observe status changes and stop at the
//! next safe point; nothing else is signalled out-of-band.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use crate::coord::CoordStore;
use crate::db::Store;
use crate::keys;
use crate::types::{Task, TaskStatus};

/// Status keys share the task payload TTL (48 hours).
const TASK_KEY_TTL: Duration = Duration::from_secs(48 * 60 * 60);

pub struct ControlPlane {
    pub cs: Arc<CoordStore>,
    pub db: Arc<Store>,
}

impl ControlPlane {
    pub fn new(cs: Arc<CoordStore>, db: Arc<Store>) -> Self {
        Self { cs, db }
    }

    /// Register a new task: persist the row and publish `processing` as the
    /// canonical live status.
    pub async fn create_task(&self, task: &Task) -> Result<()> {
        self.db.insert_task(task).await?;
        self.cs
            .set_ex(&keys::task_status(&task.id), task.status.as_str(), TASK_KEY_TTL)
            .await?;
        if !task.metadata.is_null() {
            self.cs
                .set_ex(
                    &keys::task_metadata(&task.id),
                    &task.metadata.to_string(),
                    TASK_KEY_TTL,
                )
                .await?;
        }
        info!("task {} registered ({})", task.id, task.status.as_str());
        Ok(())
    }

    /// Cancel a task. Every in-flight worker loop observes the status at its
    /// next poll and exits cleanly for this task.
    pub async fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.cs
            .set_ex(&keys::task_status(task_id), TaskStatus::Canceled.as_str(), TASK_KEY_TTL)
            .await?;
        self.db.update_task_status(task_id, TaskStatus::Canceled).await?;
        info!("task {task_id} canceled");
        Ok(())
    }

    /// Live status as workers see it. Missing key means "not active".
    pub async fn observed_status(&self, task_id: &str) -> Result<Option<TaskStatus>> {
        let raw = self.cs.get(&keys::task_status(task_id)).await?;
        Ok(raw.as_deref().and_then(TaskStatus::parse))
    }

    /// Remove residual control-plane keys after cancellation cleanup.
    pub async fn purge_task_keys(&self, task_id: &str) -> Result<()> {
        self.cs.del(&keys::task_status(task_id)).await?;
        self.cs.del(&keys::workflow_retry_count(task_id)).await?;
        self.cs.del(&keys::task_metadata(task_id)).await?;
        Ok(())
    }
}

/// Gate shared by every stage worker: is this task still worth working on?
pub async fn task_is_active(cs: &CoordStore, task_id: &str) -> Result<bool> {
    let raw = cs.get(&keys::task_status(task_id)).await?;
    Ok(raw
        .as_deref()
        .and_then(TaskStatus::parse)
        .map(|s| s.is_active())
        .unwrap_or(false))
}
