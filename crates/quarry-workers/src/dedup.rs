//! Dedup worker: offloaded cluster assignment. Consumes `dedup_queue`
//! messages carrying a bug profile id, invokes the oracle against the task's
//! clustered profiles, and persists the membership decision.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use quarry_core::error::StageError;
use quarry_core::keys;
use quarry_core::oracle::{ClusterDecision, ClusteredProfile, DedupOracle};
use quarry_core::types::{queues, DedupMessage};

use crate::worker::{Envelope, StageWorker, WorkerContext};

pub struct DedupWorker {
    pub oracle: Arc<dyn DedupOracle>,
}

#[async_trait]
impl StageWorker for DedupWorker {
    fn queue(&self) -> &'static str {
        queues::DEDUP
    }

    async fn handle(&self, ctx: &WorkerContext, envelope: Envelope) -> Result<(), StageError> {
        let msg: DedupMessage = envelope.decode()?;

        let profile = ctx
            .db
            .get_bug_profile(msg.bug_profile_id)
            .await
            .map_err(StageError::transient)?
            .ok_or_else(|| {
                StageError::PoisonMessage(format!("unknown bug profile {}", msg.bug_profile_id))
            })?;

        if ctx
            .db
            .cluster_id_for_profile(profile.id)
            .await
            .map_err(StageError::transient)?
            .is_some()
        {
            info!("profile {} already clustered", profile.id);
            return Ok(());
        }

        let existing: Vec<ClusteredProfile> = ctx
            .db
            .clustered_profiles(&msg.task_id)
            .await
            .map_err(StageError::transient)?
            .into_iter()
            .filter(|(p, _)| p.id != profile.id)
            .map(|(profile, cluster_id)| ClusteredProfile { profile, cluster_id })
            .collect();

        let decision = self
            .oracle
            .assign_cluster(&profile, &existing)
            .await
            .map_err(StageError::transient)?;

        match decision {
            ClusterDecision::Existing(cluster_id) => {
                ctx.db
                    .attach_profile_to_cluster(profile.id, cluster_id)
                    .await
                    .map_err(StageError::transient)?;
                info!("profile {} joined cluster {cluster_id}", profile.id);
            }
            ClusterDecision::New => {
                let cluster_id = ctx
                    .db
                    .create_cluster_for_profile(profile.id)
                    .await
                    .map_err(StageError::transient)?;
                record_task_cluster(ctx, &msg.task_id, cluster_id).await?;
                info!("profile {} founded cluster {cluster_id}", profile.id);
            }
        }
        Ok(())
    }
}

async fn record_task_cluster(
    ctx: &WorkerContext,
    task_id: &str,
    cluster_id: i32,
) -> Result<(), StageError> {
    let raw = ctx
        .cs
        .hget(keys::TASK_BUG_CLUSTERS, task_id)
        .await
        .map_err(StageError::transient)?;
    let mut clusters: Vec<i32> = raw
        .as_deref()
        .and_then(|r| serde_json::from_str(r).ok())
        .unwrap_or_default();
    if !clusters.contains(&cluster_id) {
        clusters.push(cluster_id);
        let encoded =
            serde_json::to_string(&clusters).map_err(|e| StageError::transient(anyhow::anyhow!(e)))?;
        ctx.cs
            .hset(keys::TASK_BUG_CLUSTERS, task_id, &encoded)
            .await
            .map_err(StageError::transient)?;
    }
    Ok(())
}
