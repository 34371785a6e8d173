//! Triage engine: replays PoCs under the requested sanitizers and repo
//! states, parses the crash, interns a bug-profile identity for the pentuple
//! `(task, harness, sanitizer, bug_type, trigger_point)`, asks the dedup
//! oracle for cluster membership, and fans out patch work.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use quarry_core::builder::{BuildEnv, ReplayVerdict};
use quarry_core::bus::MessageHeaders;
use quarry_core::error::StageError;
use quarry_core::keys;
use quarry_core::oracle::{ClusterDecision, ClusteredProfile, DedupOracle};
use quarry_core::ossfuzz;
use quarry_core::report::{self, CrashReport};
use quarry_core::telemetry;
use quarry_core::types::{
    queues, BugProfile, PatchMessage, PatchMode, RepoState, Sanitizer, TaskStatus, TaskType,
    TimeoutOomRole, TriageMessage,
};

use crate::worker::{Envelope, StageWorker, WorkerContext};

const PROFILE_LOCK_TTL: Duration = Duration::from_secs(600);
const PROFILE_LOCK_WAIT: Duration = Duration::from_secs(600);

pub struct TriageWorker {
    pub oracle: Arc<dyn DedupOracle>,
    /// `triage_queue` for the main pool, `timeout_queue` for the
    /// timeout/OOM processor pool.
    pub input_queue: &'static str,
}

impl TriageWorker {
    pub fn new(oracle: Arc<dyn DedupOracle>) -> Self {
        Self {
            oracle,
            input_queue: queues::TRIAGE,
        }
    }

    pub fn timeout_pool(oracle: Arc<dyn DedupOracle>) -> Self {
        Self {
            oracle,
            input_queue: queues::TIMEOUT,
        }
    }
}

#[async_trait]
impl StageWorker for TriageWorker {
    fn queue(&self) -> &'static str {
        self.input_queue
    }

    fn priority_max(&self) -> Option<u8> {
        Some(10)
    }

    async fn handle(&self, ctx: &WorkerContext, envelope: Envelope) -> Result<(), StageError> {
        let msg: TriageMessage = envelope.decode()?;

        let sanitizers: Vec<Sanitizer> = if msg.sanitizer == "*" {
            Sanitizer::REPLAY_SET.to_vec()
        } else {
            match Sanitizer::parse(&msg.sanitizer) {
                Some(s) => vec![s],
                None => {
                    warn!(
                        "unrecognized sanitizer {:?} for bug {}, skipping",
                        msg.sanitizer, msg.bug_id
                    );
                    return Ok(());
                }
            }
        };

        for sanitizer in sanitizers {
            self.triage_with_sanitizer(ctx, &msg, sanitizer, &envelope.body).await?;
        }
        Ok(())
    }
}

impl TriageWorker {
    async fn triage_with_sanitizer(
        &self,
        ctx: &WorkerContext,
        msg: &TriageMessage,
        sanitizer: Sanitizer,
        raw_body: &[u8],
    ) -> Result<(), StageError> {
        let spec = msg.spec();
        let poc = Path::new(&msg.poc_path);
        let timeout = Duration::from_secs(ctx.cfg.build_replay_timeout_s);

        match msg.task_type {
            TaskType::Full => {
                let env = ctx
                    .brs
                    .ensure_build(&spec, sanitizer, RepoState::Unpatched)
                    .await
                    .map_err(|e| StageError::BuildFailure(format!("{e:#}")))?;
                for harness in resolve_harnesses(msg, &env)? {
                    let replay = ctx
                        .brs
                        .replay_poc(&env, &harness, poc, timeout)
                        .await
                        .map_err(StageError::transient)?;
                    match quarry_core::builder::classify_replay(replay.exit_code, &replay.output) {
                        ReplayVerdict::NoCrash => {
                            info!("bug {}: no crash replaying on {harness}", msg.bug_id);
                            continue;
                        }
                        _ => {
                            let Some(report) = report::parser_for(&replay.output).parse(&replay.output)
                            else {
                                self.archive_broken(ctx, msg, &replay.output, "base");
                                continue;
                            };
                            self.process_crash(ctx, msg, sanitizer, &harness, report, false, raw_body)
                                .await?;
                        }
                    }
                }
            }
            TaskType::Delta => {
                // A build failure on the base state is tolerated; only the
                // patched state matters.
                let base_env = match ctx.brs.ensure_build(&spec, sanitizer, RepoState::Unpatched).await {
                    Ok(env) => Some(env),
                    Err(e) => {
                        warn!("base-state build failed for {} ({e:#}); continuing", msg.task_id);
                        None
                    }
                };
                let patched_env = ctx
                    .brs
                    .ensure_build(&spec, sanitizer, RepoState::Patched)
                    .await
                    .map_err(|e| StageError::BuildFailure(format!("{e:#}")))?;

                for harness in resolve_harnesses(msg, &patched_env)? {
                    // Bugs that reproduce on the base state are not new.
                    if let Some(base) = &base_env {
                        let replay = ctx
                            .brs
                            .replay_poc(base, &harness, poc, timeout)
                            .await
                            .map_err(StageError::transient)?;
                        if quarry_core::builder::classify_replay(replay.exit_code, &replay.output)
                            != ReplayVerdict::NoCrash
                        {
                            info!("bug {} reproducible in base state, ignore", msg.bug_id);
                            if report::parser_for(&replay.output).parse(&replay.output).is_none() {
                                self.archive_broken(ctx, msg, &replay.output, "base");
                            }
                            continue;
                        }
                    }

                    let replay = ctx
                        .brs
                        .replay_poc(&patched_env, &harness, poc, timeout)
                        .await
                        .map_err(StageError::transient)?;
                    if quarry_core::builder::classify_replay(replay.exit_code, &replay.output)
                        == ReplayVerdict::NoCrash
                    {
                        info!("bug {}: no crash on patched state for {harness}", msg.bug_id);
                        continue;
                    }
                    let Some(report) = report::parser_for(&replay.output).parse(&replay.output) else {
                        self.archive_broken(ctx, msg, &replay.output, "delta");
                        continue;
                    };
                    self.process_crash(ctx, msg, sanitizer, &harness, report, true, raw_body)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Identity assignment, dedup, and downstream fanout for one parsed crash.
    #[allow(clippy::too_many_arguments)]
    async fn process_crash(
        &self,
        ctx: &WorkerContext,
        msg: &TriageMessage,
        sanitizer: Sanitizer,
        harness: &str,
        report: CrashReport,
        diff_only: bool,
        raw_body: &[u8],
    ) -> Result<(), StageError> {
        info!(
            "bug {} triaged: {} at {}",
            msg.bug_id, report.bug_type, report.trigger_point
        );

        // Timeout/OOM routing between dedicated pools.
        let is_resource_bug = matches!(report.bug_type.as_str(), "timeout" | "out-of-memory");
        match ctx.cfg.timeout_oom_triage {
            TimeoutOomRole::Sender if is_resource_bug => {
                ctx.bus
                    .publish(queues::TIMEOUT, raw_body, Some(10), &MessageHeaders::default())
                    .await
                    .map_err(StageError::transient)?;
                info!("bug {} forwarded to {}", msg.bug_id, queues::TIMEOUT);
                return Ok(());
            }
            TimeoutOomRole::Processor if !is_resource_bug => return Ok(()),
            _ => {}
        }

        let fingerprint = pentuple_fingerprint(
            &msg.task_id,
            harness,
            sanitizer.as_str(),
            &report.bug_type,
            &report.trigger_point,
        );
        let profile_key = keys::triage_profile(&msg.task_id, &fingerprint);
        let lock_key = keys::triage_profile_lock(&msg.task_id, &fingerprint);

        let lock = ctx
            .cs
            .lock(&lock_key, PROFILE_LOCK_TTL, PROFILE_LOCK_WAIT)
            .await
            .map_err(StageError::transient)?
            .ok_or_else(|| {
                StageError::transient(anyhow::anyhow!("profile lock wait exhausted for {lock_key}"))
            })?;

        let result = self
            .dedup_locked(ctx, msg, sanitizer, harness, &report, diff_only, &profile_key)
            .await;
        if let Err(e) = ctx.cs.release(&lock).await {
            warn!("release {lock_key}: {e:#}");
        }
        result
    }

    async fn dedup_locked(
        &self,
        ctx: &WorkerContext,
        msg: &TriageMessage,
        sanitizer: Sanitizer,
        harness: &str,
        report: &CrashReport,
        diff_only: bool,
        profile_key: &str,
    ) -> Result<(), StageError> {
        let interned = ctx.cs.get(profile_key).await.map_err(StageError::transient)?;
        let is_new_profile = interned.is_none();
        let mut is_new_cluster = false;

        let (profile_id, cluster_id) = match interned {
            Some(raw) => {
                let profile_id: i32 = raw
                    .parse()
                    .map_err(|_| StageError::PoisonMessage(format!("bad interned id {raw:?}")))?;
                info!("using existing bug profile {profile_id}");
                ctx.db
                    .insert_bug_group(msg.bug_id, profile_id, diff_only)
                    .await
                    .map_err(StageError::transient)?;
                let cluster_id = ctx
                    .db
                    .cluster_id_for_profile(profile_id)
                    .await
                    .map_err(StageError::transient)?;
                (profile_id, cluster_id)
            }
            None => {
                // Serialize profile creation across workers so concurrent
                // identical pentuples end up with exactly one row.
                let new_lock_key = keys::new_profile_lock(&msg.task_id);
                let new_lock = ctx
                    .cs
                    .lock(&new_lock_key, PROFILE_LOCK_TTL, PROFILE_LOCK_WAIT)
                    .await
                    .map_err(StageError::transient)?
                    .ok_or_else(|| {
                        StageError::transient(anyhow::anyhow!("new-profile lock wait exhausted"))
                    })?;

                let created = self
                    .create_profile(ctx, msg, sanitizer, harness, report, diff_only, profile_key)
                    .await;
                if let Err(e) = ctx.cs.release(&new_lock).await {
                    warn!("release {new_lock_key}: {e:#}");
                }
                let (profile_id, cluster_id, new_cluster) = created?;
                is_new_cluster = new_cluster;
                (profile_id, Some(cluster_id))
            }
        };

        let Some(cluster_id) = cluster_id else {
            warn!("profile {profile_id} has no cluster yet; skipping fanout");
            return Ok(());
        };

        let smallest = ctx
            .db
            .smallest_profile_in_cluster(cluster_id)
            .await
            .map_err(StageError::transient)?;
        let Some(smallest) = smallest else {
            return Ok(());
        };

        // Make the PoC reachable from the canonical profile so the patch
        // worker can test candidates against it.
        if smallest != profile_id || !is_new_profile {
            ctx.db
                .insert_bug_group(msg.bug_id, smallest, diff_only)
                .await
                .map_err(StageError::transient)?;
        }

        if is_new_cluster {
            // Three independent chances at a fresh patch attempt.
            for _ in 0..3 {
                let priority = rand::thread_rng().gen_range(8..=10);
                ctx.bus
                    .publish_json(
                        queues::PATCH,
                        &PatchMessage {
                            bug_profile_id: smallest,
                            patch_mode: PatchMode::Generic,
                        },
                        Some(priority),
                        &MessageHeaders::default(),
                    )
                    .await
                    .map_err(StageError::transient)?;
            }
            telemetry::log_action("triage", "found_new_bug_cluster", &msg.task_id, &report.bug_type);
        } else {
            self.refresh_active_clusters(ctx).await?;
        }

        Ok(())
    }

    /// Insert the profile row (with its eager bug_groups edge), intern the id,
    /// and decide cluster membership. Returns (profile, cluster, is_new).
    #[allow(clippy::too_many_arguments)]
    async fn create_profile(
        &self,
        ctx: &WorkerContext,
        msg: &TriageMessage,
        sanitizer: Sanitizer,
        harness: &str,
        report: &CrashReport,
        diff_only: bool,
        profile_key: &str,
    ) -> Result<(i32, i32, bool), StageError> {
        let profile = BugProfile {
            id: 0,
            task_id: msg.task_id.clone(),
            harness_name: harness.to_string(),
            sanitizer: sanitizer.as_str().to_string(),
            sanitizer_bug_type: report.bug_type.clone(),
            trigger_point: report.trigger_point.clone(),
            summary: report.summary.clone(),
        };
        let profile_id = ctx
            .db
            .create_profile_with_bug(&profile, msg.bug_id, diff_only)
            .await
            .map_err(StageError::transient)?;
        ctx.cs
            .set(profile_key, &profile_id.to_string())
            .await
            .map_err(StageError::transient)?;
        info!("new bug profile {profile_id} for {}", report.trigger_point);
        telemetry::log_action("triage", "found_new_bug_profile", &msg.task_id, &report.bug_type);

        let existing: Vec<ClusteredProfile> = ctx
            .db
            .clustered_profiles(&msg.task_id)
            .await
            .map_err(StageError::transient)?
            .into_iter()
            .map(|(profile, cluster_id)| ClusteredProfile { profile, cluster_id })
            .collect();

        let created = BugProfile { id: profile_id, ..profile };
        let decision = self
            .oracle
            .assign_cluster(&created, &existing)
            .await
            .map_err(StageError::transient)?;

        match decision {
            ClusterDecision::Existing(cluster_id) => {
                ctx.db
                    .attach_profile_to_cluster(profile_id, cluster_id)
                    .await
                    .map_err(StageError::transient)?;
                Ok((profile_id, cluster_id, false))
            }
            ClusterDecision::New => {
                let cluster_id = ctx
                    .db
                    .create_cluster_for_profile(profile_id)
                    .await
                    .map_err(StageError::transient)?;
                self.record_task_cluster(ctx, &msg.task_id, cluster_id).await?;
                info!("new bug cluster {cluster_id} for task {}", msg.task_id);
                Ok((profile_id, cluster_id, true))
            }
        }
    }

    /// Add a cluster id to the task's JSON membership list in the
    /// coordination store.
    async fn record_task_cluster(
        &self,
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
            let encoded = serde_json::to_string(&clusters)
                .map_err(|e| StageError::transient(anyhow::anyhow!(e)))?;
            ctx.cs
                .hset(keys::TASK_BUG_CLUSTERS, task_id, &encoded)
                .await
                .map_err(StageError::transient)?;
        }
        Ok(())
    }

    /// A profile joined an existing cluster: nudge patching for every active
    /// task's clusters at fast priority.
    async fn refresh_active_clusters(&self, ctx: &WorkerContext) -> Result<(), StageError> {
        let task_ids = ctx
            .cs
            .hkeys(keys::TASK_BUG_CLUSTERS)
            .await
            .map_err(StageError::transient)?;
        for task_id in task_ids {
            let status = ctx
                .cs
                .get(&keys::task_status(&task_id))
                .await
                .map_err(StageError::transient)?;
            let active = status
                .as_deref()
                .and_then(TaskStatus::parse)
                .map(|s| s.is_active())
                .unwrap_or(false);
            if !active {
                continue;
            }
            let raw = ctx
                .cs
                .hget(keys::TASK_BUG_CLUSTERS, &task_id)
                .await
                .map_err(StageError::transient)?;
            let clusters: Vec<i32> = raw
                .as_deref()
                .and_then(|r| serde_json::from_str(r).ok())
                .unwrap_or_default();
            for cluster_id in clusters {
                let Some(smallest) = ctx
                    .db
                    .smallest_profile_in_cluster(cluster_id)
                    .await
                    .map_err(StageError::transient)?
                else {
                    continue;
                };
                let priority = rand::thread_rng().gen_range(3..=7);
                ctx.bus
                    .publish_json(
                        queues::PATCH,
                        &PatchMessage {
                            bug_profile_id: smallest,
                            patch_mode: PatchMode::Fast,
                        },
                        Some(priority),
                        &MessageHeaders::default(),
                    )
                    .await
                    .map_err(StageError::transient)?;
            }
        }
        Ok(())
    }

    /// Archive unparseable replay output for offline analysis.
    fn archive_broken(&self, ctx: &WorkerContext, msg: &TriageMessage, output: &str, state: &str) {
        warn!("bug {}: unparseable crash output ({state} state)", msg.bug_id);
        if !ctx.cfg.log_broken_report {
            return;
        }
        let dir = ctx.storage.broken_report_dir(&msg.task_id, msg.bug_id);
        if std::fs::create_dir_all(&dir).is_ok() {
            let path = dir.join(format!("broken_output_{state}.txt"));
            if let Err(e) = std::fs::write(&path, output) {
                warn!("archive broken report: {e}");
            }
        }
    }
}

/// Stable short fingerprint for the profile pentuple.
pub fn pentuple_fingerprint(
    task_id: &str,
    harness: &str,
    sanitizer: &str,
    bug_type: &str,
    trigger_point: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{task_id}:{harness}:{sanitizer}:{bug_type}:{trigger_point}"));
    hex::encode(hasher.finalize())[..32].to_string()
}

/// Expand a (possibly wildcard) harness name against the build output.
fn resolve_harnesses(msg: &TriageMessage, env: &BuildEnv) -> Result<Vec<String>, StageError> {
    if msg.harness_name != "*" {
        return Ok(vec![msg.harness_name.clone()]);
    }
    let out_dir = env.out_dir();
    let clike = ossfuzz::find_fuzzers(&out_dir, false).map_err(StageError::transient)?;
    if !clike.is_empty() {
        return Ok(clike);
    }
    let jvm = ossfuzz::find_fuzzers(&out_dir, true).map_err(StageError::transient)?;
    if jvm.is_empty() {
        warn!("no harnesses discovered under {}", out_dir.display());
    }
    Ok(jvm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_sensitive() {
        let a = pentuple_fingerprint("t1", "h", "address", "AddressSanitizer: heap-use-after-free", "src/foo.c:42");
        let b = pentuple_fingerprint("t1", "h", "address", "AddressSanitizer: heap-use-after-free", "src/foo.c:42");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let c = pentuple_fingerprint("t1", "h", "address", "AddressSanitizer: heap-use-after-free", "src/foo.c:43");
        assert_ne!(a, c);
        let d = pentuple_fingerprint("t2", "h", "address", "AddressSanitizer: heap-use-after-free", "src/foo.c:42");
        assert_ne!(a, d);
    }
}
