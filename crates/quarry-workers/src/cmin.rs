//! Cmin worker: thins a seed corpus down to a feature-minimal cover. The
//! instrumented harness prints one `clustercmin:<feature>:<filename>` line
//! per retained input; features are interned in the coordination store and
//! only ever grow.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use quarry_core::error::StageError;
use quarry_core::keys;
use quarry_core::storage;
use quarry_core::types::{queues, CminMessage};

use crate::worker::{Envelope, StageWorker, WorkerContext};

/// The harness prints this before emitting feature lines; absence means the
/// run did not reach the minimization phase.
const CMIN_MARKER: &str = "acd: generate cmin corpus by features in";
const CMIN_TIMEOUT: Duration = Duration::from_secs(600);
const ARTIFACT_WAIT: Duration = Duration::from_secs(5);

pub struct CminWorker;

#[async_trait]
impl StageWorker for CminWorker {
    fn queue(&self) -> &'static str {
        queues::CMIN
    }

    async fn handle(&self, ctx: &WorkerContext, envelope: Envelope) -> Result<(), StageError> {
        let msg: CminMessage = envelope.decode()?;

        // The harness artifact is produced by a separate build pipeline; wait
        // for it unless the build is known to have failed.
        let artifact_key = keys::cmin_artifact(&msg.task_id, &msg.harness);
        let harness_path = ctx.cs.get(&artifact_key).await.map_err(StageError::transient)?;
        let Some(harness_path) = harness_path else {
            let failed = ctx
                .cs
                .get(&keys::cmin_failed(&msg.task_id))
                .await
                .map_err(StageError::transient)?;
            if failed.is_some() {
                info!(
                    "cmin harness for {}:{} failed to build, dropping",
                    msg.task_id, msg.harness
                );
                return Ok(());
            }
            info!(
                "cmin harness for {}:{} not built yet, requeueing",
                msg.task_id, msg.harness
            );
            tokio::time::sleep(ARTIFACT_WAIT).await;
            // Artifact wait is not a failure: requeue without burning retry
            // budget.
            ctx.bus
                .republish_tail(self.queue(), &envelope.body, &envelope.headers, None)
                .await
                .map_err(StageError::transient)?;
            return Ok(());
        };

        let workspace = crate::workspace::Workspace::create("cmin")
            .map_err(|e| StageError::Fatal(format!("workspace: {e:#}")))?;

        // Copy the harness in and make it executable.
        let harness_src = Path::new(&harness_path);
        let harness_name = harness_src
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| StageError::PoisonMessage(format!("bad harness path {harness_path:?}")))?;
        let local_harness = workspace.path().join(&harness_name);
        std::fs::copy(harness_src, &local_harness)
            .map_err(|e| StageError::transient(anyhow::anyhow!("copy harness: {e}")))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&local_harness, std::fs::Permissions::from_mode(0o755))
                .map_err(StageError::transient)?;
        }

        // Extract the seed corpus.
        let seeds_dir = workspace
            .subdir("seeds")
            .map_err(StageError::transient)?;
        storage::extract_tar_gz(Path::new(&msg.seeds), &seeds_dir)
            .map_err(|e| StageError::transient(anyhow::anyhow!("extract seeds: {e:#}")))?;
        let seed_count = std::fs::read_dir(&seeds_dir)
            .map(|entries| entries.count())
            .unwrap_or(0);
        if seed_count == 0 {
            warn!("no seeds extracted from {}", msg.seeds);
            return Ok(());
        }

        // Run the harness in hash-generation mode.
        let output = Command::new(&local_harness)
            .arg("-generate_hash=1")
            .arg(&seeds_dir)
            .current_dir(workspace.path())
            .stdin(Stdio::null())
            .output();
        let output = tokio::time::timeout(CMIN_TIMEOUT, output)
            .await
            .map_err(|_| StageError::transient(anyhow::anyhow!("cmin run timed out")))?
            .map_err(StageError::transient)?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        let Some(mapping) = parse_cmin_output(&stderr) else {
            warn!(
                "cmin run for {}:{} produced no feature map",
                msg.task_id, msg.harness
            );
            return Ok(());
        };
        info!(
            "cmin {}:{}: {} features over {} seeds",
            msg.task_id,
            msg.harness,
            mapping.len(),
            seed_count
        );

        // Publish the retained inputs to the shared corpus so other fleets
        // can pick them up.
        if ctx.cfg.enable_shared_crs {
            let shared = ctx
                .storage
                .corpus_dir(&msg.task_id)
                .join("minimized")
                .join(&msg.harness);
            if std::fs::create_dir_all(&shared).is_ok() {
                for filename in mapping.values() {
                    let src = seeds_dir.join(filename);
                    if src.is_file() {
                        let _ = std::fs::copy(&src, shared.join(filename));
                    }
                }
            }
        }

        save_features(ctx, &msg.task_id, &msg.harness, &mapping).await?;
        Ok(())
    }
}

/// Parse `clustercmin:<feature>:<filename>` lines after the marker. Returns
/// None when the marker never appeared.
pub fn parse_cmin_output(stderr: &str) -> Option<BTreeMap<u64, String>> {
    let start = stderr.find(CMIN_MARKER)?;
    let mut mapping = BTreeMap::new();
    for line in stderr[start..].lines() {
        let Some(rest) = line.strip_prefix("clustercmin:") else {
            continue;
        };
        let Some((feature, filename)) = rest.split_once(':') else {
            warn!("invalid cmin line: {line:?}");
            continue;
        };
        let Ok(feature) = feature.parse::<u64>() else {
            warn!("invalid cmin feature: {line:?}");
            continue;
        };
        let basename = filename.rsplit('/').next().unwrap_or(filename).to_string();
        mapping.insert(feature, basename);
    }
    Some(mapping)
}

/// Record new features atomically: existing `feature -> filename` mappings
/// are never overwritten, and the feature set only grows.
async fn save_features(
    ctx: &WorkerContext,
    task_id: &str,
    harness: &str,
    mapping: &BTreeMap<u64, String>,
) -> Result<(), StageError> {
    let mut new_features: BTreeSet<u64> = BTreeSet::new();
    for (feature, filename) in mapping {
        let key = keys::cmin_file(task_id, harness, *feature);
        let inserted = ctx
            .cs
            .setnx(&key, filename)
            .await
            .map_err(StageError::transient)?;
        if inserted {
            new_features.insert(*feature);
        }
    }
    if !new_features.is_empty() {
        let members: Vec<String> = new_features.iter().map(|f| f.to_string()).collect();
        ctx.cs
            .sadd_all(&keys::cmin_features(task_id, harness), &members)
            .await
            .map_err(StageError::transient)?;
    }
    info!(
        "cmin {task_id}:{harness}: {} new features recorded",
        new_features.len()
    );
    Ok(())
}

/// Pure merge used to reason about feature-set growth: the union of all
/// observed features, never shrinking.
pub fn merge_features(existing: &BTreeSet<u64>, observed: &BTreeSet<u64>) -> BTreeSet<u64> {
    existing.union(observed).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_feature_lines_after_marker() {
        let stderr = "\
INFO: libFuzzer starting
acd: generate cmin corpus by features in /tmp/seeds
clustercmin:11:/tmp/seeds/test.poc
clustercmin:42:crash-abc
noise line
clustercmin:bad:line:extra:pieces
";
        let mapping = parse_cmin_output(stderr).unwrap();
        assert_eq!(mapping.get(&11).map(String::as_str), Some("test.poc"));
        assert_eq!(mapping.get(&42).map(String::as_str), Some("crash-abc"));
        assert_eq!(mapping.len(), 2);
    }

    #[test]
    fn missing_marker_is_a_failed_run() {
        assert!(parse_cmin_output("clustercmin:1:file\n").is_none());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let stderr = "acd: generate cmin corpus by features in x\nclustercmin:notanum:file\n";
        let mapping = parse_cmin_output(stderr).unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn feature_merge_is_monotone() {
        let a: BTreeSet<u64> = [1, 2, 3].into_iter().collect();
        let b: BTreeSet<u64> = [3, 4].into_iter().collect();
        let merged = merge_features(&a, &b);
        assert!(merged.is_superset(&a));
        assert!(merged.is_superset(&b));
        assert_eq!(merged.len(), 4);

        // Union over any message order reaches the same set.
        let merged_rev = merge_features(&b, &a);
        assert_eq!(merged, merged_rev);
    }
}
