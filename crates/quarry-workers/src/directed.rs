//! Directed-fuzz worker: obtains a reachability slice for the task's diff,
//! builds an allowlist-instrumented AFL target, launches a master plus N
//! slaves per harness, and runs a crash observer and seed syncer until the
//! task stops being active.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use quarry_core::builder;
use quarry_core::bus::MessageHeaders;
use quarry_core::docker::{self, Docker, RunSpec};
use quarry_core::error::StageError;
use quarry_core::keys;
use quarry_core::ossfuzz::{self, OssFuzz};
use quarry_core::storage;
use quarry_core::types::{
    queues, Bug, DirectedMessage, Fuzzlet, Seed, FuzzerKind, SliceMessage, TriageMessage,
};

use crate::worker::{Envelope, StageWorker, WorkerContext};

/// The AFL launcher is shipped as a resource file rather than an inline
/// shell string.
const AFL_LAUNCH_SH: &str = include_str!("../resources/afl_launch.sh");

const SLICE_POLL: Duration = Duration::from_secs(5);
const OBSERVER_TICK: Duration = Duration::from_secs(30);
const NO_RESULTS: &str = "/no_results";

pub struct DirectedWorker;

#[async_trait]
impl StageWorker for DirectedWorker {
    fn queue(&self) -> &'static str {
        queues::DIRECTED
    }

    async fn handle(&self, ctx: &WorkerContext, envelope: Envelope) -> Result<(), StageError> {
        let msg: DirectedMessage = envelope.decode()?;
        let spec = &msg.spec;

        // Slice result: header override, SARIF-provided path, or a fresh
        // request to the slice pool.
        let slice_path = if let Some(path) = envelope.headers.extra.get("slice_result") {
            path.clone()
        } else if let Some(path) = &msg.sarif_slice_path {
            path.clone()
        } else {
            self.request_slice(ctx, &msg).await?
        };

        let allowlist = if slice_path == NO_RESULTS {
            None
        } else {
            match std::fs::read_to_string(&slice_path) {
                Ok(text) => Some(text),
                Err(e) => {
                    warn!("slice result {slice_path} unreadable: {e}; fuzzing unguided");
                    None
                }
            }
        };

        let workspace = crate::workspace::Workspace::create("directed")
            .map_err(|e| StageError::Fatal(format!("workspace: {e:#}")))?;
        builder::extract_sources(spec, workspace.path(), spec.diff.is_some())
            .await
            .map_err(StageError::transient)?;
        let tooling_name = std::fs::read_to_string(workspace.path().join("fuzz_tooling_dir.txt"))
            .map(|s| s.trim().to_string())
            .map_err(StageError::transient)?;

        // Build with AFL engine, allowlist-instrumented when a slice exists.
        let ossfuzz = OssFuzz::new(workspace.path().join(&tooling_name), spec.project_name.clone());
        let mut build_env: Vec<(String, String)> = Vec::new();
        if let Some(allowlist) = &allowlist {
            let allowlist_path = workspace.path().join("afl_allowlist.txt");
            std::fs::write(&allowlist_path, allowlist_to_afl(allowlist))
                .map_err(StageError::transient)?;
            build_env.push((
                "AFL_LLVM_ALLOWLIST".to_string(),
                allowlist_path.to_string_lossy().into_owned(),
            ));
        }
        ossfuzz.build_image().await.map_err(|e| StageError::BuildFailure(format!("{e:#}")))?;
        ossfuzz
            .build_fuzzers(&workspace.path().join(&spec.focus), "address", Some("afl"), &build_env)
            .await
            .map_err(|e| StageError::BuildFailure(format!("{e:#}")))?;

        let out_dir = ossfuzz.out_dir();
        let harnesses = ossfuzz::find_fuzzers(&out_dir, false).map_err(StageError::transient)?;
        if harnesses.is_empty() {
            warn!("task {}: no AFL harnesses built", spec.task_id);
            return Ok(());
        }

        // Announce artifacts so fuzzer fleets can discover them.
        let artifact_root = ctx.storage.public_build_dir(&spec.task_id);
        std::fs::create_dir_all(&artifact_root).map_err(StageError::transient)?;
        for harness in &harnesses {
            let dest = artifact_root.join(harness);
            if std::fs::copy(out_dir.join(harness), &dest).is_ok() {
                let dest_str = dest.to_string_lossy().into_owned();
                ctx.cs
                    .set(
                        &keys::harness_artifact(&spec.task_id, harness, "address", "directed"),
                        &dest_str,
                    )
                    .await
                    .map_err(StageError::transient)?;
                let fuzzlet = Fuzzlet {
                    task_id: spec.task_id.clone(),
                    harness: harness.clone(),
                    sanitizer: "address".to_string(),
                    engine: "directed".to_string(),
                    artifact: dest_str,
                };
                let encoded = serde_json::to_string(&fuzzlet)
                    .map_err(|e| StageError::transient(anyhow::anyhow!(e)))?;
                ctx.cs
                    .sadd(keys::FUZZLETS, &encoded)
                    .await
                    .map_err(StageError::transient)?;
            }
        }

        if ctx.cfg.enable_copy_artifact {
            let payload = serde_json::json!({
                "dir": artifact_root.to_string_lossy(),
                "harnesses": harnesses,
            });
            ctx.cs
                .set_ex(
                    &keys::public_build(&spec.task_id),
                    &payload.to_string(),
                    Duration::from_secs(24 * 60 * 60),
                )
                .await
                .map_err(StageError::transient)?;
        }

        // Write the launcher next to the build output and start the fleet.
        std::fs::write(out_dir.join("afl_launch.sh"), AFL_LAUNCH_SH).map_err(StageError::transient)?;
        let docker = docker::pick_build_host(&ctx.cs, ctx.cfg.max_load).await;
        let sync_root = workspace.path().join("sync");
        std::fs::create_dir_all(&sync_root).map_err(StageError::transient)?;

        let mut containers: Vec<String> = Vec::new();
        for harness in &harnesses {
            let mut roles = vec!["master".to_string()];
            for n in 0..ctx.cfg.afl_slave_num {
                roles.push(format!("slave{n}"));
            }
            for role in roles {
                let name = format!("directed_{}_{}_{role}", spec.task_id, harness);
                match self
                    .launch_fuzzer(&docker, &name, &out_dir, &sync_root, harness, &role)
                    .await
                {
                    Ok(()) => containers.push(name),
                    Err(e) => warn!("launch {name}: {e:#}"),
                }
            }
        }
        if containers.is_empty() {
            return Err(StageError::BuildFailure("no fuzzer containers launched".into()));
        }
        info!(
            "task {}: directed fuzzing started ({} containers)",
            spec.task_id,
            containers.len()
        );

        // Observe until the task stops being active, then tear down.
        self.observe(ctx, &msg, &sync_root, &harnesses).await;
        for name in &containers {
            let _ = docker.stop(name).await;
            let _ = docker.rm(name).await;
        }
        info!("task {}: directed fuzzing stopped", spec.task_id);
        Ok(())
    }
}

impl DirectedWorker {
    /// Publish a slice request and poll the relational store for the result
    /// path, up to the configured wait budget.
    async fn request_slice(
        &self,
        ctx: &WorkerContext,
        msg: &DirectedMessage,
    ) -> Result<String, StageError> {
        let slice_id = uuid::Uuid::new_v4().to_string();
        let request = SliceMessage {
            task_id: msg.spec.task_id.clone(),
            slice_id: slice_id.clone(),
            is_sarif: false,
            project_name: msg.spec.project_name.clone(),
            focus: msg.spec.focus.clone(),
            repo: msg.spec.repo.clone(),
            fuzzing_tooling: msg.spec.fuzzing_tooling.clone(),
            diff: msg.spec.diff.clone(),
            slice_target: None,
        };
        ctx.bus
            .publish_json(queues::SLICE, &request, None, &MessageHeaders::default())
            .await
            .map_err(StageError::transient)?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(ctx.cfg.slice_max_wait_s);
        loop {
            if let Some(path) = ctx
                .db
                .directed_slice_result(&slice_id)
                .await
                .map_err(StageError::transient)?
            {
                if Path::new(&path).exists() {
                    return Ok(path);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("slice {slice_id}: timed out waiting for result");
                return Ok(NO_RESULTS.to_string());
            }
            tokio::time::sleep(SLICE_POLL).await;
        }
    }

    async fn launch_fuzzer(
        &self,
        docker: &Docker,
        name: &str,
        out_dir: &Path,
        sync_root: &Path,
        harness: &str,
        role: &str,
    ) -> anyhow::Result<()> {
        let _ = docker.rm(name).await;
        docker
            .run_detached(&RunSpec {
                name: name.to_string(),
                image: "gcr.io/oss-fuzz-base/base-runner".to_string(),
                binds: vec![
                    (out_dir.to_string_lossy().into_owned(), "/out".into(), false),
                    (sync_root.to_string_lossy().into_owned(), "/sync".into(), false),
                ],
                env: vec![
                    ("ROLE".into(), role.to_string()),
                    ("HARNESS".into(), harness.to_string()),
                    ("SEED_DIR".into(), format!("/sync/{harness}/seeds")),
                    ("SYNC_DIR".into(), format!("/sync/{harness}/out")),
                ],
                entrypoint: Some("/bin/sh".into()),
                command: vec!["/out/afl_launch.sh".into()],
                privileged: false,
            })
            .await?;
        Ok(())
    }

    /// Periodic loop: back up fresh crashes and forward them to triage, sync
    /// discovered seeds to shared storage, and stop when the task goes
    /// inactive (observed within one monitor tick).
    async fn observe(
        &self,
        ctx: &WorkerContext,
        msg: &DirectedMessage,
        sync_root: &Path,
        harnesses: &[String],
    ) {
        let spec = &msg.spec;
        let mut seen: HashSet<PathBuf> = HashSet::new();
        let backup_dir = ctx
            .storage
            .crash_backup_dir("directed", &spec.task_id, &spec.project_name);
        let tick = Duration::from_secs(ctx.cfg.monitor_interval_s.min(OBSERVER_TICK.as_secs()));

        loop {
            match quarry_core::control::task_is_active(&ctx.cs, &spec.task_id).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => warn!("task status check: {e:#}"),
            }

            for crash in find_crash_files(sync_root) {
                if seen.contains(&crash) {
                    continue;
                }
                seen.insert(crash.clone());
                if let Err(e) = self.forward_crash(ctx, msg, &backup_dir, &crash, harnesses).await {
                    warn!("forward crash {}: {e:#}", crash.display());
                }
            }

            if let Err(e) = self.sync_seeds(ctx, spec, sync_root).await {
                warn!("seed sync: {e:#}");
            }

            // Metrics stream: latest entry is read back with LINDEX -1.
            let metric = serde_json::json!({ "fuzzer": "directed", "crashes": seen.len() });
            let metrics_key = keys::task_metrics(&spec.task_id);
            if let Err(e) = ctx.cs.rpush(&metrics_key, &metric.to_string()).await {
                warn!("metrics append: {e:#}");
            } else {
                let _ = ctx.cs.expire(&metrics_key, Duration::from_secs(15 * 60)).await;
            }

            tokio::time::sleep(tick).await;
        }
    }

    async fn forward_crash(
        &self,
        ctx: &WorkerContext,
        msg: &DirectedMessage,
        backup_dir: &Path,
        crash: &Path,
        harnesses: &[String],
    ) -> anyhow::Result<()> {
        let spec = &msg.spec;
        std::fs::create_dir_all(backup_dir)?;
        let file_name = crash
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "crash".into());
        let backed_up = backup_dir.join(&file_name);
        std::fs::copy(crash, &backed_up)?;

        // AFL sync layout: <sync>/<harness>/out/<role>/crashes/<file>.
        let harness = harness_for_crash(crash, harnesses)
            .or_else(|| harnesses.first().cloned())
            .unwrap_or_else(|| "*".into());
        let poc = backed_up.to_string_lossy().into_owned();
        let bug_id = ctx
            .db
            .insert_bug(&Bug {
                id: 0,
                task_id: spec.task_id.clone(),
                architecture: "x86_64".to_string(),
                poc: poc.clone(),
                harness_name: harness.clone(),
                sanitizer: "address".to_string(),
                sarif_report: None,
            })
            .await?;

        let triage = TriageMessage {
            bug_id,
            task_id: spec.task_id.clone(),
            task_type: spec.task_type,
            sanitizer: "address".to_string(),
            harness_name: harness,
            poc_path: poc,
            project_name: spec.project_name.clone(),
            focus: spec.focus.clone(),
            repo: spec.repo.clone(),
            fuzzing_tooling: spec.fuzzing_tooling.clone(),
            diff: spec.diff.clone(),
        };
        ctx.bus
            .publish_json(queues::TRIAGE, &triage, Some(5), &MessageHeaders::default())
            .await?;
        info!("crash {} forwarded to triage as bug {bug_id}", crash.display());
        Ok(())
    }

    async fn sync_seeds(
        &self,
        ctx: &WorkerContext,
        spec: &quarry_core::types::TaskSpec,
        sync_root: &Path,
    ) -> anyhow::Result<()> {
        // DIRECTED_MODE runs lean: no seed archival alongside the fuzzers.
        if ctx.cfg.directed_mode || !ctx.cfg.enable_seed_archive {
            return Ok(());
        }
        if !sync_root.is_dir() {
            return Ok(());
        }
        let archive_dir = ctx.storage.seed_archive_dir(&spec.task_id);
        std::fs::create_dir_all(&archive_dir)?;
        let tarball = archive_dir.join("directed_sync.tar.gz");
        storage::pack_tar_gz(sync_root, &tarball)?;
        ctx.db
            .insert_seed(&Seed {
                id: 0,
                task_id: spec.task_id.clone(),
                path: tarball.to_string_lossy().into_owned(),
                harness_name: "*".to_string(),
                fuzzer: FuzzerKind::Directed,
                instance: ctx.cfg.instance.clone(),
                coverage: None,
                metric: None,
            })
            .await?;
        Ok(())
    }
}

/// `fun: name` allowlist format consumed by the AFL instrumentation pass.
pub fn allowlist_to_afl(function_list: &str) -> String {
    let mut out = String::new();
    for line in function_list.lines() {
        let name = line.trim();
        if !name.is_empty() {
            out.push_str("fun: ");
            out.push_str(name);
            out.push('\n');
        }
    }
    out
}

/// Recover the harness a crash belongs to from its sync-tree path.
pub fn harness_for_crash(crash: &Path, harnesses: &[String]) -> Option<String> {
    crash
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .find(|segment| harnesses.iter().any(|h| h == segment))
        .map(str::to_string)
}

/// Crash inputs under any `crashes/` directory in the AFL sync tree,
/// skipping AFL's own README.
pub fn find_crash_files(sync_out: &Path) -> Vec<PathBuf> {
    let mut crashes = Vec::new();
    let mut stack = vec![sync_out.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let in_crashes = dir.file_name().map(|n| n == "crashes").unwrap_or(false);
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if in_crashes {
                let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                if name.as_deref() != Some("README.txt") {
                    crashes.push(path);
                }
            }
        }
    }
    crashes.sort();
    crashes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowlist_formatting() {
        let list = "png_read_row\n\ncheck_chunk\n";
        assert_eq!(allowlist_to_afl(list), "fun: png_read_row\nfun: check_chunk\n");
    }

    #[test]
    fn harness_recovery_from_sync_path() {
        let harnesses = vec!["fuzz_png".to_string(), "fuzz_gif".to_string()];
        let crash = Path::new("/tmp/sync/fuzz_gif/out/master/crashes/id:000001");
        assert_eq!(harness_for_crash(crash, &harnesses).as_deref(), Some("fuzz_gif"));
        let unrelated = Path::new("/tmp/sync/other/out/crashes/id:000001");
        assert!(harness_for_crash(unrelated, &harnesses).is_none());
    }

    #[test]
    fn crash_scan_finds_only_crash_dirs() {
        let root = tempfile::tempdir().unwrap();
        let crashes = root.path().join("master").join("crashes");
        std::fs::create_dir_all(&crashes).unwrap();
        std::fs::write(crashes.join("id:000000"), b"poc").unwrap();
        std::fs::write(crashes.join("README.txt"), b"afl notes").unwrap();
        let queue = root.path().join("master").join("queue");
        std::fs::create_dir_all(&queue).unwrap();
        std::fs::write(queue.join("id:000001"), b"seed").unwrap();

        let found = find_crash_files(root.path());
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("id:000000"));
    }
}
