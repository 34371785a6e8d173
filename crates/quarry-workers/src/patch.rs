//! Patch worker: given a bug profile, runs the external patch-generation
//! agent, replays the profile's PoCs against the candidate via the build
//! substrate, and records the patch together with per-bug repair truth.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use quarry_core::agents::{PatchGenerator, PatchProfile, PatchRequest};
use quarry_core::builder::{self, ReplayVerdict};
use quarry_core::control;
use quarry_core::error::StageError;
use quarry_core::types::{queues, PatchMessage, PatchMode, Sanitizer, SourceKind, TaskSpec};

use crate::worker::{Envelope, StageWorker, WorkerContext};

/// A profile only ever carries this many live patch attempts.
const MAX_PATCHES_PER_PROFILE: i64 = 3;

pub struct PatchWorker {
    pub generator: Arc<dyn PatchGenerator>,
}

#[async_trait]
impl StageWorker for PatchWorker {
    fn queue(&self) -> &'static str {
        queues::PATCH
    }

    fn priority_max(&self) -> Option<u8> {
        Some(10)
    }

    async fn handle(&self, ctx: &WorkerContext, envelope: Envelope) -> Result<(), StageError> {
        let msg: PatchMessage = envelope.decode()?;
        if msg.patch_mode == PatchMode::None {
            return Ok(());
        }

        let profile = ctx
            .db
            .get_bug_profile(msg.bug_profile_id)
            .await
            .map_err(StageError::transient)?
            .ok_or_else(|| {
                StageError::PoisonMessage(format!("unknown bug profile {}", msg.bug_profile_id))
            })?;

        // The message schema has no task id; gate on the profile's task here.
        if !control::task_is_active(&ctx.cs, &profile.task_id)
            .await
            .map_err(StageError::transient)?
        {
            return Err(StageError::TaskCancelled);
        }

        let live = ctx
            .db
            .valid_patch_count(profile.id)
            .await
            .map_err(StageError::transient)?;
        if live >= MAX_PATCHES_PER_PROFILE {
            info!(
                "profile {}: already has {live} live patches, skipping",
                profile.id
            );
            return Ok(());
        }

        let bugs = ctx
            .db
            .bugs_for_profile(profile.id)
            .await
            .map_err(StageError::transient)?;
        if bugs.is_empty() {
            warn!("profile {}: no bugs attached, skipping", profile.id);
            return Ok(());
        }

        let spec = task_spec_from_store(ctx, &profile.task_id).await?;

        // Extract the sources for the agent to read (diff applied for delta
        // tasks so the agent patches the state that actually crashes).
        let workspace = crate::workspace::Workspace::create("patch")
            .map_err(|e| StageError::Fatal(format!("workspace: {e:#}")))?;
        builder::extract_sources(&spec, workspace.path(), spec.diff.is_some())
            .await
            .map_err(StageError::transient)?;

        let mode = match msg.patch_mode {
            PatchMode::Generic => "generic",
            PatchMode::Fast => "fast",
            PatchMode::None => unreachable!(),
        };
        let request = PatchRequest {
            profile: PatchProfile::from(&profile),
            poc_paths: bugs.iter().map(|b| b.poc.clone()).collect(),
            source_dir: workspace.path().join(&spec.focus),
            mode: mode.to_string(),
        };

        let Some(generated) = self
            .generator
            .generate(&request)
            .await
            .map_err(StageError::transient)?
        else {
            info!("profile {}: agent produced no patch", profile.id);
            return Ok(());
        };

        // Test the candidate: rebuild with it applied and replay every PoC.
        let sanitizer = Sanitizer::parse(&profile.sanitizer).unwrap_or(Sanitizer::Address);
        let env = ctx
            .brs
            .build_with_candidate(&spec, sanitizer, &generated.diff)
            .await
            .map_err(|e| StageError::BuildFailure(format!("{e:#}")))?;

        let timeout = Duration::from_secs(ctx.cfg.build_replay_timeout_s);
        let mut results: Vec<(i32, bool)> = Vec::new();
        for bug in &bugs {
            let replay = ctx
                .brs
                .replay_poc(&env, &profile.harness_name, Path::new(&bug.poc), timeout)
                .await;
            match replay {
                Ok(replay) => {
                    let verdict = builder::classify_replay(replay.exit_code, &replay.output);
                    results.push((bug.id, verdict == ReplayVerdict::NoCrash));
                }
                Err(e) => {
                    warn!("replay bug {} against candidate: {e:#}", bug.id);
                    results.push((bug.id, false));
                }
            }
        }
        ctx.brs.teardown_runner(&env).await;

        let patch_id = ctx
            .db
            .insert_patch(profile.id, &generated.diff, &generated.model)
            .await
            .map_err(StageError::transient)?;
        for (bug_id, repaired) in &results {
            ctx.db
                .insert_patch_bug(patch_id, *bug_id, *repaired)
                .await
                .map_err(StageError::transient)?;
        }

        let repaired = results.iter().filter(|(_, r)| *r).count();
        info!(
            "profile {}: patch {patch_id} recorded ({repaired}/{} PoCs repaired, mode {mode})",
            profile.id,
            results.len()
        );
        Ok(())
    }
}

/// Rebuild a TaskSpec for builds from the task row and its sources.
pub async fn task_spec_from_store(
    ctx: &WorkerContext,
    task_id: &str,
) -> Result<TaskSpec, StageError> {
    let task = ctx
        .db
        .get_task(task_id)
        .await
        .map_err(StageError::transient)?
        .ok_or_else(|| StageError::PoisonMessage(format!("unknown task {task_id}")))?;
    let sources = ctx
        .db
        .list_sources(task_id)
        .await
        .map_err(StageError::transient)?;

    let mut repo = Vec::new();
    let mut fuzzing_tooling = None;
    let mut diff = None;
    for source in sources {
        let location = source.path.unwrap_or(source.url);
        match source.source_type {
            SourceKind::Repo => repo.push(location),
            SourceKind::FuzzTooling => fuzzing_tooling = Some(location),
            SourceKind::Diff => diff = Some(location),
        }
    }

    Ok(TaskSpec {
        task_id: task.id,
        task_type: task.task_type,
        project_name: task.project_name,
        focus: task.focus,
        repo,
        fuzzing_tooling: fuzzing_tooling
            .ok_or_else(|| StageError::PoisonMessage(format!("task {task_id} has no fuzz tooling")))?,
        diff,
    })
}
