//! Seedgen worker: drives the LLM-backed seed generation strategies across
//! the configured model list. Every strategy writes into its own
//! per-model-per-harness directory on shared storage; outputs become Seed
//! rows and (for non-JVM projects) flow back into corpus minimization. The
//! MCP-adapter strategy additionally registers its seeds as potential bugs.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use quarry_core::agents::{SeedGenRequest, SeedGenerator};
use quarry_core::builder;
use quarry_core::bus::MessageHeaders;
use quarry_core::error::StageError;
use quarry_core::ossfuzz;
use quarry_core::storage;
use quarry_core::types::{
    queues, Bug, CminMessage, RepoState, Sanitizer, Seed, SeedgenMessage, TaskType,
};

use crate::worker::{Envelope, StageWorker, WorkerContext};

pub struct SeedgenWorker {
    /// Generic / minimal / codex-style strategies.
    pub strategies: Vec<Arc<dyn SeedGenerator>>,
    /// MCP-adapter strategy; its seeds are also saved as bugs for triage.
    pub mcp_strategy: Option<Arc<dyn SeedGenerator>>,
}

#[async_trait]
impl StageWorker for SeedgenWorker {
    fn queue(&self) -> &'static str {
        queues::SEEDGEN
    }

    async fn handle(&self, ctx: &WorkerContext, envelope: Envelope) -> Result<(), StageError> {
        let msg: SeedgenMessage = envelope.decode()?;
        let workspace = crate::workspace::Workspace::create("seedgen")
            .map_err(|e| StageError::Fatal(format!("workspace: {e:#}")))?;
        builder::extract_sources(&msg, workspace.path(), msg.diff.is_some())
            .await
            .map_err(StageError::transient)?;

        let state = match msg.task_type {
            TaskType::Full => RepoState::Unpatched,
            TaskType::Delta => RepoState::Patched,
        };
        let env = ctx
            .brs
            .ensure_build(&msg, Sanitizer::Address, state)
            .await
            .map_err(|e| StageError::BuildFailure(format!("{e:#}")))?;
        let out_dir = env.out_dir();
        let mut harnesses = ossfuzz::find_fuzzers(&out_dir, false).map_err(StageError::transient)?;
        let is_jvm = if harnesses.is_empty() {
            harnesses = ossfuzz::find_fuzzers(&out_dir, true).map_err(StageError::transient)?;
            !harnesses.is_empty()
        } else {
            false
        };
        if harnesses.is_empty() {
            warn!("task {}: no harnesses, nothing to seed", msg.task_id);
            return Ok(());
        }

        let models = if ctx.cfg.seedgen_models.is_empty() {
            vec!["default".to_string()]
        } else {
            ctx.cfg.seedgen_models.clone()
        };

        for model in &models {
            for strategy in &self.strategies {
                self.run_strategy(ctx, &msg, strategy.as_ref(), model, &harnesses, is_jvm, false, workspace.path())
                    .await?;
            }
            if let Some(mcp) = &self.mcp_strategy {
                self.run_strategy(ctx, &msg, mcp.as_ref(), model, &harnesses, is_jvm, true, workspace.path())
                    .await?;
            }
        }
        Ok(())
    }
}

impl SeedgenWorker {
    #[allow(clippy::too_many_arguments)]
    async fn run_strategy(
        &self,
        ctx: &WorkerContext,
        msg: &SeedgenMessage,
        strategy: &dyn SeedGenerator,
        model: &str,
        harnesses: &[String],
        is_jvm: bool,
        save_bugs: bool,
        source_root: &Path,
    ) -> Result<(), StageError> {
        let kind = strategy.kind();
        for harness in harnesses {
            let out_dir = ctx
                .storage
                .seeds_dir(&msg.task_id, model, harness)
                .join(kind.as_str());

            let request = SeedGenRequest {
                task_id: msg.task_id.clone(),
                project_name: msg.project_name.clone(),
                focus: msg.focus.clone(),
                harness: harness.clone(),
                model: model.to_string(),
                output_dir: out_dir.clone(),
                source_dir: source_root.join(&msg.focus),
            };

            let count = match strategy.generate(&request).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        "seed strategy {} failed for {}:{harness}: {e:#}",
                        kind.as_str(),
                        msg.task_id
                    );
                    continue;
                }
            };
            if count == 0 {
                continue;
            }
            info!(
                "seed strategy {} wrote {count} seeds for {}:{harness} ({model})",
                kind.as_str(),
                msg.task_id
            );

            let tarball = out_dir.with_extension("tar.gz");
            storage::pack_tar_gz(&out_dir, &tarball).map_err(StageError::transient)?;

            ctx.db
                .insert_seed(&Seed {
                    id: 0,
                    task_id: msg.task_id.clone(),
                    path: tarball.to_string_lossy().into_owned(),
                    harness_name: harness.clone(),
                    fuzzer: kind,
                    instance: ctx.cfg.instance.clone(),
                    coverage: None,
                    metric: None,
                })
                .await
                .map_err(StageError::transient)?;

            if !is_jvm {
                ctx.bus
                    .publish_json(
                        queues::CMIN,
                        &CminMessage {
                            task_id: msg.task_id.clone(),
                            harness: harness.clone(),
                            seeds: tarball.to_string_lossy().into_owned(),
                        },
                        None,
                        &MessageHeaders::default(),
                    )
                    .await
                    .map_err(StageError::transient)?;
            }

            if save_bugs {
                let entries = std::fs::read_dir(&out_dir).map_err(StageError::transient)?;
                for entry in entries.flatten() {
                    if !entry.path().is_file() {
                        continue;
                    }
                    ctx.db
                        .insert_bug(&Bug {
                            id: 0,
                            task_id: msg.task_id.clone(),
                            architecture: "x86_64".to_string(),
                            poc: entry.path().to_string_lossy().into_owned(),
                            harness_name: harness.clone(),
                            sanitizer: "*".to_string(),
                            sarif_report: None,
                        })
                        .await
                        .map_err(StageError::transient)?;
                }
            }
        }
        Ok(())
    }
}
