use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use quarry_core::agents::{CommandPatchGenerator, CommandSeedGenerator};
use quarry_core::builder::BuildSubstrate;
use quarry_core::bus::QueueBus;
use quarry_core::config::Config;
use quarry_core::control::ControlPlane;
use quarry_core::coord::CoordStore;
use quarry_core::db::Store;
use quarry_core::oracle::TriggerPointOracle;
use quarry_core::ossfuzz::OssFuzz;
use quarry_core::storage::SharedStorage;
use quarry_core::types::{FuzzerKind, SourceKind, Task, TaskStatus, TaskType};
use quarry_submitter::loops::SubmissionLoop;
use quarry_submitter::scoring::ScoringClient;
use quarry_submitter::selector::PatchSubmitter;
use quarry_workers::monitor::Monitor;
use quarry_workers::worker::{run_stage, StageWorker, WorkerContext};

#[derive(Parser)]
#[command(name = "quarryd", about = "CRS pipeline worker and build tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one long-lived stage worker.
    RunWorker {
        #[arg(value_enum)]
        stage: Stage,
    },
    /// Build a project's fuzzers from extracted sources.
    Build {
        project_name: String,
        src_path: PathBuf,
        task_id: String,
        /// Skip the post-build harness check.
        #[arg(long)]
        skip_check: bool,
        /// Use an existing OSS-Fuzz checkout instead of the shared one.
        #[arg(long)]
        share_oss_fuzz_path: Option<PathBuf>,
    },
    /// Replay a crash against a built project.
    ReproduceCrash {
        task_id: String,
        project: String,
        harness: String,
        testcase: PathBuf,
        /// Copy this artifact into the build output before reproducing.
        #[arg(long)]
        artifact_path: Option<PathBuf>,
    },
    /// Register a task from a JSON description file.
    CreateTask {
        /// JSON: {"id", "task_type", "project_name", "focus", "deadline",
        /// "sources": [{"type", "path", "sha256"}], "metadata"?}
        task_file: PathBuf,
    },
    /// Signal cancellation; workers stop at their next safe point.
    CancelTask { task_id: String },
    /// Print the live status workers observe for a task.
    TaskStatus { task_id: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum Stage {
    Corpus,
    Cmin,
    Seedgen,
    Slice,
    SliceR18,
    Directed,
    Triage,
    TimeoutProcessor,
    Dedup,
    Patch,
    Submitter,
}

#[tokio::main]
async fn main() -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "quarryd=info,quarry_core=info,quarry_workers=info,quarry_submitter=info".into()
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let cfg = Arc::new(Config::from_env()?);

    match cli.command {
        Command::RunWorker { stage } => run_worker(cfg, stage).await,
        Command::Build {
            project_name,
            src_path,
            task_id,
            skip_check,
            share_oss_fuzz_path,
        } => build(cfg, project_name, src_path, task_id, skip_check, share_oss_fuzz_path).await,
        Command::ReproduceCrash {
            task_id,
            project,
            harness,
            testcase,
            artifact_path,
        } => reproduce_crash(cfg, task_id, project, harness, testcase, artifact_path).await,
        Command::CreateTask { task_file } => create_task(cfg, task_file).await,
        Command::CancelTask { task_id } => {
            let control = control_plane(&cfg).await?;
            control.cancel_task(&task_id).await
        }
        Command::TaskStatus { task_id } => {
            let control = control_plane(&cfg).await?;
            match control.observed_status(&task_id).await? {
                Some(status) => println!("{}", status.as_str()),
                None => println!("unknown"),
            }
            Ok(())
        }
    }
}

async fn control_plane(cfg: &Config) -> Result<ControlPlane> {
    let cs = Arc::new(CoordStore::connect(cfg).await?);
    let db = Arc::new(Store::connect(&cfg.database_url)?);
    db.migrate().await?;
    Ok(ControlPlane::new(cs, db))
}

/// Parse the task description file and register the task plus its sources.
async fn create_task(cfg: Arc<Config>, task_file: PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(&task_file)
        .with_context(|| format!("read {}", task_file.display()))?;
    let desc: serde_json::Value = serde_json::from_str(&raw).context("parse task file")?;

    let field = |name: &str| -> Result<String> {
        desc.get(name)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .with_context(|| format!("task file missing {name:?}"))
    };
    let task_type = TaskType::parse(&field("task_type")?)
        .context("task_type must be full or delta")?;
    let task = Task {
        id: field("id")?,
        task_type,
        project_name: field("project_name")?,
        focus: field("focus")?,
        deadline: desc
            .get("deadline")
            .and_then(|v| v.as_i64())
            .context("task file missing deadline")?,
        status: TaskStatus::Processing,
        created_at: chrono::Utc::now(),
        metadata: desc.get("metadata").cloned().unwrap_or(serde_json::Value::Null),
    };

    let control = control_plane(&cfg).await?;
    control.create_task(&task).await?;

    if let Some(sources) = desc.get("sources").and_then(|v| v.as_array()) {
        for source in sources {
            let kind = source
                .get("type")
                .and_then(|v| v.as_str())
                .and_then(SourceKind::parse)
                .context("source type must be repo, fuzz_tooling, or diff")?;
            let path = source.get("path").and_then(|v| v.as_str());
            let url = source.get("url").and_then(|v| v.as_str()).or(path).unwrap_or_default();
            let sha256 = source.get("sha256").and_then(|v| v.as_str()).unwrap_or_default();
            control.db.insert_source(&task.id, sha256, kind, url, path).await?;
        }
    }
    info!("task {} created", task.id);
    Ok(())
}

async fn run_worker(cfg: Arc<Config>, stage: Stage) -> Result<()> {
    let storage = SharedStorage::new(&cfg.storage_dir);
    storage.check().context("shared storage unavailable")?;

    let cs = Arc::new(CoordStore::connect(&cfg).await?);
    let db = Arc::new(Store::connect(&cfg.database_url)?);
    db.migrate().await?;
    let bus = Arc::new(QueueBus::connect(&cfg.rabbitmq_host).await?);
    let brs = Arc::new(BuildSubstrate::new(Arc::clone(&cs), &cfg));

    let ctx = Arc::new(WorkerContext {
        cfg: Arc::clone(&cfg),
        cs: Arc::clone(&cs),
        bus,
        db: Arc::clone(&db),
        storage,
        brs,
    });

    info!(
        "worker {} up; telemetry exporter {} ({}, custom headers: {})",
        cfg.instance,
        cfg.otel_endpoint,
        cfg.otel_protocol,
        !cfg.otel_headers.is_empty()
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                cancel.cancel();
            }
        });
    }

    // Every worker process carries the cancellation monitor so canceled
    // tasks lose their containers within a bounded number of ticks.
    let monitor = Monitor::new(Arc::clone(&cs), Arc::clone(&db), cfg.monitor_interval_s);
    let monitor_handle = tokio::spawn(monitor.run(cancel.clone()));

    let result = match stage {
        Stage::Submitter => {
            let scoring = Arc::new(ScoringClient::new(&cfg.scoring_api_base)?);
            let selector = PatchSubmitter::new(Arc::clone(&db));
            let submission = Arc::new(SubmissionLoop::new(Arc::clone(&db), Arc::clone(&cs), scoring));
            let selector_handle = tokio::spawn(selector.run(cancel.clone()));
            submission.run(cancel.clone()).await;
            selector_handle.await.ok();
            Ok(())
        }
        other => {
            let worker = stage_worker(&cfg, other);
            run_stage(ctx, worker, cancel.clone()).await
        }
    };

    cancel.cancel();
    monitor_handle.await.ok();

    if let Err(e) = &result {
        error!("worker exited with error: {e:#}");
    }
    result
}

fn stage_worker(cfg: &Config, stage: Stage) -> Arc<dyn StageWorker> {
    let oracle = Arc::new(TriggerPointOracle);
    match stage {
        Stage::Corpus => Arc::new(quarry_workers::corpus::CorpusWorker),
        Stage::Cmin => Arc::new(quarry_workers::cmin::CminWorker),
        Stage::Seedgen => {
            let program = std::env::var("SEEDGEN_AGENT_CMD").unwrap_or_else(|_| "seedgen-agent".into());
            let strategies: Vec<Arc<dyn quarry_core::agents::SeedGenerator>> = vec![
                Arc::new(CommandSeedGenerator {
                    program: program.clone(),
                    kind: FuzzerKind::Seedgen,
                    timeout: Duration::from_secs(1800),
                }),
                Arc::new(CommandSeedGenerator {
                    program: program.clone(),
                    kind: FuzzerKind::Seedmini,
                    timeout: Duration::from_secs(1800),
                }),
                Arc::new(CommandSeedGenerator {
                    program,
                    kind: FuzzerKind::Seedcodex,
                    timeout: Duration::from_secs(1800),
                }),
            ];
            let mcp_strategy = std::env::var("SEEDGEN_MCP_CMD").ok().map(|program| {
                Arc::new(CommandSeedGenerator {
                    program,
                    kind: FuzzerKind::Seedgen,
                    timeout: Duration::from_secs(1800),
                }) as Arc<dyn quarry_core::agents::SeedGenerator>
            });
            Arc::new(quarry_workers::seedgen::SeedgenWorker {
                strategies,
                mcp_strategy,
            })
        }
        Stage::Slice => Arc::new(quarry_workers::slice::SliceWorker::new()),
        Stage::SliceR18 => Arc::new(quarry_workers::slice::SliceWorker::r18()),
        Stage::Directed => Arc::new(quarry_workers::directed::DirectedWorker),
        // QUEUE_NAME lets a triage pod consume the timeout queue without a
        // distinct stage name, as the processor role expects.
        Stage::Triage if cfg.queue_name == quarry_core::types::queues::TIMEOUT => {
            Arc::new(quarry_workers::triage::TriageWorker::timeout_pool(oracle))
        }
        Stage::Triage => Arc::new(quarry_workers::triage::TriageWorker::new(oracle)),
        Stage::TimeoutProcessor => Arc::new(quarry_workers::triage::TriageWorker::timeout_pool(oracle)),
        Stage::Dedup => Arc::new(quarry_workers::dedup::DedupWorker { oracle }),
        Stage::Patch => {
            let program = std::env::var("PATCH_AGENT_CMD").unwrap_or_else(|_| "patch-agent".into());
            Arc::new(quarry_workers::patch::PatchWorker {
                generator: Arc::new(CommandPatchGenerator::new(program, cfg.dedup_model.clone())),
            })
        }
        Stage::Submitter => unreachable!("handled by run_worker"),
    }
}

async fn build(
    cfg: Arc<Config>,
    project_name: String,
    src_path: PathBuf,
    task_id: String,
    skip_check: bool,
    share_oss_fuzz_path: Option<PathBuf>,
) -> Result<()> {
    if !src_path.is_dir() {
        anyhow::bail!("src path {} is not a directory", src_path.display());
    }
    let tooling = share_oss_fuzz_path
        .unwrap_or_else(|| PathBuf::from(&cfg.storage_dir).join("oss-fuzz"));
    if !tooling.is_dir() {
        anyhow::bail!("fuzz tooling checkout {} is not a directory", tooling.display());
    }

    let ossfuzz = OssFuzz::new(tooling, project_name.clone());
    ossfuzz.build_image().await?;
    ossfuzz.build_fuzzers(&src_path, "address", None, &[]).await?;
    if !skip_check {
        let check = ossfuzz.check_build("address").await?;
        if !check.success() {
            anyhow::bail!("check_build failed for {project_name}: {}", check.stderr.trim());
        }
    }

    if cfg.enable_copy_artifact {
        let storage = SharedStorage::new(&cfg.storage_dir);
        let dest = storage.public_build_dir(&task_id);
        quarry_core::storage::copy_dir_all(&ossfuzz.out_dir(), &dest)?;
        info!("build output published to {}", dest.display());
    }

    info!("build finished for {project_name} (task {task_id})");
    Ok(())
}

async fn reproduce_crash(
    cfg: Arc<Config>,
    task_id: String,
    project: String,
    harness: String,
    testcase: PathBuf,
    artifact_path: Option<PathBuf>,
) -> Result<()> {
    if !testcase.is_file() {
        anyhow::bail!("testcase {} is not a file", testcase.display());
    }

    let storage = SharedStorage::new(&cfg.storage_dir);
    let cache = storage.build_cache_dir(&task_id, "address", "unpatched");
    let tooling_name = std::fs::read_to_string(cache.join("fuzz_tooling_dir.txt"))
        .with_context(|| format!("no cached build for task {task_id}"))?;
    let ossfuzz = OssFuzz::new(cache.join(tooling_name.trim()), project);

    if let Some(artifact) = artifact_path {
        let dest = ossfuzz.out_dir().join(&harness);
        std::fs::copy(&artifact, &dest)
            .with_context(|| format!("stage artifact {}", artifact.display()))?;
    }

    let out = ossfuzz
        .reproduce(&harness, &testcase, Duration::from_secs(cfg.replay_timeout_s))
        .await?;
    println!("{}", out.stdout);
    eprintln!("{}", out.stderr);
    info!("reproduce exited with {}", out.exit_code);
    if out.exit_code == 0 {
        info!("no crash reproduced");
    }
    Ok(())
}
