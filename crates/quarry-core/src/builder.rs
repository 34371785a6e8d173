//! Build/Reproduction Substrate: given `(task, sanitizer, repo_state)`,
//! produce a reusable build and a long-lived runner container for replaying
//! PoCs. Builds are cached per tuple on shared storage behind an advisory
//! lock; the `done` sentinel is only written after a successful publish, so
//! a second worker rebuilding after lock expiry stays idempotent.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::Config;
use crate::coord::CoordStore;
use crate::docker::{self, Docker, RunSpec};
use crate::keys;
use crate::ossfuzz::OssFuzz;
use crate::storage::{self, SharedStorage};
use crate::types::{RepoState, Sanitizer, TaskSpec};

const RUNNER_IMAGE: &str = "gcr.io/oss-fuzz-base/base-runner";
const BUILD_LOCK_TTL: Duration = Duration::from_secs(600);
const BUILD_LOCK_WAIT: Duration = Duration::from_secs(3600);

pub struct BuildSubstrate {
    cs: Arc<CoordStore>,
    storage: SharedStorage,
    instance: String,
    max_load: f64,
    local_cache_root: PathBuf,
}

/// A ready build plus its runner container.
#[derive(Debug, Clone)]
pub struct BuildEnv {
    pub tooling_dir: PathBuf,
    pub project: String,
    pub runner: String,
    /// Host directory the runner mounts (writable) at /poc.
    pub poc_dir: PathBuf,
    pub docker: Docker,
}

impl BuildEnv {
    pub fn out_dir(&self) -> PathBuf {
        self.tooling_dir.join("build").join("out").join(&self.project)
    }
}

#[derive(Debug, Clone)]
pub struct Replay {
    pub output: String,
    pub exit_code: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayVerdict {
    NoCrash,
    Crash,
    Timeout,
    RunnerDied,
}

/// Interpret a replay invocation per the runner contract.
pub fn classify_replay(exit_code: i32, output: &str) -> ReplayVerdict {
    if exit_code == 137 || output.contains("No such container") {
        return ReplayVerdict::RunnerDied;
    }
    if exit_code == 70 || output.contains("libFuzzer: timeout after") {
        return ReplayVerdict::Timeout;
    }
    if exit_code == 0 {
        ReplayVerdict::NoCrash
    } else {
        ReplayVerdict::Crash
    }
}

impl BuildSubstrate {
    pub fn new(cs: Arc<CoordStore>, cfg: &Config) -> Self {
        Self {
            cs,
            storage: SharedStorage::new(&cfg.storage_dir),
            instance: cfg.instance.clone(),
            max_load: cfg.max_load,
            local_cache_root: PathBuf::from(".tmp").join("build_cache"),
        }
    }

    fn runner_name(&self, suffix: &str) -> String {
        format!("reproducer_triage_runner_{}{suffix}", self.instance)
    }

    /// Ensure the `(task, sanitizer, state)` build exists and a runner for it
    /// is up on this pod.
    pub async fn ensure_build(
        &self,
        spec: &TaskSpec,
        sanitizer: Sanitizer,
        state: RepoState,
    ) -> Result<BuildEnv> {
        let lock_key = keys::build_lock(&spec.task_id, sanitizer, state);
        let status_key = keys::build_status(&spec.task_id, sanitizer, state);

        let lock = self
            .cs
            .lock(&lock_key, BUILD_LOCK_TTL, BUILD_LOCK_WAIT)
            .await?
            .context("build lock wait exhausted")?;

        let result = self.build_locked(spec, sanitizer, state, &status_key).await;
        if let Err(e) = self.cs.release(&lock).await {
            warn!("release {lock_key}: {e:#}");
        }
        let (cache_dir, tooling_name) = result?;

        self.ensure_runner(spec, sanitizer, state, &cache_dir, &tooling_name, "")
            .await
    }

    /// Body run under the build lock: reuse the shared cache when the `done`
    /// sentinel exists, otherwise build and publish.
    async fn build_locked(
        &self,
        spec: &TaskSpec,
        sanitizer: Sanitizer,
        state: RepoState,
        status_key: &str,
    ) -> Result<(PathBuf, String)> {
        let global_cache = self
            .storage
            .build_cache_dir(&spec.task_id, sanitizer.as_str(), state.as_str());

        if self.cs.get(status_key).await?.as_deref() == Some("done") {
            info!(
                "build cache hit for {}:{}:{}",
                spec.task_id,
                sanitizer.as_str(),
                state.as_str()
            );
            let tooling_name = read_tooling_name(&global_cache)?;
            return Ok((global_cache, tooling_name));
        }

        self.cs.set(status_key, "building").await?;

        let local_cache = self
            .local_cache_root
            .join(&spec.task_id)
            .join(sanitizer.as_str())
            .join(state.as_str());
        std::fs::create_dir_all(&local_cache)?;

        let tooling_name = extract_sources(spec, &local_cache, state == RepoState::Patched).await?;

        let ossfuzz = OssFuzz::new(local_cache.join(&tooling_name), spec.project_name.clone());
        ossfuzz.build_image().await?;
        ossfuzz
            .build_fuzzers(&local_cache.join(&spec.focus), sanitizer.as_str(), None, &[])
            .await?;

        // Publish build/out/<project> to the shared cache, then mark done.
        let rel_out = Path::new(&tooling_name)
            .join("build")
            .join("out")
            .join(&spec.project_name);
        let src_out = local_cache.join(&rel_out);
        if !src_out.is_dir() {
            bail!("build output missing at {}", src_out.display());
        }
        let dst_out = global_cache.join(&rel_out);
        std::fs::create_dir_all(dst_out.parent().context("out dir parent")?)?;
        storage::copy_dir_all(&src_out, &dst_out)?;
        write_tooling_name(&global_cache, &tooling_name)?;

        self.cs.set(status_key, "done").await?;
        info!(
            "published build for {}:{}:{}",
            spec.task_id,
            sanitizer.as_str(),
            state.as_str()
        );
        Ok((global_cache, tooling_name))
    }

    /// Launch the per-pod runner container unless one is already up.
    async fn ensure_runner(
        &self,
        spec: &TaskSpec,
        sanitizer: Sanitizer,
        state: RepoState,
        cache_dir: &Path,
        tooling_name: &str,
        name_suffix: &str,
    ) -> Result<BuildEnv> {
        let tooling_dir = cache_dir.join(tooling_name);
        let out_dir = tooling_dir.join("build").join("out").join(&spec.project_name);
        let poc_dir = std::path::absolute(PathBuf::from(".tmp").join("poc"))
            .unwrap_or_else(|_| PathBuf::from(".tmp/poc"));
        std::fs::create_dir_all(&poc_dir)?;

        let docker = docker::pick_build_host(&self.cs, self.max_load).await;
        let runner = self.runner_name(name_suffix);
        let status_key = keys::runner_status(&self.instance, &spec.task_id, sanitizer, state);

        if self.cs.get(&status_key).await?.as_deref() != Some("launched") {
            self.cs.set(&status_key, "launching").await?;
            // A stale container with the deterministic name may survive a
            // worker restart; clear it first.
            let _ = docker.rm(&runner).await;
            docker
                .run_detached(&RunSpec {
                    name: runner.clone(),
                    image: RUNNER_IMAGE.to_string(),
                    binds: vec![
                        (out_dir.to_string_lossy().into_owned(), "/out".into(), true),
                        (poc_dir.to_string_lossy().into_owned(), "/poc".into(), false),
                    ],
                    env: vec![("FUZZING_ENGINE".into(), "libfuzzer".into())],
                    entrypoint: Some("/bin/sh".into()),
                    command: vec!["-c".into(), "tail -f /dev/null".into()],
                    privileged: false,
                })
                .await?;
            self.cs.set(&status_key, "launched").await?;
            info!("launched runner {runner}");
        }

        Ok(BuildEnv {
            tooling_dir,
            project: spec.project_name.clone(),
            runner,
            poc_dir,
            docker,
        })
    }

    /// Replay a PoC inside the env's runner. The runner is relaunched and the
    /// replay retried when the container died underneath us.
    pub async fn replay_poc(
        &self,
        env: &BuildEnv,
        harness: &str,
        poc_path: &Path,
        timeout: Duration,
    ) -> Result<Replay> {
        for attempt in 0..3u32 {
            let replay = self.replay_once(env, harness, poc_path, timeout).await?;
            match classify_replay(replay.exit_code, &replay.output) {
                ReplayVerdict::RunnerDied => {
                    warn!(
                        "runner {} died replaying {harness} (attempt {attempt}), relaunching",
                        env.runner
                    );
                    self.relaunch_runner(env).await?;
                }
                _ => return Ok(replay),
            }
        }
        bail!("runner {} kept dying during replay", env.runner)
    }

    async fn replay_once(
        &self,
        env: &BuildEnv,
        harness: &str,
        poc_path: &Path,
        timeout: Duration,
    ) -> Result<Replay> {
        // Stage the PoC into a fresh subdirectory of the shared /poc mount.
        let slot = uuid::Uuid::new_v4().to_string();
        let slot_dir = env.poc_dir.join(&slot);
        std::fs::create_dir_all(&slot_dir)?;
        let file_name = poc_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "poc".to_string());
        std::fs::copy(poc_path, slot_dir.join(&file_name))
            .with_context(|| format!("stage poc {}", poc_path.display()))?;

        // -runs=100 exercises the input against the engine's deterministic
        // replayer.
        let command = format!("/out/{harness} -runs=100 /poc/{slot}");
        let result = env.docker.exec(&env.runner, &command, timeout).await;
        std::fs::remove_dir_all(&slot_dir).ok();

        let out = result?;
        Ok(Replay {
            output: format!("{}\n{}", out.stdout, out.stderr),
            exit_code: out.exit_code,
        })
    }

    async fn relaunch_runner(&self, env: &BuildEnv) -> Result<()> {
        let _ = env.docker.rm(&env.runner).await;
        env.docker
            .run_detached(&RunSpec {
                name: env.runner.clone(),
                image: RUNNER_IMAGE.to_string(),
                binds: vec![
                    (env.out_dir().to_string_lossy().into_owned(), "/out".into(), true),
                    (env.poc_dir.to_string_lossy().into_owned(), "/poc".into(), false),
                ],
                env: vec![("FUZZING_ENGINE".into(), "libfuzzer".into())],
                entrypoint: Some("/bin/sh".into()),
                command: vec!["-c".into(), "tail -f /dev/null".into()],
                privileged: false,
            })
            .await?;
        Ok(())
    }

    /// Build the task with a candidate patch applied on top of the delta
    /// state, in an uncached per-call workspace with its own ephemeral
    /// runner. Used by the patch worker to test candidates against PoCs.
    pub async fn build_with_candidate(
        &self,
        spec: &TaskSpec,
        sanitizer: Sanitizer,
        candidate_diff: &str,
    ) -> Result<BuildEnv> {
        let scratch = self
            .local_cache_root
            .join("candidates")
            .join(uuid::Uuid::new_v4().to_string());
        std::fs::create_dir_all(&scratch)?;

        let tooling_name = extract_sources(spec, &scratch, spec.diff.is_some()).await?;

        let patch_file = scratch.join("candidate.diff");
        std::fs::write(&patch_file, candidate_diff)?;
        apply_patch_file(&scratch.join(&spec.focus), &patch_file).await?;

        let ossfuzz = OssFuzz::new(scratch.join(&tooling_name), spec.project_name.clone());
        ossfuzz.build_image().await?;
        ossfuzz
            .build_fuzzers(&scratch.join(&spec.focus), sanitizer.as_str(), None, &[])
            .await?;

        let suffix = format!("_candidate_{}", uuid::Uuid::new_v4().simple());
        self.ensure_candidate_runner(spec, &scratch, &tooling_name, &suffix).await
    }

    async fn ensure_candidate_runner(
        &self,
        spec: &TaskSpec,
        cache_dir: &Path,
        tooling_name: &str,
        suffix: &str,
    ) -> Result<BuildEnv> {
        let tooling_dir = cache_dir.join(tooling_name);
        let out_dir = tooling_dir.join("build").join("out").join(&spec.project_name);
        let poc_dir = cache_dir.join("poc");
        std::fs::create_dir_all(&poc_dir)?;

        let docker = docker::pick_build_host(&self.cs, self.max_load).await;
        let runner = self.runner_name(suffix);
        docker
            .run_detached(&RunSpec {
                name: runner.clone(),
                image: RUNNER_IMAGE.to_string(),
                binds: vec![
                    (out_dir.to_string_lossy().into_owned(), "/out".into(), true),
                    (poc_dir.to_string_lossy().into_owned(), "/poc".into(), false),
                ],
                env: vec![("FUZZING_ENGINE".into(), "libfuzzer".into())],
                entrypoint: Some("/bin/sh".into()),
                command: vec!["-c".into(), "tail -f /dev/null".into()],
                privileged: false,
            })
            .await?;

        Ok(BuildEnv {
            tooling_dir,
            project: spec.project_name.clone(),
            runner,
            poc_dir,
            docker,
        })
    }

    /// Stop and remove an ephemeral runner (candidate builds only; the
    /// per-pod triage runner stays up for reuse).
    pub async fn teardown_runner(&self, env: &BuildEnv) {
        let _ = env.docker.stop(&env.runner).await;
        let _ = env.docker.rm(&env.runner).await;
    }
}

/// Extract all task archives into `dest` and (optionally) apply the task
/// diff under `<dest>/<focus>`. Returns the fuzz-tooling directory name.
pub async fn extract_sources(spec: &TaskSpec, dest: &Path, apply_diff: bool) -> Result<String> {
    for repo in &spec.repo {
        storage::extract_tar_gz(Path::new(repo), dest)
            .with_context(|| format!("extract repo {repo}"))?;
    }

    let tooling_name = storage::extract_tar_gz(Path::new(&spec.fuzzing_tooling), dest)
        .context("extract fuzz tooling")?
        .context("fuzz tooling archive has no single top-level directory")?;
    write_tooling_name(dest, &tooling_name)?;

    if let Some(diff) = &spec.diff {
        let diff_name = storage::extract_tar_gz(Path::new(diff), dest)
            .with_context(|| format!("extract diff {diff}"))?;
        if apply_diff {
            let focus_dir = dest.join(&spec.focus);
            match diff_name {
                Some(name) => apply_diff_entry(&focus_dir, &dest.join(name)).await?,
                None => warn!("diff archive for {} has no single top-level entry", spec.task_id),
            }
        }
    }

    Ok(tooling_name)
}

/// Apply a diff entry which is either a single patch file or a directory of
/// `.patch`/`.diff` files.
async fn apply_diff_entry(focus_dir: &Path, diff_path: &Path) -> Result<()> {
    if diff_path.is_file() {
        return apply_patch_file(focus_dir, diff_path).await;
    }
    if diff_path.is_dir() {
        let mut entries: Vec<PathBuf> = std::fs::read_dir(diff_path)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .map(|ext| ext == "patch" || ext == "diff")
                    .unwrap_or(false)
            })
            .collect();
        entries.sort();
        for patch in entries {
            apply_patch_file(focus_dir, &patch).await?;
        }
        return Ok(());
    }
    bail!("diff path {} is neither file nor directory", diff_path.display())
}

/// `patch --batch --no-backup-if-mismatch -p1 < file` in `dir`.
pub async fn apply_patch_file(dir: &Path, patch_file: &Path) -> Result<()> {
    let stdin = std::fs::File::open(patch_file)
        .with_context(|| format!("open patch {}", patch_file.display()))?;
    let status = Command::new("patch")
        .args(["--batch", "--no-backup-if-mismatch", "-p1"])
        .current_dir(dir)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .context("run patch")?;
    if !status.success() {
        bail!("patch {} did not apply cleanly", patch_file.display());
    }
    info!("applied {} under {}", patch_file.display(), dir.display());
    Ok(())
}

fn tooling_name_file(cache_dir: &Path) -> PathBuf {
    cache_dir.join("fuzz_tooling_dir.txt")
}

fn write_tooling_name(cache_dir: &Path, name: &str) -> Result<()> {
    std::fs::create_dir_all(cache_dir)?;
    std::fs::write(tooling_name_file(cache_dir), name).context("record tooling dir name")
}

fn read_tooling_name(cache_dir: &Path) -> Result<String> {
    let path = tooling_name_file(cache_dir);
    let name = std::fs::read_to_string(&path)
        .with_context(|| format!("read {}", path.display()))?;
    Ok(name.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_classification_follows_the_runner_contract() {
        assert_eq!(classify_replay(0, "Done 100 runs\n"), ReplayVerdict::NoCrash);
        assert_eq!(classify_replay(1, "ERROR: AddressSanitizer: ..."), ReplayVerdict::Crash);
        assert_eq!(classify_replay(70, ""), ReplayVerdict::Timeout);
        assert_eq!(
            classify_replay(1, "==1==ERROR: libFuzzer: timeout after 60 seconds"),
            ReplayVerdict::Timeout
        );
        assert_eq!(classify_replay(137, ""), ReplayVerdict::RunnerDied);
        assert_eq!(
            classify_replay(1, "Error response from daemon: No such container: runner"),
            ReplayVerdict::RunnerDied
        );
    }

    #[test]
    fn tooling_name_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        write_tooling_name(dir.path(), "oss-fuzz").unwrap();
        assert_eq!(read_tooling_name(dir.path()).unwrap(), "oss-fuzz");
    }
}
