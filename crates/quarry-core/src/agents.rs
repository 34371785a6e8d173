//! Interfaces to the LLM-backed collaborators: seed generation, patch
//! generation, SARIF assessment. Their internals live outside this system;
//! workers receive them as trait objects. A command-backed implementation is
//! provided so a deployment can plug in any agent CLI.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::info;

use crate::types::{BugProfile, FuzzerKind};

// ── Seed generation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct SeedGenRequest {
    pub task_id: String,
    pub project_name: String,
    pub focus: String,
    pub harness: String,
    pub model: String,
    /// Directory the strategy writes generated seeds into.
    pub output_dir: PathBuf,
    /// Extracted source tree for the agent to read.
    pub source_dir: PathBuf,
}

#[async_trait]
pub trait SeedGenerator: Send + Sync {
    /// Strategy label; doubles as the Seed row's fuzzer kind.
    fn kind(&self) -> FuzzerKind;
    /// Generate seeds into `request.output_dir`; returns how many were written.
    async fn generate(&self, request: &SeedGenRequest) -> Result<usize>;
}

// ── Patch generation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PatchRequest {
    pub profile: PatchProfile,
    /// PoC paths the candidate patch must neutralize.
    pub poc_paths: Vec<String>,
    pub source_dir: PathBuf,
    pub mode: String,
}

/// Serializable subset of a bug profile handed to patch agents.
#[derive(Debug, Clone, Serialize)]
pub struct PatchProfile {
    pub id: i32,
    pub task_id: String,
    pub harness_name: String,
    pub sanitizer: String,
    pub sanitizer_bug_type: String,
    pub trigger_point: String,
    pub summary: String,
}

impl From<&BugProfile> for PatchProfile {
    fn from(p: &BugProfile) -> Self {
        Self {
            id: p.id,
            task_id: p.task_id.clone(),
            harness_name: p.harness_name.clone(),
            sanitizer: p.sanitizer.clone(),
            sanitizer_bug_type: p.sanitizer_bug_type.clone(),
            trigger_point: p.trigger_point.clone(),
            summary: p.summary.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedPatch {
    /// Unified diff text.
    pub diff: String,
    /// Origin label recorded on the Patch row.
    pub model: String,
}

#[async_trait]
pub trait PatchGenerator: Send + Sync {
    async fn generate(&self, request: &PatchRequest) -> Result<Option<GeneratedPatch>>;
}

// ── SARIF assessment ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SarifVerdict {
    pub correct: bool,
    pub description: String,
    #[serde(default)]
    pub bug_profile_id: Option<i32>,
}

#[async_trait]
pub trait SarifEvaluator: Send + Sync {
    async fn assess(&self, task_id: &str, sarif: &serde_json::Value) -> Result<SarifVerdict>;
}

// ── Command-backed implementations ────────────────────────────────────────

/// Runs an external agent CLI: the request is written to stdin as JSON and
/// stdout is the agent's answer. Nonzero exit means "no result".
pub struct CommandPatchGenerator {
    pub program: String,
    pub model: String,
    pub timeout: Duration,
}

impl CommandPatchGenerator {
    pub fn new(program: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            model: model.into(),
            timeout: Duration::from_secs(1800),
        }
    }
}

#[async_trait]
impl PatchGenerator for CommandPatchGenerator {
    async fn generate(&self, request: &PatchRequest) -> Result<Option<GeneratedPatch>> {
        let payload = serde_json::to_vec(request).context("serialize patch request")?;

        let mut child = Command::new(&self.program)
            .arg("--model")
            .arg(&self.model)
            .current_dir(&request.source_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn patch agent {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.context("write agent stdin")?;
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .context("patch agent timed out")?
            .context("wait for patch agent")?;

        if !output.status.success() {
            info!(
                "patch agent {} produced no patch for profile {} (exit {})",
                self.program,
                request.profile.id,
                output.status.code().unwrap_or(-1)
            );
            return Ok(None);
        }

        let diff = String::from_utf8_lossy(&output.stdout).into_owned();
        if diff.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(GeneratedPatch {
            diff,
            model: self.model.clone(),
        }))
    }
}

/// Seed strategy backed by an external CLI, one per (strategy, model) pair.
pub struct CommandSeedGenerator {
    pub program: String,
    pub kind: FuzzerKind,
    pub timeout: Duration,
}

#[async_trait]
impl SeedGenerator for CommandSeedGenerator {
    fn kind(&self) -> FuzzerKind {
        self.kind
    }

    async fn generate(&self, request: &SeedGenRequest) -> Result<usize> {
        std::fs::create_dir_all(&request.output_dir)?;
        let payload = serde_json::to_vec(request).context("serialize seedgen request")?;

        let mut child = Command::new(&self.program)
            .arg("--model")
            .arg(&request.model)
            .arg("--out")
            .arg(&request.output_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn seed agent {}", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&payload).await.context("write agent stdin")?;
        }

        let status = tokio::time::timeout(self.timeout, child.wait())
            .await
            .context("seed agent timed out")?
            .context("wait for seed agent")?;
        if !status.success() {
            return Ok(0);
        }

        let count = std::fs::read_dir(&request.output_dir)
            .map(|entries| entries.filter_map(|e| e.ok()).filter(|e| e.path().is_file()).count())
            .unwrap_or(0);
        Ok(count)
    }
}
