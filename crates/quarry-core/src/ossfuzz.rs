//! Facade over the OSS-Fuzz helper script. The helper is the authoritative
//! build tool; this module only shells out to it and interprets exit codes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::info;

use crate::docker::CmdOutput;

/// Marker symbols that identify harness binaries in the build output.
pub const CLIKE_HARNESS_MARKER: &[u8] = b"LLVMFuzzerTestOneInput";
pub const JVM_HARNESS_MARKER: &[u8] = b"fuzzerTestOneInput";

#[derive(Debug, Clone)]
pub struct OssFuzz {
    /// Extracted fuzz-tooling checkout containing `infra/helper.py`.
    pub tooling_dir: PathBuf,
    pub project: String,
}

impl OssFuzz {
    pub fn new(tooling_dir: impl Into<PathBuf>, project: impl Into<String>) -> Self {
        Self {
            tooling_dir: tooling_dir.into(),
            project: project.into(),
        }
    }

    pub fn helper_path(&self) -> PathBuf {
        self.tooling_dir.join("infra").join("helper.py")
    }

    /// `build/out/<project>` under the tooling checkout.
    pub fn out_dir(&self) -> PathBuf {
        self.tooling_dir.join("build").join("out").join(&self.project)
    }

    async fn helper(&self, args: &[String], timeout: Duration) -> Result<CmdOutput> {
        let mut cmd = Command::new("python3");
        cmd.arg(self.helper_path())
            .args(args)
            .current_dir(&self.tooling_dir)
            .stdin(Stdio::null());
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .with_context(|| format!("helper.py {} timed out", args.join(" ")))?
            .with_context(|| format!("run helper.py {}", args.join(" ")))?;
        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    pub async fn build_image(&self) -> Result<()> {
        let out = self
            .helper(
                &["build_image".into(), "--pull".into(), self.project.clone()],
                Duration::from_secs(1800),
            )
            .await?;
        if !out.success() {
            anyhow::bail!("build_image for {} failed: {}", self.project, tail(&out.stderr));
        }
        Ok(())
    }

    pub async fn build_fuzzers(
        &self,
        src_path: &Path,
        sanitizer: &str,
        engine: Option<&str>,
        env: &[(String, String)],
    ) -> Result<()> {
        let mut args = vec!["build_fuzzers".to_string()];
        if let Some(engine) = engine {
            args.push("--engine".into());
            args.push(engine.to_string());
        }
        args.push("--sanitizer".into());
        args.push(sanitizer.to_string());
        for (k, v) in env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push("--clean".into());
        args.push(self.project.clone());
        args.push(src_path.to_string_lossy().into_owned());

        info!("building fuzzers for {} ({sanitizer})", self.project);
        let out = self.helper(&args, Duration::from_secs(3600)).await?;
        if !out.success() {
            anyhow::bail!("build_fuzzers for {} failed: {}", self.project, tail(&out.stderr));
        }
        Ok(())
    }

    pub async fn check_build(&self, sanitizer: &str) -> Result<CmdOutput> {
        self.helper(
            &[
                "check_build".into(),
                "--sanitizer".into(),
                sanitizer.to_string(),
                self.project.clone(),
            ],
            Duration::from_secs(600),
        )
        .await
    }

    pub async fn reproduce(&self, harness: &str, testcase: &Path, timeout: Duration) -> Result<CmdOutput> {
        self.helper(
            &[
                "reproduce".into(),
                self.project.clone(),
                harness.to_string(),
                testcase.to_string_lossy().into_owned(),
            ],
            timeout,
        )
        .await
    }
}

fn tail(s: &str) -> &str {
    let mut start = s.len().saturating_sub(400);
    // Avoid splitting a UTF-8 codepoint.
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

/// Discover harness binaries in a build-out directory: executables whose
/// contents contain the harness-entrypoint marker.
pub fn find_fuzzers(out_dir: &Path, jvm: bool) -> Result<Vec<String>> {
    let marker: &[u8] = if jvm { JVM_HARNESS_MARKER } else { CLIKE_HARNESS_MARKER };
    let mut harnesses = Vec::new();
    let entries = std::fs::read_dir(out_dir)
        .with_context(|| format!("read build out dir {}", out_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        // Auxiliary build products that are never harnesses.
        if name.ends_with(".zip")
            || name.ends_with(".dict")
            || name.ends_with(".options")
            || name.ends_with(".json")
        {
            continue;
        }
        let Ok(contents) = std::fs::read(entry.path()) else {
            continue;
        };
        if contains(&contents, marker) {
            harnesses.push(name);
        }
    }
    harnesses.sort();
    Ok(harnesses)
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_fuzzers_matches_marker_and_skips_aux_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("fuzz_target"),
            b"\x7fELF...LLVMFuzzerTestOneInput...",
        )
        .unwrap();
        std::fs::write(dir.path().join("helper_lib"), b"\x7fELF...nothing here...").unwrap();
        std::fs::write(
            dir.path().join("fuzz_target_seed_corpus.zip"),
            b"LLVMFuzzerTestOneInput",
        )
        .unwrap();

        let found = find_fuzzers(dir.path(), false).unwrap();
        assert_eq!(found, vec!["fuzz_target".to_string()]);
    }

    #[test]
    fn find_fuzzers_jvm_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("PngFuzzer"), b"#!/bin/sh fuzzerTestOneInput").unwrap();
        let found = find_fuzzers(dir.path(), true).unwrap();
        assert_eq!(found, vec!["PngFuzzer".to_string()]);
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let s = "é".repeat(500);
        let t = tail(&s);
        assert!(t.len() <= 401);
        assert!(std::str::from_utf8(t.as_bytes()).is_ok());
    }
}
