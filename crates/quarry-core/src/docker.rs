//! Typed facade over the `docker` CLI with a single retry/timeout policy.
//! A `Docker` value targets either the local daemon or a remote
//! Docker-over-TCP host from the `dind:hosts` pool.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::coord::CoordStore;
use crate::keys;

#[derive(Debug, Clone)]
pub struct Docker {
    /// `None` targets the local daemon; `Some("tcp://host:2375")` a remote one.
    pub host: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Options for a detached `docker run`.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// (host_path, container_path, read_only)
    pub binds: Vec<(String, String, bool)>,
    pub env: Vec<(String, String)>,
    pub entrypoint: Option<String>,
    pub command: Vec<String>,
    pub privileged: bool,
}

impl Docker {
    pub fn local() -> Self {
        Self { host: None }
    }

    pub fn remote(host: impl Into<String>) -> Self {
        Self { host: Some(host.into()) }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("docker");
        if let Some(host) = &self.host {
            cmd.arg("-H").arg(host);
        }
        cmd
    }

    async fn output(&self, args: &[String], timeout: Duration) -> Result<CmdOutput> {
        let mut cmd = self.command();
        cmd.args(args).stdin(Stdio::null());
        let fut = cmd.output();
        let output = tokio::time::timeout(timeout, fut)
            .await
            .with_context(|| format!("docker {} timed out after {timeout:?}", args.join(" ")))?
            .with_context(|| format!("run docker {}", args.join(" ")))?;
        Ok(CmdOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    pub async fn available(&self) -> bool {
        self.command()
            .arg("version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Start a detached container; returns the container id.
    pub async fn run_detached(&self, spec: &RunSpec) -> Result<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];
        if !spec.name.is_empty() {
            args.push("--name".into());
            args.push(spec.name.clone());
        }
        if spec.privileged {
            args.push("--privileged".into());
        }
        for (host, container, ro) in &spec.binds {
            args.push("-v".into());
            if *ro {
                args.push(format!("{host}:{container}:ro"));
            } else {
                args.push(format!("{host}:{container}"));
            }
        }
        for (k, v) in &spec.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        if let Some(entrypoint) = &spec.entrypoint {
            args.push("--entrypoint".into());
            args.push(entrypoint.clone());
        }
        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());

        let out = self.output(&args, Duration::from_secs(120)).await?;
        if !out.success() {
            anyhow::bail!("docker run {} failed: {}", spec.name, out.stderr.trim());
        }
        Ok(out.stdout.trim().to_string())
    }

    /// Run a command inside a running container.
    pub async fn exec(&self, container: &str, command: &str, timeout: Duration) -> Result<CmdOutput> {
        let args = vec![
            "exec".to_string(),
            container.to_string(),
            "sh".to_string(),
            "-c".to_string(),
            command.to_string(),
        ];
        self.output(&args, timeout).await
    }

    pub async fn stop(&self, name: &str) -> Result<CmdOutput> {
        self.output(&["stop".to_string(), name.to_string()], Duration::from_secs(60))
            .await
    }

    pub async fn rm(&self, name: &str) -> Result<CmdOutput> {
        self.output(
            &["rm".to_string(), "-f".to_string(), name.to_string()],
            Duration::from_secs(60),
        )
        .await
    }

    /// Names of running containers whose name contains `fragment`.
    pub async fn container_names(&self, fragment: &str) -> Result<Vec<String>> {
        let out = self
            .output(
                &[
                    "ps".to_string(),
                    "--format".to_string(),
                    "{{.Names}}".to_string(),
                ],
                Duration::from_secs(30),
            )
            .await?;
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|n| !n.is_empty() && n.contains(fragment))
            .map(str::to_string)
            .collect())
    }

    /// Sum of container CPU percentages from a one-shot stats sample.
    pub async fn total_cpu_percent(&self) -> Result<f64> {
        let out = self
            .output(
                &[
                    "stats".to_string(),
                    "--no-stream".to_string(),
                    "--format".to_string(),
                    "{{.CPUPerc}}".to_string(),
                ],
                Duration::from_secs(60),
            )
            .await?;
        Ok(parse_cpu_percents(&out.stdout))
    }
}

/// Parse `docker stats` CPU column output ("12.5%\n0.3%\n") into a sum.
pub fn parse_cpu_percents(raw: &str) -> f64 {
    raw.lines()
        .filter_map(|line| line.trim().strip_suffix('%'))
        .filter_map(|v| v.parse::<f64>().ok())
        .sum()
}

/// Pick the registered Docker host with the lowest container CPU load that
/// stays under `max_load`; fall back to the local daemon. Unreachable hosts
/// are skipped.
pub async fn pick_build_host(cs: &CoordStore, max_load: f64) -> Docker {
    let hosts = match cs.smembers(keys::DIND_HOSTS).await {
        Ok(h) => h,
        Err(e) => {
            warn!("reading {} failed: {e:#}; using local daemon", keys::DIND_HOSTS);
            return Docker::local();
        }
    };

    let mut best: Option<(f64, Docker)> = None;
    for host in hosts {
        let docker = Docker::remote(host.clone());
        if !docker.available().await {
            warn!("docker host {host} unreachable, skipping");
            continue;
        }
        match docker.total_cpu_percent().await {
            Ok(load) if load < max_load => {
                debug!("docker host {host} at {load:.1}% cpu");
                if best.as_ref().map(|(b, _)| load < *b).unwrap_or(true) {
                    best = Some((load, docker));
                }
            }
            Ok(load) => debug!("docker host {host} over budget ({load:.1}% >= {max_load})"),
            Err(e) => warn!("stats sample for {host} failed: {e:#}"),
        }
    }

    best.map(|(_, d)| d).unwrap_or_else(Docker::local)
}

/// Stop and remove every container whose name contains `fragment`, across
/// the local daemon and all registered remote hosts.
pub async fn sweep_containers(cs: &CoordStore, fragment: &str) {
    let mut targets = vec![Docker::local()];
    if let Ok(hosts) = cs.smembers(keys::DIND_HOSTS).await {
        targets.extend(hosts.into_iter().map(Docker::remote));
    }
    for docker in targets {
        let names = match docker.container_names(fragment).await {
            Ok(n) => n,
            Err(_) => continue,
        };
        for name in names {
            if let Err(e) = docker.stop(&name).await {
                warn!("stop {name}: {e:#}");
            }
            if let Err(e) = docker.rm(&name).await {
                warn!("rm {name}: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_percent_parsing_sums_and_skips_garbage() {
        assert_eq!(parse_cpu_percents("12.5%\n0.5%\n"), 13.0);
        assert_eq!(parse_cpu_percents(""), 0.0);
        assert_eq!(parse_cpu_percents("not-a-number%\n3.0%\n--\n"), 3.0);
    }
}
