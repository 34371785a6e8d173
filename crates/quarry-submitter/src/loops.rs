//! Submission loop: a two-phase async flow over coordination-store work
//! sets. `fetch_data` materializes POV / patch / SARIF submission bodies
//! into the store, `submit` creates submissions against the scoring API,
//! `confirm` polls until terminal status, and `bundle` pairs passing POVs
//! with passing patches.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quarry_core::coord::CoordStore;
use quarry_core::db::Store;
use quarry_core::keys;
use quarry_core::types::{SubmissionStatus, TaskStatus};

use crate::scoring::ScoringClient;

const FETCH_PERIOD: Duration = Duration::from_secs(30);
const IDLE_SLEEP: Duration = Duration::from_secs(1);

/// `submitter:<kind>:<task>:<id>:<profile>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub kind: String,
    pub task_id: String,
    pub id: String,
    pub profile_id: i32,
}

/// `submitter:<kind>:<task>:<id>:<submission>:<profile>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmItem {
    pub kind: String,
    pub task_id: String,
    pub id: String,
    pub submission_id: String,
    pub profile_id: i32,
}

/// `submitter:bundle:<task>:<profile>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleItem {
    pub task_id: String,
    pub profile_id: i32,
}

pub fn parse_work_key(key: &str) -> Option<WorkItem> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() != 5 || parts[0] != "submitter" {
        return None;
    }
    Some(WorkItem {
        kind: parts[1].to_string(),
        task_id: parts[2].to_string(),
        id: parts[3].to_string(),
        profile_id: parts[4].parse().ok()?,
    })
}

pub fn parse_confirm_key(key: &str) -> Option<ConfirmItem> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() != 6 || parts[0] != "submitter" {
        return None;
    }
    Some(ConfirmItem {
        kind: parts[1].to_string(),
        task_id: parts[2].to_string(),
        id: parts[3].to_string(),
        submission_id: parts[4].to_string(),
        profile_id: parts[5].parse().ok()?,
    })
}

pub fn parse_bundle_key(key: &str) -> Option<BundleItem> {
    let parts: Vec<&str> = key.split(':').collect();
    if parts.len() != 4 || parts[0] != "submitter" || parts[1] != "bundle" {
        return None;
    }
    Some(BundleItem {
        task_id: parts[2].to_string(),
        profile_id: parts[3].parse().ok()?,
    })
}

pub struct SubmissionLoop {
    pub db: Arc<Store>,
    pub cs: Arc<CoordStore>,
    pub scoring: Arc<ScoringClient>,
}

impl SubmissionLoop {
    pub fn new(db: Arc<Store>, cs: Arc<CoordStore>, scoring: Arc<ScoringClient>) -> Self {
        Self { db, cs, scoring }
    }

    /// Run all four cooperating loops until cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let fetch = {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(FETCH_PERIOD) => {}
                    }
                    if let Err(e) = this.fetch_data_once().await {
                        warn!("fetch_data: {e:#}");
                    }
                }
            }
        };
        let submit = {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                    match this.submit_once().await {
                        Ok(_) => {}
                        Err(e) => warn!("submit: {e:#}"),
                    }
                }
            }
        };
        let confirm = {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                    if let Err(e) = this.confirm_once().await {
                        warn!("confirm: {e:#}");
                    }
                }
            }
        };
        let bundle = {
            let this = Arc::clone(&self);
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(IDLE_SLEEP) => {}
                    }
                    if let Err(e) = this.bundle_once().await {
                        warn!("bundle: {e:#}");
                    }
                }
            }
        };
        tokio::join!(fetch, submit, confirm, bundle);
    }

    // ── fetch_data ────────────────────────────────────────────────────────

    /// Materialize submission bodies for everything the relational store
    /// says is ready: one POV per bug profile, selected patches confirmed as
    /// actual bugs, and SARIF verdicts.
    pub async fn fetch_data_once(&self) -> Result<()> {
        let tasks = self.db.list_tasks_by_status(&[TaskStatus::Processing]).await?;
        let task_ids: Vec<String> = tasks.into_iter().map(|t| t.id).collect();
        if task_ids.is_empty() {
            return Ok(());
        }

        for (bug, profile_id) in self.db.povs_for_submission(&task_ids).await? {
            let key = keys::submission("pov", &bug.task_id, &bug.id.to_string(), profile_id);
            if self.cs.get(&key).await?.is_some()
                || self.cs.get(&keys::submitted_profile(profile_id)).await?.is_some()
            {
                continue;
            }
            let body = match pov_submission_body(&bug.poc, &bug.harness_name, &bug.sanitizer, &bug.architecture) {
                Ok(b) => b,
                Err(e) => {
                    warn!("prepare POV body for bug {}: {e:#}", bug.id);
                    continue;
                }
            };
            self.cs.set(&key, &body).await?;
            self.cs.set(&keys::submitted_profile(profile_id), "submitted").await?;
            self.cs.sadd(keys::SUBMIT_WORK_SET, &key).await?;
            info!("queued POV submission for bug {} (profile {profile_id})", bug.id);
        }

        for (patch, task_id) in self.db.patches_for_submission(&task_ids).await? {
            let key = keys::submission("patch", &task_id, &patch.id.to_string(), patch.bug_profile_id);
            if self.cs.get(&key).await?.is_some() {
                continue;
            }
            let body = patch_submission_body(&patch.patch);
            self.cs.set(&key, &body).await?;
            self.cs.sadd(keys::SUBMIT_WORK_SET, &key).await?;
            info!("queued patch submission {} (profile {})", patch.id, patch.bug_profile_id);
        }

        for sarif in self.db.sarif_results_for_tasks(&task_ids).await? {
            let profile = sarif.bug_profile_id.unwrap_or(0);
            let key = keys::submission("sarif", &sarif.task_id, &sarif.sarif_id, profile);
            if self.cs.get(&key).await?.is_some() {
                continue;
            }
            let body = sarif_submission_body(sarif.result, &sarif.description);
            self.cs.set(&key, &body).await?;
            self.cs.sadd(keys::SUBMIT_WORK_SET, &key).await?;
            info!("queued SARIF assessment {} for task {}", sarif.sarif_id, sarif.task_id);
        }

        Ok(())
    }

    // ── submit ────────────────────────────────────────────────────────────

    pub async fn submit_once(&self) -> Result<bool> {
        let Some(key) = self.cs.srandmember(keys::SUBMIT_WORK_SET).await? else {
            return Ok(false);
        };
        let Some(item) = parse_work_key(&key) else {
            warn!("malformed work key {key:?}, dropping");
            self.cs.srem(keys::SUBMIT_WORK_SET, &key).await?;
            return Ok(true);
        };
        let Some(body) = self.cs.get(&key).await? else {
            self.cs.srem(keys::SUBMIT_WORK_SET, &key).await?;
            return Ok(true);
        };

        let outcome = self.scoring.create(&item.kind, &item.task_id, &body).await?;
        match outcome.status {
            SubmissionStatus::Accepted | SubmissionStatus::Inconclusive => {
                if item.kind == "sarif" {
                    info!("SARIF assessment {} submitted", item.id);
                    self.cs.srem(keys::SUBMIT_WORK_SET, &key).await?;
                } else if let Some(submission_id) = outcome.submission_id {
                    info!(
                        "{} {} submitted for task {} -> {submission_id}",
                        item.kind, item.id, item.task_id
                    );
                    let confirm_key = format!(
                        "submitter:{}:{}:{}:{}:{}",
                        item.kind, item.task_id, item.id, submission_id, item.profile_id
                    );
                    self.cs.sadd(keys::SUBMIT_CONFIRM_SET, &confirm_key).await?;
                    self.cs.srem(keys::SUBMIT_WORK_SET, &key).await?;
                } else {
                    warn!("{} {} accepted without a submission id; retrying", item.kind, item.id);
                }
            }
            SubmissionStatus::DeadlineExceeded | SubmissionStatus::Failed => {
                warn!(
                    "{} {} for task {} terminal at create: {}",
                    item.kind,
                    item.id,
                    item.task_id,
                    outcome.status.as_str()
                );
                self.cs.srem(keys::SUBMIT_WORK_SET, &key).await?;
                self.record_terminal(&item, outcome.status).await?;
            }
            other => {
                // Server trouble: leave the key in the work set for retry.
                warn!(
                    "{} {} create returned {}; will retry",
                    item.kind,
                    item.id,
                    other.as_str()
                );
            }
        }
        Ok(true)
    }

    async fn record_terminal(&self, item: &WorkItem, status: SubmissionStatus) -> Result<()> {
        match item.kind.as_str() {
            "pov" => self.db.insert_profile_status(item.profile_id, status).await,
            "patch" => {
                let patch_id: i32 = item.id.parse().context("patch id")?;
                self.db.insert_patch_status(patch_id, status, None).await
            }
            _ => Ok(()),
        }
    }

    // ── confirm ───────────────────────────────────────────────────────────

    pub async fn confirm_once(&self) -> Result<bool> {
        let Some(key) = self.cs.srandmember(keys::SUBMIT_CONFIRM_SET).await? else {
            return Ok(false);
        };
        let Some(item) = parse_confirm_key(&key) else {
            warn!("malformed confirm key {key:?}, dropping");
            self.cs.srem(keys::SUBMIT_CONFIRM_SET, &key).await?;
            return Ok(true);
        };

        let outcome = self
            .scoring
            .confirm(&item.kind, &item.task_id, &item.submission_id)
            .await?;

        match item.kind.as_str() {
            "patch" => self.confirm_patch(&key, &item, outcome).await?,
            "pov" => self.confirm_pov(&key, &item, outcome).await?,
            _ => {
                if outcome.status != SubmissionStatus::Accepted {
                    self.cs.srem(keys::SUBMIT_CONFIRM_SET, &key).await?;
                }
            }
        }
        Ok(true)
    }

    async fn confirm_patch(
        &self,
        key: &str,
        item: &ConfirmItem,
        outcome: crate::scoring::ConfirmOutcome,
    ) -> Result<()> {
        let still_waiting = outcome.functionality_tests_passing.is_none()
            && matches!(
                outcome.status,
                SubmissionStatus::Accepted | SubmissionStatus::Inconclusive
            );
        if still_waiting {
            return Ok(());
        }

        let patch_id: i32 = item.id.parse().context("patch id")?;
        self.db
            .insert_patch_status(patch_id, outcome.status, outcome.functionality_tests_passing)
            .await?;
        self.cs.srem(keys::SUBMIT_CONFIRM_SET, key).await?;
        info!(
            "patch {} confirmed: {} (functionality {:?})",
            item.id,
            outcome.status.as_str(),
            outcome.functionality_tests_passing
        );

        // Functionality pass means the patch half of a bundle is ready.
        if outcome.functionality_tests_passing == Some(true) {
            self.cs
                .set(&keys::bundle_patch(item.profile_id), &item.submission_id)
                .await?;
            self.cs
                .sadd(
                    keys::SUBMIT_BUNDLE_SET,
                    &keys::bundle_task(&item.task_id, item.profile_id),
                )
                .await?;
        }
        Ok(())
    }

    async fn confirm_pov(
        &self,
        key: &str,
        item: &ConfirmItem,
        outcome: crate::scoring::ConfirmOutcome,
    ) -> Result<()> {
        match outcome.status {
            SubmissionStatus::Accepted => Ok(()),
            SubmissionStatus::Errored => {
                // Server-side error: move the key back into the work set for
                // a fresh create.
                warn!("POV {} errored server-side; resubmitting", item.id);
                self.cs.srem(keys::SUBMIT_CONFIRM_SET, key).await?;
                let work_key =
                    keys::submission("pov", &item.task_id, &item.id, item.profile_id);
                self.cs.sadd(keys::SUBMIT_WORK_SET, &work_key).await?;
                Ok(())
            }
            status => {
                self.db.insert_profile_status(item.profile_id, status).await?;
                self.cs.srem(keys::SUBMIT_CONFIRM_SET, key).await?;
                info!("POV {} confirmed: {}", item.id, status.as_str());
                if status == SubmissionStatus::Passed {
                    self.cs
                        .set(&keys::bundle_profile(item.profile_id), &item.submission_id)
                        .await?;
                }
                Ok(())
            }
        }
    }

    // ── bundle ────────────────────────────────────────────────────────────

    /// Pair the POV and patch submission ids for a profile and POST a bundle.
    /// No confirmation step.
    pub async fn bundle_once(&self) -> Result<bool> {
        let Some(key) = self.cs.srandmember(keys::SUBMIT_BUNDLE_SET).await? else {
            return Ok(false);
        };
        let Some(item) = parse_bundle_key(&key) else {
            warn!("malformed bundle key {key:?}, dropping");
            self.cs.srem(keys::SUBMIT_BUNDLE_SET, &key).await?;
            return Ok(true);
        };

        let pov = self.cs.get(&keys::bundle_profile(item.profile_id)).await?;
        let patch = self.cs.get(&keys::bundle_patch(item.profile_id)).await?;
        let (Some(pov_id), Some(patch_id)) = (pov, patch) else {
            // The other half has not passed yet; leave the task queued.
            return Ok(false);
        };

        let body = serde_json::json!({ "pov_id": pov_id, "patch_id": patch_id }).to_string();
        self.scoring.create("bundle", &item.task_id, &body).await?;
        self.cs.srem(keys::SUBMIT_BUNDLE_SET, &key).await?;
        info!(
            "bundle submitted for task {} profile {} (pov {pov_id}, patch {patch_id})",
            item.task_id, item.profile_id
        );
        Ok(true)
    }
}

// ── Submission bodies ─────────────────────────────────────────────────────

fn pov_submission_body(poc_path: &str, harness: &str, sanitizer: &str, architecture: &str) -> Result<String> {
    let data = std::fs::read(poc_path).with_context(|| format!("read PoC {poc_path}"))?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    Ok(serde_json::json!({
        "testcase": encoded,
        "fuzzer_name": harness,
        "sanitizer": sanitizer,
        "architecture": architecture,
    })
    .to_string())
}

fn patch_submission_body(diff: &str) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(diff.as_bytes());
    serde_json::json!({ "patch": encoded }).to_string()
}

fn sarif_submission_body(correct: bool, description: &str) -> String {
    serde_json::json!({
        "assessment": if correct { "correct" } else { "incorrect" },
        "description": description,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn work_key_round_trip() {
        let key = keys::submission("pov", "task-1", "42", 7);
        let item = parse_work_key(&key).unwrap();
        assert_eq!(item.kind, "pov");
        assert_eq!(item.task_id, "task-1");
        assert_eq!(item.id, "42");
        assert_eq!(item.profile_id, 7);
    }

    #[test]
    fn confirm_key_parses_six_segments() {
        let item = parse_confirm_key("submitter:patch:task-1:42:sub-9:7").unwrap();
        assert_eq!(item.kind, "patch");
        assert_eq!(item.submission_id, "sub-9");
        assert_eq!(item.profile_id, 7);
        assert!(parse_confirm_key("submitter:patch:task-1:42:7").is_none());
    }

    #[test]
    fn bundle_key_parses() {
        let key = keys::bundle_task("task-1", 7);
        let item = parse_bundle_key(&key).unwrap();
        assert_eq!(item.task_id, "task-1");
        assert_eq!(item.profile_id, 7);
        assert!(parse_bundle_key("submitter:pov:task-1:42:7").is_none());
    }

    #[test]
    fn pov_body_encodes_the_testcase() {
        let dir = tempfile::tempdir().unwrap();
        let poc = dir.path().join("poc.bin");
        std::fs::write(&poc, b"crash!").unwrap();
        let body = pov_submission_body(poc.to_str().unwrap(), "fuzz_x", "address", "x86_64").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["fuzzer_name"], "fuzz_x");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(parsed["testcase"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"crash!");
    }

    #[test]
    fn sarif_body_maps_verdicts() {
        let body = sarif_submission_body(true, "matches profile 3");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["assessment"], "correct");
        let body = sarif_submission_body(false, "spurious");
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["assessment"], "incorrect");
    }
}
