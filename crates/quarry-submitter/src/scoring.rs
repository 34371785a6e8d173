//! Scoring API client. Create: `POST <base>/<kind>/<task_id>`; confirm:
//! `GET <base>/<kind>/<task_id>/<submission_id>`. Only the usage is pinned
//! here; the server owns the wire protocol.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use quarry_core::types::SubmissionStatus;

pub struct ScoringClient {
    base: String,
    http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub status: SubmissionStatus,
    pub submission_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConfirmOutcome {
    pub status: SubmissionStatus,
    pub functionality_tests_passing: Option<bool>,
}

#[derive(Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    functionality_tests_passing: Option<bool>,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl ScoringClient {
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("build http client")?;
        Ok(Self {
            base: base.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    /// Submit a body; the assigned id comes back as `<kind>_id`.
    pub async fn create(&self, kind: &str, task_id: &str, body: &str) -> Result<CreateOutcome> {
        let url = format!("{}/{kind}/{task_id}", self.base);
        let response = self
            .http
            .post(&url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_string())
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let parsed: ApiResponse = response.json().await.context("decode create response")?;

        let id_field = format!("{kind}_id");
        let submission_id = parsed
            .extra
            .get(&id_field)
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(CreateOutcome {
            status: parse_status(&parsed.status),
            submission_id,
        })
    }

    pub async fn confirm(
        &self,
        kind: &str,
        task_id: &str,
        submission_id: &str,
    ) -> Result<ConfirmOutcome> {
        let url = format!("{}/{kind}/{task_id}/{submission_id}", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;
        let parsed: ApiResponse = response.json().await.context("decode confirm response")?;
        Ok(ConfirmOutcome {
            status: parse_status(&parsed.status),
            functionality_tests_passing: parsed.functionality_tests_passing,
        })
    }
}

/// Unknown statuses fail closed to `errored` so callers treat them as
/// retryable server trouble rather than success.
fn parse_status(raw: &str) -> SubmissionStatus {
    SubmissionStatus::parse(raw).unwrap_or_else(|| {
        warn!("scoring API returned unknown status {raw:?}");
        SubmissionStatus::Errored
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_maps_to_errored() {
        assert_eq!(parse_status("weird"), SubmissionStatus::Errored);
        assert_eq!(parse_status("passed"), SubmissionStatus::Passed);
    }

    #[test]
    fn api_response_reads_kind_specific_id() {
        let raw = r#"{"status": "accepted", "pov_id": "s-123"}"#;
        let parsed: ApiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "accepted");
        assert_eq!(
            parsed.extra.get("pov_id").and_then(|v| v.as_str()),
            Some("s-123")
        );
    }

    #[test]
    fn api_response_tristate_functionality() {
        let raw = r#"{"status": "passed", "functionality_tests_passing": null}"#;
        let parsed: ApiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.functionality_tests_passing, None);

        let raw = r#"{"status": "passed", "functionality_tests_passing": true}"#;
        let parsed: ApiResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.functionality_tests_passing, Some(true));
    }
}
