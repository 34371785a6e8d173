//! Typed access to the relational model: tasks, bugs, bug profiles, clusters,
//! patches, submissions, seeds, SARIF records. Multi-row writes run inside a
//! single transaction; transient pool faults retry with the shared backoff
//! policy and anything else propagates.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::{NoTls, Row};

use crate::retry::{self, BackoffPolicy};
use crate::types::{
    Bug, BugProfile, Patch, PatchStatusRow, SarifResult, Seed, Source, SourceKind, SubmissionStatus,
    Task, TaskStatus, TaskType,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Store {
    pool: Pool,
    backoff: BackoffPolicy,
}

// ── Row mappers ───────────────────────────────────────────────────────────

fn row_to_task(row: &Row) -> Result<Task> {
    let task_type: String = row.try_get("task_type")?;
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        task_type: TaskType::parse(&task_type)
            .with_context(|| format!("unknown task_type {task_type:?}"))?,
        project_name: row.try_get("project_name")?,
        focus: row.try_get("focus")?,
        deadline: row.try_get("deadline")?,
        status: TaskStatus::parse(&status).with_context(|| format!("unknown status {status:?}"))?,
        created_at: row.try_get("created_at")?,
        metadata: row
            .try_get::<_, Option<serde_json::Value>>("metadata")?
            .unwrap_or(serde_json::Value::Null),
    })
}

fn row_to_source(row: &Row) -> Result<Source> {
    let kind: String = row.try_get("source_type")?;
    Ok(Source {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        sha256: row.try_get("sha256")?,
        source_type: SourceKind::parse(&kind)
            .with_context(|| format!("unknown source_type {kind:?}"))?,
        url: row.try_get("url")?,
        path: row.try_get("path")?,
    })
}

fn row_to_bug(row: &Row) -> Result<Bug> {
    Ok(Bug {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        architecture: row.try_get("architecture")?,
        poc: row.try_get("poc")?,
        harness_name: row.try_get("harness_name")?,
        sanitizer: row.try_get("sanitizer")?,
        sarif_report: row.try_get("sarif_report")?,
    })
}

fn row_to_profile(row: &Row) -> Result<BugProfile> {
    Ok(BugProfile {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        harness_name: row.try_get("harness_name")?,
        sanitizer: row.try_get("sanitizer")?,
        sanitizer_bug_type: row.try_get("sanitizer_bug_type")?,
        trigger_point: row.try_get("trigger_point")?,
        summary: row.try_get("summary")?,
    })
}

fn row_to_patch(row: &Row) -> Result<Patch> {
    Ok(Patch {
        id: row.try_get("id")?,
        bug_profile_id: row.try_get("bug_profile_id")?,
        patch: row.try_get("patch")?,
        model: row.try_get("model")?,
    })
}

fn row_to_sarif_result(row: &Row) -> Result<SarifResult> {
    Ok(SarifResult {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        sarif_id: row.try_get("sarif_id")?,
        bug_profile_id: row.try_get("bug_profile_id")?,
        result: row.try_get::<_, Option<bool>>("result")?.unwrap_or(false),
        description: row
            .try_get::<_, Option<String>>("description")?
            .unwrap_or_default(),
    })
}

const PROFILE_COLS: &str = "id, task_id, harness_name, sanitizer, sanitizer_bug_type, trigger_point, summary";
const BUG_COLS: &str = "id, task_id, architecture, poc, harness_name, sanitizer, sarif_report";

// ── Store impl ────────────────────────────────────────────────────────────

impl Store {
    pub fn connect(database_url: &str) -> Result<Self> {
        let pg_config: tokio_postgres::Config =
            database_url.parse().context("parse DATABASE_URL")?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(16)
            .build()
            .context("build postgres pool")?;
        Ok(Self {
            pool,
            backoff: BackoffPolicy::default(),
        })
    }

    async fn client(&self) -> Result<Object> {
        retry::with_retries(self.backoff, "postgres pool checkout", || async {
            self.pool.get().await.context("pool get")
        })
        .await
    }

    /// Apply the schema idempotently.
    pub async fn migrate(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("apply schema")?;
        Ok(())
    }

    // ── Tasks ─────────────────────────────────────────────────────────────

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO tasks (id, deadline, focus, project_name, task_type, status, metadata) \
                 VALUES ($1, $2, $3, $4, $5::tasktypeenum, $6::taskstatusenum, $7) \
                 ON CONFLICT (id) DO NOTHING",
                &[
                    &task.id,
                    &task.deadline,
                    &task.focus,
                    &task.project_name,
                    &task.task_type.as_str(),
                    &task.status.as_str(),
                    &task.metadata,
                ],
            )
            .await
            .context("insert_task")?;
        Ok(())
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, deadline, focus, project_name, task_type::text, status::text, \
                 created_at, metadata FROM tasks WHERE id = $1",
                &[&id],
            )
            .await
            .context("get_task")?;
        row.as_ref().map(row_to_task).transpose()
    }

    pub async fn list_tasks_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        let client = self.client().await?;
        let wanted: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = client
            .query(
                "SELECT id, deadline, focus, project_name, task_type::text, status::text, \
                 created_at, metadata FROM tasks WHERE status::text = ANY($1) ORDER BY created_at",
                &[&wanted],
            )
            .await
            .context("list_tasks_by_status")?;
        rows.iter().map(row_to_task).collect()
    }

    pub async fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "UPDATE tasks SET status = $1::taskstatusenum WHERE id = $2",
                &[&status.as_str(), &id],
            )
            .await
            .context("update_task_status")?;
        Ok(())
    }

    // ── Sources ───────────────────────────────────────────────────────────

    pub async fn insert_source(
        &self,
        task_id: &str,
        sha256: &str,
        kind: SourceKind,
        url: &str,
        path: Option<&str>,
    ) -> Result<i32> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO sources (task_id, sha256, source_type, url, path) \
                 VALUES ($1, $2, $3::sourcetypeenum, $4, $5) RETURNING id",
                &[&task_id, &sha256, &kind.as_str(), &url, &path],
            )
            .await
            .context("insert_source")?;
        Ok(row.get(0))
    }

    pub async fn list_sources(&self, task_id: &str) -> Result<Vec<Source>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT id, task_id, sha256, source_type::text, url, path \
                 FROM sources WHERE task_id = $1 ORDER BY id",
                &[&task_id],
            )
            .await
            .context("list_sources")?;
        rows.iter().map(row_to_source).collect()
    }

    // ── Seeds ─────────────────────────────────────────────────────────────

    pub async fn insert_seed(&self, seed: &Seed) -> Result<i32> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO seeds (task_id, path, harness_name, fuzzer, instance, coverage, metric) \
                 VALUES ($1, $2, $3, $4::fuzzertypeenum, $5, $6, $7) RETURNING id",
                &[
                    &seed.task_id,
                    &seed.path,
                    &seed.harness_name,
                    &seed.fuzzer.as_str(),
                    &seed.instance,
                    &seed.coverage,
                    &seed.metric,
                ],
            )
            .await
            .context("insert_seed")?;
        Ok(row.get(0))
    }

    // ── Bugs ──────────────────────────────────────────────────────────────

    pub async fn insert_bug(&self, bug: &Bug) -> Result<i32> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO bugs (task_id, architecture, poc, harness_name, sanitizer, sarif_report) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                &[
                    &bug.task_id,
                    &bug.architecture,
                    &bug.poc,
                    &bug.harness_name,
                    &bug.sanitizer,
                    &bug.sarif_report,
                ],
            )
            .await
            .context("insert_bug")?;
        Ok(row.get(0))
    }

    pub async fn get_bug(&self, id: i32) -> Result<Option<Bug>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                format!("SELECT {BUG_COLS} FROM bugs WHERE id = $1").as_str(),
                &[&id],
            )
            .await
            .context("get_bug")?;
        row.as_ref().map(row_to_bug).transpose()
    }

    /// All bugs attached to a profile through bug_groups.
    pub async fn bugs_for_profile(&self, profile_id: i32) -> Result<Vec<Bug>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT b.id, b.task_id, b.architecture, b.poc, b.harness_name, b.sanitizer, b.sarif_report \
                 FROM bugs b JOIN bug_groups bg ON b.id = bg.bug_id \
                 WHERE bg.bug_profile_id = $1 ORDER BY b.id",
                &[&profile_id],
            )
            .await
            .context("bugs_for_profile")?;
        rows.iter().map(row_to_bug).collect()
    }

    pub async fn bug_ids_for_profile(&self, profile_id: i32) -> Result<Vec<i32>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT bug_id FROM bug_groups WHERE bug_profile_id = $1 ORDER BY bug_id",
                &[&profile_id],
            )
            .await
            .context("bug_ids_for_profile")?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    // ── Bug profiles and groups ───────────────────────────────────────────

    /// Insert a new profile together with its first bug_groups edge, so every
    /// profile always has at least one bug. Runs in one transaction.
    pub async fn create_profile_with_bug(
        &self,
        profile: &BugProfile,
        bug_id: i32,
        diff_only: bool,
    ) -> Result<i32> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.context("begin")?;
        let row = tx
            .query_one(
                "INSERT INTO bug_profiles \
                 (task_id, harness_name, sanitizer, sanitizer_bug_type, trigger_point, summary) \
                 VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
                &[
                    &profile.task_id,
                    &profile.harness_name,
                    &profile.sanitizer,
                    &profile.sanitizer_bug_type,
                    &profile.trigger_point,
                    &profile.summary,
                ],
            )
            .await
            .context("insert bug_profile")?;
        let profile_id: i32 = row.get(0);
        tx.execute(
            "INSERT INTO bug_groups (bug_id, bug_profile_id, diff_only) VALUES ($1, $2, $3) \
             ON CONFLICT (bug_id, bug_profile_id) DO NOTHING",
            &[&bug_id, &profile_id, &diff_only],
        )
        .await
        .context("insert bug_group")?;
        tx.commit().await.context("commit")?;
        Ok(profile_id)
    }

    pub async fn get_bug_profile(&self, id: i32) -> Result<Option<BugProfile>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                format!("SELECT {PROFILE_COLS} FROM bug_profiles WHERE id = $1").as_str(),
                &[&id],
            )
            .await
            .context("get_bug_profile")?;
        row.as_ref().map(row_to_profile).transpose()
    }

    /// Insert a bug_groups edge; returns false when the pair already existed.
    pub async fn insert_bug_group(&self, bug_id: i32, profile_id: i32, diff_only: bool) -> Result<bool> {
        let client = self.client().await?;
        let n = client
            .execute(
                "INSERT INTO bug_groups (bug_id, bug_profile_id, diff_only) VALUES ($1, $2, $3) \
                 ON CONFLICT (bug_id, bug_profile_id) DO NOTHING",
                &[&bug_id, &profile_id, &diff_only],
            )
            .await
            .context("insert_bug_group")?;
        Ok(n > 0)
    }

    // ── Bug clusters ──────────────────────────────────────────────────────

    /// Create a cluster seeded from a profile (copying its trigger point for
    /// readability) and attach the profile, in one transaction.
    pub async fn create_cluster_for_profile(&self, profile_id: i32) -> Result<i32> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.context("begin")?;
        let profile = tx
            .query_one(
                "SELECT task_id, trigger_point FROM bug_profiles WHERE id = $1",
                &[&profile_id],
            )
            .await
            .context("load profile for cluster")?;
        let task_id: String = profile.get(0);
        let trigger_point: String = profile.get(1);
        let row = tx
            .query_one(
                "INSERT INTO bug_clusters (task_id, trigger_point) VALUES ($1, $2) RETURNING id",
                &[&task_id, &trigger_point],
            )
            .await
            .context("insert bug_cluster")?;
        let cluster_id: i32 = row.get(0);
        tx.execute(
            "INSERT INTO bug_cluster_groups (bug_profile_id, bug_cluster_id) VALUES ($1, $2) \
             ON CONFLICT (bug_profile_id) DO NOTHING",
            &[&profile_id, &cluster_id],
        )
        .await
        .context("insert bug_cluster_group")?;
        tx.commit().await.context("commit")?;
        Ok(cluster_id)
    }

    /// Attach a profile to an existing cluster. A profile belongs to exactly
    /// one cluster; re-attaching is a no-op.
    pub async fn attach_profile_to_cluster(&self, profile_id: i32, cluster_id: i32) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO bug_cluster_groups (bug_profile_id, bug_cluster_id) VALUES ($1, $2) \
                 ON CONFLICT (bug_profile_id) DO NOTHING",
                &[&profile_id, &cluster_id],
            )
            .await
            .context("attach_profile_to_cluster")?;
        Ok(())
    }

    pub async fn cluster_id_for_profile(&self, profile_id: i32) -> Result<Option<i32>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT bug_cluster_id FROM bug_cluster_groups WHERE bug_profile_id = $1",
                &[&profile_id],
            )
            .await
            .context("cluster_id_for_profile")?;
        Ok(row.map(|r| r.get(0)))
    }

    /// Canonical profile of a cluster: the minimum member id.
    pub async fn smallest_profile_in_cluster(&self, cluster_id: i32) -> Result<Option<i32>> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT MIN(bug_profile_id) FROM bug_cluster_groups WHERE bug_cluster_id = $1",
                &[&cluster_id],
            )
            .await
            .context("smallest_profile_in_cluster")?;
        Ok(row.get(0))
    }

    /// Profiles of a task that already belong to a cluster, with cluster ids.
    pub async fn clustered_profiles(&self, task_id: &str) -> Result<Vec<(BugProfile, i32)>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT bp.id, bp.task_id, bp.harness_name, bp.sanitizer, bp.sanitizer_bug_type, \
                 bp.trigger_point, bp.summary, bcg.bug_cluster_id \
                 FROM bug_profiles bp \
                 JOIN bug_cluster_groups bcg ON bp.id = bcg.bug_profile_id \
                 WHERE bp.task_id = $1 ORDER BY bp.id",
                &[&task_id],
            )
            .await
            .context("clustered_profiles")?;
        rows.iter()
            .map(|r| Ok((row_to_profile(r)?, r.try_get("bug_cluster_id")?)))
            .collect()
    }

    // ── Patches ───────────────────────────────────────────────────────────

    pub async fn insert_patch(&self, profile_id: i32, patch: &str, model: &str) -> Result<i32> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO patches (bug_profile_id, patch, model) VALUES ($1, $2, $3) RETURNING id",
                &[&profile_id, &patch, &model],
            )
            .await
            .context("insert_patch")?;
        Ok(row.get(0))
    }

    pub async fn get_patch(&self, id: i32) -> Result<Option<Patch>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, bug_profile_id, patch, model FROM patches WHERE id = $1",
                &[&id],
            )
            .await
            .context("get_patch")?;
        row.as_ref().map(row_to_patch).transpose()
    }

    pub async fn patches_for_profile(&self, profile_id: i32) -> Result<Vec<Patch>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT id, bug_profile_id, patch, model FROM patches \
                 WHERE bug_profile_id = $1 ORDER BY id",
                &[&profile_id],
            )
            .await
            .context("patches_for_profile")?;
        rows.iter().map(row_to_patch).collect()
    }

    pub async fn insert_patch_bug(&self, patch_id: i32, bug_id: i32, repaired: bool) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO patch_bugs (patch_id, bug_id, repaired) VALUES ($1, $2, $3)",
                &[&patch_id, &bug_id, &repaired],
            )
            .await
            .context("insert_patch_bug")?;
        Ok(())
    }

    /// How many of `bug_ids` this patch left unrepaired / repaired.
    pub async fn patch_bug_counts(&self, patch_id: i32, bug_ids: &[i32]) -> Result<(i64, i64)> {
        let client = self.client().await?;
        let ids: Vec<i32> = bug_ids.to_vec();
        let row = client
            .query_one(
                "SELECT \
                 COUNT(*) FILTER (WHERE repaired = false), \
                 COUNT(*) FILTER (WHERE repaired = true) \
                 FROM patch_bugs WHERE patch_id = $1 AND bug_id = ANY($2)",
                &[&patch_id, &ids],
            )
            .await
            .context("patch_bug_counts")?;
        Ok((row.get(0), row.get(1)))
    }

    // ── Patch / profile submission statuses ───────────────────────────────

    pub async fn insert_patch_status(
        &self,
        patch_id: i32,
        status: SubmissionStatus,
        functionality_tests_passing: Option<bool>,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO patch_status (patch_id, status, functionality_tests_passing) \
                 VALUES ($1, $2::submissionstatusenum, $3)",
                &[&patch_id, &status.as_str(), &functionality_tests_passing],
            )
            .await
            .context("insert_patch_status")?;
        Ok(())
    }

    pub async fn latest_patch_status(&self, patch_id: i32) -> Result<Option<PatchStatusRow>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT id, patch_id, status::text, functionality_tests_passing \
                 FROM patch_status WHERE patch_id = $1 ORDER BY id DESC LIMIT 1",
                &[&patch_id],
            )
            .await
            .context("latest_patch_status")?;
        row.map(|r| {
            let status: String = r.try_get("status")?;
            Ok(PatchStatusRow {
                id: r.try_get("id")?,
                patch_id: r.try_get("patch_id")?,
                status: SubmissionStatus::parse(&status)
                    .with_context(|| format!("unknown submission status {status:?}"))?,
                functionality_tests_passing: r.try_get("functionality_tests_passing")?,
            })
        })
        .transpose()
    }

    pub async fn insert_profile_status(&self, profile_id: i32, status: SubmissionStatus) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO bug_profile_status (bug_profile_id, status) \
                 VALUES ($1, $2::submissionstatusenum)",
                &[&profile_id, &status.as_str()],
            )
            .await
            .context("insert_profile_status")?;
        Ok(())
    }

    /// Profile ids confirmed as actual bugs (POV passed) across all tasks.
    pub async fn passed_profile_ids(&self) -> Result<Vec<i32>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT DISTINCT bug_profile_id FROM bug_profile_status \
                 WHERE status = 'passed'::submissionstatusenum",
                &[],
            )
            .await
            .context("passed_profile_ids")?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Profiles of a task with no failed POV submission.
    pub async fn profiles_without_failed_status(&self, task_id: &str) -> Result<Vec<BugProfile>> {
        let client = self.client().await?;
        let rows = client
            .query(
                format!(
                    "SELECT {PROFILE_COLS} FROM bug_profiles bp WHERE bp.task_id = $1 AND NOT EXISTS \
                     (SELECT 1 FROM bug_profile_status s WHERE s.bug_profile_id = bp.id \
                      AND s.status = 'failed'::submissionstatusenum) ORDER BY bp.id"
                )
                .as_str(),
                &[&task_id],
            )
            .await
            .context("profiles_without_failed_status")?;
        rows.iter().map(row_to_profile).collect()
    }

    /// Patches of a profile with no explicitly failing functionality tests.
    pub async fn available_patches_for_profile(&self, profile_id: i32) -> Result<Vec<Patch>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT p.id, p.bug_profile_id, p.patch, p.model FROM patches p \
                 WHERE p.bug_profile_id = $1 AND NOT EXISTS \
                 (SELECT 1 FROM patch_status s WHERE s.patch_id = p.id \
                  AND s.functionality_tests_passing = false) ORDER BY p.id",
                &[&profile_id],
            )
            .await
            .context("available_patches_for_profile")?;
        rows.iter().map(row_to_patch).collect()
    }

    /// Count of patches for a profile still considered valid: no status row,
    /// or no status row with functionality_tests_passing = false.
    pub async fn valid_patch_count(&self, profile_id: i32) -> Result<i64> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) FROM patches p WHERE p.bug_profile_id = $1 AND NOT EXISTS \
                 (SELECT 1 FROM patch_status s WHERE s.patch_id = p.id \
                  AND s.functionality_tests_passing = false)",
                &[&profile_id],
            )
            .await
            .context("valid_patch_count")?;
        Ok(row.get(0))
    }

    // ── Patch submits ─────────────────────────────────────────────────────

    pub async fn insert_patch_submit(&self, patch_id: i32) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO patch_submit (patch_id) VALUES ($1)",
                &[&patch_id],
            )
            .await
            .context("insert_patch_submit")?;
        Ok(())
    }

    /// Which of `patch_ids` already have a patch_submit row.
    pub async fn submitted_patch_ids(&self, patch_ids: &[i32]) -> Result<Vec<i32>> {
        if patch_ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client().await?;
        let ids: Vec<i32> = patch_ids.to_vec();
        let rows = client
            .query(
                "SELECT DISTINCT patch_id FROM patch_submit WHERE patch_id = ANY($1)",
                &[&ids],
            )
            .await
            .context("submitted_patch_ids")?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    pub async fn last_patch_scan(&self, task_id: &str) -> Result<Option<DateTime<Utc>>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT created_at FROM patch_submit_timestamp WHERE task_id = $1 \
                 ORDER BY created_at DESC LIMIT 1",
                &[&task_id],
            )
            .await
            .context("last_patch_scan")?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn insert_patch_scan(&self, task_id: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO patch_submit_timestamp (task_id) VALUES ($1)",
                &[&task_id],
            )
            .await
            .context("insert_patch_scan")?;
        Ok(())
    }

    // ── Submission-loop queries ───────────────────────────────────────────

    /// One bug per bug profile for the given tasks, in profile order. These
    /// become POV submissions.
    pub async fn povs_for_submission(&self, task_ids: &[String]) -> Result<Vec<(Bug, i32)>> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client().await?;
        let ids: Vec<String> = task_ids.to_vec();
        let rows = client
            .query(
                "SELECT DISTINCT ON (bg.bug_profile_id) \
                 b.id, b.task_id, b.architecture, b.poc, b.harness_name, b.sanitizer, b.sarif_report, \
                 bg.bug_profile_id \
                 FROM bugs b JOIN bug_groups bg ON b.id = bg.bug_id \
                 WHERE b.task_id = ANY($1) \
                 ORDER BY bg.bug_profile_id, b.id",
                &[&ids],
            )
            .await
            .context("povs_for_submission")?;
        rows.iter()
            .map(|r| Ok((row_to_bug(r)?, r.try_get("bug_profile_id")?)))
            .collect()
    }

    /// Patches selected by the submitter (patch_submit) that have not failed
    /// functionality tests, restricted to profiles confirmed as actual bugs.
    pub async fn patches_for_submission(&self, task_ids: &[String]) -> Result<Vec<(Patch, String)>> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client().await?;
        let ids: Vec<String> = task_ids.to_vec();
        let rows = client
            .query(
                "SELECT p.id, p.bug_profile_id, p.patch, p.model, bp.task_id \
                 FROM patch_submit ps \
                 JOIN patches p ON ps.patch_id = p.id \
                 JOIN bug_profiles bp ON bp.id = p.bug_profile_id \
                 WHERE bp.task_id = ANY($1) \
                 AND NOT EXISTS (SELECT 1 FROM patch_status s WHERE s.patch_id = p.id \
                                 AND s.functionality_tests_passing = false) \
                 AND EXISTS (SELECT 1 FROM bug_profile_status bps \
                             WHERE bps.bug_profile_id = bp.id \
                             AND bps.status = 'passed'::submissionstatusenum) \
                 ORDER BY p.bug_profile_id, p.id",
                &[&ids],
            )
            .await
            .context("patches_for_submission")?;
        rows.iter()
            .map(|r| Ok((row_to_patch(r)?, r.try_get("task_id")?)))
            .collect()
    }

    // ── SARIF ─────────────────────────────────────────────────────────────

    pub async fn insert_sarif(
        &self,
        id: &str,
        task_id: &str,
        sarif: &serde_json::Value,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO sarifs (id, task_id, sarif, metadata) VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (id) DO NOTHING",
                &[&id, &task_id, &sarif, &metadata],
            )
            .await
            .context("insert_sarif")?;
        Ok(())
    }

    pub async fn insert_sarif_result(
        &self,
        task_id: &str,
        sarif_id: &str,
        bug_profile_id: Option<i32>,
        result: bool,
        description: &str,
    ) -> Result<i32> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "INSERT INTO sarif_results (task_id, sarif_id, bug_profile_id, result, description) \
                 VALUES ($1, $2, $3, $4, $5) RETURNING id",
                &[&task_id, &sarif_id, &bug_profile_id, &result, &description],
            )
            .await
            .context("insert_sarif_result")?;
        Ok(row.get(0))
    }

    pub async fn sarif_results_for_tasks(&self, task_ids: &[String]) -> Result<Vec<SarifResult>> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let client = self.client().await?;
        let ids: Vec<String> = task_ids.to_vec();
        let rows = client
            .query(
                "SELECT id, task_id, sarif_id, bug_profile_id, result, description \
                 FROM sarif_results WHERE task_id = ANY($1) ORDER BY id",
                &[&ids],
            )
            .await
            .context("sarif_results_for_tasks")?;
        rows.iter().map(row_to_sarif_result).collect()
    }

    pub async fn insert_sarif_slice(&self, sarif_id: &str, result_path: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO sarif_slice (sarif_id, result_path) VALUES ($1, $2)",
                &[&sarif_id, &result_path],
            )
            .await
            .context("insert_sarif_slice")?;
        Ok(())
    }

    pub async fn insert_directed_slice(&self, directed_id: &str, result_path: &str) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "INSERT INTO directed_slice (directed_id, result_path) VALUES ($1, $2)",
                &[&directed_id, &result_path],
            )
            .await
            .context("insert_directed_slice")?;
        Ok(())
    }

    /// Latest slice result recorded for a directed-fuzz slice request.
    pub async fn directed_slice_result(&self, directed_id: &str) -> Result<Option<String>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT result_path FROM directed_slice WHERE directed_id = $1 \
                 ORDER BY id DESC LIMIT 1",
                &[&directed_id],
            )
            .await
            .context("directed_slice_result")?;
        Ok(row.map(|r| r.get(0)))
    }

    pub async fn sarif_slice_result(&self, sarif_id: &str) -> Result<Option<String>> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT result_path FROM sarif_slice WHERE sarif_id = $1 \
                 ORDER BY id DESC LIMIT 1",
                &[&sarif_id],
            )
            .await
            .context("sarif_slice_result")?;
        Ok(row.map(|r| r.get(0)))
    }
}
