//! Patch submitter: periodically examines eligible `(task, bug_profile)`
//! pairs, computes how candidate patches cover bug profiles, prunes
//! dominated patches, and selects a minimal covering set to push into the
//! submission flow.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quarry_core::db::Store;
use quarry_core::types::{Task, TaskStatus};

/// A profile with at least this many live patches stops attracting more.
const MAX_VALID_PATCHES: i64 = 3;

/// Implicit-coverage catch-all: a patch repairing at least this many of a
/// profile's bugs covers it even when the profile has more.
const PATCH_COVER_CATCHALL: i64 = 1000;

/// Coverage relation: patch id -> profiles it covers.
pub type CoverMap = BTreeMap<i32, BTreeSet<i32>>;

pub struct PatchSubmitter {
    pub db: Arc<Store>,
    pub period: Duration,
}

impl PatchSubmitter {
    pub fn new(db: Arc<Store>) -> Self {
        Self {
            db,
            period: Duration::from_secs(60),
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("patch submitter stopping");
                    return;
                }
                () = tokio::time::sleep(self.period) => {}
            }
            if let Err(e) = self.process_tasks().await {
                warn!("patch submission cycle failed: {e:#}");
            }
        }
    }

    /// One scan over every active task, rate-limited per task.
    pub async fn process_tasks(&self) -> Result<()> {
        let tasks = self
            .db
            .list_tasks_by_status(&[TaskStatus::Processing, TaskStatus::Waiting])
            .await?;
        for task in tasks {
            let interval = scan_interval(&task);
            let due = match self.db.last_patch_scan(&task.id).await? {
                None => true,
                Some(last) => {
                    let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
                    elapsed > interval
                }
            };
            if !due {
                continue;
            }
            if let Err(e) = self.select_for_task(&task).await {
                warn!("patch selection for {} failed: {e:#}", task.id);
                continue;
            }
            self.db.insert_patch_scan(&task.id).await?;
        }
        Ok(())
    }

    async fn select_for_task(&self, task: &Task) -> Result<()> {
        // Eligible profiles: no failed POV submission and fewer than three
        // live patches.
        let mut profiles = Vec::new();
        for profile in self.db.profiles_without_failed_status(&task.id).await? {
            let live = self.db.valid_patch_count(profile.id).await?;
            if live < MAX_VALID_PATCHES {
                profiles.push(profile);
            }
        }
        if profiles.is_empty() {
            return Ok(());
        }

        // Available patches across those profiles, deduplicated by id.
        let mut patches = BTreeMap::new();
        for profile in &profiles {
            for patch in self.db.available_patches_for_profile(profile.id).await? {
                patches.insert(patch.id, patch);
            }
        }
        if patches.is_empty() {
            return Ok(());
        }

        // Coverage relation.
        let mut cover_map: CoverMap = patches.keys().map(|id| (*id, BTreeSet::new())).collect();
        for profile in &profiles {
            let bug_ids = self.db.bug_ids_for_profile(profile.id).await?;
            let total = bug_ids.len() as i64;
            if total == 0 {
                continue;
            }
            for patch in patches.values() {
                let covers = if patch.bug_profile_id == profile.id {
                    true
                } else {
                    let (unrepaired, repaired) =
                        self.db.patch_bug_counts(patch.id, &bug_ids).await?;
                    unrepaired == 0 && (repaired == total || repaired >= PATCH_COVER_CATCHALL)
                };
                if covers {
                    if let Some(set) = cover_map.get_mut(&patch.id) {
                        set.insert(profile.id);
                    }
                }
            }
        }

        let candidate_ids: Vec<i32> = cover_map.keys().copied().collect();
        let already_submitted: BTreeSet<i32> = self
            .db
            .submitted_patch_ids(&candidate_ids)
            .await?
            .into_iter()
            .collect();

        let selected = select_new_submissions(&cover_map, &already_submitted);
        for patch_id in &selected {
            self.db.insert_patch_submit(*patch_id).await?;
            info!(
                "task {}: submitting patch {patch_id} covering {:?}",
                task.id,
                cover_map.get(patch_id).map(|s| s.len()).unwrap_or(0)
            );
        }
        Ok(())
    }
}

/// Scan rate limit: min(1 hour, task wall budget / 8).
pub fn scan_interval(task: &Task) -> Duration {
    let one_hour = Duration::from_secs(3600);
    let total_ms = task.deadline - task.created_at.timestamp_millis();
    if total_ms <= 0 {
        return one_hour;
    }
    one_hour.min(Duration::from_millis((total_ms / 8) as u64))
}

/// Patches whose coverage is a proper subset of another patch's coverage.
pub fn dominated_patches(cover_map: &CoverMap) -> BTreeSet<i32> {
    let mut dominated = BTreeSet::new();
    for (p1, c1) in cover_map {
        for (p2, c2) in cover_map {
            if p1 == p2 {
                continue;
            }
            if c1.is_subset(c2) && c1.len() < c2.len() {
                dominated.insert(*p1);
                break;
            }
        }
    }
    dominated
}

/// Select new submissions: non-dominated, not-yet-submitted patches that
/// each cover at least one profile no earlier selection covers. The covered
/// set grows monotonically as selections accumulate.
pub fn select_new_submissions(cover_map: &CoverMap, already_submitted: &BTreeSet<i32>) -> Vec<i32> {
    let dominated = dominated_patches(cover_map);

    let mut covered: BTreeSet<i32> = BTreeSet::new();
    for patch_id in already_submitted {
        if let Some(coverage) = cover_map.get(patch_id) {
            covered.extend(coverage.iter().copied());
        }
    }

    let mut selected = Vec::new();
    for (patch_id, coverage) in cover_map {
        if dominated.contains(patch_id) || already_submitted.contains(patch_id) {
            continue;
        }
        if coverage.iter().any(|profile| !covered.contains(profile)) {
            covered.extend(coverage.iter().copied());
            selected.push(*patch_id);
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cover(entries: &[(i32, &[i32])]) -> CoverMap {
        entries
            .iter()
            .map(|(id, profiles)| (*id, profiles.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn dominated_patches_are_proper_subsets() {
        // p1={A}, p2={A,B}, p3={A,B,C}, p4={B,C}
        let map = cover(&[(1, &[10]), (2, &[10, 11]), (3, &[10, 11, 12]), (4, &[11, 12])]);
        let dominated = dominated_patches(&map);
        assert!(dominated.contains(&1));
        assert!(dominated.contains(&2));
        assert!(dominated.contains(&4));
        assert!(!dominated.contains(&3));
    }

    #[test]
    fn selection_takes_the_covering_non_dominated_patch() {
        let map = cover(&[(1, &[10]), (2, &[10, 11]), (3, &[10, 11, 12]), (4, &[11, 12])]);
        let selected = select_new_submissions(&map, &BTreeSet::new());
        assert_eq!(selected, vec![3]);
    }

    #[test]
    fn selection_is_domination_free() {
        let map = cover(&[(1, &[10, 11]), (2, &[12]), (3, &[12, 13])]);
        let selected = select_new_submissions(&map, &BTreeSet::new());
        for p in &selected {
            for q in &selected {
                if p == q {
                    continue;
                }
                let cp = &map[p];
                let cq = &map[q];
                assert!(!(cp.is_subset(cq) && cp.len() < cq.len()), "{p} dominated by {q}");
            }
        }
        assert_eq!(selected, vec![1, 3]);
    }

    #[test]
    fn already_submitted_coverage_suppresses_redundant_patches() {
        let map = cover(&[(1, &[10, 11]), (2, &[10]), (3, &[11])]);
        let already: BTreeSet<i32> = [1].into_iter().collect();
        let selected = select_new_submissions(&map, &already);
        assert!(selected.is_empty());
    }

    #[test]
    fn incomparable_coverages_are_both_selected() {
        let map = cover(&[(1, &[10]), (2, &[11])]);
        let selected = select_new_submissions(&map, &BTreeSet::new());
        assert_eq!(selected, vec![1, 2]);
    }

    #[test]
    fn covered_set_equals_union_of_selected_coverages() {
        let map = cover(&[(1, &[10]), (2, &[11, 12]), (3, &[13])]);
        let selected = select_new_submissions(&map, &BTreeSet::new());
        let union: BTreeSet<i32> = selected.iter().flat_map(|p| map[p].iter().copied()).collect();
        let all: BTreeSet<i32> = map.values().flatten().copied().collect();
        assert_eq!(union, all);
    }

    #[test]
    fn scan_interval_is_capped_at_one_hour() {
        let task = Task {
            id: "t".into(),
            task_type: quarry_core::types::TaskType::Full,
            project_name: "p".into(),
            focus: "p".into(),
            deadline: Utc::now().timestamp_millis() + 100 * 3600 * 1000,
            status: TaskStatus::Processing,
            created_at: Utc::now(),
            metadata: serde_json::Value::Null,
        };
        assert_eq!(scan_interval(&task), Duration::from_secs(3600));
    }

    #[test]
    fn scan_interval_is_an_eighth_of_short_budgets() {
        let now = Utc::now();
        let task = Task {
            id: "t".into(),
            task_type: quarry_core::types::TaskType::Full,
            project_name: "p".into(),
            focus: "p".into(),
            deadline: now.timestamp_millis() + 80 * 60 * 1000,
            status: TaskStatus::Processing,
            created_at: now,
            metadata: serde_json::Value::Null,
        };
        assert_eq!(scan_interval(&task), Duration::from_secs(600));
    }
}
