//! Dedup oracle interface. The production oracle is an LLM-backed external
//! service that judges whether two profiles describe the same defect; the
//! triage engine only depends on this trait and tolerates any answer.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::BugProfile;

/// A profile already assigned to a cluster, given to the oracle as context.
#[derive(Debug, Clone)]
pub struct ClusteredProfile {
    pub profile: BugProfile,
    pub cluster_id: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterDecision {
    /// The profile is a new defect; the caller creates a cluster row.
    New,
    /// The profile duplicates an existing cluster.
    Existing(i32),
}

#[async_trait]
pub trait DedupOracle: Send + Sync {
    async fn assign_cluster(
        &self,
        profile: &BugProfile,
        existing: &[ClusteredProfile],
    ) -> Result<ClusterDecision>;
}

/// Baseline oracle: two profiles are the same defect when they share a
/// trigger point and bug type. Used when no LLM oracle is configured and as
/// the fallback when the external one errors.
pub struct TriggerPointOracle;

#[async_trait]
impl DedupOracle for TriggerPointOracle {
    async fn assign_cluster(
        &self,
        profile: &BugProfile,
        existing: &[ClusteredProfile],
    ) -> Result<ClusterDecision> {
        for candidate in existing {
            if candidate.profile.trigger_point == profile.trigger_point
                && candidate.profile.sanitizer_bug_type == profile.sanitizer_bug_type
            {
                return Ok(ClusterDecision::Existing(candidate.cluster_id));
            }
        }
        Ok(ClusterDecision::New)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: i32, trigger: &str, bug_type: &str) -> BugProfile {
        BugProfile {
            id,
            task_id: "t1".into(),
            harness_name: "h".into(),
            sanitizer: "address".into(),
            sanitizer_bug_type: bug_type.into(),
            trigger_point: trigger.into(),
            summary: String::new(),
        }
    }

    #[tokio::test]
    async fn matching_trigger_and_type_joins_existing_cluster() {
        let existing = vec![ClusteredProfile {
            profile: profile(1, "src/foo.c:42", "AddressSanitizer: heap-use-after-free"),
            cluster_id: 9,
        }];
        let new = profile(2, "src/foo.c:42", "AddressSanitizer: heap-use-after-free");
        let decision = TriggerPointOracle.assign_cluster(&new, &existing).await.unwrap();
        assert_eq!(decision, ClusterDecision::Existing(9));
    }

    #[tokio::test]
    async fn different_trigger_point_is_a_new_cluster() {
        let existing = vec![ClusteredProfile {
            profile: profile(1, "src/foo.c:42", "AddressSanitizer: heap-use-after-free"),
            cluster_id: 9,
        }];
        let new = profile(2, "src/bar.c:7", "AddressSanitizer: heap-use-after-free");
        let decision = TriggerPointOracle.assign_cluster(&new, &existing).await.unwrap();
        assert_eq!(decision, ClusterDecision::New);
    }
}
