//! Coordination-store key namespaces. Every key the system writes is built
//! here so the conventions have a single home. All segments join with `:`.

use crate::types::{RepoState, Sanitizer};

/// Hash of `task_id -> JSON array of cluster ids`.
pub const TASK_BUG_CLUSTERS: &str = "global:task_bug_clusters";

/// Set of JSON fuzzlet descriptors announcing built harness artifacts.
pub const FUZZLETS: &str = "b3fuzz:fuzzlets";

/// Set of remote Docker-over-TCP hosts available for builds and fuzzers.
pub const DIND_HOSTS: &str = "dind:hosts";

/// Set-valued work queues for the submission loop.
pub const SUBMIT_WORK_SET: &str = "submitter:work";
pub const SUBMIT_CONFIRM_SET: &str = "submitter:confirm";
pub const SUBMIT_BUNDLE_SET: &str = "submitter:bundle_tasks";

pub fn task_status(task_id: &str) -> String {
    format!("global:task_status:{task_id}")
}

pub fn task_metadata(task_id: &str) -> String {
    format!("global:task_metadata:{task_id}")
}

pub fn task_metrics(task_id: &str) -> String {
    format!("global:task_metrics:{task_id}")
}

pub fn workflow_retry_count(task_id: &str) -> String {
    format!("workflow_retry_count:{task_id}")
}

pub fn public_build(task_id: &str) -> String {
    format!("public:build:{task_id}")
}

/// Interned bug-profile id for a pentuple fingerprint.
pub fn triage_profile(task_id: &str, fingerprint: &str) -> String {
    format!("triage:{task_id}:{fingerprint}")
}

pub fn triage_profile_lock(task_id: &str, fingerprint: &str) -> String {
    format!("lock:triage:{task_id}:{fingerprint}")
}

pub fn new_profile_lock(task_id: &str) -> String {
    format!("lock:triage:{task_id}:new_profile")
}

pub fn build_status(task_id: &str, sanitizer: Sanitizer, state: RepoState) -> String {
    format!("triage:global:{task_id}:{}:{}:build_status", sanitizer.as_str(), state.as_str())
}

pub fn build_lock(task_id: &str, sanitizer: Sanitizer, state: RepoState) -> String {
    format!("lock:triage:global:{task_id}:{}:{}:build", sanitizer.as_str(), state.as_str())
}

pub fn runner_status(instance: &str, task_id: &str, sanitizer: Sanitizer, state: RepoState) -> String {
    format!("triage:{instance}:{task_id}:{}:{}:runner_status", sanitizer.as_str(), state.as_str())
}

/// Path to a built harness artifact, keyed by sanitizer and engine.
pub fn harness_artifact(task_id: &str, harness: &str, sanitizer: &str, engine: &str) -> String {
    format!("artifacts:{task_id}:{harness}:{sanitizer}:{engine}:after")
}

/// Cmin-instrumented harness binary for a task/harness pair.
pub fn cmin_artifact(task_id: &str, harness: &str) -> String {
    harness_artifact(task_id, harness, "none", "cmin")
}

/// Sentinel set when the cmin harness build failed for the whole task.
pub fn cmin_failed(task_id: &str) -> String {
    format!("artifacts:{task_id}:cmin:failed")
}

/// Corpus-minimized filename for one coverage feature.
pub fn cmin_file(task_id: &str, harness: &str, feature: u64) -> String {
    format!("clustercmin:file:{task_id}:{harness}:{feature}")
}

/// Set of feature ids observed for a task/harness pair.
pub fn cmin_features(task_id: &str, harness: &str) -> String {
    format!("clustercmin:features:{task_id}:{harness}")
}

/// Interned submission payload for the submission loop. `kind` is one of
/// `pov`, `patch`, `sarif`.
pub fn submission(kind: &str, task_id: &str, id: &str, profile_id: i32) -> String {
    format!("submitter:{kind}:{task_id}:{id}:{profile_id}")
}

/// Marker that a bug profile has entered the POV submission flow.
pub fn submitted_profile(profile_id: i32) -> String {
    format!("submitter:bug_profile:{profile_id}")
}

/// Last accepted patch submission id for a profile, for bundling.
pub fn bundle_patch(profile_id: i32) -> String {
    format!("submitter:bundle:patch:{profile_id}")
}

/// Last accepted POV submission id for a profile, for bundling.
pub fn bundle_profile(profile_id: i32) -> String {
    format!("submitter:bundle:bug_profile:{profile_id}")
}

/// A pending bundle task: pair the POV and patch ids for a profile.
pub fn bundle_task(task_id: &str, profile_id: i32) -> String {
    format!("submitter:bundle:{task_id}:{profile_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_shapes_match_the_wire_conventions() {
        assert_eq!(task_status("t1"), "global:task_status:t1");
        assert_eq!(triage_profile("t1", "abcd"), "triage:t1:abcd");
        assert_eq!(triage_profile_lock("t1", "abcd"), "lock:triage:t1:abcd");
        assert_eq!(new_profile_lock("t1"), "lock:triage:t1:new_profile");
        assert_eq!(
            build_status("t1", Sanitizer::Address, RepoState::Unpatched),
            "triage:global:t1:address:unpatched:build_status"
        );
        assert_eq!(
            build_lock("t1", Sanitizer::Memory, RepoState::Patched),
            "lock:triage:global:t1:memory:patched:build"
        );
        assert_eq!(
            runner_status("pod-7", "t1", Sanitizer::Address, RepoState::Patched),
            "triage:pod-7:t1:address:patched:runner_status"
        );
        assert_eq!(cmin_artifact("t1", "fuzz_x"), "artifacts:t1:fuzz_x:none:cmin:after");
        assert_eq!(cmin_failed("t1"), "artifacts:t1:cmin:failed");
        assert_eq!(cmin_file("t1", "h", 11), "clustercmin:file:t1:h:11");
        assert_eq!(cmin_features("t1", "h"), "clustercmin:features:t1:h");
        assert_eq!(submission("pov", "t1", "42", 7), "submitter:pov:t1:42:7");
        assert_eq!(bundle_task("t1", 7), "submitter:bundle:t1:7");
    }
}
