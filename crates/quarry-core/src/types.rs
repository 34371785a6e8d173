use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Closed enum domains ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Full,
    Delta,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Full => "full",
            TaskType::Delta => "delta",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(TaskType::Full),
            "delta" => Some(TaskType::Delta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Waiting,
    Processing,
    Canceled,
    Errored,
    Succeeded,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Waiting => "waiting",
            TaskStatus::Processing => "processing",
            TaskStatus::Canceled => "canceled",
            TaskStatus::Errored => "errored",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "waiting" => Some(TaskStatus::Waiting),
            "processing" => Some(TaskStatus::Processing),
            "canceled" => Some(TaskStatus::Canceled),
            "errored" => Some(TaskStatus::Errored),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Workers only touch tasks in these states.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Processing | TaskStatus::Waiting)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sanitizer {
    Address,
    Memory,
    Undefined,
    Thread,
    None,
}

impl Sanitizer {
    /// The canonical replay set for a wildcard sanitizer.
    pub const REPLAY_SET: [Sanitizer; 3] = [Sanitizer::Address, Sanitizer::Memory, Sanitizer::Undefined];

    pub fn as_str(&self) -> &'static str {
        match self {
            Sanitizer::Address => "address",
            Sanitizer::Memory => "memory",
            Sanitizer::Undefined => "undefined",
            Sanitizer::Thread => "thread",
            Sanitizer::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "address" => Some(Sanitizer::Address),
            "memory" => Some(Sanitizer::Memory),
            "undefined" => Some(Sanitizer::Undefined),
            "thread" => Some(Sanitizer::Thread),
            "none" => Some(Sanitizer::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoState {
    Patched,
    Unpatched,
}

impl RepoState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoState::Patched => "patched",
            RepoState::Unpatched => "unpatched",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuzzerKind {
    Seedgen,
    Prime,
    General,
    Directed,
    Corpus,
    Seedmini,
    Seedcodex,
}

impl FuzzerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FuzzerKind::Seedgen => "seedgen",
            FuzzerKind::Prime => "prime",
            FuzzerKind::General => "general",
            FuzzerKind::Directed => "directed",
            FuzzerKind::Corpus => "corpus",
            FuzzerKind::Seedmini => "seedmini",
            FuzzerKind::Seedcodex => "seedcodex",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "seedgen" => Some(FuzzerKind::Seedgen),
            "prime" => Some(FuzzerKind::Prime),
            "general" => Some(FuzzerKind::General),
            "directed" => Some(FuzzerKind::Directed),
            "corpus" => Some(FuzzerKind::Corpus),
            "seedmini" => Some(FuzzerKind::Seedmini),
            "seedcodex" => Some(FuzzerKind::Seedcodex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Accepted,
    Passed,
    Failed,
    DeadlineExceeded,
    Errored,
    Inconclusive,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Accepted => "accepted",
            SubmissionStatus::Passed => "passed",
            SubmissionStatus::Failed => "failed",
            SubmissionStatus::DeadlineExceeded => "deadline_exceeded",
            SubmissionStatus::Errored => "errored",
            SubmissionStatus::Inconclusive => "inconclusive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "accepted" => Some(SubmissionStatus::Accepted),
            "passed" => Some(SubmissionStatus::Passed),
            "failed" => Some(SubmissionStatus::Failed),
            "deadline_exceeded" => Some(SubmissionStatus::DeadlineExceeded),
            "errored" => Some(SubmissionStatus::Errored),
            "inconclusive" => Some(SubmissionStatus::Inconclusive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchMode {
    Generic,
    Fast,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Repo,
    FuzzTooling,
    Diff,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Repo => "repo",
            SourceKind::FuzzTooling => "fuzz_tooling",
            SourceKind::Diff => "diff",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "repo" => Some(SourceKind::Repo),
            "fuzz_tooling" => Some(SourceKind::FuzzTooling),
            "diff" => Some(SourceKind::Diff),
            _ => None,
        }
    }
}

/// Role of this instance in timeout/OOM triage routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutOomRole {
    Sender,
    Processor,
    #[default]
    None,
}

impl TimeoutOomRole {
    pub fn parse(s: &str) -> Self {
        match s {
            "sender" => TimeoutOomRole::Sender,
            "processor" => TimeoutOomRole::Processor,
            _ => TimeoutOomRole::None,
        }
    }
}

// ── Relational entities ──────────────────────────────────────────────────

/// Top-level unit of work; owns all dependent rows.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: String,
    pub task_type: TaskType,
    pub project_name: String,
    /// Directory name of the target repo within the extracted sources.
    pub focus: String,
    /// Absolute deadline, epoch milliseconds.
    pub deadline: i64,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Source {
    pub id: i32,
    pub task_id: String,
    pub sha256: String,
    pub source_type: SourceKind,
    pub url: String,
    pub path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Seed {
    pub id: i32,
    pub task_id: String,
    /// Tarball on shared storage.
    pub path: String,
    /// `*` means the corpus applies to all harnesses.
    pub harness_name: String,
    pub fuzzer: FuzzerKind,
    pub instance: String,
    pub coverage: Option<f64>,
    pub metric: Option<serde_json::Value>,
}

/// A single reproducer (PoC) tied to a task, harness, and sanitizer.
#[derive(Debug, Clone)]
pub struct Bug {
    pub id: i32,
    pub task_id: String,
    pub architecture: String,
    pub poc: String,
    pub harness_name: String,
    pub sanitizer: String,
    pub sarif_report: Option<serde_json::Value>,
}

/// Semantic identity for a crash category within a task; the pentuple
/// `(task, harness, sanitizer, bug_type, trigger_point)` is unique.
#[derive(Debug, Clone)]
pub struct BugProfile {
    pub id: i32,
    pub task_id: String,
    pub harness_name: String,
    pub sanitizer: String,
    pub sanitizer_bug_type: String,
    pub trigger_point: String,
    /// Compressed stack trace.
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct BugCluster {
    pub id: i32,
    pub task_id: String,
    pub trigger_point: String,
}

#[derive(Debug, Clone)]
pub struct Patch {
    pub id: i32,
    pub bug_profile_id: i32,
    pub patch: String,
    /// Origin label (model name or generator id).
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct PatchStatusRow {
    pub id: i32,
    pub patch_id: i32,
    pub status: SubmissionStatus,
    /// null = unknown / in flight.
    pub functionality_tests_passing: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct SarifResult {
    pub id: i32,
    pub task_id: String,
    pub sarif_id: String,
    pub bug_profile_id: Option<i32>,
    pub result: bool,
    pub description: String,
}

// ── Queue message schemas ────────────────────────────────────────────────
//
// Every queue payload is a single UTF-8 JSON object. Unknown fields are
// preserved by consumers that forward messages downstream.

/// Common task description carried by source-handling stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub task_id: String,
    pub task_type: TaskType,
    pub project_name: String,
    pub focus: String,
    pub repo: Vec<String>,
    pub fuzzing_tooling: String,
    #[serde(default)]
    pub diff: Option<String>,
}

pub type CorpusMessage = TaskSpec;
pub type SeedgenMessage = TaskSpec;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CminMessage {
    pub task_id: String,
    pub harness: String,
    /// Path to the seed corpus tarball on shared storage.
    pub seeds: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceMessage {
    pub task_id: String,
    pub slice_id: String,
    pub is_sarif: bool,
    pub project_name: String,
    pub focus: String,
    pub repo: Vec<String>,
    pub fuzzing_tooling: String,
    #[serde(default)]
    pub diff: Option<String>,
    #[serde(default)]
    pub slice_target: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectedMessage {
    #[serde(flatten)]
    pub spec: TaskSpec,
    #[serde(default)]
    pub sarif_slice_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageMessage {
    pub bug_id: i32,
    pub task_id: String,
    pub task_type: TaskType,
    /// May be `*`, meaning replay against the canonical sanitizer set.
    pub sanitizer: String,
    /// May be `*`, meaning auto-discover harnesses from the build output.
    pub harness_name: String,
    pub poc_path: String,
    pub project_name: String,
    pub focus: String,
    pub repo: Vec<String>,
    pub fuzzing_tooling: String,
    #[serde(default)]
    pub diff: Option<String>,
}

impl TriageMessage {
    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            task_id: self.task_id.clone(),
            task_type: self.task_type,
            project_name: self.project_name.clone(),
            focus: self.focus.clone(),
            repo: self.repo.clone(),
            fuzzing_tooling: self.fuzzing_tooling.clone(),
            diff: self.diff.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupMessage {
    pub task_id: String,
    pub task_type: TaskType,
    pub project_name: String,
    pub focus: String,
    pub repo: Vec<String>,
    pub fuzz_tooling: String,
    #[serde(default)]
    pub diff: Option<String>,
    pub bug_profile_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchMessage {
    pub bug_profile_id: i32,
    pub patch_mode: PatchMode,
}

/// Descriptor announcing a built harness artifact to fuzzer fleets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fuzzlet {
    pub task_id: String,
    pub harness: String,
    pub sanitizer: String,
    pub engine: String,
    pub artifact: String,
}

// ── Queue names ──────────────────────────────────────────────────────────

pub mod queues {
    pub const CORPUS: &str = "corpus_queue";
    pub const CMIN: &str = "cmin_queue";
    pub const SEEDGEN: &str = "seedgen_queue";
    pub const SLICE: &str = "slice_queue";
    pub const SLICE_R18: &str = "slice_queue_R18";
    pub const DIRECTED: &str = "directed_queue";
    pub const TRIAGE: &str = "triage_queue";
    pub const DEDUP: &str = "dedup_queue";
    pub const TIMEOUT: &str = "timeout_queue";
    pub const PATCH: &str = "patch_queue";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triage_message_wire_format() {
        let body = r#"{
            "bug_id": 12,
            "task_id": "T1",
            "task_type": "delta",
            "sanitizer": "*",
            "harness_name": "fuzz_png",
            "poc_path": "/crs/pocs/12",
            "project_name": "libpng",
            "focus": "libpng",
            "repo": ["/crs/src/libpng.tar.gz"],
            "fuzzing_tooling": "/crs/src/oss-fuzz.tar.gz",
            "diff": "/crs/src/diff.tar.gz"
        }"#;
        let msg: TriageMessage = serde_json::from_str(body).unwrap();
        assert_eq!(msg.task_type, TaskType::Delta);
        assert_eq!(msg.sanitizer, "*");
        assert_eq!(msg.spec().focus, "libpng");
    }

    #[test]
    fn diff_field_is_optional() {
        let body = r#"{
            "task_id": "T1",
            "task_type": "full",
            "project_name": "mock1",
            "focus": "mock1",
            "repo": ["/crs/src/mock1.tar.gz"],
            "fuzzing_tooling": "/crs/src/tooling.tar.gz"
        }"#;
        let msg: CorpusMessage = serde_json::from_str(body).unwrap();
        assert!(msg.diff.is_none());
    }

    #[test]
    fn patch_message_round_trips_modes() {
        let msg = PatchMessage {
            bug_profile_id: 7,
            patch_mode: PatchMode::Generic,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"generic\""));
        let back: PatchMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.patch_mode, PatchMode::Generic);
    }

    #[test]
    fn unknown_enum_values_fail_closed() {
        assert!(TaskStatus::parse("exploded").is_none());
        assert!(Sanitizer::parse("dataflow").is_none());
        assert!(SubmissionStatus::parse("maybe").is_none());
        let bad = r#"{"bug_profile_id": 1, "patch_mode": "bogus"}"#;
        assert!(serde_json::from_str::<PatchMessage>(bad).is_err());
    }

    #[test]
    fn wildcard_replay_set_is_the_narrow_one() {
        assert_eq!(
            Sanitizer::REPLAY_SET,
            [Sanitizer::Address, Sanitizer::Memory, Sanitizer::Undefined]
        );
    }

    #[test]
    fn active_statuses() {
        assert!(TaskStatus::Processing.is_active());
        assert!(TaskStatus::Waiting.is_active());
        assert!(!TaskStatus::Canceled.is_active());
        assert!(!TaskStatus::Succeeded.is_active());
    }
}
