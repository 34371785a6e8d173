//! Slice worker: computes the set of functions reachable from a diff (or
//! from a SARIF-reported target) and publishes the list for directed
//! fuzzing. The changed-function seed set comes from parsing the unified
//! diff; a bounded caller expansion over the source tree approximates
//! reachability without a full bitcode pass.

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use tracing::{info, warn};

use quarry_core::builder;
use quarry_core::error::StageError;
use quarry_core::types::{queues, SliceMessage, TaskSpec, TaskType};

use crate::worker::{Envelope, StageWorker, WorkerContext};

/// Levels of caller expansion applied on top of the changed functions.
const CALLER_DEPTH: usize = 2;

pub struct SliceWorker {
    pub input_queue: &'static str,
}

impl SliceWorker {
    pub fn new() -> Self {
        Self { input_queue: queues::SLICE }
    }

    /// Secondary pool consuming the R18 queue.
    pub fn r18() -> Self {
        Self { input_queue: queues::SLICE_R18 }
    }
}

impl Default for SliceWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StageWorker for SliceWorker {
    fn queue(&self) -> &'static str {
        self.input_queue
    }

    async fn handle(&self, ctx: &WorkerContext, envelope: Envelope) -> Result<(), StageError> {
        let msg: SliceMessage = envelope.decode()?;
        let workspace = crate::workspace::Workspace::create("slice")
            .map_err(|e| StageError::Fatal(format!("workspace: {e:#}")))?;

        let spec = TaskSpec {
            task_id: msg.task_id.clone(),
            task_type: TaskType::Delta,
            project_name: msg.project_name.clone(),
            focus: msg.focus.clone(),
            repo: msg.repo.clone(),
            fuzzing_tooling: msg.fuzzing_tooling.clone(),
            diff: msg.diff.clone(),
        };
        builder::extract_sources(&spec, workspace.path(), false)
            .await
            .map_err(StageError::transient)?;

        // Seed set: SARIF target when given, else the functions the diff touches.
        let mut roots: BTreeSet<String> = BTreeSet::new();
        if msg.is_sarif {
            if let Some(target) = &msg.slice_target {
                roots.insert(target.clone());
            }
        }
        if roots.is_empty() {
            if let Some(diff_text) = read_diff_text(workspace.path(), msg.diff.as_deref()) {
                roots = changed_functions(&diff_text);
            }
        }

        let focus_dir = workspace.path().join(&msg.focus);
        let reachable = if roots.is_empty() {
            warn!("slice {}: no slice roots found", msg.slice_id);
            BTreeSet::new()
        } else {
            expand_callers(&focus_dir, &roots, CALLER_DEPTH)
        };

        // Publish the result list; an empty result still produces a file so
        // waiters can distinguish "done, nothing reachable" from "pending".
        let result_path = ctx.storage.slice_result_path(&msg.slice_id);
        if let Some(parent) = result_path.parent() {
            std::fs::create_dir_all(parent).map_err(StageError::transient)?;
        }
        let body = reachable.iter().cloned().collect::<Vec<_>>().join("\n");
        std::fs::write(&result_path, body).map_err(StageError::transient)?;
        info!(
            "slice {}: {} reachable functions recorded",
            msg.slice_id,
            reachable.len()
        );

        let path_str = result_path.to_string_lossy();
        if msg.is_sarif {
            ctx.db
                .insert_sarif_slice(&msg.slice_id, &path_str)
                .await
                .map_err(StageError::transient)?;
        } else {
            ctx.db
                .insert_directed_slice(&msg.slice_id, &path_str)
                .await
                .map_err(StageError::transient)?;
        }
        Ok(())
    }
}

/// Locate the extracted diff entry and concatenate its patch text.
fn read_diff_text(workspace: &Path, diff_archive: Option<&str>) -> Option<String> {
    let diff_archive = diff_archive?;
    let name = Path::new(diff_archive).file_name()?.to_string_lossy();
    let stem = name.trim_end_matches(".tar.gz").trim_end_matches(".tgz");
    let entry = workspace.join(stem);
    if entry.is_file() {
        return std::fs::read_to_string(&entry).ok();
    }
    if entry.is_dir() {
        let mut combined = String::new();
        let mut paths: Vec<_> = std::fs::read_dir(&entry)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().map(|ext| ext == "patch" || ext == "diff").unwrap_or(false)
            })
            .collect();
        paths.sort();
        for path in paths {
            if let Ok(text) = std::fs::read_to_string(&path) {
                combined.push_str(&text);
                combined.push('\n');
            }
        }
        return Some(combined);
    }
    // Fall back to any *.diff / *.patch at the workspace root.
    let mut combined = String::new();
    for entry in std::fs::read_dir(workspace).ok()?.flatten() {
        let path = entry.path();
        if path.extension().map(|ext| ext == "patch" || ext == "diff").unwrap_or(false) {
            if let Ok(text) = std::fs::read_to_string(&path) {
                combined.push_str(&text);
                combined.push('\n');
            }
        }
    }
    if combined.is_empty() {
        None
    } else {
        Some(combined)
    }
}

/// Names of functions whose bodies a unified diff touches, taken from the
/// hunk-header context (`@@ -a,b +c,d @@ type func(args)`).
pub fn changed_functions(diff_text: &str) -> BTreeSet<String> {
    let mut functions = BTreeSet::new();
    for line in diff_text.lines() {
        if !line.starts_with("@@") {
            continue;
        }
        // Context trails the second `@@`.
        let Some(end) = line[2..].find("@@") else {
            continue;
        };
        let context = line[2 + end + 2..].trim();
        if context.is_empty() {
            continue;
        }
        if let Some(name) = function_name_from_context(context) {
            functions.insert(name);
        }
    }
    functions
}

/// Extract the identifier immediately before the argument list.
fn function_name_from_context(context: &str) -> Option<String> {
    let paren = context.find('(')?;
    let before = &context[..paren];
    let name: String = before
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if name.is_empty() || name.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(true) {
        return None;
    }
    Some(name)
}

/// Bounded reverse-call expansion: at each level, add the functions whose
/// bodies mention any function already in the set. A textual approximation,
/// deliberately over-approximate.
pub fn expand_callers(root: &Path, roots: &BTreeSet<String>, depth: usize) -> BTreeSet<String> {
    let sources = collect_source_files(root);
    let mut reachable = roots.clone();
    for _ in 0..depth {
        let mut next = reachable.clone();
        for path in &sources {
            let Ok(text) = std::fs::read_to_string(path) else {
                continue;
            };
            if !reachable.iter().any(|f| text.contains(f.as_str())) {
                continue;
            }
            // Any function defined in a file that calls a reachable function
            // joins the frontier.
            for defined in changed_functions_from_definitions(&text) {
                next.insert(defined);
            }
        }
        if next.len() == reachable.len() {
            break;
        }
        reachable = next;
    }
    reachable
}

fn collect_source_files(root: &Path) -> Vec<std::path::PathBuf> {
    const EXTS: [&str; 7] = ["c", "cc", "cpp", "cxx", "h", "hpp", "java"];
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| EXTS.contains(&e))
                .unwrap_or(false)
            {
                files.push(path);
            }
        }
    }
    files
}

/// Heuristic scan for function definitions: `name(args...) {` at the start
/// of a statement.
fn changed_functions_from_definitions(text: &str) -> BTreeSet<String> {
    let mut defined = BTreeSet::new();
    for line in text.lines() {
        let trimmed = line.trim_end();
        if !trimmed.ends_with('{') {
            continue;
        }
        let Some(paren) = trimmed.find('(') else {
            continue;
        };
        if let Some(name) = function_name_from_context(&trimmed[..paren + 1]) {
            defined.insert(name);
        }
    }
    defined
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIFF: &str = "\
--- a/src/pngread.c
+++ b/src/pngread.c
@@ -40,6 +40,7 @@ void png_read_row(png_structp png_ptr)
     if (row == NULL)
+        return;
@@ -90,4 +91,5 @@ static int check_chunk(png_bytep data, size_t len)
     return 1;
";

    #[test]
    fn changed_functions_come_from_hunk_context() {
        let funcs = changed_functions(DIFF);
        assert!(funcs.contains("png_read_row"));
        assert!(funcs.contains("check_chunk"));
        assert_eq!(funcs.len(), 2);
    }

    #[test]
    fn hunks_without_context_are_skipped() {
        let funcs = changed_functions("@@ -1,2 +1,2 @@\n-a\n+b\n");
        assert!(funcs.is_empty());
    }

    #[test]
    fn caller_expansion_reaches_one_level_up() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join("lib.c"),
            "int helper(int x) {\n  return x;\n}\nint outer(int y) {\n  return helper(y);\n}\n",
        )
        .unwrap();
        let roots: BTreeSet<String> = ["helper".to_string()].into_iter().collect();
        let reachable = expand_callers(root.path(), &roots, 2);
        assert!(reachable.contains("helper"));
        assert!(reachable.contains("outer"));
    }
}
