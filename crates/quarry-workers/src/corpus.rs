//! Corpus worker: extracts the task sources, harvests an initial seed corpus
//! from the target tree, publishes it for minimization and generative
//! seeding, and (for non-JVM projects) registers every seed as a potential
//! bug so triage can replay it.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use quarry_core::builder;
use quarry_core::bus::MessageHeaders;
use quarry_core::error::StageError;
use quarry_core::ossfuzz;
use quarry_core::storage;
use quarry_core::types::{
    queues, Bug, CminMessage, CorpusMessage, FuzzerKind, RepoState, Sanitizer, Seed, TaskType,
};

use crate::worker::{Envelope, StageWorker, WorkerContext};

/// Seeds larger than this are noise for fuzzing bootstrap.
const MAX_SEED_BYTES: u64 = 1 << 20;
const MAX_SEED_FILES: usize = 2000;

pub struct CorpusWorker;

#[async_trait]
impl StageWorker for CorpusWorker {
    fn queue(&self) -> &'static str {
        queues::CORPUS
    }

    async fn handle(&self, ctx: &WorkerContext, envelope: Envelope) -> Result<(), StageError> {
        let msg: CorpusMessage = envelope.decode()?;
        let workspace = crate::workspace::Workspace::create("corpus")
            .map_err(|e| StageError::Fatal(format!("workspace: {e:#}")))?;

        let tooling_name = builder::extract_sources(&msg, workspace.path(), msg.diff.is_some())
            .await
            .map_err(StageError::transient)?;

        // Harvest candidate seeds from the source tree.
        let focus_dir = workspace.path().join(&msg.focus);
        let mut seeds = gather_corpus_files(&focus_dir);
        let project_dir = workspace
            .path()
            .join(&tooling_name)
            .join("projects")
            .join(&msg.project_name);
        seeds.extend(gather_corpus_files(&project_dir));
        seeds.truncate(MAX_SEED_FILES);
        info!("task {}: harvested {} corpus seeds", msg.task_id, seeds.len());

        // Stage the corpus on shared storage and record the Seed row.
        let corpus_dir = ctx.storage.corpus_dir(&msg.task_id);
        let files_dir = corpus_dir.join("files");
        std::fs::create_dir_all(&files_dir).map_err(StageError::transient)?;
        let mut stored: Vec<PathBuf> = Vec::new();
        for (idx, seed) in seeds.iter().enumerate() {
            let name = seed
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("seed-{idx}"));
            let dest = files_dir.join(format!("{idx:05}-{name}"));
            if std::fs::copy(seed, &dest).is_ok() {
                stored.push(dest);
            }
        }

        let tarball = corpus_dir.join("corpus.tar.gz");
        storage::pack_tar_gz(&files_dir, &tarball).map_err(StageError::transient)?;

        ctx.db
            .insert_seed(&Seed {
                id: 0,
                task_id: msg.task_id.clone(),
                path: tarball.to_string_lossy().into_owned(),
                harness_name: "*".to_string(),
                fuzzer: FuzzerKind::Corpus,
                instance: ctx.cfg.instance.clone(),
                coverage: None,
                metric: None,
            })
            .await
            .map_err(StageError::transient)?;

        // Build once to discover the real harness set.
        let state = match msg.task_type {
            TaskType::Full => RepoState::Unpatched,
            TaskType::Delta => RepoState::Patched,
        };
        let env = ctx
            .brs
            .ensure_build(&msg, Sanitizer::Address, state)
            .await
            .map_err(|e| StageError::BuildFailure(format!("{e:#}")))?;
        let out_dir = env.out_dir();
        let mut harnesses = ossfuzz::find_fuzzers(&out_dir, false).map_err(StageError::transient)?;
        let is_jvm = if harnesses.is_empty() {
            harnesses = ossfuzz::find_fuzzers(&out_dir, true).map_err(StageError::transient)?;
            !harnesses.is_empty()
        } else {
            false
        };
        info!(
            "task {}: {} harnesses discovered (jvm={is_jvm})",
            msg.task_id,
            harnesses.len()
        );

        let project_meta = read_project_meta(&project_dir);

        // Fan out minimization per harness; forward the same task spec for
        // generative seeding.
        let headers = MessageHeaders {
            traceparent: envelope.headers.traceparent.clone(),
            ..MessageHeaders::default()
        };
        for harness in &harnesses {
            ctx.bus
                .publish_json(
                    queues::CMIN,
                    &CminMessage {
                        task_id: msg.task_id.clone(),
                        harness: harness.clone(),
                        seeds: tarball.to_string_lossy().into_owned(),
                    },
                    None,
                    &headers,
                )
                .await
                .map_err(StageError::transient)?;
        }
        ctx.bus
            .publish_json(queues::SEEDGEN, &msg, None, &headers)
            .await
            .map_err(StageError::transient)?;

        // Non-JVM tasks: register every stored seed as a potential bug so
        // triage replays it against each sanitizer/harness pair.
        if !is_jvm && !harnesses.is_empty() {
            let sanitizers = if project_meta.sanitizers.is_empty() {
                vec!["address".to_string()]
            } else {
                project_meta.sanitizers
            };
            let mut saved = 0usize;
            for path in &stored {
                for sanitizer in &sanitizers {
                    for harness in &harnesses {
                        ctx.db
                            .insert_bug(&Bug {
                                id: 0,
                                task_id: msg.task_id.clone(),
                                architecture: "x86_64".to_string(),
                                poc: path.to_string_lossy().into_owned(),
                                harness_name: harness.clone(),
                                sanitizer: sanitizer.clone(),
                                sarif_report: None,
                            })
                            .await
                            .map_err(StageError::transient)?;
                        saved += 1;
                    }
                }
            }
            info!("task {}: saved {saved} potential bug records", msg.task_id);
        }

        Ok(())
    }
}

/// Walk the tree for directories that look like seed corpora and collect
/// their small files.
pub fn gather_corpus_files(root: &Path) -> Vec<PathBuf> {
    const CORPUS_DIR_HINTS: [&str; 5] = ["corpus", "seed", "seeds", "testdata", "tests"];
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if found.len() >= MAX_SEED_FILES {
            break;
        }
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        let in_corpus_dir = CORPUS_DIR_HINTS.iter().any(|h| dir_name.contains(h));
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if !path.file_name().map(|n| n.to_string_lossy().starts_with('.')).unwrap_or(false) {
                    stack.push(path);
                }
            } else if file_type.is_file() && in_corpus_dir {
                let small = entry.metadata().map(|m| m.len() <= MAX_SEED_BYTES).unwrap_or(false);
                if small {
                    found.push(path);
                    if found.len() >= MAX_SEED_FILES {
                        break;
                    }
                }
            }
        }
    }
    found.sort();
    found
}

#[derive(Debug, Default)]
pub struct ProjectMeta {
    pub sanitizers: Vec<String>,
    pub language: String,
}

/// Minimal read of `projects/<name>/project.yaml`: the `language` scalar and
/// the `sanitizers` list are the only keys the pipeline needs.
pub fn read_project_meta(project_dir: &Path) -> ProjectMeta {
    let Ok(text) = std::fs::read_to_string(project_dir.join("project.yaml")) else {
        return ProjectMeta::default();
    };
    parse_project_meta(&text)
}

pub fn parse_project_meta(text: &str) -> ProjectMeta {
    let mut meta = ProjectMeta::default();
    let mut in_sanitizers = false;
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("language:") {
            meta.language = value.trim().trim_matches('"').to_string();
            in_sanitizers = false;
        } else if trimmed == "sanitizers:" {
            in_sanitizers = true;
        } else if in_sanitizers {
            if let Some(item) = trimmed.strip_prefix("- ") {
                meta.sanitizers.push(item.trim().to_string());
            } else if !trimmed.is_empty() && !trimmed.starts_with('-') {
                in_sanitizers = false;
            }
        }
    }
    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_meta_parses_language_and_sanitizers() {
        let yaml = "\
homepage: https://example.org
language: c++
sanitizers:
  - address
  - undefined
fuzzing_engines:
  - libfuzzer
";
        let meta = parse_project_meta(yaml);
        assert_eq!(meta.language, "c++");
        assert_eq!(meta.sanitizers, vec!["address".to_string(), "undefined".to_string()]);
    }

    #[test]
    fn project_meta_defaults_when_keys_missing() {
        let meta = parse_project_meta("homepage: x\n");
        assert!(meta.sanitizers.is_empty());
        assert!(meta.language.is_empty());
    }

    #[test]
    fn gather_finds_small_files_in_corpus_dirs_only() {
        let root = tempfile::tempdir().unwrap();
        let corpus = root.path().join("fuzz").join("corpus");
        std::fs::create_dir_all(&corpus).unwrap();
        std::fs::write(corpus.join("a.bin"), b"aaaa").unwrap();
        std::fs::create_dir_all(root.path().join("src")).unwrap();
        std::fs::write(root.path().join("src/main.c"), b"int main;").unwrap();

        let found = gather_corpus_files(root.path());
        assert_eq!(found.len(), 1);
        assert!(found[0].ends_with("a.bin"));
    }
}
