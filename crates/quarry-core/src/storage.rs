//! Shared artifact store layout and tarball helpers. Only the producing
//! stage writes into its subtree; downstream stages read-only.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

#[derive(Debug, Clone)]
pub struct SharedStorage {
    root: PathBuf,
}

impl SharedStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Fail fast when the mount is missing; workers treat this as fatal.
    pub fn check(&self) -> Result<()> {
        if !self.root.is_dir() {
            anyhow::bail!("shared storage root {} does not exist", self.root.display());
        }
        Ok(())
    }

    pub fn corpus_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("corpus").join(task_id)
    }

    pub fn seeds_dir(&self, task_id: &str, model: &str, harness: &str) -> PathBuf {
        self.root.join("seeds").join(task_id).join(model).join(harness)
    }

    pub fn public_build_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("public_build").join(task_id)
    }

    pub fn slice_result_path(&self, slice_id: &str) -> PathBuf {
        self.root.join("slice_results").join(slice_id)
    }

    pub fn build_cache_dir(&self, task_id: &str, sanitizer: &str, state: &str) -> PathBuf {
        self.root
            .join("triage")
            .join("build_cache")
            .join(task_id)
            .join(sanitizer)
            .join(state)
    }

    pub fn crash_backup_dir(&self, producer: &str, task_id: &str, project: &str) -> PathBuf {
        self.root
            .join("crash_backup")
            .join(producer)
            .join(task_id)
            .join(project)
    }

    pub fn broken_report_dir(&self, task_id: &str, bug_id: i32) -> PathBuf {
        self.root.join("logs").join(task_id).join(bug_id.to_string())
    }

    pub fn seed_archive_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("seed_archive").join(task_id)
    }
}

/// Pack a directory's files into a gzip tarball. Paths inside the archive are
/// relative to `src_dir`.
pub fn pack_tar_gz(src_dir: &Path, dest_file: &Path) -> Result<()> {
    if let Some(parent) = dest_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = File::create(dest_file)
        .with_context(|| format!("create {}", dest_file.display()))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", src_dir)
        .with_context(|| format!("archive {}", src_dir.display()))?;
    builder.into_inner()?.finish()?;
    Ok(())
}

/// Extract a gzip tarball into `dest_dir`, removing residual copies of its
/// top-level entries first (a requeued task may have partially extracted
/// before). Returns the single top-level directory name when there is
/// exactly one.
pub fn extract_tar_gz(tar_path: &Path, dest_dir: &Path) -> Result<Option<String>> {
    std::fs::create_dir_all(dest_dir)?;

    // First pass: collect top-level entry names.
    let file = File::open(tar_path).with_context(|| format!("open {}", tar_path.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let mut top_level: BTreeSet<String> = BTreeSet::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        if let Some(root) = path.components().next() {
            let name = root.as_os_str().to_string_lossy().into_owned();
            if !name.is_empty() && name != "." {
                top_level.insert(name);
            }
        }
    }

    for name in &top_level {
        let existing = dest_dir.join(name);
        if existing.is_dir() {
            std::fs::remove_dir_all(&existing).ok();
        } else if existing.exists() {
            std::fs::remove_file(&existing).ok();
        }
    }

    // Second pass: extract.
    let file = File::open(tar_path)?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive
        .unpack(dest_dir)
        .with_context(|| format!("extract {} into {}", tar_path.display(), dest_dir.display()))?;

    if top_level.len() == 1 {
        Ok(top_level.into_iter().next())
    } else {
        Ok(None)
    }
}

/// Recursively copy a directory (used to publish build outputs to the
/// shared cache).
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_then_extract_round_trips_single_top_dir() {
        let src_root = tempfile::tempdir().unwrap();
        let project = src_root.path().join("mock1");
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(project.join("src/foo.c"), b"int main() {}\n").unwrap();
        std::fs::write(project.join("README"), b"hello\n").unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let tarball = scratch.path().join("mock1.tar.gz");
        pack_tar_gz(src_root.path(), &tarball).unwrap();

        let dest = tempfile::tempdir().unwrap();
        let top = extract_tar_gz(&tarball, dest.path()).unwrap();
        assert_eq!(top.as_deref(), Some("mock1"));
        let body = std::fs::read(dest.path().join("mock1/src/foo.c")).unwrap();
        assert_eq!(body, b"int main() {}\n");
    }

    #[test]
    fn extract_replaces_residual_directory() {
        let src_root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(src_root.path().join("proj")).unwrap();
        std::fs::write(src_root.path().join("proj/new.txt"), b"new").unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let tarball = scratch.path().join("proj.tar.gz");
        pack_tar_gz(src_root.path(), &tarball).unwrap();

        let dest = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dest.path().join("proj")).unwrap();
        std::fs::write(dest.path().join("proj/stale.txt"), b"stale").unwrap();

        extract_tar_gz(&tarball, dest.path()).unwrap();
        assert!(dest.path().join("proj/new.txt").exists());
        assert!(!dest.path().join("proj/stale.txt").exists());
    }

    #[test]
    fn storage_paths_are_namespaced_per_stage() {
        let storage = SharedStorage::new("/crs");
        assert_eq!(storage.corpus_dir("t1"), PathBuf::from("/crs/corpus/t1"));
        assert_eq!(
            storage.build_cache_dir("t1", "address", "patched"),
            PathBuf::from("/crs/triage/build_cache/t1/address/patched")
        );
        assert_eq!(
            storage.crash_backup_dir("directed", "t1", "libpng"),
            PathBuf::from("/crs/crash_backup/directed/t1/libpng")
        );
        assert_eq!(
            storage.broken_report_dir("t1", 9),
            PathBuf::from("/crs/logs/t1/9")
        );
    }
}
