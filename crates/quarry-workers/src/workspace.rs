//! Per-message scratch workspaces. Each message gets its own directory under
//! the system temp root; cleanup is best-effort on drop, while artifacts that
//! downstream stages need are copied to shared storage before the workspace
//! goes away.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn create(label: &str) -> Result<Self> {
        let root = std::env::temp_dir()
            .join("quarry")
            .join(format!("{label}-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create workspace {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.root).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_is_created_and_removed() {
        let path;
        {
            let ws = Workspace::create("test").unwrap();
            path = ws.path().to_path_buf();
            assert!(path.is_dir());
            std::fs::write(path.join("scratch.bin"), b"x").unwrap();
        }
        assert!(!path.exists());
    }

    #[test]
    fn workspaces_do_not_collide() {
        let a = Workspace::create("same").unwrap();
        let b = Workspace::create("same").unwrap();
        assert_ne!(a.path(), b.path());
    }
}
