//! Workspace file store collaborator
//!
//! The pipeline never owns workspace persistence; it talks to whatever
//! backs the user's workspace through this trait. The store is
//! last-write-wins. Conflict detection happens above it, in the sandbox's
//! promote step, never here.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

use crate::util::sanitize_rel_path;

pub trait WorkspaceStore: Send + Sync {
    /// All file paths in the workspace, workspace-relative.
    fn list(&self) -> Result<Vec<String>>;
    /// Content of one file, or None if absent.
    fn get(&self, path: &str) -> Result<Option<String>>;
    fn insert(&self, path: &str, content: &str) -> Result<()>;
    fn update(&self, path: &str, content: &str) -> Result<()>;
}

/// In-memory store. Used by tests and by ephemeral preview workspaces.
#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(files: &[(&str, &str)]) -> Self {
        let store = Self::new();
        {
            let mut map = store.files.lock().unwrap();
            for (path, content) in files {
                map.insert(path.to_string(), content.to_string());
            }
        }
        store
    }
}

impl WorkspaceStore for MemoryStore {
    fn list(&self) -> Result<Vec<String>> {
        Ok(self.files.lock().unwrap().keys().cloned().collect())
    }

    fn get(&self, path: &str) -> Result<Option<String>> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    fn insert(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    fn update(&self, path: &str, content: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }
}

const SKIPPED_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "dist", "__pycache__"];

/// Store backed by a directory on disk.
///
/// Listing skips VCS and build directories and silently ignores files that
/// are not valid UTF-8; the pipeline only edits text.
#[derive(Debug)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root
            .as_ref()
            .canonicalize()
            .with_context(|| format!("Failed to resolve workspace root '{}'", root.as_ref().display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let clean = sanitize_rel_path(path).map_err(anyhow::Error::msg)?;
        Ok(self.root.join(clean))
    }
}

impl WorkspaceStore for FsStore {
    fn list(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        let walker = WalkDir::new(&self.root).into_iter().filter_entry(|e| {
            // The root itself is exempt; only nested entries are skippable,
            // or a workspace rooted at a directory named `target` or `dist`
            // would list nothing.
            e.depth() == 0
                || e.file_name()
                    .to_str()
                    .map(|name| !SKIPPED_DIRS.contains(&name))
                    .unwrap_or(false)
        });
        for entry in walker {
            let entry = entry.context("Failed to walk workspace")?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .context("Walked outside workspace root")?;
            if let Some(rel) = rel.to_str() {
                paths.push(rel.replace('\\', "/"));
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn get(&self, path: &str) -> Result<Option<String>> {
        let full = self.resolve(path)?;
        if !full.exists() {
            return Ok(None);
        }
        match fs::read_to_string(&full) {
            Ok(content) => Ok(Some(content)),
            // Binary file: invisible to the pipeline, same as absent.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read '{}'", path)),
        }
    }

    fn insert(&self, path: &str, content: &str) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create parent dirs for '{}'", path))?;
        }
        fs::write(&full, content).with_context(|| format!("Failed to write '{}'", path))
    }

    fn update(&self, path: &str, content: &str) -> Result<()> {
        self.insert(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::with_files(&[("a.ts", "foo()")]);
        assert_eq!(store.get("a.ts").unwrap().as_deref(), Some("foo()"));
        assert_eq!(store.get("missing.ts").unwrap(), None);

        store.update("a.ts", "bar()").unwrap();
        assert_eq!(store.get("a.ts").unwrap().as_deref(), Some("bar()"));
        assert_eq!(store.list().unwrap(), vec!["a.ts".to_string()]);
    }

    #[test]
    fn test_fs_store_lists_and_skips_build_dirs() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::create_dir_all(dir.path().join("node_modules/x")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("node_modules/x/index.js"), "x").unwrap();

        let store = FsStore::new(dir.path()).unwrap();
        let paths = store.list().unwrap();
        assert_eq!(paths, vec!["src/main.rs".to_string()]);
    }

    #[test]
    fn test_fs_store_root_named_like_build_dir_still_lists() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("target");
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/main.rs"), "fn main() {}").unwrap();
        fs::create_dir_all(root.join("target")).unwrap();
        fs::write(root.join("target/out.bin"), "x").unwrap();

        let store = FsStore::new(&root).unwrap();
        let paths = store.list().unwrap();
        // The root's own name never filters it out; its nested `target`
        // directory still is.
        assert_eq!(paths, vec!["src/main.rs".to_string()]);
    }

    #[test]
    fn test_fs_store_insert_creates_parents() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        store.insert("deep/nested/file.txt", "hello").unwrap();
        assert_eq!(
            store.get("deep/nested/file.txt").unwrap().as_deref(),
            Some("hello")
        );
    }

    #[test]
    fn test_fs_store_rejects_traversal() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(dir.path()).unwrap();
        assert!(store.get("../outside").is_err());
        assert!(store.insert("/abs/path", "x").is_err());
    }
}
