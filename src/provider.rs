use crate::runner::events::RunEvent;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::sync::broadcast;

/// File system collaborator. The loader and composer resolve flow
/// references through this; the reconciler reads source text for lazy line
/// mapping. Not part of the engine's own contract.
pub trait FileProvider: Send + Sync {
    fn read_file(&self, path: &Path) -> Result<String>;
    fn write_file(&self, path: &Path, text: &str) -> Result<()>;
    /// All files under `dir`, recursively
    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>>;
    fn exists(&self, path: &Path) -> bool;
    fn remove_file(&self, path: &Path) -> Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;
}

/// Standard file-system backed provider
#[derive(Debug, Default)]
pub struct FsFileProvider;

impl FileProvider for FsFileProvider {
    fn read_file(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read file: {}", path.display()))
    }

    fn write_file(&self, path: &Path, text: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)
            .with_context(|| format!("failed to write file: {}", path.display()))
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in walkdir::WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                files.push(entry.path().to_path_buf());
            }
        }
        Ok(files)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove file: {}", path.display()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::rename(from, to)
            .with_context(|| format!("failed to rename {}", from.display()))
    }
}

/// In-memory provider for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryFileProvider {
    files: RwLock<HashMap<PathBuf, String>>,
}

impl MemoryFileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<PathBuf>, text: impl Into<String>) {
        self.files
            .write()
            .unwrap()
            .insert(normalize(&path.into()), text.into());
    }
}

impl FileProvider for MemoryFileProvider {
    fn read_file(&self, path: &Path) -> Result<String> {
        self.files
            .read()
            .unwrap()
            .get(&normalize(path))
            .cloned()
            .with_context(|| format!("no such file: {}", path.display()))
    }

    fn write_file(&self, path: &Path, text: &str) -> Result<()> {
        self.insert(path, text);
        Ok(())
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        let dir = normalize(dir);
        Ok(self
            .files
            .read()
            .unwrap()
            .keys()
            .filter(|p| p.starts_with(&dir))
            .cloned()
            .collect())
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().unwrap().contains_key(&normalize(path))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.files
            .write()
            .unwrap()
            .remove(&normalize(path))
            .map(|_| ())
            .with_context(|| format!("no such file: {}", path.display()))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let text = self.read_file(from)?;
        self.remove_file(from)?;
        self.insert(to, text);
        Ok(())
    }
}

/// Lexically normalize a path: strip `.` components and resolve `..`
/// against preceding components without touching the file system.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Request handed to an external automation backend
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub content: String,
    pub file_id: String,
    pub file_name: String,
}

/// Out-of-process execution collaborator. The engine starts a run and then
/// treats the bridge purely as an event source; the backend's internal
/// automation logic is out of scope.
#[async_trait]
pub trait EventBridge: Send + Sync {
    async fn invoke(&self, request: RunRequest) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<RunEvent>;
}
