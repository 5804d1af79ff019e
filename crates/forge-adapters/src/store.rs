//! Artifact storage addressed only by name.
//!
//! Names are relative, `/`-separated paths under a root directory. Anything
//! that would resolve outside the root is rejected before touching the disk.

use forge_core::ArtifactMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Files larger than this are not loaded as artifacts.
pub const MAX_ARTIFACT_BYTES: u64 = 512 * 1024;

const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "dist", "build"];

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid artifact name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("failed to access artifact {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn artifact(&self) -> &str {
        match self {
            StoreError::InvalidName { name, .. } | StoreError::Io { name, .. } => name,
        }
    }
}

pub trait ArtifactStore {
    fn load_all(&self) -> Result<ArtifactMap, StoreError>;
    fn save(&self, name: &str, content: &str) -> Result<(), StoreError>;

    fn save_all(&self, artifacts: &ArtifactMap) -> Result<usize, StoreError> {
        for (name, content) in artifacts {
            self.save(name, content)?;
        }
        Ok(artifacts.len())
    }
}

#[derive(Debug, Clone)]
pub struct DirArtifactStore {
    root: PathBuf,
}

impl DirArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Result<PathBuf, StoreError> {
        let invalid = |reason| StoreError::InvalidName {
            name: name.to_string(),
            reason,
        };
        if name.trim().is_empty() {
            return Err(invalid("name is empty"));
        }
        let candidate = Path::new(name);
        if candidate.is_absolute() || name.starts_with('/') || name.starts_with('\\') {
            return Err(invalid("absolute paths are not allowed"));
        }
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => return Err(invalid("parent traversal is not allowed")),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(invalid("absolute paths are not allowed"))
                }
            }
        }
        Ok(self.root.join(candidate))
    }
}

fn is_skipped(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return false;
    }
    let name = entry.file_name().to_string_lossy();
    name.starts_with('.') || (entry.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref()))
}

fn artifact_name(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

impl ArtifactStore for DirArtifactStore {
    /// Every UTF-8 file under the root, skipping hidden entries, dependency
    /// folders and oversized files. A missing root is an empty set.
    fn load_all(&self) -> Result<ArtifactMap, StoreError> {
        let mut artifacts = ArtifactMap::new();
        if !self.root.exists() {
            return Ok(artifacts);
        }

        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !is_skipped(e));
        for entry in walker.filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let too_large = entry
                .metadata()
                .map(|m| m.len() > MAX_ARTIFACT_BYTES)
                .unwrap_or(true);
            if too_large {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.root) else {
                continue;
            };
            let name = artifact_name(relative);
            match fs::read(entry.path()) {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        artifacts.insert(name, text);
                    }
                    Err(_) => debug!(artifact = %name, "skipping non-text file"),
                },
                Err(source) => return Err(StoreError::Io { name, source }),
            }
        }
        Ok(artifacts)
    }

    fn save(&self, name: &str, content: &str) -> Result<(), StoreError> {
        let path = self.resolve(name)?;
        let io_err = |source| StoreError::Io {
            name: name.to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        if fs::symlink_metadata(&path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
        {
            return Err(StoreError::InvalidName {
                name: name.to_string(),
                reason: "refusing to write through a symlink",
            });
        }
        fs::write(&path, content).map_err(io_err)?;
        debug!(artifact = %name, bytes = content.len(), "saved artifact");
        Ok(())
    }
}
