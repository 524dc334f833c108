use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};

/// Flat directory of playable files (usually a mounted USB stick).
pub trait MediaLibrary: Send + Sync {
    /// File names directly inside the library, sorted for display.
    fn list_files(&self) -> Result<Vec<String>>;

    fn contains(&self, name: &str) -> bool;

    fn resolve(&self, name: &str) -> PathBuf;
}

pub struct DirectoryLibrary {
    root: PathBuf,
}

impl DirectoryLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MediaLibrary for DirectoryLibrary {
    fn list_files(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            warn!("Media directory not found: {}", self.root.display());
            return Ok(Vec::new());
        }

        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to list {}", self.root.display()))?;
            if !entry.path().is_file() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => files.push(name),
                Err(raw) => warn!("Skipping non UTF-8 file name {raw:?}"),
            }
        }
        files.sort();

        debug!("Found {} files in {}", files.len(), self.root.display());
        Ok(files)
    }

    fn contains(&self, name: &str) -> bool {
        // Names come from the mapping table; refuse anything that would
        // escape the media root.
        let candidate = Path::new(name);
        if candidate.components().count() != 1 || candidate.is_absolute() {
            return false;
        }
        self.resolve(name).is_file()
    }

    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}
