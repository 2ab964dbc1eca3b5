//! Directory catalog: discover exposure files and track the current selection.
//!
//! One catalog indexes one working directory, non-recursively. Entries are
//! immutable snapshots (path + mtime + size); any change on disk is picked up
//! by `refresh()`, which reconciles the list while keeping the selection on
//! the same file when it survives.

use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

/// Extensions the catalog considers exposures. The vendor formats plus the
/// common export formats the built-in decoder can open.
const IMAGE_EXTENSIONS: &[&str] = &[
    "xisf", "xifs", "fits", "fit", "fts", "raw", "tif", "tiff", "png",
];

pub fn is_image_ext(ext: &str) -> bool {
    IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str())
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("cannot read directory '{path}': {reason}")]
    DirectoryUnreadable { path: PathBuf, reason: String },
    #[error("catalog is empty")]
    EmptyCatalog,
}

/// Snapshot identity of one file on disk. Equality over all three fields is
/// what the cache uses for freshness; equality over `path` alone is list
/// identity across refreshes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFileEntry {
    pub path: PathBuf,
    /// Last modification, seconds since the epoch.
    pub mtime: u64,
    pub size: u64,
}

impl ImageFileEntry {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    }
}

#[derive(Debug)]
pub struct FileCatalog {
    dir: PathBuf,
    entries: Vec<ImageFileEntry>,
    current: Option<usize>,
}

impl FileCatalog {
    /// Scan `dir` and select the first entry if any.
    pub fn open(dir: &Path) -> Result<Self, CatalogError> {
        let entries = scan(dir)?;
        let current = if entries.is_empty() { None } else { Some(0) };
        Ok(FileCatalog {
            dir: dir.to_path_buf(),
            entries,
            current,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entries(&self) -> &[ImageFileEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current_entry(&self) -> Option<&ImageFileEntry> {
        self.current.and_then(|i| self.entries.get(i))
    }

    pub fn entry(&self, index: usize) -> Option<&ImageFileEntry> {
        self.entries.get(index)
    }

    pub fn position_of(&self, path: &Path) -> Option<usize> {
        self.entries.iter().position(|e| e.path == path)
    }

    /// Clamp `index` into range and select it. Reports `EmptyCatalog` (and
    /// changes nothing) when there are no entries.
    pub fn set_current(&mut self, index: usize) -> Result<usize, CatalogError> {
        if self.entries.is_empty() {
            return Err(CatalogError::EmptyCatalog);
        }
        let clamped = index.min(self.entries.len() - 1);
        self.current = Some(clamped);
        Ok(clamped)
    }

    /// Re-scan the directory and reconcile. The selection stays on the same
    /// path if it still exists; otherwise it clamps to the previous index,
    /// falling back to 0, or none when the directory emptied out.
    pub fn refresh(&mut self) -> Result<(), CatalogError> {
        let selected_path = self.current_entry().map(|e| e.path.clone());
        let previous_index = self.current;

        self.entries = scan(&self.dir)?;

        self.current = if self.entries.is_empty() {
            None
        } else if let Some(i) = selected_path.as_deref().and_then(|p| self.position_of(p)) {
            Some(i)
        } else {
            Some(previous_index.unwrap_or(0).min(self.entries.len() - 1))
        };
        Ok(())
    }
}

/// List eligible files directly in `dir`, sorted case-insensitively by
/// filename with the full path as tie-break. The PRETRASH subdirectory is a
/// directory, so the depth-1 walk never lists its contents.
fn scan(dir: &Path) -> Result<Vec<ImageFileEntry>, CatalogError> {
    if !dir.is_dir() {
        return Err(CatalogError::DirectoryUnreadable {
            path: dir.to_path_buf(),
            reason: "not a directory".into(),
        });
    }
    // Surface permission errors up front; walkdir swallows them per-entry.
    std::fs::read_dir(dir).map_err(|e| CatalogError::DirectoryUnreadable {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    let mut entries = Vec::new();
    for entry in WalkDir::new(dir)
        .max_depth(1)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if !IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(m) => m,
            Err(_) => continue,
        };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        entries.push(ImageFileEntry {
            path: path.to_path_buf(),
            mtime,
            size: meta.len(),
        });
    }

    entries.sort_by(|a, b| {
        let an = a.file_name().to_lowercase();
        let bn = b.file_name().to_lowercase();
        an.cmp(&bn).then_with(|| a.path.cmp(&b.path))
    });
    Ok(entries)
}
