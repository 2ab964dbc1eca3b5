//! Reversible triage: main directory ↔ PRETRASH subdirectory.
//!
//! One command, both directions: `toggle` reads the file's current location
//! from its parent directory and moves it to the other side, so pressing the
//! same key again undoes the move. Nothing here ever deletes a file; the
//! "trash" is only ever a second directory, created lazily under the main
//! one.

use std::path::{Path, PathBuf};

use log::info;
use thiserror::Error;

use crate::catalog::is_image_ext;

pub const PRETRASH_DIR: &str = "PRETRASH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    InMain,
    InPreTrash,
}

#[derive(Debug, Clone, Error)]
pub enum TriageError {
    #[error("'{name}' already exists in {target}")]
    RelocationConflict { name: String, target: PathBuf },
    #[error("'{path}' is outside the triage directories")]
    Foreign { path: PathBuf },
    #[error("cannot move '{path}': {reason}")]
    Io { path: PathBuf, reason: String },
}

/// Per-directory triage record. Reset whenever the open directory changes.
pub struct TriageState {
    main_dir: PathBuf,
    pretrash_dir: PathBuf,
    /// Destination of the most recent successful toggle.
    last_moved: Option<PathBuf>,
}

impl TriageState {
    pub fn new(main_dir: &Path) -> Self {
        TriageState {
            main_dir: main_dir.to_path_buf(),
            pretrash_dir: main_dir.join(PRETRASH_DIR),
            last_moved: None,
        }
    }

    pub fn main_dir(&self) -> &Path {
        &self.main_dir
    }

    pub fn pretrash_dir(&self) -> &Path {
        &self.pretrash_dir
    }

    pub fn last_moved(&self) -> Option<&Path> {
        self.last_moved.as_deref()
    }

    /// Which side of the protocol a path is on, read from its parent. No
    /// hidden flags.
    pub fn locate(&self, path: &Path) -> Result<Location, TriageError> {
        match path.parent() {
            Some(p) if p == self.main_dir => Ok(Location::InMain),
            Some(p) if p == self.pretrash_dir => Ok(Location::InPreTrash),
            _ => Err(TriageError::Foreign {
                path: path.to_path_buf(),
            }),
        }
    }

    /// Relocate `path` to the other side, preserving its filename. Returns
    /// the new path. On a name collision at the target nothing moves and
    /// `RelocationConflict` is reported.
    pub fn toggle(&mut self, path: &Path) -> Result<PathBuf, TriageError> {
        let location = self.locate(path)?;
        let target_dir = match location {
            Location::InMain => {
                if !self.pretrash_dir.is_dir() {
                    std::fs::create_dir_all(&self.pretrash_dir).map_err(|e| TriageError::Io {
                        path: self.pretrash_dir.clone(),
                        reason: e.to_string(),
                    })?;
                }
                &self.pretrash_dir
            }
            Location::InPreTrash => &self.main_dir,
        };

        let name = path.file_name().ok_or_else(|| TriageError::Foreign {
            path: path.to_path_buf(),
        })?;
        let target = target_dir.join(name);
        if target.exists() {
            return Err(TriageError::RelocationConflict {
                name: name.to_string_lossy().to_string(),
                target: target_dir.to_path_buf(),
            });
        }

        std::fs::rename(path, &target).map_err(|e| TriageError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        info!(
            "triage: {} -> {}",
            path.display(),
            match location {
                Location::InMain => PRETRASH_DIR,
                Location::InPreTrash => "main",
            }
        );
        self.last_moved = Some(target.clone());
        Ok(target)
    }

    /// Image files currently in PRETRASH, sorted by filename. Empty when the
    /// subdirectory was never created.
    pub fn pretrash_entries(&self) -> Vec<PathBuf> {
        let Ok(read) = std::fs::read_dir(&self.pretrash_dir) else {
            return Vec::new();
        };
        let mut files: Vec<PathBuf> = read
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.extension()
                        .and_then(|e| e.to_str())
                        .map(is_image_ext)
                        .unwrap_or(false)
            })
            .collect();
        files.sort_by_key(|p| {
            p.file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_lowercase()
        });
        files
    }
}
