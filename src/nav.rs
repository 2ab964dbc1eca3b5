//! Navigation controller: the command surface over catalog, cache, stretch
//! and triage.
//!
//! Holds all per-directory state explicitly (no ambient globals): the
//! catalog with its selection, the triage record, the preset bank and a memo
//! of the last rendered frame. Command handlers get a `&mut` to one instance.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use serde_json::Value;
use thiserror::Error;

use crate::cache::{ImageCache, Probe};
use crate::catalog::{CatalogError, FileCatalog, ImageFileEntry};
use crate::decode::{DecodeError, PixelBuffer};
use crate::stretch::{self, Frame, PresetBank, StretchParam, StretchPreset};
use crate::triage::{TriageError, TriageState};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Triage(#[from] TriageError),
    #[error("'{path}' is not cached and not loading")]
    EmptyCacheLookup { path: PathBuf },
    #[error("no file is selected")]
    NoSelection,
    #[error("no preset slot {key}")]
    UnknownPreset { key: usize },
    #[error("no PRETRASH entry at index {index}")]
    BadPretrashIndex { index: usize },
}

/// One navigation request: a relative step or an absolute jump. Both clamp
/// to the catalog bounds.
#[derive(Debug, Clone, Copy)]
pub enum NavStep {
    Delta(i64),
    Absolute(usize),
}

/// What the display layer gets for the current selection.
pub enum FrameState {
    Ready(Arc<Frame>),
    /// A preload worker is decoding this entry right now.
    Pending,
    /// Decode failed; the operator picks another file manually.
    Failed(String),
    /// Empty catalog, nothing to show.
    Empty,
}

struct RenderMemo {
    path: PathBuf,
    preset: StretchPreset,
    frame: Arc<Frame>,
}

pub struct NavigationController {
    catalog: FileCatalog,
    cache: ImageCache,
    presets: PresetBank,
    triage: TriageState,
    /// Last rendered frame, keyed by (path, preset). Re-displaying without a
    /// parameter change skips the transform.
    memo: Option<RenderMemo>,
    /// Last decode failure, surfaced through `current_frame`.
    last_error: Option<(PathBuf, String)>,
}

impl NavigationController {
    /// Open the initial directory. Failure to read it is the one fatal path.
    pub fn open(dir: &Path, cache: ImageCache) -> Result<Self, CatalogError> {
        let catalog = FileCatalog::open(dir)?;
        let triage = TriageState::new(catalog.dir());
        info!("nav: opened {} ({} files)", dir.display(), catalog.len());
        let mut nav = NavigationController {
            catalog,
            cache,
            presets: PresetBank::new(),
            triage,
            memo: None,
            last_error: None,
        };
        let _ = nav.load_current();
        Ok(nav)
    }

    /// Switch to another directory. On failure the current one stays open.
    pub fn open_directory(&mut self, dir: &Path) -> Result<usize, CommandError> {
        let catalog = FileCatalog::open(dir)?;
        info!("nav: opened {} ({} files)", dir.display(), catalog.len());
        self.triage = TriageState::new(catalog.dir());
        self.catalog = catalog;
        self.cache.clear();
        self.memo = None;
        self.last_error = None;
        let _ = self.load_current();
        Ok(self.catalog.len())
    }

    pub fn entries(&self) -> &[ImageFileEntry] {
        self.catalog.entries()
    }

    pub fn len(&self) -> usize {
        self.catalog.len()
    }

    pub fn is_empty(&self) -> bool {
        self.catalog.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.catalog.current_index()
    }

    pub fn current_entry(&self) -> Option<&ImageFileEntry> {
        self.catalog.current_entry()
    }

    /// Move the selection and load its buffer, suspending for the decode on
    /// a miss. Starting navigation supersedes any bulk preload in flight
    /// (without waiting on it). A decode failure is returned but the
    /// selection still moves, so the operator can step past a broken file.
    pub fn navigate(&mut self, step: NavStep) -> Result<usize, CommandError> {
        self.cache.cancel_preload();
        if self.catalog.is_empty() {
            return Err(CatalogError::EmptyCatalog.into());
        }
        let target = match step {
            NavStep::Absolute(i) => i,
            NavStep::Delta(d) => {
                let cur = self.catalog.current_index().unwrap_or(0) as i64;
                (cur + d).clamp(0, self.catalog.len() as i64 - 1) as usize
            }
        };
        let index = self.catalog.set_current(target)?;
        self.load_current()?;
        Ok(index)
    }

    /// Copy preset slot `key` (0–9) into the active slot. O(1), touches
    /// neither cache nor filesystem.
    pub fn select_preset(&mut self, key: usize) -> Result<StretchPreset, CommandError> {
        if !self.presets.select(key) {
            return Err(CommandError::UnknownPreset { key });
        }
        Ok(self.presets.active())
    }

    pub fn adjust_custom(&mut self, param: StretchParam, delta: f32) -> StretchPreset {
        self.presets.adjust(param, delta)
    }

    pub fn active_preset(&self) -> StretchPreset {
        self.presets.active()
    }

    /// Displayable frame for the current selection. Renders through the
    /// memo; decodes synchronously when the entry is neither cached nor
    /// being preloaded.
    pub fn current_frame(&mut self) -> FrameState {
        let Some(entry) = self.catalog.current_entry().cloned() else {
            return FrameState::Empty;
        };
        if let Some(buffer) = self.cache.get(&entry) {
            return FrameState::Ready(self.render(&entry.path, &buffer));
        }
        match self.cache.probe(&entry.path) {
            Probe::Loading => FrameState::Pending,
            _ => {
                if let Some((p, msg)) = &self.last_error {
                    if *p == entry.path {
                        return FrameState::Failed(msg.clone());
                    }
                }
                match self.cache.get_or_load(&entry) {
                    Ok(buffer) => FrameState::Ready(self.render(&entry.path, &buffer)),
                    Err(e) => {
                        self.last_error = Some((entry.path.clone(), e.to_string()));
                        FrameState::Failed(e.to_string())
                    }
                }
            }
        }
    }

    /// Header map of the current selection, without forcing a decode.
    pub fn current_header(&self) -> Result<HashMap<String, Value>, CommandError> {
        let entry = self.catalog.current_entry().ok_or(CommandError::NoSelection)?;
        match self.cache.peek(&entry.path) {
            Some(buffer) => Ok(buffer.header.clone()),
            None => Err(CommandError::EmptyCacheLookup {
                path: entry.path.clone(),
            }),
        }
    }

    /// Relocate the current file to the other side of the triage protocol
    /// (main ↔ PRETRASH), invalidate its cache entry, and refresh the
    /// catalog. The selection lands on the next remaining entry at the same
    /// index. The relocation and invalidation complete before this returns.
    pub fn toggle_triage(&mut self) -> Result<PathBuf, CommandError> {
        let entry = self
            .catalog
            .current_entry()
            .cloned()
            .ok_or(CommandError::NoSelection)?;
        let new_path = self.triage.toggle(&entry.path)?;
        self.cache.invalidate(&entry.path);
        if self.memo.as_ref().map(|m| m.path == entry.path).unwrap_or(false) {
            self.memo = None;
        }
        self.catalog.refresh()?;
        if self.load_current().is_err() {
            warn!("nav: next file after triage failed to decode");
        }
        Ok(new_path)
    }

    /// Files currently in PRETRASH, for the reverse toggle.
    pub fn pretrash(&self) -> Vec<PathBuf> {
        self.triage.pretrash_entries()
    }

    /// Toggle a PRETRASH file back into the main directory and select it.
    pub fn restore(&mut self, index: usize) -> Result<PathBuf, CommandError> {
        let listing = self.triage.pretrash_entries();
        let path = listing
            .get(index)
            .ok_or(CommandError::BadPretrashIndex { index })?;
        let new_path = self.triage.toggle(path)?;
        self.cache.invalidate(path);
        self.catalog.refresh()?;
        if let Some(i) = self.catalog.position_of(&new_path) {
            self.catalog.set_current(i)?;
        }
        if self.load_current().is_err() {
            warn!("nav: restored file failed to decode");
        }
        Ok(new_path)
    }

    /// Queue every uncached catalog entry for background decode, in catalog
    /// order. Returns how many were queued.
    pub fn start_bulk_preload(&self) -> usize {
        self.cache.start_preload(self.catalog.entries())
    }

    pub fn cancel_bulk_preload(&self) {
        self.cache.cancel_preload();
    }

    pub fn preload_pending(&self) -> usize {
        self.cache.pending()
    }

    pub fn preload_failures(&self) -> Vec<(PathBuf, DecodeError)> {
        self.cache.failures()
    }

    pub fn cache_over_budget(&self) -> bool {
        self.cache.is_over_budget()
    }

    /// Pin and load the current selection; records the failure for
    /// `current_frame` before returning it.
    fn load_current(&mut self) -> Result<(), CommandError> {
        let Some(entry) = self.catalog.current_entry().cloned() else {
            self.cache.pin(None);
            return Ok(());
        };
        self.cache.pin(Some(&entry.path));
        match self.cache.get_or_load(&entry) {
            Ok(_) => {
                self.last_error = None;
                Ok(())
            }
            Err(e) => {
                warn!("nav: decode failed for {}: {}", entry.path.display(), e);
                self.last_error = Some((entry.path.clone(), e.to_string()));
                Err(e.into())
            }
        }
    }

    fn render(&mut self, path: &Path, buffer: &PixelBuffer) -> Arc<Frame> {
        let preset = self.presets.active();
        if let Some(m) = &self.memo {
            if m.path == path && m.preset == preset {
                return m.frame.clone();
            }
        }
        let frame = Arc::new(stretch::apply(buffer, &preset));
        self.memo = Some(RenderMemo {
            path: path.to_path_buf(),
            preset,
            frame: frame.clone(),
        });
        frame
    }
}
