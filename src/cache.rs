//! Decoded-image cache + background preloader.
//!
//! Flow:
//!   1. `get_or_load(entry)` → cache hit, or synchronous decode on the
//!      calling thread (the operator waits exactly once per unseen file)
//!   2. `start_preload(entries)` → queues every uncached entry onto the
//!      worker pool; results land in the cache as workers finish
//!   3. eviction keeps resident buffers under a byte budget, LRU first,
//!      never evicting the pinned (currently displayed) entry
//!
//! Cancellation is cooperative: queued tasks carry the generation they were
//! scheduled under, and workers drop any task or result whose generation is
//! stale. In-flight decodes are never interrupted mid-read.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::catalog::ImageFileEntry;
use crate::decode::{Decode, DecodeError, PixelBuffer};

/// Worker idle poll when the preload queue is empty.
const IDLE_POLL: Duration = Duration::from_millis(25);
/// Foreground poll while a worker decodes the entry we want.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// One resident decoded buffer.
pub struct CacheEntry {
    pub buffer: Arc<PixelBuffer>,
    /// Identity the buffer was decoded from; a mismatch against the current
    /// catalog entry means the file changed on disk and this is stale.
    pub identity: ImageFileEntry,
    /// Monotonic load sequence number.
    pub seq: u64,
    pub footprint: u64,
}

/// Cache state of a path, for frame queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    Ready,
    Loading,
    Absent,
}

struct CacheInner {
    map: HashMap<PathBuf, CacheEntry>,
    /// LRU order: front = oldest, back = newest.
    order: VecDeque<PathBuf>,
    used: u64,
    /// Never evicted; follows the current selection.
    pinned: Option<PathBuf>,
    /// Paths with a decode in flight (worker or foreground).
    loading: HashSet<PathBuf>,
    over_budget: bool,
}

struct Shared {
    inner: Mutex<CacheInner>,
    /// Pending preload tasks, tagged with the generation that queued them.
    queue: Mutex<VecDeque<(u64, ImageFileEntry)>>,
    failures: Mutex<Vec<(PathBuf, DecodeError)>>,
    generation: AtomicU64,
    seq: AtomicU64,
    decoder: Box<dyn Decode>,
    budget: u64,
}

pub struct ImageCache {
    shared: Arc<Shared>,
    quit: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl ImageCache {
    pub fn new(decoder: Box<dyn Decode>, budget: u64, workers: usize) -> Self {
        let shared = Arc::new(Shared {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: VecDeque::new(),
                used: 0,
                pinned: None,
                loading: HashSet::new(),
                over_budget: false,
            }),
            queue: Mutex::new(VecDeque::new()),
            failures: Mutex::new(Vec::new()),
            generation: AtomicU64::new(0),
            seq: AtomicU64::new(0),
            decoder,
            budget,
        });
        let quit = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for worker_id in 0..workers.max(1) {
            let shared = shared.clone();
            let quit = quit.clone();
            let h = thread::Builder::new()
                .name(format!("preload-{}", worker_id))
                .spawn(move || worker_loop(shared, quit))
                .expect("spawn preload worker");
            handles.push(h);
        }

        ImageCache {
            shared,
            quit,
            handles,
        }
    }

    /// Fresh cache hit, touching the LRU. `None` on miss or stale entry.
    pub fn get(&self, entry: &ImageFileEntry) -> Option<Arc<PixelBuffer>> {
        let mut inner = self.shared.inner.lock().unwrap();
        hit_fresh(&mut inner, entry)
    }

    /// Buffer by path, freshness and LRU untouched. For header display.
    pub fn peek(&self, path: &Path) -> Option<Arc<PixelBuffer>> {
        let inner = self.shared.inner.lock().unwrap();
        inner.map.get(path).map(|e| e.buffer.clone())
    }

    pub fn probe(&self, path: &Path) -> Probe {
        let inner = self.shared.inner.lock().unwrap();
        if inner.map.contains_key(path) {
            Probe::Ready
        } else if inner.loading.contains(path) {
            Probe::Loading
        } else {
            Probe::Absent
        }
    }

    /// Return the cached buffer for `entry`, decoding synchronously on a
    /// miss. A stale entry (file changed on disk) counts as a miss. If a
    /// preload worker is already decoding this entry the call waits for that
    /// one decode instead of duplicating it.
    pub fn get_or_load(&self, entry: &ImageFileEntry) -> Result<Arc<PixelBuffer>, DecodeError> {
        loop {
            {
                let mut inner = self.shared.inner.lock().unwrap();
                if let Some(buf) = hit_fresh(&mut inner, entry) {
                    return Ok(buf);
                }
                if !inner.loading.contains(&entry.path) {
                    inner.loading.insert(entry.path.clone());
                    break;
                }
            }
            thread::sleep(WAIT_POLL);
        }

        let result = self.shared.decoder.decode(&entry.path);

        let mut inner = self.shared.inner.lock().unwrap();
        inner.loading.remove(&entry.path);
        match result {
            Ok(buffer) => {
                let buffer = Arc::new(buffer);
                insert_locked(&self.shared, &mut inner, entry, buffer.clone());
                Ok(buffer)
            }
            Err(e) => Err(e),
        }
    }

    /// Drop the entry for `path` (after a triage move its identity changes).
    pub fn invalidate(&self, path: &Path) {
        let mut inner = self.shared.inner.lock().unwrap();
        if remove_path(&mut inner, path).is_some() {
            debug!("cache: invalidated {}", path.display());
        }
        inner.over_budget = inner.used > self.shared.budget;
    }

    /// Drop everything resident. Pending preload tasks are superseded too.
    pub fn clear(&self) {
        self.cancel_preload();
        let mut inner = self.shared.inner.lock().unwrap();
        inner.map.clear();
        inner.order.clear();
        inner.used = 0;
        inner.over_budget = false;
    }

    /// Protect `path` from eviction. Pass the current selection.
    pub fn pin(&self, path: Option<&Path>) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.pinned = path.map(|p| p.to_path_buf());
    }

    /// True while resident buffers exceed the budget (a lone oversized entry
    /// is still admitted; this is the non-fatal report of that condition).
    pub fn is_over_budget(&self) -> bool {
        self.shared.inner.lock().unwrap().over_budget
    }

    /// Queue every entry not already cached fresh, in the given order,
    /// superseding any preload still pending. Returns the number queued.
    pub fn start_preload(&self, entries: &[ImageFileEntry]) -> usize {
        let gen = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut queue = self.shared.queue.lock().unwrap();
        queue.clear();
        self.shared.failures.lock().unwrap().clear();

        let inner = self.shared.inner.lock().unwrap();
        let mut queued = 0;
        for e in entries {
            let fresh = inner
                .map
                .get(&e.path)
                .map(|c| c.identity == *e)
                .unwrap_or(false);
            if !fresh {
                queue.push_back((gen, e.clone()));
                queued += 1;
            }
        }
        info!("preload: queued {} of {} entries", queued, entries.len());
        queued
    }

    /// Cooperative cancel: bump the generation and drop pending tasks.
    /// In-flight decodes run to completion and their results are discarded.
    /// Never blocks on the workers.
    pub fn cancel_preload(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        let dropped = {
            let mut queue = self.shared.queue.lock().unwrap();
            let n = queue.len();
            queue.clear();
            n
        };
        if dropped > 0 {
            info!("preload: cancelled, {} pending tasks dropped", dropped);
        }
    }

    /// Tasks still waiting for a worker.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Per-entry decode failures from the current preload batch.
    pub fn failures(&self) -> Vec<(PathBuf, DecodeError)> {
        self.shared.failures.lock().unwrap().clone()
    }

    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Release);
        for h in self.handles.drain(..) {
            h.join().ok();
        }
    }
}

impl Drop for ImageCache {
    fn drop(&mut self) {
        self.stop();
    }
}

fn hit_fresh(inner: &mut CacheInner, entry: &ImageFileEntry) -> Option<Arc<PixelBuffer>> {
    let fresh = inner
        .map
        .get(&entry.path)
        .map(|c| c.identity == *entry)
        .unwrap_or(false);
    if !fresh {
        return None;
    }
    touch(inner, &entry.path);
    inner.map.get(&entry.path).map(|c| c.buffer.clone())
}

/// Move a path to the back of the LRU (most recently used).
fn touch(inner: &mut CacheInner, path: &Path) {
    if let Some(pos) = inner.order.iter().position(|p| p == path) {
        inner.order.remove(pos);
    }
    inner.order.push_back(path.to_path_buf());
}

fn remove_path(inner: &mut CacheInner, path: &Path) -> Option<CacheEntry> {
    let entry = inner.map.remove(path)?;
    inner.used = inner.used.saturating_sub(entry.footprint);
    if let Some(pos) = inner.order.iter().position(|p| p == path) {
        inner.order.remove(pos);
    }
    Some(entry)
}

fn insert_locked(
    shared: &Shared,
    inner: &mut CacheInner,
    entry: &ImageFileEntry,
    buffer: Arc<PixelBuffer>,
) {
    let footprint = buffer.footprint();
    remove_path(inner, &entry.path);

    // Evict oldest first until the newcomer fits, skipping the pinned path.
    while inner.used + footprint > shared.budget {
        let victim = inner
            .order
            .iter()
            .find(|p| inner.pinned.as_deref() != Some(p.as_path()))
            .cloned();
        match victim {
            Some(p) => {
                remove_path(inner, &p);
                debug!("cache: evicted {}", p.display());
            }
            None => break,
        }
    }

    let seq = shared.seq.fetch_add(1, Ordering::Relaxed) + 1;
    debug!(
        "cache: insert #{} {} ({} bytes)",
        seq,
        entry.path.display(),
        footprint
    );
    inner.used += footprint;
    inner.map.insert(
        entry.path.clone(),
        CacheEntry {
            buffer,
            identity: entry.clone(),
            seq,
            footprint,
        },
    );
    inner.order.push_back(entry.path.clone());

    let over = inner.used > shared.budget;
    if over && !inner.over_budget {
        warn!(
            "cache: over budget ({} of {} bytes) after {}",
            inner.used,
            shared.budget,
            entry.path.display()
        );
    }
    inner.over_budget = over;
}

fn worker_loop(shared: Arc<Shared>, quit: Arc<AtomicBool>) {
    loop {
        if quit.load(Ordering::Relaxed) {
            break;
        }

        let task = shared.queue.lock().unwrap().pop_front();
        let Some((gen, entry)) = task else {
            thread::sleep(IDLE_POLL);
            continue;
        };

        // Superseded while queued.
        if gen != shared.generation.load(Ordering::Acquire) {
            continue;
        }

        {
            let mut inner = shared.inner.lock().unwrap();
            let fresh = inner
                .map
                .get(&entry.path)
                .map(|c| c.identity == entry)
                .unwrap_or(false);
            if fresh || inner.loading.contains(&entry.path) {
                continue;
            }
            inner.loading.insert(entry.path.clone());
        }

        let result = shared.decoder.decode(&entry.path);
        let current = gen == shared.generation.load(Ordering::Acquire);

        let failed = {
            let mut inner = shared.inner.lock().unwrap();
            inner.loading.remove(&entry.path);
            match result {
                Ok(buffer) if current => {
                    insert_locked(&shared, &mut inner, &entry, Arc::new(buffer));
                    None
                }
                Ok(_) => None, // superseded mid-decode, discard
                Err(e) => Some(e),
            }
        };

        if let Some(e) = failed {
            debug!("preload: {} failed: {}", entry.path.display(), e);
            if current {
                shared
                    .failures
                    .lock()
                    .unwrap()
                    .push((entry.path.clone(), e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::testutil::ByteDecoder;
    use std::time::Instant;

    fn entry_for(path: &Path) -> ImageFileEntry {
        let meta = std::fs::metadata(path).unwrap();
        ImageFileEntry {
            path: path.to_path_buf(),
            mtime: meta
                .modified()
                .unwrap()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_secs(),
            size: meta.len(),
        }
    }

    fn write_entry(dir: &Path, name: &str, bytes: &[u8]) -> ImageFileEntry {
        let p = dir.join(name);
        std::fs::write(&p, bytes).unwrap();
        entry_for(&p)
    }

    /// Wait until `cond` holds, failing after two seconds.
    fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn get_or_load_decodes_once() {
        let dir = tempfile::tempdir().unwrap();
        let e = write_entry(dir.path(), "a.raw", &[1, 2, 3]);

        let decoder = ByteDecoder::new();
        let decodes = decoder.decodes.clone();
        let cache = ImageCache::new(Box::new(decoder), 10_000, 1);

        let first = cache.get_or_load(&e).unwrap();
        let second = cache.get_or_load(&e).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn changed_file_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let e = write_entry(dir.path(), "a.raw", &[1, 2, 3]);

        let decoder = ByteDecoder::new();
        let decodes = decoder.decodes.clone();
        let cache = ImageCache::new(Box::new(decoder), 10_000, 1);
        cache.get_or_load(&e).unwrap();

        // Rewrite with different size: new identity, stale entry.
        let e2 = write_entry(dir.path(), "a.raw", &[9, 9, 9, 9, 9]);
        let buf = cache.get_or_load(&e2).unwrap();
        assert_eq!(buf.samples.len(), 5);
        assert_eq!(decodes.load(Ordering::SeqCst), 2);

        // Never two entries for one path.
        assert!(cache.get(&e).is_none());
        assert!(cache.get(&e2).is_some());
    }

    #[test]
    fn lru_eviction_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        // ByteDecoder footprint: 4 bytes per sample + ~61 header bytes.
        let a = write_entry(dir.path(), "a.raw", &[0; 100]);
        let b = write_entry(dir.path(), "b.raw", &[0; 100]);
        let c = write_entry(dir.path(), "c.raw", &[0; 100]);

        let cache = ImageCache::new(Box::new(ByteDecoder::new()), 1000, 1);
        cache.get_or_load(&a).unwrap();
        cache.get_or_load(&b).unwrap();
        // Touch a so b is the least recently used.
        cache.get(&a).unwrap();
        cache.get_or_load(&c).unwrap();

        assert!(cache.get(&b).is_none(), "LRU entry should be evicted");
        assert!(cache.get(&a).is_some());
        assert!(cache.get(&c).is_some());
        assert!(!cache.is_over_budget());
    }

    #[test]
    fn pinned_entry_survives_budget_pressure() {
        let dir = tempfile::tempdir().unwrap();
        let pinned = write_entry(dir.path(), "pin.raw", &[0; 100]);
        let cache = ImageCache::new(Box::new(ByteDecoder::new()), 1000, 1);
        cache.pin(Some(&pinned.path));
        cache.get_or_load(&pinned).unwrap();

        for i in 0..8 {
            let e = write_entry(dir.path(), &format!("f{}.raw", i), &[0; 100]);
            cache.get_or_load(&e).unwrap();
        }

        assert!(
            cache.get(&pinned).is_some(),
            "pinned entry must not be evicted"
        );
    }

    #[test]
    fn oversized_entry_admitted_and_reported() {
        let dir = tempfile::tempdir().unwrap();
        let big = write_entry(dir.path(), "big.raw", &[0; 500]);
        let cache = ImageCache::new(Box::new(ByteDecoder::new()), 100, 1);

        let buf = cache.get_or_load(&big).unwrap();
        assert_eq!(buf.samples.len(), 500);
        assert!(cache.get(&big).is_some(), "correctness over the hard cap");
        assert!(cache.is_over_budget());

        cache.invalidate(&big.path);
        assert!(!cache.is_over_budget());
    }

    #[test]
    fn invalidate_forces_redecode() {
        let dir = tempfile::tempdir().unwrap();
        let e = write_entry(dir.path(), "a.raw", &[1, 2]);

        let decoder = ByteDecoder::new();
        let decodes = decoder.decodes.clone();
        let cache = ImageCache::new(Box::new(decoder), 10_000, 1);
        cache.get_or_load(&e).unwrap();
        cache.invalidate(&e.path);
        assert_eq!(cache.probe(&e.path), Probe::Absent);
        cache.get_or_load(&e).unwrap();
        assert_eq!(decodes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn preload_fills_cache_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<_> = (0..6)
            .map(|i| write_entry(dir.path(), &format!("f{}.raw", i), &[i as u8; 10]))
            .collect();

        let cache = ImageCache::new(Box::new(ByteDecoder::new()), 100_000, 2);
        let queued = cache.start_preload(&entries);
        assert_eq!(queued, 6);

        wait_for(
            || entries.iter().all(|e| cache.probe(&e.path) == Probe::Ready),
            "all entries preloaded",
        );
        assert_eq!(cache.pending(), 0);
    }

    #[test]
    fn preload_failure_does_not_abort_batch() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_entry(dir.path(), "good.raw", &[1; 10]);
        let bad = write_entry(dir.path(), "bad.raw", b"BAD data");
        let also = write_entry(dir.path(), "also.raw", &[2; 10]);

        let cache = ImageCache::new(Box::new(ByteDecoder::new()), 100_000, 1);
        cache.start_preload(&[good.clone(), bad.clone(), also.clone()]);

        wait_for(
            || cache.probe(&good.path) == Probe::Ready && cache.probe(&also.path) == Probe::Ready,
            "good entries preloaded",
        );
        wait_for(|| cache.failures().len() == 1, "failure recorded");

        let failures = cache.failures();
        assert_eq!(failures[0].0, bad.path);
        assert_eq!(cache.probe(&bad.path), Probe::Absent);
    }

    #[test]
    fn preload_skips_already_cached() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<_> = (0..4)
            .map(|i| write_entry(dir.path(), &format!("f{}.raw", i), &[i as u8; 10]))
            .collect();

        let decoder = ByteDecoder::new();
        let decodes = decoder.decodes.clone();
        let cache = ImageCache::new(Box::new(decoder), 100_000, 2);

        cache.start_preload(&entries);
        wait_for(
            || entries.iter().all(|e| cache.probe(&e.path) == Probe::Ready),
            "first batch",
        );
        let after_first = decodes.load(Ordering::SeqCst);
        assert_eq!(after_first, 4);

        // Re-issue: nothing left to do, no duplicated work.
        let queued = cache.start_preload(&entries);
        assert_eq!(queued, 0);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(decodes.load(Ordering::SeqCst), after_first);
    }

    #[test]
    fn cancel_drops_pending_keeps_completed() {
        let dir = tempfile::tempdir().unwrap();
        let entries: Vec<_> = (0..10)
            .map(|i| write_entry(dir.path(), &format!("f{}.raw", i), &[i as u8; 10]))
            .collect();

        let decoder = ByteDecoder::with_delay(Duration::from_millis(30));
        let decodes = decoder.decodes.clone();
        let cache = ImageCache::new(Box::new(decoder), 100_000, 1);

        cache.start_preload(&entries);
        // Let a few complete, then cancel.
        wait_for(
            || entries.iter().any(|e| cache.probe(&e.path) == Probe::Ready),
            "some progress",
        );
        cache.cancel_preload();
        assert_eq!(cache.pending(), 0);

        // Completed entries answer immediately, no re-decode.
        let done: Vec<_> = entries
            .iter()
            .filter(|e| cache.probe(&e.path) == Probe::Ready)
            .cloned()
            .collect();
        assert!(!done.is_empty());
        // Give any in-flight decode time to finish and be discarded.
        thread::sleep(Duration::from_millis(80));
        let count_before = decodes.load(Ordering::SeqCst);
        cache.get_or_load(&done[0]).unwrap();
        assert_eq!(decodes.load(Ordering::SeqCst), count_before);

        // An uncompleted entry decodes synchronously on demand.
        if let Some(pending) = entries.iter().find(|e| cache.probe(&e.path) == Probe::Absent) {
            cache.get_or_load(pending).unwrap();
            assert_eq!(cache.probe(&pending.path), Probe::Ready);
        }
    }

    #[test]
    fn foreground_waits_for_inflight_worker_decode() {
        let dir = tempfile::tempdir().unwrap();
        let e = write_entry(dir.path(), "slow.raw", &[5; 10]);

        let decoder = ByteDecoder::with_delay(Duration::from_millis(80));
        let decodes = decoder.decodes.clone();
        let cache = ImageCache::new(Box::new(decoder), 100_000, 1);

        cache.start_preload(std::slice::from_ref(&e));
        wait_for(|| cache.probe(&e.path) != Probe::Absent, "worker picked up");

        // Lands while the worker still decodes; must not decode twice.
        let buf = cache.get_or_load(&e).unwrap();
        assert_eq!(buf.samples.len(), 10);
        assert_eq!(decodes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn clear_empties_everything() {
        let dir = tempfile::tempdir().unwrap();
        let e = write_entry(dir.path(), "a.raw", &[1; 10]);
        let cache = ImageCache::new(Box::new(ByteDecoder::new()), 100_000, 1);
        cache.get_or_load(&e).unwrap();
        cache.clear();
        assert_eq!(cache.probe(&e.path), Probe::Absent);
        assert!(!cache.is_over_budget());
    }
}
