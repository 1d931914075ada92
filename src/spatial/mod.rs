//! Mutable spatial index over cached geometry envelopes.
//!
//! A uniform-grid partition: each entry's envelope is registered in every
//! grid cell it overlaps, and a range query gathers candidates from the
//! cells covered by the query envelope before an exact envelope test.
//! Envelope comparison is exact — no false positives, no false negatives —
//! even though the underlying geometry is never re-tested.
//!
//! Envelopes that would occupy more than [`MAX_GRID_CELLS`] cells are kept
//! in a side set instead of the grid, so mutation cost stays bounded by
//! the cap regardless of envelope extent; every search also tests the side
//! set. A query envelope over the cap skips the grid walk and tests all
//! entries directly.
//!
//! # Thread safety
//!
//! - Entry map and grid buckets behind one `Mutex`, taken briefly per
//!   operation (and per entry during bulk load, never for the whole scan)
//! - The loading flag and cancel slot behind their own narrower `Mutex`, so
//!   `is_loading()` / `cancel_loading()` stay responsive mid-load

use crate::feature::Fid;
use crate::geometry::Envelope;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Grid cell edge length in coordinate units.
const DEFAULT_CELL_SIZE: f64 = 1.0;

/// Most grid cells a single envelope may be registered in.
///
/// An envelope over this limit goes to the oversize side set, keeping
/// per-mutation work bounded however large the coordinates are.
pub const MAX_GRID_CELLS: u128 = 4096;

type Cell = (i64, i64);

struct IndexEntries {
    by_fid: HashMap<Fid, Envelope>,
    grid: HashMap<Cell, Vec<Fid>>,
    /// Entries too large for the grid; scanned exhaustively on search.
    oversized: HashSet<Fid>,
}

struct LoadState {
    loading: bool,
    cancel: Option<CancellationToken>,
}

/// Outcome of a bulk load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkLoad {
    /// Every entry was inserted.
    Completed,
    /// Cancellation was observed mid-scan; the index holds a partial set
    /// of entries and the caller must bulk load again to complete.
    Canceled,
    /// Another bulk load was already in progress; nothing was done.
    AlreadyLoading,
}

/// Cursor over feature identifiers matching a range query.
///
/// Finite and restartable: the id set is fixed at query time, and a new
/// `search` call always re-queries current index state.
#[derive(Debug, Clone)]
pub struct SpatialCursor {
    ids: Vec<Fid>,
    pos: usize,
}

impl SpatialCursor {
    fn new(ids: Vec<Fid>) -> Self {
        Self { ids, pos: 0 }
    }

    /// Empty cursor.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Number of matches, independent of cursor position.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Rewind to the first match.
    pub fn reset(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for SpatialCursor {
    type Item = Fid;

    fn next(&mut self) -> Option<Fid> {
        let id = self.ids.get(self.pos).copied();
        if id.is_some() {
            self.pos += 1;
        }
        id
    }
}

/// Grid-partitioned spatial index over (envelope, FID) entries.
pub struct SpatialIndex {
    entries: Mutex<IndexEntries>,
    load_state: Mutex<LoadState>,
    cell_size: f64,
}

impl SpatialIndex {
    pub fn new() -> Self {
        Self::with_cell_size(DEFAULT_CELL_SIZE)
    }

    /// Create an index with an explicit grid cell size.
    ///
    /// Cell size should be on the order of a typical feature envelope;
    /// too small a cell makes large envelopes expensive to register.
    pub fn with_cell_size(cell_size: f64) -> Self {
        assert!(cell_size > 0.0, "cell size must be positive");
        Self {
            entries: Mutex::new(IndexEntries {
                by_fid: HashMap::new(),
                grid: HashMap::new(),
                oversized: HashSet::new(),
            }),
            load_state: Mutex::new(LoadState {
                loading: false,
                cancel: None,
            }),
            cell_size,
        }
    }

    fn cell_bounds(&self, env: &Envelope) -> (i64, i64, i64, i64) {
        (
            (env.min_x / self.cell_size).floor() as i64,
            (env.max_x / self.cell_size).floor() as i64,
            (env.min_y / self.cell_size).floor() as i64,
            (env.max_y / self.cell_size).floor() as i64,
        )
    }

    /// Number of grid cells the envelope would occupy, without iterating
    /// them. Wide enough arithmetic for any finite coordinates.
    fn cell_count(&self, env: &Envelope) -> u128 {
        let (min_cx, max_cx, min_cy, max_cy) = self.cell_bounds(env);
        let width = (max_cx as i128 - min_cx as i128 + 1) as u128;
        let height = (max_cy as i128 - min_cy as i128 + 1) as u128;
        width.saturating_mul(height)
    }

    fn cells(&self, env: &Envelope) -> impl Iterator<Item = Cell> {
        let (min_cx, max_cx, min_cy, max_cy) = self.cell_bounds(env);
        (min_cx..=max_cx).flat_map(move |cx| (min_cy..=max_cy).map(move |cy| (cx, cy)))
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, IndexEntries> {
        self.entries.lock().expect("spatial index lock poisoned")
    }

    fn lock_load(&self) -> std::sync::MutexGuard<'_, LoadState> {
        self.load_state.lock().expect("load state lock poisoned")
    }

    /// Bulk load the index from (FID, envelope) pairs.
    ///
    /// This is a *reload*: existing contents are replaced, so invoking it on
    /// an already-loaded index rebuilds it from the given entries. The scan
    /// observes `cancel` once per entry; on cancellation the index keeps the
    /// entries inserted so far and `loading` is cleared.
    ///
    /// Returns [`BulkLoad::AlreadyLoading`] without touching the index when
    /// another bulk load is in progress.
    pub fn bulk_load(
        &self,
        entries: impl IntoIterator<Item = (Fid, Envelope)>,
        cancel: &CancellationToken,
    ) -> BulkLoad {
        let load_cancel = {
            let mut state = self.lock_load();
            if state.loading {
                return BulkLoad::AlreadyLoading;
            }
            state.loading = true;
            let token = cancel.child_token();
            state.cancel = Some(token.clone());
            token
        };

        self.clear();

        let mut loaded = 0usize;
        let mut outcome = BulkLoad::Completed;
        for (fid, env) in entries {
            if load_cancel.is_cancelled() {
                debug!(loaded, "spatial index bulk load canceled");
                outcome = BulkLoad::Canceled;
                break;
            }
            // Lock per entry, not for the whole scan.
            self.insert(&env, fid);
            loaded += 1;
        }

        let mut state = self.lock_load();
        state.loading = false;
        state.cancel = None;

        if outcome == BulkLoad::Completed {
            debug!(loaded, "spatial index bulk load complete");
        }
        outcome
    }

    /// Whether a bulk load is currently running.
    pub fn is_loading(&self) -> bool {
        self.lock_load().loading
    }

    /// Request cancellation of a running bulk load.
    ///
    /// Cooperative: the load loop observes the request on its next entry
    /// and exits early, leaving the index partially loaded.
    pub fn cancel_loading(&self) {
        let state = self.lock_load();
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
    }

    /// Insert an entry. Replaces any existing entry for the same FID.
    pub fn insert(&self, env: &Envelope, fid: Fid) {
        let mut entries = self.lock_entries();
        self.unlink(&mut entries, fid);
        entries.by_fid.insert(fid, *env);
        if self.cell_count(env) > MAX_GRID_CELLS {
            entries.oversized.insert(fid);
        } else {
            for cell in self.cells(env) {
                entries.grid.entry(cell).or_default().push(fid);
            }
        }
    }

    fn unlink(&self, entries: &mut IndexEntries, fid: Fid) {
        if let Some(old) = entries.by_fid.remove(&fid) {
            if !entries.oversized.remove(&fid) {
                remove_from_grid(&mut entries.grid, self.cells(&old), fid);
            }
        }
    }

    /// Update an entry's envelope: strict remove-then-insert.
    ///
    /// Applied even when the new envelope equals the stored one; the cost
    /// is the same as one insert and keeps the semantics obvious.
    pub fn change(&self, env: &Envelope, fid: Fid) {
        self.remove(fid);
        self.insert(env, fid);
    }

    /// Remove an entry. No-op when the FID is not indexed.
    pub fn remove(&self, fid: Fid) {
        let mut entries = self.lock_entries();
        self.unlink(&mut entries, fid);
    }

    /// Range query: all FIDs whose stored envelope intersects `env`.
    ///
    /// Results are sorted by FID for deterministic iteration.
    pub fn search(&self, env: &Envelope) -> SpatialCursor {
        let entries = self.lock_entries();
        let mut ids = Vec::new();
        if self.cell_count(env) > MAX_GRID_CELLS {
            // Walking the query's cells would cost more than testing
            // every entry directly.
            for (&fid, stored) in &entries.by_fid {
                if stored.intersects(env) {
                    ids.push(fid);
                }
            }
        } else {
            let mut seen = HashSet::new();
            for cell in self.cells(env) {
                let Some(bucket) = entries.grid.get(&cell) else {
                    continue;
                };
                for &fid in bucket {
                    if !seen.insert(fid) {
                        continue;
                    }
                    if let Some(stored) = entries.by_fid.get(&fid) {
                        if stored.intersects(env) {
                            ids.push(fid);
                        }
                    }
                }
            }
            for &fid in &entries.oversized {
                if let Some(stored) = entries.by_fid.get(&fid) {
                    if stored.intersects(env) {
                        ids.push(fid);
                    }
                }
            }
        }
        ids.sort_unstable();
        SpatialCursor::new(ids)
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.lock_entries().by_fid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_entries().by_fid.is_empty()
    }

    /// Whether an entry exists for the FID.
    pub fn contains(&self, fid: Fid) -> bool {
        self.lock_entries().by_fid.contains_key(&fid)
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut entries = self.lock_entries();
        entries.by_fid.clear();
        entries.grid.clear();
        entries.oversized.clear();
    }
}

impl Default for SpatialIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_from_grid(
    grid: &mut HashMap<Cell, Vec<Fid>>,
    cells: impl Iterator<Item = Cell>,
    fid: Fid,
) {
    for cell in cells {
        if let Some(bucket) = grid.get_mut(&cell) {
            bucket.retain(|&f| f != fid);
            if bucket.is_empty() {
                grid.remove(&cell);
            }
        }
    }
}
