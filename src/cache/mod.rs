//! In-memory feature cache over a geometry store.
//!
//! [`FeatureCache`] wraps a plain [`GeometryStore`] handle (composition, not
//! subclassing) and materializes its feature collection into an indexed
//! mapping via one full `cache()` scan. Reads are served from the mapping
//! when cached and stream from the store otherwise; writes go through to
//! the store first and only update the cache on success. The cache owns a
//! [`SpatialIndex`] kept consistent with every geometry-bearing mutation.
//!
//! # Locking
//!
//! Mapping, aggregate envelope, count, and lifecycle flags live behind one
//! mutex per cache instance. The scan loop takes that lock briefly per
//! feature, never for the whole scan, so `get_feature_by_id` and friends
//! stay responsive while caching runs on another thread.
//!
//! # Known race
//!
//! Writes update the store, then the mapping, then the index, in that
//! order. A single-threaded caller observing updated mapping contents is
//! guaranteed the index reflects them; while a background `bulk_load` is
//! running, index queries may reflect neither the pre- nor post-mutation
//! state until the load finishes.

use crate::feature::{Encoding, FeatureRecord, Fid};
use crate::geometry::Envelope;
use crate::spatial::{SpatialCursor, SpatialIndex};
use crate::store::{GeometryStore, StoreError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Cache-level operation failures.
///
/// Carries the operation name and the dataset path alongside the store
/// failure, so the UI layer can format its report without guessing.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Operation attempted after `close()`
    #[error("feature cache '{0}' is closed")]
    Closed(String),

    /// A store-level call failed; the cache was left untouched
    #[error("{op} failed on '{path}': {source}")]
    Store {
        op: &'static str,
        path: String,
        #[source]
        source: StoreError,
    },
}

/// Outcome of a `cache()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Full scan completed; the cache is now materialized.
    Completed,
    /// The cache was already materialized; no store I/O was performed.
    AlreadyCached,
    /// Another scan is running on a different thread; nothing was done.
    InProgress,
    /// Cancellation was observed mid-scan. The partial mapping is retained
    /// but `cached` stays false; call `cache()` again to complete.
    Canceled,
}

/// Spatial filter for `search`: either pass-everything or an envelope test.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpatialFilter {
    envelope: Option<Envelope>,
}

impl SpatialFilter {
    /// Filter that matches every feature.
    pub fn all() -> Self {
        Self { envelope: None }
    }

    /// Filter that matches features whose envelope intersects `env`.
    ///
    /// Features without geometry never match an envelope filter.
    pub fn envelope(env: Envelope) -> Self {
        Self {
            envelope: Some(env),
        }
    }

    fn matches(&self, record: &FeatureRecord) -> bool {
        match &self.envelope {
            None => true,
            Some(q) => record.envelope().is_some_and(|e| e.intersects(q)),
        }
    }
}

/// Cursor over feature records produced by `search`.
#[derive(Debug, Clone)]
pub struct FeatureCursor {
    records: Vec<FeatureRecord>,
    pos: usize,
}

impl FeatureCursor {
    fn new(records: Vec<FeatureRecord>) -> Self {
        Self { records, pos: 0 }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Rewind to the first record.
    pub fn reset(&mut self) {
        self.pos = 0;
    }
}

impl Iterator for FeatureCursor {
    type Item = FeatureRecord;

    fn next(&mut self) -> Option<FeatureRecord> {
        let record = self.records.get(self.pos).cloned();
        if record.is_some() {
            self.pos += 1;
        }
        record
    }
}

struct CacheState {
    features: BTreeMap<Fid, FeatureRecord>,
    envelope: Option<Envelope>,
    /// `None` is the "unknown" sentinel before the first full scan.
    count: Option<u64>,
    cached: bool,
    caching: bool,
    closed: bool,
    cursor: Vec<Fid>,
    cursor_pos: usize,
    /// Next synthetic FID for uncached streaming reads.
    stream_fid: Fid,
}

/// Cached feature store: mapping, aggregate envelope, and spatial index
/// over one [`GeometryStore`].
pub struct FeatureCache {
    path: String,
    store: Arc<dyn GeometryStore>,
    index: SpatialIndex,
    state: Mutex<CacheState>,
}

impl FeatureCache {
    /// Create an empty cache over a store handle.
    ///
    /// `path` names the dataset in log lines and error reports.
    pub fn new(path: impl Into<String>, store: Arc<dyn GeometryStore>) -> Self {
        Self {
            path: path.into(),
            store,
            index: SpatialIndex::new(),
            state: Mutex::new(CacheState {
                features: BTreeMap::new(),
                envelope: None,
                count: None,
                cached: false,
                caching: false,
                closed: false,
                cursor: Vec::new(),
                cursor_pos: 0,
                stream_fid: 0,
            }),
        }
    }

    /// Dataset path used in error reports.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The spatial index owned by this cache.
    pub fn index(&self) -> &SpatialIndex {
        &self.index
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().expect("feature cache lock poisoned")
    }

    fn store_err(&self, op: &'static str, source: StoreError) -> CacheError {
        CacheError::Store {
            op,
            path: self.path.clone(),
            source,
        }
    }

    fn closed_err(&self) -> CacheError {
        CacheError::Closed(self.path.clone())
    }

    /// Open the underlying store. Idempotent.
    pub fn open(&self, update: bool, shared: bool) -> Result<(), CacheError> {
        if self.lock().closed {
            return Err(self.closed_err());
        }
        self.store
            .open(update, shared)
            .map_err(|e| self.store_err("open", e))
    }

    pub fn is_opened(&self) -> bool {
        self.store.is_opened()
    }

    /// Whether the mapping is fully materialized.
    pub fn is_cached(&self) -> bool {
        let state = self.lock();
        state.cached && !self.index.is_loading()
    }

    /// Whether a scan or index load is currently running.
    pub fn is_caching(&self) -> bool {
        self.lock().caching || self.index.is_loading()
    }

    /// Request cancellation of a running index bulk load.
    pub fn stop_caching(&self) {
        if self.index.is_loading() {
            self.index.cancel_loading();
        }
    }

    /// Materialize the store's feature collection into the cache.
    ///
    /// Idempotent: returns immediately when already cached. Otherwise runs
    /// one full forward scan, assigning sequential FIDs from 1 in encounter
    /// order when the store lacks stable identifiers, merging every
    /// geometry's envelope into the aggregate, and observing `cancel` once
    /// per feature. On success the aggregate envelope is widened on any
    /// degenerate axis, the count is finalized, and the spatial index is
    /// bulk loaded. On cancellation the partial mapping is retained,
    /// `cached` stays false, and the index is not loaded.
    pub fn cache(&self, cancel: &CancellationToken) -> Result<CacheOutcome, CacheError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(self.closed_err());
            }
            if state.cached {
                return Ok(CacheOutcome::AlreadyCached);
            }
            if state.caching {
                return Ok(CacheOutcome::InProgress);
            }
            state.caching = true;
            state.features.clear();
            state.envelope = None;
            state.count = None;
        }

        let caps = self.store.capabilities();
        self.store.reset_reading();

        let mut synthetic_fid: Fid = 0;
        let mut scanned = 0u64;
        loop {
            if cancel.is_cancelled() {
                self.lock().caching = false;
                debug!(path = %self.path, scanned, "feature cache scan canceled");
                return Ok(CacheOutcome::Canceled);
            }
            let mut record = match self.store.next_feature() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    self.lock().caching = false;
                    return Err(self.store_err("cache scan", e));
                }
            };
            if !caps.stable_fids || record.fid() < 0 {
                synthetic_fid += 1;
                record.set_fid(synthetic_fid);
            }
            scanned += 1;

            let env = record.envelope();
            // Brief lock per feature, not for the whole scan.
            let mut state = self.lock();
            if let Some(env) = &env {
                match state.envelope.as_mut() {
                    Some(total) => total.merge(env),
                    None => state.envelope = Some(*env),
                }
            }
            state.features.insert(record.fid(), record);
        }

        let entries: Vec<(Fid, Envelope)> = {
            let mut state = self.lock();
            if let Some(env) = state.envelope.as_mut() {
                env.expand_degenerate();
            }
            state.count = Some(state.features.len() as u64);
            state.cached = true;
            state.caching = false;
            state.cursor = state.features.keys().copied().collect();
            state.cursor_pos = 0;
            state
                .features
                .iter()
                .filter_map(|(fid, r)| r.envelope().map(|e| (*fid, e)))
                .collect()
        };

        info!(path = %self.path, count = scanned, "feature cache populated");
        self.index.bulk_load(entries, cancel);
        Ok(CacheOutcome::Completed)
    }

    /// Restart sequential reading.
    pub fn reset(&self) {
        let cached = {
            let mut state = self.lock();
            if state.cached {
                state.cursor_pos = 0;
            } else {
                state.stream_fid = 0;
            }
            state.cached
        };
        if !cached {
            self.store.reset_reading();
        }
    }

    /// Next feature in sequential order, or `None` at the end.
    ///
    /// Streams from the store when not cached, with the same synthetic FID
    /// fallback as `cache()`.
    pub fn next(&self) -> Result<Option<FeatureRecord>, CacheError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(self.closed_err());
            }
            if state.cached {
                let record = state
                    .cursor
                    .get(state.cursor_pos)
                    .and_then(|fid| state.features.get(fid))
                    .cloned();
                if record.is_some() {
                    state.cursor_pos += 1;
                }
                return Ok(record);
            }
        }

        let record = self
            .store
            .next_feature()
            .map_err(|e| self.store_err("read", e))?;
        Ok(record.map(|mut r| {
            if !self.store.capabilities().stable_fids || r.fid() < 0 {
                let mut state = self.lock();
                state.stream_fid += 1;
                r.set_fid(state.stream_fid);
            }
            r
        }))
    }

    /// Random access by position in FID order.
    pub fn get_feature(&self, index: usize) -> Result<Option<FeatureRecord>, CacheError> {
        let cached = {
            let state = self.lock();
            if state.closed {
                return Err(self.closed_err());
            }
            state.cached
        };
        if cached {
            let mut state = self.lock();
            let record = state
                .cursor
                .get(index)
                .and_then(|fid| state.features.get(fid))
                .cloned();
            if record.is_some() {
                state.cursor_pos = index + 1;
            }
            return Ok(record);
        }
        // Uncached fallback: the store's own cursor semantics.
        self.reset();
        for _ in 0..index {
            if self.next()?.is_none() {
                return Ok(None);
            }
        }
        self.next()
    }

    /// Lookup by identifier.
    ///
    /// A cached store missing the id attempts one on-demand store lookup
    /// and caches the result if found. Returns the not-found sentinel when
    /// the store also lacks it — never an error.
    pub fn get_feature_by_id(&self, fid: Fid) -> FeatureRecord {
        {
            let state = self.lock();
            if state.closed {
                return FeatureRecord::not_found();
            }
            if let Some(record) = state.features.get(&fid) {
                return record.clone();
            }
        }
        match self.store.get_feature(fid) {
            Ok(Some(record)) => {
                self.lock().features.insert(fid, record.clone());
                record
            }
            Ok(None) => FeatureRecord::not_found(),
            Err(e) => {
                debug!(path = %self.path, fid, error = %e, "on-demand feature lookup failed");
                FeatureRecord::not_found()
            }
        }
    }

    /// Create a feature: store first, then mapping, envelope, and index.
    ///
    /// Returns the FID the store assigned. On store failure the cache is
    /// left untouched.
    pub fn store_feature(&self, record: &FeatureRecord) -> Result<Fid, CacheError> {
        if self.lock().closed {
            return Err(self.closed_err());
        }
        let fid = self
            .store
            .create_feature(record)
            .map_err(|e| self.store_err("create feature", e))?;

        let mut stored = record.clone();
        stored.set_fid(fid);
        let env = stored.envelope();
        {
            let mut state = self.lock();
            if let Some(env) = &env {
                match state.envelope.as_mut() {
                    Some(total) => total.merge(env),
                    None => state.envelope = Some(*env),
                }
            }
            state.features.insert(fid, stored);
            if let Some(count) = state.count.as_mut() {
                *count += 1;
            }
            state.cursor = state.features.keys().copied().collect();
        }
        if let Some(env) = env {
            self.index.insert(&env, fid);
        }
        Ok(fid)
    }

    /// Overwrite a feature: store first, then mapping, envelope, and index.
    pub fn set_feature(&self, record: &FeatureRecord) -> Result<(), CacheError> {
        if self.lock().closed {
            return Err(self.closed_err());
        }
        self.store
            .set_feature(record)
            .map_err(|e| self.store_err("update feature", e))?;

        let env = record.envelope();
        {
            let mut state = self.lock();
            if let Some(env) = &env {
                match state.envelope.as_mut() {
                    Some(total) => total.merge(env),
                    None => state.envelope = Some(*env),
                }
            }
            state.features.insert(record.fid(), record.clone());
        }
        match env {
            Some(env) => self.index.change(&env, record.fid()),
            None => self.index.remove(record.fid()),
        }
        Ok(())
    }

    /// Delete a feature: store first, then mapping and index.
    ///
    /// The aggregate envelope is merge-only and does not shrink on delete.
    pub fn delete_feature(&self, fid: Fid) -> Result<(), CacheError> {
        if self.lock().closed {
            return Err(self.closed_err());
        }
        self.store
            .delete_feature(fid)
            .map_err(|e| self.store_err("delete feature", e))?;

        {
            let mut state = self.lock();
            state.features.remove(&fid);
            if let Some(count) = state.count.as_mut() {
                *count = count.saturating_sub(1);
            }
            state.cursor = state.features.keys().copied().collect();
        }
        self.index.remove(fid);
        Ok(())
    }

    /// Feature count: cached value, then the store's fast count, then a
    /// full `cache()` scan as the last resort.
    pub fn feature_count(
        &self,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<u64, CacheError> {
        {
            let state = self.lock();
            if state.closed {
                return Err(self.closed_err());
            }
            if let Some(n) = state.count {
                if !force {
                    return Ok(n);
                }
            }
        }
        if let Some(n) = self.store.feature_count(force) {
            self.lock().count = Some(n);
            return Ok(n);
        }
        // Unknown sentinel from the store; counting requires the scan. A
        // forced count invalidates the mapping first so the scan actually
        // runs instead of short-circuiting on `cached`.
        if force {
            let mut state = self.lock();
            if state.cached {
                state.cached = false;
                state.count = None;
            }
        }
        self.cache(cancel)?;
        Ok(self.lock().count.unwrap_or(0))
    }

    /// Change attribute text decoding.
    ///
    /// Strings are not decoded lazily: a cached mapping is invalidated and
    /// rebuilt by a fresh scan so subsequent reads reflect the new
    /// decoding.
    pub fn set_encoding(
        &self,
        encoding: Encoding,
        cancel: &CancellationToken,
    ) -> Result<CacheOutcome, CacheError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(self.closed_err());
            }
            if state.cached {
                state.features.clear();
                state.cached = false;
                state.count = None;
                state.envelope = None;
                state.cursor.clear();
                state.cursor_pos = 0;
            }
        }
        self.index.clear();
        self.store.set_encoding(encoding);
        self.cache(cancel)
    }

    /// Aggregate envelope of all cached geometries.
    ///
    /// Falls back to the store's extent (widened on degenerate axes) when
    /// the cached aggregate is missing or degenerate.
    pub fn envelope(&self) -> Option<Envelope> {
        {
            let state = self.lock();
            if let Some(env) = state.envelope {
                if !env.is_degenerate_x() && !env.is_degenerate_y() {
                    return Some(env);
                }
            }
        }
        if self.store.is_opened() {
            if let Some(mut env) = self.store.extent() {
                env.expand_degenerate();
                self.lock().envelope = Some(env);
                return Some(env);
            }
        }
        self.lock().envelope
    }

    /// Attribute/spatial search over the collection.
    ///
    /// Serves from the mapping when cached, streams from the store
    /// otherwise. Cancellation mid-search returns the records collected so
    /// far.
    pub fn search(
        &self,
        filter: &SpatialFilter,
        only_first: bool,
        cancel: &CancellationToken,
    ) -> Result<FeatureCursor, CacheError> {
        let cached = {
            let state = self.lock();
            if state.closed {
                return Err(self.closed_err());
            }
            state.cached
        };

        let mut out = Vec::new();
        if cached {
            let state = self.lock();
            for record in state.features.values() {
                if cancel.is_cancelled() {
                    break;
                }
                if filter.matches(record) {
                    out.push(record.clone());
                    if only_first {
                        break;
                    }
                }
            }
        } else {
            self.reset();
            loop {
                if cancel.is_cancelled() {
                    break;
                }
                let Some(record) = self.next()? else {
                    break;
                };
                if filter.matches(&record) {
                    out.push(record);
                    if only_first {
                        break;
                    }
                }
            }
        }
        Ok(FeatureCursor::new(out))
    }

    /// Envelope range query against the spatial index.
    pub fn search_geometry(&self, env: &Envelope) -> SpatialCursor {
        self.index.search(env)
    }

    /// Close the cache: terminal. Releases the mapping and the index and
    /// closes the store; no further operations are valid.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.closed = true;
            state.cached = false;
            state.caching = false;
            state.features.clear();
            state.envelope = None;
            state.count = None;
            state.cursor.clear();
            state.cursor_pos = 0;
        }
        self.index.clear();
        self.store.close();
        debug!(path = %self.path, "feature cache closed");
    }
}
