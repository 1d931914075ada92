//! In-memory geometry store.
//!
//! Plays the role the "Memory" driver plays for a desktop catalog: a
//! fully-materialized store for feature collections that arrive over the
//! wire (web feature payloads) and for tests. All state lives behind one
//! mutex; the cursor is a snapshot of the key set taken at `reset_reading`.

use super::{GeometryStore, StoreCapabilities, StoreError};
use crate::feature::{Encoding, FeatureRecord, Fid, FID_NONE};
use crate::geometry::Envelope;
use std::collections::BTreeMap;
use std::sync::Mutex;

struct MemoryStoreInner {
    features: BTreeMap<Fid, FeatureRecord>,
    cursor: Vec<Fid>,
    cursor_pos: usize,
    next_fid: Fid,
    opened: bool,
    encoding: Encoding,
}

/// In-memory [`GeometryStore`] implementation.
pub struct MemoryStore {
    inner: Mutex<MemoryStoreInner>,
    caps: StoreCapabilities,
}

impl MemoryStore {
    /// Create an empty store with default capabilities (stable FIDs,
    /// fast count, fast extent).
    pub fn new() -> Self {
        Self::with_capabilities(StoreCapabilities::default())
    }

    /// Create an empty store with explicit capability flags.
    ///
    /// Tests use this to exercise the cache's fallback paths (synthetic FID
    /// assignment, count-by-scan).
    pub fn with_capabilities(caps: StoreCapabilities) -> Self {
        Self {
            inner: Mutex::new(MemoryStoreInner {
                features: BTreeMap::new(),
                cursor: Vec::new(),
                cursor_pos: 0,
                next_fid: 1,
                opened: false,
                encoding: Encoding::default(),
            }),
            caps,
        }
    }

    /// Seed a record under its own FID, bypassing assignment.
    ///
    /// Used when importing remote payloads whose features already carry
    /// provider-assigned identifiers.
    pub fn seed(&self, record: FeatureRecord) {
        let mut inner = self.lock();
        inner.next_fid = inner.next_fid.max(record.fid() + 1);
        inner.features.insert(record.fid(), record);
    }

    /// Number of live records, regardless of the `fast_count` flag.
    pub fn len(&self) -> usize {
        self.lock().features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().features.is_empty()
    }

    /// The encoding most recently set via `set_encoding`.
    pub fn encoding(&self) -> Encoding {
        self.lock().encoding
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().expect("memory store lock poisoned")
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GeometryStore for MemoryStore {
    fn open(&self, _update: bool, _shared: bool) -> Result<(), StoreError> {
        self.lock().opened = true;
        Ok(())
    }

    fn close(&self) {
        let mut inner = self.lock();
        inner.opened = false;
        inner.cursor.clear();
        inner.cursor_pos = 0;
    }

    fn is_opened(&self) -> bool {
        self.lock().opened
    }

    fn capabilities(&self) -> StoreCapabilities {
        self.caps
    }

    fn feature_count(&self, _force: bool) -> Option<u64> {
        if !self.caps.fast_count {
            return None;
        }
        Some(self.lock().features.len() as u64)
    }

    fn extent(&self) -> Option<Envelope> {
        if !self.caps.fast_extent {
            return None;
        }
        let inner = self.lock();
        let mut extent: Option<Envelope> = None;
        for record in inner.features.values() {
            if let Some(env) = record.envelope() {
                match extent.as_mut() {
                    Some(e) => e.merge(&env),
                    None => extent = Some(env),
                }
            }
        }
        extent
    }

    fn reset_reading(&self) {
        let mut inner = self.lock();
        inner.cursor = inner.features.keys().copied().collect();
        inner.cursor_pos = 0;
    }

    fn next_feature(&self) -> Result<Option<FeatureRecord>, StoreError> {
        let mut inner = self.lock();
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        while inner.cursor_pos < inner.cursor.len() {
            let fid = inner.cursor[inner.cursor_pos];
            inner.cursor_pos += 1;
            if let Some(record) = inner.features.get(&fid) {
                let mut record = record.clone();
                if !self.caps.stable_fids {
                    // A store without stable identifiers serves anonymous
                    // records; the cache assigns its own.
                    record.set_fid(FID_NONE);
                }
                return Ok(Some(record));
            }
            // Deleted since the cursor snapshot; skip.
        }
        Ok(None)
    }

    fn get_feature(&self, fid: Fid) -> Result<Option<FeatureRecord>, StoreError> {
        let inner = self.lock();
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        Ok(inner.features.get(&fid).cloned())
    }

    fn create_feature(&self, record: &FeatureRecord) -> Result<Fid, StoreError> {
        let mut inner = self.lock();
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        let fid = inner.next_fid;
        inner.next_fid += 1;
        let mut stored = record.clone();
        stored.set_fid(fid);
        inner.features.insert(fid, stored);
        Ok(fid)
    }

    fn set_feature(&self, record: &FeatureRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        if !inner.features.contains_key(&record.fid()) {
            return Err(StoreError::NotFound(record.fid()));
        }
        inner.features.insert(record.fid(), record.clone());
        Ok(())
    }

    fn delete_feature(&self, fid: Fid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.opened {
            return Err(StoreError::NotOpen);
        }
        if inner.features.remove(&fid).is_none() {
            return Err(StoreError::NotFound(fid));
        }
        Ok(())
    }

    fn set_encoding(&self, encoding: Encoding) {
        self.lock().encoding = encoding;
    }
}
