//! The geometry store abstraction.
//!
//! The catalog core does not implement format drivers; it consumes an
//! already-opened data access layer through the [`GeometryStore`] trait.
//! [`MemoryStore`] is the one in-tree implementation, backing web-sourced
//! feature datasets and the test suite.

mod memory;

pub use memory::MemoryStore;

use crate::feature::{Encoding, FeatureRecord, Fid};
use crate::geometry::Envelope;
use thiserror::Error;

/// Store-level operation failures.
///
/// These are expected failure modes surfaced to the caller as results; the
/// core never panics for them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Operation attempted on a store that is not open
    #[error("store is not open")]
    NotOpen,

    /// Store does not support the requested operation
    #[error("operation not supported by this store: {0}")]
    Unsupported(&'static str),

    /// Feature identifier not present in the store
    #[error("feature {0} not found in store")]
    NotFound(Fid),

    /// Underlying driver or transport failure
    #[error("store I/O error: {0}")]
    Io(String),
}

/// Capability probes for a store, mirroring the driver-level test flags.
#[derive(Debug, Clone, Copy)]
pub struct StoreCapabilities {
    /// Whether the store assigns stable feature identifiers.
    ///
    /// When false, the cache synthesizes sequential FIDs starting at 1 in
    /// encounter order, renumbered on every scan.
    pub stable_fids: bool,
    /// Whether `feature_count` is cheap and reliable.
    pub fast_count: bool,
    /// Whether `extent` is cheap and reliable.
    pub fast_extent: bool,
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self {
            stable_fids: true,
            fast_count: true,
            fast_extent: true,
        }
    }
}

/// Vector data access layer: open/close lifecycle, cursor iteration,
/// mutation, and schema-level probes.
///
/// Implementations must be internally synchronized; the cache calls them
/// from whichever thread or task it runs on.
pub trait GeometryStore: Send + Sync {
    /// Open the store. Idempotent.
    fn open(&self, update: bool, shared: bool) -> Result<(), StoreError>;

    /// Close the store and release its resources. Idempotent.
    fn close(&self);

    fn is_opened(&self) -> bool;

    fn capabilities(&self) -> StoreCapabilities;

    /// Number of features, or `None` when the store cannot tell cheaply.
    fn feature_count(&self, force: bool) -> Option<u64>;

    /// Extent of all geometries, or `None` when uninitialized/unknown.
    fn extent(&self) -> Option<Envelope>;

    /// Restart the forward scan cursor.
    fn reset_reading(&self);

    /// Next feature in the forward scan, or `None` at the end.
    fn next_feature(&self) -> Result<Option<FeatureRecord>, StoreError>;

    /// Random access by identifier. `Ok(None)` means the id is absent.
    fn get_feature(&self, fid: Fid) -> Result<Option<FeatureRecord>, StoreError>;

    /// Create a feature, returning the identifier the store assigned.
    fn create_feature(&self, record: &FeatureRecord) -> Result<Fid, StoreError>;

    /// Overwrite an existing feature, matched by the record's FID.
    fn set_feature(&self, record: &FeatureRecord) -> Result<(), StoreError>;

    /// Delete a feature by identifier.
    fn delete_feature(&self, fid: Fid) -> Result<(), StoreError>;

    /// Change how raw attribute bytes are decoded on subsequent reads.
    fn set_encoding(&self, encoding: Encoding);
}
