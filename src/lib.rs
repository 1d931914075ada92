//! GeoCatalog - cached feature access and live remote catalogs for
//! desktop GIS.
//!
//! The crate has two halves. The data side caches a vector dataset in
//! memory behind [`cache::FeatureCache`], giving O(1) feature lookup, an
//! aggregate extent, and envelope range queries through a spatial index.
//! The catalog side keeps a shared [`tree::Tree`] of connections, schemas,
//! and web resources current against remote services via background
//! [`reconcile::Reconciler`] loops.
//!
//! # Example
//!
//! ```ignore
//! use geocatalog::cache::FeatureCache;
//! use geocatalog::store::MemoryStore;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let cache = FeatureCache::new("memory", Arc::new(MemoryStore::new()));
//! cache.open(true, false)?;
//! cache.cache(&CancellationToken::new())?;
//! let extent = cache.envelope();
//! ```

pub mod cache;
pub mod feature;
pub mod geometry;
pub mod logging;
pub mod reconcile;
pub mod remote;
pub mod spatial;
pub mod store;
pub mod tree;

pub use cache::{CacheError, CacheOutcome, FeatureCache, SpatialFilter};
pub use feature::{FeatureRecord, FieldValue, Fid};
pub use geometry::{Envelope, Geometry};
pub use store::{GeometryStore, MemoryStore, StoreError};
pub use tree::{NodeId, NodeKind, Tree, TreeEvent};

/// Version of the GeoCatalog library.
///
/// Defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_injected() {
        assert!(!VERSION.is_empty());
    }
}
