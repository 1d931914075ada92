//! Remote web GIS services: resource classification, tree expansion,
//! connection lifecycle, and feature payload import.
//!
//! Everything here talks to a service through the [`ResourceService`]
//! trait; no transport lives in this crate. A connection builds tree nodes
//! from the service's resource listings, attaches a reconciler to keep
//! them current, and imports feature payloads into an in-memory store.

mod connection;
mod features;
mod resource;
mod walker;

pub use connection::RemoteConnection;
pub use features::{import_features, load_remote_features, ImportStats};
pub use resource::{parse_children, ResourceEntry, ResourceGroupListing, ResourceKind, ResourceService};
pub use walker::expand;

use crate::reconcile::RemoteError;
use crate::tree::TreeError;
use thiserror::Error;

/// Failures of remote-backed catalog operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Tree(#[from] TreeError),
}
