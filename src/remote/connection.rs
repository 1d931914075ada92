//! Connection lifecycle for a remote web GIS service node.

use super::resource::{ResourceGroupListing, ResourceService};
use super::ServiceError;
use crate::reconcile::{
    Listing, Reconciler, ReconcilerConfig, ReconcilerHandle, ReconcilerRegistry,
};
use crate::tree::{NodeDescriptor, NodeId, Tree};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Root resource identifier of a service hierarchy.
const ROOT_RESOURCE: i64 = 0;

/// A connection binding one tree node to a remote service.
///
/// `connect` materializes the service's top-level resources as child nodes
/// and attaches a [`Reconciler`] that keeps them current; `disconnect`
/// stops every loop under the node before detaching its children. Both are
/// idempotent.
pub struct RemoteConnection {
    tree: Arc<Tree>,
    node: NodeId,
    service: Arc<dyn ResourceService>,
    registry: ReconcilerRegistry,
    config: ReconcilerConfig,
    handle: Mutex<Option<ReconcilerHandle>>,
}

impl RemoteConnection {
    pub fn new(
        tree: Arc<Tree>,
        node: NodeId,
        service: Arc<dyn ResourceService>,
        registry: ReconcilerRegistry,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            tree,
            node,
            service,
            registry,
            config,
            handle: Mutex::new(None),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Whether a reconciler is currently attached.
    pub fn is_connected(&self) -> bool {
        self.lock_handle().is_some()
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<ReconcilerHandle>> {
        self.handle.lock().expect("connection handle lock poisoned")
    }

    /// Connect: fetch the root listing, build child nodes, and start the
    /// reconciler. A second call while connected does nothing.
    pub async fn connect(&self) -> Result<(), ServiceError> {
        if self.is_connected() {
            return Ok(());
        }

        let entries = self.service.list_children(ROOT_RESOURCE).await?;
        let mut snapshot = Listing::new();
        for entry in entries {
            let Some(kind) = entry.kind.node_kind() else {
                continue;
            };
            snapshot.insert(entry.id, entry.name.clone());
            if self.tree.child_by_key(self.node, entry.id)?.is_none() {
                let descriptor = NodeDescriptor::new(entry.name, kind).with_remote_key(entry.id);
                self.tree.add_child(self.node, descriptor)?;
            }
        }

        let listing = Arc::new(ResourceGroupListing::new(self.service.clone(), ROOT_RESOURCE));
        let handle = Reconciler::spawn(
            self.tree.clone(),
            self.node,
            listing,
            snapshot,
            self.registry.clone(),
            self.config.clone(),
        );
        *self.lock_handle() = Some(handle);
        self.tree.touch(self.node);
        info!(node = ?self.node, "remote service connected");
        Ok(())
    }

    /// Disconnect: stop this node's reconciler and every nested one, then
    /// detach all children. A second call while disconnected does nothing.
    pub async fn disconnect(&self) {
        let handle = self.lock_handle().take();
        let Some(handle) = handle else {
            return;
        };
        handle.shutdown().await;

        for child in self.tree.children(self.node).unwrap_or_default() {
            self.registry.shutdown_subtree(&self.tree, child).await;
            let _ = self.tree.remove_child(child);
        }
        self.tree.touch(self.node);
        info!(node = ?self.node, "remote service disconnected");
    }

    /// Drop the current children and rebuild from a fresh listing.
    pub async fn refresh(&self) -> Result<(), ServiceError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.disconnect().await;
        self.connect().await
    }
}
