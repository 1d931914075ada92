//! One-shot expansion of web service containers into the catalog tree.

use super::resource::ResourceService;
use super::ServiceError;
use crate::tree::{NodeDescriptor, NodeId, Tree};
use std::sync::Arc;
use tracing::debug;

/// Expand a container node: fetch its remote children once and create a
/// child node for each classified resource.
///
/// A node that already has children is considered expanded and is left
/// untouched (expansion is one-shot; a reconciler keeps it current from
/// then on). Unknown resources are skipped without error. Returns the
/// handles of the nodes created by this call.
pub async fn expand(
    tree: &Arc<Tree>,
    parent: NodeId,
    service: &dyn ResourceService,
) -> Result<Vec<NodeId>, ServiceError> {
    if !tree.children(parent)?.is_empty() {
        return Ok(Vec::new());
    }
    let resource_id = tree.remote_key(parent)?.unwrap_or(0);
    let entries = service.list_children(resource_id).await?;

    let mut created = Vec::new();
    for entry in entries {
        let Some(kind) = entry.kind.node_kind() else {
            debug!(id = entry.id, name = %entry.name, "skipping unknown resource");
            continue;
        };
        let descriptor = NodeDescriptor::new(entry.name, kind).with_remote_key(entry.id);
        created.push(tree.add_child(parent, descriptor)?);
    }
    if !created.is_empty() {
        tree.touch(parent);
    }
    Ok(created)
}
