//! The catalog tree: a shared hierarchy of named, typed nodes.
//!
//! Nodes live in one arena behind a mutex; identifiers are plain handles,
//! so there are no reference cycles between parents and children. Every
//! structural mutation is atomic under the tree lock and publishes a
//! [`TreeEvent`] on a broadcast channel for UI observers. Event delivery is
//! fire-and-forget: a send with no live receivers is not an error.

use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Opaque handle to one tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// What a node represents in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// The root container.
    Catalog,
    /// A remote service connection.
    Connection,
    /// A database schema container.
    Schema,
    /// A database table dataset.
    Table,
    /// A web GIS service endpoint.
    WebService,
    /// A folder-like container on a web service.
    ResourceGroup,
    /// A vector feature layer.
    VectorLayer,
    /// A vector layer backed by a PostGIS table.
    PostgisLayer,
    /// A raster coverage layer.
    RasterLayer,
    /// A rendering style attached to a layer.
    Style,
}

/// Everything needed to create a node.
#[derive(Debug, Clone)]
pub struct NodeDescriptor {
    name: String,
    kind: NodeKind,
    remote_key: Option<i64>,
}

impl NodeDescriptor {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            remote_key: None,
        }
    }

    /// Tag the node with the remote object identifier it mirrors.
    ///
    /// Reconcilers match local children to remote listings by this key.
    pub fn with_remote_key(mut self, key: i64) -> Self {
        self.remote_key = Some(key);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }
}

/// Structural change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeEvent {
    /// A node was added under its parent.
    Added(NodeId),
    /// A node's name or state changed.
    Changed(NodeId),
    /// A node (and its whole subtree) was removed.
    Removed(NodeId),
}

/// Tree-level failures.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("no such tree node: {0:?}")]
    NoSuchNode(NodeId),
}

struct Node {
    name: String,
    kind: NodeKind,
    remote_key: Option<i64>,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

struct TreeInner {
    nodes: HashMap<NodeId, Node>,
    root: NodeId,
    next_id: u64,
}

/// The shared catalog tree.
pub struct Tree {
    inner: Mutex<TreeInner>,
    events: broadcast::Sender<TreeEvent>,
}

impl Tree {
    /// Create a tree holding only the catalog root.
    pub fn new() -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                name: "Catalog".to_string(),
                kind: NodeKind::Catalog,
                remote_key: None,
                parent: None,
                children: Vec::new(),
            },
        );
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(TreeInner {
                nodes,
                root,
                next_id: 1,
            }),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TreeInner> {
        self.inner.lock().expect("catalog tree lock poisoned")
    }

    /// The root node handle.
    pub fn root(&self) -> NodeId {
        self.lock().root
    }

    /// Subscribe to structural change events.
    pub fn subscribe(&self) -> broadcast::Receiver<TreeEvent> {
        self.events.subscribe()
    }

    /// Add a child under `parent`. Publishes `Added`.
    pub fn add_child(
        &self,
        parent: NodeId,
        descriptor: NodeDescriptor,
    ) -> Result<NodeId, TreeError> {
        let id = {
            let mut inner = self.lock();
            if !inner.nodes.contains_key(&parent) {
                return Err(TreeError::NoSuchNode(parent));
            }
            let id = NodeId(inner.next_id);
            inner.next_id += 1;
            inner.nodes.insert(
                id,
                Node {
                    name: descriptor.name,
                    kind: descriptor.kind,
                    remote_key: descriptor.remote_key,
                    parent: Some(parent),
                    children: Vec::new(),
                },
            );
            inner
                .nodes
                .get_mut(&parent)
                .ok_or(TreeError::NoSuchNode(parent))?
                .children
                .push(id);
            id
        };
        self.events.send(TreeEvent::Added(id)).ok();
        Ok(id)
    }

    /// Remove a node and its whole subtree. Publishes one `Removed` for the
    /// subtree root.
    ///
    /// Callers that attached a background reconciler to any node in the
    /// subtree must shut it down first; the tree only detaches structure.
    pub fn remove_child(&self, id: NodeId) -> Result<(), TreeError> {
        {
            let mut inner = self.lock();
            if !inner.nodes.contains_key(&id) {
                return Err(TreeError::NoSuchNode(id));
            }
            if id == inner.root {
                return Err(TreeError::NoSuchNode(id));
            }
            // Collect the subtree before mutating.
            let mut stack = vec![id];
            let mut doomed = Vec::new();
            while let Some(current) = stack.pop() {
                if let Some(node) = inner.nodes.get(&current) {
                    stack.extend(node.children.iter().copied());
                    doomed.push(current);
                }
            }
            if let Some(parent) = inner.nodes.get(&id).and_then(|n| n.parent) {
                if let Some(parent_node) = inner.nodes.get_mut(&parent) {
                    parent_node.children.retain(|c| *c != id);
                }
            }
            for current in &doomed {
                inner.nodes.remove(current);
            }
            debug!(?id, removed = doomed.len(), "removed catalog subtree");
        }
        self.events.send(TreeEvent::Removed(id)).ok();
        Ok(())
    }

    /// Rename a node in place. Publishes `Changed`.
    pub fn rename_child(&self, id: NodeId, name: impl Into<String>) -> Result<(), TreeError> {
        {
            let mut inner = self.lock();
            let node = inner.nodes.get_mut(&id).ok_or(TreeError::NoSuchNode(id))?;
            node.name = name.into();
        }
        self.events.send(TreeEvent::Changed(id)).ok();
        Ok(())
    }

    /// Publish `Changed` for a node whose state (not structure) changed.
    pub fn touch(&self, id: NodeId) {
        if self.lock().nodes.contains_key(&id) {
            self.events.send(TreeEvent::Changed(id)).ok();
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.lock().nodes.contains_key(&id)
    }

    pub fn name(&self, id: NodeId) -> Result<String, TreeError> {
        let inner = self.lock();
        inner
            .nodes
            .get(&id)
            .map(|n| n.name.clone())
            .ok_or(TreeError::NoSuchNode(id))
    }

    pub fn kind(&self, id: NodeId) -> Result<NodeKind, TreeError> {
        let inner = self.lock();
        inner
            .nodes
            .get(&id)
            .map(|n| n.kind)
            .ok_or(TreeError::NoSuchNode(id))
    }

    /// The remote object identifier a node mirrors, if any.
    pub fn remote_key(&self, id: NodeId) -> Result<Option<i64>, TreeError> {
        let inner = self.lock();
        inner
            .nodes
            .get(&id)
            .map(|n| n.remote_key)
            .ok_or(TreeError::NoSuchNode(id))
    }

    /// Child handles in insertion order.
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, TreeError> {
        let inner = self.lock();
        inner
            .nodes
            .get(&id)
            .map(|n| n.children.clone())
            .ok_or(TreeError::NoSuchNode(id))
    }

    /// Find a direct child by its remote key.
    pub fn child_by_key(&self, parent: NodeId, key: i64) -> Result<Option<NodeId>, TreeError> {
        let inner = self.lock();
        let node = inner
            .nodes
            .get(&parent)
            .ok_or(TreeError::NoSuchNode(parent))?;
        Ok(node
            .children
            .iter()
            .copied()
            .find(|c| inner.nodes.get(c).and_then(|n| n.remote_key) == Some(key)))
    }

    /// Find a direct child by name.
    pub fn child_by_name(&self, parent: NodeId, name: &str) -> Result<Option<NodeId>, TreeError> {
        let inner = self.lock();
        let node = inner
            .nodes
            .get(&parent)
            .ok_or(TreeError::NoSuchNode(parent))?;
        Ok(node
            .children
            .iter()
            .copied()
            .find(|c| inner.nodes.get(c).map(|n| n.name.as_str()) == Some(name)))
    }

    /// Slash-separated path from the root to a node.
    pub fn path(&self, id: NodeId) -> Result<String, TreeError> {
        let inner = self.lock();
        if !inner.nodes.contains_key(&id) {
            return Err(TreeError::NoSuchNode(id));
        }
        let mut segments = Vec::new();
        let mut current = Some(id);
        while let Some(node_id) = current {
            let node = inner
                .nodes
                .get(&node_id)
                .ok_or(TreeError::NoSuchNode(node_id))?;
            segments.push(node.name.clone());
            current = node.parent;
        }
        segments.reverse();
        Ok(segments.join("/"))
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn try_recv(rx: &mut broadcast::Receiver<TreeEvent>) -> Vec<TreeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_add_child_publishes_added() {
        let tree = Tree::new();
        let mut rx = tree.subscribe();
        let id = tree
            .add_child(tree.root(), NodeDescriptor::new("gis.example.com", NodeKind::WebService))
            .unwrap();
        assert_eq!(try_recv(&mut rx), vec![TreeEvent::Added(id)]);
        assert_eq!(tree.name(id).unwrap(), "gis.example.com");
        assert_eq!(tree.kind(id).unwrap(), NodeKind::WebService);
    }

    #[test]
    fn test_remove_child_drops_whole_subtree_with_one_event() {
        let tree = Tree::new();
        let group = tree
            .add_child(tree.root(), NodeDescriptor::new("group", NodeKind::ResourceGroup))
            .unwrap();
        let layer = tree
            .add_child(group, NodeDescriptor::new("roads", NodeKind::VectorLayer))
            .unwrap();
        let style = tree
            .add_child(layer, NodeDescriptor::new("default", NodeKind::Style))
            .unwrap();

        let mut rx = tree.subscribe();
        tree.remove_child(group).unwrap();
        assert_eq!(try_recv(&mut rx), vec![TreeEvent::Removed(group)]);
        assert!(!tree.contains(group));
        assert!(!tree.contains(layer));
        assert!(!tree.contains(style));
        assert_eq!(tree.children(tree.root()).unwrap(), vec![]);
    }

    #[test]
    fn test_remove_root_is_rejected() {
        let tree = Tree::new();
        assert!(tree.remove_child(tree.root()).is_err());
    }

    #[test]
    fn test_rename_publishes_changed() {
        let tree = Tree::new();
        let id = tree
            .add_child(tree.root(), NodeDescriptor::new("old", NodeKind::Table))
            .unwrap();
        let mut rx = tree.subscribe();
        tree.rename_child(id, "new").unwrap();
        assert_eq!(try_recv(&mut rx), vec![TreeEvent::Changed(id)]);
        assert_eq!(tree.name(id).unwrap(), "new");
    }

    #[test]
    fn test_send_without_receivers_is_not_an_error() {
        let tree = Tree::new();
        // No subscriber exists; mutations still succeed.
        let id = tree
            .add_child(tree.root(), NodeDescriptor::new("solo", NodeKind::Schema))
            .unwrap();
        tree.rename_child(id, "renamed").unwrap();
        tree.remove_child(id).unwrap();
    }

    #[test]
    fn test_child_by_key_and_name() {
        let tree = Tree::new();
        let parent = tree
            .add_child(tree.root(), NodeDescriptor::new("svc", NodeKind::WebService))
            .unwrap();
        let a = tree
            .add_child(
                parent,
                NodeDescriptor::new("roads", NodeKind::VectorLayer).with_remote_key(11),
            )
            .unwrap();
        tree.add_child(
            parent,
            NodeDescriptor::new("rivers", NodeKind::VectorLayer).with_remote_key(12),
        )
        .unwrap();

        assert_eq!(tree.child_by_key(parent, 11).unwrap(), Some(a));
        assert_eq!(tree.child_by_key(parent, 99).unwrap(), None);
        assert_eq!(tree.child_by_name(parent, "roads").unwrap(), Some(a));
        assert_eq!(tree.child_by_name(parent, "absent").unwrap(), None);
        assert_eq!(tree.remote_key(a).unwrap(), Some(11));
    }

    #[test]
    fn test_path() {
        let tree = Tree::new();
        let svc = tree
            .add_child(tree.root(), NodeDescriptor::new("svc", NodeKind::WebService))
            .unwrap();
        let layer = tree
            .add_child(svc, NodeDescriptor::new("roads", NodeKind::VectorLayer))
            .unwrap();
        assert_eq!(tree.path(layer).unwrap(), "Catalog/svc/roads");
    }

    #[test]
    fn test_unknown_node_errors() {
        let tree = Tree::new();
        let ghost = NodeId(999);
        assert!(matches!(tree.name(ghost), Err(TreeError::NoSuchNode(_))));
        assert!(tree.remove_child(ghost).is_err());
        assert!(tree.rename_child(ghost, "x").is_err());
        assert!(tree
            .add_child(ghost, NodeDescriptor::new("x", NodeKind::Table))
            .is_err());
    }
}
