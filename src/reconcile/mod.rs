//! Background reconciliation of the catalog tree against remote listings.
//!
//! A [`Reconciler`] owns a polling loop for one container node: fetch the
//! remote child listing, diff it against the snapshot from the previous
//! cycle, apply removals, then renames, then additions to the shared
//! [`Tree`], and sleep. A successful cycle sleeps the regular poll
//! interval; a failed fetch sleeps the longer backoff interval and the
//! loop retries indefinitely. The loop checks its cancellation token at
//! the top of each cycle, so a cycle in flight always applies completely.
//!
//! Handles for spawned reconcilers live in a [`ReconcilerRegistry`] keyed
//! by node. Before a reconciler detaches a child that has its own
//! reconciler attached, it shuts that nested loop down and waits for the
//! task to finish, so no loop ever touches a node after its removal.

use crate::tree::{NodeDescriptor, NodeId, NodeKind, Tree};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Sleep after a cycle that fetched successfully.
pub const POLL_INTERVAL: Duration = Duration::from_millis(950);
/// Sleep after a cycle whose fetch failed.
pub const BACKOFF_INTERVAL: Duration = Duration::from_millis(5000);

/// Remote child listing: object id to display name.
///
/// `BTreeMap` keeps diff application deterministic.
pub type Listing = BTreeMap<i64, String>;

/// Failures talking to a remote service.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Transport-level failure; the caller retries later.
    #[error("remote fetch failed: {0}")]
    Fetch(String),

    /// The service answered but the payload could not be interpreted.
    #[error("malformed remote payload: {0}")]
    Payload(String),
}

/// Source of remote child listings for one container.
///
/// Boxed-future form keeps the trait dyn-compatible.
pub trait RemoteListing: Send + Sync {
    fn list_remote_objects(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Listing, RemoteError>> + Send + '_>>;
}

/// One tree mutation derived from a listing diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileAction {
    /// The remote object disappeared; drop the local child.
    Remove { key: i64 },
    /// The remote object was renamed; rename the local child.
    Rename { key: i64, name: String },
    /// A new remote object appeared; add a local child.
    Add { key: i64, name: String },
}

/// Compute the actions turning `snapshot` into `current`.
///
/// Removals come first, then renames, then additions, each in key order.
pub fn diff(snapshot: &Listing, current: &Listing) -> Vec<ReconcileAction> {
    let mut actions = Vec::new();
    for key in snapshot.keys() {
        if !current.contains_key(key) {
            actions.push(ReconcileAction::Remove { key: *key });
        }
    }
    for (key, name) in current {
        if let Some(old_name) = snapshot.get(key) {
            if old_name != name {
                actions.push(ReconcileAction::Rename {
                    key: *key,
                    name: name.clone(),
                });
            }
        }
    }
    for (key, name) in current {
        if !snapshot.contains_key(key) {
            actions.push(ReconcileAction::Add {
                key: *key,
                name: name.clone(),
            });
        }
    }
    actions
}

/// What one polling cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Fetch succeeded; `changes` actions were applied.
    Applied { changes: usize },
    /// Fetch failed; the snapshot was left untouched.
    FetchFailed,
}

/// Tuning for one reconciler loop.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub poll_interval: Duration,
    pub backoff_interval: Duration,
    /// Node kind for children created by `Add` actions.
    pub child_kind: NodeKind,
}

impl ReconcilerConfig {
    pub fn new(child_kind: NodeKind) -> Self {
        Self {
            poll_interval: POLL_INTERVAL,
            backoff_interval: BACKOFF_INTERVAL,
            child_kind,
        }
    }
}

fn next_interval(outcome: &CycleOutcome, config: &ReconcilerConfig) -> Duration {
    match outcome {
        CycleOutcome::Applied { .. } => config.poll_interval,
        CycleOutcome::FetchFailed => config.backoff_interval,
    }
}

/// Handle to one running reconciler task.
pub struct ReconcilerHandle {
    token: CancellationToken,
    join: Option<JoinHandle<()>>,
}

impl ReconcilerHandle {
    /// Request the loop to stop without waiting.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Stop the loop and wait for the task to finish.
    ///
    /// After this returns, the reconciler will never touch the tree again.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for ReconcilerHandle {
    fn drop(&mut self) {
        // A dropped handle must not leave a loop running forever.
        self.token.cancel();
    }
}

/// Shared map of node to reconciler handle.
///
/// Connections register the loops they spawn here; anything removing a
/// subtree shuts the affected loops down through the registry first.
#[derive(Clone, Default)]
pub struct ReconcilerRegistry {
    inner: Arc<Mutex<HashMap<NodeId, ReconcilerHandle>>>,
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, ReconcilerHandle>> {
        self.inner.lock().expect("reconciler registry lock poisoned")
    }

    pub fn register(&self, node: NodeId, handle: ReconcilerHandle) {
        self.lock().insert(node, handle);
    }

    pub fn is_registered(&self, node: NodeId) -> bool {
        self.lock().contains_key(&node)
    }

    /// Detach the handle for a node, if any.
    pub fn take(&self, node: NodeId) -> Option<ReconcilerHandle> {
        self.lock().remove(&node)
    }

    /// Shut down every reconciler attached to `root` or any descendant and
    /// wait for their tasks to finish.
    pub async fn shutdown_subtree(&self, tree: &Tree, root: NodeId) {
        let mut stack = vec![root];
        let mut nodes = Vec::new();
        while let Some(id) = stack.pop() {
            nodes.push(id);
            if let Ok(children) = tree.children(id) {
                stack.extend(children);
            }
        }
        let handles: Vec<ReconcilerHandle> = {
            let mut inner = self.lock();
            nodes.iter().filter_map(|id| inner.remove(id)).collect()
        };
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

/// Background polling loop for one container node.
pub struct Reconciler;

impl Reconciler {
    /// Spawn the loop. The first fetch happens one poll interval after
    /// spawn; `initial` is the snapshot the first diff runs against.
    pub fn spawn(
        tree: Arc<Tree>,
        parent: NodeId,
        listing: Arc<dyn RemoteListing>,
        initial: Listing,
        registry: ReconcilerRegistry,
        config: ReconcilerConfig,
    ) -> ReconcilerHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let join = tokio::spawn(async move {
            Self::run(tree, parent, listing, initial, registry, config, loop_token).await;
        });
        ReconcilerHandle {
            token,
            join: Some(join),
        }
    }

    async fn run(
        tree: Arc<Tree>,
        parent: NodeId,
        listing: Arc<dyn RemoteListing>,
        mut snapshot: Listing,
        registry: ReconcilerRegistry,
        config: ReconcilerConfig,
        token: CancellationToken,
    ) {
        let mut consecutive_failures: u32 = 0;
        // Sleep first: the spawner has just built the initial children from
        // the same listing the snapshot came from.
        let mut last_outcome = CycleOutcome::Applied { changes: 0 };
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(next_interval(&last_outcome, &config)) => {}
            }

            if token.is_cancelled() {
                break;
            }
            if !tree.contains(parent) {
                debug!(?parent, "reconciled node is gone, stopping");
                break;
            }

            last_outcome =
                Self::run_cycle(&tree, parent, listing.as_ref(), &mut snapshot, &registry, &config)
                    .await;
            match last_outcome {
                CycleOutcome::Applied { changes } => {
                    consecutive_failures = 0;
                    if changes > 0 {
                        debug!(?parent, changes, "applied remote changes");
                    }
                }
                CycleOutcome::FetchFailed => {
                    consecutive_failures += 1;
                    warn!(?parent, consecutive_failures, "remote listing fetch failed, backing off");
                }
            }
        }
        debug!(?parent, "reconciler stopped");
    }

    async fn run_cycle(
        tree: &Arc<Tree>,
        parent: NodeId,
        listing: &dyn RemoteListing,
        snapshot: &mut Listing,
        registry: &ReconcilerRegistry,
        config: &ReconcilerConfig,
    ) -> CycleOutcome {
        let current = match listing.list_remote_objects().await {
            Ok(current) => current,
            Err(e) => {
                debug!(?parent, error = %e, "listing fetch error");
                return CycleOutcome::FetchFailed;
            }
        };

        let actions = diff(snapshot, &current);
        let changes = actions.len();
        for action in actions {
            match action {
                ReconcileAction::Remove { key } => {
                    if let Ok(Some(child)) = tree.child_by_key(parent, key) {
                        // A nested loop must be fully stopped before its
                        // node is detached.
                        registry.shutdown_subtree(tree, child).await;
                        if let Err(e) = tree.remove_child(child) {
                            warn!(?parent, key, error = %e, "failed to remove child");
                        }
                    }
                }
                ReconcileAction::Rename { key, name } => {
                    if let Ok(Some(child)) = tree.child_by_key(parent, key) {
                        if let Err(e) = tree.rename_child(child, name) {
                            warn!(?parent, key, error = %e, "failed to rename child");
                        }
                    }
                }
                ReconcileAction::Add { key, name } => {
                    let descriptor =
                        NodeDescriptor::new(name, config.child_kind).with_remote_key(key);
                    if let Err(e) = tree.add_child(parent, descriptor) {
                        warn!(?parent, key, error = %e, "failed to add child");
                    }
                }
            }
        }
        if changes > 0 {
            tree.touch(parent);
        }
        *snapshot = current;
        CycleOutcome::Applied { changes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn listing(pairs: &[(i64, &str)]) -> Listing {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_diff_orders_removals_renames_additions() {
        let snapshot = listing(&[(1, "a"), (2, "b")]);
        let current = listing(&[(1, "a2"), (3, "c")]);
        let actions = diff(&snapshot, &current);
        assert_eq!(
            actions,
            vec![
                ReconcileAction::Remove { key: 2 },
                ReconcileAction::Rename {
                    key: 1,
                    name: "a2".to_string()
                },
                ReconcileAction::Add {
                    key: 3,
                    name: "c".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_diff_identical_listings_is_empty() {
        let snapshot = listing(&[(1, "a"), (2, "b")]);
        assert!(diff(&snapshot, &snapshot.clone()).is_empty());
    }

    #[test]
    fn test_diff_from_empty_snapshot_is_all_additions() {
        let actions = diff(&Listing::new(), &listing(&[(5, "x"), (6, "y")]));
        assert_eq!(
            actions,
            vec![
                ReconcileAction::Add {
                    key: 5,
                    name: "x".to_string()
                },
                ReconcileAction::Add {
                    key: 6,
                    name: "y".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_interval_selection() {
        let config = ReconcilerConfig::new(NodeKind::ResourceGroup);
        assert_eq!(
            next_interval(&CycleOutcome::Applied { changes: 0 }, &config),
            POLL_INTERVAL
        );
        assert_eq!(
            next_interval(&CycleOutcome::FetchFailed, &config),
            BACKOFF_INTERVAL
        );
    }

    /// Listing that serves a scripted sequence, then a fixed fallback.
    struct ScriptedListing {
        script: Mutex<VecDeque<Result<Listing, RemoteError>>>,
        fallback: Listing,
        calls: AtomicUsize,
    }

    impl ScriptedListing {
        fn new(script: Vec<Result<Listing, RemoteError>>, fallback: Listing) -> Self {
            Self {
                script: Mutex::new(script.into()),
                fallback,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl RemoteListing for ScriptedListing {
        fn list_remote_objects(
            &self,
        ) -> Pin<Box<dyn Future<Output = Result<Listing, RemoteError>> + Send + '_>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(self.fallback.clone()));
            Box::pin(async move { next })
        }
    }

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: Duration::from_millis(5),
            backoff_interval: Duration::from_millis(10),
            child_kind: NodeKind::ResourceGroup,
        }
    }

    async fn wait_until(mut probe: impl FnMut() -> bool) {
        for _ in 0..400 {
            if probe() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_reconciler_applies_listing_changes() {
        let tree = Arc::new(Tree::new());
        let parent = tree
            .add_child(tree.root(), NodeDescriptor::new("svc", NodeKind::WebService))
            .unwrap();
        let a = tree
            .add_child(
                parent,
                NodeDescriptor::new("a", NodeKind::ResourceGroup).with_remote_key(1),
            )
            .unwrap();
        let b = tree
            .add_child(
                parent,
                NodeDescriptor::new("b", NodeKind::ResourceGroup).with_remote_key(2),
            )
            .unwrap();

        let remote = Arc::new(ScriptedListing::new(vec![], listing(&[(1, "a2"), (3, "c")])));
        let handle = Reconciler::spawn(
            tree.clone(),
            parent,
            remote,
            listing(&[(1, "a"), (2, "b")]),
            ReconcilerRegistry::new(),
            fast_config(),
        );

        let probe_tree = tree.clone();
        wait_until(move || {
            !probe_tree.contains(b)
                && probe_tree.name(a).map(|n| n == "a2").unwrap_or(false)
                && probe_tree.child_by_key(parent, 3).ok().flatten().is_some()
        })
        .await;
        handle.shutdown().await;

        let added = tree.child_by_key(parent, 3).unwrap().unwrap();
        assert_eq!(tree.name(added).unwrap(), "c");
        assert_eq!(tree.kind(added).unwrap(), NodeKind::ResourceGroup);
    }

    #[tokio::test]
    async fn test_reconciler_survives_repeated_fetch_failures() {
        let tree = Arc::new(Tree::new());
        let parent = tree
            .add_child(tree.root(), NodeDescriptor::new("svc", NodeKind::WebService))
            .unwrap();

        let remote = Arc::new(ScriptedListing::new(
            vec![
                Err(RemoteError::Fetch("down".to_string())),
                Err(RemoteError::Fetch("down".to_string())),
                Err(RemoteError::Fetch("down".to_string())),
            ],
            listing(&[(7, "recovered")]),
        ));
        let handle = Reconciler::spawn(
            tree.clone(),
            parent,
            remote.clone(),
            Listing::new(),
            ReconcilerRegistry::new(),
            fast_config(),
        );

        let probe_tree = tree.clone();
        wait_until(move || probe_tree.child_by_key(parent, 7).ok().flatten().is_some()).await;
        handle.shutdown().await;

        // All three failures were consumed before the recovery listing.
        assert!(remote.calls.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test]
    async fn test_removal_shuts_down_nested_reconciler() {
        let tree = Arc::new(Tree::new());
        let parent = tree
            .add_child(tree.root(), NodeDescriptor::new("svc", NodeKind::WebService))
            .unwrap();
        let group = tree
            .add_child(
                parent,
                NodeDescriptor::new("group", NodeKind::ResourceGroup).with_remote_key(1),
            )
            .unwrap();

        let registry = ReconcilerRegistry::new();
        // The nested loop polls an empty, stable listing.
        let nested = Reconciler::spawn(
            tree.clone(),
            group,
            Arc::new(ScriptedListing::new(vec![], Listing::new())),
            Listing::new(),
            registry.clone(),
            fast_config(),
        );
        registry.register(group, nested);
        assert!(registry.is_registered(group));

        // The outer listing drops the group.
        let outer = Reconciler::spawn(
            tree.clone(),
            parent,
            Arc::new(ScriptedListing::new(vec![], Listing::new())),
            listing(&[(1, "group")]),
            registry.clone(),
            fast_config(),
        );

        let probe_tree = tree.clone();
        wait_until(move || !probe_tree.contains(group)).await;
        outer.shutdown().await;
        assert!(!registry.is_registered(group));
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let tree = Arc::new(Tree::new());
        let parent = tree
            .add_child(tree.root(), NodeDescriptor::new("svc", NodeKind::WebService))
            .unwrap();
        let remote = Arc::new(ScriptedListing::new(vec![], Listing::new()));
        let handle = Reconciler::spawn(
            tree.clone(),
            parent,
            remote.clone(),
            Listing::new(),
            ReconcilerRegistry::new(),
            fast_config(),
        );

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown().await;
        let calls = remote.calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(remote.calls.load(Ordering::SeqCst), calls);
    }
}
