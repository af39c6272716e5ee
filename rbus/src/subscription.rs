use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::Peer;
use crate::stats::Stats;
use crate::types::{ConnectionId, CorrelationId, HashMap, Route};

/// Membership set of one route-prefix.
///
/// Each connection appears at most once; subscribing again only replaces its
/// correlation id. Guarded by its own lock, independent of the router table.
pub struct SubscriptionNode {
    prefix: Route,
    clients: RwLock<HashMap<ConnectionId, (Peer, CorrelationId)>>,
    stats: Arc<Stats>,
}

impl SubscriptionNode {
    pub(crate) fn new(prefix: Route, stats: Arc<Stats>) -> Self {
        Self { prefix, clients: RwLock::new(HashMap::default()), stats }
    }

    #[inline]
    pub fn prefix(&self) -> &Route {
        &self.prefix
    }

    /// Returns `true` when the connection was not a member yet.
    pub fn add_client(&self, peer: &Peer, correlation_id: CorrelationId) -> bool {
        let prev = self.clients.write().insert(peer.id(), (peer.clone(), correlation_id));
        if prev.is_none() {
            self.stats.subscriptions.inc();
        }
        prev.is_none()
    }

    pub fn remove_client(&self, id: ConnectionId) -> bool {
        let removed = self.clients.write().remove(&id).is_some();
        if removed {
            self.stats.subscriptions.dec();
        }
        removed
    }

    /// Calls `f` for every member while holding the shared lock.
    ///
    /// The guard is released on every exit path, unwinding included.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Peer, CorrelationId),
    {
        let clients = self.clients.read();
        for (peer, correlation_id) in clients.values() {
            f(peer, *correlation_id);
        }
    }

    #[inline]
    pub fn correlation_id(&self, id: ConnectionId) -> Option<CorrelationId> {
        self.clients.read().get(&id).map(|(_, c)| *c)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }
}

/// Reference to a node in the router's arena.
///
/// Equality and hashing use the arena slot, which never changes or gets reused.
#[derive(Clone)]
pub struct NodeHandle {
    slot: usize,
    node: Arc<SubscriptionNode>,
}

impl NodeHandle {
    pub(crate) fn new(slot: usize, node: SubscriptionNode) -> Self {
        Self { slot, node: Arc::new(node) }
    }

    #[inline]
    pub fn slot(&self) -> usize {
        self.slot
    }
}

impl Deref for NodeHandle {
    type Target = SubscriptionNode;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.node
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({}, {:?})", self.slot, self.node.prefix)
    }
}
