//! Route-prefix index.
//!
//! Maps exact route-prefix strings to their [`SubscriptionNode`]. Nodes are appended to an
//! arena on the first subscription to a prefix and are never removed, so a [`NodeHandle`]
//! stays valid for the life of the router even after its membership drops to zero.
//!
//! Lookups share the table lock; only the insertion of a brand new prefix takes it exclusively.

use std::iter;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::connection::Peer;
use crate::stats::Stats;
use crate::subscription::{NodeHandle, SubscriptionNode};
use crate::types::{ConnectionId, CorrelationId, HashMap, Route};

#[derive(Default)]
struct Table {
    index: HashMap<Route, usize>,
    arena: Vec<NodeHandle>,
}

impl Table {
    #[inline]
    fn get(&self, prefix: &str) -> Option<&NodeHandle> {
        self.index.get(prefix).and_then(|slot| self.arena.get(*slot))
    }
}

pub struct Router {
    table: RwLock<Table>,
    stats: Arc<Stats>,
}

impl Router {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self { table: RwLock::new(Table::default()), stats }
    }

    /// Adds `peer` to the node of every prefix, creating missing nodes.
    ///
    /// Returns one handle per input pair, in input order.
    pub fn add(&self, batch: &[(Route, CorrelationId)], peer: &Peer) -> Vec<NodeHandle> {
        batch
            .iter()
            .map(|(prefix, correlation_id)| {
                let node = self.get_or_insert(prefix);
                node.add_client(peer, *correlation_id);
                node
            })
            .collect()
    }

    /// Resolves the nodes of existing prefixes, unknown prefixes are skipped.
    ///
    /// Membership is left untouched, detaching is up to the caller.
    pub fn remove(&self, batch: &[Route], id: ConnectionId) -> Vec<NodeHandle> {
        let table = self.table.read();
        batch
            .iter()
            .filter_map(|prefix| {
                let node = table.get(prefix).cloned();
                if node.is_none() {
                    log::trace!("{id} unsubscribe from unknown prefix {prefix:?}");
                }
                node
            })
            .collect()
    }

    /// Nodes that must receive a message published to `route`: each ancestor ending at a
    /// `.` boundary, then the route itself, shortest first.
    pub fn subscriptions_for(&self, route: &str) -> Vec<NodeHandle> {
        if route.is_empty() {
            return Vec::new();
        }
        let table = self.table.read();
        route
            .match_indices('.')
            .map(|(i, _)| &route[..i])
            .chain(iter::once(route))
            .filter_map(|prefix| table.get(prefix).cloned())
            .collect()
    }

    #[inline]
    pub fn get(&self, prefix: &str) -> Option<NodeHandle> {
        self.table.read().get(prefix).cloned()
    }

    /// Number of prefixes ever subscribed to.
    #[inline]
    pub fn len(&self) -> usize {
        self.table.read().arena.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_or_insert(&self, prefix: &Route) -> NodeHandle {
        if let Some(node) = self.table.read().get(prefix) {
            return node.clone();
        }

        let mut table = self.table.write();
        // another writer may have created it between the two locks
        if let Some(node) = table.get(prefix) {
            return node.clone();
        }
        let slot = table.arena.len();
        let node = NodeHandle::new(slot, SubscriptionNode::new(prefix.clone(), self.stats.clone()));
        table.arena.push(node.clone());
        table.index.insert(prefix.clone(), slot);
        self.stats.topics.inc();
        log::debug!("new route prefix {prefix:?}, slot {slot}");
        node
    }
}
