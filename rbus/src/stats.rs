use serde_json::json;

use rbus_utils::Counter;

/// Broker-wide counters.
///
/// `connections`, `topics` and `subscriptions` are gauges; `published`,
/// `delivered` and `dropped` only grow.
#[derive(Debug, Default)]
pub struct Stats {
    pub connections: Counter,
    pub topics: Counter,
    pub subscriptions: Counter,
    pub published: Counter,
    pub delivered: Counter,
    pub dropped: Counter,
}

impl Stats {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "connections": self.connections.to_json(),
            "topics": self.topics.to_json(),
            "subscriptions": self.subscriptions.to_json(),
            "published": self.published.count(),
            "delivered": self.delivered.count(),
            "dropped": self.dropped.count(),
        })
    }
}
