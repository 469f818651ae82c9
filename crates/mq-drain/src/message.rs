//! Core data model: messages and migratable destinations.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broker-assigned message identifier.
///
/// Used as the deduplication key when a subscription redelivers messages
/// that were already seen during the same migration attempt.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap an existing broker-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        MessageId(id.into())
    }

    /// Generate a fresh identifier (used by brokers when a message is produced).
    pub fn generate() -> Self {
        MessageId(format!("ID:{}", Uuid::new_v4()))
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single broker message: identifier, headers and opaque payload.
///
/// The pipeline never inspects the payload; it is carried byte-for-byte
/// from source to target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Broker-assigned identifier.
    pub id: MessageId,

    /// String-valued message headers/properties.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Opaque payload.
    pub body: Vec<u8>,
}

impl Message {
    /// Create a message with a generated identifier and no headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: MessageId::generate(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    /// Attach a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A migratable object discovered on the source broker.
///
/// Handles are created by discovery, read-only afterwards, and ordered by
/// name so iteration over a `BTreeSet<Destination>` is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// A named queue.
    Queue { name: String },

    /// A durable topic subscription, bound to a client id.
    DurableSubscription {
        client_id: String,
        topic: String,
        subscription: String,
    },
}

impl Destination {
    /// Create a queue handle.
    pub fn queue(name: impl Into<String>) -> Self {
        Destination::Queue { name: name.into() }
    }

    /// Create a durable-subscription handle.
    pub fn durable_subscription(
        client_id: impl Into<String>,
        topic: impl Into<String>,
        subscription: impl Into<String>,
    ) -> Self {
        Destination::DurableSubscription {
            client_id: client_id.into(),
            topic: topic.into(),
            subscription: subscription.into(),
        }
    }

    /// Stats/log key: the queue name, or `topic/subscription` for
    /// durable subscriptions.
    pub fn label(&self) -> String {
        match self {
            Destination::Queue { name } => name.clone(),
            Destination::DurableSubscription {
                topic,
                subscription,
                ..
            } => format!("{}/{}", topic, subscription),
        }
    }

    /// Whether this handle names a queue.
    pub fn is_queue(&self) -> bool {
        matches!(self, Destination::Queue { .. })
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_destination_ordering_is_deterministic() {
        let mut set = BTreeSet::new();
        set.insert(Destination::queue("B"));
        set.insert(Destination::queue("A"));
        set.insert(Destination::queue("A")); // duplicate collapses
        let names: Vec<_> = set.iter().map(|d| d.label()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn test_subscription_label_format() {
        let d = Destination::durable_subscription("c1", "EVENTS", "s1");
        assert_eq!(d.label(), "EVENTS/s1");
        assert!(!d.is_queue());
    }

    #[test]
    fn test_generated_message_ids_are_unique() {
        let a = Message::new("x");
        let b = Message::new("x");
        assert_ne!(a.id, b.id);
    }
}
