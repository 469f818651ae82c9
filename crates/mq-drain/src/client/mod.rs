//! Broker client seam: connection, session and management traits.
//!
//! The migration engine talks to brokers exclusively through these traits.
//! One driver ships in-tree ([`memory`]) — an in-process broker used by the
//! integration tests and as the reference implementation of the seam; wire
//! drivers for real brokers plug in behind the same traits.

pub mod factory;
pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::EndpointConfig;
use crate::error::Result;
use crate::message::Message;
use crate::tx::{XaResource, Xid};

/// Opens connections and management handles for broker endpoints.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Open a physical connection to the broker at `endpoint`.
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn BrokerConnection>>;

    /// A handle onto the broker's management/introspection interface.
    async fn management(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn ManagementApi>>;
}

/// A physical broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Bind this connection to a client id.
    ///
    /// Required before touching durable subscriptions; only one live
    /// connection may hold a given client id at a time.
    async fn bind_client_id(&self, client_id: &str) -> Result<()>;

    /// Open a session. When `xid` is set, every consume/produce performed
    /// through the session is staged under that transaction and becomes
    /// observable only on commit.
    async fn session(&self, xid: Option<Xid>) -> Result<Box<dyn Session>>;

    /// The connection's distributed-transaction resource.
    fn xa_resource(&self) -> Arc<dyn XaResource>;

    /// Close the connection, releasing any held client id.
    async fn close(&self) -> Result<()>;
}

/// A consume/produce session on one connection.
#[async_trait]
pub trait Session: Send + Sync {
    /// Consume from a named queue, in receive order.
    async fn consume_queue(&self, queue: &str) -> Result<Box<dyn MessageConsumer>>;

    /// Consume from a durable subscription. The owning connection must hold
    /// the subscription's client id.
    async fn consume_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn MessageConsumer>>;

    /// Produce to a named queue.
    async fn produce_to_queue(&self, queue: &str) -> Result<Box<dyn MessageProducer>>;

    /// Produce to a topic (fans out to its durable subscriptions).
    async fn produce_to_topic(&self, topic: &str) -> Result<Box<dyn MessageProducer>>;

    /// Create a durable subscription (without messages) bound to the
    /// connection's client id. Idempotent.
    async fn create_durable_subscription(&self, topic: &str, subscription: &str) -> Result<()>;
}

/// Pull-style message consumer with snapshot-drain semantics.
#[async_trait]
pub trait MessageConsumer: Send {
    /// The next currently-available message, or `None` when the
    /// destination has no more messages right now. Never blocks waiting
    /// for new arrivals.
    async fn try_receive(&mut self) -> Result<Option<Message>>;
}

/// Message producer for one destination.
#[async_trait]
pub trait MessageProducer: Send {
    /// Forward one message, preserving its identifier and headers.
    async fn send(&mut self, message: &Message) -> Result<()>;
}

/// A durable subscription as reported by the management interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub client_id: String,
    pub topic: String,
    pub subscription: String,
}

/// The broker's management/introspection interface.
///
/// Mirrors the attribute surface the engine needs: destination
/// enumeration, depth reads and the force-disconnect administrative
/// action.
#[async_trait]
pub trait ManagementApi: Send + Sync {
    /// Names of all queues on the broker.
    async fn queue_names(&self) -> Result<Vec<String>>;

    /// All durable subscriptions with no live consumer.
    async fn inactive_durable_subscriptions(&self) -> Result<Vec<SubscriptionInfo>>;

    /// Current message count of a queue.
    async fn queue_depth(&self, queue: &str) -> Result<u64>;

    /// Current pending-message count of a durable subscription.
    async fn subscription_depth(
        &self,
        client_id: &str,
        topic: &str,
        subscription: &str,
    ) -> Result<u64>;

    /// Force-disconnect the live connection holding `client_id`, releasing
    /// its exclusive lock. No-op if nothing holds the id.
    async fn disconnect(&self, client_id: &str) -> Result<()>;
}
