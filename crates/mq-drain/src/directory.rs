//! Destination discovery over the broker's management interface.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::client::{BrokerConnector, ManagementApi};
use crate::config::EndpointConfig;
use crate::error::{DrainError, Result};
use crate::message::Destination;

/// Queries the source broker's management interface for migratable
/// destinations and performs the administrative actions migration needs.
///
/// Every failure talking to the management interface is mapped to
/// [`DrainError::DirectoryUnavailable`]: without visibility into the
/// broker the run must not proceed.
pub struct DestinationDirectory {
    management: Arc<dyn ManagementApi>,
}

impl DestinationDirectory {
    /// Wrap an existing management handle.
    pub fn new(management: Arc<dyn ManagementApi>) -> Self {
        Self { management }
    }

    /// Open the management interface of the broker at `endpoint`.
    pub async fn connect(
        connector: &dyn BrokerConnector,
        endpoint: &EndpointConfig,
    ) -> Result<Self> {
        let management = connector
            .management(endpoint)
            .await
            .map_err(|e| DrainError::directory(e.to_string()))?;
        Ok(Self::new(management))
    }

    /// All queues on the broker, deduplicated and deterministically ordered.
    pub async fn queues(&self) -> Result<BTreeSet<Destination>> {
        let names = self
            .management
            .queue_names()
            .await
            .map_err(|e| DrainError::directory(e.to_string()))?;
        Ok(names.into_iter().map(Destination::queue).collect())
    }

    /// All inactive durable subscriptions, deduplicated and ordered.
    pub async fn durable_subscriptions(&self) -> Result<BTreeSet<Destination>> {
        let infos = self
            .management
            .inactive_durable_subscriptions()
            .await
            .map_err(|e| DrainError::directory(e.to_string()))?;
        Ok(infos
            .into_iter()
            .map(|info| {
                Destination::durable_subscription(info.client_id, info.topic, info.subscription)
            })
            .collect())
    }

    /// Current message count of a destination. Read once per transfer, for
    /// reporting only — never used for loop termination.
    pub async fn depth(&self, destination: &Destination) -> Result<u64> {
        let depth = match destination {
            Destination::Queue { name } => self.management.queue_depth(name).await,
            Destination::DurableSubscription {
                client_id,
                topic,
                subscription,
            } => {
                self.management
                    .subscription_depth(client_id, topic, subscription)
                    .await
            }
        };
        depth.map_err(|e| DrainError::directory(e.to_string()))
    }

    /// Force-disconnect the live connection holding `client_id` so the
    /// broker releases the subscription's exclusive lock.
    pub async fn disconnect(&self, client_id: &str) -> Result<()> {
        self.management
            .disconnect(client_id)
            .await
            .map_err(|e| DrainError::directory(e.to_string()))
    }
}
