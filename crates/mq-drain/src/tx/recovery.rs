//! Recovery modules: lazy XA-resource providers for the recovery sweep.
//!
//! A module knows how to reach one broker (url plus credentials) and hands
//! its XA resource to the coordinator on demand so in-doubt transactions
//! referencing that resource manager can be completed after a restart.

use std::sync::Arc;

use async_trait::async_trait;

use crate::client::{BrokerConnection, BrokerConnector};
use crate::config::EndpointConfig;
use crate::error::Result;

use super::XaResource;

/// Provider of XA resources for recovery scans.
///
/// `has_more`/`resource` form a stateful iterator: the sweep calls
/// `has_more` until it returns `false`, fetching one resource per `true`.
/// After exhaustion the iterator resets for the next sweep.
#[async_trait]
pub trait RecoveryModule: Send + Sync {
    /// Advance the iterator; `true` means `resource` may be called.
    async fn has_more(&mut self) -> bool;

    /// The resource at the current iterator position.
    ///
    /// Opens the underlying connection lazily and caches it; a failure here
    /// is retried on the next sweep, never fatal.
    async fn resource(&mut self) -> Result<Arc<dyn XaResource>>;
}

/// Recovery module for a single broker endpoint.
///
/// The connection is opened on first use and kept for the life of the
/// module; if the broker is unreachable the open is retried on the next
/// sweep.
pub struct BrokerXaRecovery {
    connector: Arc<dyn BrokerConnector>,
    endpoint: EndpointConfig,
    // Keeps the lazily opened connection alive alongside its resource.
    cached: Option<(Arc<dyn BrokerConnection>, Arc<dyn XaResource>)>,
    served: bool,
}

impl BrokerXaRecovery {
    /// Create a module for `endpoint`, connecting through `connector`.
    pub fn new(connector: Arc<dyn BrokerConnector>, endpoint: EndpointConfig) -> Self {
        Self {
            connector,
            endpoint,
            cached: None,
            served: false,
        }
    }
}

#[async_trait]
impl RecoveryModule for BrokerXaRecovery {
    async fn has_more(&mut self) -> bool {
        if self.served {
            self.served = false; // reset for the next sweep
            false
        } else {
            self.served = true;
            true
        }
    }

    async fn resource(&mut self) -> Result<Arc<dyn XaResource>> {
        if let Some((_, resource)) = &self.cached {
            return Ok(Arc::clone(resource));
        }
        let connection = self.connector.connect(&self.endpoint).await?;
        let resource = connection.xa_resource();
        self.cached = Some((connection, Arc::clone(&resource)));
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryBroker, MemoryConnector};

    #[tokio::test]
    async fn test_iterator_resets_after_exhaustion() {
        let connector = Arc::new(MemoryConnector::new());
        connector.register("mem://a", MemoryBroker::new("a"));
        let mut module =
            BrokerXaRecovery::new(connector, EndpointConfig::new("mem://a"));

        assert!(module.has_more().await);
        assert!(!module.has_more().await);
        // Next sweep sees the module again.
        assert!(module.has_more().await);
    }

    #[tokio::test]
    async fn test_resource_is_lazily_opened_and_cached() {
        let connector = Arc::new(MemoryConnector::new());
        let broker = MemoryBroker::new("a");
        connector.register("mem://a", broker.clone());
        let mut module =
            BrokerXaRecovery::new(connector, EndpointConfig::new("mem://a"));

        let first = module.resource().await.unwrap();
        let second = module.resource().await.unwrap();
        assert_eq!(first.resource_id(), second.resource_id());
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_not_fatal() {
        let connector = Arc::new(MemoryConnector::new());
        let broker = MemoryBroker::new("a");
        broker.set_down(true);
        connector.register("mem://a", broker.clone());
        let mut module =
            BrokerXaRecovery::new(connector, EndpointConfig::new("mem://a"));

        assert!(module.resource().await.is_err());

        // Broker comes back; the retry succeeds.
        broker.set_down(false);
        assert!(module.resource().await.is_ok());
    }
}
