//! Per-destination transfer pipeline.
//!
//! Moves every message currently enqueued at one destination from the
//! source broker to the target broker under a single distributed
//! transaction. One transaction per destination: a fault in one
//! destination never corrupts progress on another.

use std::collections::HashSet;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::client::factory::{BrokerHandle, ConnectionFactoryRegistry, FactoryKind};
use crate::config::EndpointConfig;
use crate::directory::DestinationDirectory;
use crate::error::{DrainError, Result};
use crate::message::{Destination, MessageId};
use crate::stats::StatsTracker;
use crate::tx::TxCoordinator;

/// Drains one destination at a time from source to target.
pub struct TransferPipeline {
    registry: Arc<ConnectionFactoryRegistry>,
    coordinator: Arc<TxCoordinator>,
    stats: Arc<StatsTracker>,
    source: EndpointConfig,
    target: EndpointConfig,
    cancel: CancellationToken,
}

impl TransferPipeline {
    /// Create a pipeline over the given endpoints.
    pub fn new(
        registry: Arc<ConnectionFactoryRegistry>,
        coordinator: Arc<TxCoordinator>,
        stats: Arc<StatsTracker>,
        source: EndpointConfig,
        target: EndpointConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            coordinator,
            stats,
            source,
            target,
            cancel,
        }
    }

    /// Drain one destination. Returns the number of messages transferred.
    ///
    /// Failures local to the destination surface as
    /// [`DrainError::Transfer`] (or [`DrainError::TransactionAborted`])
    /// after the transaction rolled back; the caller skips to the next
    /// destination. [`DrainError::DirectoryUnavailable`] passes through
    /// untouched — losing management visibility is fatal to the run.
    pub async fn drain(
        &self,
        directory: &DestinationDirectory,
        destination: &Destination,
    ) -> Result<u64> {
        let result = match destination {
            Destination::Queue { .. } => self.drain_queue(directory, destination).await,
            Destination::DurableSubscription { .. } => {
                self.drain_subscription(directory, destination).await
            }
        };
        result.map_err(|e| match e {
            DrainError::DirectoryUnavailable { .. }
            | DrainError::TransactionAborted(_)
            | DrainError::Transfer { .. } => e,
            other => DrainError::transfer(destination.label(), other.to_string()),
        })
    }

    async fn drain_queue(
        &self,
        directory: &DestinationDirectory,
        destination: &Destination,
    ) -> Result<u64> {
        let name = match destination {
            Destination::Queue { name } => name.as_str(),
            _ => unreachable!("drain_queue called with a subscription handle"),
        };
        info!("Processing queue: '{}'", name);

        let source_factory = self.registry.get(&self.source, FactoryKind::Xa);
        let target_factory = self.registry.get(&self.target, FactoryKind::Xa);

        self.coordinator.begin()?;
        let worked = async {
            let source_conn = source_factory.connection().await?;
            let target_conn = target_factory.connection().await?;
            let count = self
                .copy_queue_messages(directory, destination, name, &source_conn, &target_conn)
                .await;
            // Connections go back to the pool regardless of the outcome.
            let _ = source_conn.close().await;
            let _ = target_conn.close().await;
            count
        }
        .await;

        let outcome = match worked {
            Ok(count) => self.coordinator.commit().await.map(|()| count),
            Err(e) => Err(e),
        };
        self.coordinator.end().await;

        let count = outcome?;
        info!("Handled {} messages for queue '{}'.", count, name);
        Ok(count)
    }

    async fn copy_queue_messages(
        &self,
        directory: &DestinationDirectory,
        destination: &Destination,
        name: &str,
        source_conn: &BrokerHandle,
        target_conn: &BrokerHandle,
    ) -> Result<u64> {
        let source_session = source_conn.session().await?;
        let target_session = target_conn.session().await?;

        // Depth is read once, for reporting only; arrivals during the drain
        // may push the transferred count past it.
        self.stats
            .set_size(destination, directory.depth(destination).await?);

        let mut consumer = source_session.consume_queue(name).await?;
        let mut producer = target_session.produce_to_queue(name).await?;

        let mut count = 0u64;
        while !self.cancel.is_cancelled() {
            let message = match consumer.try_receive().await? {
                Some(message) => message,
                None => break,
            };
            producer.send(&message).await?;
            self.stats.increment(destination);
            count += 1;
        }
        Ok(count)
    }

    async fn drain_subscription(
        &self,
        directory: &DestinationDirectory,
        destination: &Destination,
    ) -> Result<u64> {
        let (client_id, topic, subscription) = match destination {
            Destination::DurableSubscription {
                client_id,
                topic,
                subscription,
            } => (client_id.as_str(), topic.as_str(), subscription.as_str()),
            _ => unreachable!("drain_subscription called with a queue handle"),
        };
        info!(
            "Processing topic subscriber: '{}' [{}]",
            topic, subscription
        );

        // Re-create the subscription on the target first, outside any
        // transaction, so publishes arriving mid-migration are retained.
        self.prepare_target_subscription(client_id, topic, subscription)
            .await?;

        let source_factory = self.registry.get(&self.source, FactoryKind::Xa);
        let target_factory = self.registry.get(&self.target, FactoryKind::Xa);
        let source_conn = source_factory.connection().await?;
        let target_conn = target_factory.connection().await?;

        self.coordinator.begin()?;
        let worked = self
            .copy_subscription_messages(
                directory,
                destination,
                client_id,
                topic,
                subscription,
                &source_conn,
                &target_conn,
            )
            .await;
        let outcome = match worked {
            Ok(count) => self.coordinator.commit().await.map(|()| count),
            Err(e) => Err(e),
        };
        self.coordinator.end().await;

        // Cleanup runs independent of success: both client ids must be
        // released for later attempts.
        if let Err(e) = source_conn.close().await {
            debug!("source cleanup after '{}' failed: {}", destination, e);
        }
        if let Err(e) = target_conn.close().await {
            debug!("target cleanup after '{}' failed: {}", destination, e);
        }

        let count = outcome?;
        info!(
            "Handled {} messages for topic subscriber '{}' [{}].",
            count, topic, subscription
        );
        Ok(count)
    }

    /// Bind the client id on the target and create the durable subscription
    /// there (without messages), then release the id again.
    async fn prepare_target_subscription(
        &self,
        client_id: &str,
        topic: &str,
        subscription: &str,
    ) -> Result<()> {
        let factory = self.registry.get(&self.target, FactoryKind::Plain);
        let conn = factory.connection().await?;
        let created = async {
            conn.bind_client_id(client_id).await?;
            conn.session()
                .await?
                .create_durable_subscription(topic, subscription)
                .await
        }
        .await;
        let _ = conn.close().await;
        created
    }

    #[allow(clippy::too_many_arguments)]
    async fn copy_subscription_messages(
        &self,
        directory: &DestinationDirectory,
        destination: &Destination,
        client_id: &str,
        topic: &str,
        subscription: &str,
        source_conn: &BrokerHandle,
        target_conn: &BrokerHandle,
    ) -> Result<u64> {
        target_conn.bind_client_id(client_id).await?;
        let target_session = target_conn.session().await?;
        let mut producer = target_session.produce_to_topic(topic).await?;

        // Free the exclusive client-id lock on the source before re-binding
        // it for consumption.
        directory.disconnect(client_id).await?;
        source_conn.bind_client_id(client_id).await?;
        let source_session = source_conn.session().await?;

        self.stats
            .set_size(destination, directory.depth(destination).await?);

        let mut consumer = source_session
            .consume_subscription(topic, subscription)
            .await?;

        // A subscription may redeliver messages seen earlier in this same
        // attempt; duplicates are dropped, not re-produced.
        let mut seen: HashSet<MessageId> = HashSet::new();
        let mut count = 0u64;
        while !self.cancel.is_cancelled() {
            let message = match consumer.try_receive().await? {
                Some(message) => message,
                None => break,
            };
            if !seen.insert(message.id.clone()) {
                debug!("dropping redelivered duplicate {}", message.id);
                continue;
            }
            producer.send(&message).await?;
            self.stats.increment(destination);
            count += 1;
        }
        Ok(count)
    }
}
