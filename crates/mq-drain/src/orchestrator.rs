//! Migration orchestrator - main workflow coordinator.
//!
//! Sequences connectivity check, queue migration and durable-subscription
//! migration, owns the cooperative-cancellation token and performs the
//! shutdown-time stats dump exactly once, after all in-flight work has
//! quiesced.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::client::factory::{ConnectionFactoryRegistry, FactoryKind};
use crate::client::BrokerConnector;
use crate::config::DrainConfig;
use crate::directory::DestinationDirectory;
use crate::error::{DrainError, Result};
use crate::pipeline::TransferPipeline;
use crate::stats::{DestinationStats, StatsTracker};
use crate::tx::recovery::{BrokerXaRecovery, RecoveryModule};
use crate::tx::TxCoordinator;

/// Orchestrator state machine phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    CheckingConnectivity,
    MigratingQueues,
    MigratingSubscriptions,
    Finished,
}

/// Final status of a migration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunStatus {
    Completed,
    CompletedWithFailures,
    Cancelled,
    ConnectivityFailed,
}

impl RunStatus {
    fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::CompletedWithFailures => "completed_with_failures",
            RunStatus::Cancelled => "cancelled",
            RunStatus::ConnectivityFailed => "connectivity_failed",
        }
    }
}

struct RunSummary {
    status: RunStatus,
    attempted: usize,
    failed: Vec<String>,
}

/// Result of a migration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainReport {
    /// Unique run identifier.
    pub run_id: String,

    /// Final status: `completed`, `completed_with_failures`, `cancelled`
    /// or `connectivity_failed`.
    pub status: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Destinations whose transfer was attempted.
    pub destinations_attempted: usize,

    /// Destinations fully migrated.
    pub destinations_migrated: usize,

    /// Destinations that failed and were skipped.
    pub destinations_failed: usize,

    /// Total messages transferred (committed only).
    pub messages_transferred: u64,

    /// Labels of failed destinations.
    pub failed_destinations: Vec<String>,

    /// Per-destination processed/discovered counts.
    pub destinations: BTreeMap<String, DestinationStats>,
}

impl DrainReport {
    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Migration orchestrator.
pub struct Orchestrator {
    config: DrainConfig,
    connector: Arc<dyn BrokerConnector>,
    coordinator: Arc<TxCoordinator>,
    registry: Arc<ConnectionFactoryRegistry>,
    stats: Arc<StatsTracker>,
    cancel: CancellationToken,
    phase: Phase,
}

impl Orchestrator {
    /// Create a new orchestrator.
    ///
    /// Builds the transaction coordinator (with its decision log under the
    /// configured store directory), the factory registry and the stats
    /// tracker, and registers one recovery module per broker.
    pub async fn new(config: DrainConfig, connector: Arc<dyn BrokerConnector>) -> Result<Self> {
        config.validate()?;
        let coordinator = Arc::new(TxCoordinator::new(&config.recovery.store_dir)?);
        let registry = Arc::new(ConnectionFactoryRegistry::new(
            connector.clone(),
            coordinator.clone(),
        ));
        let stats = Arc::new(StatsTracker::new(coordinator.clone()));

        let modules: Vec<Box<dyn RecoveryModule>> = vec![
            Box::new(BrokerXaRecovery::new(
                connector.clone(),
                config.source.clone(),
            )),
            Box::new(BrokerXaRecovery::new(
                connector.clone(),
                config.target.clone(),
            )),
        ];
        coordinator.register_recovery(modules).await;

        Ok(Self {
            config,
            connector,
            coordinator,
            registry,
            stats,
            cancel: CancellationToken::new(),
            phase: Phase::Idle,
        })
    }

    /// Use an externally owned cancellation token (e.g. wired to SIGINT).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The token that stops the run at the next destination or message
    /// boundary.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn enter(&mut self, phase: Phase) {
        debug!("orchestrator: {:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    /// Run the migration.
    ///
    /// The stats dump happens exactly once, strictly after the final
    /// transaction reached its terminal state — the destination loop has
    /// quiesced by the time this method dumps and returns.
    pub async fn run(mut self) -> Result<DrainReport> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();
        info!("Running broker migration (run {}) ...", run_id);

        let sweep_cancel = CancellationToken::new();
        let sweep = self
            .coordinator
            .clone()
            .spawn_recovery_sweep(self.config.recovery.sweep_interval(), sweep_cancel.clone());

        let outcome = self.run_phases().await;

        // All in-flight work has quiesced; dump once, then tear down.
        self.stats.dump();
        sweep_cancel.cancel();
        let _ = sweep.await;
        self.registry.shutdown().await;

        let summary = outcome?;
        let completed_at = Utc::now();
        let destinations = self.stats.snapshot();
        let messages_transferred = destinations.values().map(|s| s.processed).sum();

        let report = DrainReport {
            run_id,
            status: summary.status.as_str().to_string(),
            started_at,
            completed_at,
            duration_seconds: (completed_at - started_at).num_milliseconds() as f64 / 1000.0,
            destinations_attempted: summary.attempted,
            destinations_migrated: summary.attempted - summary.failed.len(),
            destinations_failed: summary.failed.len(),
            messages_transferred,
            failed_destinations: summary.failed,
            destinations,
        };

        info!(
            "Migration {}: {}/{} destinations, {} messages in {:.1}s",
            report.status,
            report.destinations_migrated,
            report.destinations_attempted,
            report.messages_transferred,
            report.duration_seconds
        );

        Ok(report)
    }

    async fn run_phases(&mut self) -> Result<RunSummary> {
        self.enter(Phase::CheckingConnectivity);
        if !self.check_connectivity().await {
            // Fails closed: no transfer is attempted, no side effects.
            self.enter(Phase::Finished);
            return Ok(RunSummary {
                status: RunStatus::ConnectivityFailed,
                attempted: 0,
                failed: Vec::new(),
            });
        }

        let directory =
            DestinationDirectory::connect(self.connector.as_ref(), &self.config.source).await?;
        let pipeline = TransferPipeline::new(
            self.registry.clone(),
            self.coordinator.clone(),
            self.stats.clone(),
            self.config.source.clone(),
            self.config.target.clone(),
            self.cancel.clone(),
        );

        let mut attempted = 0usize;
        let mut failed = Vec::new();

        self.enter(Phase::MigratingQueues);
        if !self.cancel.is_cancelled() {
            let queues = directory.queues().await?;
            info!(
                "Found queues: {:?}",
                queues.iter().map(|d| d.label()).collect::<Vec<_>>()
            );
            self.drain_all(
                &pipeline,
                &directory,
                queues.iter().cloned(),
                &mut attempted,
                &mut failed,
            )
            .await?;
        }

        if self.config.migrate_subscriptions && !self.cancel.is_cancelled() {
            self.enter(Phase::MigratingSubscriptions);
            let subscribers = directory.durable_subscriptions().await?;
            info!(
                "Found durable topic subscribers: {:?}",
                subscribers.iter().map(|d| d.label()).collect::<Vec<_>>()
            );
            self.drain_all(
                &pipeline,
                &directory,
                subscribers.iter().cloned(),
                &mut attempted,
                &mut failed,
            )
            .await?;
            let consumed: u64 = subscribers.iter().map(|d| self.stats.processed(d)).sum();
            info!("Consumed {} messages.", consumed);
        }

        self.enter(Phase::Finished);
        let status = if self.cancel.is_cancelled() {
            info!("Migration cancelled; no further destinations will be started.");
            RunStatus::Cancelled
        } else if failed.is_empty() {
            info!("-- Broker migration finished. --");
            RunStatus::Completed
        } else {
            info!("-- Broker migration finished with failures. --");
            RunStatus::CompletedWithFailures
        };

        Ok(RunSummary {
            status,
            attempted,
            failed,
        })
    }

    /// Drain a batch of destinations, one transaction each.
    ///
    /// Per-destination failures are logged and skipped; losing the
    /// management interface aborts the run.
    async fn drain_all(
        &self,
        pipeline: &TransferPipeline,
        directory: &DestinationDirectory,
        destinations: impl IntoIterator<Item = crate::message::Destination>,
        attempted: &mut usize,
        failed: &mut Vec<String>,
    ) -> Result<()> {
        for destination in destinations {
            if self.cancel.is_cancelled() {
                break;
            }
            *attempted += 1;
            match pipeline.drain(directory, &destination).await {
                Ok(_) => {}
                Err(e @ DrainError::DirectoryUnavailable { .. }) => return Err(e),
                Err(e) => {
                    error!("{}", e);
                    failed.push(destination.label());
                }
            }
        }
        Ok(())
    }

    /// Probe the target broker before touching anything.
    async fn check_connectivity(&self) -> bool {
        let factory = self.registry.get(&self.config.target, FactoryKind::Plain);
        match factory.connection().await {
            Ok(connection) => {
                let _ = connection.close().await;
                info!("Target broker accessible ...");
                true
            }
            Err(e) => {
                info!(
                    "Cannot connect to target broker [{}]: {}",
                    self.config.target.url, e
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::{MemoryBroker, MemoryConnector};
    use crate::config::EndpointConfig;

    fn config(dir: &tempfile::TempDir) -> DrainConfig {
        DrainConfig::new(
            EndpointConfig::new("mem://source"),
            EndpointConfig::new("mem://target"),
        )
        .with_recovery_dir(dir.path())
    }

    #[tokio::test]
    async fn test_connectivity_failure_means_zero_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MemoryConnector::new());
        let source = MemoryBroker::new("source");
        let target = MemoryBroker::new("target");
        source.seed_queue("Q", vec![crate::message::Message::new("m")]);
        target.set_down(true);
        connector.register("mem://source", source.clone());
        connector.register("mem://target", target.clone());

        let orchestrator = Orchestrator::new(config(&dir), connector).await.unwrap();
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.status, "connectivity_failed");
        assert_eq!(report.destinations_attempted, 0);
        assert_eq!(source.queue_messages("Q").len(), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_run_starts_no_destination() {
        let dir = tempfile::tempdir().unwrap();
        let connector = Arc::new(MemoryConnector::new());
        let source = MemoryBroker::new("source");
        let target = MemoryBroker::new("target");
        source.seed_queue("Q", vec![crate::message::Message::new("m")]);
        connector.register("mem://source", source.clone());
        connector.register("mem://target", target);

        let orchestrator = Orchestrator::new(config(&dir), connector).await.unwrap();
        orchestrator.cancel_token().cancel();
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.status, "cancelled");
        assert_eq!(report.destinations_attempted, 0);
        assert_eq!(source.queue_messages("Q").len(), 1);
    }
}
