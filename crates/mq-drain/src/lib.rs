//! # mq-drain
//!
//! Transactional live-broker migration library.
//!
//! Drains a running message broker into a replacement broker without data
//! loss while the source keeps serving traffic:
//!
//! - **Destination discovery** through the broker's management interface
//! - **One distributed transaction per destination** (two-phase commit
//!   across the source and target connections)
//! - **Idempotent replay protection** for durable subscriptions via
//!   message-id deduplication
//! - **Crash recovery** of in-doubt transactions from a durable commit
//!   decision log
//! - **Cooperative cancellation** with transaction-consistent statistics
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mq_drain::{DrainConfig, EndpointConfig, Orchestrator};
//! use mq_drain::client::memory::MemoryConnector;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mq_drain::DrainError> {
//!     let config = DrainConfig::new(
//!         EndpointConfig::new("mem://source"),
//!         EndpointConfig::new("mem://target"),
//!     );
//!     let connector = Arc::new(MemoryConnector::with_auto_create());
//!     let orchestrator = Orchestrator::new(config, connector).await?;
//!     let report = orchestrator.run().await?;
//!     println!("Transferred {} messages", report.messages_transferred);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod message;
pub mod orchestrator;
pub mod pipeline;
pub mod stats;
pub mod tx;

// Re-exports for convenient access
pub use config::{DrainConfig, EndpointConfig, RecoveryConfig};
pub use directory::DestinationDirectory;
pub use error::{DrainError, Result};
pub use message::{Destination, Message, MessageId};
pub use orchestrator::{DrainReport, Orchestrator};
pub use pipeline::TransferPipeline;
pub use stats::{DestinationStats, StatsTracker};
pub use tx::{TxCoordinator, TxOutcome, Vote, XaResource, Xid};
