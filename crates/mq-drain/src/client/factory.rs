//! Connection factory registry.
//!
//! Factories are created lazily per `(url, kind)` pair, cached for the
//! process lifetime and shut down exactly once at exit. Callers borrow
//! factories and own only the connections they open from them. The three
//! variants are a plain enum — the registry builds the right one from the
//! `kind` parameter and every call site dispatches through a match.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::error::{DrainError, Result};
use crate::tx::TxCoordinator;

use super::{BrokerConnection, BrokerConnector, Session};

/// Factory flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactoryKind {
    /// Fresh physical connection per call.
    Plain,
    /// Reuses idle physical connections.
    Pooled,
    /// Pooled, and sessions enlist their connection's XA resource in the
    /// ambient transaction.
    Xa,
}

type IdlePool = Arc<Mutex<Vec<Arc<dyn BrokerConnection>>>>;

/// A cached connection factory of one [`FactoryKind`].
pub enum ConnectionFactory {
    Plain(PlainFactory),
    Pooled(PooledFactory),
    Xa(XaFactory),
}

impl ConnectionFactory {
    /// Open (or check out) a connection.
    pub async fn connection(&self) -> Result<BrokerHandle> {
        match self {
            ConnectionFactory::Plain(f) => f.connection().await,
            ConnectionFactory::Pooled(f) => f.connection().await,
            ConnectionFactory::Xa(f) => f.connection().await,
        }
    }

    /// Release every pooled physical connection.
    pub async fn shutdown(&self) {
        match self {
            ConnectionFactory::Plain(_) => {}
            ConnectionFactory::Pooled(f) => drain_pool(&f.idle).await,
            ConnectionFactory::Xa(f) => drain_pool(&f.idle).await,
        }
    }
}

async fn drain_pool(idle: &IdlePool) {
    let connections = std::mem::take(&mut *idle.lock().expect("pool poisoned"));
    for connection in connections {
        if let Err(e) = connection.close().await {
            warn!("closing pooled connection failed: {}", e);
        }
    }
}

/// Fresh connection per call.
pub struct PlainFactory {
    connector: Arc<dyn BrokerConnector>,
    endpoint: EndpointConfig,
}

impl PlainFactory {
    async fn connection(&self) -> Result<BrokerHandle> {
        let connection = self.connector.connect(&self.endpoint).await?;
        Ok(BrokerHandle::new(connection, None, None))
    }
}

/// Reuses idle physical connections.
pub struct PooledFactory {
    connector: Arc<dyn BrokerConnector>,
    endpoint: EndpointConfig,
    idle: IdlePool,
}

impl PooledFactory {
    async fn connection(&self) -> Result<BrokerHandle> {
        let reused = self.idle.lock().expect("pool poisoned").pop();
        let connection = match reused {
            Some(connection) => connection,
            None => self.connector.connect(&self.endpoint).await?,
        };
        Ok(BrokerHandle::new(connection, None, Some(self.idle.clone())))
    }
}

/// Pooled XA factory: sessions opened from its connections enlist in the
/// coordinator's ambient transaction.
pub struct XaFactory {
    connector: Arc<dyn BrokerConnector>,
    endpoint: EndpointConfig,
    coordinator: Arc<TxCoordinator>,
    idle: IdlePool,
}

impl XaFactory {
    async fn connection(&self) -> Result<BrokerHandle> {
        let reused = self.idle.lock().expect("pool poisoned").pop();
        let connection = match reused {
            Some(connection) => connection,
            None => self.connector.connect(&self.endpoint).await?,
        };
        Ok(BrokerHandle::new(
            connection,
            Some(self.coordinator.clone()),
            Some(self.idle.clone()),
        ))
    }
}

/// A borrowed connection, returned by a factory.
///
/// `close` checks the connection back into its factory's pool when it can
/// be reused; a connection that bound a client id is physically closed so
/// the broker releases the exclusive lock.
pub struct BrokerHandle {
    connection: Arc<dyn BrokerConnection>,
    coordinator: Option<Arc<TxCoordinator>>,
    pool: Option<IdlePool>,
    bound_client_id: AtomicBool,
}

impl BrokerHandle {
    fn new(
        connection: Arc<dyn BrokerConnection>,
        coordinator: Option<Arc<TxCoordinator>>,
        pool: Option<IdlePool>,
    ) -> Self {
        Self {
            connection,
            coordinator,
            pool,
            bound_client_id: AtomicBool::new(false),
        }
    }

    /// Bind the underlying connection to a client id.
    pub async fn bind_client_id(&self, client_id: &str) -> Result<()> {
        self.connection.bind_client_id(client_id).await?;
        self.bound_client_id.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Open a session.
    ///
    /// For XA handles this enlists the connection's resource in the active
    /// transaction and stages all session work under it; opening an XA
    /// session outside a transaction is a coordinator-misuse error.
    pub async fn session(&self) -> Result<Box<dyn Session>> {
        match &self.coordinator {
            Some(coordinator) => {
                let xid = coordinator.current_xid().ok_or_else(|| {
                    DrainError::Transaction(
                        "XA session requires an active transaction".into(),
                    )
                })?;
                coordinator.enlist(self.connection.xa_resource())?;
                self.connection.session(Some(xid)).await
            }
            None => self.connection.session(None).await,
        }
    }

    /// Return the connection to its factory, or close it for good.
    pub async fn close(&self) -> Result<()> {
        let reusable = !self.bound_client_id.load(Ordering::SeqCst);
        match (&self.pool, reusable) {
            (Some(pool), true) => {
                pool.lock().expect("pool poisoned").push(self.connection.clone());
                Ok(())
            }
            _ => self.connection.close().await,
        }
    }
}

/// Process-wide cache of connection factories.
pub struct ConnectionFactoryRegistry {
    connector: Arc<dyn BrokerConnector>,
    coordinator: Arc<TxCoordinator>,
    factories: Mutex<HashMap<(String, FactoryKind), Arc<ConnectionFactory>>>,
}

impl ConnectionFactoryRegistry {
    /// Create an empty registry.
    pub fn new(connector: Arc<dyn BrokerConnector>, coordinator: Arc<TxCoordinator>) -> Self {
        Self {
            connector,
            coordinator,
            factories: Mutex::new(HashMap::new()),
        }
    }

    /// Cached factory for `(endpoint.url, kind)`, constructing it on first
    /// use. Construction is mutually exclusive per registry.
    pub fn get(&self, endpoint: &EndpointConfig, kind: FactoryKind) -> Arc<ConnectionFactory> {
        let mut factories = self.factories.lock().expect("registry poisoned");
        factories
            .entry((endpoint.url.clone(), kind))
            .or_insert_with(|| {
                debug!("creating {:?} connection factory for {}", kind, endpoint.url);
                let factory = match kind {
                    FactoryKind::Plain => ConnectionFactory::Plain(PlainFactory {
                        connector: self.connector.clone(),
                        endpoint: endpoint.clone(),
                    }),
                    FactoryKind::Pooled => ConnectionFactory::Pooled(PooledFactory {
                        connector: self.connector.clone(),
                        endpoint: endpoint.clone(),
                        idle: Arc::new(Mutex::new(Vec::new())),
                    }),
                    FactoryKind::Xa => ConnectionFactory::Xa(XaFactory {
                        connector: self.connector.clone(),
                        endpoint: endpoint.clone(),
                        coordinator: self.coordinator.clone(),
                        idle: Arc::new(Mutex::new(Vec::new())),
                    }),
                };
                Arc::new(factory)
            })
            .clone()
    }

    /// Stop and release every cached factory. Called once at process exit.
    pub async fn shutdown(&self) {
        let factories = {
            let mut map = self.factories.lock().expect("registry poisoned");
            std::mem::take(&mut *map)
        };
        for ((url, kind), factory) in factories {
            debug!("shutting down {:?} factory for {}", kind, url);
            factory.shutdown().await;
        }
    }
}
