//! In-process broker driver.
//!
//! Implements the full client seam — queues, durable subscriptions with
//! client-id locking, XA staging with prepared-state tracking for
//! recovery, and the management interface — against an in-memory store.
//! The integration tests drive the whole engine through this driver; it
//! also documents the transactional contract wire drivers must honor.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::config::EndpointConfig;
use crate::error::{DrainError, Result};
use crate::message::Message;
use crate::tx::{Vote, XaResource, Xid};

use super::{
    BrokerConnection, BrokerConnector, ManagementApi, MessageConsumer, MessageProducer, Session,
    SubscriptionInfo,
};

type SubKey = (String, String); // (client_id, subscription)

/// Where a staged consume came from, so rollback can restore it.
#[derive(Debug, Clone)]
enum MsgSource {
    Queue(String),
    Subscription { topic: String, key: SubKey },
}

/// Where a staged produce goes on commit.
#[derive(Debug, Clone)]
enum MsgSink {
    Queue(String),
    Topic(String),
}

#[derive(Debug, Default)]
struct TxWork {
    consumed: Vec<(MsgSource, Message)>,
    produced: Vec<(MsgSink, Message)>,
}

impl TxWork {
    fn is_empty(&self) -> bool {
        self.consumed.is_empty() && self.produced.is_empty()
    }
}

#[derive(Default)]
struct TopicCore {
    subscriptions: BTreeMap<SubKey, VecDeque<Message>>,
}

struct BrokerCore {
    name: String,
    queues: BTreeMap<String, VecDeque<Message>>,
    topics: BTreeMap<String, TopicCore>,
    /// client id -> connection serial holding the exclusive lock
    client_ids: BTreeMap<String, u64>,
    /// force-disconnected connection serials
    revoked: BTreeSet<u64>,
    next_serial: u64,
    /// staged work per transaction, before prepare
    active_tx: HashMap<Xid, TxWork>,
    /// in-doubt work, after prepare
    prepared_tx: BTreeMap<Xid, TxWork>,
    down: bool,
    /// fault injection: fail every send once this many have gone through
    sends_remaining: Option<u64>,
}

impl BrokerCore {
    fn check_up(&self) -> Result<()> {
        if self.down {
            return Err(DrainError::broker(format!(
                "broker '{}' is unreachable",
                self.name
            )));
        }
        Ok(())
    }

    fn check_session(&self, serial: u64) -> Result<()> {
        self.check_up()?;
        if self.revoked.contains(&serial) {
            return Err(DrainError::broker(format!(
                "connection to broker '{}' was disconnected by the broker",
                self.name
            )));
        }
        Ok(())
    }

    fn client_id_of(&self, serial: u64) -> Option<&str> {
        self.client_ids
            .iter()
            .find(|(_, s)| **s == serial)
            .map(|(id, _)| id.as_str())
    }

    fn apply(&mut self, work: TxWork) {
        // Consumed messages are gone for good; produced ones become visible
        // in staging order.
        for (sink, message) in work.produced {
            match sink {
                MsgSink::Queue(queue) => {
                    self.queues.entry(queue).or_default().push_back(message);
                }
                MsgSink::Topic(topic) => {
                    if let Some(topic_core) = self.topics.get_mut(&topic) {
                        for deque in topic_core.subscriptions.values_mut() {
                            deque.push_back(message.clone());
                        }
                    }
                }
            }
        }
    }

    fn restore(&mut self, work: TxWork) {
        // Push consumed messages back to the front in reverse staging order,
        // which restores the original queue order for redelivery.
        for (source, message) in work.consumed.into_iter().rev() {
            match source {
                MsgSource::Queue(queue) => {
                    self.queues.entry(queue).or_default().push_front(message);
                }
                MsgSource::Subscription { topic, key } => {
                    self.topics
                        .entry(topic)
                        .or_default()
                        .subscriptions
                        .entry(key)
                        .or_default()
                        .push_front(message);
                }
            }
        }
    }
}

/// An in-process broker.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerCore>>,
    resource_id: String,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let resource_id = format!("mem://{}", name);
        Self {
            inner: Arc::new(Mutex::new(BrokerCore {
                name,
                queues: BTreeMap::new(),
                topics: BTreeMap::new(),
                client_ids: BTreeMap::new(),
                revoked: BTreeSet::new(),
                next_serial: 0,
                active_tx: HashMap::new(),
                prepared_tx: BTreeMap::new(),
                down: false,
                sends_remaining: None,
            })),
            resource_id,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerCore> {
        self.inner.lock().expect("broker state poisoned")
    }

    /// Broker name.
    pub fn name(&self) -> String {
        self.lock().name.clone()
    }

    /// Simulate the broker being unreachable (or back up).
    pub fn set_down(&self, down: bool) {
        self.lock().down = down;
    }

    /// Fault injection: accept `count` more sends, then fail each one.
    /// `None` clears the limit.
    pub fn fail_sends_after(&self, count: Option<u64>) {
        self.lock().sends_remaining = count;
    }

    /// Create a queue and append `messages` to it.
    pub fn seed_queue(&self, queue: &str, messages: Vec<Message>) {
        let mut core = self.lock();
        let deque = core.queues.entry(queue.to_string()).or_default();
        deque.extend(messages);
    }

    /// Committed contents of a queue, in order.
    pub fn queue_messages(&self, queue: &str) -> Vec<Message> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register a durable subscription (test/bootstrap surface).
    pub fn create_subscription(&self, topic: &str, client_id: &str, subscription: &str) {
        let mut core = self.lock();
        core.topics
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .entry((client_id.to_string(), subscription.to_string()))
            .or_default();
    }

    /// Publish a message to a topic, fanning out to its subscriptions.
    pub fn publish(&self, topic: &str, message: Message) {
        let mut core = self.lock();
        if let Some(topic_core) = core.topics.get_mut(topic) {
            for deque in topic_core.subscriptions.values_mut() {
                deque.push_back(message.clone());
            }
        }
    }

    /// Pending contents of a durable subscription, in order.
    pub fn subscription_messages(
        &self,
        topic: &str,
        client_id: &str,
        subscription: &str,
    ) -> Vec<Message> {
        self.lock()
            .topics
            .get(topic)
            .and_then(|t| {
                t.subscriptions
                    .get(&(client_id.to_string(), subscription.to_string()))
            })
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Duplicate the head message of a subscription, as a broker would
    /// redeliver an unacknowledged message after an abrupt disconnect.
    pub fn duplicate_head_for_redelivery(
        &self,
        topic: &str,
        client_id: &str,
        subscription: &str,
    ) {
        let mut core = self.lock();
        if let Some(deque) = core.topics.get_mut(topic).and_then(|t| {
            t.subscriptions
                .get_mut(&(client_id.to_string(), subscription.to_string()))
        }) {
            if let Some(head) = deque.front().cloned() {
                deque.insert(1, head);
            }
        }
    }

    fn open_connection(&self) -> Result<Arc<MemoryConnection>> {
        let serial = {
            let mut core = self.lock();
            core.check_up()?;
            core.next_serial += 1;
            core.next_serial
        };
        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            serial,
            closed: AtomicBool::new(false),
        }))
    }

    fn resource(&self) -> Arc<MemoryXaResource> {
        Arc::new(MemoryXaResource {
            broker: self.clone(),
        })
    }
}

/// XA resource manager backed by one [`MemoryBroker`].
struct MemoryXaResource {
    broker: MemoryBroker,
}

#[async_trait]
impl XaResource for MemoryXaResource {
    fn resource_id(&self) -> &str {
        &self.broker.resource_id
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote> {
        let mut core = self.broker.lock();
        core.check_up()?;
        if let Some(work) = core.active_tx.remove(xid) {
            if !work.is_empty() {
                core.prepared_tx.insert(xid.clone(), work);
            }
        }
        Ok(Vote::Commit)
    }

    async fn commit(&self, xid: &Xid) -> Result<()> {
        let mut core = self.broker.lock();
        core.check_up()?;
        if let Some(work) = core.prepared_tx.remove(xid) {
            core.apply(work);
        } else if let Some(work) = core.active_tx.remove(xid) {
            // One-phase path, kept for completeness; the coordinator always
            // prepares first.
            core.apply(work);
        }
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> Result<()> {
        let mut core = self.broker.lock();
        core.check_up()?;
        if let Some(work) = core
            .prepared_tx
            .remove(xid)
            .or_else(|| core.active_tx.remove(xid))
        {
            core.restore(work);
        }
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<Xid>> {
        let core = self.broker.lock();
        core.check_up()?;
        Ok(core.prepared_tx.keys().cloned().collect())
    }
}

/// A connection to a [`MemoryBroker`].
struct MemoryConnection {
    broker: MemoryBroker,
    serial: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn release(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut core = self.broker.lock();
        core.client_ids.retain(|_, serial| *serial != self.serial);
        core.revoked.remove(&self.serial);
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.release();
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn bind_client_id(&self, client_id: &str) -> Result<()> {
        let mut core = self.broker.lock();
        core.check_session(self.serial)?;
        if let Some(holder) = core.client_ids.get(client_id) {
            if *holder != self.serial {
                return Err(DrainError::broker(format!(
                    "client id '{}' already in use on broker '{}'",
                    client_id, core.name
                )));
            }
            return Ok(());
        }
        if let Some(existing) = core.client_id_of(self.serial) {
            if existing != client_id {
                return Err(DrainError::broker(format!(
                    "connection already bound to client id '{}'",
                    existing
                )));
            }
        }
        core.client_ids.insert(client_id.to_string(), self.serial);
        Ok(())
    }

    async fn session(&self, xid: Option<Xid>) -> Result<Box<dyn Session>> {
        let core = self.broker.lock();
        core.check_session(self.serial)?;
        Ok(Box::new(MemorySession {
            broker: self.broker.clone(),
            serial: self.serial,
            xid,
        }))
    }

    fn xa_resource(&self) -> Arc<dyn XaResource> {
        self.broker.resource()
    }

    async fn close(&self) -> Result<()> {
        self.release();
        Ok(())
    }
}

struct MemorySession {
    broker: MemoryBroker,
    serial: u64,
    xid: Option<Xid>,
}

impl MemorySession {
    /// The client id this session's connection is bound to.
    fn bound_client_id(&self, core: &BrokerCore) -> Result<String> {
        core.client_id_of(self.serial)
            .map(str::to_string)
            .ok_or_else(|| {
                DrainError::broker("durable-subscription access requires a bound client id")
            })
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn consume_queue(&self, queue: &str) -> Result<Box<dyn MessageConsumer>> {
        let core = self.broker.lock();
        core.check_session(self.serial)?;
        Ok(Box::new(MemoryQueueConsumer {
            broker: self.broker.clone(),
            serial: self.serial,
            xid: self.xid.clone(),
            queue: queue.to_string(),
        }))
    }

    async fn consume_subscription(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn MessageConsumer>> {
        let core = self.broker.lock();
        core.check_session(self.serial)?;
        let client_id = self.bound_client_id(&core)?;
        let key = (client_id, subscription.to_string());
        if core
            .topics
            .get(topic)
            .map_or(true, |t| !t.subscriptions.contains_key(&key))
        {
            return Err(DrainError::broker(format!(
                "no durable subscription '{}' on topic '{}' for client id '{}'",
                subscription, topic, key.0
            )));
        }
        Ok(Box::new(MemorySubscriptionConsumer {
            broker: self.broker.clone(),
            serial: self.serial,
            xid: self.xid.clone(),
            topic: topic.to_string(),
            key,
        }))
    }

    async fn produce_to_queue(&self, queue: &str) -> Result<Box<dyn MessageProducer>> {
        let core = self.broker.lock();
        core.check_session(self.serial)?;
        Ok(Box::new(MemoryProducer {
            broker: self.broker.clone(),
            serial: self.serial,
            xid: self.xid.clone(),
            sink: MsgSink::Queue(queue.to_string()),
        }))
    }

    async fn produce_to_topic(&self, topic: &str) -> Result<Box<dyn MessageProducer>> {
        let core = self.broker.lock();
        core.check_session(self.serial)?;
        Ok(Box::new(MemoryProducer {
            broker: self.broker.clone(),
            serial: self.serial,
            xid: self.xid.clone(),
            sink: MsgSink::Topic(topic.to_string()),
        }))
    }

    async fn create_durable_subscription(&self, topic: &str, subscription: &str) -> Result<()> {
        let mut core = self.broker.lock();
        core.check_session(self.serial)?;
        let client_id = self.bound_client_id(&core)?;
        core.topics
            .entry(topic.to_string())
            .or_default()
            .subscriptions
            .entry((client_id, subscription.to_string()))
            .or_default();
        Ok(())
    }
}

struct MemoryQueueConsumer {
    broker: MemoryBroker,
    serial: u64,
    xid: Option<Xid>,
    queue: String,
}

#[async_trait]
impl MessageConsumer for MemoryQueueConsumer {
    async fn try_receive(&mut self) -> Result<Option<Message>> {
        let mut core = self.broker.lock();
        core.check_session(self.serial)?;
        let message = match core.queues.get_mut(&self.queue).and_then(VecDeque::pop_front) {
            Some(message) => message,
            None => return Ok(None),
        };
        if let Some(xid) = &self.xid {
            core.active_tx
                .entry(xid.clone())
                .or_default()
                .consumed
                .push((MsgSource::Queue(self.queue.clone()), message.clone()));
        }
        Ok(Some(message))
    }
}

struct MemorySubscriptionConsumer {
    broker: MemoryBroker,
    serial: u64,
    xid: Option<Xid>,
    topic: String,
    key: SubKey,
}

#[async_trait]
impl MessageConsumer for MemorySubscriptionConsumer {
    async fn try_receive(&mut self) -> Result<Option<Message>> {
        let mut core = self.broker.lock();
        core.check_session(self.serial)?;
        if core.client_ids.get(&self.key.0) != Some(&self.serial) {
            return Err(DrainError::broker(format!(
                "client id '{}' is no longer held by this connection",
                self.key.0
            )));
        }
        let message = match core
            .topics
            .get_mut(&self.topic)
            .and_then(|t| t.subscriptions.get_mut(&self.key))
            .and_then(VecDeque::pop_front)
        {
            Some(message) => message,
            None => return Ok(None),
        };
        if let Some(xid) = &self.xid {
            core.active_tx
                .entry(xid.clone())
                .or_default()
                .consumed
                .push((
                    MsgSource::Subscription {
                        topic: self.topic.clone(),
                        key: self.key.clone(),
                    },
                    message.clone(),
                ));
        }
        Ok(Some(message))
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    serial: u64,
    xid: Option<Xid>,
    sink: MsgSink,
}

#[async_trait]
impl MessageProducer for MemoryProducer {
    async fn send(&mut self, message: &Message) -> Result<()> {
        let mut core = self.broker.lock();
        core.check_session(self.serial)?;
        if let Some(remaining) = &mut core.sends_remaining {
            if *remaining == 0 {
                return Err(DrainError::broker(format!(
                    "send to broker '{}' failed",
                    core.name
                )));
            }
            *remaining -= 1;
        }
        match &self.xid {
            Some(xid) => {
                core.active_tx
                    .entry(xid.clone())
                    .or_default()
                    .produced
                    .push((self.sink.clone(), message.clone()));
            }
            None => {
                let work = TxWork {
                    consumed: Vec::new(),
                    produced: vec![(self.sink.clone(), message.clone())],
                };
                core.apply(work);
            }
        }
        Ok(())
    }
}

struct MemoryManagement {
    broker: MemoryBroker,
}

#[async_trait]
impl ManagementApi for MemoryManagement {
    async fn queue_names(&self) -> Result<Vec<String>> {
        let core = self.broker.lock();
        core.check_up()?;
        Ok(core.queues.keys().cloned().collect())
    }

    async fn inactive_durable_subscriptions(&self) -> Result<Vec<SubscriptionInfo>> {
        let core = self.broker.lock();
        core.check_up()?;
        let mut subscriptions = Vec::new();
        for (topic, topic_core) in &core.topics {
            for (client_id, subscription) in topic_core.subscriptions.keys() {
                if !core.client_ids.contains_key(client_id) {
                    subscriptions.push(SubscriptionInfo {
                        client_id: client_id.clone(),
                        topic: topic.clone(),
                        subscription: subscription.clone(),
                    });
                }
            }
        }
        Ok(subscriptions)
    }

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        let core = self.broker.lock();
        core.check_up()?;
        Ok(core.queues.get(queue).map_or(0, |q| q.len() as u64))
    }

    async fn subscription_depth(
        &self,
        client_id: &str,
        topic: &str,
        subscription: &str,
    ) -> Result<u64> {
        let core = self.broker.lock();
        core.check_up()?;
        Ok(core
            .topics
            .get(topic)
            .and_then(|t| {
                t.subscriptions
                    .get(&(client_id.to_string(), subscription.to_string()))
            })
            .map_or(0, |q| q.len() as u64))
    }

    async fn disconnect(&self, client_id: &str) -> Result<()> {
        let mut core = self.broker.lock();
        core.check_up()?;
        if let Some(serial) = core.client_ids.remove(client_id) {
            core.revoked.insert(serial);
        }
        Ok(())
    }
}

/// Connector for in-process brokers, addressed as `mem://<name>`.
pub struct MemoryConnector {
    brokers: Mutex<HashMap<String, MemoryBroker>>,
    auto_create: bool,
}

impl MemoryConnector {
    /// Connector that only serves explicitly registered brokers.
    pub fn new() -> Self {
        Self {
            brokers: Mutex::new(HashMap::new()),
            auto_create: false,
        }
    }

    /// Create empty brokers on first reference instead of failing.
    pub fn with_auto_create() -> Self {
        Self {
            brokers: Mutex::new(HashMap::new()),
            auto_create: true,
        }
    }

    /// Register a broker under a URL.
    pub fn register(&self, url: impl Into<String>, broker: MemoryBroker) {
        self.brokers
            .lock()
            .expect("connector state poisoned")
            .insert(url.into(), broker);
    }

    fn lookup(&self, url: &str) -> Result<MemoryBroker> {
        let mut brokers = self.brokers.lock().expect("connector state poisoned");
        if let Some(broker) = brokers.get(url) {
            return Ok(broker.clone());
        }
        if self.auto_create {
            let name = url.strip_prefix("mem://").unwrap_or(url).to_string();
            let broker = MemoryBroker::new(name);
            brokers.insert(url.to_string(), broker.clone());
            return Ok(broker);
        }
        Err(DrainError::broker(format!("no broker at '{}'", url)))
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn BrokerConnection>> {
        let broker = self.lookup(&endpoint.url)?;
        let connection: Arc<dyn BrokerConnection> = broker.open_connection()?;
        Ok(connection)
    }

    async fn management(&self, endpoint: &EndpointConfig) -> Result<Arc<dyn ManagementApi>> {
        let broker = self.lookup(&endpoint.url)?;
        Ok(Arc::new(MemoryManagement { broker }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msgs(bodies: &[&str]) -> Vec<Message> {
        bodies.iter().map(|b| Message::new(*b)).collect()
    }

    fn bodies(messages: &[Message]) -> Vec<String> {
        messages
            .iter()
            .map(|m| String::from_utf8_lossy(&m.body).into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_non_transactional_consume_and_produce() {
        let broker = MemoryBroker::new("b");
        broker.seed_queue("Q", msgs(&["1", "2"]));
        let conn = broker.open_connection().unwrap();
        let session = conn.session(None).await.unwrap();

        let mut consumer = session.consume_queue("Q").await.unwrap();
        assert_eq!(consumer.try_receive().await.unwrap().unwrap().body, b"1");
        assert_eq!(consumer.try_receive().await.unwrap().unwrap().body, b"2");
        assert!(consumer.try_receive().await.unwrap().is_none());

        let mut producer = session.produce_to_queue("Q2").await.unwrap();
        producer.send(&Message::new("x")).await.unwrap();
        assert_eq!(bodies(&broker.queue_messages("Q2")), vec!["x"]);
    }

    #[tokio::test]
    async fn test_transactional_work_invisible_until_commit() {
        let broker = MemoryBroker::new("b");
        broker.seed_queue("Q", msgs(&["1"]));
        let conn = broker.open_connection().unwrap();
        let xid = Xid::generate();
        let session = conn.session(Some(xid.clone())).await.unwrap();

        let mut consumer = session.consume_queue("Q").await.unwrap();
        let message = consumer.try_receive().await.unwrap().unwrap();
        let mut producer = session.produce_to_queue("OUT").await.unwrap();
        producer.send(&message).await.unwrap();

        // Consumed from Q, but OUT is still empty before commit.
        assert!(broker.queue_messages("Q").is_empty());
        assert!(broker.queue_messages("OUT").is_empty());

        let resource = conn.xa_resource();
        assert_eq!(resource.prepare(&xid).await.unwrap(), Vote::Commit);
        resource.commit(&xid).await.unwrap();
        assert_eq!(bodies(&broker.queue_messages("OUT")), vec!["1"]);
    }

    #[tokio::test]
    async fn test_rollback_restores_queue_order() {
        let broker = MemoryBroker::new("b");
        broker.seed_queue("Q", msgs(&["1", "2", "3"]));
        let conn = broker.open_connection().unwrap();
        let xid = Xid::generate();
        let session = conn.session(Some(xid.clone())).await.unwrap();

        let mut consumer = session.consume_queue("Q").await.unwrap();
        consumer.try_receive().await.unwrap();
        consumer.try_receive().await.unwrap();

        conn.xa_resource().rollback(&xid).await.unwrap();
        assert_eq!(bodies(&broker.queue_messages("Q")), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_prepared_transactions_are_in_doubt() {
        let broker = MemoryBroker::new("b");
        broker.seed_queue("Q", msgs(&["1"]));
        let conn = broker.open_connection().unwrap();
        let xid = Xid::generate();
        let session = conn.session(Some(xid.clone())).await.unwrap();
        session
            .consume_queue("Q")
            .await
            .unwrap()
            .try_receive()
            .await
            .unwrap();

        let resource = conn.xa_resource();
        resource.prepare(&xid).await.unwrap();
        assert_eq!(resource.recover().await.unwrap(), vec![xid.clone()]);

        resource.rollback(&xid).await.unwrap();
        assert!(resource.recover().await.unwrap().is_empty());
        assert_eq!(bodies(&broker.queue_messages("Q")), vec!["1"]);
    }

    #[tokio::test]
    async fn test_client_id_exclusive_lock() {
        let broker = MemoryBroker::new("b");
        let first = broker.open_connection().unwrap();
        let second = broker.open_connection().unwrap();

        first.bind_client_id("c1").await.unwrap();
        assert!(second.bind_client_id("c1").await.is_err());

        first.close().await.unwrap();
        second.bind_client_id("c1").await.unwrap();
    }

    #[tokio::test]
    async fn test_management_disconnect_revokes_holder() {
        let broker = MemoryBroker::new("b");
        broker.create_subscription("T", "c1", "s1");
        let holder = broker.open_connection().unwrap();
        holder.bind_client_id("c1").await.unwrap();

        let mgmt = MemoryManagement {
            broker: broker.clone(),
        };
        mgmt.disconnect("c1").await.unwrap();

        // The old holder is dead; a new connection can take the id.
        assert!(holder.session(None).await.is_err());
        let fresh = broker.open_connection().unwrap();
        fresh.bind_client_id("c1").await.unwrap();
    }

    #[tokio::test]
    async fn test_inactive_subscriptions_listing() {
        let broker = MemoryBroker::new("b");
        broker.create_subscription("T", "c1", "s1");
        broker.create_subscription("T", "c2", "s2");

        let conn = broker.open_connection().unwrap();
        conn.bind_client_id("c1").await.unwrap();

        let mgmt = MemoryManagement {
            broker: broker.clone(),
        };
        let inactive = mgmt.inactive_durable_subscriptions().await.unwrap();
        assert_eq!(inactive.len(), 1);
        assert_eq!(inactive[0].client_id, "c2");
    }

    #[tokio::test]
    async fn test_topic_publish_fans_out() {
        let broker = MemoryBroker::new("b");
        broker.create_subscription("T", "c1", "s1");
        broker.create_subscription("T", "c2", "s2");
        broker.publish("T", Message::new("news"));

        assert_eq!(broker.subscription_messages("T", "c1", "s1").len(), 1);
        assert_eq!(broker.subscription_messages("T", "c2", "s2").len(), 1);
    }

    #[tokio::test]
    async fn test_down_broker_refuses_everything() {
        let broker = MemoryBroker::new("b");
        broker.set_down(true);
        assert!(broker.open_connection().is_err());

        let connector = MemoryConnector::new();
        connector.register("mem://b", broker.clone());
        let endpoint = EndpointConfig::new("mem://b");
        assert!(connector.connect(&endpoint).await.is_err());
    }
}
