//! Store-and-forward delivery.
//!
//! Outbound messages are encoded once. While the session is online they are
//! queued for the publisher task; otherwise, or when the publish fails, they
//! are persisted in the bounded queue of their category and replayed as one
//! `@delayed` batch on the next online transition.

use std::sync::Arc;

use edgesync_core::{clock, Attribute, ChangeOrigin, Node, Transaction};
use edgesync_proto::{
    AttributeMessage, Formats, JobOutputMessage, LogRecordMessage, NodeMessage, OutboundMessage,
    TopicScheme, TransactionMessage,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::CategoryLimits;
use crate::error::EndpointError;
use crate::persistence::{Category, MessageStore, PersistedMessage};
use crate::supervisor::SessionState;
use crate::transport::Transport;

/// An encoded message on its way to the broker.
#[derive(Debug, Clone)]
struct Outbound {
    topic: String,
    payload: Vec<u8>,
    retain: bool,
    /// Fallback queue; `None` for transient messages dropped while offline
    category: Option<Category>,
    timestamp: i64,
}

pub(crate) struct DeliveryManager {
    topics: TopicScheme,
    formats: Formats,
    store: Arc<dyn MessageStore>,
    limits: CategoryLimits,
    transport: Arc<dyn Transport>,
    state: watch::Receiver<SessionState>,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    transaction: Mutex<Option<Transaction>>,
    replaying: tokio::sync::Mutex<()>,
}

impl DeliveryManager {
    pub(crate) fn new(
        topics: TopicScheme,
        formats: Formats,
        store: Arc<dyn MessageStore>,
        limits: CategoryLimits,
        transport: Arc<dyn Transport>,
        state: watch::Receiver<SessionState>,
    ) -> Self {
        let (outbound, pending) = mpsc::unbounded_channel();
        Self {
            topics,
            formats,
            store,
            limits,
            transport,
            state,
            outbound,
            pending: Mutex::new(Some(pending)),
            transaction: Mutex::new(None),
            replaying: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    fn is_online(&self) -> bool {
        *self.state.borrow() == SessionState::Online
    }

    /// Route a change of a registered attribute.
    pub(crate) fn attribute_changed(&self, attribute: &Attribute, origin: &ChangeOrigin) {
        match origin {
            ChangeOrigin::Endpoint => {
                if let Some(transaction) = self.transaction.lock().as_mut() {
                    if let Err(e) = transaction.add(attribute) {
                        tracing::warn!(error = %e, "Failed to add attribute to transaction");
                    }
                    return;
                }
                self.send_update(attribute);
            }
            ChangeOrigin::Cloud {
                correlation_id: Some(correlation_id),
            } => self.send_did_set(attribute, correlation_id),
            // Broker-originated and unacknowledged: the broker already has it.
            ChangeOrigin::Cloud { correlation_id: None } => {}
        }
    }

    fn send_update(&self, attribute: &Attribute) {
        let address = match attribute.address() {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping update of detached attribute");
                return;
            }
        };
        let message = OutboundMessage::Attribute(AttributeMessage::from_attribute(attribute));
        let timestamp = attribute.timestamp().unwrap_or_else(clock::tick);
        self.send(self.topics.update(&address), &message, true, Some(Category::Update), timestamp);
    }

    fn send_did_set(&self, attribute: &Attribute, correlation_id: &str) {
        let address = match attribute.address() {
            Ok(address) => address,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping acknowledgement of detached attribute");
                return;
            }
        };
        let message = OutboundMessage::Attribute(AttributeMessage::did_set(attribute, correlation_id));
        let timestamp = attribute.timestamp().unwrap_or_else(clock::tick);
        self.send(self.topics.did_set(&address), &message, true, Some(Category::Update), timestamp);
    }

    pub(crate) fn node_added(&self, node: &Node) {
        let message = OutboundMessage::Node(NodeMessage::from_node(node));
        self.send(
            self.topics.node_added(&node.name()),
            &message,
            false,
            Some(Category::Lifecycle),
            clock::tick(),
        );
    }

    pub(crate) fn node_removed(&self, name: &str) {
        self.dispatch(Outbound {
            topic: self.topics.node_removed(name),
            payload: Vec::new(),
            retain: false,
            category: Some(Category::Lifecycle),
            timestamp: clock::tick(),
        });
    }

    pub(crate) fn log(&self, record: LogRecordMessage) {
        // Records share one topic; the event time may repeat.
        self.send(
            self.topics.logs(),
            &OutboundMessage::Log(record),
            false,
            Some(Category::Log),
            clock::tick(),
        );
    }

    pub(crate) fn job_output(&self, correlation_id: &str, line: &str) {
        let message = OutboundMessage::JobOutput(JobOutputMessage {
            correlation_id: correlation_id.to_string(),
            data: line.to_string(),
        });
        self.send(self.topics.exec_output(correlation_id), &message, false, None, clock::tick());
    }

    pub(crate) fn begin_transaction(&self) -> Result<(), EndpointError> {
        let mut transaction = self.transaction.lock();
        if transaction.is_some() {
            return Err(EndpointError::TransactionOpen);
        }
        *transaction = Some(Transaction::new());
        Ok(())
    }

    /// Send the accumulated attributes as one message. Returns how many were
    /// included.
    pub(crate) fn commit_transaction(&self) -> Result<usize, EndpointError> {
        let transaction = self
            .transaction
            .lock()
            .take()
            .ok_or(EndpointError::NoTransaction)?;
        if transaction.is_empty() {
            return Ok(0);
        }
        let message = OutboundMessage::Transaction(TransactionMessage::from_transaction(&transaction));
        let payload = self.formats.primary().encode(&message)?;
        self.dispatch(Outbound {
            topic: self.topics.transaction(),
            payload,
            retain: true,
            category: Some(Category::Update),
            timestamp: clock::tick(),
        });
        Ok(transaction.len())
    }

    pub(crate) fn rollback_transaction(&self) -> Result<usize, EndpointError> {
        let transaction = self
            .transaction
            .lock()
            .take()
            .ok_or(EndpointError::NoTransaction)?;
        Ok(transaction.len())
    }

    fn send(
        &self,
        topic: String,
        message: &OutboundMessage,
        retain: bool,
        category: Option<Category>,
        timestamp: i64,
    ) {
        match self.formats.primary().encode(message) {
            Ok(payload) => self.dispatch(Outbound {
                topic,
                payload,
                retain,
                category,
                timestamp,
            }),
            Err(e) => tracing::warn!(topic = %topic, error = %e, "Failed to encode message"),
        }
    }

    fn dispatch(&self, outbound: Outbound) {
        if !self.is_online() {
            self.persist(outbound);
            return;
        }
        if let Err(mpsc::error::SendError(outbound)) = self.outbound.send(outbound) {
            self.persist(outbound);
        }
    }

    fn persist(&self, outbound: Outbound) {
        let Some(category) = outbound.category else {
            tracing::debug!(topic = %outbound.topic, "Dropping transient message while offline");
            return;
        };
        let message = PersistedMessage {
            timestamp: outbound.timestamp,
            topic: outbound.topic,
            payload: outbound.payload,
        };
        match self.store.store(category, self.limits.limit(category), &message) {
            Ok(()) => tracing::debug!(topic = %message.topic, category = %category, "Persisted message"),
            Err(e) => tracing::error!(
                topic = %message.topic,
                category = %category,
                error = %e,
                "Failed to persist message"
            ),
        }
    }

    /// Start the task publishing queued messages. Only the first call spawns.
    pub(crate) fn spawn_publisher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut pending = self.pending.lock().take()?;
        let manager = Arc::clone(self);
        Some(tokio::spawn(async move {
            while let Some(outbound) = pending.recv().await {
                if !manager.is_online() {
                    manager.persist(outbound);
                    continue;
                }
                let result = manager
                    .transport
                    .publish(&outbound.topic, outbound.payload.clone(), outbound.retain)
                    .await;
                match result {
                    Ok(()) => tracing::trace!(topic = %outbound.topic, "Published message"),
                    Err(e) => {
                        tracing::warn!(topic = %outbound.topic, error = %e, "Publish failed, falling back to store");
                        manager.persist(outbound);
                    }
                }
            }
        }))
    }

    /// Publish the whole backlog as one `@delayed` message and purge exactly
    /// what was sent. Returns the number of replayed messages.
    ///
    /// Entries the primary format cannot embed are discarded. On failure the
    /// rest of the backlog is left intact.
    pub(crate) async fn replay(&self) -> Result<usize, EndpointError> {
        let _guard = self.replaying.lock().await;

        let mut backlog = Vec::new();
        for category in Category::ALL {
            backlog.extend(
                self.store
                    .messages(category)?
                    .into_iter()
                    .map(|message| (category, message)),
            );
        }
        if backlog.is_empty() {
            return Ok(0);
        }
        backlog.sort_by(|(_, a), (_, b)| a.key().cmp(&b.key()));

        let format = self.formats.primary();
        let (backlog, unreadable): (Vec<_>, Vec<_>) = backlog
            .into_iter()
            .partition(|(_, message)| format.embeds(&message.payload));
        for (category, message) in &unreadable {
            tracing::warn!(
                topic = %message.topic,
                category = %category,
                format = format.name(),
                "Discarding stored message that cannot be replayed"
            );
        }
        self.purge(&unreadable)?;
        if backlog.is_empty() {
            return Ok(0);
        }

        let entries: Vec<(String, Vec<u8>)> = backlog
            .iter()
            .map(|(_, message)| (message.topic.clone(), message.payload.clone()))
            .collect();
        let payload = format.encode_delayed(clock::to_seconds(clock::wall_ms()), &entries)?;

        let topic = self.topics.delayed();
        tracing::info!(topic = %topic, count = entries.len(), "Replaying backlog");
        self.transport.publish(&topic, payload, true).await?;

        self.purge(&backlog)?;
        Ok(entries.len())
    }

    fn purge(&self, messages: &[(Category, PersistedMessage)]) -> Result<(), EndpointError> {
        for category in Category::ALL {
            let keys: Vec<(i64, String)> = messages
                .iter()
                .filter(|(c, _)| *c == category)
                .map(|(_, message)| message.key())
                .collect();
            if !keys.is_empty() {
                self.store.remove(category, &keys)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::transport::MemoryTransport;
    use edgesync_core::{AttributeType, Constraint};
    use edgesync_proto::MessageFormat;
    use std::sync::Weak;

    struct Fixture {
        manager: Arc<DeliveryManager>,
        state: watch::Sender<SessionState>,
        transport: MemoryTransport,
        store: Arc<MemoryStore>,
        node: Node,
    }

    fn fixture(limits: CategoryLimits) -> Fixture {
        let (state, state_rx) = watch::channel(SessionState::Disconnected);
        let transport = MemoryTransport::new();
        let store = Arc::new(MemoryStore::new());
        let manager = Arc::new(DeliveryManager::new(
            TopicScheme::new("dev1"),
            Formats::default(),
            store.clone(),
            limits,
            Arc::new(transport.clone()),
            state_rx,
        ));
        let node = Node::new("n1");
        node.add_attribute("a", Constraint::Measure, AttributeType::NUMBER)
            .unwrap();
        node.add_attribute("b", Constraint::Measure, AttributeType::NUMBER)
            .unwrap();
        let sink: Weak<dyn edgesync_core::ChangeSink> = Weak::<Sink>::new();
        node.register("dev1".into(), sink).unwrap();
        Fixture {
            manager,
            state,
            transport,
            store,
            node,
        }
    }

    struct Sink;

    impl edgesync_core::ChangeSink for Sink {
        fn attribute_changed(&self, _: &Attribute, _: &ChangeOrigin) {}
    }

    fn limits() -> CategoryLimits {
        CategoryLimits {
            update: 10,
            log: 10,
            lifecycle: 10,
        }
    }

    fn change(f: &Fixture, name: &str, value: f64, ts: i64) {
        let attribute = f.node.attribute(name).unwrap();
        attribute.set_value_at(value, ts).unwrap();
        f.manager.attribute_changed(&attribute, &ChangeOrigin::Endpoint);
    }

    #[test]
    fn offline_updates_are_persisted_with_their_timestamp() {
        let f = fixture(limits());
        change(&f, "a", 1.0, 1_000);

        let stored = f.store.messages(Category::Update).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].timestamp, 1_000);
        assert_eq!(stored[0].topic, "@update/dev1/nodes/n1/attributes/a");
    }

    #[test]
    fn category_limit_keeps_newest() {
        let f = fixture(CategoryLimits {
            update: 2,
            ..limits()
        });
        change(&f, "a", 1.0, 1_000);
        change(&f, "a", 2.0, 2_000);
        change(&f, "a", 3.0, 3_000);

        let stamps: Vec<i64> = f
            .store
            .messages(Category::Update)
            .unwrap()
            .iter()
            .map(|m| m.timestamp)
            .collect();
        assert_eq!(stamps, vec![2_000, 3_000]);
    }

    #[test]
    fn cloud_changes_without_correlation_are_not_echoed() {
        let f = fixture(limits());
        let attribute = f.node.attribute("a").unwrap();
        f.manager.attribute_changed(
            &attribute,
            &ChangeOrigin::Cloud {
                correlation_id: None,
            },
        );
        assert_eq!(f.store.count(Category::Update).unwrap(), 0);
    }

    #[test]
    fn transaction_commit_persists_one_message() {
        let f = fixture(limits());
        f.manager.begin_transaction().unwrap();
        assert!(matches!(
            f.manager.begin_transaction(),
            Err(EndpointError::TransactionOpen)
        ));
        change(&f, "a", 1.0, 1_000);
        change(&f, "b", 2.0, 1_001);
        change(&f, "a", 3.0, 1_002);

        assert_eq!(f.manager.commit_transaction().unwrap(), 2);
        let stored = f.store.messages(Category::Update).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].topic, "@transaction/dev1");

        let json: serde_json::Value = serde_json::from_slice(&stored[0].payload).unwrap();
        assert_eq!(json["attributes"]["dev1/nodes/n1/attributes/a"]["value"], 3.0);
        assert!(matches!(
            f.manager.commit_transaction(),
            Err(EndpointError::NoTransaction)
        ));
    }

    #[test]
    fn rollback_discards() {
        let f = fixture(limits());
        f.manager.begin_transaction().unwrap();
        change(&f, "a", 1.0, 1_000);
        assert_eq!(f.manager.rollback_transaction().unwrap(), 1);
        assert_eq!(f.store.count(Category::Update).unwrap(), 0);

        change(&f, "a", 2.0, 2_000);
        assert_eq!(f.store.count(Category::Update).unwrap(), 1);
    }

    #[test]
    fn job_output_is_not_persisted() {
        let f = fixture(limits());
        f.manager.job_output("c1", "line");
        for category in Category::ALL {
            assert_eq!(f.store.count(category).unwrap(), 0);
        }
    }

    #[tokio::test]
    async fn replay_publishes_batch_and_purges() {
        let f = fixture(limits());
        change(&f, "b", 2.0, 2_000);
        change(&f, "a", 1.0, 1_000);
        f.manager.node_removed("old");

        let _events = f.transport.connect(&options()).await.unwrap();
        assert_eq!(f.manager.replay().await.unwrap(), 3);

        let delayed = f.transport.published_to("@delayed/dev1");
        assert_eq!(delayed.len(), 1);
        assert!(delayed[0].retain);
        let json: serde_json::Value = serde_json::from_slice(&delayed[0].payload).unwrap();
        let topics: Vec<&str> = json["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["topic"].as_str().unwrap())
            .collect();
        assert_eq!(
            &topics[..2],
            &[
                "@update/dev1/nodes/n1/attributes/a",
                "@update/dev1/nodes/n1/attributes/b"
            ]
        );
        assert_eq!(topics[2], "@nodeRemoved/dev1/old");
        assert!(json["messages"][2]["data"].is_null());

        for category in Category::ALL {
            assert_eq!(f.store.count(category).unwrap(), 0);
        }
        assert_eq!(f.manager.replay().await.unwrap(), 0);
    }

    #[test]
    fn log_records_with_equal_timestamps_are_all_kept() {
        let f = fixture(limits());
        for message in ["first", "second"] {
            f.manager.log(LogRecordMessage {
                level: "WARN".into(),
                timestamp: 12.5,
                message: message.into(),
                logger_name: "app".into(),
                log_source: String::new(),
            });
        }
        let stored = f.store.messages(Category::Log).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored[0].timestamp < stored[1].timestamp);
    }

    #[tokio::test]
    async fn replay_discards_payloads_of_another_format() {
        let f = fixture(limits());
        change(&f, "a", 1.0, 1_000);
        let b = f.node.attribute("b").unwrap();
        b.set_value_at(2.0, 500).unwrap();
        let cbor = edgesync_proto::CborFormat
            .encode(&OutboundMessage::Attribute(AttributeMessage::from_attribute(&b)))
            .unwrap();
        f.store
            .store(
                Category::Update,
                10,
                &PersistedMessage {
                    timestamp: 500,
                    topic: "@update/dev1/nodes/n1/attributes/b".into(),
                    payload: cbor,
                },
            )
            .unwrap();

        let _events = f.transport.connect(&options()).await.unwrap();
        assert_eq!(f.manager.replay().await.unwrap(), 1);
        assert_eq!(f.store.count(Category::Update).unwrap(), 0);

        let delayed = f.transport.published_to("@delayed/dev1");
        let json: serde_json::Value = serde_json::from_slice(&delayed[0].payload).unwrap();
        assert_eq!(json["messages"].as_array().unwrap().len(), 1);
        assert_eq!(json["messages"][0]["topic"], "@update/dev1/nodes/n1/attributes/a");
    }

    #[tokio::test]
    async fn unreadable_backlog_alone_is_dropped_without_publishing() {
        let f = fixture(limits());
        f.store
            .store(
                Category::Log,
                10,
                &PersistedMessage {
                    timestamp: 1,
                    topic: "@logs/dev1".into(),
                    payload: b"{corrupt".to_vec(),
                },
            )
            .unwrap();

        let _events = f.transport.connect(&options()).await.unwrap();
        assert_eq!(f.manager.replay().await.unwrap(), 0);
        assert_eq!(f.store.count(Category::Log).unwrap(), 0);
        assert!(f.transport.published_to("@delayed/dev1").is_empty());
    }

    #[tokio::test]
    async fn failed_replay_keeps_backlog() {
        let f = fixture(limits());
        change(&f, "a", 1.0, 1_000);

        assert!(f.manager.replay().await.is_err());
        assert_eq!(f.store.count(Category::Update).unwrap(), 1);
    }

    #[tokio::test]
    async fn online_updates_go_through_publisher() {
        let f = fixture(limits());
        let publisher = f.manager.spawn_publisher().unwrap();
        assert!(f.manager.spawn_publisher().is_none());
        let _events = f.transport.connect(&options()).await.unwrap();
        f.state.send_replace(SessionState::Online);

        change(&f, "a", 1.0, 1_000);
        let published = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            f.transport.wait_for("@update/", 1),
        )
        .await
        .unwrap();
        assert_eq!(published[0].topic, "@update/dev1/nodes/n1/attributes/a");
        assert!(published[0].retain);
        assert_eq!(f.store.count(Category::Update).unwrap(), 0);
        publisher.abort();
    }

    fn options() -> crate::transport::ConnectOptions {
        crate::transport::ConnectOptions {
            client_id: "dev1".into(),
            last_will: crate::transport::LastWill {
                topic: "@offline/dev1".into(),
                payload: Vec::new(),
                retain: true,
            },
            keep_alive: std::time::Duration::from_secs(60),
            clean_session: false,
            max_inflight: 10,
        }
    }
}
