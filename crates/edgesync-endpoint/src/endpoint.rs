//! The endpoint aggregate.
//!
//! An [`Endpoint`] owns the registered nodes, the delivery manager and the
//! session supervisor. Attribute changes on its nodes flow into delivery
//! through [`ChangeSink`]; inbound set requests flow back into the tree through
//! the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use edgesync_core::{topic, Attribute, ChangeOrigin, ChangeSink, Element, ModelError, Node};
use edgesync_proto::{EndpointMessage, Formats, LogRecordMessage, OutboundMessage, TopicScheme};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::config::EndpointConfig;
use crate::delivery::DeliveryManager;
use crate::error::EndpointError;
use crate::jobs::{JobOutput, JobsManager};
use crate::logging::{CloudLogHandle, LogLevel, LogSink};
use crate::persistence::{open_store, Category, MessageStore, LOG_LEVEL_PROPERTY};
use crate::supervisor::{self, EndpointListener, SessionState, SupervisorHandle};
use crate::transport::{ConnectOptions, LastWill, MqttTransport, Transport};

/// State shared between the endpoint and its tasks.
pub(crate) struct Shared {
    pub(crate) id: Arc<str>,
    pub(crate) config: EndpointConfig,
    pub(crate) topics: TopicScheme,
    pub(crate) formats: Formats,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) delivery: Arc<DeliveryManager>,
    pub(crate) jobs: JobsManager,
    pub(crate) log_handle: Option<CloudLogHandle>,
    nodes: RwLock<IndexMap<String, Node>>,
    listeners: RwLock<Vec<Arc<dyn EndpointListener>>>,
    state: watch::Sender<SessionState>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<AbortHandle>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl Shared {
    pub(crate) fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            client_id: self.id.to_string(),
            last_will: LastWill {
                topic: self.topics.offline(),
                payload: Vec::new(),
                retain: true,
            },
            keep_alive: self.config.keep_alive,
            clean_session: self.config.clean_session,
            max_inflight: self.config.max_inflight,
        }
    }

    pub(crate) fn birth_message(&self) -> Result<Vec<u8>, EndpointError> {
        let message = {
            let nodes = self.nodes.read();
            EndpointMessage::new(nodes.values(), self.formats.names())
        };
        Ok(self
            .formats
            .primary()
            .encode(&OutboundMessage::Endpoint(message))?)
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "Session state changed");
        }
    }

    /// Enter `Disconnected`, notifying listeners if the endpoint was online.
    pub(crate) fn leave_online(&self) {
        let previous = self.state.send_replace(SessionState::Disconnected);
        if previous == SessionState::Online {
            tracing::info!("Endpoint offline");
            for listener in self.listeners() {
                listener.offline(&self.id);
            }
        }
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn EndpointListener>> {
        self.listeners.read().clone()
    }

    pub(crate) fn track(&self, task: AbortHandle) {
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
    }

    pub(crate) fn locate(&self, path: &str) -> Result<Element, ModelError> {
        topic::resolve(&self.id, path, |name| self.nodes.read().get(name).cloned())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn abort_tasks(&self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn close_nodes(&self) {
        let nodes: Vec<Node> = self.nodes.write().drain(..).map(|(_, node)| node).collect();
        for node in nodes {
            node.close();
        }
    }
}

impl ChangeSink for Shared {
    fn attribute_changed(&self, attribute: &Attribute, origin: &ChangeOrigin) {
        if !self.is_closed() {
            self.delivery.attribute_changed(attribute, origin);
        }
    }
}

impl LogSink for Shared {
    fn ship(&self, record: LogRecordMessage) {
        if !self.is_closed() {
            self.delivery.log(record);
        }
    }
}

impl JobOutput for Shared {
    fn line(&self, correlation_id: &str, line: &str) {
        self.delivery.job_output(correlation_id, line);
    }
}

/// Assembles an [`Endpoint`].
///
/// Anything not injected is built from the configuration: the MQTT transport
/// for `host_uri`, the configured store and the configured primary format.
pub struct EndpointBuilder {
    config: EndpointConfig,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn MessageStore>>,
    formats: Option<Formats>,
    listeners: Vec<Arc<dyn EndpointListener>>,
    log_handle: Option<CloudLogHandle>,
}

impl EndpointBuilder {
    /// Use `transport` instead of MQTT.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Use `store` instead of the configured one.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `formats` instead of the configured one.
    #[must_use]
    pub fn formats(mut self, formats: Formats) -> Self {
        self.formats = Some(formats);
        self
    }

    /// Replace the configuration.
    #[must_use]
    pub fn config(mut self, config: EndpointConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a session listener.
    #[must_use]
    pub fn listener(mut self, listener: Arc<dyn EndpointListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Ship application logs through `handle`'s layer.
    #[must_use]
    pub fn cloud_logging(mut self, handle: CloudLogHandle) -> Self {
        self.log_handle = Some(handle);
        self
    }

    /// Build the endpoint. The persisted log level, if any, is restored.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL, store or message format in the
    /// configuration is invalid.
    pub fn build(self) -> Result<Endpoint, EndpointError> {
        let config = self.config;
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(MqttTransport::new(&config.host_uri)?),
        };
        let store = match self.store {
            Some(store) => store,
            None => open_store(&config.persistence)?,
        };
        let formats = match self.formats {
            Some(formats) => formats,
            None => configured_formats(&config.message_format)?,
        };

        let id: Arc<str> = Arc::from(config.endpoint_id.as_str());
        let topics = TopicScheme::new(&*id);
        let (state, state_rx) = watch::channel(SessionState::Disconnected);
        let delivery = Arc::new(DeliveryManager::new(
            topics.clone(),
            formats.clone(),
            Arc::clone(&store),
            config.persistence.limits,
            Arc::clone(&transport),
            state_rx,
        ));

        if let Some(handle) = &self.log_handle {
            match store.property(LOG_LEVEL_PROPERTY) {
                Ok(Some(saved)) => match saved.parse::<LogLevel>() {
                    Ok(level) => handle.set_level(level),
                    Err(e) => tracing::warn!(error = %e, "Ignoring persisted log level"),
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Failed to read persisted log level"),
            }
        }

        let (shutdown, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            id,
            jobs: JobsManager::new(config.jobs_folder.clone()),
            config,
            topics,
            formats,
            transport,
            delivery,
            log_handle: self.log_handle,
            nodes: RwLock::new(IndexMap::new()),
            listeners: RwLock::new(self.listeners),
            state,
            shutdown: Arc::new(shutdown),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        if let Some(handle) = &shared.log_handle {
            let sink: Weak<dyn LogSink> = Arc::downgrade(&shared) as Weak<dyn LogSink>;
            handle.attach(sink);
        }
        tracing::info!(endpoint = %shared.id, transport = shared.transport.name(), "Endpoint created");
        Ok(Endpoint { shared })
    }
}

fn configured_formats(primary: &str) -> Result<Formats, EndpointError> {
    let primary = Formats::builtin(primary)?;
    let secondary = if primary.name() == "json" { "cbor" } else { "json" };
    Ok(Formats::new(primary).with(Formats::builtin(secondary)?))
}

/// A device or gateway mirrored to the broker.
pub struct Endpoint {
    shared: Arc<Shared>,
}

impl Endpoint {
    /// Start assembling an endpoint with default configuration.
    #[must_use]
    pub fn builder(endpoint_id: impl Into<String>) -> EndpointBuilder {
        EndpointBuilder {
            config: EndpointConfig::new(endpoint_id),
            transport: None,
            store: None,
            formats: None,
            listeners: Vec::new(),
            log_handle: None,
        }
    }

    /// Build an endpoint entirely from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the store cannot be
    /// opened.
    pub fn from_config(config: EndpointConfig) -> Result<Self, EndpointError> {
        let id = config.endpoint_id.clone();
        Self::builder(id).config(config).build()
    }

    /// Endpoint identity.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Register a node. Its structure, interfaces and static values are
    /// frozen from now on. A started endpoint announces it on `@nodeAdded`.
    ///
    /// # Errors
    ///
    /// Returns error if a node of the same name exists, the node was
    /// registered before, or the endpoint is closed.
    pub fn add_node(&self, node: &Node) -> Result<(), EndpointError> {
        if self.shared.is_closed() {
            return Err(EndpointError::Closed);
        }
        let name = node.name();
        {
            let mut nodes = self.shared.nodes.write();
            if nodes.contains_key(&name) {
                return Err(ModelError::DuplicateName { kind: "node", name }.into());
            }
            let sink: Weak<dyn ChangeSink> = Arc::downgrade(&self.shared) as Weak<dyn ChangeSink>;
            node.register(Arc::clone(&self.shared.id), sink)?;
            nodes.insert(name.clone(), node.clone());
        }
        tracing::info!(node = %name, "Node added");
        if self.shared.started.load(Ordering::Acquire) {
            self.shared.delivery.node_added(node);
        }
        Ok(())
    }

    /// Unregister and close a node. A started endpoint announces it on
    /// `@nodeRemoved`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::PathNotFound`] if no such node exists.
    pub fn remove_node(&self, name: &str) -> Result<(), EndpointError> {
        let node = self
            .shared
            .nodes
            .write()
            .shift_remove(name)
            .ok_or_else(|| ModelError::PathNotFound(name.to_string()))?;
        node.close();
        tracing::info!(node = %name, "Node removed");
        if self.shared.started.load(Ordering::Acquire) && !self.shared.is_closed() {
            self.shared.delivery.node_removed(name);
        }
        Ok(())
    }

    /// Registered node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<Node> {
        self.shared.nodes.read().get(name).cloned()
    }

    /// Registered nodes in registration order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.shared.nodes.read().values().cloned().collect()
    }

    /// Resolve a full address such as `dev1/nodes/n1/objects/o1/attributes/a`.
    ///
    /// # Errors
    ///
    /// Returns [`ModelError::PathNotFound`] unless the path names a live element.
    pub fn locate(&self, path: &str) -> Result<Element, ModelError> {
        self.shared.locate(path)
    }

    /// Start the session supervisor and the outbound publisher.
    ///
    /// Must be called within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::AlreadyStarted`] on a second call and
    /// [`EndpointError::Closed`] after [`Endpoint::close`].
    pub fn start(&self) -> Result<SupervisorHandle, EndpointError> {
        if self.shared.is_closed() {
            return Err(EndpointError::Closed);
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Err(EndpointError::AlreadyStarted);
        }
        if let Some(publisher) = self.shared.delivery.spawn_publisher() {
            self.shared.track(publisher.abort_handle());
        }
        let task = tokio::spawn(supervisor::run(
            Arc::clone(&self.shared),
            self.shared.shutdown.subscribe(),
        ));
        self.shared.track(task.abort_handle());
        tracing::info!(endpoint = %self.shared.id, "Endpoint started");
        Ok(SupervisorHandle::new(Arc::clone(&self.shared.shutdown), task))
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// Watch session state transitions.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Register a session listener.
    pub fn add_listener(&self, listener: Arc<dyn EndpointListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Open a transaction: endpoint-side changes are collected until commit
    /// or rollback.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::TransactionOpen`] if one is already open.
    pub fn begin_transaction(&self) -> Result<(), EndpointError> {
        if self.shared.is_closed() {
            return Err(EndpointError::Closed);
        }
        self.shared.delivery.begin_transaction()
    }

    /// Send the collected changes as one message. Returns the number of
    /// attributes it carried; an empty transaction sends nothing.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NoTransaction`] if none is open.
    pub fn commit_transaction(&self) -> Result<usize, EndpointError> {
        self.shared.delivery.commit_transaction()
    }

    /// Discard the collected changes. Returns how many were discarded.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::NoTransaction`] if none is open.
    pub fn rollback_transaction(&self) -> Result<usize, EndpointError> {
        self.shared.delivery.rollback_transaction()
    }

    /// Number of messages waiting in a category's queue.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    pub fn pending_messages(&self, category: Category) -> Result<usize, EndpointError> {
        Ok(self.shared.delivery.store().count(category)?)
    }

    /// Stop all tasks, end the session and close every node.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to disconnect.
    pub async fn close(&self) -> Result<(), EndpointError> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(endpoint = %self.shared.id, "Closing endpoint");
        self.shared.abort_tasks();
        if let Some(handle) = &self.shared.log_handle {
            handle.detach();
        }
        let disconnected = self.shared.transport.disconnect().await;
        self.shared.leave_online();
        self.shared.close_nodes();
        disconnected.map_err(EndpointError::from)
    }

    /// Whether [`Endpoint::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.abort_tasks();
            if let Some(handle) = &self.shared.log_handle {
                handle.detach();
            }
            self.shared.close_nodes();
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .field("nodes", &self.shared.nodes.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
