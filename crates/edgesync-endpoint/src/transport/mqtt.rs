//! MQTT transport over `rumqttc`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use url::Url;

use super::{ConnectOptions, Transport, TransportEvent};
use crate::error::TransportError;

const DEFAULT_PORT: u16 = 1883;

/// Publishes waiting for their `PUBACK`.
///
/// Requests are queued in the order they are handed to the client and get
/// their packet id when the event loop sends them.
#[derive(Default)]
struct Acks {
    queued: VecDeque<oneshot::Sender<()>>,
    inflight: HashMap<u16, oneshot::Sender<()>>,
}

impl Acks {
    fn queue(&mut self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queued.push_back(tx);
        rx
    }

    fn sent(&mut self, pkid: u16) {
        if let Some(tx) = self.queued.pop_front() {
            self.inflight.insert(pkid, tx);
        }
    }

    fn acked(&mut self, pkid: u16) {
        if let Some(tx) = self.inflight.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    /// Fail every waiting publish.
    fn abandon(&mut self) {
        self.queued.clear();
        self.inflight.clear();
    }
}

struct Session {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<Acks>>,
    eventloop: JoinHandle<()>,
}

/// MQTT transport.
pub struct MqttTransport {
    host: String,
    port: u16,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    /// Create a transport for the broker at `uri`.
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid.
    pub fn new(uri: &str) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(uri)?;
        Ok(Self {
            host,
            port,
            session: Mutex::new(None),
        })
    }

    fn client(&self) -> Result<(AsyncClient, Arc<Mutex<Acks>>), TransportError> {
        self.session
            .lock()
            .as_ref()
            .filter(|session| session.connected.load(Ordering::Acquire))
            .map(|session| (session.client.clone(), Arc::clone(&session.acks)))
            .ok_or(TransportError::NotConnected)
    }

    fn drop_session(&self) {
        if let Some(session) = self.session.lock().take() {
            session.eventloop.abort();
            session.connected.store(false, Ordering::Release);
            session.acks.lock().abandon();
        }
    }
}

/// Tears a half-open session down unless the connect completes.
struct PendingSession<'a>(Option<&'a MqttTransport>);

impl PendingSession<'_> {
    fn established(mut self) {
        self.0 = None;
    }
}

impl Drop for PendingSession<'_> {
    fn drop(&mut self) {
        if let Some(transport) = self.0 {
            transport.drop_session();
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, options: &ConnectOptions) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        self.drop_session();

        let mut mqtt_options = MqttOptions::new(&options.client_id, self.host.clone(), self.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(options.clean_session);
        mqtt_options.set_inflight(options.max_inflight);
        mqtt_options.set_last_will(rumqttc::LastWill::new(
            &options.last_will.topic,
            options.last_will.payload.clone(),
            QoS::AtLeastOnce,
            options.last_will.retain,
        ));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);
        let (events_tx, events_rx) = mpsc::channel(100);
        let (ready_tx, ready_rx) = oneshot::channel();
        let connected = Arc::new(AtomicBool::new(false));
        let acks = Arc::new(Mutex::new(Acks::default()));

        tracing::info!(host = %self.host, port = self.port, client_id = %options.client_id, "Connecting to MQTT broker");

        let handle = tokio::spawn(drive(
            eventloop,
            Arc::clone(&connected),
            Arc::clone(&acks),
            ready_tx,
            events_tx,
        ));
        *self.session.lock() = Some(Session {
            client,
            connected,
            acks,
            eventloop: handle,
        });
        let pending = PendingSession(Some(self));

        match ready_rx.await {
            Ok(Ok(())) => {
                pending.established();
                Ok(events_rx)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::Connect("event loop stopped".into())),
        }
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        let (client, acks) = self.client()?;

        tracing::debug!(topic, payload_len = payload.len(), retain, "Publishing message");

        let acked = {
            let mut acks = acks.lock();
            client
                .try_publish(topic, QoS::AtLeastOnce, retain, payload)
                .map_err(|e| TransportError::Publish(e.to_string()))?;
            acks.queue()
        };
        acked
            .await
            .map_err(|_| TransportError::Publish("session closed before acknowledgement".into()))
    }

    async fn subscribe(&self, filter: &str) -> Result<(), TransportError> {
        let (client, _) = self.client()?;

        tracing::info!(topic = filter, "Subscribing to topic");

        client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client = self.client().ok().map(|(client, _)| client);
        let result = match client {
            Some(client) => client
                .disconnect()
                .await
                .map_err(|e| TransportError::Connect(e.to_string())),
            None => Ok(()),
        };
        // Give the event loop a chance to flush the DISCONNECT packet.
        tokio::task::yield_now().await;
        self.drop_session();
        result
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.drop_session();
    }
}

async fn drive(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    acks: Arc<Mutex<Acks>>,
    ready: oneshot::Sender<Result<(), TransportError>>,
    events: mpsc::Sender<TransportEvent>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    tracing::info!("Connected to MQTT broker");
                    connected.store(true, Ordering::Release);
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                } else {
                    let reason = format!("{:?}", ack.code);
                    tracing::warn!(reason = %reason, "MQTT broker refused connection");
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Err(TransportError::Connect(reason)));
                    }
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let topic = publish.topic.clone();
                let payload = publish.payload.to_vec();
                tracing::debug!(topic, payload_len = payload.len(), "Received MQTT message");
                if events
                    .send(TransportEvent::Message { topic, payload })
                    .await
                    .is_err()
                {
                    tracing::debug!("Event receiver dropped, stopping MQTT event loop");
                    break;
                }
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => acks.lock().sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => acks.lock().acked(ack.pkid),
            Ok(Event::Incoming(Packet::SubAck(_))) => {
                tracing::debug!("Subscription acknowledged");
            }
            Ok(_) => {}
            Err(e) => {
                connected.store(false, Ordering::Release);
                acks.lock().abandon();
                match ready.take() {
                    Some(ready) => {
                        let _ = ready.send(Err(TransportError::Connect(e.to_string())));
                    }
                    None => {
                        tracing::warn!(error = %e, "MQTT connection lost");
                        let _ = events.send(TransportEvent::ConnectionLost(e.to_string())).await;
                    }
                }
                break;
            }
        }
    }
    connected.store(false, Ordering::Release);
    acks.lock().abandon();
}

/// Parse MQTT URL into host and port.
pub fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    if input.contains("://") {
        let url = Url::parse(input)
            .map_err(|e| TransportError::InvalidBrokerUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(TransportError::InvalidBrokerUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_PORT);

        return Ok((host.to_string(), port));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::InvalidBrokerUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => DEFAULT_PORT,
        Some(port) => port.parse().map_err(|_| {
            TransportError::InvalidBrokerUrl(format!("{input}: invalid port '{port}'"))
        })?,
    };
    if parts.next().is_some() {
        return Err(TransportError::InvalidBrokerUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), port))
}
