//! Broker connection management.

use crate::backoff::Backoff;
use crate::error::BridgeError;
use crate::reader::{Inbound, InboundSource};
use mqtt_bridge_core::{Authentication, ConfigError, Configuration, Connection, Qos, Transport};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, SubscribeFilter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// How long `stop` waits for the disconnect request to be queued.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Request channel capacity between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 100;

/// Largest packet accepted or sent.
const MAX_PACKET_SIZE: usize = 1024 * 1024;

enum ConnectionState {
    Disconnected,
    Connecting { session: u64, client: AsyncClient },
    Connected(AsyncClient),
}

impl ConnectionState {
    fn is_connecting(&self, session: u64) -> bool {
        matches!(self, Self::Connecting { session: current, .. } if *current == session)
    }
}

/// Owns the single broker session.
///
/// All transitions of the session state go through one lock. Each `connect`
/// call owns a session number and only promotes the state to connected if
/// it still holds that session, so a `stop` during the handshake wins.
pub struct ConnectionManager {
    options: MqttOptions,
    subscriptions: Vec<(String, Qos)>,
    state: Mutex<ConnectionState>,
    sessions: AtomicU64,
}

impl ConnectionManager {
    /// Create a manager for the configured broker.
    ///
    /// `subscriptions` are the topics (and QoS) subscribed after every connect.
    ///
    /// # Errors
    ///
    /// Returns error if the broker address is invalid.
    pub fn new(
        config: &Configuration,
        subscriptions: Vec<(String, Qos)>,
    ) -> Result<Self, BridgeError> {
        let options = mqtt_options(&config.connection, config.authentication.as_ref())?;

        Ok(Self {
            options,
            subscriptions,
            state: Mutex::new(ConnectionState::Disconnected),
            sessions: AtomicU64::new(0),
        })
    }

    /// Client identifier presented to the broker.
    #[must_use]
    pub fn client_id(&self) -> String {
        self.options.client_id()
    }

    /// Establish a session, retrying until the broker accepts it.
    ///
    /// Failed attempts are logged and retried after a capped exponential
    /// backoff with jitter. Once connected, every configured topic is
    /// subscribed in one request.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Stopped`] if `stop` ran before the session was
    /// established. Transport failures are retried, never returned.
    pub async fn connect(&self) -> Result<EventStream, BridgeError> {
        let session = self.sessions.fetch_add(1, Ordering::Relaxed);
        let (client, mut eventloop) = {
            let mut state = self.state.lock().await;
            let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAPACITY);
            *state = ConnectionState::Connecting {
                session,
                client: client.clone(),
            };
            (client, eventloop)
        };

        let (host, port) = self.options.broker_address();
        let mut backoff = Backoff::default();

        loop {
            match wait_for_connack(&mut eventloop).await {
                Ok(()) => break,
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::error!(error = %e, host, port, "Unable to connect to broker");
                    tracing::info!(delay_secs = delay.as_secs_f64(), "Retrying connection");
                    tokio::time::sleep(delay).await;

                    if !self.is_connecting(session).await {
                        tracing::info!(host, port, "Connection stopped while retrying");
                        return Err(BridgeError::Stopped);
                    }
                }
            }
        }

        {
            let mut state = self.state.lock().await;
            if !state.is_connecting(session) {
                // dropping the event loop closes the socket
                tracing::info!(host, port, "Connection stopped before it was established");
                return Err(BridgeError::Stopped);
            }
            *state = ConnectionState::Connected(client.clone());
        }

        tracing::info!(host, port, client_id = %self.options.client_id(), "Connected to MQTT broker");

        if !self.subscriptions.is_empty() {
            let filters = self
                .subscriptions
                .iter()
                .map(|(topic, qos)| SubscribeFilter::new(topic.clone(), to_rumqttc_qos(*qos)));

            tracing::info!(topics = self.subscriptions.len(), "Subscribing to payload topics");

            if let Err(e) = client.subscribe_many(filters).await {
                tracing::error!(error = %e, "Failed to request subscriptions");
            }
        }

        Ok(EventStream { eventloop })
    }

    async fn is_connecting(&self, session: u64) -> bool {
        self.state.lock().await.is_connecting(session)
    }

    /// Disconnect and drop the session. Disconnect errors are ignored.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;

        let client = match std::mem::replace(&mut *state, ConnectionState::Disconnected) {
            ConnectionState::Disconnected => return,
            ConnectionState::Connecting { client, .. } | ConnectionState::Connected(client) => {
                client
            }
        };

        match tokio::time::timeout(DISCONNECT_TIMEOUT, client.disconnect()).await {
            Ok(Ok(())) => tracing::info!("Disconnected from MQTT broker"),
            Ok(Err(e)) => tracing::debug!(error = %e, "Disconnect failed"),
            Err(_) => tracing::debug!("Disconnect timed out"),
        }
    }

    /// Whether a session is currently established.
    pub async fn is_connected(&self) -> bool {
        matches!(*self.state.lock().await, ConnectionState::Connected(_))
    }

    /// Handle to the live session.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotConnected`] if no session is established.
    pub async fn client(&self) -> Result<AsyncClient, BridgeError> {
        match &*self.state.lock().await {
            ConnectionState::Connected(client) => Ok(client.clone()),
            ConnectionState::Disconnected | ConnectionState::Connecting { .. } => {
                Err(BridgeError::NotConnected)
            }
        }
    }

    /// Publish a payload on the live session.
    ///
    /// # Errors
    ///
    /// Returns error if no session is established or the request cannot be queued.
    pub async fn publish(
        &self,
        topic: String,
        qos: Qos,
        payload: Vec<u8>,
    ) -> Result<(), BridgeError> {
        let client = self.client().await?;

        tracing::debug!(topic, payload_len = payload.len(), "Publishing message");

        client
            .publish(topic, to_rumqttc_qos(qos), false, payload)
            .await
            .map_err(|e| BridgeError::Publish(e.to_string()))
    }
}

/// Inbound side of a session: the rumqttc event loop.
///
/// The event loop must keep being polled for outgoing publishes and
/// keep-alives to flow, so the reader owns it for the lifetime of the session.
pub struct EventStream {
    eventloop: EventLoop,
}

impl InboundSource for EventStream {
    async fn next_message(&mut self) -> Result<Option<Inbound>, BridgeError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return Ok(Some(Inbound {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    }));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    tracing::info!(pkid = ack.pkid, "Subscription acknowledged");
                }
                Ok(_) => {}
                Err(e) => return Err(BridgeError::Stream(e.to_string())),
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), rumqttc::ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// Build client options from the connection settings.
///
/// # Errors
///
/// Returns error if the broker address is invalid.
pub fn mqtt_options(
    connection: &Connection,
    authentication: Option<&Authentication>,
) -> Result<MqttOptions, ConfigError> {
    let endpoint = connection.endpoint()?;

    let client_id = connection
        .client_id
        .clone()
        .unwrap_or_else(|| format!("mqtt-bridge-{}", Uuid::new_v4()));

    let mut options = MqttOptions::new(client_id, endpoint.host, endpoint.port);
    options.set_keep_alive(Duration::from_secs(connection.keepalive));
    options.set_max_packet_size(MAX_PACKET_SIZE, MAX_PACKET_SIZE);

    if endpoint.transport == Transport::Tls {
        options.set_transport(rumqttc::Transport::tls_with_default_config());
    }

    if let Some(credentials) = authentication.and_then(|auth| auth.credentials.as_ref()) {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    Ok(options)
}

fn to_rumqttc_qos(qos: Qos) -> rumqttc::QoS {
    match qos {
        Qos::AtMostOnce => rumqttc::QoS::AtMostOnce,
        Qos::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
        Qos::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

    /// How the fake broker answers one incoming CONNECT.
    #[derive(Debug, Clone, Copy)]
    enum Handshake {
        Accept,
        Delay(Duration),
        Drop,
    }

    #[derive(Debug, PartialEq, Eq)]
    enum BrokerEvent {
        Connect,
        Subscribe(Vec<(String, u8)>),
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    fn parse_subscribe(body: &[u8]) -> Vec<(String, u8)> {
        let mut filters = Vec::new();
        let mut rest = &body[2..];
        while rest.len() >= 3 {
            let len = usize::from(u16::from_be_bytes([rest[0], rest[1]]));
            let topic = String::from_utf8(rest[2..2 + len].to_vec()).unwrap();
            filters.push((topic, rest[2 + len] & 0x03));
            rest = &rest[3 + len..];
        }
        filters
    }

    async fn serve(
        mut stream: TcpStream,
        handshake: Handshake,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> std::io::Result<()> {
        let (header, _) = read_packet(&mut stream).await?;
        assert_eq!(header, 0x10, "expected CONNECT");
        let _ = events.send(BrokerEvent::Connect);

        match handshake {
            Handshake::Drop => return Ok(()),
            Handshake::Delay(delay) => tokio::time::sleep(delay).await,
            Handshake::Accept => {}
        }
        stream.write_all(&CONNACK).await?;

        loop {
            let (header, body) = read_packet(&mut stream).await?;
            match header {
                0x82 => {
                    let filters = parse_subscribe(&body);
                    let len = u8::try_from(2 + filters.len()).unwrap();
                    let mut suback = vec![0x90, len, body[0], body[1]];
                    suback.extend(filters.iter().map(|(_, qos)| *qos));
                    let _ = events.send(BrokerEvent::Subscribe(filters));
                    stream.write_all(&suback).await?;
                }
                0xC0 => stream.write_all(&[0xD0, 0x00]).await?,
                0xE0 => return Ok(()),
                _ => {}
            }
        }
    }

    /// Accept connections forever, answering the n-th CONNECT with
    /// `script[n]` and with [`Handshake::Accept`] once the script runs out.
    async fn fake_broker(script: Vec<Handshake>) -> (u16, mpsc::UnboundedReceiver<BrokerEvent>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (events, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut script = script.into_iter();
            while let Ok((stream, _)) = listener.accept().await {
                let handshake = script.next().unwrap_or(Handshake::Accept);
                tokio::spawn(serve(stream, handshake, events.clone()));
            }
        });

        (port, rx)
    }

    fn local_manager(port: u16, subscriptions: Vec<(String, Qos)>) -> ConnectionManager {
        let config = config(json!({"ip": "127.0.0.1", "port": port}));
        ConnectionManager::new(&config, subscriptions).unwrap()
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<BrokerEvent>) -> BrokerEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timeout waiting for broker event")
            .expect("broker stopped")
    }

    fn config(connection: serde_json::Value) -> Configuration {
        Configuration::from_json_str(
            &json!({
                "connection": connection,
                "payloads": [{"topic": "a", "qos": 2}],
                "metrics_map": []
            })
            .to_string(),
        )
        .unwrap()
    }

    #[test]
    fn options_from_connection() {
        let config = config(json!({"ip": "tcp://broker.local", "port": 1884, "client_id": "bridge-1", "keepalive": 30}));
        let options = mqtt_options(&config.connection, None).unwrap();

        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1884));
        assert_eq!(options.client_id(), "bridge-1");
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(options.credentials().is_none());
        assert!(matches!(options.transport(), rumqttc::Transport::Tcp));
    }

    #[test]
    fn generated_client_id() {
        let config = config(json!({"ip": "localhost"}));
        let first = mqtt_options(&config.connection, None).unwrap().client_id();
        let second = mqtt_options(&config.connection, None).unwrap().client_id();

        assert!(first.starts_with("mqtt-bridge-"));
        assert_ne!(first, second);
    }

    #[test]
    fn tls_and_credentials() {
        let mut config = config(json!({"ip": "ssl://broker.local", "port": 8883}));
        config.authentication = serde_json::from_value(json!({
            "type": "credentials",
            "credentials": {"username": "user", "password": "secret"}
        }))
        .unwrap();

        let options = mqtt_options(&config.connection, config.authentication.as_ref()).unwrap();

        assert!(matches!(options.transport(), rumqttc::Transport::Tls(_)));
        assert_eq!(
            options.credentials(),
            Some(("user".to_string(), "secret".to_string()))
        );
    }

    #[tokio::test]
    async fn session_access_without_connection_fails() {
        let config = config(json!({"ip": "localhost"}));
        let manager =
            ConnectionManager::new(&config, vec![("a".to_string(), Qos::ExactlyOnce)]).unwrap();

        assert!(!manager.is_connected().await);
        assert!(matches!(manager.client().await, Err(BridgeError::NotConnected)));
        assert!(matches!(
            manager.publish("a".to_string(), Qos::AtMostOnce, b"{}".to_vec()).await,
            Err(BridgeError::NotConnected)
        ));

        // stopping an idle manager is a no-op
        manager.stop().await;
        assert!(!manager.is_connected().await);
    }

    #[tokio::test]
    async fn connect_retries_until_handshake_succeeds() {
        let (port, mut events) = fake_broker(vec![Handshake::Drop, Handshake::Accept]).await;
        let manager = local_manager(port, Vec::new());

        let stream = tokio::time::timeout(Duration::from_secs(5), manager.connect())
            .await
            .expect("connect did not retry")
            .unwrap();

        assert!(manager.is_connected().await);
        assert_eq!(next_event(&mut events).await, BrokerEvent::Connect);
        assert_eq!(next_event(&mut events).await, BrokerEvent::Connect);
        drop(stream);
    }

    #[tokio::test]
    async fn connect_subscribes_all_topics_in_one_request() {
        let (port, mut events) = fake_broker(Vec::new()).await;
        let manager = local_manager(
            port,
            vec![
                ("sensors/temp".to_string(), Qos::ExactlyOnce),
                ("sensors/+/pressure".to_string(), Qos::AtLeastOnce),
                ("out/x".to_string(), Qos::AtMostOnce),
            ],
        );

        let mut stream = manager.connect().await.unwrap();
        // the event loop carries the SUBSCRIBE out
        let poller = tokio::spawn(async move { while stream.next_message().await.is_ok() {} });

        assert_eq!(next_event(&mut events).await, BrokerEvent::Connect);
        assert_eq!(
            next_event(&mut events).await,
            BrokerEvent::Subscribe(vec![
                ("sensors/temp".to_string(), 2),
                ("sensors/+/pressure".to_string(), 1),
                ("out/x".to_string(), 0),
            ])
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events.try_recv().is_err());
        poller.abort();
    }

    #[tokio::test]
    async fn no_subscribe_without_topics() {
        let (port, mut events) = fake_broker(Vec::new()).await;
        let manager = local_manager(port, Vec::new());

        let mut stream = manager.connect().await.unwrap();
        let poller = tokio::spawn(async move { while stream.next_message().await.is_ok() {} });

        assert_eq!(next_event(&mut events).await, BrokerEvent::Connect);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(events.try_recv().is_err());
        poller.abort();
    }

    #[tokio::test]
    async fn stop_then_reconnect_creates_new_session() {
        let (port, mut events) = fake_broker(Vec::new()).await;
        let manager = local_manager(port, Vec::new());

        let first = manager.connect().await.unwrap();
        assert!(manager.is_connected().await);
        assert!(manager.client().await.is_ok());

        manager.stop().await;
        assert!(!manager.is_connected().await);
        assert!(matches!(manager.client().await, Err(BridgeError::NotConnected)));
        drop(first);

        let second = manager.connect().await.unwrap();
        assert!(manager.is_connected().await);
        assert_eq!(next_event(&mut events).await, BrokerEvent::Connect);
        assert_eq!(next_event(&mut events).await, BrokerEvent::Connect);
        drop(second);
    }

    #[tokio::test]
    async fn stop_during_handshake_wins() {
        let (port, mut events) =
            fake_broker(vec![Handshake::Delay(Duration::from_millis(300))]).await;
        let manager = Arc::new(local_manager(port, Vec::new()));

        let connecting = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.connect().await.map(|_| ()) }
        });

        assert_eq!(next_event(&mut events).await, BrokerEvent::Connect);
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.stop().await;
        assert!(!manager.is_connected().await);

        let result = tokio::time::timeout(Duration::from_secs(2), connecting)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BridgeError::Stopped)));
        assert!(!manager.is_connected().await);
        assert!(matches!(manager.client().await, Err(BridgeError::NotConnected)));
    }
}
