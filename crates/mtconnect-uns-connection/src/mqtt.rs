//! MQTT transport built on `rumqttc`.

use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS,
};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use url::Url;

/// Default MQTT port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Retained payload marking a device or node online.
const ONLINE_PAYLOAD: &[u8] = br#"{"status":"ONLINE"}"#;

/// Retained payload marking a device or node offline.
const OFFLINE_PAYLOAD: &[u8] = br#"{"status":"OFFLINE"}"#;

/// Pause before polling the event loop again after an error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Time the event loop gets to flush outgoing packets on disconnect.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Configuration for an MQTT transport.
#[derive(Debug, Clone)]
pub struct MqttTransportConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client ID for the MQTT connection
    pub client_id: String,
    /// Keep-alive interval
    pub keep_alive: Duration,
    /// QoS used for every publish
    pub qos: QoS,
    /// Capacity of the client request queue
    pub request_capacity: usize,
    /// Topic carrying the retained online/offline state of this client,
    /// also used as its last will
    pub node_state_topic: Option<String>,
}

impl Default for MqttTransportConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_MQTT_PORT,
            client_id: "mtconnect-uns".to_string(),
            keep_alive: Duration::from_secs(30),
            qos: QoS::AtLeastOnce,
            request_capacity: 100,
            node_state_topic: None,
        }
    }
}

impl MqttTransportConfig {
    /// Create a configuration for the given broker.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, client_id: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    /// Create a configuration from a broker URL (`tcp://host:port`,
    /// `mqtt://host` or `host[:port]`).
    ///
    /// # Errors
    ///
    /// Returns error if the URL is invalid.
    pub fn from_url(url: &str, client_id: impl Into<String>) -> Result<Self, TransportError> {
        let (host, port) = parse_mqtt_url(url)?;
        Ok(Self::new(host, port, client_id))
    }
}

struct Session {
    client: AsyncClient,
    eventloop: EventLoopTask,
}

/// Event loop task that is aborted when dropped.
///
/// The task owns the broker socket, so dropping a session on any path,
/// including a cancelled `disconnect`, closes it.
struct EventLoopTask(JoinHandle<()>);

impl Drop for EventLoopTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// MQTT transport.
///
/// Announcing a topic root publishes a retained `ONLINE` birth message on
/// the root itself; disconnecting replaces it with `OFFLINE`.
pub struct MqttTransport {
    config: MqttTransportConfig,
    session: Mutex<Option<Session>>,
    topic_roots: Mutex<Vec<String>>,
}

impl MqttTransport {
    /// Create a transport; nothing is sent until [`Transport::connect`].
    #[must_use]
    pub fn new(config: MqttTransportConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            topic_roots: Mutex::new(Vec::new()),
        }
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client(&self) -> Result<AsyncClient, TransportError> {
        self.session()
            .as_ref()
            .map(|session| session.client.clone())
            .ok_or(TransportError::NotConnected)
    }

    async fn send_retained(
        &self,
        client: &AsyncClient,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        client
            .publish(topic, self.config.qos, true, payload.to_vec())
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    /// Queue a retained message without waiting for room in the request
    /// queue.
    fn try_send_retained(
        &self,
        client: &AsyncClient,
        topic: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        client
            .try_publish(topic, self.config.qos, true, payload.to_vec())
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn endpoint(&self) -> String {
        format!("mqtt://{}:{}", self.config.host, self.config.port)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut mqtt_options =
            MqttOptions::new(&self.config.client_id, &self.config.host, self.config.port);
        mqtt_options.set_keep_alive(self.config.keep_alive);
        if let Some(topic) = &self.config.node_state_topic {
            let will = LastWill::new(topic, OFFLINE_PAYLOAD, self.config.qos, true);
            mqtt_options.set_last_will(will);
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, self.config.request_capacity);
        let (connack_tx, connack_rx) = oneshot::channel();
        let eventloop = EventLoopTask(tokio::spawn(drive_eventloop(eventloop, connack_tx)));

        // Stored before waiting so a timed-out connect can still be torn down.
        let previous = self.session().replace(Session {
            client: client.clone(),
            eventloop,
        });
        drop(previous);

        match connack_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return Err(TransportError::Connect(reason)),
            Err(_) => {
                return Err(TransportError::Connect(
                    "event loop ended before CONNACK".to_string(),
                ))
            }
        }

        if let Some(topic) = &self.config.node_state_topic {
            self.send_retained(&client, topic, ONLINE_PAYLOAD).await?;
        }

        Ok(())
    }

    async fn add_topic_interest(&self, topic_root: &str) -> Result<(), TransportError> {
        let client = self.client()?;

        tracing::info!(topic_root, "Announcing device");
        self.send_retained(&client, topic_root, ONLINE_PAYLOAD)
            .await?;

        let mut roots = self
            .topic_roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !roots.iter().any(|root| root == topic_root) {
            roots.push(topic_root.to_string());
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let client = self.client()?;

        tracing::debug!(topic, payload_len = payload.len(), "Publishing observation");

        client
            .publish(topic, self.config.qos, false, payload.to_vec())
            .await
            .map_err(|e| TransportError::Rejected(e.to_string()))
    }

    /// Queue the offline messages and the DISCONNECT without blocking, then
    /// give the event loop a short grace period to flush them.
    ///
    /// The session is gone once this returns or is cancelled; if the request
    /// queue is full the event loop is aborted instead of flushed.
    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(session) = self.session().take() else {
            return Ok(());
        };
        let Session {
            client,
            mut eventloop,
        } = session;

        let roots = std::mem::take(
            &mut *self
                .topic_roots
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for root in &roots {
            if let Err(err) = self.try_send_retained(&client, root, OFFLINE_PAYLOAD) {
                tracing::warn!(topic_root = %root, error = %err, "Failed to mark device offline");
            }
        }
        if let Some(topic) = &self.config.node_state_topic {
            if let Err(err) = self.try_send_retained(&client, topic, OFFLINE_PAYLOAD) {
                tracing::warn!(topic = %topic, error = %err, "Failed to mark node offline");
            }
        }

        client
            .try_disconnect()
            .map_err(|e| TransportError::Disconnect(e.to_string()))?;

        if tokio::time::timeout(DISCONNECT_GRACE, &mut eventloop.0)
            .await
            .is_err()
        {
            tracing::warn!("MQTT event loop did not flush in time, aborting");
        }

        Ok(())
    }
}

/// Poll the event loop until the client disconnects.
///
/// The first CONNACK, or the first error before it, is reported through
/// `connack`. Errors after that are logged and polling resumes after a
/// pause, which lets `rumqttc` reconnect.
async fn drive_eventloop(
    mut eventloop: EventLoop,
    connack: oneshot::Sender<Result<(), String>>,
) {
    let mut connack = Some(connack);

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = if ack.code == ConnectReturnCode::Success {
                    tracing::info!("Connected to MQTT broker");
                    Ok(())
                } else {
                    Err(format!("broker refused connection: {:?}", ack.code))
                };
                if let Some(tx) = connack.take() {
                    let refused = result.is_err();
                    let _ = tx.send(result);
                    if refused {
                        break;
                    }
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                tracing::debug!("MQTT disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if let Some(tx) = connack.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }
                tracing::error!(error = %e, "MQTT error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

/// Parse MQTT URL into host and port.
///
/// # Errors
///
/// Returns error if the scheme is not `tcp`/`mqtt`, the host is missing, or
/// the port is invalid or zero.
pub fn parse_mqtt_url(input: &str) -> Result<(String, u16), TransportError> {
    if input.contains("://") {
        let url =
            Url::parse(input).map_err(|e| TransportError::InvalidUrl(format!("{input}: {e}")))?;

        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => {
                return Err(TransportError::InvalidUrl(format!(
                    "{input}: unsupported scheme '{scheme}'"
                )));
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidUrl(format!("{input}: missing host")))?;
        let port = url.port().unwrap_or(DEFAULT_MQTT_PORT);

        return Ok((host.to_string(), nonzero_port(input, port)?));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::InvalidUrl(format!("{input}: missing host")))?;
    let port = match parts.next() {
        None => DEFAULT_MQTT_PORT,
        Some(port) => port
            .parse()
            .map_err(|_| TransportError::InvalidUrl(format!("{input}: invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(TransportError::InvalidUrl(format!(
            "{input}: too many ':' separators"
        )));
    }

    Ok((host.to_string(), nonzero_port(input, port)?))
}

fn nonzero_port(input: &str, port: u16) -> Result<u16, TransportError> {
    if port == 0 {
        return Err(TransportError::InvalidUrl(format!(
            "{input}: port must be between 1 and 65535"
        )));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Broker that accepts one client, answers its CONNECT and then reads
    /// without acknowledging anything. The receiver resolves once the client
    /// socket is closed.
    async fn stalled_broker() -> (u16, oneshot::Receiver<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (closed_tx, closed_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0_u8; 4096];
            let mut connected = false;
            loop {
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) if !connected => {
                        connected = true;
                        socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
                    }
                    Ok(_) => {}
                }
            }
            let _ = closed_tx.send(());
        });

        (port, closed_rx)
    }

    async fn connect_to_stalled_broker() -> (MqttTransport, oneshot::Receiver<()>) {
        let (port, closed) = stalled_broker().await;
        let mut config = MqttTransportConfig::new("127.0.0.1", port, "stalled-client");
        config.request_capacity = 10;
        let transport = MqttTransport::new(config);
        transport.connect().await.unwrap();
        (transport, closed)
    }

    #[test]
    fn parse_mqtt_url_tcp() {
        let (host, port) = parse_mqtt_url("tcp://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn parse_mqtt_url_default_port() {
        let (host, port) = parse_mqtt_url("mqtt://broker.example.com").unwrap();
        assert_eq!(host, "broker.example.com");
        assert_eq!(port, DEFAULT_MQTT_PORT);
    }

    #[test]
    fn parse_mqtt_url_no_scheme() {
        let (host, port) = parse_mqtt_url("10.0.0.5:8883").unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 8883);
    }

    #[test]
    fn parse_mqtt_url_rejects_bad_input() {
        assert!(parse_mqtt_url("http://broker:1883").is_err());
        assert!(parse_mqtt_url(":1883").is_err());
        assert!(parse_mqtt_url("broker:port").is_err());
        assert!(parse_mqtt_url("a:1:2").is_err());
        assert!(parse_mqtt_url("broker:0").is_err());
        assert!(parse_mqtt_url("tcp://broker:0").is_err());
    }

    #[test]
    fn config_from_url() {
        let config = MqttTransportConfig::from_url("tcp://plant-broker:1884", "fwd-1").unwrap();
        assert_eq!(config.host, "plant-broker");
        assert_eq!(config.port, 1884);
        assert_eq!(config.client_id, "fwd-1");
        assert_eq!(config.qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn operations_before_connect_fail() {
        let transport = MqttTransport::new(MqttTransportConfig::default());

        assert!(matches!(
            transport.publish("t", b"x").await,
            Err(TransportError::NotConnected)
        ));
        assert!(matches!(
            transport.add_topic_interest("MTConnect/Devices/D1").await,
            Err(TransportError::NotConnected)
        ));
        assert!(transport.disconnect().await.is_ok());
        assert_eq!(transport.endpoint(), "mqtt://localhost:1883");
    }

    #[tokio::test]
    async fn disconnect_releases_socket_when_broker_stalls() {
        let (transport, closed) = connect_to_stalled_broker().await;
        transport.add_topic_interest("MTConnect/Devices/D1").await.unwrap();

        // Unacknowledged QoS 1 publishes fill the inflight window, then the
        // request queue.
        let client = transport.client().unwrap();
        for _ in 0..10_000 {
            if client
                .try_publish("MTConnect/Devices/D1/X", QoS::AtLeastOnce, false, vec![0_u8; 16])
                .is_err()
            {
                break;
            }
            tokio::task::yield_now().await;
        }

        let disconnect = tokio::time::timeout(Duration::from_secs(3), transport.disconnect()).await;
        assert!(disconnect.is_ok(), "disconnect blocked on a stalled broker");

        tokio::time::timeout(Duration::from_secs(4), closed)
            .await
            .expect("broker socket still open after disconnect")
            .unwrap();
        assert!(matches!(
            transport.publish("t", b"x").await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn cancelled_disconnect_still_closes_socket() {
        let (transport, closed) = connect_to_stalled_broker().await;

        let _ = tokio::time::timeout(Duration::ZERO, transport.disconnect()).await;

        tokio::time::timeout(Duration::from_secs(4), closed)
            .await
            .expect("broker socket still open after cancelled disconnect")
            .unwrap();
    }
}
