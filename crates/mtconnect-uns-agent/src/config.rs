//! Forwarder configuration.

use mtconnect_uns_connection::manager::DEFAULT_QUEUE_CAPACITY;
use mtconnect_uns_connection::{parse_mqtt_url, MqttTransportConfig};
use mtconnect_uns_core::topics::{check_segment, DEFAULT_ROOT};
use mtconnect_uns_core::TopicScheme;
use rumqttc::QoS;
use std::time::Duration;
use uuid::Uuid;

const BROKER_ADDRESS: &str = "UNS_MQTT_BROKER_ADDRESS";
const BROKER_PORT: &str = "UNS_MQTT_BROKER_PORT";
const MIRRORS: &str = "UNS_MQTT_MIRRORS";
const CLIENT_ID: &str = "UNS_CLIENT_ID";
const TOPIC_ROOT: &str = "UNS_TOPIC_ROOT";
const DEVICES: &str = "UNS_DEVICES";
const QOS: &str = "UNS_QOS";
const KEEP_ALIVE_SECS: &str = "UNS_KEEP_ALIVE_SECS";
const OPERATION_TIMEOUT_MS: &str = "UNS_OPERATION_TIMEOUT_MS";
const QUEUE_CAPACITY: &str = "UNS_QUEUE_CAPACITY";

/// Forwarder configuration.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Primary output broker
    pub broker: BrokerConfig,

    /// Additional output brokers receiving the same publishes
    pub mirrors: Vec<BrokerConfig>,

    /// MQTT client identifier
    pub client_id: String,

    /// Namespace root of every topic
    pub topic_root: String,

    /// Devices known at startup
    pub devices: Vec<String>,

    /// QoS for every publish
    pub qos: QoS,

    /// MQTT keep-alive interval
    pub keep_alive: Duration,

    /// Bound on every transport operation
    pub operation_timeout: Duration,

    /// Outbox size per connection
    pub queue_capacity: usize,
}

/// Address of one broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Host name or IP address
    pub address: String,
    /// TCP port
    pub port: u16,
}

impl ForwarderConfig {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `UNS_MQTT_BROKER_ADDRESS`: broker host (required)
    /// - `UNS_MQTT_BROKER_PORT`: broker port (required)
    /// - `UNS_MQTT_MIRRORS`: extra brokers, comma separated `host[:port]` or URLs
    /// - `UNS_CLIENT_ID`: MQTT client identifier
    /// - `UNS_TOPIC_ROOT`: namespace root (default `MTConnect`)
    /// - `UNS_DEVICES`: comma separated device UUIDs known at startup
    /// - `UNS_QOS`: 0, 1 or 2 (default 1)
    /// - `UNS_KEEP_ALIVE_SECS`: keep-alive (default 30)
    /// - `UNS_OPERATION_TIMEOUT_MS`: transport operation bound (default 5000)
    /// - `UNS_QUEUE_CAPACITY`: outbox size per connection (default 1024)
    ///
    /// # Errors
    ///
    /// Returns error if a required variable is missing or any value is invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns error if a required key is missing or any value is invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let address = lookup(BROKER_ADDRESS)
            .map(|value| value.trim().to_string())
            .ok_or(ConfigError::Missing(BROKER_ADDRESS))?;
        if address.is_empty() {
            return Err(ConfigError::Missing(BROKER_ADDRESS));
        }
        if address.chars().any(char::is_whitespace) || address.contains("://") {
            return Err(invalid(BROKER_ADDRESS, &address, "expected a bare host name"));
        }

        let port = lookup(BROKER_PORT).ok_or(ConfigError::Missing(BROKER_PORT))?;
        let port = parse_port(&port)?;

        let mirrors = match lookup(MIRRORS) {
            Some(value) => split_list(&value)
                .map(|entry| {
                    parse_mqtt_url(entry)
                        .map(|(address, port)| BrokerConfig { address, port })
                        .map_err(|e| invalid(MIRRORS, entry, &e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let client_id = match lookup(CLIENT_ID) {
            Some(value) if !value.trim().is_empty() => value.trim().to_string(),
            _ => format!("mtconnect-uns-{}", Uuid::new_v4().simple()),
        };

        let topic_root = match lookup(TOPIC_ROOT) {
            Some(value) => parse_topic_root(&value)?,
            None => DEFAULT_ROOT.to_string(),
        };

        let devices = match lookup(DEVICES) {
            Some(value) => split_list(&value)
                .map(|uuid| {
                    check_segment(uuid)
                        .map(|()| uuid.to_string())
                        .map_err(|e| invalid(DEVICES, uuid, &e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let qos = match lookup(QOS) {
            Some(value) => parse_qos(&value)?,
            None => QoS::AtLeastOnce,
        };

        let keep_alive = Duration::from_secs(parse_number(&lookup, KEEP_ALIVE_SECS, 30)?);
        let operation_timeout =
            Duration::from_millis(parse_number(&lookup, OPERATION_TIMEOUT_MS, 5000)?);
        let queue_capacity = usize::try_from(parse_number(
            &lookup,
            QUEUE_CAPACITY,
            DEFAULT_QUEUE_CAPACITY as u64,
        )?)
        .map_err(|e| invalid(QUEUE_CAPACITY, "", &e.to_string()))?;

        Ok(Self {
            broker: BrokerConfig { address, port },
            mirrors,
            client_id,
            topic_root,
            devices,
            qos,
            keep_alive,
            operation_timeout,
            queue_capacity,
        })
    }

    /// Topic scheme derived from the configured root.
    #[must_use]
    pub fn topic_scheme(&self) -> TopicScheme {
        TopicScheme::new(&self.topic_root)
    }

    /// Named transport configuration of every output connection, primary first.
    #[must_use]
    pub fn transports(&self) -> Vec<(String, MqttTransportConfig)> {
        let node_state_topic = self.topic_scheme().node_state(&self.client_id);

        std::iter::once(("primary".to_string(), &self.broker))
            .chain(
                self.mirrors
                    .iter()
                    .enumerate()
                    .map(|(index, broker)| (format!("mirror-{}", index + 1), broker)),
            )
            .map(|(name, broker)| {
                let mut transport =
                    MqttTransportConfig::new(&broker.address, broker.port, &self.client_id);
                transport.keep_alive = self.keep_alive;
                transport.qos = self.qos;
                transport.node_state_topic = Some(node_state_topic.clone());
                (name, transport)
            })
            .collect()
    }
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
}

fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(0) => Err(invalid(BROKER_PORT, value, "port must be in 1..=65535")),
        Ok(port) => Ok(port),
        Err(e) => Err(invalid(BROKER_PORT, value, &e.to_string())),
    }
}

fn parse_topic_root(value: &str) -> Result<String, ConfigError> {
    let root = value.trim().trim_end_matches('/');
    if root.is_empty() {
        return Err(invalid(TOPIC_ROOT, value, "root must not be empty"));
    }
    if root.contains(['+', '#']) || root.split('/').any(str::is_empty) {
        return Err(invalid(TOPIC_ROOT, value, "root must be a plain topic path"));
    }
    Ok(root.to_string())
}

fn parse_qos(value: &str) -> Result<QoS, ConfigError> {
    match value.trim() {
        "0" => Ok(QoS::AtMostOnce),
        "1" => Ok(QoS::AtLeastOnce),
        "2" => Ok(QoS::ExactlyOnce),
        _ => Err(invalid(QOS, value, "expected 0, 1 or 2")),
    }
}

fn parse_number<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(value) = lookup(key) else {
        return Ok(default);
    };

    match value.trim().parse::<u64>() {
        Ok(0) => Err(invalid(key, &value, "must be greater than zero")),
        Ok(number) => Ok(number),
        Err(e) => Err(invalid(key, &value, &e.to_string())),
    }
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

/// Configuration errors; fatal at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required setting is absent or empty
    #[error("missing required setting {0}")]
    Missing(&'static str),
    /// Setting has an unusable value
    #[error("invalid value '{value}' for {key}: {reason}")]
    Invalid {
        /// Setting name
        key: &'static str,
        /// Offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },
}
