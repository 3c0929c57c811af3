//! Observation forwarding orchestration.

use crate::config::ForwarderConfig;
use mtconnect_uns_connection::{
    Connection, ConnectionManager, Direction, MqttTransport, PublishError,
};
use mtconnect_uns_core::topics::check_segment;
use mtconnect_uns_core::{
    Device, DeviceRegistry, FormatError, JsonFormatter, Observation, ObservationFormatter,
    ReportByException, TopicError, TopicScheme,
};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// What happened to one observation.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Passed the filter and was handed to the output connections
    Forwarded {
        /// Destination topic
        topic: String,
        /// Connections that accepted the payload
        queued: usize,
        /// Connections that did not
        failures: Vec<PublishError>,
    },
    /// Same value as the last forwarded one
    Suppressed,
    /// Not forwardable
    Dropped(DropReason),
}

/// Why an observation was dropped.
#[derive(Debug, Clone)]
pub enum DropReason {
    /// Device or data item identifier cannot be used in a topic
    InvalidIdentifier(TopicError),
    /// Payload could not be produced
    Format(FormatError),
}

/// Counters over the lifetime of a forwarder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwarderStats {
    /// Observations handled
    pub received: u64,
    /// Observations that passed the filter
    pub forwarded: u64,
    /// Observations equal to the last forwarded value
    pub suppressed: u64,
    /// Observations with malformed identifiers
    pub invalid: u64,
    /// Observations that could not be formatted
    pub format_failures: u64,
    /// Per-connection publish rejections
    pub publish_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    forwarded: AtomicU64,
    suppressed: AtomicU64,
    invalid: AtomicU64,
    format_failures: AtomicU64,
    publish_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Republishes observations onto the unified namespace.
///
/// [`handle`](Self::handle) takes `&self` and may be called concurrently;
/// report-by-exception state is locked per key and released before any
/// publish is dispatched.
pub struct Forwarder {
    topics: TopicScheme,
    registry: DeviceRegistry,
    filter: ReportByException,
    formatter: Arc<dyn ObservationFormatter>,
    connections: ConnectionManager,
    counters: Counters,
}

impl Forwarder {
    /// Create a forwarder over the given connections.
    #[must_use]
    pub fn new(
        topics: TopicScheme,
        connections: ConnectionManager,
        formatter: Arc<dyn ObservationFormatter>,
    ) -> Self {
        Self {
            topics,
            registry: DeviceRegistry::new(),
            filter: ReportByException::new(),
            formatter,
            connections,
            counters: Counters::default(),
        }
    }

    /// Create a forwarder with one MQTT output connection per configured
    /// broker and the configured devices registered.
    pub async fn from_config(config: &ForwarderConfig) -> Self {
        let mut connections = ConnectionManager::new(config.queue_capacity);
        for (name, transport) in config.transports() {
            connections.add_connection(Connection::new(
                name,
                Direction::Output,
                Arc::new(MqttTransport::new(transport)),
                config.operation_timeout,
            ));
        }

        let forwarder = Self::new(
            config.topic_scheme(),
            connections,
            Arc::new(JsonFormatter::new()),
        );
        for uuid in &config.devices {
            forwarder.register_device(Device::new(uuid)).await;
        }
        forwarder
    }

    /// Topic scheme in use.
    #[must_use]
    pub fn topics(&self) -> &TopicScheme {
        &self.topics
    }

    /// Known devices.
    #[must_use]
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Output connections.
    #[must_use]
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> ForwarderStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ForwarderStats {
            received: load(&self.counters.received),
            forwarded: load(&self.counters.forwarded),
            suppressed: load(&self.counters.suppressed),
            invalid: load(&self.counters.invalid),
            format_failures: load(&self.counters.format_failures),
            publish_failures: load(&self.counters.publish_failures),
        }
    }

    /// Register a device and its topic root on every output connection.
    ///
    /// Returns `true` if the device was not known before.
    pub async fn register_device(&self, device: Device) -> bool {
        let uuid = device.uuid.clone();
        if !self.registry.register(device) {
            return false;
        }

        self.add_device_root(&uuid).await;
        true
    }

    async fn add_device_root(&self, uuid: &str) {
        let topic_root = self.topics.device_root(uuid);
        for (connection, result) in self.connections.add_device(&topic_root).await {
            if let Err(err) = result {
                tracing::warn!(
                    connection = %connection,
                    topic_root = %topic_root,
                    error = %err,
                    "Failed to register device on connection"
                );
            }
        }
    }

    /// Register every known device on the connections, then start them.
    ///
    /// Returns the number of connections running afterwards. A connection
    /// that fails to start stays stopped; the others are unaffected.
    pub async fn start(&self) -> usize {
        for device in &self.registry.list_all() {
            self.add_device_root(&device.uuid).await;
        }

        let mut running = 0;
        for (connection, result) in self.connections.start_all().await {
            match result {
                Ok(()) => running += 1,
                Err(err) => {
                    tracing::error!(
                        connection = %connection,
                        error = %err,
                        "Failed to start connection"
                    );
                }
            }
        }

        tracing::info!(
            running,
            devices = self.registry.len(),
            root = %self.topics.root,
            content_type = self.formatter.content_type(),
            "Forwarder started"
        );
        running
    }

    /// Process one observation.
    pub async fn handle(&self, observation: &Observation) -> Outcome {
        bump(&self.counters.received);

        if let Err(err) = check_segment(&observation.device_uuid)
            .and_then(|()| check_segment(&observation.data_item_id))
        {
            bump(&self.counters.invalid);
            tracing::warn!(
                device_uuid = %observation.device_uuid,
                data_item_id = %observation.data_item_id,
                error = %err,
                "Dropping observation with malformed identifier"
            );
            return Outcome::Dropped(DropReason::InvalidIdentifier(err));
        }

        if !self.registry.contains(&observation.device_uuid)
            && self
                .register_device(Device::new(&observation.device_uuid))
                .await
        {
            tracing::info!(device_uuid = %observation.device_uuid, "Discovered device");
        }

        // Formatting happens before the filter so that a value is only
        // recorded as forwarded once a payload exists for it.
        let payload = match self.formatter.format(observation) {
            Ok(payload) => payload,
            Err(err) => {
                bump(&self.counters.format_failures);
                tracing::warn!(
                    device_uuid = %observation.device_uuid,
                    data_item_id = %observation.data_item_id,
                    error = %err,
                    "Dropping observation that failed to format"
                );
                return Outcome::Dropped(DropReason::Format(err));
            }
        };

        // Enqueueing happens under the key's filter entry so that racing
        // handlers for one key reach the outboxes in filter order.
        let topic = self
            .topics
            .data_item(&observation.device_uuid, &observation.data_item_id);
        let forwarded = self
            .filter
            .forward_with(&observation.key(), &observation.value, || {
                self.connections.publish_all(&topic, payload)
            });
        let Some(summary) = forwarded else {
            bump(&self.counters.suppressed);
            tracing::trace!(
                device_uuid = %observation.device_uuid,
                data_item_id = %observation.data_item_id,
                "Suppressed unchanged value"
            );
            return Outcome::Suppressed;
        };
        bump(&self.counters.forwarded);

        for failure in &summary.failures {
            bump(&self.counters.publish_failures);
            tracing::warn!(topic = %topic, error = %failure, "Publish failed");
        }

        Outcome::Forwarded {
            topic,
            queued: summary.queued,
            failures: summary.failures,
        }
    }

    /// Consume the observation feed until it closes or `shutdown` resolves.
    pub async fn run<S>(
        &self,
        mut feed: mpsc::Receiver<Observation>,
        shutdown: S,
    ) -> ForwarderStats
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                observation = feed.recv() => {
                    let Some(observation) = observation else {
                        tracing::info!("Observation feed closed");
                        break;
                    };
                    self.handle(&observation).await;
                }
                () = &mut shutdown => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.stats()
    }

    /// Stop every connection in reverse start order.
    ///
    /// Failures are logged and do not prevent the remaining connections from
    /// being stopped.
    pub async fn stop(&self) -> ForwarderStats {
        for (connection, result) in self.connections.stop_all().await {
            if let Err(err) = result {
                tracing::warn!(
                    connection = %connection,
                    error = %err,
                    "Failed to stop connection cleanly"
                );
            }
        }

        let stats = self.stats();
        tracing::info!(
            received = stats.received,
            forwarded = stats.forwarded,
            suppressed = stats.suppressed,
            invalid = stats.invalid,
            format_failures = stats.format_failures,
            publish_failures = stats.publish_failures,
            "Forwarder stopped"
        );
        stats
    }
}
