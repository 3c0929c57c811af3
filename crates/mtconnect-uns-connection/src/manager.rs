//! Set of connections with one outbox worker each.

use crate::connection::{Connection, ConnectionError, ConnectionState, Direction, PublishError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Default outbox size per connection.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Time a worker gets to observe a stop before it is aborted.
const WORKER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct Outgoing {
    topic: Arc<str>,
    payload: Arc<[u8]>,
}

struct ManagedConnection {
    connection: Arc<Connection>,
    outbox: Mutex<Option<mpsc::Sender<Outgoing>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Result of handing one payload to every output connection.
#[derive(Debug, Default)]
pub struct PublishSummary {
    /// Number of outboxes that accepted the payload
    pub queued: usize,
    /// One error per connection that did not accept it
    pub failures: Vec<PublishError>,
}

/// Owns the connections of a forwarder.
///
/// Publishing enqueues into a bounded per-connection outbox drained by a
/// dedicated task, so a slow broker only delays its own connection.
pub struct ConnectionManager {
    entries: Vec<ManagedConnection>,
    queue_capacity: usize,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl ConnectionManager {
    /// Create an empty manager with the given outbox size.
    #[must_use]
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Add a connection. Connections start in insertion order.
    pub fn add_connection(&mut self, connection: Connection) -> Arc<Connection> {
        let connection = Arc::new(connection);
        self.entries.push(ManagedConnection {
            connection: Arc::clone(&connection),
            outbox: Mutex::new(None),
            worker: Mutex::new(None),
        });
        connection
    }

    /// Look up a connection by name.
    #[must_use]
    pub fn connection(&self, name: &str) -> Option<Arc<Connection>> {
        self.entries
            .iter()
            .find(|entry| entry.connection.name() == name)
            .map(|entry| Arc::clone(&entry.connection))
    }

    /// All connections in insertion order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.entries
            .iter()
            .map(|entry| Arc::clone(&entry.connection))
            .collect()
    }

    /// Name and state of every connection.
    #[must_use]
    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        self.entries
            .iter()
            .map(|entry| (entry.connection.name().to_string(), entry.connection.state()))
            .collect()
    }

    /// Whether at least one output connection is running.
    #[must_use]
    pub fn any_running(&self) -> bool {
        self.outputs()
            .any(|entry| entry.connection.state() == ConnectionState::Running)
    }

    fn outputs(&self) -> impl Iterator<Item = &ManagedConnection> {
        self.entries
            .iter()
            .filter(|entry| entry.connection.direction() == Direction::Output)
    }

    /// Register a device topic root on every output connection.
    ///
    /// Returns the per-connection outcome; `Ok(true)` means newly registered.
    pub async fn add_device(
        &self,
        topic_root: &str,
    ) -> Vec<(String, Result<bool, ConnectionError>)> {
        let mut results = Vec::new();
        for entry in self.outputs() {
            let result = entry.connection.add_device(topic_root).await;
            results.push((entry.connection.name().to_string(), result));
        }
        results
    }

    /// Start every connection in insertion order.
    ///
    /// A failing connection does not prevent the others from starting.
    pub async fn start_all(&self) -> Vec<(String, Result<(), ConnectionError>)> {
        let mut results = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let name = entry.connection.name().to_string();
            let result = entry.connection.start().await;

            if result.is_ok() && entry.connection.direction() == Direction::Output {
                let (tx, rx) = mpsc::channel(self.queue_capacity);
                let worker = tokio::spawn(drain_outbox(Arc::clone(&entry.connection), rx));
                *lock(&entry.outbox) = Some(tx);
                *lock(&entry.worker) = Some(worker);
            }

            results.push((name, result));
        }

        results
    }

    /// Hand a payload to every output connection without waiting for delivery.
    pub fn publish_all(&self, topic: &str, payload: Vec<u8>) -> PublishSummary {
        let topic: Arc<str> = Arc::from(topic);
        let payload: Arc<[u8]> = Arc::from(payload);
        let mut summary = PublishSummary::default();

        for entry in self.outputs() {
            let connection = entry.connection.name();
            let state = entry.connection.state();
            if state != ConnectionState::Running {
                summary.failures.push(PublishError::NotRunning {
                    connection: connection.to_string(),
                    state,
                });
                continue;
            }

            let outbox = lock(&entry.outbox);
            let Some(sender) = outbox.as_ref() else {
                summary.failures.push(PublishError::NotRunning {
                    connection: connection.to_string(),
                    state,
                });
                continue;
            };

            let outgoing = Outgoing {
                topic: Arc::clone(&topic),
                payload: Arc::clone(&payload),
            };
            match sender.try_send(outgoing) {
                Ok(()) => summary.queued += 1,
                Err(TrySendError::Full(_)) => summary.failures.push(PublishError::QueueFull {
                    connection: connection.to_string(),
                }),
                Err(TrySendError::Closed(_)) => summary.failures.push(PublishError::Stopped {
                    connection: connection.to_string(),
                }),
            }
        }

        summary
    }

    /// Stop every connection in reverse start order.
    ///
    /// Continues past failures; every connection ends up `Stopped`.
    pub async fn stop_all(&self) -> Vec<(String, Result<(), ConnectionError>)> {
        let mut results = Vec::with_capacity(self.entries.len());

        for entry in self.entries.iter().rev() {
            let name = entry.connection.name().to_string();

            drop(lock(&entry.outbox).take());
            let result = entry.connection.stop().await;

            let worker = lock(&entry.worker).take();
            if let Some(mut worker) = worker {
                if tokio::time::timeout(WORKER_SHUTDOWN_GRACE, &mut worker)
                    .await
                    .is_err()
                {
                    tracing::warn!(connection = %name, "Outbox worker did not stop, aborting");
                    worker.abort();
                }
            }

            results.push((name, result));
        }

        results
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn drain_outbox(connection: Arc<Connection>, mut outbox: mpsc::Receiver<Outgoing>) {
    while let Some(outgoing) = outbox.recv().await {
        if connection.state() == ConnectionState::Stopped {
            let mut dropped = 1_usize;
            while outbox.try_recv().is_ok() {
                dropped += 1;
            }
            tracing::warn!(
                connection = %connection.name(),
                dropped,
                "Connection stopped, dropping queued publishes"
            );
            break;
        }

        if let Err(err) = connection.publish(&outgoing.topic, &outgoing.payload).await {
            tracing::warn!(
                connection = %connection.name(),
                topic = %outgoing.topic,
                error = %err,
                "Publish failed"
            );
        } else {
            tracing::trace!(
                connection = %connection.name(),
                topic = %outgoing.topic,
                payload_len = outgoing.payload.len(),
                "Published"
            );
        }
    }

    tracing::debug!(connection = %connection.name(), "Outbox worker finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use tokio_test::assert_ok;

    const TIMEOUT: Duration = Duration::from_millis(200);

    async fn wait_for_published(transport: &MemoryTransport, count: usize) {
        for _ in 0..100 {
            if transport.published().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {count} publishes, saw {}",
            transport.published().len()
        );
    }

    fn output(name: &str, transport: &Arc<MemoryTransport>) -> Connection {
        Connection::new(name, Direction::Output, transport.clone(), TIMEOUT)
    }

    #[tokio::test]
    async fn publishes_reach_every_output() {
        let first = Arc::new(MemoryTransport::new());
        let second = Arc::new(MemoryTransport::new());
        let mut manager = ConnectionManager::default();
        manager.add_connection(output("a", &first));
        manager.add_connection(output("b", &second));

        for (_, result) in manager.start_all().await {
            assert_ok!(result);
        }

        let summary = manager.publish_all("Root/Devices/D1/X", b"1".to_vec());
        assert_eq!(summary.queued, 2);
        assert!(summary.failures.is_empty());

        wait_for_published(&first, 1).await;
        wait_for_published(&second, 1).await;
        assert_eq!(first.published()[0].topic, "Root/Devices/D1/X");
    }

    #[tokio::test]
    async fn failed_connection_does_not_affect_others() {
        let broken = Arc::new(MemoryTransport::new());
        broken.fail_connect(true);
        let healthy = Arc::new(MemoryTransport::new());

        let mut manager = ConnectionManager::default();
        manager.add_connection(output("broken", &broken));
        manager.add_connection(output("healthy", &healthy));

        let results = manager.start_all().await;
        assert!(results[0].1.is_err());
        assert!(results[1].1.is_ok());

        let summary = manager.publish_all("t", b"v".to_vec());
        assert_eq!(summary.queued, 1);
        assert!(matches!(
            summary.failures.as_slice(),
            [PublishError::NotRunning { connection, .. }] if connection == "broken"
        ));

        wait_for_published(&healthy, 1).await;
        assert!(manager.any_running());
    }

    #[tokio::test]
    async fn slow_connection_does_not_block_others() {
        let slow = Arc::new(MemoryTransport::new());
        let fast = Arc::new(MemoryTransport::new());
        let mut manager = ConnectionManager::new(4);
        manager.add_connection(Connection::new(
            "slow",
            Direction::Output,
            slow.clone(),
            Duration::from_secs(30),
        ));
        manager.add_connection(output("fast", &fast));
        manager.start_all().await;
        slow.hang_publish(true);

        let mut slow_full = false;
        for i in 0..10 {
            let summary = manager.publish_all("t", vec![i]);
            slow_full |= summary
                .failures
                .iter()
                .any(|err| {
                    matches!(err, PublishError::QueueFull { connection } if connection == "slow")
                });
            wait_for_published(&fast, usize::from(i) + 1).await;
        }

        assert!(slow_full, "slow outbox should have filled up");
        assert!(slow.published().is_empty());
        assert_eq!(fast.published().len(), 10);

        let stopped = tokio::time::timeout(Duration::from_secs(5), manager.stop_all()).await;
        assert!(stopped.is_ok(), "stop_all must finish while a publish hangs");
    }

    #[tokio::test]
    async fn add_device_targets_outputs_only() {
        let out = Arc::new(MemoryTransport::new());
        let input = Arc::new(MemoryTransport::new());
        let mut manager = ConnectionManager::default();
        manager.add_connection(output("out", &out));
        manager.add_connection(Connection::new(
            "in",
            Direction::Input,
            input.clone(),
            TIMEOUT,
        ));

        let results = manager.add_device("Root/Devices/D1").await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "out");

        manager.start_all().await;
        assert_eq!(out.interests(), vec!["Root/Devices/D1"]);
        assert!(input.interests().is_empty());

        let summary = manager.publish_all("t", b"v".to_vec());
        assert_eq!(summary.queued, 1);
    }

    #[tokio::test]
    async fn stop_all_runs_in_reverse_order_and_is_repeatable() {
        let first = Arc::new(MemoryTransport::new());
        let second = Arc::new(MemoryTransport::new());
        let mut manager = ConnectionManager::default();
        manager.add_connection(output("first", &first));
        manager.add_connection(output("second", &second));
        manager.start_all().await;

        let order: Vec<String> = manager
            .stop_all()
            .await
            .into_iter()
            .map(|(name, result)| {
                assert!(result.is_ok());
                name
            })
            .collect();
        assert_eq!(order, vec!["second", "first"]);

        for (_, result) in manager.stop_all().await {
            assert_ok!(result);
        }
        assert!(manager
            .states()
            .iter()
            .all(|(_, state)| *state == ConnectionState::Stopped));

        let summary = manager.publish_all("t", b"late".to_vec());
        assert_eq!(summary.queued, 0);
        assert_eq!(summary.failures.len(), 2);
        assert!(manager.connection("first").is_some());
    }
}
