//! Connection lifecycle state machine.

use crate::transport::Transport;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Configured, no session yet
    Created,
    /// Session established, device roots not yet announced
    Connected,
    /// Accepting publishes
    Running,
    /// Session released; terminal
    Stopped,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Direction of a connection relative to the forwarder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Data flows from the broker into the forwarder
    Input,
    /// Data flows from the forwarder to the broker
    Output,
}

/// Delivery counters of one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Payloads accepted by the transport
    pub published: u64,
    /// Publish attempts that failed
    pub failed: u64,
}

/// A named session to one broker.
pub struct Connection {
    name: String,
    direction: Direction,
    transport: Arc<dyn Transport>,
    state: watch::Sender<ConnectionState>,
    /// Serializes connect/start/add_device/stop against each other.
    lifecycle: tokio::sync::Mutex<()>,
    topic_roots: Mutex<Vec<String>>,
    operation_timeout: Duration,
    published: AtomicU64,
    failed: AtomicU64,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("endpoint", &self.transport.endpoint())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Create a connection in the `Created` state.
    ///
    /// Every transport operation is bounded by `operation_timeout`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        transport: Arc<dyn Transport>,
        operation_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Created);
        Self {
            name: name.into(),
            direction,
            transport,
            state,
            lifecycle: tokio::sync::Mutex::new(()),
            topic_roots: Mutex::new(Vec::new()),
            operation_timeout,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Connection name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Transport destination.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Registered topic roots in registration order.
    #[must_use]
    pub fn topic_roots(&self) -> Vec<String> {
        self.topic_roots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            published: self.published.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// Establish the transport session (`Created → Connected`).
    ///
    /// Connecting an already connected or running connection is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is stopped or the transport fails;
    /// a transport failure leaves the connection `Stopped`.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Created => self.open_session().await,
            ConnectionState::Connected | ConnectionState::Running => Ok(()),
            ConnectionState::Stopped => Err(self.stopped_error()),
        }
    }

    /// Register a device topic root.
    ///
    /// Returns `true` if the root was newly registered. While `Running` the
    /// root is announced to the transport immediately; otherwise it is
    /// announced by [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns error if the connection is stopped, or if announcing the
    /// root on a running connection fails (the root stays registered).
    pub async fn add_device(&self, topic_root: &str) -> Result<bool, ConnectionError> {
        let _lifecycle = self.lifecycle.lock().await;

        let state = self.state();
        if state == ConnectionState::Stopped {
            return Err(self.stopped_error());
        }

        {
            let mut roots = self
                .topic_roots
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if roots.iter().any(|root| root == topic_root) {
                return Ok(false);
            }
            roots.push(topic_root.to_string());
        }

        if state == ConnectionState::Running {
            self.announce(topic_root).await?;
        }

        Ok(true)
    }

    /// Start the connection (`Created`/`Connected → Running`).
    ///
    /// Connects if needed, then announces every registered topic root.
    /// Starting a running connection is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is stopped or the transport fails;
    /// on failure the session is released and the connection is `Stopped`.
    pub async fn start(&self) -> Result<(), ConnectionError> {
        let _lifecycle = self.lifecycle.lock().await;

        match self.state() {
            ConnectionState::Created => self.open_session().await?,
            ConnectionState::Connected => {}
            ConnectionState::Running => return Ok(()),
            ConnectionState::Stopped => return Err(self.stopped_error()),
        }

        for root in self.topic_roots() {
            if let Err(err) = self.announce(&root).await {
                self.abort_session().await;
                return Err(err);
            }
        }

        let started = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(self.stopped_error());
        }

        tracing::info!(
            connection = %self.name,
            endpoint = %self.transport.endpoint(),
            devices = self.topic_roots().len(),
            "Connection running"
        );

        Ok(())
    }

    /// Publish one payload.
    ///
    /// # Errors
    ///
    /// Returns error if the connection is not `Running`, the transport
    /// rejects the send or does not answer within the operation timeout,
    /// or the connection is stopped while the publish is in flight.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let result = self.try_publish(topic, payload).await;
        match &result {
            Ok(()) => self.published.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failed.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    async fn try_publish(&self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        let mut state_rx = self.state.subscribe();
        let state = *state_rx.borrow_and_update();
        if state != ConnectionState::Running {
            return Err(PublishError::NotRunning {
                connection: self.name.clone(),
                state,
            });
        }

        let publish = self.transport.publish(topic, payload);
        tokio::select! {
            result = tokio::time::timeout(self.operation_timeout, publish) => {
                match result {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(err)) => Err(PublishError::Rejected {
                        connection: self.name.clone(),
                        reason: err.to_string(),
                    }),
                    Err(_) => Err(PublishError::Timeout {
                        connection: self.name.clone(),
                        timeout: self.operation_timeout,
                    }),
                }
            }
            () = wait_until_stopped(state_rx) => Err(PublishError::Stopped {
                connection: self.name.clone(),
            }),
        }
    }

    /// Stop the connection and release the transport session.
    ///
    /// Valid from any state; stopping a stopped connection is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the transport fails to disconnect cleanly. The
    /// connection is `Stopped` either way.
    pub async fn stop(&self) -> Result<(), ConnectionError> {
        let previous = self.state.send_replace(ConnectionState::Stopped);
        if previous == ConnectionState::Stopped {
            return Ok(());
        }

        let _lifecycle = self.lifecycle.lock().await;
        self.bounded("disconnect", self.transport.disconnect())
            .await?
            .map_err(|err| ConnectionError::Disconnect {
                connection: self.name.clone(),
                reason: err.to_string(),
            })?;

        tracing::info!(connection = %self.name, "Connection stopped");
        Ok(())
    }

    async fn open_session(&self) -> Result<(), ConnectionError> {
        tracing::info!(
            connection = %self.name,
            endpoint = %self.transport.endpoint(),
            "Connecting"
        );

        let result = match self.bounded("connect", self.transport.connect()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(ConnectionError::Connect {
                connection: self.name.clone(),
                reason: err.to_string(),
            }),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            self.abort_session().await;
            return Err(err);
        }

        let connected = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Created {
                *state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if connected {
            Ok(())
        } else {
            Err(self.stopped_error())
        }
    }

    async fn announce(&self, topic_root: &str) -> Result<(), ConnectionError> {
        let result = self
            .bounded("announce", self.transport.add_topic_interest(topic_root))
            .await?;

        result.map_err(|err| ConnectionError::Announce {
            connection: self.name.clone(),
            topic_root: topic_root.to_string(),
            reason: err.to_string(),
        })
    }

    /// Mark the connection stopped and release whatever session exists.
    async fn abort_session(&self) {
        self.state.send_replace(ConnectionState::Stopped);
        let error = match self.bounded("disconnect", self.transport.disconnect()).await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err.to_string(),
            Err(err) => err.to_string(),
        };
        tracing::warn!(
            connection = %self.name,
            error = %error,
            "Failed to release session"
        );
    }

    async fn bounded<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = T>,
    ) -> Result<T, ConnectionError> {
        tokio::time::timeout(self.operation_timeout, future)
            .await
            .map_err(|_| ConnectionError::Timeout {
                connection: self.name.clone(),
                operation,
                timeout: self.operation_timeout,
            })
    }

    fn stopped_error(&self) -> ConnectionError {
        ConnectionError::Stopped {
            connection: self.name.clone(),
        }
    }
}

async fn wait_until_stopped(mut state_rx: watch::Receiver<ConnectionState>) {
    loop {
        if *state_rx.borrow_and_update() == ConnectionState::Stopped {
            return;
        }
        if state_rx.changed().await.is_err() {
            return;
        }
    }
}

/// Errors raised by connection lifecycle operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectionError {
    /// Transport session could not be established
    #[error("connection '{connection}': connect failed: {reason}")]
    Connect {
        /// Connection name
        connection: String,
        /// Transport error
        reason: String,
    },
    /// A device root could not be announced
    #[error("connection '{connection}': announcing '{topic_root}' failed: {reason}")]
    Announce {
        /// Connection name
        connection: String,
        /// Topic root being announced
        topic_root: String,
        /// Transport error
        reason: String,
    },
    /// A transport operation exceeded the operation timeout
    #[error("connection '{connection}': {operation} timed out after {timeout:?}")]
    Timeout {
        /// Connection name
        connection: String,
        /// Operation that timed out
        operation: &'static str,
        /// Configured bound
        timeout: Duration,
    },
    /// Operation is not valid on a stopped connection
    #[error("connection '{connection}' is stopped")]
    Stopped {
        /// Connection name
        connection: String,
    },
    /// Session teardown failed
    #[error("connection '{connection}': disconnect failed: {reason}")]
    Disconnect {
        /// Connection name
        connection: String,
        /// Transport error
        reason: String,
    },
}

/// Errors raised by a single publish attempt.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    /// Connection is not accepting publishes
    #[error("connection '{connection}' is {state}, not running")]
    NotRunning {
        /// Connection name
        connection: String,
        /// State at the time of the attempt
        state: ConnectionState,
    },
    /// Transport refused the send
    #[error("connection '{connection}': publish rejected: {reason}")]
    Rejected {
        /// Connection name
        connection: String,
        /// Transport error
        reason: String,
    },
    /// Transport did not answer in time
    #[error("connection '{connection}': publish timed out after {timeout:?}")]
    Timeout {
        /// Connection name
        connection: String,
        /// Configured bound
        timeout: Duration,
    },
    /// Connection was stopped while the publish was in flight
    #[error("connection '{connection}' stopped during publish")]
    Stopped {
        /// Connection name
        connection: String,
    },
    /// Outbox of the connection is full
    #[error("connection '{connection}': outbox full")]
    QueueFull {
        /// Connection name
        connection: String,
    },
}
