//! In-process transport.

use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A payload received by a [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Destination topic
    pub topic: String,
    /// Raw payload
    pub payload: Vec<u8>,
}

impl PublishedMessage {
    /// Decode the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns error if the payload is not valid JSON.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    connected: bool,
    connects: usize,
    disconnects: usize,
    interests: Vec<String>,
    published: Vec<PublishedMessage>,
    fail_connect: bool,
    fail_publish: bool,
    hang_publish: bool,
}

/// Transport that keeps everything in memory.
///
/// Records sessions, announced topic roots and publishes, and can be told
/// to fail or stall, which makes it suitable for exercising connection
/// lifecycles without a broker.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
}

impl MemoryTransport {
    /// Create a transport that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make subsequent connects fail.
    pub fn fail_connect(&self, fail: bool) {
        self.lock().fail_connect = fail;
    }

    /// Make subsequent publishes fail.
    pub fn fail_publish(&self, fail: bool) {
        self.lock().fail_publish = fail;
    }

    /// Make subsequent publishes never complete.
    pub fn hang_publish(&self, hang: bool) {
        self.lock().hang_publish = hang;
    }

    /// Whether a session is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    /// Number of successful connects.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    /// Number of disconnects of an open session.
    #[must_use]
    pub fn disconnect_count(&self) -> usize {
        self.lock().disconnects
    }

    /// Announced topic roots in order.
    #[must_use]
    pub fn interests(&self) -> Vec<String> {
        self.lock().interests.clone()
    }

    /// Accepted publishes in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn endpoint(&self) -> String {
        "memory".to_string()
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn add_topic_interest(&self, topic_root: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        state.interests.push(topic_root.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let hang = {
            let mut state = self.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            if state.fail_publish {
                return Err(TransportError::Rejected("broker unreachable".to_string()));
            }
            if !state.hang_publish {
                state.published.push(PublishedMessage {
                    topic: topic.to_string(),
                    payload: payload.to_vec(),
                });
            }
            state.hang_publish
        };

        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.connected {
            state.connected = false;
            state.disconnects += 1;
        }
        Ok(())
    }
}
