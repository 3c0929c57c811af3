//! Transport abstraction beneath a connection.

use async_trait::async_trait;

/// A pub/sub client session.
///
/// Implementations are not expected to bound their own operations in time;
/// [`Connection`](crate::Connection) applies the operation timeout.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human readable destination, used in logs.
    fn endpoint(&self) -> String;

    /// Establish the session.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Announce interest in a topic root (a device namespace).
    async fn add_topic_interest(&self, topic_root: &str) -> Result<(), TransportError>;

    /// Send one payload to a topic.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Release the session. Must succeed when never connected.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Errors reported by a transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Invalid broker URL or address
    #[error("invalid broker URL: {0}")]
    InvalidUrl(String),
    /// Session could not be established
    #[error("connect failed: {0}")]
    Connect(String),
    /// Operation requires an established session
    #[error("not connected")]
    NotConnected,
    /// The transport refused the send
    #[error("publish rejected: {0}")]
    Rejected(String),
    /// Session teardown failed
    #[error("disconnect failed: {0}")]
    Disconnect(String),
}
