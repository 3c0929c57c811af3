//! # MTConnect UNS Connections
//!
//! Output connections towards a pub/sub broker.
//!
//! ## Lifecycle
//!
//! Every connection moves through `Created → Connected → Running → Stopped`
//! (`Connected → Stopped` is allowed to abort a start). Publishing is only
//! accepted while `Running`; `stop()` makes in-flight publishes fail fast.
//!
//! ## Transports
//!
//! - [`MqttTransport`]: `rumqttc` client with retained birth/death messages
//! - [`MemoryTransport`]: in-process transport that records publishes

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod manager;
pub mod memory;
pub mod mqtt;
pub mod transport;

pub use connection::{
    Connection, ConnectionError, ConnectionState, ConnectionStats, Direction, PublishError,
};
pub use manager::{ConnectionManager, PublishSummary};
pub use memory::{MemoryTransport, PublishedMessage};
pub use mqtt::{parse_mqtt_url, MqttTransport, MqttTransportConfig};
pub use transport::{Transport, TransportError};
