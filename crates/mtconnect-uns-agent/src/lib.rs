//! # MTConnect UNS Agent
//!
//! Forwards MTConnect observations onto an MQTT unified namespace.
//!
//! ## Architecture
//!
//! 1. **Feed**: observations arrive on a channel (newline-delimited JSON on
//!    stdin for the binary)
//! 2. **Filter**: report-by-exception per (device, data item)
//! 3. **Mapping**: `<root>/Devices/<deviceUuid>/<dataItemId>`
//! 4. **Delivery**: one bounded outbox per output connection
//!
//! Devices not known at startup are discovered from their first observation
//! and announced on every connection.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod forwarder;
pub mod source;

pub use config::{BrokerConfig, ConfigError, ForwarderConfig};
pub use forwarder::{DropReason, Forwarder, ForwarderStats, Outcome};
