//! # MTConnect UNS Core
//!
//! Domain model and pure forwarding logic for publishing MTConnect
//! observations into an MQTT unified namespace.
//!
//! This crate provides:
//! - Observation and device model shared by every other crate
//! - Report-by-exception filter keyed by (device, data item)
//! - Topic scheme `<root>/Devices/<deviceUuid>/<dataItemId>`
//! - Device registry with idempotent registration
//! - JSON formatting of observations into wire payloads

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod filter;
pub mod format;
pub mod observation;
pub mod registry;
pub mod topics;

pub use filter::ReportByException;
pub use format::{FormatError, JsonFormatter, ObservationFormatter};
pub use observation::{Category, DataItemKey, Device, Observation};
pub use registry::{DeviceRegistry, DeviceSnapshot};
pub use topics::{TopicError, TopicScheme};
