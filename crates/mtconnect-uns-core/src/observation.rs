//! Observation and device model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// MTConnect data item category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Category {
    /// Continuously varying measurement
    Sample,
    /// Discrete state change
    Event,
    /// Health/alarm condition
    Condition,
}

/// One reported value at one instant for one data item of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    /// UUID of the reporting device
    pub device_uuid: String,
    /// Data item identifier, unique within the device
    pub data_item_id: String,
    /// Time the value was observed
    pub timestamp: DateTime<Utc>,
    /// Agent sequence number
    #[serde(default)]
    pub sequence: u64,
    /// Reported value (scalar or structured)
    pub value: Value,
    /// Data item category
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    /// Data item type, e.g. `TEMPERATURE` or `EXECUTION`
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub data_item_type: Option<String>,
    /// Data item name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Observation {
    /// Create an observation with no sequence number or metadata.
    #[must_use]
    pub fn new(
        device_uuid: impl Into<String>,
        data_item_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            device_uuid: device_uuid.into(),
            data_item_id: data_item_id.into(),
            timestamp,
            sequence: 0,
            value: value.into(),
            category: None,
            data_item_type: None,
            name: None,
        }
    }

    /// Set the sequence number.
    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Set the category.
    #[must_use]
    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    /// Set the data item type.
    #[must_use]
    pub fn with_type(mut self, data_item_type: impl Into<String>) -> Self {
        self.data_item_type = Some(data_item_type.into());
        self
    }

    /// The report-by-exception key of this observation.
    #[must_use]
    pub fn key(&self) -> DataItemKey {
        DataItemKey::new(&self.device_uuid, &self.data_item_id)
    }
}

/// Identity of one data item of one device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataItemKey {
    /// Device UUID
    pub device_uuid: String,
    /// Data item identifier
    pub data_item_id: String,
}

impl DataItemKey {
    /// Create a new key.
    #[must_use]
    pub fn new(device_uuid: impl Into<String>, data_item_id: impl Into<String>) -> Self {
        Self {
            device_uuid: device_uuid.into(),
            data_item_id: data_item_id.into(),
        }
    }
}

impl fmt::Display for DataItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_uuid, self.data_item_id)
    }
}

/// A device known to the forwarder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Unique device UUID
    pub uuid: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Device {
    /// Create a device from its UUID.
    #[must_use]
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            name: None,
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}
