//! Unified namespace topic scheme.
//!
//! Topic structure: `{root}/Devices/{deviceUuid}/{dataItemId}`
//!
//! Topics are a pure function of the identifiers, so subscribers can
//! register interest before the forwarder starts and re-subscribe
//! idempotently after a reconnect.

use serde::{Deserialize, Serialize};

/// Default namespace root.
pub const DEFAULT_ROOT: &str = "MTConnect";

/// Segment separating the root from device topics.
pub const DEVICES_SEGMENT: &str = "Devices";

/// Characters with a reserved meaning in MQTT topic names.
const RESERVED: [char; 3] = ['/', '+', '#'];

/// Topic scheme configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Namespace root shared by all devices (default: "MTConnect")
    pub root: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
        }
    }
}

impl TopicScheme {
    /// Create a topic scheme with the given root.
    #[must_use]
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    /// Topic root for a device; registered on output connections.
    #[must_use]
    pub fn device_root(&self, device_uuid: &str) -> String {
        format!("{}/{}/{}", self.root, DEVICES_SEGMENT, device_uuid)
    }

    /// Topic for one data item of a device.
    #[must_use]
    pub fn data_item(&self, device_uuid: &str, data_item_id: &str) -> String {
        format!("{}/{}", self.device_root(device_uuid), data_item_id)
    }

    /// Topic announcing the presence of a forwarder node.
    #[must_use]
    pub fn node_state(&self, client_id: &str) -> String {
        format!("{}/Nodes/{}", self.root, client_id)
    }

    /// Wildcard subscription for every data item of a device.
    #[must_use]
    pub fn device_wildcard(&self, device_uuid: &str) -> String {
        format!("{}/#", self.device_root(device_uuid))
    }

    /// Wildcard subscription for all devices under the root.
    #[must_use]
    pub fn devices_wildcard(&self) -> String {
        format!("{}/{}/#", self.root, DEVICES_SEGMENT)
    }

    /// Parse a data item topic.
    ///
    /// Returns `(device_uuid, data_item_id)` if valid.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<(String, String)> {
        let expected_prefix = format!("{}/{}/", self.root, DEVICES_SEGMENT);
        let remainder = topic.strip_prefix(&expected_prefix)?;

        let (device_uuid, data_item_id) = remainder.split_once('/')?;
        if device_uuid.is_empty() || data_item_id.is_empty() || data_item_id.contains('/') {
            return None;
        }

        Some((device_uuid.to_string(), data_item_id.to_string()))
    }
}

/// Check that an identifier can be used as a single topic segment.
///
/// # Errors
///
/// Returns error if the identifier is empty or contains a reserved character.
pub fn check_segment(segment: &str) -> Result<(), TopicError> {
    if segment.is_empty() {
        return Err(TopicError::EmptySegment);
    }

    if let Some(reserved) = segment.chars().find(|c| RESERVED.contains(c)) {
        return Err(TopicError::ReservedCharacter {
            segment: segment.to_string(),
            reserved,
        });
    }

    Ok(())
}

/// Errors for malformed topic identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TopicError {
    /// Identifier is empty
    #[error("empty topic segment")]
    EmptySegment,
    /// Identifier contains a reserved topic character
    #[error("topic segment '{segment}' contains reserved character '{reserved}'")]
    ReservedCharacter {
        /// The offending identifier
        segment: String,
        /// The reserved character found
        reserved: char,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_generation() {
        let scheme = TopicScheme::new("Root");

        assert_eq!(scheme.device_root("D1"), "Root/Devices/D1");
        assert_eq!(scheme.data_item("D1", "TEMP"), "Root/Devices/D1/TEMP");
        assert_eq!(scheme.node_state("fwd-1"), "Root/Nodes/fwd-1");
    }

    #[test]
    fn default_root_is_mtconnect() {
        let scheme = TopicScheme::default();
        assert_eq!(
            scheme.data_item("mill-01", "Xpos"),
            "MTConnect/Devices/mill-01/Xpos"
        );
    }

    #[test]
    fn topics_are_deterministic_and_distinct() {
        let scheme = TopicScheme::default();

        assert_eq!(scheme.data_item("D1", "X"), scheme.data_item("D1", "X"));
        assert_ne!(scheme.data_item("D1", "X"), scheme.data_item("D1", "Y"));
        assert_ne!(scheme.data_item("D1", "X"), scheme.data_item("D2", "X"));
    }

    #[test]
    fn topic_parsing() {
        let scheme = TopicScheme::new("site-a/MTConnect");

        let topic = scheme.data_item("lathe-7", "Srpm");
        assert_eq!(
            scheme.parse(&topic),
            Some(("lathe-7".to_string(), "Srpm".to_string()))
        );

        assert_eq!(scheme.parse("site-a/MTConnect/Devices/lathe-7"), None);
        assert_eq!(scheme.parse("other/Devices/lathe-7/Srpm"), None);
        assert_eq!(scheme.parse("site-a/MTConnect/Devices/lathe-7/a/b"), None);
    }

    #[test]
    fn wildcard_topics() {
        let scheme = TopicScheme::new("Root");

        assert_eq!(scheme.device_wildcard("D1"), "Root/Devices/D1/#");
        assert_eq!(scheme.devices_wildcard(), "Root/Devices/#");
    }

    #[test]
    fn segment_validation() {
        assert!(check_segment("mill-01").is_ok());
        assert_eq!(check_segment(""), Err(TopicError::EmptySegment));
        assert!(matches!(
            check_segment("a/b"),
            Err(TopicError::ReservedCharacter { reserved: '/', .. })
        ));
        assert!(check_segment("temp#1").is_err());
        assert!(check_segment("+").is_err());
    }
}
