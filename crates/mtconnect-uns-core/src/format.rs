//! Observation payload formatting.

use crate::observation::Observation;

/// Converts observations into wire payloads.
pub trait ObservationFormatter: Send + Sync {
    /// MIME type of the produced payload.
    fn content_type(&self) -> &'static str;

    /// Format one observation.
    ///
    /// # Errors
    ///
    /// Returns error if the observation cannot be encoded.
    fn format(&self, observation: &Observation) -> Result<Vec<u8>, FormatError>;
}

/// JSON formatter using MTConnect-style camelCase field names.
///
/// Produces `{"deviceUuid", "dataItemId", "timestamp", "sequence", "value"}`
/// plus `category`, `type` and `name` when known.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl JsonFormatter {
    /// Compact JSON formatter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ObservationFormatter for JsonFormatter {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn format(&self, observation: &Observation) -> Result<Vec<u8>, FormatError> {
        serde_json::to_vec(observation).map_err(|e| FormatError::Serialize(e.to_string()))
    }
}

/// Errors that can occur formatting observations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FormatError {
    /// Encoding failed
    #[error("serialize error: {0}")]
    Serialize(String),
}
