//! Error types for notification decoding.

use thiserror::Error;

/// Errors that can occur when decoding a preemption notification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload is not a JSON object with string fields.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// One or more mandatory fields are absent or empty.
    #[error("missing mandatory field(s): {}", .fields.join(", "))]
    MissingField { fields: Vec<&'static str> },
}

impl From<serde_json::Error> for DecodeError {
    fn from(err: serde_json::Error) -> Self {
        DecodeError::MalformedPayload(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_field_display_lists_every_field() {
        let err = DecodeError::MissingField {
            fields: vec!["name", "zone"],
        };
        assert_eq!(err.to_string(), "missing mandatory field(s): name, zone");
    }
}
