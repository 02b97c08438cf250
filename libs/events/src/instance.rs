//! Instance references carried by preemption notifications.

use serde::Deserialize;

use crate::error::DecodeError;

/// Field name of the instance name in the notification payload.
pub const FIELD_NAME: &str = "name";

/// Field name of the instance zone in the notification payload.
pub const FIELD_ZONE: &str = "zone";

/// Identifies a compute instance by name and zone.
///
/// Both fields are guaranteed non-empty: the only ways to obtain a value are
/// [`InstanceRef::new`] and [`decode`], which reject blank fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceRef {
    name: String,
    location: String,
}

impl InstanceRef {
    /// Build a reference, rejecting blank fields.
    pub fn new(
        name: impl Into<String>,
        location: impl Into<String>,
    ) -> Result<Self, DecodeError> {
        let name = name.into();
        let location = location.into();

        let mut missing = Vec::new();
        if name.is_empty() {
            missing.push(FIELD_NAME);
        }
        if location.is_empty() {
            missing.push(FIELD_ZONE);
        }
        if !missing.is_empty() {
            return Err(DecodeError::MissingField { fields: missing });
        }

        Ok(Self { name, location })
    }

    /// Instance name, unique within its zone.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Zone the instance lives in.
    pub fn location(&self) -> &str {
        &self.location
    }
}

impl std::fmt::Display for InstanceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.location, self.name)
    }
}

/// Wire shape of the notification payload.
///
/// Absent fields default to empty so that they are reported as missing
/// rather than as a syntax error.
#[derive(Debug, Deserialize)]
struct RawPayload {
    #[serde(default)]
    name: String,
    #[serde(default)]
    zone: String,
}

/// Decode a raw notification payload into an [`InstanceRef`].
///
/// The payload must be a JSON object with non-empty string fields `name`
/// and `zone`. Unknown fields are ignored.
pub fn decode(data: &[u8]) -> Result<InstanceRef, DecodeError> {
    let raw: RawPayload = serde_json::from_slice(data)?;
    InstanceRef::new(raw.name, raw.zone)
}
