//! # nightking-events
//!
//! Preemption notification payloads for the Night King resurrection service.
//!
//! A notification names exactly one compute instance:
//!
//! ```json
//! { "name": "worker-1", "zone": "us-east1-b" }
//! ```
//!
//! Decoding is pure: the same bytes always produce the same
//! [`InstanceRef`] or the same [`DecodeError`].

mod error;
mod instance;

pub use error::DecodeError;
pub use instance::{decode, InstanceRef, FIELD_NAME, FIELD_ZONE};
