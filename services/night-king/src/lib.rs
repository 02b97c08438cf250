//! Night King resurrection service library.
//!
//! Night King listens for preemption notifications and restarts the affected
//! compute instance once it has fully powered down.
//!
//! ## Architecture
//!
//! ```text
//! Pub/Sub subscription
//!        │ pull
//!        ▼
//! Dispatcher ── decode ──► Resurrector ── poll/start ──► Compute API
//!        │                     │
//!        └──── ack ◄───────────┘
//! ```
//!
//! ## Modules
//!
//! - `dispatcher`: receive loop, one task per notification, acknowledgment
//! - `resurrector`: the polling loop for one instance
//! - `poller`: compute interface and mock
//! - `compute`, `pubsub`, `auth`: REST clients for the collaborators
//! - `clock`: injectable sleeping

pub mod auth;
pub mod clock;
pub mod compute;
pub mod config;
pub mod dispatcher;
pub mod poller;
pub mod pubsub;
pub mod resurrector;

// Re-export commonly used types
pub use clock::{RecordingSleeper, Sleeper, TokioSleeper};
pub use dispatcher::{Disposition, Dispatcher, DispatcherConfig};
pub use poller::{ComputeApi, ComputeError, MockCompute};
pub use pubsub::{MockSubscription, Notification, NotificationSource};
pub use resurrector::Resurrector;
