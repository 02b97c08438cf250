//! Instance state poller interface and mock implementation.
//!
//! The poller abstracts the two compute operations the resurrection loop
//! needs:
//! - Describing an instance to read its power state
//! - Requesting that a stopped instance be started
//!
//! A mock implementation is provided for testing and development.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use nightking_events::InstanceRef;
use nightking_reconcile::PowerState;
use thiserror::Error;
use tracing::{debug, info};

/// Errors from the compute control plane.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// The instance does not exist (anymore).
    #[error("instance {instance} not found")]
    InstanceNotFound { instance: InstanceRef },

    /// Describing the instance failed for any other reason.
    #[error("query for instance {instance} failed: {reason}")]
    QueryFailed {
        instance: InstanceRef,
        reason: String,
    },

    /// The start request was rejected or could not be sent.
    #[error("start request for instance {instance} failed: {reason}")]
    StartRequestFailed {
        instance: InstanceRef,
        reason: String,
    },
}

/// Compute control plane operations used by the resurrection loop.
#[async_trait]
pub trait ComputeApi: Send + Sync {
    /// Read the current power state of an instance.
    async fn get_status(&self, instance: &InstanceRef) -> Result<PowerState, ComputeError>;

    /// Ask the control plane to start an instance.
    ///
    /// Returns once the request is accepted or rejected; does not wait for
    /// the instance to come up.
    async fn start(&self, instance: &InstanceRef) -> Result<(), ComputeError>;
}

/// Mock compute control plane for testing and development.
///
/// Each instance name has a scripted sequence of status strings, consumed one
/// per poll. Unscripted instances are reported as not found; an exhausted
/// script fails the query.
#[derive(Default)]
pub struct MockCompute {
    /// Remaining statuses per instance name.
    scripts: Mutex<HashMap<String, VecDeque<String>>>,

    /// Polls served per instance name.
    polls: Mutex<HashMap<String, u32>>,

    /// Every start request received, in order.
    starts: Mutex<Vec<InstanceRef>>,

    /// Whether start requests should be rejected.
    fail_starts: bool,
}

impl MockCompute {
    /// Create a mock with no instances.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock that rejects every start request.
    pub fn failing_starts() -> Self {
        Self {
            fail_starts: true,
            ..Self::default()
        }
    }

    /// Script the statuses returned for an instance name.
    pub fn with_script<I, S>(self, name: &str, statuses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock_scripts().insert(
            name.to_string(),
            statuses.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// Start requests received so far.
    pub fn start_calls(&self) -> Vec<InstanceRef> {
        self.starts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Number of polls served for an instance name.
    pub fn poll_count(&self, name: &str) -> u32 {
        self.polls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    fn lock_scripts(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        self.scripts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ComputeApi for MockCompute {
    async fn get_status(&self, instance: &InstanceRef) -> Result<PowerState, ComputeError> {
        *self
            .polls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(instance.name().to_string())
            .or_insert(0) += 1;

        let mut scripts = self.lock_scripts();
        let Some(script) = scripts.get_mut(instance.name()) else {
            return Err(ComputeError::InstanceNotFound {
                instance: instance.clone(),
            });
        };

        let status = script.pop_front().ok_or_else(|| ComputeError::QueryFailed {
            instance: instance.clone(),
            reason: "[MOCK] script exhausted".to_string(),
        })?;

        debug!(instance = %instance, status = %status, "[MOCK] Describing instance");
        Ok(PowerState::from_status(&status))
    }

    async fn start(&self, instance: &InstanceRef) -> Result<(), ComputeError> {
        info!(instance = %instance, "[MOCK] Starting instance");

        self.starts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(instance.clone());

        if self.fail_starts {
            return Err(ComputeError::StartRequestFailed {
                instance: instance.clone(),
                reason: "[MOCK] compute configured to fail".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn foo() -> InstanceRef {
        InstanceRef::new("foo", "bar").unwrap()
    }

    #[tokio::test]
    async fn test_mock_compute_follows_script() {
        let compute = MockCompute::new().with_script("foo", ["STOPPING", "TERMINATED"]);

        assert_eq!(compute.get_status(&foo()).await, Ok(PowerState::Stopping));
        assert_eq!(compute.get_status(&foo()).await, Ok(PowerState::Terminated));
        assert!(matches!(
            compute.get_status(&foo()).await,
            Err(ComputeError::QueryFailed { .. })
        ));
        assert_eq!(compute.poll_count("foo"), 3);
    }

    #[tokio::test]
    async fn test_mock_compute_unknown_instance() {
        let compute = MockCompute::new();
        assert_eq!(
            compute.get_status(&foo()).await,
            Err(ComputeError::InstanceNotFound { instance: foo() })
        );
    }

    #[tokio::test]
    async fn test_mock_compute_records_starts() {
        let compute = MockCompute::new();
        compute.start(&foo()).await.unwrap();
        assert_eq!(compute.start_calls(), vec![foo()]);
    }

    #[tokio::test]
    async fn test_mock_compute_failing_starts() {
        let compute = MockCompute::failing_starts();
        let result = compute.start(&foo()).await;
        assert!(matches!(
            result,
            Err(ComputeError::StartRequestFailed { .. })
        ));
        // The request is still recorded
        assert_eq!(compute.start_calls().len(), 1);
    }
}
