//! Resurrection loop for a single preempted instance.
//!
//! The resurrector:
//! - Polls the instance power state through the [`ComputeApi`]
//! - Feeds each observation to a [`ResurrectionAttempt`]
//! - Sleeps, starts the instance, or gives up as the attempt decides
//!
//! Every failure is terminal for the attempt and reported as an [`Outcome`];
//! nothing is returned as an error to the caller.

use std::sync::Arc;

use nightking_events::InstanceRef;
use nightking_reconcile::{Outcome, PowerState, ResurrectionAttempt, ResurrectionPolicy, Step};
use tracing::{debug, info, warn};

use crate::clock::Sleeper;
use crate::poller::ComputeApi;

/// Drives resurrection attempts against the compute control plane.
pub struct Resurrector {
    /// Compute control plane (shared, read-only).
    compute: Arc<dyn ComputeApi>,

    /// Sleep between polls.
    sleeper: Arc<dyn Sleeper>,

    /// Timing and bounds for every attempt.
    policy: ResurrectionPolicy,
}

impl Resurrector {
    /// Create a new resurrector.
    pub fn new(
        compute: Arc<dyn ComputeApi>,
        sleeper: Arc<dyn Sleeper>,
        policy: ResurrectionPolicy,
    ) -> Self {
        Self {
            compute,
            sleeper,
            policy,
        }
    }

    /// Run one attempt to a terminal outcome.
    pub async fn resurrect(&self, instance: &InstanceRef) -> Outcome {
        let mut attempt = ResurrectionAttempt::new(self.policy.clone());
        debug!(instance = %instance, "Starting resurrection attempt");

        loop {
            let state = match self.compute.get_status(instance).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        instance = %instance,
                        error = %e,
                        "Failed to query instance - abandoning"
                    );
                    return Outcome::Error(e.to_string());
                }
            };

            match attempt.observe(&state) {
                Step::Start => {
                    info!(instance = %instance, polls = attempt.polls(), "Instance terminated");
                    return self.start(instance).await;
                }
                Step::Wait(delay) => {
                    match state {
                        PowerState::Running => info!(
                            instance = %instance,
                            running_count = attempt.running_count(),
                            wait_secs = delay.as_secs(),
                            "Instance still running - waiting for its termination"
                        ),
                        _ => info!(
                            instance = %instance,
                            state = %state,
                            wait_secs = delay.as_secs(),
                            "Instance is stopping - waiting for termination"
                        ),
                    }
                    self.sleeper.sleep(delay).await;
                }
                Step::Abandon(reason) => {
                    info!(
                        instance = %instance,
                        state = %state,
                        reason = %reason,
                        "Not resurrecting instance"
                    );
                    return Outcome::Abandoned(reason);
                }
            }
        }
    }

    /// Issue the single start request of an attempt.
    async fn start(&self, instance: &InstanceRef) -> Outcome {
        info!(instance = %instance, "Attempting to start instance");

        match self.compute.start(instance).await {
            Ok(()) => {
                info!(instance = %instance, "Start request accepted");
                Outcome::Resurrecting {
                    start_accepted: true,
                }
            }
            Err(e) => {
                warn!(instance = %instance, error = %e, "Start request failed");
                Outcome::Resurrecting {
                    start_accepted: false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use nightking_reconcile::AbandonReason;

    use super::*;
    use crate::clock::RecordingSleeper;
    use crate::poller::MockCompute;

    fn foo() -> InstanceRef {
        InstanceRef::new("foo", "bar").unwrap()
    }

    fn resurrector(compute: &Arc<MockCompute>, sleeper: &Arc<RecordingSleeper>) -> Resurrector {
        Resurrector::new(
            Arc::clone(compute) as Arc<dyn ComputeApi>,
            Arc::clone(sleeper) as Arc<dyn Sleeper>,
            ResurrectionPolicy::default(),
        )
    }

    #[tokio::test]
    async fn test_stopping_then_terminated_starts_once() {
        let compute = Arc::new(
            MockCompute::new().with_script("foo", ["STOPPING", "STOPPING", "TERMINATED"]),
        );
        let sleeper = Arc::new(RecordingSleeper::new());

        let outcome = resurrector(&compute, &sleeper).resurrect(&foo()).await;

        assert_eq!(
            outcome,
            Outcome::Resurrecting {
                start_accepted: true
            }
        );
        assert_eq!(compute.start_calls(), vec![foo()]);
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_secs(10), Duration::from_secs(10)]
        );
    }

    #[tokio::test]
    async fn test_running_seven_times_abandons() {
        let compute = Arc::new(MockCompute::new().with_script("foo", ["RUNNING"; 7]));
        let sleeper = Arc::new(RecordingSleeper::new());

        let outcome = resurrector(&compute, &sleeper).resurrect(&foo()).await;

        assert_eq!(
            outcome,
            Outcome::Abandoned(AbandonReason::StillRunning { observations: 7 })
        );
        assert!(compute.start_calls().is_empty());
        assert_eq!(compute.poll_count("foo"), 7);
        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(30); 6]);
        assert_eq!(sleeper.total(), Duration::from_secs(180));
    }

    #[tokio::test]
    async fn test_not_found_errors_immediately() {
        let compute = Arc::new(MockCompute::new());
        let sleeper = Arc::new(RecordingSleeper::new());

        let outcome = resurrector(&compute, &sleeper).resurrect(&foo()).await;

        assert!(matches!(outcome, Outcome::Error(_)));
        assert!(compute.start_calls().is_empty());
        assert_eq!(compute.poll_count("foo"), 1);
        assert!(sleeper.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_unhandled_state_abandons_without_retry() {
        let compute = Arc::new(MockCompute::new().with_script("foo", ["SUSPENDING", "TERMINATED"]));
        let sleeper = Arc::new(RecordingSleeper::new());

        let outcome = resurrector(&compute, &sleeper).resurrect(&foo()).await;

        assert_eq!(
            outcome,
            Outcome::Abandoned(AbandonReason::UnhandledState("SUSPENDING".to_string()))
        );
        assert_eq!(compute.poll_count("foo"), 1);
        assert!(compute.start_calls().is_empty());
    }

    #[tokio::test]
    async fn test_error_after_waiting() {
        // Script runs out after one STOPPING, so the second poll fails
        let compute = Arc::new(MockCompute::new().with_script("foo", ["STOPPING"]));
        let sleeper = Arc::new(RecordingSleeper::new());

        let outcome = resurrector(&compute, &sleeper).resurrect(&foo()).await;

        assert!(matches!(outcome, Outcome::Error(_)));
        assert!(compute.start_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_start_is_not_retried() {
        let compute = Arc::new(MockCompute::failing_starts().with_script("foo", ["TERMINATED"]));
        let sleeper = Arc::new(RecordingSleeper::new());

        let outcome = resurrector(&compute, &sleeper).resurrect(&foo()).await;

        assert_eq!(
            outcome,
            Outcome::Resurrecting {
                start_accepted: false
            }
        );
        assert_eq!(compute.start_calls().len(), 1);
        assert_eq!(compute.poll_count("foo"), 1);
    }

    #[tokio::test]
    async fn test_custom_policy_intervals() {
        let compute = Arc::new(
            MockCompute::new().with_script("foo", ["STOPPING", "RUNNING", "TERMINATED"]),
        );
        let sleeper = Arc::new(RecordingSleeper::new());
        let resurrector = Resurrector::new(
            Arc::clone(&compute) as Arc<dyn ComputeApi>,
            Arc::clone(&sleeper) as Arc<dyn Sleeper>,
            ResurrectionPolicy {
                stopping_interval: Duration::from_millis(5),
                running_interval: Duration::from_millis(7),
                max_running_observations: 1,
            },
        );

        let outcome = resurrector.resurrect(&foo()).await;

        assert!(outcome.is_resurrecting());
        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_millis(5), Duration::from_millis(7)]
        );
    }
}
