//! Resurrection loop primitives.
//!
//! This library holds the decision logic for bringing a preempted instance
//! back up, separated from any I/O. Key concepts:
//!
//! - **Power state**: What the compute control plane reports for an instance.
//! - **Attempt**: One pass of the polling loop for a single instance.
//! - **Step**: What the loop does after each observation (start, wait, give up).
//!
//! # Invariants
//!
//! - An attempt asks for `start` at most once, and only after observing
//!   `TERMINATED`.
//! - `STOPPING` is waited on without bound.
//! - `RUNNING` is waited on at most `max_running_observations` times.
//! - Decisions are deterministic given the same sequence of observations.

use std::time::Duration;

/// Default wait between polls while the instance is stopping.
pub const DEFAULT_STOPPING_INTERVAL: Duration = Duration::from_secs(10);

/// Default wait between polls while the instance still reports running.
pub const DEFAULT_RUNNING_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of `RUNNING` observations tolerated before giving up.
///
/// With the default running interval this is roughly three minutes.
pub const DEFAULT_MAX_RUNNING_OBSERVATIONS: u32 = 6;

/// Power state of an instance as reported by the compute control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Stopping,
    Terminated,
    /// Any other status (provisioning, staging, suspending, ...).
    ///
    /// The raw string is kept for logging only.
    Other(String),
}

impl PowerState {
    /// Map a raw status string. Matching is case-sensitive.
    pub fn from_status(status: &str) -> Self {
        match status {
            "RUNNING" => PowerState::Running,
            "STOPPING" => PowerState::Stopping,
            "TERMINATED" => PowerState::Terminated,
            other => PowerState::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for PowerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PowerState::Running => write!(f, "RUNNING"),
            PowerState::Stopping => write!(f, "STOPPING"),
            PowerState::Terminated => write!(f, "TERMINATED"),
            PowerState::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// Timing and bounds for a resurrection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResurrectionPolicy {
    /// Wait between polls while the instance is stopping.
    pub stopping_interval: Duration,

    /// Wait between polls while the instance is running.
    pub running_interval: Duration,

    /// Give up once the running count exceeds this value.
    pub max_running_observations: u32,
}

impl Default for ResurrectionPolicy {
    fn default() -> Self {
        Self {
            stopping_interval: DEFAULT_STOPPING_INTERVAL,
            running_interval: DEFAULT_RUNNING_INTERVAL,
            max_running_observations: DEFAULT_MAX_RUNNING_OBSERVATIONS,
        }
    }
}

/// Why an attempt gave up without starting the instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbandonReason {
    /// The instance kept reporting `RUNNING`; the notification is stale.
    StillRunning { observations: u32 },

    /// The instance reported a status the loop does not handle.
    UnhandledState(String),
}

impl std::fmt::Display for AbandonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbandonReason::StillRunning { observations } => {
                write!(f, "still running after {} observations", observations)
            }
            AbandonReason::UnhandledState(status) => write!(f, "unhandled status {}", status),
        }
    }
}

/// What the loop should do after an observation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Issue the single start request; the attempt ends afterwards.
    Start,

    /// Sleep for the given duration, then poll again.
    Wait(Duration),

    /// Stop without starting.
    Abandon(AbandonReason),
}

/// Terminal result of an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// A start request was issued. `start_accepted` is false if the compute
    /// control plane rejected it; it is not retried either way.
    Resurrecting { start_accepted: bool },

    /// The attempt gave up without starting the instance.
    Abandoned(AbandonReason),

    /// Polling the instance failed (not found or query error).
    Error(String),
}

impl Outcome {
    /// Returns true if a start request was issued.
    pub fn is_resurrecting(&self) -> bool {
        matches!(self, Self::Resurrecting { .. })
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Resurrecting {
                start_accepted: true,
            } => write!(f, "resurrecting"),
            Outcome::Resurrecting {
                start_accepted: false,
            } => write!(f, "resurrecting (start rejected)"),
            Outcome::Abandoned(reason) => write!(f, "abandoned: {}", reason),
            Outcome::Error(reason) => write!(f, "error: {}", reason),
        }
    }
}

/// Decision state for one resurrection attempt.
///
/// Feed every poll result to [`ResurrectionAttempt::observe`] and follow the
/// returned [`Step`]. Once a terminal step (`Start` or `Abandon`) has been
/// returned the attempt is finished and must not be fed again.
#[derive(Debug, Clone)]
pub struct ResurrectionAttempt {
    policy: ResurrectionPolicy,
    running_count: u32,
    polls: u32,
}

impl ResurrectionAttempt {
    /// Create a fresh attempt.
    pub fn new(policy: ResurrectionPolicy) -> Self {
        Self {
            policy,
            running_count: 0,
            polls: 0,
        }
    }

    /// Number of `RUNNING` observations so far.
    pub fn running_count(&self) -> u32 {
        self.running_count
    }

    /// Number of observations so far.
    pub fn polls(&self) -> u32 {
        self.polls
    }

    /// Record an observed power state and decide the next step.
    pub fn observe(&mut self, state: &PowerState) -> Step {
        self.polls += 1;

        match state {
            PowerState::Terminated => Step::Start,
            PowerState::Stopping => Step::Wait(self.policy.stopping_interval),
            PowerState::Running => {
                self.running_count += 1;
                if self.running_count > self.policy.max_running_observations {
                    Step::Abandon(AbandonReason::StillRunning {
                        observations: self.running_count,
                    })
                } else {
                    Step::Wait(self.policy.running_interval)
                }
            }
            PowerState::Other(raw) => Step::Abandon(AbandonReason::UnhandledState(raw.clone())),
        }
    }
}

/// Capped exponential backoff for retrying a failing loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
}

impl Backoff {
    /// Create a backoff starting at `initial` and doubling up to `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            failures: 0,
        }
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures += 1;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Clear failure tracking (on success).
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}

/// Default first delay after a failed pull.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Default ceiling for the pull backoff.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(states: &[PowerState]) -> (Vec<Step>, ResurrectionAttempt) {
        let mut attempt = ResurrectionAttempt::new(ResurrectionPolicy::default());
        let steps = states.iter().map(|s| attempt.observe(s)).collect();
        (steps, attempt)
    }

    #[test]
    fn test_power_state_from_status() {
        assert_eq!(PowerState::from_status("RUNNING"), PowerState::Running);
        assert_eq!(PowerState::from_status("STOPPING"), PowerState::Stopping);
        assert_eq!(PowerState::from_status("TERMINATED"), PowerState::Terminated);
        assert_eq!(
            PowerState::from_status("PROVISIONING"),
            PowerState::Other("PROVISIONING".to_string())
        );
        // Case-sensitive
        assert_eq!(
            PowerState::from_status("terminated"),
            PowerState::Other("terminated".to_string())
        );
    }

    #[test]
    fn test_terminated_starts_immediately() {
        let (steps, attempt) = run(&[PowerState::Terminated]);
        assert_eq!(steps, vec![Step::Start]);
        assert_eq!(attempt.polls(), 1);
    }

    #[test]
    fn test_stopping_waits_short_interval() {
        let (steps, attempt) = run(&[
            PowerState::Stopping,
            PowerState::Stopping,
            PowerState::Terminated,
        ]);
        assert_eq!(
            steps,
            vec![
                Step::Wait(DEFAULT_STOPPING_INTERVAL),
                Step::Wait(DEFAULT_STOPPING_INTERVAL),
                Step::Start,
            ]
        );
        assert_eq!(attempt.running_count(), 0);
    }

    #[test]
    fn test_running_abandons_after_threshold() {
        let states = vec![PowerState::Running; 7];
        let (steps, attempt) = run(&states);

        for step in &steps[..6] {
            assert_eq!(*step, Step::Wait(DEFAULT_RUNNING_INTERVAL));
        }
        assert_eq!(
            steps[6],
            Step::Abandon(AbandonReason::StillRunning { observations: 7 })
        );
        assert_eq!(attempt.running_count(), 7);
    }

    #[test]
    fn test_running_then_terminated_starts() {
        let mut states = vec![PowerState::Running; 6];
        states.push(PowerState::Terminated);
        let (steps, _) = run(&states);
        assert_eq!(steps.last(), Some(&Step::Start));
    }

    #[test]
    fn test_stopping_does_not_reset_running_count() {
        let mut attempt = ResurrectionAttempt::new(ResurrectionPolicy {
            max_running_observations: 2,
            ..Default::default()
        });

        assert!(matches!(attempt.observe(&PowerState::Running), Step::Wait(_)));
        assert!(matches!(attempt.observe(&PowerState::Stopping), Step::Wait(_)));
        assert!(matches!(attempt.observe(&PowerState::Running), Step::Wait(_)));
        assert_eq!(
            attempt.observe(&PowerState::Running),
            Step::Abandon(AbandonReason::StillRunning { observations: 3 })
        );
    }

    #[test]
    fn test_other_state_abandons() {
        let (steps, _) = run(&[PowerState::Other("SUSPENDING".to_string())]);
        assert_eq!(
            steps,
            vec![Step::Abandon(AbandonReason::UnhandledState(
                "SUSPENDING".to_string()
            ))]
        );
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(
            Outcome::Resurrecting {
                start_accepted: true
            }
            .to_string(),
            "resurrecting"
        );
        assert_eq!(
            Outcome::Abandoned(AbandonReason::StillRunning { observations: 7 }).to_string(),
            "abandoned: still running after 7 observations"
        );
    }

    #[test]
    fn test_backoff() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5)); // capped
        assert_eq!(backoff.failures(), 4);

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
