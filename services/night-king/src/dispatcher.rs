//! Dispatcher bridging inbound notifications to resurrection attempts.
//!
//! The dispatcher:
//! - Pulls notifications from the [`NotificationSource`]
//! - Runs one task per notification: decode, resurrect, acknowledge
//! - Bounds the number of concurrent attempts
//! - Keeps renewing the ack deadline of a notification while it is handled
//!
//! Every delivery is acknowledged exactly once, whatever the decode or
//! resurrection outcome. Resurrection failures are not fixed by redelivery.

use std::sync::Arc;
use std::time::Duration;

use nightking_events::{decode, DecodeError, InstanceRef};
use nightking_reconcile::{Backoff, Outcome};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::pubsub::{Notification, NotificationSource};
use crate::resurrector::Resurrector;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum attempts running at once.
    pub max_concurrent_attempts: usize,

    /// Maximum notifications requested per pull.
    pub pull_batch_size: u32,

    /// Deadline requested for each in-flight notification, renewed at half
    /// this period until the notification is acknowledged.
    pub ack_deadline: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_attempts: 32,
            pull_batch_size: 10,
            ack_deadline: Duration::from_secs(60),
        }
    }
}

impl From<&Config> for DispatcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            max_concurrent_attempts: config.max_concurrent_attempts,
            pull_batch_size: config.pull_batch_size,
            ack_deadline: config.ack_deadline,
        }
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The payload could not be decoded; dropped without an attempt.
    Dropped(DecodeError),

    /// An attempt ran to completion.
    Completed {
        instance: InstanceRef,
        outcome: Outcome,
    },
}

/// Routes notifications to resurrection attempts.
#[derive(Clone)]
pub struct Dispatcher {
    source: Arc<dyn NotificationSource>,
    resurrector: Arc<Resurrector>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Create a new dispatcher.
    pub fn new(
        source: Arc<dyn NotificationSource>,
        resurrector: Arc<Resurrector>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            source,
            resurrector,
            config,
        }
    }

    /// Handle one delivery and acknowledge it.
    ///
    /// The ack deadline is extended right away and then at half the
    /// configured deadline for as long as the attempt runs.
    pub async fn handle(&self, notification: Notification) -> Disposition {
        debug!(
            subscription = %self.source.name(),
            message_id = %notification.message_id,
            publish_time = ?notification.publish_time,
            "Handling message"
        );

        let deadline_secs = u32::try_from(self.config.ack_deadline.as_secs()).unwrap_or(u32::MAX);
        let period = (self.config.ack_deadline / 2).max(Duration::from_secs(1));
        let mut lease = tokio::time::interval(period);
        lease.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let attempt = self.process(&notification);
        tokio::pin!(attempt);

        let disposition = loop {
            tokio::select! {
                biased;
                disposition = &mut attempt => break disposition,
                _ = lease.tick() => self.extend_lease(&notification, deadline_secs).await,
            }
        };

        debug!(message_id = %notification.message_id, "ACKing message");
        if let Err(e) = self.source.acknowledge(&notification.ack_id).await {
            error!(
                message_id = %notification.message_id,
                error = %e,
                "Failed to acknowledge message"
            );
        }

        disposition
    }

    async fn process(&self, notification: &Notification) -> Disposition {
        match decode(&notification.data) {
            Ok(instance) => {
                let outcome = self.resurrector.resurrect(&instance).await;
                info!(
                    message_id = %notification.message_id,
                    instance = %instance,
                    outcome = %outcome,
                    "Resurrection attempt finished"
                );
                Disposition::Completed { instance, outcome }
            }
            Err(e) => {
                warn!(
                    message_id = %notification.message_id,
                    error = %e,
                    data = %String::from_utf8_lossy(&notification.data),
                    "Failed parsing message - ignoring"
                );
                Disposition::Dropped(e)
            }
        }
    }

    async fn extend_lease(&self, notification: &Notification, seconds: u32) {
        debug!(
            message_id = %notification.message_id,
            ack_deadline_secs = seconds,
            "Extending ack deadline"
        );
        if let Err(e) = self
            .source
            .modify_ack_deadline(&notification.ack_id, seconds)
            .await
        {
            warn!(
                message_id = %notification.message_id,
                error = %e,
                "Failed to extend ack deadline"
            );
        }
    }

    /// Run the receive loop until shutdown.
    ///
    /// In-flight attempts are aborted on shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            subscription = %self.source.name(),
            max_concurrent_attempts = self.config.max_concurrent_attempts,
            pull_batch_size = self.config.pull_batch_size,
            ack_deadline_secs = self.config.ack_deadline.as_secs(),
            "Listening for messages"
        );

        let slots = Arc::new(Semaphore::new(self.config.max_concurrent_attempts));
        let mut tasks = JoinSet::new();
        let mut backoff = Backoff::default();

        loop {
            while let Some(result) = tasks.try_join_next() {
                if let Err(e) = result {
                    error!(error = %e, "Message task panicked");
                }
            }

            // Only pull once there is room for at least one attempt
            let first_slot = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown_requested(&mut shutdown) => break,
            };

            let batch_size = self
                .config
                .pull_batch_size
                .min(u32::try_from(slots.available_permits() + 1).unwrap_or(u32::MAX));

            let pulled = tokio::select! {
                pulled = self.source.pull(batch_size) => pulled,
                _ = shutdown_requested(&mut shutdown) => break,
            };

            let notifications = match pulled {
                Ok(notifications) => {
                    backoff.reset();
                    notifications
                }
                Err(e) => {
                    drop(first_slot);
                    let delay = backoff.next_delay();
                    if backoff.failures() <= 3 {
                        warn!(
                            error = %e,
                            consecutive_failures = backoff.failures(),
                            retry_in_secs = delay.as_secs(),
                            "Pull failed"
                        );
                    } else {
                        error!(
                            error = %e,
                            consecutive_failures = backoff.failures(),
                            retry_in_secs = delay.as_secs(),
                            "Pull failed repeatedly"
                        );
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = shutdown_requested(&mut shutdown) => break,
                    }
                }
            };

            let mut first_slot = Some(first_slot);
            for notification in notifications {
                let permit = match first_slot.take() {
                    Some(permit) => permit,
                    None => match Arc::clone(&slots).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let dispatcher = self.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    dispatcher.handle(notification).await
                });
            }
        }

        if !tasks.is_empty() {
            info!(in_flight = tasks.len(), "Abandoning in-flight attempts");
        }
        tasks.shutdown().await;
        info!("Dispatcher shutting down");
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
