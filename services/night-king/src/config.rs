//! Configuration for the resurrection service.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, ValueEnum};
use nightking_reconcile::ResurrectionPolicy;

use crate::pubsub::{MAX_ACK_DEADLINE_SECS, MIN_ACK_DEADLINE_SECS};

/// Default Pub/Sub subscription carrying preemption notifications.
pub const DEFAULT_SUBSCRIPTION: &str = "night-king-preempt";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Night King - restarts preempted compute instances once they terminate.
#[derive(Debug, Parser)]
#[command(name = "night-king")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Project that owns the subscription and the instances.
    #[arg(long, env = "NIGHTKING_PROJECT")]
    pub project: String,

    /// Pub/Sub subscription to listen to.
    #[arg(long, env = "NIGHTKING_SUBSCRIPTION", default_value = DEFAULT_SUBSCRIPTION)]
    pub subscription_name: String,

    /// Static OAuth access token. Defaults to the metadata server.
    #[arg(long, env = "NIGHTKING_ACCESS_TOKEN", hide_env_values = true)]
    pub access_token: Option<String>,

    /// Compute API endpoint.
    #[arg(
        long,
        env = "NIGHTKING_COMPUTE_ENDPOINT",
        default_value = "https://compute.googleapis.com"
    )]
    pub compute_endpoint: String,

    /// Pub/Sub API endpoint.
    #[arg(
        long,
        env = "NIGHTKING_PUBSUB_ENDPOINT",
        default_value = "https://pubsub.googleapis.com"
    )]
    pub pubsub_endpoint: String,

    /// Metadata server used for access tokens.
    #[arg(
        long,
        env = "NIGHTKING_METADATA_ENDPOINT",
        default_value = "http://metadata.google.internal"
    )]
    pub metadata_endpoint: String,

    /// Maximum resurrection attempts running at once.
    #[arg(long, default_value_t = 32)]
    pub max_concurrent_attempts: usize,

    /// Maximum notifications requested per pull.
    #[arg(long, default_value_t = 10)]
    pub pull_batch_size: u32,

    /// Ack deadline kept on a notification while its attempt runs.
    #[arg(long, default_value_t = 60)]
    pub ack_deadline_secs: u32,

    /// Seconds between polls while an instance is stopping.
    #[arg(long, default_value_t = 10)]
    pub stopping_interval_secs: u64,

    /// Seconds between polls while an instance is still running.
    #[arg(long, default_value_t = 30)]
    pub running_interval_secs: u64,

    /// RUNNING observations tolerated before giving up.
    #[arg(long, default_value_t = 6)]
    pub max_running_observations: u32,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "NIGHTKING_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Service configuration.
#[derive(Clone)]
pub struct Config {
    /// Project ID.
    pub project: String,

    /// Subscription name.
    pub subscription_name: String,

    /// Static access token, if provided.
    pub access_token: Option<String>,

    /// Compute API base URL, without trailing slash.
    pub compute_endpoint: String,

    /// Pub/Sub API base URL, without trailing slash.
    pub pubsub_endpoint: String,

    /// Metadata server base URL, without trailing slash.
    pub metadata_endpoint: String,

    pub max_concurrent_attempts: usize,

    pub pull_batch_size: u32,

    /// Lease renewed on in-flight notifications.
    pub ack_deadline: Duration,

    /// Polling policy for each resurrection attempt.
    pub policy: ResurrectionPolicy,

    pub log_level: String,

    pub log_format: LogFormat,
}

impl Config {
    /// Validate parsed arguments into a configuration.
    pub fn from_args(args: Args) -> Result<Self> {
        if args.project.trim().is_empty() {
            bail!("Mandatory flag `--project` missing");
        }
        if args.subscription_name.trim().is_empty() {
            bail!("`--subscription-name` must not be empty");
        }
        if args.max_concurrent_attempts == 0 {
            bail!("`--max-concurrent-attempts` must be at least 1");
        }
        if args.pull_batch_size == 0 {
            bail!("`--pull-batch-size` must be at least 1");
        }
        if !(MIN_ACK_DEADLINE_SECS..=MAX_ACK_DEADLINE_SECS).contains(&args.ack_deadline_secs) {
            bail!(
                "`--ack-deadline-secs` must be between {} and {}",
                MIN_ACK_DEADLINE_SECS,
                MAX_ACK_DEADLINE_SECS
            );
        }

        Ok(Self {
            project: args.project,
            subscription_name: args.subscription_name,
            access_token: args.access_token.filter(|t| !t.is_empty()),
            compute_endpoint: trim_endpoint(args.compute_endpoint),
            pubsub_endpoint: trim_endpoint(args.pubsub_endpoint),
            metadata_endpoint: trim_endpoint(args.metadata_endpoint),
            max_concurrent_attempts: args.max_concurrent_attempts,
            pull_batch_size: args.pull_batch_size,
            ack_deadline: Duration::from_secs(u64::from(args.ack_deadline_secs)),
            policy: ResurrectionPolicy {
                stopping_interval: Duration::from_secs(args.stopping_interval_secs),
                running_interval: Duration::from_secs(args.running_interval_secs),
                max_running_observations: args.max_running_observations,
            },
            log_level: args.log_level,
            log_format: args.log_format,
        })
    }
}

// Keeps the access token out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("project", &self.project)
            .field("subscription_name", &self.subscription_name)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<redacted>"),
            )
            .field("compute_endpoint", &self.compute_endpoint)
            .field("pubsub_endpoint", &self.pubsub_endpoint)
            .field("metadata_endpoint", &self.metadata_endpoint)
            .field("max_concurrent_attempts", &self.max_concurrent_attempts)
            .field("pull_batch_size", &self.pull_batch_size)
            .field("ack_deadline", &self.ack_deadline)
            .field("policy", &self.policy)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

fn trim_endpoint(endpoint: String) -> String {
    endpoint.trim_end_matches('/').to_string()
}
