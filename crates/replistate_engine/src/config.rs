//! Configuration for the replicator.

use std::time::Duration;

/// Transport-level settings accepted and returned by the replicator.
///
/// The core passes these through to the transport collaborator and does not
/// interpret their semantics beyond the acknowledgement toggle. They can be
/// swapped at runtime without interrupting in-flight operations.
#[derive(Debug, Clone)]
pub struct ReplicatorSettings {
    /// Address this replicator publishes for inbound replication traffic.
    pub replicator_address: String,
    /// Interval at which secondaries batch acknowledgements.
    pub batch_acknowledgement_interval: Duration,
    /// Interval between delivery retries at the transport.
    pub retry_interval: Duration,
    /// Initial replication queue capacity, in operations.
    pub initial_queue_size: usize,
    /// Maximum replication queue capacity, in operations.
    pub max_queue_size: usize,
    /// Opaque security credentials handed to the transport.
    pub security_credentials: Option<String>,
    /// Whether delivered operations must be explicitly acknowledged.
    ///
    /// Persisted providers require explicit acknowledgement; volatile
    /// providers may disable this and have the stream acknowledge on
    /// delivery.
    pub require_acknowledgement: bool,
}

impl ReplicatorSettings {
    /// Creates settings publishing the given address.
    pub fn new(replicator_address: impl Into<String>) -> Self {
        Self {
            replicator_address: replicator_address.into(),
            batch_acknowledgement_interval: Duration::from_millis(15),
            retry_interval: Duration::from_secs(5),
            initial_queue_size: 64,
            max_queue_size: 1024,
            security_credentials: None,
            require_acknowledgement: true,
        }
    }

    /// Sets the batch acknowledgement interval.
    #[must_use]
    pub fn with_batch_acknowledgement_interval(mut self, interval: Duration) -> Self {
        self.batch_acknowledgement_interval = interval;
        self
    }

    /// Sets the transport retry interval.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Sets the queue capacity bounds.
    #[must_use]
    pub fn with_queue_sizes(mut self, initial: usize, max: usize) -> Self {
        self.initial_queue_size = initial;
        self.max_queue_size = max;
        self
    }

    /// Sets the opaque security credentials.
    #[must_use]
    pub fn with_security_credentials(mut self, credentials: impl Into<String>) -> Self {
        self.security_credentials = Some(credentials.into());
        self
    }

    /// Disables explicit acknowledgement for volatile providers.
    #[must_use]
    pub fn with_auto_acknowledgement(mut self) -> Self {
        self.require_acknowledgement = false;
        self
    }
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self::new("")
    }
}

/// Retry behavior for callers that choose to retry retryable errors.
///
/// The core itself never retries; this is offered to the orchestration
/// layer above it.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Initial delay between attempts.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Creates a retry configuration.
    #[must_use]
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }

    /// Creates a configuration with no retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
