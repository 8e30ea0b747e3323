//! Error types for the replication engine.

use replistate_protocol::{AtomicGroupId, Epoch, ReplicaId, ReplicaRole, SequenceNumber};
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Errors that can occur in the replication core.
///
/// Protocol-level errors (role, quorum, timeout) are returned to the
/// immediate caller and never retried internally; retry policy belongs to
/// the orchestration layer above.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// A replicate call was attempted on a replica that is not Primary.
    #[error("not primary: replica role is {role}")]
    NotPrimary {
        /// The role the replica actually holds.
        role: ReplicaRole,
    },

    /// The operation is not legal for the replica's current role.
    #[error("operation not valid for role {role}")]
    InvalidRole {
        /// The role the replica actually holds.
        role: ReplicaRole,
    },

    /// No write quorum is reachable.
    #[error("write quorum unavailable: {acknowledged} of {required} acknowledgements")]
    QuorumUnavailable {
        /// Acknowledgements received so far.
        acknowledged: usize,
        /// Acknowledgements required.
        required: usize,
    },

    /// The caller-supplied duration elapsed.
    ///
    /// A timeout does not cancel the underlying replication attempt; the
    /// operation may still commit.
    #[error("operation timed out")]
    Timeout,

    /// The operation was cancelled.
    ///
    /// Cancellation is advisory; the operation may still have caused
    /// durable side effects.
    #[error("operation cancelled")]
    Cancelled,

    /// An operation carried an epoch older than the current one.
    #[error("stale epoch: operation epoch {operation}, current epoch {current}")]
    StaleEpoch {
        /// Epoch stamped on the operation.
        operation: Epoch,
        /// The replica's current epoch.
        current: Epoch,
    },

    /// Atomic-group contract violation: unknown id, member submitted after
    /// resolution, or double resolution.
    #[error("atomic group {group} misuse: {message}")]
    AtomicGroupInvalid {
        /// The offending group.
        group: AtomicGroupId,
        /// Description of the violation.
        message: String,
    },

    /// The replicator has been closed or aborted.
    #[error("replicator is closed")]
    Closed,

    /// The stream was detached by a fault report.
    #[error("stream faulted")]
    StreamFaulted,

    /// A second pull was issued while one was already outstanding.
    #[error("a stream pull is already outstanding")]
    PullOutstanding,

    /// An operation was already acknowledged.
    #[error("operation {sequence_number} already acknowledged")]
    AlreadyAcknowledged {
        /// The operation's sequence number.
        sequence_number: SequenceNumber,
    },

    /// An envelope arrived out of order on a stream intake.
    #[error("out-of-order operation: expected {expected}, got {got}")]
    OutOfOrder {
        /// The sequence number the intake expected next.
        expected: SequenceNumber,
        /// The sequence number actually received.
        got: SequenceNumber,
    },

    /// Lifecycle state machine violation.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current lifecycle state.
        from: &'static str,
        /// Attempted target state.
        to: &'static str,
    },

    /// The call requires a capability the replicator was not built with.
    #[error("atomic group operations are not supported by this replicator")]
    Unsupported,

    /// A known replica could not be found.
    #[error("unknown replica {0}")]
    UnknownReplica(ReplicaId),

    /// Transport seam failure.
    #[error("link error: {message}")]
    Link {
        /// Error message.
        message: String,
        /// Whether the delivery can be retried.
        retryable: bool,
    },

    /// Error propagated out of a state-provider callback.
    #[error("provider error: {0}")]
    Provider(String),
}

impl ReplicationError {
    /// Creates a retryable link error.
    pub fn link_retryable(message: impl Into<String>) -> Self {
        Self::Link {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable link error.
    pub fn link_fatal(message: impl Into<String>) -> Self {
        Self::Link {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a provider error.
    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    /// Returns true if the caller may retry the operation.
    ///
    /// Role violations, contract misuse, and disposal are never retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::QuorumUnavailable { .. } => true,
            ReplicationError::Timeout => true,
            ReplicationError::Link { retryable, .. } => *retryable,
            _ => false,
        }
    }
}
