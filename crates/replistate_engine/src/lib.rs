//! # Replistate Engine
//!
//! Replication engine for replistate.
//!
//! This crate provides:
//! - The state replicator (primary fan-out, quorum tracking, streams)
//! - Replication queue with gap-free sequence assignment
//! - Replica-set membership and catch-up quorum waits
//! - Copy and replication operation streams
//! - Atomic multi-operation groups
//! - State provider and replica link abstractions
//!
//! ## Architecture
//!
//! One [`StateReplicator`] runs per replica. The **primary** assigns
//! sequence numbers, fans operations out over [`ReplicaLink`]s, and
//! completes each replication once a write quorum has acknowledged it.
//! A **secondary** consumes two ordered streams: a finite copy stream
//! that brings it up to the build point, then the live replication
//! stream. The hosted state plugs in through [`StateProvider`].
//!
//! ## Key Invariants
//!
//! - Sequence numbers are gap-free per epoch; submission order is
//!   sequence order
//! - An operation commits only after a write quorum (including the
//!   primary) has acknowledged it
//! - Epochs never regress; stale-epoch operations are fenced
//! - Atomic groups resolve exactly once, commit or rollback
//! - Timeout and cancellation are advisory and never retract an
//!   operation already assigned a sequence number

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod atomic;
mod cancel;
mod config;
mod error;
mod link;
mod membership;
mod provider;
mod queue;
mod quorum;
mod replicator;
mod stream;

pub use atomic::{AtomicGroupState, AtomicGroupTable};
pub use cancel::CancellationToken;
pub use config::{ReplicatorSettings, RetryConfig};
pub use error::{ReplicationError, ReplicationResult};
pub use link::{MockConnector, MockLink, ReplicaConnector, ReplicaLink};
pub use membership::ReplicaSetTracker;
pub use provider::{MemoryStateProvider, StateProvider};
pub use queue::{QueueCounters, ReplicationQueue};
pub use quorum::{quorum_committed_lsn, write_quorum};
pub use replicator::{
    OpenMode, PendingReplication, QuorumReceipt, ReplicatorCapability, ReplicatorStatus,
    StateReplicator,
};
pub use stream::{
    AcknowledgementSink, FaultKind, Operation, OperationStream, OperationStreamWriter, StreamKind,
};
