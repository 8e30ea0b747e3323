//! # Replistate Protocol
//!
//! Protocol types for the replistate replicated state machine.
//!
//! This crate provides:
//! - [`Epoch`] and [`SequenceNumber`] for ordering operations and
//!   configuration generations
//! - [`OperationData`] and [`OperationEnvelope`] for replicated payloads
//! - [`ReplicaInformation`] and [`ReplicaSetConfiguration`] for membership
//!   and quorum computation
//! - CBOR encoding/decoding for the wire shapes
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod epoch;
mod error;
mod operation;
mod replica;

pub use epoch::{Epoch, Progress, SequenceNumber};
pub use error::{ProtocolError, ProtocolResult};
pub use operation::{AtomicGroupId, OperationData, OperationEnvelope, OperationType};
pub use replica::{
    ReplicaId, ReplicaInformation, ReplicaRole, ReplicaSetConfiguration, ReplicaSetQuorumMode,
    ReplicaStatus,
};
