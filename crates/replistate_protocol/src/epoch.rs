//! Epoch and sequence-number model.
//!
//! An [`Epoch`] identifies a configuration generation of the replica set.
//! Within a single epoch, sequence numbers strictly increase; across epochs,
//! the pair `(epoch, sequence_number)` is ordered lexicographically by epoch
//! then sequence number.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Sequence number assigned to each replicated operation.
///
/// Sequence numbers are monotonically increasing and gap-free within an
/// epoch. Zero means "not yet assigned".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceNumber(pub u64);

impl SequenceNumber {
    /// The invalid / unassigned sequence number.
    pub const INVALID: Self = Self(0);

    /// Creates a new sequence number.
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw sequence value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the next sequence number.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true if this sequence number has been assigned.
    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// A configuration generation of the replica set.
///
/// The epoch advances on every reconfiguration. A new epoch with a different
/// data-loss version signals potential data loss requiring provider
/// intervention. The data-loss version dominates the ordering: a data-loss
/// transition supersedes any number of ordinary reconfigurations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Epoch {
    /// Configuration version, bumped on every membership change.
    pub configuration_version: u64,
    /// Data-loss version, bumped when progress may have been lost.
    pub data_loss_version: u64,
}

impl Epoch {
    /// The zero epoch, before any configuration has been established.
    pub const ZERO: Self = Self {
        configuration_version: 0,
        data_loss_version: 0,
    };

    /// Creates a new epoch.
    #[must_use]
    pub const fn new(configuration_version: u64, data_loss_version: u64) -> Self {
        Self {
            configuration_version,
            data_loss_version,
        }
    }

    /// Returns the epoch that follows this one after an ordinary
    /// reconfiguration.
    #[must_use]
    pub const fn next_configuration(self) -> Self {
        Self {
            configuration_version: self.configuration_version + 1,
            data_loss_version: self.data_loss_version,
        }
    }

    /// Returns the epoch that follows this one after a data-loss
    /// transition.
    #[must_use]
    pub const fn next_data_loss(self) -> Self {
        Self {
            configuration_version: self.configuration_version + 1,
            data_loss_version: self.data_loss_version + 1,
        }
    }
}

impl Ord for Epoch {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.data_loss_version, self.configuration_version)
            .cmp(&(other.data_loss_version, other.configuration_version))
    }
}

impl PartialOrd for Epoch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch:{}.{}", self.data_loss_version, self.configuration_version)
    }
}

/// A point in the global operation order: an epoch plus the last sequence
/// number applied within it.
///
/// Ordered lexicographically by epoch then sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Progress {
    /// The configuration generation.
    pub epoch: Epoch,
    /// The last sequence number applied within that generation.
    pub sequence_number: SequenceNumber,
}

impl Progress {
    /// Creates a new progress point.
    #[must_use]
    pub const fn new(epoch: Epoch, sequence_number: SequenceNumber) -> Self {
        Self {
            epoch,
            sequence_number,
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sequence_number, self.epoch)
    }
}
