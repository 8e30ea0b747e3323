//! Replica descriptions and replica-set configuration.
//!
//! These are the membership views handed to the replicator by the hosting
//! runtime. The replicator reads them for quorum and catch-up computation.

use crate::epoch::SequenceNumber;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a replica within the replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl ReplicaId {
    /// Creates a new replica ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica:{}", self.0)
    }
}

/// Role of a replica.
///
/// The role governs which operations are legal: only a Primary replicates;
/// secondaries consume streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Role has not been established.
    Unknown,
    /// The replica holds no role in the set.
    None,
    /// The replica accepts writes and drives replication.
    Primary,
    /// A secondary still building its state; not counted toward quorum.
    IdleSecondary,
    /// A secondary that is part of the active configuration.
    ActiveSecondary,
}

impl ReplicaRole {
    /// Returns true if this role may submit replicate calls.
    #[must_use]
    pub fn can_replicate(self) -> bool {
        matches!(self, ReplicaRole::Primary)
    }

    /// Returns true if this role consumes copy/replication streams.
    #[must_use]
    pub fn consumes_streams(self) -> bool {
        matches!(self, ReplicaRole::IdleSecondary | ReplicaRole::ActiveSecondary)
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaRole::Unknown => "unknown",
            ReplicaRole::None => "none",
            ReplicaRole::Primary => "primary",
            ReplicaRole::IdleSecondary => "idle-secondary",
            ReplicaRole::ActiveSecondary => "active-secondary",
        };
        f.write_str(name)
    }
}

/// Liveness status of a replica as seen by the primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// The replica is reachable.
    Up,
    /// The replica is down; it cannot acknowledge operations.
    Down,
}

/// Describes one member of the replica set for quorum and catch-up
/// computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaInformation {
    /// Replica ID.
    pub id: ReplicaId,
    /// Current role.
    pub role: ReplicaRole,
    /// Liveness status.
    pub status: ReplicaStatus,
    /// Address the transport resolves to reach this replica's replicator.
    pub replicator_address: String,
    /// Last sequence number the replica has applied.
    pub current_progress: SequenceNumber,
    /// Earliest sequence number the replica can catch up from.
    pub catch_up_capability: SequenceNumber,
    /// If set, catch-up waits must include this replica regardless of
    /// quorum mode.
    pub must_catch_up: bool,
}

impl ReplicaInformation {
    /// Creates an active secondary description with empty progress.
    #[must_use]
    pub fn active_secondary(id: ReplicaId, replicator_address: impl Into<String>) -> Self {
        Self {
            id,
            role: ReplicaRole::ActiveSecondary,
            status: ReplicaStatus::Up,
            replicator_address: replicator_address.into(),
            current_progress: SequenceNumber::INVALID,
            catch_up_capability: SequenceNumber::INVALID,
            must_catch_up: false,
        }
    }

    /// Creates an idle secondary description for a replica being built.
    #[must_use]
    pub fn idle_secondary(id: ReplicaId, replicator_address: impl Into<String>) -> Self {
        Self {
            role: ReplicaRole::IdleSecondary,
            ..Self::active_secondary(id, replicator_address)
        }
    }

    /// Marks this replica as mandatory for catch-up waits.
    #[must_use]
    pub fn with_must_catch_up(mut self) -> Self {
        self.must_catch_up = true;
        self
    }
}

/// Governs whether catch-up requires all active replicas or only a write
/// quorum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaSetQuorumMode {
    /// Wait until a write quorum has caught up.
    WriteQuorum,
    /// Wait until every up, active replica has caught up.
    All,
}

/// A membership view of the replica set.
///
/// The view lists the remote members; the primary itself is implied and
/// counts toward the write quorum.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSetConfiguration {
    /// Remote members of this configuration.
    pub replicas: Vec<ReplicaInformation>,
    /// Number of acknowledgements (including the primary's own) required
    /// for a write to be durable.
    pub write_quorum: usize,
}

impl ReplicaSetConfiguration {
    /// Creates a configuration with a majority write quorum over the given
    /// remote replicas plus the primary.
    #[must_use]
    pub fn new(replicas: Vec<ReplicaInformation>) -> Self {
        let write_quorum = majority(replicas.len() + 1);
        Self {
            replicas,
            write_quorum,
        }
    }

    /// Creates a configuration with an explicit write quorum.
    #[must_use]
    pub fn with_write_quorum(replicas: Vec<ReplicaInformation>, write_quorum: usize) -> Self {
        Self {
            replicas,
            write_quorum,
        }
    }

    /// Creates an empty configuration: the primary alone.
    #[must_use]
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Returns the replica with the given ID, if present.
    #[must_use]
    pub fn replica(&self, id: ReplicaId) -> Option<&ReplicaInformation> {
        self.replicas.iter().find(|r| r.id == id)
    }

    /// Returns true if the given replica is a member of this view.
    #[must_use]
    pub fn contains(&self, id: ReplicaId) -> bool {
        self.replica(id).is_some()
    }

    /// Returns the number of members including the implied primary.
    #[must_use]
    pub fn replica_set_size(&self) -> usize {
        self.replicas.len() + 1
    }
}

/// Majority of `n` voters.
#[must_use]
pub(crate) fn majority(n: usize) -> usize {
    n / 2 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secondary(id: u64) -> ReplicaInformation {
        ReplicaInformation::active_secondary(ReplicaId::new(id), format!("mem://{id}"))
    }

    #[test]
    fn role_capabilities() {
        assert!(ReplicaRole::Primary.can_replicate());
        assert!(!ReplicaRole::ActiveSecondary.can_replicate());
        assert!(ReplicaRole::ActiveSecondary.consumes_streams());
        assert!(ReplicaRole::IdleSecondary.consumes_streams());
        assert!(!ReplicaRole::Primary.consumes_streams());
        assert!(!ReplicaRole::None.consumes_streams());
    }

    #[test]
    fn majority_write_quorum() {
        // {P} -> 1, {P, S1} -> 2, {P, S1, S2} -> 2, {P, S1..S3} -> 3
        assert_eq!(ReplicaSetConfiguration::empty().write_quorum, 1);
        assert_eq!(ReplicaSetConfiguration::new(vec![secondary(1)]).write_quorum, 2);
        assert_eq!(
            ReplicaSetConfiguration::new(vec![secondary(1), secondary(2)]).write_quorum,
            2
        );
        assert_eq!(
            ReplicaSetConfiguration::new(vec![secondary(1), secondary(2), secondary(3)])
                .write_quorum,
            3
        );
    }

    #[test]
    fn configuration_lookup() {
        let config = ReplicaSetConfiguration::new(vec![secondary(1), secondary(2)]);
        assert!(config.contains(ReplicaId::new(1)));
        assert!(!config.contains(ReplicaId::new(9)));
        assert_eq!(config.replica_set_size(), 3);
    }

    #[test]
    fn must_catch_up_flag() {
        let info = secondary(4).with_must_catch_up();
        assert!(info.must_catch_up);
    }
}
