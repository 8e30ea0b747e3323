//! Atomic group bookkeeping.
//!
//! An atomic group multiplexes several logical operations under one
//! commit/rollback unit. Each group moves through the state machine
//! `Open -> {Committed | RolledBack}` and is terminal once resolved: no
//! member operation may reference the group afterward, and a second
//! resolution attempt is rejected.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex;
use replistate_protocol::{AtomicGroupId, SequenceNumber};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// State of one atomic group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtomicGroupState {
    /// The group accepts member operations.
    Open {
        /// Sequence numbers of the member operations so far.
        members: Vec<SequenceNumber>,
    },
    /// Terminal success resolution.
    Committed {
        /// Sequence number of the commit record.
        commit_sequence_number: SequenceNumber,
    },
    /// Terminal failure resolution; members must be treated as not applied.
    RolledBack {
        /// Sequence number of the rollback record.
        rollback_sequence_number: SequenceNumber,
    },
}

impl AtomicGroupState {
    /// Returns true if the group is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, AtomicGroupState::Open { .. })
    }
}

/// Table of atomic groups owned by one primary.
pub struct AtomicGroupTable {
    next_id: AtomicU64,
    groups: Mutex<HashMap<AtomicGroupId, AtomicGroupState>>,
}

impl AtomicGroupTable {
    /// Creates an empty table; ids start at 1 (0 is the "no group" marker).
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh group, valid immediately with no members.
    pub fn create(&self) -> AtomicGroupId {
        let id = AtomicGroupId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.groups
            .lock()
            .insert(id, AtomicGroupState::Open { members: Vec::new() });
        id
    }

    /// Runs `assign` for a member operation while the group is held open.
    ///
    /// The table lock spans the sequence-number assignment so a concurrent
    /// resolution cannot slip between the open check and the assignment.
    pub fn assign_member<T>(
        &self,
        id: AtomicGroupId,
        assign: impl FnOnce() -> (SequenceNumber, T),
    ) -> ReplicationResult<T> {
        let mut groups = self.groups.lock();
        match groups.get_mut(&id) {
            Some(AtomicGroupState::Open { members }) => {
                let (sequence_number, value) = assign();
                members.push(sequence_number);
                Ok(value)
            }
            Some(_) => Err(ReplicationError::AtomicGroupInvalid {
                group: id,
                message: "operation submitted after resolution".into(),
            }),
            None => Err(ReplicationError::AtomicGroupInvalid {
                group: id,
                message: "unknown group".into(),
            }),
        }
    }

    /// Runs `assign` for the commit record and marks the group committed.
    pub fn resolve_commit<T>(
        &self,
        id: AtomicGroupId,
        assign: impl FnOnce() -> (SequenceNumber, T),
    ) -> ReplicationResult<T> {
        self.resolve(id, assign, |lsn| AtomicGroupState::Committed {
            commit_sequence_number: lsn,
        })
    }

    /// Runs `assign` for the rollback record and marks the group rolled
    /// back.
    pub fn resolve_rollback<T>(
        &self,
        id: AtomicGroupId,
        assign: impl FnOnce() -> (SequenceNumber, T),
    ) -> ReplicationResult<T> {
        self.resolve(id, assign, |lsn| AtomicGroupState::RolledBack {
            rollback_sequence_number: lsn,
        })
    }

    fn resolve<T>(
        &self,
        id: AtomicGroupId,
        assign: impl FnOnce() -> (SequenceNumber, T),
        terminal: impl FnOnce(SequenceNumber) -> AtomicGroupState,
    ) -> ReplicationResult<T> {
        let mut groups = self.groups.lock();
        match groups.get_mut(&id) {
            Some(state @ AtomicGroupState::Open { .. }) => {
                let (sequence_number, value) = assign();
                if let AtomicGroupState::Open { members } = state {
                    debug_assert!(members.iter().all(|m| *m < sequence_number));
                }
                *state = terminal(sequence_number);
                Ok(value)
            }
            Some(_) => Err(ReplicationError::AtomicGroupInvalid {
                group: id,
                message: "group already resolved".into(),
            }),
            None => Err(ReplicationError::AtomicGroupInvalid {
                group: id,
                message: "unknown group".into(),
            }),
        }
    }

    /// Returns the state of a group, if known.
    #[must_use]
    pub fn state(&self, id: AtomicGroupId) -> Option<AtomicGroupState> {
        self.groups.lock().get(&id).cloned()
    }

    /// Number of groups still open.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.groups
            .lock()
            .values()
            .filter(|state| state.is_open())
            .count()
    }
}

impl Default for AtomicGroupTable {
    fn default() -> Self {
        Self::new()
    }
}
