//! Replica-set membership and acknowledgement progress.
//!
//! The tracker holds the current and previous configuration views, the
//! per-replica acknowledgement progress, and the quorum-committed sequence
//! number derived from them. Views are swapped wholesale under a version
//! counter, so replicate and catch-up calls never observe a partially
//! updated configuration.

use crate::cancel::CancellationToken;
use crate::error::{ReplicationError, ReplicationResult};
use crate::quorum::quorum_committed_lsn;
use parking_lot::RwLock;
use replistate_protocol::{
    ReplicaId, ReplicaInformation, ReplicaRole, ReplicaSetConfiguration, ReplicaSetQuorumMode,
    ReplicaStatus, SequenceNumber,
};
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone)]
struct TrackedReplica {
    info: ReplicaInformation,
    acked: SequenceNumber,
}

#[derive(Debug)]
struct View {
    current: Vec<TrackedReplica>,
    current_write_quorum: usize,
    previous: Option<Vec<TrackedReplica>>,
    previous_write_quorum: usize,
    primary_progress: SequenceNumber,
    committed: SequenceNumber,
    version: u64,
}

impl View {
    fn recompute_committed(&mut self) -> Option<SequenceNumber> {
        let current_acks: Vec<SequenceNumber> =
            self.current.iter().map(|r| r.acked).collect();
        let mut committed =
            quorum_committed_lsn(&current_acks, self.current_write_quorum, self.primary_progress)?;

        if let Some(previous) = &self.previous {
            let previous_acks: Vec<SequenceNumber> =
                previous.iter().map(|r| r.acked).collect();
            let previous_committed = quorum_committed_lsn(
                &previous_acks,
                self.previous_write_quorum,
                self.primary_progress,
            )?;
            committed = committed.min(previous_committed);
        }

        if committed > self.committed {
            self.committed = committed;
            Some(committed)
        } else {
            None
        }
    }
}

/// Tracks the replica set and its acknowledgement progress for a primary.
pub struct ReplicaSetTracker {
    view: RwLock<View>,
    changed: watch::Sender<u64>,
}

impl ReplicaSetTracker {
    /// Creates a tracker with an empty configuration: the primary alone.
    #[must_use]
    pub fn new() -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            view: RwLock::new(View {
                current: Vec::new(),
                current_write_quorum: 1,
                previous: None,
                previous_write_quorum: 0,
                primary_progress: SequenceNumber::INVALID,
                committed: SequenceNumber::INVALID,
                version: 0,
            }),
            changed,
        }
    }

    fn notify(&self) {
        self.changed.send_modify(|v| *v += 1);
    }

    fn track(
        existing: &[TrackedReplica],
        config: &ReplicaSetConfiguration,
    ) -> Vec<TrackedReplica> {
        config
            .replicas
            .iter()
            .map(|info| {
                // Carry acknowledgement progress across view changes; seed
                // newcomers from the progress the configuration reports.
                let acked = existing
                    .iter()
                    .find(|t| t.info.id == info.id)
                    .map(|t| t.acked)
                    .unwrap_or(info.current_progress);
                TrackedReplica {
                    info: info.clone(),
                    acked,
                }
            })
            .collect()
    }

    /// Applies a catch-up view: the target configuration plus the previous
    /// one it supersedes. Commitment requires a quorum in both.
    pub fn update_catch_up_configuration(
        &self,
        current: &ReplicaSetConfiguration,
        previous: Option<&ReplicaSetConfiguration>,
    ) {
        {
            let mut view = self.view.write();
            let merged: Vec<TrackedReplica> = view
                .current
                .iter()
                .chain(view.previous.iter().flatten())
                .cloned()
                .collect();
            view.current = Self::track(&merged, current);
            view.current_write_quorum = current.write_quorum;
            view.previous = previous.map(|p| Self::track(&merged, p));
            view.previous_write_quorum = previous.map_or(0, |p| p.write_quorum);
            view.version += 1;
            view.recompute_committed();
            debug!(
                version = view.version,
                replicas = view.current.len(),
                write_quorum = view.current_write_quorum,
                dual = view.previous.is_some(),
                "replica set catch-up configuration updated"
            );
        }
        self.notify();
    }

    /// Applies the stable current view, retiring any previous configuration.
    pub fn update_current_configuration(&self, current: &ReplicaSetConfiguration) {
        self.update_catch_up_configuration(current, None);
    }

    /// Removes a replica from both views.
    ///
    /// Later catch-up waits no longer consider the removed replica.
    pub fn remove_replica(&self, id: ReplicaId) -> bool {
        let removed = {
            let mut view = self.view.write();
            let before = view.current.len()
                + view.previous.as_ref().map_or(0, Vec::len);
            view.current.retain(|t| t.info.id != id);
            if let Some(previous) = &mut view.previous {
                previous.retain(|t| t.info.id != id);
            }
            let after = view.current.len()
                + view.previous.as_ref().map_or(0, Vec::len);
            if before != after {
                view.version += 1;
                view.recompute_committed();
                true
            } else {
                false
            }
        };
        if removed {
            self.notify();
        }
        removed
    }

    /// Records an acknowledgement from a remote replica.
    ///
    /// Returns the new committed sequence number when the acknowledgement
    /// advanced it.
    pub fn record_acknowledgement(
        &self,
        id: ReplicaId,
        progress: SequenceNumber,
    ) -> Option<SequenceNumber> {
        let advanced = {
            let mut view = self.view.write();
            // Reborrow so the per-field mutable borrows are disjoint.
            let view = &mut *view;
            let mut known = false;
            for tracked in view
                .current
                .iter_mut()
                .chain(view.previous.iter_mut().flatten())
            {
                if tracked.info.id == id {
                    known = true;
                    if progress > tracked.acked {
                        tracked.acked = progress;
                    }
                }
            }
            if !known {
                return None;
            }
            view.recompute_committed()
        };
        self.notify();
        advanced
    }

    /// Records the primary's own last assigned sequence number.
    ///
    /// Returns the new committed sequence number when it advanced (a
    /// single-replica set commits on assignment).
    pub fn record_primary_progress(&self, progress: SequenceNumber) -> Option<SequenceNumber> {
        let advanced = {
            let mut view = self.view.write();
            if progress > view.primary_progress {
                view.primary_progress = progress;
            }
            view.recompute_committed()
        };
        self.notify();
        advanced
    }

    /// The quorum-committed sequence number.
    #[must_use]
    pub fn committed(&self) -> SequenceNumber {
        self.view.read().committed
    }

    /// Last acknowledged sequence number of the given replica, if it is a
    /// member of either view.
    #[must_use]
    pub fn progress_of(&self, id: ReplicaId) -> Option<SequenceNumber> {
        let view = self.view.read();
        view.current
            .iter()
            .chain(view.previous.iter().flatten())
            .find(|t| t.info.id == id)
            .map(|t| t.acked)
    }

    /// Returns the current-view membership.
    #[must_use]
    pub fn current_members(&self) -> Vec<ReplicaInformation> {
        self.view
            .read()
            .current
            .iter()
            .map(|t| t.info.clone())
            .collect()
    }

    /// Version of the membership view, bumped on every swap.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.view.read().version
    }

    fn catch_up_satisfied(&self, mode: ReplicaSetQuorumMode, target: SequenceNumber) -> bool {
        let view = self.view.read();

        // Replicas flagged must-catch-up are awaited regardless of mode.
        let mandatory_caught_up = view
            .current
            .iter()
            .filter(|t| t.info.must_catch_up)
            .all(|t| t.acked >= target);
        if !mandatory_caught_up {
            return false;
        }

        match mode {
            ReplicaSetQuorumMode::WriteQuorum => view.committed >= target,
            ReplicaSetQuorumMode::All => view
                .current
                .iter()
                .filter(|t| {
                    t.info.status == ReplicaStatus::Up
                        && t.info.role == ReplicaRole::ActiveSecondary
                })
                .all(|t| t.acked >= target),
        }
    }

    /// Waits until the replica set has caught up to `target` under the given
    /// quorum mode.
    pub async fn wait_for_catch_up(
        &self,
        mode: ReplicaSetQuorumMode,
        target: SequenceNumber,
        token: &CancellationToken,
    ) -> ReplicationResult<()> {
        let mut rx = self.changed.subscribe();
        loop {
            if self.catch_up_satisfied(mode, target) {
                return Ok(());
            }
            tokio::select! {
                _ = token.cancelled() => return Err(ReplicationError::Cancelled),
                changed = rx.changed() => {
                    changed.map_err(|_| ReplicationError::Closed)?;
                }
            }
        }
    }
}

impl Default for ReplicaSetTracker {
    fn default() -> Self {
        Self::new()
    }
}
