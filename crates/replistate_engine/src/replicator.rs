//! The state replicator.
//!
//! One replicator runs per replica. On the primary it assigns sequence
//! numbers, fans operations out over replica links, and tracks quorum
//! acknowledgement; on a secondary it feeds the copy and replication
//! streams the hosted state consumes. Role changes, epoch updates, and
//! replica-set reconfiguration all land here.

use crate::atomic::{AtomicGroupState, AtomicGroupTable};
use crate::cancel::CancellationToken;
use crate::config::ReplicatorSettings;
use crate::error::{ReplicationError, ReplicationResult};
use crate::link::{ReplicaConnector, ReplicaLink};
use crate::membership::ReplicaSetTracker;
use crate::provider::StateProvider;
use crate::queue::{QueueCounters, ReplicationQueue};
use crate::stream::{
    AcknowledgementSink, FaultKind, OperationStream, OperationStreamWriter, StreamKind,
};
use parking_lot::{Mutex, RwLock};
use replistate_protocol::{
    AtomicGroupId, Epoch, OperationData, OperationEnvelope, OperationType, ReplicaId,
    ReplicaInformation, ReplicaRole, ReplicaSetConfiguration, ReplicaSetQuorumMode,
    SequenceNumber,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// What the replicator was built to support.
///
/// Fixed at construction; atomic-group calls on a `Basic` replicator fail
/// with [`ReplicationError::Unsupported`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicatorCapability {
    /// Single-operation replication only.
    Basic,
    /// Single operations plus atomic multi-operation groups.
    AtomicGroupCapable,
}

/// How to open the replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fresh replica with no prior state.
    New,
    /// Re-opening over existing provider state; the sequence space resumes
    /// from the provider's last committed number.
    Existing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Opened,
    Closed,
    Aborted,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Lifecycle::Created => "created",
            Lifecycle::Opened => "opened",
            Lifecycle::Closed => "closed",
            Lifecycle::Aborted => "aborted",
        }
    }
}

/// A replication accepted by the primary.
///
/// The sequence number is final as soon as this is returned; the receipt
/// resolves when a write quorum has acknowledged the operation.
#[derive(Debug)]
pub struct PendingReplication {
    /// The sequence number assigned to the operation.
    pub sequence_number: SequenceNumber,
    /// Awaitable quorum acknowledgement.
    pub receipt: QuorumReceipt,
}

/// Awaits quorum acknowledgement of one replication.
#[derive(Debug)]
pub struct QuorumReceipt {
    rx: oneshot::Receiver<ReplicationResult<()>>,
}

impl QuorumReceipt {
    /// Waits until a write quorum has acknowledged the operation.
    pub async fn wait(self) -> ReplicationResult<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::Closed),
        }
    }

    /// Waits with a deadline.
    ///
    /// A timeout abandons the wait only; the operation stays in the queue
    /// and may still commit.
    pub async fn wait_timeout(self, duration: Duration) -> ReplicationResult<()> {
        match tokio::time::timeout(duration, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ReplicationError::Timeout),
        }
    }
}

/// Point-in-time replicator snapshot.
#[derive(Debug, Clone)]
pub struct ReplicatorStatus {
    /// Current replica role.
    pub role: ReplicaRole,
    /// Current epoch.
    pub epoch: Epoch,
    /// Highest quorum-committed sequence number.
    pub committed: SequenceNumber,
    /// The replica's own progress (last assigned on the primary, last
    /// acknowledged on a secondary).
    pub current_progress: SequenceNumber,
    /// Replication queue counters.
    pub queue: QueueCounters,
    /// Number of unresolved atomic groups.
    pub open_atomic_groups: usize,
}

struct BuildWaiter {
    copy_end: SequenceNumber,
    done: oneshot::Sender<ReplicationResult<()>>,
}

/// The replication core for one replica.
pub struct StateReplicator {
    replica_id: ReplicaId,
    capability: ReplicatorCapability,
    settings: RwLock<ReplicatorSettings>,
    provider: Arc<dyn StateProvider>,
    connector: Arc<dyn ReplicaConnector>,

    lifecycle: RwLock<Lifecycle>,
    role: RwLock<ReplicaRole>,
    epoch: RwLock<Epoch>,

    queue: ReplicationQueue,
    tracker: ReplicaSetTracker,
    atomic_groups: AtomicGroupTable,
    // Held across sequence assignment and link fan-out so every link
    // receives envelopes in sequence order.
    fan_out: Mutex<()>,
    links: RwLock<HashMap<ReplicaId, Arc<dyn ReplicaLink>>>,
    builds: Mutex<HashMap<ReplicaId, BuildWaiter>>,

    copy_writer: OperationStreamWriter,
    copy_stream: Arc<OperationStream>,
    replication_writer: OperationStreamWriter,
    replication_stream: Arc<OperationStream>,
    // High-water marks of locally acknowledged sequence numbers.
    copy_progress: Arc<AtomicU64>,
    replication_progress: Arc<AtomicU64>,
}

impl StateReplicator {
    /// Creates a replicator in the `Created` state.
    ///
    /// Whether consumed operations auto-acknowledge is fixed here from
    /// `settings.require_acknowledgement`.
    #[must_use]
    pub fn new(
        replica_id: ReplicaId,
        capability: ReplicatorCapability,
        settings: ReplicatorSettings,
        provider: Arc<dyn StateProvider>,
        connector: Arc<dyn ReplicaConnector>,
    ) -> Self {
        let auto_ack = !settings.require_acknowledgement;
        let copy_progress = Arc::new(AtomicU64::new(0));
        let replication_progress = Arc::new(AtomicU64::new(0));
        let (copy_writer, copy_stream) =
            OperationStream::channel(StreamKind::Copy, auto_ack, Arc::clone(&copy_progress), None);
        let (replication_writer, replication_stream) = OperationStream::channel(
            StreamKind::Replication,
            auto_ack,
            Arc::clone(&replication_progress),
            None,
        );

        Self {
            replica_id,
            capability,
            settings: RwLock::new(settings),
            provider,
            connector,
            lifecycle: RwLock::new(Lifecycle::Created),
            role: RwLock::new(ReplicaRole::Unknown),
            epoch: RwLock::new(Epoch::ZERO),
            queue: ReplicationQueue::new(),
            tracker: ReplicaSetTracker::new(),
            atomic_groups: AtomicGroupTable::new(),
            fan_out: Mutex::new(()),
            links: RwLock::new(HashMap::new()),
            builds: Mutex::new(HashMap::new()),
            copy_writer,
            copy_stream: Arc::new(copy_stream),
            replication_writer,
            replication_stream: Arc::new(replication_stream),
            copy_progress,
            replication_progress,
        }
    }

    /// This replica's id.
    #[must_use]
    pub fn replica_id(&self) -> ReplicaId {
        self.replica_id
    }

    /// The capability the replicator was built with.
    #[must_use]
    pub fn capability(&self) -> ReplicatorCapability {
        self.capability
    }

    /// Routes acknowledgements drained from both streams to `sink`.
    ///
    /// The host wires this to the transport that carries acknowledgements
    /// back to the primary.
    pub fn set_acknowledgement_sink(&self, sink: Arc<dyn AcknowledgementSink>) {
        self.copy_stream.set_acknowledgement_sink(Arc::clone(&sink));
        self.replication_stream.set_acknowledgement_sink(sink);
    }

    // ---- lifecycle ----

    /// Opens the replicator and returns the address secondaries reach it at.
    pub fn open(&self, mode: OpenMode) -> ReplicationResult<String> {
        let mut lifecycle = self.lifecycle.write();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Opened => {
                return Err(ReplicationError::InvalidStateTransition {
                    from: Lifecycle::Opened.name(),
                    to: Lifecycle::Opened.name(),
                })
            }
            Lifecycle::Closed | Lifecycle::Aborted => return Err(ReplicationError::Closed),
        }

        if mode == OpenMode::Existing {
            let committed = self.provider.last_committed_sequence_number()?;
            self.queue.reseed(committed);
            self.replication_progress
                .store(committed.as_u64(), Ordering::SeqCst);
        }

        *lifecycle = Lifecycle::Opened;
        let address = self.settings.read().replicator_address.clone();
        info!(replica = %self.replica_id, %address, ?mode, "replicator opened");
        Ok(address)
    }

    /// Transitions the replica to a new role.
    ///
    /// Repeating the current role is a no-op. Promotion to Primary seeds
    /// the sequence space from the provider's last committed number;
    /// demotion from Primary flushes pending completions with
    /// [`ReplicationError::NotPrimary`].
    pub fn change_role(&self, new_role: ReplicaRole) -> ReplicationResult<()> {
        self.ensure_open()?;
        let mut role = self.role.write();
        if *role == new_role {
            debug!(replica = %self.replica_id, %new_role, "role unchanged");
            return Ok(());
        }
        let old_role = *role;

        if new_role == ReplicaRole::Primary {
            let committed = self.provider.last_committed_sequence_number()?;
            self.queue.reseed(committed);
            self.tracker.record_primary_progress(committed);
        } else if old_role == ReplicaRole::Primary {
            self.queue
                .fail_all(|_| ReplicationError::NotPrimary { role: new_role });
        }

        *role = new_role;
        info!(replica = %self.replica_id, %old_role, %new_role, "role changed");
        Ok(())
    }

    /// Closes the replicator gracefully.
    ///
    /// Pending completions flush with [`ReplicationError::Closed`] and both
    /// streams end; consumers drain what was already delivered.
    pub fn close(&self) -> ReplicationResult<()> {
        {
            let mut lifecycle = self.lifecycle.write();
            match *lifecycle {
                Lifecycle::Closed | Lifecycle::Aborted => return Err(ReplicationError::Closed),
                Lifecycle::Created | Lifecycle::Opened => *lifecycle = Lifecycle::Closed,
            }
        }
        self.teardown();
        self.copy_writer.finish();
        self.replication_writer.finish();
        info!(replica = %self.replica_id, "replicator closed");
        Ok(())
    }

    /// Aborts the replicator without draining.
    ///
    /// Non-blocking and idempotent; stream consumers observe a permanent
    /// fault instead of a graceful end.
    pub fn abort(&self) {
        {
            let mut lifecycle = self.lifecycle.write();
            if matches!(*lifecycle, Lifecycle::Closed | Lifecycle::Aborted) {
                return;
            }
            *lifecycle = Lifecycle::Aborted;
        }
        self.teardown();
        self.copy_stream.report_fault(FaultKind::Permanent);
        self.replication_stream.report_fault(FaultKind::Permanent);
        // Wake any consumer blocked in a pull so it observes the fault.
        self.copy_writer.finish();
        self.replication_writer.finish();
        warn!(replica = %self.replica_id, "replicator aborted");
    }

    fn teardown(&self) {
        self.queue.fail_all(|_| ReplicationError::Closed);
        self.links.write().clear();
        // Dropping the waiters resolves outstanding builds with `Closed`.
        self.builds.lock().clear();
    }

    fn ensure_open(&self) -> ReplicationResult<()> {
        match *self.lifecycle.read() {
            Lifecycle::Opened => Ok(()),
            Lifecycle::Created => Err(ReplicationError::InvalidStateTransition {
                from: Lifecycle::Created.name(),
                to: Lifecycle::Opened.name(),
            }),
            Lifecycle::Closed | Lifecycle::Aborted => Err(ReplicationError::Closed),
        }
    }

    fn require_primary(&self) -> ReplicationResult<()> {
        let role = *self.role.read();
        if role.can_replicate() {
            Ok(())
        } else {
            Err(ReplicationError::NotPrimary { role })
        }
    }

    fn require_primary_management(&self) -> ReplicationResult<()> {
        let role = *self.role.read();
        if role.can_replicate() {
            Ok(())
        } else {
            Err(ReplicationError::InvalidRole { role })
        }
    }

    fn require_stream_consumer(&self) -> ReplicationResult<()> {
        let role = *self.role.read();
        if role.consumes_streams() {
            Ok(())
        } else {
            Err(ReplicationError::InvalidRole { role })
        }
    }

    fn ensure_atomic_capable(&self) -> ReplicationResult<()> {
        if self.capability == ReplicatorCapability::AtomicGroupCapable {
            Ok(())
        } else {
            Err(ReplicationError::Unsupported)
        }
    }

    // ---- primary: replication ----

    /// Replicates one operation to the current replica set.
    ///
    /// The sequence number in the returned [`PendingReplication`] is final;
    /// submission order is sequence order. Cancellation through `token` is
    /// advisory and only observed before the number is assigned.
    pub fn replicate(
        &self,
        data: OperationData,
        token: &CancellationToken,
    ) -> ReplicationResult<PendingReplication> {
        self.ensure_open()?;
        self.require_primary()?;
        if token.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }

        let epoch = *self.epoch.read();
        let _ordered = self.fan_out.lock();
        let (envelope, rx) = self
            .queue
            .assign(OperationType::Normal, epoch, AtomicGroupId::NONE, data);
        debug!(
            replica = %self.replica_id,
            sequence_number = %envelope.sequence_number,
            "replicating operation"
        );
        let sequence_number = envelope.sequence_number;
        self.after_assign(&envelope);
        Ok(PendingReplication {
            sequence_number,
            receipt: QuorumReceipt { rx },
        })
    }

    /// Consumes the next sequence number with an empty barrier operation.
    ///
    /// The barrier replicates like any other operation so the stream stays
    /// gap-free; the returned number is useful as a fence the caller can
    /// wait on or correlate against.
    pub fn reserve_sequence_number(&self) -> ReplicationResult<SequenceNumber> {
        self.ensure_open()?;
        self.require_primary()?;
        let epoch = *self.epoch.read();
        let _ordered = self.fan_out.lock();
        let (envelope, _rx) = self.queue.assign(
            OperationType::Normal,
            epoch,
            AtomicGroupId::NONE,
            OperationData::empty(),
        );
        let sequence_number = envelope.sequence_number;
        self.after_assign(&envelope);
        Ok(sequence_number)
    }

    /// Records assignment with the tracker and fans the envelope out.
    ///
    /// Callers hold `fan_out` from assignment through this call; the links
    /// would otherwise see envelopes out of sequence order under concurrent
    /// replication.
    fn after_assign(&self, envelope: &OperationEnvelope) {
        if let Some(committed) = self.tracker.record_primary_progress(envelope.sequence_number) {
            self.queue.complete_through(committed);
        }
        for (id, link) in self.links.read().iter() {
            if let Err(error) = link.send_replication(envelope.clone()) {
                warn!(
                    replica = %id,
                    sequence_number = %envelope.sequence_number,
                    %error,
                    "replication delivery failed"
                );
            }
        }
    }

    /// Records an acknowledgement from a remote replica's replication
    /// stream.
    pub fn handle_acknowledgement(&self, replica: ReplicaId, progress: SequenceNumber) {
        if let Some(committed) = self.tracker.record_acknowledgement(replica, progress) {
            let completed = self.queue.complete_through(committed);
            debug!(
                %replica,
                %progress,
                %committed,
                completed,
                "quorum advanced"
            );
        }
    }

    /// Records an acknowledgement from a building replica's copy stream.
    pub fn handle_copy_acknowledgement(&self, replica: ReplicaId, progress: SequenceNumber) {
        let mut builds = self.builds.lock();
        let finished = builds
            .get(&replica)
            .is_some_and(|waiter| progress >= waiter.copy_end);
        if finished {
            if let Some(waiter) = builds.remove(&replica) {
                let _ = waiter.done.send(Ok(()));
            }
        }
    }

    // ---- primary: atomic groups ----

    /// Allocates a fresh atomic group.
    pub fn create_atomic_group(&self) -> ReplicationResult<AtomicGroupId> {
        self.ensure_open()?;
        self.ensure_atomic_capable()?;
        self.require_primary()?;
        Ok(self.atomic_groups.create())
    }

    /// Replicates a member operation of an open atomic group.
    pub fn replicate_atomic_group_operation(
        &self,
        group: AtomicGroupId,
        data: OperationData,
        token: &CancellationToken,
    ) -> ReplicationResult<PendingReplication> {
        self.ensure_open()?;
        self.ensure_atomic_capable()?;
        self.require_primary()?;
        if token.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }

        let epoch = *self.epoch.read();
        let _ordered = self.fan_out.lock();
        let (envelope, rx) = self.atomic_groups.assign_member(group, || {
            let (envelope, rx) =
                self.queue
                    .assign(OperationType::AtomicGroupOperation, epoch, group, data);
            (envelope.sequence_number, (envelope, rx))
        })?;
        let sequence_number = envelope.sequence_number;
        self.after_assign(&envelope);
        Ok(PendingReplication {
            sequence_number,
            receipt: QuorumReceipt { rx },
        })
    }

    /// Commits an open atomic group.
    ///
    /// The commit record's sequence number is strictly greater than every
    /// member's; the group is terminal afterwards.
    pub fn replicate_atomic_group_commit(
        &self,
        group: AtomicGroupId,
        token: &CancellationToken,
    ) -> ReplicationResult<PendingReplication> {
        self.resolve_atomic_group(group, OperationType::AtomicGroupCommit, token)
    }

    /// Rolls back an open atomic group.
    pub fn replicate_atomic_group_rollback(
        &self,
        group: AtomicGroupId,
        token: &CancellationToken,
    ) -> ReplicationResult<PendingReplication> {
        self.resolve_atomic_group(group, OperationType::AtomicGroupRollback, token)
    }

    fn resolve_atomic_group(
        &self,
        group: AtomicGroupId,
        op_type: OperationType,
        token: &CancellationToken,
    ) -> ReplicationResult<PendingReplication> {
        self.ensure_open()?;
        self.ensure_atomic_capable()?;
        self.require_primary()?;
        if token.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }

        let epoch = *self.epoch.read();
        let _ordered = self.fan_out.lock();
        let assign = || {
            let (envelope, rx) = self
                .queue
                .assign(op_type, epoch, group, OperationData::empty());
            (envelope.sequence_number, (envelope, rx))
        };
        let (envelope, rx) = match op_type {
            OperationType::AtomicGroupCommit => self.atomic_groups.resolve_commit(group, assign)?,
            _ => self.atomic_groups.resolve_rollback(group, assign)?,
        };
        info!(
            replica = %self.replica_id,
            %group,
            sequence_number = %envelope.sequence_number,
            resolution = ?op_type,
            "atomic group resolved"
        );
        let sequence_number = envelope.sequence_number;
        self.after_assign(&envelope);
        Ok(PendingReplication {
            sequence_number,
            receipt: QuorumReceipt { rx },
        })
    }

    /// Reverts provider progress made at or after `from`.
    ///
    /// Re-invoking with an already-undone point is a no-op.
    pub fn undo_progress(&self, from: SequenceNumber) -> ReplicationResult<()> {
        self.ensure_open()?;
        self.ensure_atomic_capable()?;
        let last = self.provider.last_committed_sequence_number()?;
        if last < from {
            return Ok(());
        }
        self.provider.undo_progress(from)?;
        info!(replica = %self.replica_id, %from, "provider progress undone");
        Ok(())
    }

    /// State of an atomic group, if known.
    #[must_use]
    pub fn atomic_group_state(&self, group: AtomicGroupId) -> Option<AtomicGroupState> {
        self.atomic_groups.state(group)
    }

    // ---- secondary: streams and intake ----

    /// The stream of copy operations for a building secondary.
    pub fn get_copy_stream(&self) -> ReplicationResult<Arc<OperationStream>> {
        self.ensure_open()?;
        self.require_stream_consumer()?;
        Ok(Arc::clone(&self.copy_stream))
    }

    /// The stream of live replication operations for a secondary.
    pub fn get_replication_stream(&self) -> ReplicationResult<Arc<OperationStream>> {
        self.ensure_open()?;
        self.require_stream_consumer()?;
        Ok(Arc::clone(&self.replication_stream))
    }

    /// The copy context this replica reports to a primary about to build
    /// it.
    pub fn copy_context(&self) -> ReplicationResult<OperationData> {
        self.ensure_open()?;
        self.require_stream_consumer()?;
        self.provider.get_copy_context()
    }

    /// Feeds one inbound copy envelope into the copy stream.
    pub fn apply_copy_envelope(&self, envelope: OperationEnvelope) -> ReplicationResult<()> {
        self.ensure_open()?;
        self.require_stream_consumer()?;
        if envelope.is_end_of_stream() {
            self.copy_writer.finish();
            return Ok(());
        }
        self.copy_writer.push(envelope)
    }

    /// Feeds one inbound replication envelope into the replication stream.
    ///
    /// Envelopes stamped with an epoch older than the replica's current one
    /// are fenced with [`ReplicationError::StaleEpoch`].
    pub fn apply_replication_envelope(&self, envelope: OperationEnvelope) -> ReplicationResult<()> {
        self.ensure_open()?;
        self.require_stream_consumer()?;
        let current = *self.epoch.read();
        if envelope.epoch < current {
            return Err(ReplicationError::StaleEpoch {
                operation: envelope.epoch,
                current,
            });
        }
        if envelope.is_end_of_stream() {
            self.replication_writer.finish();
            return Ok(());
        }
        self.replication_writer.push(envelope)
    }

    // ---- epochs ----

    /// Moves the replica to a new epoch.
    ///
    /// Epochs never regress; the provider is notified with the last
    /// sequence number seen under the outgoing epoch before the new one
    /// takes effect.
    pub fn update_epoch(&self, epoch: Epoch) -> ReplicationResult<()> {
        self.ensure_open()?;
        let mut current = self.epoch.write();
        if epoch < *current {
            return Err(ReplicationError::StaleEpoch {
                operation: epoch,
                current: *current,
            });
        }
        if epoch == *current {
            return Ok(());
        }

        let previous_last = if self.role.read().can_replicate() {
            self.queue.last_assigned()
        } else {
            SequenceNumber::new(self.replication_progress.load(Ordering::SeqCst))
        };
        self.provider.update_epoch(epoch, previous_last)?;
        info!(
            replica = %self.replica_id,
            old_epoch = %*current,
            new_epoch = %epoch,
            %previous_last,
            "epoch updated"
        );
        *current = epoch;
        Ok(())
    }

    /// The replica's current epoch.
    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        *self.epoch.read()
    }

    /// Invokes the provider's data-loss recovery hook.
    ///
    /// Returns true if the provider restored state from an external source.
    pub fn on_data_loss(&self) -> ReplicationResult<bool> {
        self.ensure_open()?;
        let restored = self.provider.on_data_loss()?;
        info!(replica = %self.replica_id, restored, "data loss processed");
        Ok(restored)
    }

    // ---- primary: replica set management ----

    /// Installs a catch-up view: the target configuration plus the previous
    /// one it supersedes.
    ///
    /// During the transition, commitment requires a write quorum in both
    /// configurations.
    pub fn update_catch_up_replica_set_configuration(
        &self,
        current: &ReplicaSetConfiguration,
        previous: Option<&ReplicaSetConfiguration>,
    ) -> ReplicationResult<()> {
        self.ensure_open()?;
        self.require_primary_management()?;
        self.connect_members(current)?;
        if let Some(previous) = previous {
            self.connect_members(previous)?;
        }
        self.tracker.update_catch_up_configuration(current, previous);
        self.queue.complete_through(self.tracker.committed());
        Ok(())
    }

    /// Installs the stable current configuration, retiring any previous
    /// one.
    pub fn update_current_replica_set_configuration(
        &self,
        current: &ReplicaSetConfiguration,
    ) -> ReplicationResult<()> {
        self.ensure_open()?;
        self.require_primary_management()?;
        self.connect_members(current)?;
        self.tracker.update_current_configuration(current);
        self.queue.complete_through(self.tracker.committed());
        Ok(())
    }

    fn connect_members(&self, configuration: &ReplicaSetConfiguration) -> ReplicationResult<()> {
        let mut links = self.links.write();
        for info in &configuration.replicas {
            if !links.contains_key(&info.id) {
                links.insert(info.id, self.connector.connect(info)?);
            }
        }
        Ok(())
    }

    /// Waits until the replica set has caught up to the primary's current
    /// progress under the given quorum mode.
    pub async fn wait_for_catch_up_quorum(
        &self,
        mode: ReplicaSetQuorumMode,
        token: &CancellationToken,
    ) -> ReplicationResult<()> {
        self.ensure_open()?;
        self.require_primary_management()?;
        let target = self.queue.last_assigned();
        debug!(replica = %self.replica_id, ?mode, %target, "waiting for catch-up quorum");
        self.tracker.wait_for_catch_up(mode, target, token).await
    }

    /// Builds a joining replica by streaming it a copy of the state.
    ///
    /// The copy covers everything up to the primary's current progress:
    /// copy context from the link, fragments from the provider, then an
    /// end-of-stream marker. Completion means the replica acknowledged the
    /// whole copy backlog. The link stays registered for live fan-out.
    pub async fn build_replica(
        &self,
        info: &ReplicaInformation,
        token: &CancellationToken,
    ) -> ReplicationResult<()> {
        self.ensure_open()?;
        self.require_primary_management()?;
        if token.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }

        let link = self.connector.connect(info)?;
        self.links.write().insert(info.id, Arc::clone(&link));

        let result = self.run_build(info, &link, token).await;
        if result.is_err() {
            self.links.write().remove(&info.id);
            self.builds.lock().remove(&info.id);
        }
        result
    }

    async fn run_build(
        &self,
        info: &ReplicaInformation,
        link: &Arc<dyn ReplicaLink>,
        token: &CancellationToken,
    ) -> ReplicationResult<()> {
        let copy_context = link.copy_context()?;
        let upto = self.queue.last_assigned();
        let fragments = self.provider.get_copy_state(upto, copy_context)?;
        let epoch = *self.epoch.read();
        let total = fragments.len() as u64;
        info!(
            replica = %info.id,
            %upto,
            fragments = total,
            "building replica"
        );

        // Register the waiter before sending so an acknowledgement racing
        // the send loop cannot be lost.
        let rx = if total > 0 {
            let (tx, rx) = oneshot::channel();
            self.builds.lock().insert(
                info.id,
                BuildWaiter {
                    copy_end: SequenceNumber::new(total),
                    done: tx,
                },
            );
            Some(rx)
        } else {
            None
        };

        // Copy fragments carry their own sequence space, 1..=total.
        for (index, data) in fragments.into_iter().enumerate() {
            let fragment_number = SequenceNumber::new(index as u64 + 1);
            link.send_copy(OperationEnvelope::copy_fragment(epoch, fragment_number, data))?;
        }
        link.send_copy(OperationEnvelope::end_of_stream(epoch, SequenceNumber::INVALID))?;

        let Some(rx) = rx else {
            return Ok(());
        };
        tokio::select! {
            _ = token.cancelled() => {
                self.builds.lock().remove(&info.id);
                Err(ReplicationError::Cancelled)
            }
            outcome = rx => match outcome {
                Ok(result) => result,
                Err(_) => Err(ReplicationError::Closed),
            },
        }
    }

    /// Removes a replica from the set and drops its link.
    ///
    /// Later catch-up waits no longer consider the removed replica.
    pub fn remove_replica(&self, id: ReplicaId) -> ReplicationResult<()> {
        self.ensure_open()?;
        self.require_primary_management()?;
        let had_link = self.links.write().remove(&id).is_some();
        self.builds.lock().remove(&id);
        let tracked = self.tracker.remove_replica(id);
        if tracked {
            self.queue.complete_through(self.tracker.committed());
        }
        if had_link || tracked {
            info!(replica = %id, "replica removed");
            Ok(())
        } else {
            Err(ReplicationError::UnknownReplica(id))
        }
    }

    // ---- progress and status ----

    /// The replica's own progress: last assigned sequence number on the
    /// primary, last acknowledged on a secondary.
    pub fn get_current_progress(&self) -> ReplicationResult<SequenceNumber> {
        self.ensure_open()?;
        if self.role.read().can_replicate() {
            Ok(self.queue.last_assigned())
        } else {
            Ok(SequenceNumber::new(
                self.replication_progress.load(Ordering::SeqCst),
            ))
        }
    }

    /// The earliest sequence number this replica can serve to a replica
    /// catching up from its queue.
    pub fn get_catch_up_capability(&self) -> ReplicationResult<SequenceNumber> {
        self.ensure_open()?;
        Ok(self.queue.first_retained())
    }

    /// Point-in-time snapshot of replicator state.
    pub fn status(&self) -> ReplicationResult<ReplicatorStatus> {
        self.ensure_open()?;
        let role = *self.role.read();
        let current_progress = if role.can_replicate() {
            self.queue.last_assigned()
        } else {
            SequenceNumber::new(self.replication_progress.load(Ordering::SeqCst))
        };
        Ok(ReplicatorStatus {
            role,
            epoch: *self.epoch.read(),
            committed: self.tracker.committed(),
            current_progress,
            queue: self.queue.counters(),
            open_atomic_groups: self.atomic_groups.open_count(),
        })
    }

    /// Progress of the copy stream's local acknowledgements.
    #[must_use]
    pub fn copy_progress(&self) -> SequenceNumber {
        SequenceNumber::new(self.copy_progress.load(Ordering::SeqCst))
    }

    // ---- settings ----

    /// Replaces the replicator settings.
    ///
    /// The acknowledgement mode is fixed at construction and not affected.
    pub fn update_replicator_settings(&self, settings: ReplicatorSettings) -> ReplicationResult<()> {
        self.ensure_open()?;
        *self.settings.write() = settings;
        Ok(())
    }

    /// A copy of the current settings.
    #[must_use]
    pub fn replicator_settings(&self) -> ReplicatorSettings {
        self.settings.read().clone()
    }
}
