//! State provider contract.
//!
//! The provider is the consumer-side collaborator the replication core calls
//! into: it produces copy state for joining secondaries, fences stale writes
//! at epoch boundaries, and directs recovery after potential data loss. The
//! core calls these methods; it does not implement them.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::RwLock;
use replistate_protocol::{Epoch, OperationData, OperationEnvelope, SequenceNumber};
use std::sync::atomic::{AtomicU64, Ordering};

/// The contract between the replication core and the state it replicates.
///
/// Errors thrown out of these callbacks propagate back through the async
/// replicator call that invoked them.
pub trait StateProvider: Send + Sync {
    /// Produces the context a joining secondary sends to the primary to
    /// describe the state it already holds.
    fn get_copy_context(&self) -> ReplicationResult<OperationData>;

    /// Produces the finite, one-shot backlog a newly building secondary
    /// must apply before joining the live stream.
    ///
    /// `upto` is the sequence number the copy must reach; `copy_context` is
    /// what the joining secondary reported.
    fn get_copy_state(
        &self,
        upto: SequenceNumber,
        copy_context: OperationData,
    ) -> ReplicationResult<Vec<OperationData>>;

    /// Notifies the provider of a configuration boundary so it can fence
    /// writes stamped with an older epoch.
    fn update_epoch(
        &self,
        epoch: Epoch,
        previous_epoch_last_sequence_number: SequenceNumber,
    ) -> ReplicationResult<()>;

    /// Recovery hook invoked when the current epoch followed a
    /// potential-data-loss transition.
    ///
    /// Returns true if state was restored from an external source.
    fn on_data_loss(&self) -> ReplicationResult<bool>;

    /// The last sequence number the provider has committed.
    fn last_committed_sequence_number(&self) -> ReplicationResult<SequenceNumber>;

    /// Reverts all progress made at or after the given commit point.
    ///
    /// Only invoked through the atomic-group extension; idempotent when
    /// re-invoked with an already-undone point.
    fn undo_progress(&self, from: SequenceNumber) -> ReplicationResult<()>;
}

/// An in-memory state provider for tests.
pub struct MemoryStateProvider {
    applied: RwLock<Vec<OperationEnvelope>>,
    last_committed: AtomicU64,
    epoch: RwLock<(Epoch, SequenceNumber)>,
    restores_on_data_loss: bool,
    data_loss_invocations: AtomicU64,
}

impl MemoryStateProvider {
    /// Creates an empty provider that reports no external restore on data
    /// loss.
    #[must_use]
    pub fn new() -> Self {
        Self {
            applied: RwLock::new(Vec::new()),
            last_committed: AtomicU64::new(0),
            epoch: RwLock::new((Epoch::ZERO, SequenceNumber::INVALID)),
            restores_on_data_loss: false,
            data_loss_invocations: AtomicU64::new(0),
        }
    }

    /// Creates a provider that reports state restored from an external
    /// source when data loss is signalled.
    #[must_use]
    pub fn restoring() -> Self {
        Self {
            restores_on_data_loss: true,
            ..Self::new()
        }
    }

    /// Applies a delivered envelope, advancing the committed sequence
    /// number.
    pub fn apply(&self, envelope: &OperationEnvelope) {
        self.applied.write().push(envelope.clone());
        self.last_committed
            .fetch_max(envelope.sequence_number.as_u64(), Ordering::SeqCst);
    }

    /// Returns every applied envelope, in application order.
    #[must_use]
    pub fn applied(&self) -> Vec<OperationEnvelope> {
        self.applied.read().clone()
    }

    /// The epoch the provider last observed.
    #[must_use]
    pub fn current_epoch(&self) -> Epoch {
        self.epoch.read().0
    }

    /// Number of times the data-loss hook has run.
    #[must_use]
    pub fn data_loss_invocations(&self) -> u64 {
        self.data_loss_invocations.load(Ordering::SeqCst)
    }
}

impl Default for MemoryStateProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StateProvider for MemoryStateProvider {
    fn get_copy_context(&self) -> ReplicationResult<OperationData> {
        let progress = self.last_committed.load(Ordering::SeqCst);
        Ok(OperationData::from_single(progress.to_be_bytes().to_vec()))
    }

    fn get_copy_state(
        &self,
        upto: SequenceNumber,
        _copy_context: OperationData,
    ) -> ReplicationResult<Vec<OperationData>> {
        Ok(self
            .applied
            .read()
            .iter()
            .filter(|env| env.sequence_number <= upto)
            .map(|env| env.data.clone())
            .collect())
    }

    fn update_epoch(
        &self,
        epoch: Epoch,
        previous_epoch_last_sequence_number: SequenceNumber,
    ) -> ReplicationResult<()> {
        let mut guard = self.epoch.write();
        if epoch < guard.0 {
            return Err(ReplicationError::provider(format!(
                "epoch moved backward: {} -> {}",
                guard.0, epoch
            )));
        }
        *guard = (epoch, previous_epoch_last_sequence_number);
        Ok(())
    }

    fn on_data_loss(&self) -> ReplicationResult<bool> {
        self.data_loss_invocations.fetch_add(1, Ordering::SeqCst);
        Ok(self.restores_on_data_loss)
    }

    fn last_committed_sequence_number(&self) -> ReplicationResult<SequenceNumber> {
        Ok(SequenceNumber::new(self.last_committed.load(Ordering::SeqCst)))
    }

    fn undo_progress(&self, from: SequenceNumber) -> ReplicationResult<()> {
        let mut applied = self.applied.write();
        applied.retain(|env| env.sequence_number < from);
        let last = applied
            .iter()
            .map(|env| env.sequence_number.as_u64())
            .max()
            .unwrap_or(0);
        self.last_committed.store(last, Ordering::SeqCst);
        Ok(())
    }
}
