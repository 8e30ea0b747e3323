//! Primary-side replication queue.
//!
//! The queue serializes sequence-number assignment (submission order defines
//! sequence order) and holds each operation's completion sender until the
//! operation is quorum-acknowledged or the queue is flushed by a lifecycle
//! transition.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex;
use replistate_protocol::{
    AtomicGroupId, Epoch, OperationData, OperationEnvelope, OperationType, SequenceNumber,
};
use std::collections::VecDeque;
use tokio::sync::oneshot;

/// Snapshot of the queue's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounters {
    /// Operations awaiting quorum acknowledgement.
    pub pending_count: usize,
    /// Sequence number of the oldest retained operation, if any.
    pub first_pending: Option<SequenceNumber>,
    /// Last sequence number assigned.
    pub last_assigned: SequenceNumber,
    /// Last quorum-completed sequence number.
    pub completed: SequenceNumber,
}

struct PendingOperation {
    sequence_number: SequenceNumber,
    completion: Option<oneshot::Sender<ReplicationResult<()>>>,
}

struct QueueInner {
    next_lsn: u64,
    completed: u64,
    pending: VecDeque<PendingOperation>,
}

/// Ordered in-flight operation table for a primary.
pub struct ReplicationQueue {
    inner: Mutex<QueueInner>,
}

impl ReplicationQueue {
    /// Creates an empty queue starting at sequence number 1.
    #[must_use]
    pub fn new() -> Self {
        Self::with_start(SequenceNumber::INVALID)
    }

    /// Creates a queue whose numbering continues after `completed`.
    #[must_use]
    pub fn with_start(completed: SequenceNumber) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                next_lsn: completed.as_u64() + 1,
                completed: completed.as_u64(),
                pending: VecDeque::new(),
            }),
        }
    }

    /// Re-seeds the queue after a role transition.
    ///
    /// Pending operations must have been flushed first.
    pub fn reseed(&self, completed: SequenceNumber) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.pending.is_empty());
        inner.next_lsn = completed.as_u64() + 1;
        inner.completed = completed.as_u64();
    }

    /// Assigns the next sequence number to an operation and enqueues its
    /// completion.
    ///
    /// Assignment is serialized: the queue lock makes submission order the
    /// sequence order.
    pub fn assign(
        &self,
        op_type: OperationType,
        epoch: Epoch,
        group: AtomicGroupId,
        data: OperationData,
    ) -> (OperationEnvelope, oneshot::Receiver<ReplicationResult<()>>) {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock();
        let sequence_number = SequenceNumber::new(inner.next_lsn);
        inner.next_lsn += 1;
        inner.pending.push_back(PendingOperation {
            sequence_number,
            completion: Some(tx),
        });

        let envelope = OperationEnvelope {
            op_type,
            epoch,
            sequence_number,
            atomic_group_id: group,
            data,
        };
        (envelope, rx)
    }

    /// Completes every pending operation with a sequence number at or below
    /// `committed`.
    ///
    /// Returns the number of operations completed.
    pub fn complete_through(&self, committed: SequenceNumber) -> usize {
        let mut inner = self.inner.lock();
        if committed.as_u64() > inner.completed {
            inner.completed = committed.as_u64();
        }

        let mut completed_count = 0;
        while let Some(front) = inner.pending.front_mut() {
            if front.sequence_number > committed {
                break;
            }
            if let Some(tx) = front.completion.take() {
                // The caller may have dropped the receipt (e.g. after a
                // timeout); the operation still commits.
                let _ = tx.send(Ok(()));
            }
            inner.pending.pop_front();
            completed_count += 1;
        }
        completed_count
    }

    /// Fails every pending operation with an error produced by `make_error`.
    ///
    /// Used on close, abort, and Primary demotion.
    pub fn fail_all(&self, make_error: impl Fn(SequenceNumber) -> ReplicationError) -> usize {
        let mut inner = self.inner.lock();
        let mut failed = 0;
        while let Some(mut op) = inner.pending.pop_front() {
            if let Some(tx) = op.completion.take() {
                let _ = tx.send(Err(make_error(op.sequence_number)));
            }
            failed += 1;
        }
        failed
    }

    /// Last sequence number assigned by this queue.
    #[must_use]
    pub fn last_assigned(&self) -> SequenceNumber {
        SequenceNumber::new(self.inner.lock().next_lsn - 1)
    }

    /// Last quorum-completed sequence number.
    #[must_use]
    pub fn completed(&self) -> SequenceNumber {
        SequenceNumber::new(self.inner.lock().completed)
    }

    /// Earliest sequence number still retained by the queue.
    ///
    /// A secondary whose progress is at or past this point can be caught up
    /// from the queue alone; anything older requires a full copy.
    #[must_use]
    pub fn first_retained(&self) -> SequenceNumber {
        let inner = self.inner.lock();
        match inner.pending.front() {
            Some(op) => op.sequence_number,
            None => SequenceNumber::new(inner.completed + 1),
        }
    }

    /// Returns a snapshot of the queue counters.
    #[must_use]
    pub fn counters(&self) -> QueueCounters {
        let inner = self.inner.lock();
        QueueCounters {
            pending_count: inner.pending.len(),
            first_pending: inner.pending.front().map(|op| op.sequence_number),
            last_assigned: SequenceNumber::new(inner.next_lsn - 1),
            completed: SequenceNumber::new(inner.completed),
        }
    }
}

impl Default for ReplicationQueue {
    fn default() -> Self {
        Self::new()
    }
}
