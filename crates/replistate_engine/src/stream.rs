//! Ordered delivery channels drained by a secondary.
//!
//! A secondary drains two logically distinct streams: the copy stream (the
//! historical backlog up to the point it joined) and the replication stream
//! (the live feed). The copy stream must be fully drained, until it signals
//! end-of-stream, before switching to pure replication consumption.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex as SyncMutex;
use replistate_protocol::{
    AtomicGroupId, OperationData, OperationEnvelope, OperationType, SequenceNumber,
};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

/// Which of the two delivery channels a stream is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Historical backlog delivered once to a joining secondary.
    Copy,
    /// Live replication feed.
    Replication,
}

/// Severity of a stream fault report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// The fault may clear; the replica can be rebuilt.
    Transient,
    /// The replica is permanently unable to continue.
    Permanent,
}

/// Receives acknowledgements produced when a consumer acknowledges a drained
/// operation.
///
/// The transport collaborator implements this to carry acknowledgements back
/// to the primary.
pub trait AcknowledgementSink: Send + Sync {
    /// Called once per acknowledged operation, with the stream it was
    /// drained from and its sequence number.
    fn acknowledge(&self, kind: StreamKind, sequence_number: SequenceNumber);
}

const ACK_PENDING: u8 = 0;
const ACK_AUTO: u8 = 1;
const ACK_DONE: u8 = 2;

struct StreamShared {
    kind: StreamKind,
    auto_ack: bool,
    progress: Arc<AtomicU64>,
    sink: SyncMutex<Option<Arc<dyn AcknowledgementSink>>>,
    fault: SyncMutex<Option<FaultKind>>,
}

impl StreamShared {
    fn deliver_ack(&self, sequence_number: SequenceNumber) {
        self.progress
            .fetch_max(sequence_number.as_u64(), Ordering::SeqCst);
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.acknowledge(self.kind, sequence_number);
        }
    }
}

/// One operation drained from a stream.
///
/// Must be acknowledged exactly once when the provider is persisted; streams
/// configured for auto-acknowledgement resolve it on delivery.
pub struct Operation {
    envelope: OperationEnvelope,
    ack_state: AtomicU8,
    shared: Arc<StreamShared>,
}

impl Operation {
    /// The full delivery envelope.
    #[must_use]
    pub fn envelope(&self) -> &OperationEnvelope {
        &self.envelope
    }

    /// Operation type.
    #[must_use]
    pub fn op_type(&self) -> OperationType {
        self.envelope.op_type
    }

    /// Assigned sequence number.
    #[must_use]
    pub fn sequence_number(&self) -> SequenceNumber {
        self.envelope.sequence_number
    }

    /// Atomic group tag; [`AtomicGroupId::NONE`] for ungrouped operations.
    #[must_use]
    pub fn atomic_group_id(&self) -> AtomicGroupId {
        self.envelope.atomic_group_id
    }

    /// The payload.
    #[must_use]
    pub fn data(&self) -> &OperationData {
        &self.envelope.data
    }

    /// Acknowledges the operation.
    ///
    /// Exactly one explicit acknowledgement is allowed; on auto-acknowledge
    /// streams this is a no-op.
    pub fn acknowledge(&self) -> ReplicationResult<()> {
        match self.ack_state.compare_exchange(
            ACK_PENDING,
            ACK_DONE,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => {
                self.shared.deliver_ack(self.envelope.sequence_number);
                Ok(())
            }
            Err(ACK_AUTO) => Ok(()),
            Err(_) => Err(ReplicationError::AlreadyAcknowledged {
                sequence_number: self.envelope.sequence_number,
            }),
        }
    }
}

/// Intake side of a stream, fed by the replicator.
pub struct OperationStreamWriter {
    tx: mpsc::UnboundedSender<OperationEnvelope>,
    expected_next: SyncMutex<Option<u64>>,
    shared: Arc<StreamShared>,
}

impl OperationStreamWriter {
    /// Enqueues an envelope for delivery.
    ///
    /// Envelopes must arrive gap-free in sequence order; the first envelope
    /// establishes the starting point.
    pub fn push(&self, envelope: OperationEnvelope) -> ReplicationResult<()> {
        if self.shared.fault.lock().is_some() {
            return Err(ReplicationError::StreamFaulted);
        }

        let mut expected = self.expected_next.lock();
        let lsn = envelope.sequence_number.as_u64();
        if let Some(next) = *expected {
            if lsn != next {
                return Err(ReplicationError::OutOfOrder {
                    expected: SequenceNumber::new(next),
                    got: envelope.sequence_number,
                });
            }
        }
        *expected = Some(lsn + 1);

        self.tx
            .send(envelope)
            .map_err(|_| ReplicationError::Closed)
    }

    /// Signals end-of-stream; the consumer observes `None` after draining
    /// everything already delivered.
    pub fn finish(&self) {
        let marker = OperationEnvelope::end_of_stream(
            replistate_protocol::Epoch::ZERO,
            SequenceNumber::INVALID,
        );
        if self.tx.send(marker).is_err() {
            warn!(kind = ?self.shared.kind, "stream consumer gone before end-of-stream");
        }
    }
}

/// Consumer side of a stream.
///
/// Consumption is strictly sequential: at most one `get_operation` pull may
/// be outstanding at a time.
pub struct OperationStream {
    rx: AsyncMutex<mpsc::UnboundedReceiver<OperationEnvelope>>,
    drained: SyncMutex<bool>,
    shared: Arc<StreamShared>,
}

impl OperationStream {
    /// Creates a connected writer/stream pair.
    ///
    /// `progress` receives the high-water mark of acknowledged sequence
    /// numbers; `sink` (if any) receives each acknowledgement.
    #[must_use]
    pub fn channel(
        kind: StreamKind,
        auto_ack: bool,
        progress: Arc<AtomicU64>,
        sink: Option<Arc<dyn AcknowledgementSink>>,
    ) -> (OperationStreamWriter, OperationStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(StreamShared {
            kind,
            auto_ack,
            progress,
            sink: SyncMutex::new(sink),
            fault: SyncMutex::new(None),
        });
        (
            OperationStreamWriter {
                tx,
                expected_next: SyncMutex::new(None),
                shared: Arc::clone(&shared),
            },
            OperationStream {
                rx: AsyncMutex::new(rx),
                drained: SyncMutex::new(false),
                shared,
            },
        )
    }

    /// Which channel this stream is.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.shared.kind
    }

    /// Routes acknowledgements drained from this stream to `sink`.
    pub(crate) fn set_acknowledgement_sink(&self, sink: Arc<dyn AcknowledgementSink>) {
        *self.shared.sink.lock() = Some(sink);
    }

    /// Pulls the next operation.
    ///
    /// Returns `Ok(None)` once the stream has signalled end-of-stream. At
    /// most one pull may be outstanding; a concurrent pull fails with
    /// [`ReplicationError::PullOutstanding`].
    pub async fn get_operation(&self) -> ReplicationResult<Option<Operation>> {
        if self.shared.fault.lock().is_some() {
            return Err(ReplicationError::StreamFaulted);
        }
        if *self.drained.lock() {
            return Ok(None);
        }

        let mut rx = self
            .rx
            .try_lock()
            .map_err(|_| ReplicationError::PullOutstanding)?;

        let envelope = match rx.recv().await {
            Some(envelope) => envelope,
            // Writer dropped without an end-of-stream marker: the
            // replicator was torn down.
            None => return Err(ReplicationError::Closed),
        };

        if self.shared.fault.lock().is_some() {
            return Err(ReplicationError::StreamFaulted);
        }

        if envelope.is_end_of_stream() {
            *self.drained.lock() = true;
            return Ok(None);
        }

        let operation = Operation {
            envelope,
            ack_state: AtomicU8::new(if self.shared.auto_ack {
                ACK_AUTO
            } else {
                ACK_PENDING
            }),
            shared: Arc::clone(&self.shared),
        };
        if self.shared.auto_ack {
            self.shared.deliver_ack(operation.envelope.sequence_number);
        }
        Ok(Some(operation))
    }

    /// Reports a fault on the stream and detaches further delivery.
    pub fn report_fault(&self, kind: FaultKind) {
        warn!(stream = ?self.shared.kind, fault = ?kind, "stream fault reported");
        *self.shared.fault.lock() = Some(kind);
    }

    /// Returns the reported fault, if any.
    #[must_use]
    pub fn fault(&self) -> Option<FaultKind> {
        *self.shared.fault.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use replistate_protocol::Epoch;

    struct RecordingSink {
        acks: Mutex<Vec<(StreamKind, SequenceNumber)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                acks: Mutex::new(Vec::new()),
            })
        }
    }

    impl AcknowledgementSink for RecordingSink {
        fn acknowledge(&self, kind: StreamKind, sequence_number: SequenceNumber) {
            self.acks.lock().push((kind, sequence_number));
        }
    }

    fn envelope(lsn: u64) -> OperationEnvelope {
        OperationEnvelope::normal(
            Epoch::new(1, 0),
            SequenceNumber::new(lsn),
            OperationData::from_single(vec![lsn as u8]),
        )
    }

    fn make_stream(
        auto_ack: bool,
        sink: Option<Arc<dyn AcknowledgementSink>>,
    ) -> (OperationStreamWriter, OperationStream, Arc<AtomicU64>) {
        let progress = Arc::new(AtomicU64::new(0));
        let (writer, stream) = OperationStream::channel(
            StreamKind::Replication,
            auto_ack,
            Arc::clone(&progress),
            sink,
        );
        (writer, stream, progress)
    }

    #[tokio::test]
    async fn delivers_in_order_and_signals_end() {
        let (writer, stream, _) = make_stream(false, None);
        writer.push(envelope(1)).unwrap();
        writer.push(envelope(2)).unwrap();
        writer.finish();

        let first = stream.get_operation().await.unwrap().unwrap();
        assert_eq!(first.sequence_number(), SequenceNumber::new(1));
        assert_eq!(first.data().segment(0).unwrap().as_ref(), &[1]);

        let second = stream.get_operation().await.unwrap().unwrap();
        assert_eq!(second.sequence_number(), SequenceNumber::new(2));

        assert!(stream.get_operation().await.unwrap().is_none());
        // End-of-stream is sticky.
        assert!(stream.get_operation().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn explicit_ack_is_exactly_once() {
        let sink = RecordingSink::new();
        let (writer, stream, progress) = make_stream(false, Some(sink.clone()));
        writer.push(envelope(1)).unwrap();

        let op = stream.get_operation().await.unwrap().unwrap();
        op.acknowledge().unwrap();
        assert!(matches!(
            op.acknowledge(),
            Err(ReplicationError::AlreadyAcknowledged { .. })
        ));

        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(sink.acks.lock().len(), 1);
    }

    #[tokio::test]
    async fn auto_ack_resolves_on_delivery() {
        let sink = RecordingSink::new();
        let (writer, stream, progress) = make_stream(true, Some(sink.clone()));
        writer.push(envelope(1)).unwrap();

        let op = stream.get_operation().await.unwrap().unwrap();
        assert_eq!(progress.load(Ordering::SeqCst), 1);
        assert_eq!(sink.acks.lock().len(), 1);

        // Explicit acknowledgement is a harmless no-op.
        op.acknowledge().unwrap();
        assert_eq!(sink.acks.lock().len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_push_rejected() {
        let (writer, _stream, _) = make_stream(false, None);
        writer.push(envelope(5)).unwrap();
        let err = writer.push(envelope(7)).unwrap_err();
        assert!(matches!(err, ReplicationError::OutOfOrder { .. }));
        // The expected position is unchanged.
        writer.push(envelope(6)).unwrap();
    }

    #[tokio::test]
    async fn fault_detaches_delivery() {
        let (writer, stream, _) = make_stream(false, None);
        writer.push(envelope(1)).unwrap();
        stream.report_fault(FaultKind::Transient);

        assert!(matches!(
            stream.get_operation().await,
            Err(ReplicationError::StreamFaulted)
        ));
        assert!(matches!(
            writer.push(envelope(2)),
            Err(ReplicationError::StreamFaulted)
        ));
        assert_eq!(stream.fault(), Some(FaultKind::Transient));
    }

    #[tokio::test]
    async fn writer_drop_without_end_marker_errors() {
        let (writer, stream, _) = make_stream(false, None);
        drop(writer);
        assert!(matches!(
            stream.get_operation().await,
            Err(ReplicationError::Closed)
        ));
    }
}
