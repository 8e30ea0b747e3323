//! Replicated operations and their payloads.
//!
//! [`OperationData`] is the unit of replicated payload: an ordered, immutable
//! sequence of byte buffers that is logically one payload split across
//! segments. [`OperationEnvelope`] is the delivery shape carrying the payload
//! together with its type, epoch, sequence number, and atomic-group tag.

use crate::epoch::{Epoch, SequenceNumber};
use crate::error::{ProtocolError, ProtocolResult};
use bytes::Bytes;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Type of a replicated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    /// An ordinary application operation.
    Normal,
    /// Marks the end of a stream; carries no payload.
    EndOfStream,
    /// A historical operation delivered through the copy stream.
    CopyFragment,
    /// A member operation of an atomic group.
    AtomicGroupOperation,
    /// Terminal commit record of an atomic group.
    AtomicGroupCommit,
    /// Terminal rollback record of an atomic group.
    AtomicGroupRollback,
}

impl OperationType {
    /// Converts to a numeric code for the wire.
    #[must_use]
    pub fn to_code(self) -> u8 {
        match self {
            OperationType::Normal => 1,
            OperationType::EndOfStream => 2,
            OperationType::CopyFragment => 3,
            OperationType::AtomicGroupOperation => 4,
            OperationType::AtomicGroupCommit => 5,
            OperationType::AtomicGroupRollback => 6,
        }
    }

    /// Converts from a numeric code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(OperationType::Normal),
            2 => Some(OperationType::EndOfStream),
            3 => Some(OperationType::CopyFragment),
            4 => Some(OperationType::AtomicGroupOperation),
            5 => Some(OperationType::AtomicGroupCommit),
            6 => Some(OperationType::AtomicGroupRollback),
            _ => None,
        }
    }

    /// Returns true if this type participates in an atomic group.
    #[must_use]
    pub fn is_atomic_group(self) -> bool {
        matches!(
            self,
            OperationType::AtomicGroupOperation
                | OperationType::AtomicGroupCommit
                | OperationType::AtomicGroupRollback
        )
    }
}

/// Identifier of an atomic group.
///
/// Zero means the operation is not part of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AtomicGroupId(pub u64);

impl AtomicGroupId {
    /// The "not part of a group" marker.
    pub const NONE: Self = Self(0);

    /// Creates a new atomic group ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns true if this ID names a real group.
    #[must_use]
    pub const fn is_group(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for AtomicGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "grp:{}", self.0)
    }
}

/// An ordered, immutable sequence of byte buffers forming one payload.
///
/// The caller owns the data until it is handed to the replicator; once
/// replication begins it is logically owned by the delivery pipeline and is
/// read-only thereafter. Delivery preserves segment count, segment order, and
/// segment contents byte for byte.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperationData {
    segments: Vec<Bytes>,
}

impl OperationData {
    /// Creates an empty payload.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Creates a payload from a single buffer.
    #[must_use]
    pub fn from_single(buffer: impl Into<Bytes>) -> Self {
        Self {
            segments: vec![buffer.into()],
        }
    }

    /// Creates a payload from an ordered sequence of segments.
    #[must_use]
    pub fn from_segments(segments: impl IntoIterator<Item = impl Into<Bytes>>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the number of segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Returns the total payload length in bytes across all segments.
    #[must_use]
    pub fn total_len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    /// Returns true if the payload carries no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Bytes::is_empty)
    }

    /// Iterates over the segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &Bytes> {
        self.segments.iter()
    }

    /// Returns the segment at the given index.
    #[must_use]
    pub fn segment(&self, index: usize) -> Option<&Bytes> {
        self.segments.get(index)
    }
}

impl Serialize for OperationData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.segments.iter().map(|segment| segment.to_vec()))
    }
}

impl<'de> Deserialize<'de> for OperationData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let segments = Vec::<Vec<u8>>::deserialize(deserializer)?;
        Ok(Self {
            segments: segments.into_iter().map(Bytes::from).collect(),
        })
    }
}

/// The delivery shape of one replicated operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEnvelope {
    /// Operation type.
    pub op_type: OperationType,
    /// Epoch the operation was replicated in.
    pub epoch: Epoch,
    /// Assigned sequence number.
    pub sequence_number: SequenceNumber,
    /// Atomic group tag; [`AtomicGroupId::NONE`] for ungrouped operations.
    pub atomic_group_id: AtomicGroupId,
    /// The payload.
    pub data: OperationData,
}

impl OperationEnvelope {
    /// Creates an envelope for an ordinary operation.
    #[must_use]
    pub fn normal(epoch: Epoch, sequence_number: SequenceNumber, data: OperationData) -> Self {
        Self {
            op_type: OperationType::Normal,
            epoch,
            sequence_number,
            atomic_group_id: AtomicGroupId::NONE,
            data,
        }
    }

    /// Creates an end-of-stream marker.
    #[must_use]
    pub fn end_of_stream(epoch: Epoch, sequence_number: SequenceNumber) -> Self {
        Self {
            op_type: OperationType::EndOfStream,
            epoch,
            sequence_number,
            atomic_group_id: AtomicGroupId::NONE,
            data: OperationData::empty(),
        }
    }

    /// Creates a copy-stream fragment.
    #[must_use]
    pub fn copy_fragment(
        epoch: Epoch,
        sequence_number: SequenceNumber,
        data: OperationData,
    ) -> Self {
        Self {
            op_type: OperationType::CopyFragment,
            epoch,
            sequence_number,
            atomic_group_id: AtomicGroupId::NONE,
            data,
        }
    }

    /// Creates an atomic-group record of the given type.
    #[must_use]
    pub fn atomic_group(
        op_type: OperationType,
        epoch: Epoch,
        sequence_number: SequenceNumber,
        group: AtomicGroupId,
        data: OperationData,
    ) -> Self {
        debug_assert!(op_type.is_atomic_group());
        Self {
            op_type,
            epoch,
            sequence_number,
            atomic_group_id: group,
            data,
        }
    }

    /// Returns true if this is the end-of-stream marker.
    #[must_use]
    pub fn is_end_of_stream(&self) -> bool {
        self.op_type == OperationType::EndOfStream
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(self, &mut out)
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(out)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_type_codes() {
        for op_type in [
            OperationType::Normal,
            OperationType::EndOfStream,
            OperationType::CopyFragment,
            OperationType::AtomicGroupOperation,
            OperationType::AtomicGroupCommit,
            OperationType::AtomicGroupRollback,
        ] {
            assert_eq!(OperationType::from_code(op_type.to_code()), Some(op_type));
        }
        assert_eq!(OperationType::from_code(0), None);
        assert_eq!(OperationType::from_code(7), None);
    }

    #[test]
    fn atomic_group_id_none() {
        assert!(!AtomicGroupId::NONE.is_group());
        assert!(AtomicGroupId::new(1).is_group());
    }

    #[test]
    fn operation_data_segments() {
        let data = OperationData::from_segments([vec![1u8, 2], vec![3u8], vec![]]);
        assert_eq!(data.segment_count(), 3);
        assert_eq!(data.total_len(), 3);
        assert!(!data.is_empty());
        assert_eq!(data.segment(0).unwrap().as_ref(), &[1, 2]);
        assert_eq!(data.segment(2).unwrap().len(), 0);

        assert!(OperationData::empty().is_empty());
        assert_eq!(OperationData::from_single(vec![9u8]).segment_count(), 1);
    }

    #[test]
    fn envelope_roundtrip_preserves_segments() {
        let data = OperationData::from_segments([vec![0u8; 4], vec![0xFFu8; 2], vec![7u8]]);
        let envelope = OperationEnvelope::normal(Epoch::new(2, 0), SequenceNumber::new(5), data);

        let bytes = envelope.encode().unwrap();
        let decoded = OperationEnvelope::decode(&bytes).unwrap();

        assert_eq!(decoded, envelope);
        assert_eq!(decoded.data.segment_count(), 3);
        assert_eq!(decoded.data.segment(1).unwrap().as_ref(), &[0xFF, 0xFF]);
    }

    #[test]
    fn end_of_stream_marker() {
        let marker = OperationEnvelope::end_of_stream(Epoch::ZERO, SequenceNumber::INVALID);
        assert!(marker.is_end_of_stream());
        assert!(marker.data.is_empty());
    }
}
