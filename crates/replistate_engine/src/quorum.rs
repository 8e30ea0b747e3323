//! Write-quorum math.
//!
//! The primary is part of the write quorum and is considered to acknowledge
//! its own operations immediately, so an operation is quorum-committed once
//! `write_quorum - 1` remote replicas have acknowledged it.

use replistate_protocol::SequenceNumber;

/// Majority write quorum for a replica set of the given size (including
/// the primary).
#[must_use]
pub fn write_quorum(replica_set_size: usize) -> usize {
    replica_set_size / 2 + 1
}

/// Computes the highest sequence number acknowledged by a write quorum.
///
/// `remote_acked` holds the last acknowledged sequence number of each remote
/// replica in the configuration; `primary_progress` is the primary's own
/// last assigned sequence number. Returns `None` when the configuration does
/// not hold enough remote replicas to ever form a quorum.
///
/// With quorum `q`, the committed number must be acknowledged by `q - 1`
/// remote replicas, so it is the value at index `q - 2` of the remote
/// acknowledgements sorted in descending order.
#[must_use]
pub fn quorum_committed_lsn(
    remote_acked: &[SequenceNumber],
    write_quorum: usize,
    primary_progress: SequenceNumber,
) -> Option<SequenceNumber> {
    if write_quorum <= 1 {
        return Some(primary_progress);
    }

    let needed = write_quorum - 1;
    if remote_acked.len() < needed {
        return None;
    }

    let mut sorted = remote_acked.to_vec();
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    let committed = sorted[needed - 1];

    // The committed number never runs ahead of the primary's own progress.
    Some(committed.min(primary_progress))
}
