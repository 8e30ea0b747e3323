//! Transport seam.
//!
//! The wire transport is an external collaborator. The primary reaches each
//! secondary through a [`ReplicaLink`] resolved by a [`ReplicaConnector`];
//! the core hands envelopes to the link and never interprets transport
//! semantics.

use crate::error::{ReplicationError, ReplicationResult};
use parking_lot::Mutex;
use replistate_protocol::{OperationData, OperationEnvelope, ReplicaInformation};
use std::sync::Arc;

/// Delivery channel from the primary to one secondary's replicator.
pub trait ReplicaLink: Send + Sync {
    /// Fetches the joining secondary's copy context.
    fn copy_context(&self) -> ReplicationResult<OperationData>;

    /// Delivers a copy-stream envelope.
    fn send_copy(&self, envelope: OperationEnvelope) -> ReplicationResult<()>;

    /// Delivers a replication-stream envelope.
    fn send_replication(&self, envelope: OperationEnvelope) -> ReplicationResult<()>;
}

/// Resolves a replica's published address to a live link.
pub trait ReplicaConnector: Send + Sync {
    /// Connects to the replicator described by `info`.
    fn connect(&self, info: &ReplicaInformation) -> ReplicationResult<Arc<dyn ReplicaLink>>;
}

/// A link that records every envelope handed to it, for tests.
#[derive(Default)]
pub struct MockLink {
    copy: Mutex<Vec<OperationEnvelope>>,
    replication: Mutex<Vec<OperationEnvelope>>,
    copy_context: Mutex<OperationData>,
}

impl MockLink {
    /// Creates an empty mock link.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the copy context the link reports for its replica.
    pub fn set_copy_context(&self, context: OperationData) {
        *self.copy_context.lock() = context;
    }

    /// Envelopes delivered to the copy stream.
    #[must_use]
    pub fn copy_envelopes(&self) -> Vec<OperationEnvelope> {
        self.copy.lock().clone()
    }

    /// Envelopes delivered to the replication stream.
    #[must_use]
    pub fn replication_envelopes(&self) -> Vec<OperationEnvelope> {
        self.replication.lock().clone()
    }
}

impl ReplicaLink for MockLink {
    fn copy_context(&self) -> ReplicationResult<OperationData> {
        Ok(self.copy_context.lock().clone())
    }

    fn send_copy(&self, envelope: OperationEnvelope) -> ReplicationResult<()> {
        self.copy.lock().push(envelope);
        Ok(())
    }

    fn send_replication(&self, envelope: OperationEnvelope) -> ReplicationResult<()> {
        self.replication.lock().push(envelope);
        Ok(())
    }
}

/// A connector that hands out pre-registered mock links, for tests.
#[derive(Default)]
pub struct MockConnector {
    links: Mutex<Vec<(String, Arc<MockLink>)>>,
}

impl MockConnector {
    /// Creates a connector with no registered links.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a link for the given address and returns it.
    pub fn register(&self, address: impl Into<String>) -> Arc<MockLink> {
        let link = Arc::new(MockLink::new());
        self.links.lock().push((address.into(), Arc::clone(&link)));
        link
    }

    /// Returns the link registered for an address, if any.
    #[must_use]
    pub fn link_for(&self, address: &str) -> Option<Arc<MockLink>> {
        self.links
            .lock()
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, l)| Arc::clone(l))
    }
}

impl ReplicaConnector for MockConnector {
    fn connect(&self, info: &ReplicaInformation) -> ReplicationResult<Arc<dyn ReplicaLink>> {
        self.link_for(&info.replicator_address)
            .map(|link| link as Arc<dyn ReplicaLink>)
            .ok_or_else(|| {
                ReplicationError::link_fatal(format!(
                    "no route to {}",
                    info.replicator_address
                ))
            })
    }
}
