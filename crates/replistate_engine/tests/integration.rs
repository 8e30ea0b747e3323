//! Integration tests wiring a primary replicator to secondaries over
//! in-process links.

use parking_lot::Mutex;
use replistate_engine::{
    AcknowledgementSink, CancellationToken, MemoryStateProvider, OpenMode, ReplicaConnector,
    ReplicaLink, ReplicationError, ReplicationResult, ReplicatorCapability, ReplicatorSettings,
    StateProvider, StateReplicator, StreamKind,
};
use replistate_protocol::{
    Epoch, OperationData, OperationEnvelope, OperationType, ReplicaId, ReplicaInformation,
    ReplicaRole, ReplicaSetConfiguration, ReplicaSetQuorumMode, SequenceNumber,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A link that delivers envelopes straight into the target replicator's
/// intake.
struct ClusterLink {
    target: Arc<StateReplicator>,
}

impl ReplicaLink for ClusterLink {
    fn copy_context(&self) -> ReplicationResult<OperationData> {
        self.target.copy_context()
    }

    fn send_copy(&self, envelope: OperationEnvelope) -> ReplicationResult<()> {
        self.target.apply_copy_envelope(envelope)
    }

    fn send_replication(&self, envelope: OperationEnvelope) -> ReplicationResult<()> {
        self.target.apply_replication_envelope(envelope)
    }
}

/// Resolves replicator addresses to in-process replicators.
struct ClusterConnector {
    replicas: Mutex<HashMap<String, Arc<StateReplicator>>>,
}

impl ClusterConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            replicas: Mutex::new(HashMap::new()),
        })
    }

    fn register(&self, address: String, replicator: Arc<StateReplicator>) {
        self.replicas.lock().insert(address, replicator);
    }
}

impl ReplicaConnector for ClusterConnector {
    fn connect(&self, info: &ReplicaInformation) -> ReplicationResult<Arc<dyn ReplicaLink>> {
        let target = self
            .replicas
            .lock()
            .get(&info.replicator_address)
            .cloned()
            .ok_or_else(|| {
                ReplicationError::link_fatal(format!("no route to {}", info.replicator_address))
            })?;
        Ok(Arc::new(ClusterLink { target }))
    }
}

/// Carries a secondary's stream acknowledgements back to the primary.
struct AckForwarder {
    primary: Arc<StateReplicator>,
    from: ReplicaId,
}

impl AcknowledgementSink for AckForwarder {
    fn acknowledge(&self, kind: StreamKind, sequence_number: SequenceNumber) {
        match kind {
            StreamKind::Copy => self
                .primary
                .handle_copy_acknowledgement(self.from, sequence_number),
            StreamKind::Replication => self
                .primary
                .handle_acknowledgement(self.from, sequence_number),
        }
    }
}

struct Node {
    replicator: Arc<StateReplicator>,
    provider: Arc<MemoryStateProvider>,
    info: ReplicaInformation,
}

fn make_node(connector: &Arc<ClusterConnector>, id: u64) -> Node {
    let address = format!("mem://{id}");
    let provider = Arc::new(MemoryStateProvider::new());
    let replicator = Arc::new(StateReplicator::new(
        ReplicaId::new(id),
        ReplicatorCapability::AtomicGroupCapable,
        ReplicatorSettings::new(address.clone()),
        Arc::clone(&provider) as Arc<dyn StateProvider>,
        Arc::clone(connector) as Arc<dyn ReplicaConnector>,
    ));
    connector.register(address.clone(), Arc::clone(&replicator));
    Node {
        replicator,
        provider,
        info: ReplicaInformation::active_secondary(ReplicaId::new(id), address),
    }
}

/// Spawns drain loops for both of a secondary's streams, applying every
/// operation to its provider and acknowledging it.
fn attach_secondary(node: &Node, primary: &Arc<StateReplicator>) {
    node.replicator.set_acknowledgement_sink(Arc::new(AckForwarder {
        primary: Arc::clone(primary),
        from: node.replicator.replica_id(),
    }));

    let copy = node.replicator.get_copy_stream().unwrap();
    let copy_provider = Arc::clone(&node.provider);
    tokio::spawn(async move {
        while let Ok(Some(operation)) = copy.get_operation().await {
            copy_provider.apply(operation.envelope());
            operation.acknowledge().unwrap();
        }
    });

    let replication = node.replicator.get_replication_stream().unwrap();
    let provider = Arc::clone(&node.provider);
    tokio::spawn(async move {
        while let Ok(Some(operation)) = replication.get_operation().await {
            provider.apply(operation.envelope());
            operation.acknowledge().unwrap();
        }
    });
}

struct Cluster {
    connector: Arc<ClusterConnector>,
    primary: Node,
    secondaries: Vec<Node>,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// One primary and `secondary_count` draining active secondaries, with
/// the configuration installed on the primary.
fn make_cluster(secondary_count: u64) -> Cluster {
    init_tracing();
    let connector = ClusterConnector::new();
    let primary = make_node(&connector, 1);
    primary.replicator.open(OpenMode::New).unwrap();
    primary.replicator.change_role(ReplicaRole::Primary).unwrap();

    let mut secondaries = Vec::new();
    for id in 2..2 + secondary_count {
        let node = make_node(&connector, id);
        node.replicator.open(OpenMode::New).unwrap();
        node.replicator
            .change_role(ReplicaRole::ActiveSecondary)
            .unwrap();
        attach_secondary(&node, &primary.replicator);
        secondaries.push(node);
    }

    let config = ReplicaSetConfiguration::new(
        secondaries.iter().map(|node| node.info.clone()).collect(),
    );
    primary
        .replicator
        .update_current_replica_set_configuration(&config)
        .unwrap();

    Cluster {
        connector,
        primary,
        secondaries,
    }
}

fn payload(text: &str) -> OperationData {
    OperationData::from_single(text.as_bytes().to_vec())
}

#[tokio::test]
async fn three_replica_quorum_commit() {
    let cluster = make_cluster(2);
    let token = CancellationToken::new();

    let first = cluster
        .primary
        .replicator
        .replicate(payload("first"), &token)
        .unwrap();
    let second = cluster
        .primary
        .replicator
        .replicate(payload("second"), &token)
        .unwrap();
    assert_eq!(first.sequence_number, SequenceNumber::new(1));
    assert_eq!(second.sequence_number, SequenceNumber::new(2));

    first.receipt.wait().await.unwrap();
    second.receipt.wait().await.unwrap();

    // Wait until every active secondary has the full history.
    cluster
        .primary
        .replicator
        .wait_for_catch_up_quorum(ReplicaSetQuorumMode::All, &token)
        .await
        .unwrap();
    for node in &cluster.secondaries {
        assert_eq!(node.provider.applied().len(), 2);
    }
    assert_eq!(
        cluster.primary.replicator.status().unwrap().committed,
        SequenceNumber::new(2)
    );
}

#[tokio::test]
async fn atomic_group_commits_after_members() {
    let cluster = make_cluster(2);
    let token = CancellationToken::new();
    let primary = &cluster.primary.replicator;

    primary.replicate(payload("before"), &token).unwrap();
    let group = primary.create_atomic_group().unwrap();
    let member = primary
        .replicate_atomic_group_operation(group, payload("member"), &token)
        .unwrap();
    let commit = primary.replicate_atomic_group_commit(group, &token).unwrap();

    assert!(commit.sequence_number > member.sequence_number);
    member.receipt.wait().await.unwrap();
    commit.receipt.wait().await.unwrap();

    // Terminal group: further members are rejected.
    let late = primary.replicate_atomic_group_operation(group, payload("late"), &token);
    assert!(matches!(
        late,
        Err(ReplicationError::AtomicGroupInvalid { .. })
    ));

    // Secondaries saw the member and the commit record in order.
    cluster
        .primary
        .replicator
        .wait_for_catch_up_quorum(ReplicaSetQuorumMode::All, &token)
        .await
        .unwrap();
    let applied = cluster.secondaries[0].provider.applied();
    assert_eq!(applied.len(), 3);
    assert_eq!(applied[1].op_type, OperationType::AtomicGroupOperation);
    assert_eq!(applied[2].op_type, OperationType::AtomicGroupCommit);
    assert_eq!(applied[2].atomic_group_id, group);
}

#[tokio::test]
async fn stale_epoch_replica_stops_applying() {
    let cluster = make_cluster(2);
    let token = CancellationToken::new();
    let primary = &cluster.primary.replicator;

    primary.update_epoch(Epoch::new(2, 0)).unwrap();
    for node in &cluster.secondaries {
        node.replicator.update_epoch(Epoch::new(2, 0)).unwrap();
    }

    let first = primary.replicate(payload("first"), &token).unwrap();
    first.receipt.wait().await.unwrap();

    // One secondary moves ahead to a newer configuration.
    cluster.secondaries[0]
        .replicator
        .update_epoch(Epoch::new(3, 0))
        .unwrap();

    // The primary still stamps (2,0); the advanced replica fences the
    // delivery but the other secondary sustains the quorum.
    let second = primary.replicate(payload("second"), &token).unwrap();
    second.receipt.wait().await.unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(cluster.secondaries[0].provider.applied().len(), 1);
    assert_eq!(cluster.secondaries[1].provider.applied().len(), 2);
}

#[tokio::test]
async fn removed_replica_is_ignored_by_catch_up() {
    let connector = ClusterConnector::new();
    let primary = make_node(&connector, 1);
    primary.replicator.open(OpenMode::New).unwrap();
    primary.replicator.change_role(ReplicaRole::Primary).unwrap();

    // A healthy secondary that drains, and a stuck one that never does.
    let healthy = make_node(&connector, 2);
    healthy.replicator.open(OpenMode::New).unwrap();
    healthy
        .replicator
        .change_role(ReplicaRole::ActiveSecondary)
        .unwrap();
    attach_secondary(&healthy, &primary.replicator);
    let stuck = make_node(&connector, 3);
    stuck.replicator.open(OpenMode::New).unwrap();
    stuck
        .replicator
        .change_role(ReplicaRole::ActiveSecondary)
        .unwrap();

    let config =
        ReplicaSetConfiguration::new(vec![healthy.info.clone(), stuck.info.clone()]);
    primary
        .replicator
        .update_current_replica_set_configuration(&config)
        .unwrap();

    let token = CancellationToken::new();
    let pending = primary
        .replicator
        .replicate(payload("a"), &token)
        .unwrap();
    pending.receipt.wait().await.unwrap();

    // All-replica catch-up cannot finish while the stuck replica lags.
    let wait = primary
        .replicator
        .wait_for_catch_up_quorum(ReplicaSetQuorumMode::All, &token);
    tokio::pin!(wait);
    tokio::select! {
        _ = &mut wait => panic!("catch-up completed with a lagging replica"),
        _ = tokio::time::sleep(Duration::from_millis(20)) => {}
    }

    primary
        .replicator
        .remove_replica(stuck.replicator.replica_id())
        .unwrap();
    wait.await.unwrap();
}

#[tokio::test]
async fn build_replica_copies_state_then_streams_live() {
    let cluster = make_cluster(1);
    let token = CancellationToken::new();
    let primary = &cluster.primary.replicator;

    // Establish history the joiner has to copy. The primary's provider
    // holds what it has applied so far.
    for n in 1..=3u64 {
        let pending = primary.replicate(payload("seed"), &token).unwrap();
        cluster.primary.provider.apply(&OperationEnvelope::normal(
            primary.current_epoch(),
            SequenceNumber::new(n),
            payload("seed"),
        ));
        pending.receipt.wait().await.unwrap();
    }

    // A fresh idle secondary joins.
    let joiner = make_node(&cluster.connector, 9);
    joiner.replicator.open(OpenMode::New).unwrap();
    joiner
        .replicator
        .change_role(ReplicaRole::IdleSecondary)
        .unwrap();
    attach_secondary(&joiner, primary);
    let info = ReplicaInformation::idle_secondary(ReplicaId::new(9), "mem://9");

    primary.build_replica(&info, &token).await.unwrap();
    assert_eq!(joiner.provider.applied().len(), 3);

    // Promote it into the configuration; live operations now reach it.
    let mut members: Vec<ReplicaInformation> = cluster
        .secondaries
        .iter()
        .map(|node| node.info.clone())
        .collect();
    members.push(ReplicaInformation::active_secondary(
        ReplicaId::new(9),
        "mem://9",
    ));
    joiner
        .replicator
        .change_role(ReplicaRole::ActiveSecondary)
        .unwrap();
    primary
        .update_current_replica_set_configuration(&ReplicaSetConfiguration::new(members))
        .unwrap();

    let live = primary.replicate(payload("live"), &token).unwrap();
    live.receipt.wait().await.unwrap();
    primary
        .wait_for_catch_up_quorum(ReplicaSetQuorumMode::All, &token)
        .await
        .unwrap();
    assert_eq!(joiner.provider.applied().len(), 4);
}

#[tokio::test]
async fn closed_secondary_does_not_block_quorum() {
    let cluster = make_cluster(2);
    let token = CancellationToken::new();
    let primary = &cluster.primary.replicator;

    let first = primary.replicate(payload("first"), &token).unwrap();
    first.receipt.wait().await.unwrap();

    cluster.secondaries[0].replicator.close().unwrap();

    // Delivery to the closed replica fails, but the quorum of the
    // primary plus the surviving secondary still commits.
    let second = primary.replicate(payload("second"), &token).unwrap();
    second.receipt.wait().await.unwrap();
    assert_eq!(
        primary.status().unwrap().committed,
        SequenceNumber::new(2)
    );
}

#[tokio::test]
async fn receipt_timeout_leaves_operation_pending() {
    let cluster = make_cluster(1);
    let token = CancellationToken::new();
    let primary = &cluster.primary.replicator;

    // Freeze the secondary by closing it before delivery.
    cluster.secondaries[0].replicator.close().unwrap();

    let pending = primary.replicate(payload("a"), &token).unwrap();
    let lsn = pending.sequence_number;
    let outcome = pending
        .receipt
        .wait_timeout(Duration::from_millis(20))
        .await;
    assert!(matches!(outcome, Err(ReplicationError::Timeout)));

    // The operation is still in flight; a late acknowledgement commits it.
    primary.handle_acknowledgement(cluster.secondaries[0].replicator.replica_id(), lsn);
    assert_eq!(primary.status().unwrap().committed, lsn);
}

#[tokio::test]
async fn secondary_promotion_resumes_sequence_space() {
    let cluster = make_cluster(2);
    let token = CancellationToken::new();
    let primary = &cluster.primary.replicator;

    for _ in 0..3 {
        let pending = primary.replicate(payload("x"), &token).unwrap();
        pending.receipt.wait().await.unwrap();
    }
    primary
        .wait_for_catch_up_quorum(ReplicaSetQuorumMode::All, &token)
        .await
        .unwrap();

    // The caught-up secondary takes over as primary and continues the
    // sequence space where it left off.
    let successor = &cluster.secondaries[0];
    successor
        .replicator
        .change_role(ReplicaRole::Primary)
        .unwrap();
    let pending = successor
        .replicator
        .replicate(payload("after failover"), &token)
        .unwrap();
    assert_eq!(pending.sequence_number, SequenceNumber::new(4));
}
