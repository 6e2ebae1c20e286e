use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use tokio::time::{sleep, Instant};
use tracing::info;

use super::{Envelope, Node, NodeHandle, Readiness, Transport};
use crate::{
    common::crypto::Keypair,
    consensus::{
        ConsensusConfig, ConsensusError, ConsensusProcessor, NodeId, NodeStateSnapshot, Peers,
        TransportError, Value,
    },
};

/// In-process transport: every node is reached through its handle's channel.
pub struct LocalNetwork {
    size: usize,
    nodes: RwLock<HashMap<NodeId, NodeHandle>>,
    unreachable: RwLock<HashSet<NodeId>>,
}

/// A full cluster running on the local tokio runtime.
pub struct LocalCluster {
    pub network: Arc<LocalNetwork>,
    pub nodes: Vec<NodeHandle>,
}

impl LocalNetwork {
    pub fn new(size: usize) -> Self {
        LocalNetwork {
            size,
            nodes: RwLock::new(HashMap::new()),
            unreachable: RwLock::new(HashSet::new()),
        }
    }

    pub fn register(&self, handle: NodeHandle) {
        self.nodes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id(), handle);
    }

    /// Makes every send to `id` fail, as if the peer went away.
    pub fn disconnect(&self, id: NodeId) {
        self.unreachable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub fn is_ready(&self) -> bool {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).len() == self.size
    }

    pub fn readiness(self: &Arc<Self>) -> Arc<dyn Readiness> {
        let network = Arc::clone(self);
        Arc::new(move || network.is_ready())
    }

    fn handle(&self, id: NodeId) -> Option<NodeHandle> {
        if self
            .unreachable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
        {
            return None;
        }
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), TransportError> {
        let handle = self.handle(to).ok_or(TransportError::Unreachable(to))?;
        handle.post(envelope).map_err(|_| TransportError::Closed(to))
    }
}

impl LocalCluster {
    /// Spawns one node per initial value; ids listed in `faulty` are faulty.
    pub fn spawn(
        config: ConsensusConfig,
        initial: &[Value],
        faulty: &[NodeId],
    ) -> Result<Self, ConsensusError> {
        config.validate()?;
        if initial.len() != config.n {
            return Err(ConsensusError::Configuration {
                n: config.n,
                f: config.f,
                reason: format!("{} initial values given", initial.len()),
            });
        }

        let keypairs: Vec<Keypair> = (0..config.n).map(seeded_keypair).collect();
        let peers = Peers::new(keypairs.iter().map(|keypair| keypair.pubkey()).collect());
        let network = Arc::new(LocalNetwork::new(config.n));
        let transport: Arc<dyn Transport> = network.clone();

        let nodes: Vec<NodeHandle> = keypairs
            .into_iter()
            .zip(initial)
            .enumerate()
            .map(|(id, (keypair, value))| {
                let processor =
                    ConsensusProcessor::new(id, config.clone(), *value, faulty.contains(&id));
                let handle = Node::spawn(
                    processor,
                    keypair,
                    peers.clone(),
                    Arc::clone(&transport),
                    network.readiness(),
                );
                network.register(handle.clone());
                handle
            })
            .collect();

        info!(n = config.n, f = config.f, faulty = ?faulty, "local cluster up");
        Ok(LocalCluster { network, nodes })
    }

    /// Starts every node concurrently and returns each node's answer.
    pub async fn start_all(&self) -> Vec<Result<(), ConsensusError>> {
        let tasks: Vec<_> = self
            .nodes
            .iter()
            .cloned()
            .map(|node| tokio::spawn(async move { node.start().await }))
            .collect();

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            results.push(task.await.unwrap_or(Err(ConsensusError::WorkerUnavailable)));
        }
        results
    }

    /// Polls until every node has settled. Returns false on timeout.
    pub async fn wait_settled(&self, timeout: Duration, poll: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut settled = true;
            for node in &self.nodes {
                if !node.is_settled().await {
                    settled = false;
                    break;
                }
            }
            if settled {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(poll).await;
        }
    }

    pub async fn snapshots(&self) -> Vec<NodeStateSnapshot> {
        let mut snapshots = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            if let Ok(snapshot) = node.state().await {
                snapshots.push(snapshot);
            }
        }
        snapshots
    }
}

fn seeded_keypair(id: NodeId) -> Keypair {
    let mut seed = [0u8; 32];
    seed[..8].copy_from_slice(&(id as u64 + 1).to_le_bytes());
    Keypair::from_seed(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{Message, NodeStatus, Vote};

    const SETTLE: Duration = Duration::from_secs(5);
    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_cluster_agrees_on_common_value() {
        let config = ConsensusConfig::new(4, 1).with_seed(1);
        let cluster = LocalCluster::spawn(config, &[Value::One; 4], &[]).unwrap();

        for result in cluster.start_all().await {
            result.unwrap();
        }
        assert!(cluster.wait_settled(SETTLE, POLL).await);

        for snapshot in cluster.snapshots().await {
            assert_eq!(snapshot.decided, Some(true));
            assert_eq!(snapshot.value, Some(Value::One));
            assert_eq!(snapshot.round, Some(1));
        }
    }

    #[tokio::test]
    async fn test_cluster_tolerates_crashed_node() {
        let initial = [Value::Zero, Value::Zero, Value::Zero, Value::One];
        let config = ConsensusConfig::new(4, 1).with_seed(2);
        let cluster = LocalCluster::spawn(config, &initial, &[3]).unwrap();

        let results = cluster.start_all().await;
        assert_eq!(results[3], Err(ConsensusError::Faulty));
        assert!(cluster.wait_settled(SETTLE, POLL).await);

        let snapshots = cluster.snapshots().await;
        for snapshot in &snapshots[..3] {
            assert_eq!(snapshot.decided, Some(true));
            assert_eq!(snapshot.value, Some(Value::Zero));
        }
        assert_eq!(snapshots[3].status, NodeStatus::Faulty);
        assert_eq!(snapshots[3].value, None);
    }

    #[tokio::test]
    async fn test_unreachable_peer_is_skipped() {
        let config = ConsensusConfig::new(4, 1).with_seed(3);
        let cluster = LocalCluster::spawn(config, &[Value::Zero; 4], &[]).unwrap();
        cluster.network.disconnect(3);

        for result in cluster.start_all().await {
            result.unwrap();
        }

        let honest = LocalCluster {
            network: Arc::clone(&cluster.network),
            nodes: cluster.nodes[..3].to_vec(),
        };
        assert!(honest.wait_settled(SETTLE, POLL).await);
        for snapshot in honest.snapshots().await {
            assert_eq!(snapshot.value, Some(Value::Zero));
            assert_eq!(snapshot.decided, Some(true));
        }
    }

    #[tokio::test]
    async fn test_duplicate_envelopes_are_idempotent() {
        let config = ConsensusConfig::new(4, 1);
        let cluster = LocalCluster::spawn(config, &[Value::One; 4], &[]).unwrap();
        let message = Message::decide(1, Vote::Undecided);
        let envelope = Envelope {
            sender: 2,
            message,
            sig: seeded_keypair(2).sign(&message),
        };

        assert!(cluster.nodes[0].on_message(envelope.clone()).await.is_accepted());
        assert!(cluster.nodes[0].on_message(envelope).await.is_accepted());

        let state = cluster.nodes[0].state().await.unwrap();
        assert_eq!(state.messages_received, Some(2));
        assert_eq!(state.decided, Some(false));
    }

    #[test]
    fn test_spawn_rejects_mismatched_values() {
        let err = LocalCluster::spawn(ConsensusConfig::new(4, 1), &[Value::One; 3], &[]).err();
        assert!(matches!(err, Some(ConsensusError::Configuration { n: 4, .. })));
    }
}
