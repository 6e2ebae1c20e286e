use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{Envelope, HandlerResult, Readiness, Transport};
use crate::{
    common::crypto::Keypair,
    consensus::{
        ConsensusError, ConsensusProcessor, NodeId, NodeStateSnapshot, NodeStatus, Peers, Recipient,
        Step,
    },
};

enum Command {
    Start(oneshot::Sender<Result<(), ConsensusError>>),
    Deliver {
        envelope: Envelope,
        reply: Option<oneshot::Sender<HandlerResult>>,
    },
    Stop(oneshot::Sender<()>),
    State(oneshot::Sender<NodeStateSnapshot>),
    Status(oneshot::Sender<NodeStatus>),
    Settled(oneshot::Sender<bool>),
}

/// Worker that owns one node's consensus state. Every command goes through
/// its channel, so handling is strictly one at a time.
pub struct Node {
    pub keypair: Keypair,
    pub peers: Peers,
    processor: ConsensusProcessor,
    transport: Arc<dyn Transport>,
    stopped: Arc<AtomicBool>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

/// Cheap, cloneable entry point to a running [`Node`].
#[derive(Clone)]
pub struct NodeHandle {
    id: NodeId,
    cmd_tx: mpsc::UnboundedSender<Command>,
    stopped: Arc<AtomicBool>,
    readiness: Arc<dyn Readiness>,
    poll_interval: Duration,
}

impl Node {
    /// Spawns the worker on the current tokio runtime.
    pub fn spawn(
        processor: ConsensusProcessor,
        keypair: Keypair,
        peers: Peers,
        transport: Arc<dyn Transport>,
        readiness: Arc<dyn Readiness>,
    ) -> NodeHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let stopped = Arc::new(AtomicBool::new(false));
        let handle = NodeHandle {
            id: processor.id,
            cmd_tx,
            stopped: Arc::clone(&stopped),
            readiness,
            poll_interval: processor.config.ready_poll_interval(),
        };

        let node = Node {
            keypair,
            peers,
            processor,
            transport,
            stopped,
            cmd_rx,
        };
        tokio::spawn(node.run());
        handle
    }

    async fn run(mut self) {
        debug!(node = self.processor.id, "worker running");
        while let Some(command) = self.cmd_rx.recv().await {
            match command {
                Command::Start(reply) => {
                    let result = self.processor.start().map(|step| self.dispatch(step));
                    let _ = reply.send(result);
                }
                Command::Deliver { envelope, reply } => {
                    let result = self.deliver(envelope);
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                }
                Command::Stop(reply) => {
                    self.processor.stop();
                    let _ = reply.send(());
                }
                Command::State(reply) => {
                    let _ = reply.send(self.processor.snapshot());
                }
                Command::Status(reply) => {
                    let _ = reply.send(self.processor.status());
                }
                Command::Settled(reply) => {
                    let _ = reply.send(self.processor.is_settled());
                }
            }
        }
        debug!(node = self.processor.id, "worker exiting");
    }

    fn deliver(&mut self, envelope: Envelope) -> HandlerResult {
        if self.processor.killed {
            return HandlerResult::Rejected(ConsensusError::Stopped);
        }
        if let Err(err) = self.authenticate(&envelope) {
            warn!(node = self.processor.id, sender = envelope.sender, %err, "rejecting envelope");
            return HandlerResult::Rejected(err);
        }

        let result = self.processor.handle_message(envelope.sender, envelope.message);
        if let Err(err) = &result {
            debug!(node = self.processor.id, sender = envelope.sender, %err, "message rejected");
        }
        result.map(|step| self.dispatch(step)).into()
    }

    fn authenticate(&self, envelope: &Envelope) -> Result<(), ConsensusError> {
        let expected = self
            .peers
            .get(envelope.sender)
            .ok_or(ConsensusError::UnknownSender(envelope.sender))?;
        if *expected != envelope.sig.signer || !envelope.sig.verify(&envelope.message) {
            return Err(ConsensusError::BadSignature(envelope.sender));
        }
        Ok(())
    }

    /// Signs the step's messages and hands them to a send task, so a slow
    /// peer never holds up the worker.
    fn dispatch(&self, step: Step) {
        if step.is_empty() || self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let id = self.processor.id;
        let batch: Vec<(Vec<NodeId>, Envelope)> = step
            .outbound
            .into_iter()
            .map(|outbound| {
                let recipients = match outbound.to {
                    Recipient::Peers => self.peers.others(id).collect(),
                    Recipient::Node(peer) => vec![peer],
                };
                let envelope = Envelope {
                    sender: id,
                    message: outbound.message,
                    sig: self.keypair.sign(&outbound.message),
                };
                (recipients, envelope)
            })
            .collect();

        let transport = Arc::clone(&self.transport);
        let stopped = Arc::clone(&self.stopped);
        tokio::spawn(async move {
            for (recipients, envelope) in batch {
                for to in recipients {
                    if stopped.load(Ordering::SeqCst) {
                        debug!(node = id, "stopped, dropping remaining sends");
                        return;
                    }
                    if let Err(err) = transport.send(to, envelope.clone()).await {
                        warn!(node = id, to, %err, "send failed");
                    }
                }
            }
        });
    }
}

impl NodeHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Waits for the network to be ready, then starts the protocol.
    pub async fn start(&self) -> Result<(), ConsensusError> {
        while !self.readiness.is_network_ready() {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(ConsensusError::Stopped);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        info!(node = self.id, "network ready");

        let (reply, rx) = oneshot::channel();
        self.command(Command::Start(reply))?;
        rx.await.map_err(|_| ConsensusError::WorkerUnavailable)?
    }

    pub async fn stop(&self) -> Result<(), ConsensusError> {
        self.stopped.store(true, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.command(Command::Stop(reply))?;
        rx.await.map_err(|_| ConsensusError::WorkerUnavailable)
    }

    /// Delivers an envelope and waits for the verdict.
    pub async fn on_message(&self, envelope: Envelope) -> HandlerResult {
        let (reply, rx) = oneshot::channel();
        let command = Command::Deliver {
            envelope,
            reply: Some(reply),
        };
        if let Err(err) = self.command(command) {
            return HandlerResult::Rejected(err);
        }
        rx.await
            .unwrap_or(HandlerResult::Rejected(ConsensusError::WorkerUnavailable))
    }

    /// Queues an envelope without waiting for it to be handled.
    pub fn post(&self, envelope: Envelope) -> Result<(), ConsensusError> {
        self.command(Command::Deliver {
            envelope,
            reply: None,
        })
    }

    pub async fn state(&self) -> Result<NodeStateSnapshot, ConsensusError> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::State(reply))?;
        rx.await.map_err(|_| ConsensusError::WorkerUnavailable)
    }

    /// A node whose worker is gone reports as faulty.
    pub async fn status(&self) -> NodeStatus {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Status(reply)).is_err() {
            return NodeStatus::Faulty;
        }
        rx.await.unwrap_or(NodeStatus::Faulty)
    }

    /// True once the node has decided, run out of rounds, or left the protocol.
    pub async fn is_settled(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.command(Command::Settled(reply)).is_err() {
            return true;
        }
        rx.await.unwrap_or(true)
    }

    fn command(&self, command: Command) -> Result<(), ConsensusError> {
        self.cmd_tx
            .send(command)
            .map_err(|_| ConsensusError::WorkerUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::consensus::{ConsensusConfig, Message, TransportError, Value};

    /// Records every envelope instead of delivering it.
    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(NodeId, Envelope)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, to: NodeId, envelope: Envelope) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((to, envelope));
            if to == 3 {
                return Err(TransportError::Unreachable(to));
            }
            Ok(())
        }
    }

    /// Holds every send until the gate opens, then records it.
    #[derive(Default)]
    struct GatedTransport {
        gate: tokio::sync::Notify,
        sent: Mutex<Vec<NodeId>>,
    }

    #[async_trait]
    impl Transport for GatedTransport {
        async fn send(&self, to: NodeId, _envelope: Envelope) -> Result<(), TransportError> {
            self.gate.notified().await;
            self.sent.lock().unwrap().push(to);
            Ok(())
        }
    }

    fn keypairs(n: usize) -> Vec<Keypair> {
        (0..n).map(|i| Keypair::from_seed([i as u8 + 1; 32])).collect()
    }

    fn spawn_node(faulty: bool, transport: Arc<RecordingTransport>) -> (NodeHandle, Vec<Keypair>) {
        let keys = keypairs(4);
        let peers = Peers::new(keys.iter().map(|key| key.pubkey()).collect());
        let processor = ConsensusProcessor::new(0, ConsensusConfig::new(4, 1), Value::One, faulty);
        let handle = Node::spawn(
            processor,
            Keypair::from_seed([1; 32]),
            peers,
            transport,
            Arc::new(|| true),
        );
        (handle, keys)
    }

    fn envelope(keys: &[Keypair], sender: NodeId, message: Message) -> Envelope {
        Envelope {
            sender,
            message,
            sig: keys[sender].sign(&message),
        }
    }

    #[tokio::test]
    async fn test_start_broadcasts_signed_proposal() {
        let transport = Arc::new(RecordingTransport::default());
        let (handle, keys) = spawn_node(false, Arc::clone(&transport));

        handle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = transport.sent.lock().unwrap().clone();
        let recipients: Vec<_> = sent.iter().map(|(to, _)| *to).collect();
        // The failed send to node 3 is logged, not fatal.
        assert_eq!(recipients, vec![1, 2, 3]);
        for (_, envelope) in sent {
            assert_eq!(envelope.message, Message::propose(1, Value::One));
            assert_eq!(envelope.sig.signer, keys[0].pubkey());
            assert!(envelope.sig.verify(&envelope.message));
        }
        assert_eq!(handle.state().await.unwrap().round, Some(1));
    }

    #[tokio::test]
    async fn test_rejects_forged_sender() {
        let transport = Arc::new(RecordingTransport::default());
        let (handle, keys) = spawn_node(false, transport);
        handle.start().await.unwrap();

        let message = Message::propose(1, Value::Zero);
        let forged = Envelope {
            sender: 1,
            message,
            sig: keys[2].sign(&message),
        };
        assert_eq!(
            handle.on_message(forged).await,
            HandlerResult::Rejected(ConsensusError::BadSignature(1))
        );

        let genuine = envelope(&keys, 1, message);
        assert_eq!(handle.on_message(genuine).await, HandlerResult::Accepted);
        assert_eq!(handle.state().await.unwrap().messages_received, Some(1));
    }

    #[tokio::test]
    async fn test_stop_rejects_and_reports_faulty() {
        let transport = Arc::new(RecordingTransport::default());
        let (handle, keys) = spawn_node(false, transport);
        handle.start().await.unwrap();

        handle.stop().await.unwrap();

        let result = handle.on_message(envelope(&keys, 1, Message::propose(1, Value::One))).await;
        assert_eq!(result, HandlerResult::Rejected(ConsensusError::Stopped));
        assert_eq!(handle.start().await, Err(ConsensusError::Stopped));
        assert_eq!(handle.status().await, NodeStatus::Faulty);

        let state = handle.state().await.unwrap();
        assert_eq!(state.value, None);
        assert_eq!(state.round, None);
        assert_eq!(state.decided, None);
    }

    #[tokio::test]
    async fn test_stop_silences_outbound() {
        let transport = Arc::new(RecordingTransport::default());
        let (handle, keys) = spawn_node(false, Arc::clone(&transport));
        handle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.sent.lock().unwrap().clear();

        handle.stop().await.unwrap();

        // Enough proposals to cross the quorum, had the node still been live.
        handle.post(envelope(&keys, 1, Message::propose(1, Value::One))).unwrap();
        let result = handle.on_message(envelope(&keys, 2, Message::propose(1, Value::One))).await;
        assert_eq!(result, HandlerResult::Rejected(ConsensusError::Stopped));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(transport.sent.lock().unwrap().is_empty());
        assert_eq!(handle.status().await, NodeStatus::Faulty);
    }

    #[tokio::test]
    async fn test_stop_cuts_off_sends_in_flight() {
        let transport = Arc::new(GatedTransport::default());
        let keys = keypairs(4);
        let peers = Peers::new(keys.iter().map(|key| key.pubkey()).collect());
        let processor = ConsensusProcessor::new(0, ConsensusConfig::new(4, 1), Value::One, false);
        let handle = Node::spawn(
            processor,
            Keypair::from_seed([1; 32]),
            peers,
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::new(|| true),
        );

        // The proposal broadcast is parked on its first send.
        handle.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await.unwrap();
        transport.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*transport.sent.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn test_faulty_node() {
        let transport = Arc::new(RecordingTransport::default());
        let (handle, keys) = spawn_node(true, Arc::clone(&transport));

        assert_eq!(handle.start().await, Err(ConsensusError::Faulty));
        assert_eq!(handle.status().await, NodeStatus::Faulty);
        let result = handle.on_message(envelope(&keys, 1, Message::propose(1, Value::One))).await;
        assert_eq!(result, HandlerResult::Rejected(ConsensusError::Faulty));
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_waits_for_readiness() {
        let ready = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ready);
        let processor = ConsensusProcessor::new(0, ConsensusConfig::new(1, 0), Value::Zero, false);
        let keypair = Keypair::from_seed([1; 32]);
        let peers = Peers::new(vec![keypair.pubkey()]);
        let handle = Node::spawn(
            processor,
            keypair,
            peers,
            Arc::new(RecordingTransport::default()),
            Arc::new(move || flag.load(Ordering::SeqCst)),
        );

        let starter = handle.clone();
        let start = tokio::spawn(async move { starter.start().await });
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(handle.state().await.unwrap().round, Some(0));

        ready.store(true, Ordering::SeqCst);
        start.await.unwrap().unwrap();

        let state = handle.state().await.unwrap();
        assert_eq!(state.decided, Some(true));
        assert_eq!(state.value, Some(Value::Zero));
    }
}
