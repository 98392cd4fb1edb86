//! Shared fixtures: a simulated network of DHT nodes over the in-process
//! transport, all reading one manual clock.

#![allow(dead_code)]

use std::sync::Arc;

use kadroute::memory::{MemoryNetwork, MemoryRegistry};
use kadroute::{DhtConfig, DhtNode, Keypair, ManualClock, PeerRecord, Timestamp};

pub type MemNode = DhtNode<MemoryNetwork>;

/// Clock start for every simulation.
pub const START: Timestamp = Timestamp::from_millis(1_000_000);

pub struct TestNet {
    pub registry: Arc<MemoryRegistry>,
    pub clock: Arc<ManualClock>,
    pub config: DhtConfig,
    pub nodes: Vec<MemNode>,
}

impl TestNet {
    pub fn new(config: DhtConfig) -> Self {
        Self {
            registry: MemoryRegistry::new(),
            clock: Arc::new(ManualClock::new(START)),
            config,
            nodes: Vec::new(),
        }
    }

    /// `count` registered nodes that know nobody yet.
    pub async fn with_nodes(count: usize) -> Self {
        let mut net = Self::new(DhtConfig::default());
        for _ in 0..count {
            net.spawn().await;
        }
        net
    }

    /// Register one more node and return its index.
    pub async fn spawn(&mut self) -> usize {
        let keypair = Keypair::generate();
        self.spawn_with(keypair).await
    }

    pub async fn spawn_with(&mut self, keypair: Keypair) -> usize {
        let idx = self.nodes.len();
        let local = PeerRecord::new(keypair.peer_id(), vec![format!("mem:{idx}")]);
        let network = Arc::new(MemoryNetwork::new(Arc::clone(&self.registry), local.clone()));
        let node = DhtNode::new(local, network, self.config.clone(), self.clock.clone());
        self.registry.register(node.peer_id(), Arc::new(node.clone())).await;
        self.nodes.push(node);
        idx
    }

    /// `from` learns about `to`.
    pub async fn link(&self, from: usize, to: usize) {
        let record = self.nodes[to].local_record();
        self.nodes[from].routing().observe(record).await;
    }

    /// Each node knows only its successor.
    pub async fn chain(&self) {
        for i in 0..self.nodes.len().saturating_sub(1) {
            self.link(i, i + 1).await;
        }
    }

    /// Every node knows every other node.
    pub async fn mesh(&self) {
        for i in 0..self.nodes.len() {
            for j in 0..self.nodes.len() {
                if i != j {
                    self.link(i, j).await;
                }
            }
        }
    }

    pub fn network(&self, idx: usize) -> &Arc<MemoryNetwork> {
        self.nodes[idx].lookup().network()
    }
}
