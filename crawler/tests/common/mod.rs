// Common test utilities: a simulated discovery overlay
//
// Nodes answer FINDNODE from what they know, never touching a socket.
// Each node behaves honestly, stays silent or answers with a bad signature.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use discmap_common::crypto::{Secp256k1KeyPair, Secp256k1PublicKey};
use discmap_crawler::discovery::identity::compare_distance;
use discmap_crawler::discovery::{
    DiscoveryError, DiscoveryResult, DiscoveryRpc, Node, NodeId, NodeIdentity, NodeRecord,
    RecordBuilder,
};
use discmap_crawler::registry::SessionFactory;

pub const SIM_BUCKET_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Honest,
    Silent,
    BadSignature,
}

pub struct SimNode {
    pub keypair: Secp256k1KeyPair,
    pub node: Node,
    pub behavior: Behavior,
    /// Ids this node reports from. `None` means the whole network.
    pub known: Option<Vec<NodeId>>,
}

#[derive(Default)]
pub struct SimNetwork {
    nodes: HashMap<NodeId, SimNode>,
}

pub fn signed_node(keypair: &Secp256k1KeyPair, seq: u64, index: usize) -> Node {
    let ip = IpAddr::from([10, (index >> 16) as u8, (index >> 8) as u8, index as u8]);
    let record = RecordBuilder::new()
        .seq(seq)
        .ip(ip)
        .udp(30303)
        .tcp(30303)
        .build(keypair)
        .unwrap();
    Node::from_record(record).unwrap()
}

/// A node outside any network, usable as a lookup target.
pub fn random_target() -> Node {
    signed_node(&Secp256k1KeyPair::generate(), 1, 0)
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, behavior: Behavior) -> Node {
        self.add_with_keypair(Secp256k1KeyPair::generate(), 1, behavior)
    }

    pub fn add_many(&mut self, count: usize, behavior: Behavior) -> Vec<Node> {
        (0..count).map(|_| self.add(behavior)).collect()
    }

    pub fn add_with_keypair(
        &mut self,
        keypair: Secp256k1KeyPair,
        seq: u64,
        behavior: Behavior,
    ) -> Node {
        let node = signed_node(&keypair, seq, self.nodes.len() + 1);
        self.nodes.insert(
            *node.id(),
            SimNode {
                keypair,
                node: node.clone(),
                behavior,
                known: None,
            },
        );
        node
    }

    pub fn set_known(&mut self, id: &NodeId, known: Vec<NodeId>) {
        if let Some(sim) = self.nodes.get_mut(id) {
            sim.known = Some(known);
        }
    }

    /// Give every node only its own closest neighbors, like a routing table.
    pub fn limit_knowledge(&mut self, per_node: usize) {
        let ids: Vec<NodeId> = self.nodes.keys().copied().collect();
        for id in &ids {
            let mut known: Vec<NodeId> = ids.iter().filter(|other| *other != id).copied().collect();
            known.sort_by(|a, b| compare_distance(id, a, b));
            known.truncate(per_node);
            self.set_known(id, known);
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&SimNode> {
        self.nodes.get(id)
    }

    pub fn behavior(&self, id: &NodeId) -> Option<Behavior> {
        self.nodes.get(id).map(|sim| sim.behavior)
    }

    /// Network ids matching `filter`, closest to `target` first.
    pub fn closest<F>(&self, target: &NodeId, filter: F) -> Vec<NodeId>
    where
        F: Fn(&SimNode) -> bool,
    {
        let mut ids: Vec<NodeId> = self
            .nodes
            .iter()
            .filter(|(_, sim)| filter(sim))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_by(|a, b| compare_distance(target, a, b));
        ids
    }

    // A node never lists itself
    fn answer(&self, sim: &SimNode, target: &NodeId) -> Vec<Node> {
        let mut ids: Vec<NodeId> = match &sim.known {
            Some(known) => known.clone(),
            None => self.nodes.keys().copied().collect(),
        };
        ids.retain(|id| id != sim.node.id());
        ids.sort_by(|a, b| compare_distance(target, a, b));
        ids.iter()
            .take(SIM_BUCKET_SIZE)
            .filter_map(|id| self.nodes.get(id))
            .map(|sim| sim.node.clone())
            .collect()
    }
}

/// One client of the simulated network.
pub struct SimSession {
    network: Arc<SimNetwork>,
    local: NodeId,
    queries: Arc<AtomicUsize>,
}

impl SimSession {
    pub fn new(network: Arc<SimNetwork>) -> Self {
        Self {
            network,
            local: *NodeIdentity::generate().node_id(),
            queries: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn responder(&self, peer: &Node) -> DiscoveryResult<&SimNode> {
        let sim = self
            .network
            .get(peer.id())
            .ok_or_else(|| DiscoveryError::Timeout(peer.id().to_hex()))?;
        match sim.behavior {
            Behavior::Honest => Ok(sim),
            Behavior::Silent => Err(DiscoveryError::Timeout(peer.id().to_hex())),
            Behavior::BadSignature => Err(DiscoveryError::InvalidSignature),
        }
    }
}

#[async_trait]
impl DiscoveryRpc for SimSession {
    fn local_id(&self) -> NodeId {
        self.local
    }

    async fn find_node(
        &self,
        peer: &Node,
        target: &Secp256k1PublicKey,
    ) -> DiscoveryResult<Vec<Node>> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        let sim = self.responder(peer)?;
        Ok(self.network.answer(sim, &target.node_id()))
    }

    async fn request_record(&self, peer: &Node) -> DiscoveryResult<NodeRecord> {
        let sim = self.responder(peer)?;
        sim.node
            .record()
            .cloned()
            .ok_or_else(|| DiscoveryError::Timeout(peer.id().to_hex()))
    }
}

/// Hands out sessions on a shared simulated network.
pub struct SimFactory {
    pub network: Arc<SimNetwork>,
    pub opened: AtomicUsize,
    pub unavailable: bool,
}

impl SimFactory {
    pub fn new(network: SimNetwork) -> Self {
        Self {
            network: Arc::new(network),
            opened: AtomicUsize::new(0),
            unavailable: false,
        }
    }
}

#[async_trait]
impl SessionFactory for SimFactory {
    type Session = SimSession;

    async fn open_session(&self) -> DiscoveryResult<SimSession> {
        if self.unavailable {
            return Err(DiscoveryError::BindFailed(
                "127.0.0.1:0".to_string(),
                std::io::Error::new(std::io::ErrorKind::AddrInUse, "no socket"),
            ));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(SimSession::new(Arc::clone(&self.network)))
    }
}

pub fn ids(nodes: &[Node]) -> Vec<NodeId> {
    nodes.iter().map(|n| *n.id()).collect()
}

pub fn sorted_ids(nodes: &[Node]) -> Vec<NodeId> {
    let mut ids = ids(nodes);
    ids.sort();
    ids
}
