//! Bounded candidate set for a single lookup.
//!
//! Holds at most `capacity` nodes ordered by XOR distance to the lookup
//! target. The target itself and the local node are never admitted. Every
//! id ever queried is remembered, so a node evicted by closer candidates and
//! offered again keeps its state instead of being queried twice.

use std::collections::HashMap;

use super::identity::{compare_distance, xor_distance, NodeId};
use super::node::Node;

/// Default number of nodes kept (Kademlia k parameter).
pub const DEFAULT_BUCKET_SIZE: usize = 16;

/// Query state of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateState {
    /// Known, not asked yet.
    Pending,
    /// FINDNODE in flight.
    Queried,
    /// Answered with a correctly signed reply.
    Responded,
    /// Gave up on it (timeouts or bad signature).
    Failed,
}

/// Entry of the candidate set.
#[derive(Debug, Clone)]
pub struct CandidateEntry {
    pub node: Node,
    pub state: CandidateState,
}

/// Result of offering a node to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// Node was inserted.
    Inserted,
    /// Node was present and replaced by a record with a higher sequence.
    Updated,
    /// Node was present, nothing changed.
    Unchanged,
    /// Set is full of closer nodes.
    TooFar,
    /// Target or local node.
    Excluded,
    /// Node already failed during this lookup.
    Failed,
    /// Same id announced with another public key.
    Conflict,
}

#[derive(Debug)]
pub struct CandidateSet {
    target: NodeId,
    local_id: NodeId,
    capacity: usize,
    /// Sorted by distance to target, closest first.
    entries: Vec<CandidateEntry>,
    /// State of every node that left `Pending`.
    history: HashMap<NodeId, CandidateState>,
}

impl CandidateSet {
    pub fn new(target: NodeId, local_id: NodeId, capacity: usize) -> Self {
        Self {
            target,
            local_id,
            capacity: capacity.max(1),
            entries: Vec::with_capacity(capacity),
            history: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find_index(&self, node_id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.node.id() == node_id)
    }

    pub fn get(&self, node_id: &NodeId) -> Option<&CandidateEntry> {
        self.entries.iter().find(|e| e.node.id() == node_id)
    }

    /// Offer a node to the set.
    ///
    /// Admitted when the set has room or the node is closer than the worst
    /// retained entry, which is then evicted.
    pub fn insert(&mut self, node: Node) -> InsertResult {
        let id = *node.id();
        if id == self.target || id == self.local_id {
            return InsertResult::Excluded;
        }

        if let Some(index) = self.find_index(&id) {
            let existing = &mut self.entries[index];
            if existing.node.public_key() != node.public_key() {
                return InsertResult::Conflict;
            }
            if node.seq() > existing.node.seq() {
                existing.node = node;
                return InsertResult::Updated;
            }
            return InsertResult::Unchanged;
        }

        let state = match self.history.get(&id) {
            Some(CandidateState::Failed) => return InsertResult::Failed,
            Some(state) => *state,
            None => CandidateState::Pending,
        };

        let position = self
            .entries
            .partition_point(|e| compare_distance(&self.target, e.node.id(), &id).is_lt());
        if position >= self.capacity {
            return InsertResult::TooFar;
        }

        self.entries.insert(position, CandidateEntry { node, state });
        self.entries.truncate(self.capacity);
        InsertResult::Inserted
    }

    /// Distance of the closest retained candidate.
    pub fn closest_distance(&self) -> Option<[u8; 32]> {
        self.entries
            .first()
            .map(|e| xor_distance(&self.target, e.node.id()))
    }

    /// Take up to `limit` pending candidates, closest first, marking them queried.
    pub fn next_to_query(&mut self, limit: usize) -> Vec<Node> {
        let mut batch = Vec::new();
        for entry in self
            .entries
            .iter_mut()
            .filter(|e| e.state == CandidateState::Pending)
            .take(limit)
        {
            entry.state = CandidateState::Queried;
            self.history.insert(*entry.node.id(), CandidateState::Queried);
            batch.push(entry.node.clone());
        }
        batch
    }

    pub fn has_pending(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.state == CandidateState::Pending)
    }

    fn set_state(&mut self, node_id: &NodeId, state: CandidateState) {
        self.history.insert(*node_id, state);
        if let Some(index) = self.find_index(node_id) {
            self.entries[index].state = state;
        }
    }

    /// Record a correctly signed reply. Nodes not in the set yet (such as
    /// the bootstrap node) are offered first.
    pub fn mark_responded(&mut self, node: &Node) {
        self.set_state(node.id(), CandidateState::Responded);
        if self.find_index(node.id()).is_none() {
            self.insert(node.clone());
        }
    }

    /// Drop a node that failed, freeing its slot.
    pub fn mark_failed(&mut self, node_id: &NodeId) {
        self.history.insert(*node_id, CandidateState::Failed);
        if let Some(index) = self.find_index(node_id) {
            self.entries.remove(index);
        }
    }

    /// Nodes that answered, closest first.
    pub fn responded(&self) -> Vec<Node> {
        self.entries
            .iter()
            .filter(|e| e.state == CandidateState::Responded)
            .map(|e| e.node.clone())
            .collect()
    }

    /// All retained nodes, closest first.
    pub fn nodes(&self) -> Vec<Node> {
        self.entries.iter().map(|e| e.node.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::identity::NodeIdentity;
    use crate::discovery::record::RecordBuilder;
    use discmap_common::crypto::Secp256k1KeyPair;
    use std::net::IpAddr;

    fn random_node() -> Node {
        let identity = NodeIdentity::generate();
        Node::new_unsigned(
            identity.public_key(),
            IpAddr::from([10, 0, 0, 1]),
            30303,
            30303,
        )
    }

    fn random_nodes(count: usize) -> Vec<Node> {
        (0..count).map(|_| random_node()).collect()
    }

    fn sorted_by_distance(target: &NodeId, mut nodes: Vec<Node>) -> Vec<Node> {
        nodes.sort_by(|a, b| compare_distance(target, a.id(), b.id()));
        nodes
    }

    #[test]
    fn test_insert_keeps_closest() {
        let target = *NodeIdentity::generate().node_id();
        let local = *NodeIdentity::generate().node_id();
        let mut set = CandidateSet::new(target, local, 4);

        let nodes = random_nodes(20);
        for node in &nodes {
            set.insert(node.clone());
        }

        let expected: Vec<_> = sorted_by_distance(&target, nodes)
            .into_iter()
            .take(4)
            .map(|n| *n.id())
            .collect();
        let retained: Vec<_> = set.nodes().iter().map(|n| *n.id()).collect();
        assert_eq!(retained, expected);
    }

    #[test]
    fn test_excludes_target_and_local() {
        let target_node = random_node();
        let local_node = random_node();
        let mut set = CandidateSet::new(*target_node.id(), *local_node.id(), 16);

        assert_eq!(set.insert(target_node), InsertResult::Excluded);
        assert_eq!(set.insert(local_node), InsertResult::Excluded);
        assert!(set.is_empty());
    }

    #[test]
    fn test_duplicate_keeps_higher_seq() {
        let keypair = Secp256k1KeyPair::generate();
        let record = |seq| {
            let record = RecordBuilder::new()
                .seq(seq)
                .ip("10.0.0.1".parse().unwrap())
                .udp(30303)
                .build(&keypair)
                .unwrap();
            Node::from_record(record).unwrap()
        };

        let mut set = CandidateSet::new(*random_node().id(), *random_node().id(), 16);
        assert_eq!(set.insert(record(2)), InsertResult::Inserted);
        assert_eq!(set.insert(record(1)), InsertResult::Unchanged);
        assert_eq!(set.insert(record(2)), InsertResult::Unchanged);
        assert_eq!(set.insert(record(5)), InsertResult::Updated);
        assert_eq!(set.len(), 1);
        assert_eq!(set.nodes()[0].seq(), 5);
    }

    #[test]
    fn test_query_state_survives_eviction() {
        let target = *NodeIdentity::generate().node_id();
        let mut set = CandidateSet::new(target, NodeId::zero(), 1);

        let nodes = sorted_by_distance(&target, random_nodes(2));
        let (closer, farther) = (nodes[0].clone(), nodes[1].clone());

        set.insert(farther.clone());
        assert_eq!(set.next_to_query(16).len(), 1);
        set.mark_responded(&farther);

        // Evicted by a closer node, then offered again once there is room
        assert_eq!(set.insert(closer.clone()), InsertResult::Inserted);
        set.mark_failed(closer.id());
        assert_eq!(set.insert(farther.clone()), InsertResult::Inserted);
        assert_eq!(set.get(farther.id()).unwrap().state, CandidateState::Responded);
        assert!(!set.has_pending());

        assert_eq!(set.insert(closer), InsertResult::Failed);
    }

    #[test]
    fn test_next_to_query_closest_first() {
        let target = *NodeIdentity::generate().node_id();
        let mut set = CandidateSet::new(target, NodeId::zero(), 16);
        let nodes = random_nodes(10);
        for node in &nodes {
            set.insert(node.clone());
        }

        let first = set.next_to_query(3);
        let expected: Vec<_> = sorted_by_distance(&target, nodes)
            .into_iter()
            .take(3)
            .map(|n| *n.id())
            .collect();
        assert_eq!(first.iter().map(|n| *n.id()).collect::<Vec<_>>(), expected);
        assert_eq!(set.next_to_query(100).len(), 7);
        assert!(set.next_to_query(100).is_empty());
    }

    #[test]
    fn test_mark_responded_adds_unknown_node() {
        let target = *NodeIdentity::generate().node_id();
        let mut set = CandidateSet::new(target, NodeId::zero(), 16);
        let bootstrap = random_node();

        set.mark_responded(&bootstrap);
        assert_eq!(set.responded(), vec![bootstrap]);
    }

    #[test]
    fn test_closest_distance() {
        let target = *NodeIdentity::generate().node_id();
        let mut set = CandidateSet::new(target, NodeId::zero(), 16);
        assert_eq!(set.closest_distance(), None);

        let nodes = sorted_by_distance(&target, random_nodes(5));
        for node in nodes.iter().rev() {
            set.insert(node.clone());
        }
        assert_eq!(
            set.closest_distance(),
            Some(xor_distance(&target, nodes[0].id()))
        );
    }
}
