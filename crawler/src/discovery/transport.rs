//! UDP transport for the discovery protocol.
//!
//! One socket per transport. A background task reads every packet,
//! authenticates it, answers PING, FINDNODE and ENRREQUEST from other nodes,
//! and hands replies to the request waiting for them. Replies are matched on
//! the sender socket address and packet type, plus the echoed hash for PONG
//! and ENRRESPONSE. A reply from the expected address signed by another key
//! fails the request with [`DiscoveryError::InvalidSignature`].

use async_trait::async_trait;
use discmap_common::crypto::{Hash, Secp256k1PublicKey};
use discmap_common::time::get_current_time_in_seconds;
use log::{debug, info, trace};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};

use super::config::DiscoveryConfig;
use super::error::{DiscoveryError, DiscoveryResult, ErrorKind};
use super::identity::{LocalNode, NodeId, NodeIdentity};
use super::lookup::DiscoveryRpc;
use super::messages::{
    message_type, EnrRequest, EnrResponse, Endpoint, FindNode, Message, Neighbors, Ping, Pong,
    SignedPacket, MAX_PACKET_SIZE,
};
use super::node::Node;
use super::node_db::NodeDb;
use super::record::NodeRecord;

/// How long a PING from a node keeps it bonded, in seconds.
pub const BOND_EXPIRATION: u64 = 12 * 60 * 60;

/// Failed FINDNODE exchanges after which a bonded node is pinged again.
pub const MAX_FIND_NODE_FAILURES: u64 = 5;

type Reply = DiscoveryResult<Message>;

/// A request waiting for packets.
struct PendingReply {
    node_id: NodeId,
    addr: SocketAddr,
    packet_type: u8,
    /// Hash the reply must echo, for PONG and ENRRESPONSE.
    reply_to: Option<Hash>,
    sender: UnboundedSender<Reply>,
}

impl PendingReply {
    fn matches(&self, from: SocketAddr, packet_type: u8, echoed: Option<Hash>) -> bool {
        if self.addr != from || self.packet_type != packet_type {
            return false;
        }
        match (self.reply_to, echoed) {
            (Some(expected), Some(echoed)) => expected == echoed,
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

struct Shared {
    socket: UdpSocket,
    local: LocalNode,
    node_db: Arc<NodeDb>,
    query_timeout: Duration,
    bucket_size: usize,
    pending: Mutex<HashMap<u64, PendingReply>>,
    next_request: AtomicU64,
}

/// Removes a pending reply when the request ends, however it ends.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.shared.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.remove(&self.id);
    }
}

impl Shared {
    fn register(
        &self,
        node_id: NodeId,
        addr: SocketAddr,
        packet_type: u8,
        reply_to: Option<Hash>,
    ) -> (PendingGuard<'_>, UnboundedReceiver<Reply>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let reply = PendingReply {
            node_id,
            addr,
            packet_type,
            reply_to,
            sender,
        };
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, reply);

        (PendingGuard { shared: self, id }, receiver)
    }

    async fn send_raw(&self, packet: &[u8], to: SocketAddr) -> DiscoveryResult<()> {
        self.socket.send_to(packet, to).await?;
        Ok(())
    }

    async fn send(&self, message: Message, to: SocketAddr) -> DiscoveryResult<Hash> {
        let (packet, hash) = SignedPacket::encode(self.local.identity(), &message)?;
        self.send_raw(&packet, to).await?;
        Ok(hash)
    }

    async fn wait_reply(
        &self,
        receiver: &mut UnboundedReceiver<Reply>,
        node_id: &NodeId,
    ) -> DiscoveryResult<Message> {
        match timeout(self.query_timeout, receiver.recv()).await {
            Ok(Some(reply)) => reply,
            Ok(None) => Err(DiscoveryError::Closed),
            Err(_) => Err(DiscoveryError::Timeout(node_id.to_hex())),
        }
    }

    // Hand a packet to every request waiting for it
    fn deliver(&self, packet: &SignedPacket, from: SocketAddr) -> bool {
        let packet_type = packet.message.message_type();
        let echoed = match &packet.message {
            Message::Pong(pong) => Some(pong.ping_hash),
            Message::EnrResponse(response) => Some(response.request_hash),
            _ => None,
        };
        let sender_id = packet.sender_id();

        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut delivered = false;
        for reply in pending.values() {
            if !reply.matches(from, packet_type, echoed) {
                continue;
            }

            let message = if reply.node_id == sender_id {
                Ok(packet.message.clone())
            } else {
                Err(DiscoveryError::InvalidSignature)
            };
            delivered |= reply.sender.send(message).is_ok();
        }
        delivered
    }

    // A packet from a waited-for address whose signature does not hold
    fn fail_pending(&self, from: SocketAddr, packet_type: u8) {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for reply in pending.values() {
            if reply.addr == from && reply.packet_type == packet_type {
                let _ = reply.sender.send(Err(DiscoveryError::InvalidSignature));
            }
        }
    }

    async fn handle_packet(&self, data: &[u8], from: SocketAddr) -> DiscoveryResult<()> {
        let packet = match SignedPacket::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                if e.kind() == ErrorKind::Validation {
                    if let Some(packet_type) = SignedPacket::peek_type(data) {
                        self.fail_pending(from, packet_type);
                    }
                }
                return Err(e);
            }
        };

        if packet.message.is_expired() {
            return Err(DiscoveryError::MessageExpired(
                packet.message.expiration().unwrap_or(0),
                get_current_time_in_seconds(),
            ));
        }

        let sender_id = packet.sender_id();
        match &packet.message {
            Message::Ping(ping) => {
                if log::log_enabled!(log::Level::Trace) {
                    trace!("Received PING from {} ({})", from, sender_id);
                }
                let pong = Pong::new(
                    Endpoint::from_socket(from, ping.from.tcp),
                    packet.hash,
                    self.local.seq(),
                );
                self.send(Message::Pong(pong), from).await?;
                self.node_db.update_last_ping_received(
                    self.local.node_id(),
                    &sender_id,
                    get_current_time_in_seconds(),
                )?;
            }
            Message::FindNode(_) => {
                // Nothing to share, but the requester still gets an answer
                for reply in Neighbors::split(Vec::new()) {
                    self.send(Message::Neighbors(reply), from).await?;
                }
            }
            Message::EnrRequest(_) => {
                let response = EnrResponse::new(packet.hash, self.local.record());
                self.send(Message::EnrResponse(response), from).await?;
            }
            Message::Pong(_) | Message::Neighbors(_) | Message::EnrResponse(_) => {}
        }

        if !self.deliver(&packet, from) && log::log_enabled!(log::Level::Trace) {
            trace!(
                "Unsolicited packet type {} from {}",
                packet.message.message_type(),
                from
            );
        }
        Ok(())
    }

    async fn ping(&self, node_id: &NodeId, addr: SocketAddr) -> DiscoveryResult<Pong> {
        let ping = Ping::new(
            Endpoint::from_socket(self.local.endpoint(), 0),
            Endpoint::from_socket(addr, 0),
            self.local.seq(),
        );
        let (packet, hash) = SignedPacket::encode(self.local.identity(), &Message::Ping(ping))?;

        let (_guard, mut replies) = self.register(*node_id, addr, message_type::PONG, Some(hash));
        self.send_raw(&packet, addr).await?;

        match self.wait_reply(&mut replies, node_id).await? {
            Message::Pong(pong) => {
                self.node_db.update_last_pong_received(
                    self.local.node_id(),
                    node_id,
                    get_current_time_in_seconds(),
                )?;
                Ok(pong)
            }
            other => Err(DiscoveryError::InvalidMessageType(other.message_type())),
        }
    }

    /// Make sure the node will answer our requests.
    ///
    /// A node answers FINDNODE only after we answered its PING. When it has
    /// not pinged us recently, ping it and give it one reply timeout to
    /// ping back.
    async fn ensure_bond(&self, node_id: &NodeId, addr: SocketAddr) -> DiscoveryResult<()> {
        let local_id = self.local.node_id();
        if self.node_db.is_bonded(local_id, node_id, BOND_EXPIRATION)?
            && self.node_db.find_fails(local_id, node_id)? <= MAX_FIND_NODE_FAILURES
        {
            return Ok(());
        }

        let (_guard, mut pings) = self.register(*node_id, addr, message_type::PING, None);
        self.ping(node_id, addr).await?;

        match timeout(self.query_timeout, pings.recv()).await {
            Ok(Some(Err(e))) => Err(e),
            Ok(_) => Ok(()),
            Err(_) => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("{} answered our PING but did not ping back", addr);
                }
                Ok(())
            }
        }
    }

    async fn find_node(
        &self,
        peer: &Node,
        target: &Secp256k1PublicKey,
    ) -> DiscoveryResult<Vec<Node>> {
        let node_id = *peer.id();
        let addr = peer.udp_endpoint()?;
        self.ensure_bond(&node_id, addr).await?;

        let (packet, _) =
            SignedPacket::encode(self.local.identity(), &Message::FindNode(FindNode::new(target)))?;
        let (_guard, mut replies) = self.register(node_id, addr, message_type::NEIGHBORS, None);
        self.send_raw(&packet, addr).await?;

        // NEIGHBORS may span several packets, collect until the deadline
        let deadline = Instant::now() + self.query_timeout;
        let mut nodes = Vec::new();
        let mut received = false;
        while nodes.len() < self.bucket_size {
            match timeout_at(deadline, replies.recv()).await {
                Ok(Some(Ok(Message::Neighbors(neighbors)))) => {
                    received = true;
                    for entry in &neighbors.nodes {
                        match entry.to_node() {
                            Ok(node) => nodes.push(node),
                            Err(e) => trace!("Skipping neighbor from {}: {}", addr, e),
                        }
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => return Err(e),
                Ok(None) => return Err(DiscoveryError::Closed),
                Err(_) => break,
            }
        }

        let local_id = self.local.node_id();
        if !received {
            let fails = self.node_db.find_fails(local_id, &node_id)? + 1;
            self.node_db.update_find_fails(local_id, &node_id, fails)?;
            return Err(DiscoveryError::Timeout(node_id.to_hex()));
        }

        self.node_db.update_find_fails(local_id, &node_id, 0)?;
        Ok(nodes)
    }

    async fn request_record(&self, peer: &Node) -> DiscoveryResult<NodeRecord> {
        let node_id = *peer.id();
        let addr = peer.udp_endpoint()?;
        self.ensure_bond(&node_id, addr).await?;

        let (packet, hash) =
            SignedPacket::encode(self.local.identity(), &Message::EnrRequest(EnrRequest::new()))?;
        let (_guard, mut replies) =
            self.register(node_id, addr, message_type::ENR_RESPONSE, Some(hash));
        self.send_raw(&packet, addr).await?;

        let response = match self.wait_reply(&mut replies, &node_id).await? {
            Message::EnrResponse(response) => response,
            other => return Err(DiscoveryError::InvalidMessageType(other.message_type())),
        };

        let record = response.record()?;
        let record_id = record.node_id()?;
        if record_id != node_id {
            return Err(DiscoveryError::InvalidNodeId(
                node_id.to_hex(),
                record_id.to_hex(),
            ));
        }
        Ok(record)
    }
}

async fn receive_loop(shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        match shared.socket.recv_from(&mut buf).await {
            Ok((len, from)) => {
                if log::log_enabled!(log::Level::Trace) {
                    trace!("Received {} bytes from {}", len, from);
                }
                if let Err(e) = shared.handle_packet(&buf[..len], from).await {
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("Error handling packet from {}: {}", from, e);
                    }
                }
            }
            Err(e) => {
                if log::log_enabled!(log::Level::Debug) {
                    debug!("Error receiving packet: {}", e);
                }
            }
        }
    }
}

/// A discovery endpoint bound to one UDP socket.
pub struct UdpTransport {
    shared: Arc<Shared>,
    receiver: JoinHandle<()>,
}

impl UdpTransport {
    /// Bind the socket, sign the local record and start reading packets.
    pub async fn open(
        config: &DiscoveryConfig,
        identity: NodeIdentity,
        node_db: Arc<NodeDb>,
    ) -> DiscoveryResult<Self> {
        let external = config.external_address()?;
        let bind_address = config.get_bind_address();
        let socket = UdpSocket::bind(&bind_address)
            .await
            .map_err(|e| DiscoveryError::BindFailed(bind_address.clone(), e))?;
        let bound = socket.local_addr()?;

        let seq = node_db.next_local_seq(identity.node_id())?;
        let local = LocalNode::new(identity, bound, external, seq)?;

        if log::log_enabled!(log::Level::Info) {
            info!(
                "Discovery transport listening on {} (node_id: {}, advertised: {})",
                bound,
                local.node_id(),
                local.endpoint()
            );
        }

        let shared = Arc::new(Shared {
            socket,
            local,
            node_db,
            query_timeout: config.query_timeout(),
            bucket_size: config.bucket_size.max(1),
            pending: Mutex::new(HashMap::new()),
            next_request: AtomicU64::new(0),
        });
        let receiver = tokio::spawn(receive_loop(Arc::clone(&shared)));

        Ok(Self { shared, receiver })
    }

    pub fn local_node(&self) -> &LocalNode {
        &self.shared.local
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> DiscoveryResult<SocketAddr> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Ping a node, returning its PONG.
    pub async fn ping(&self, node: &Node) -> DiscoveryResult<Pong> {
        self.shared.ping(node.id(), node.udp_endpoint()?).await
    }

    /// Stop reading packets and release the socket.
    pub async fn close(mut self) {
        self.receiver.abort();
        // Wait for the receive task to drop its handle on the socket
        let _ = (&mut self.receiver).await;
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.receiver.abort();
        // Wake every waiter with a closed channel
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl DiscoveryRpc for UdpTransport {
    fn local_id(&self) -> NodeId {
        *self.shared.local.node_id()
    }

    async fn find_node(
        &self,
        peer: &Node,
        target: &Secp256k1PublicKey,
    ) -> DiscoveryResult<Vec<Node>> {
        self.shared.find_node(peer, target).await
    }

    async fn request_record(&self, peer: &Node) -> DiscoveryResult<NodeRecord> {
        self.shared.request_record(peer).await
    }
}
