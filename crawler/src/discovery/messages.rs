//! Protocol messages for the discovery v4 wire protocol.
//!
//! Message types:
//! - PING (0x01): Liveness check, starts the bond
//! - PONG (0x02): Response to PING, echoes the ping hash
//! - FINDNODE (0x03): Request nodes close to a target public key
//! - NEIGHBORS (0x04): Response with node list
//! - ENRREQUEST (0x05): Ask for the current node record
//! - ENRRESPONSE (0x06): Response with the node record
//!
//! Every body is an rlp list. Decoders ignore list elements they do not
//! know about, so newer peers can append fields.

use discmap_common::crypto::{
    self, Hash, RecoverableSignature, Secp256k1PublicKey, HASH_SIZE,
};
use discmap_common::crypto::secp256k1::{RECOVERABLE_SIGNATURE_SIZE, SECP256K1_PUBLIC_KEY_SIZE};
use discmap_common::rlp::{Reader, ReaderError, Serializer, Writer};
use discmap_common::time::get_current_time_in_seconds;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::{NodeId, NodeIdentity};
use super::node::Node;
use super::record::NodeRecord;

/// Message type identifiers.
pub mod message_type {
    pub const PING: u8 = 0x01;
    pub const PONG: u8 = 0x02;
    pub const FINDNODE: u8 = 0x03;
    pub const NEIGHBORS: u8 = 0x04;
    pub const ENR_REQUEST: u8 = 0x05;
    pub const ENR_RESPONSE: u8 = 0x06;
}

/// Protocol version announced in PING.
pub const PROTOCOL_VERSION: u64 = 4;

/// Maximum packet size in bytes.
pub const MAX_PACKET_SIZE: usize = 1280;

/// Expiration window in seconds for message validity.
pub const EXPIRATION_WINDOW: u64 = 20;

/// Maximum number of nodes in a single NEIGHBORS packet.
pub const MAX_NEIGHBORS: usize = 12;

/// Lowest UDP port accepted for a neighbor.
pub const MIN_NEIGHBOR_PORT: u16 = 1025;

/// Packet hash plus recoverable signature.
pub const HEADER_SIZE: usize = HASH_SIZE + RECOVERABLE_SIGNATURE_SIZE;

fn expiration_from_now() -> u64 {
    get_current_time_in_seconds().saturating_add(EXPIRATION_WINDOW)
}

fn read_ip(reader: &mut Reader) -> Result<IpAddr, ReaderError> {
    let bytes = reader.read_bytes()?;
    match bytes.len() {
        0 => Ok(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V4(Ipv4Addr::from(octets)))
        }
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Ok(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => Err(ReaderError::InvalidValue),
    }
}

fn write_ip(writer: &mut Writer, ip: &IpAddr) {
    match ip {
        IpAddr::V4(ip) => writer.write_bytes(&ip.octets()),
        IpAddr::V6(ip) => writer.write_bytes(&ip.octets()),
    }
}

/// `[ip, udp, tcp]` as carried by PING and PONG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, udp: u16, tcp: u16) -> Self {
        Self { ip, udp, tcp }
    }

    pub fn from_socket(addr: SocketAddr, tcp: u16) -> Self {
        Self::new(addr.ip(), addr.port(), tcp)
    }
}

impl Serializer for Endpoint {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut list = reader.read_list()?;
        let ip = read_ip(&mut list)?;
        let udp = list.read_u16()?;
        let tcp = list.read_u16()?;
        Ok(Self { ip, udp, tcp })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_list(|list| {
            write_ip(list, &self.ip);
            list.write_u16(self.udp);
            list.write_u16(self.tcp);
        });
    }
}

/// PING message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub version: u64,
    pub from: Endpoint,
    pub to: Endpoint,
    /// Message expiration timestamp (Unix seconds).
    pub expiration: u64,
    /// Sender's record sequence number, when advertised.
    pub enr_seq: Option<u64>,
}

impl Ping {
    pub fn new(from: Endpoint, to: Endpoint, enr_seq: u64) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            from,
            to,
            expiration: expiration_from_now(),
            enr_seq: Some(enr_seq),
        }
    }
}

impl Serializer for Ping {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut list = reader.read_list()?;
        let version = list.read_u64()?;
        let from = Endpoint::read(&mut list)?;
        let to = Endpoint::read(&mut list)?;
        let expiration = list.read_u64()?;
        let enr_seq = if list.is_empty() {
            None
        } else {
            Some(list.read_u64()?)
        };
        Ok(Self {
            version,
            from,
            to,
            expiration,
            enr_seq,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_list(|list| {
            list.write_u64(self.version);
            self.from.write(list);
            self.to.write(list);
            list.write_u64(self.expiration);
            if let Some(seq) = self.enr_seq {
                list.write_u64(seq);
            }
        });
    }
}

/// PONG message, answering the PING whose packet hash it echoes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pong {
    pub to: Endpoint,
    pub ping_hash: Hash,
    pub expiration: u64,
    pub enr_seq: Option<u64>,
}

impl Pong {
    pub fn new(to: Endpoint, ping_hash: Hash, enr_seq: u64) -> Self {
        Self {
            to,
            ping_hash,
            expiration: expiration_from_now(),
            enr_seq: Some(enr_seq),
        }
    }
}

impl Serializer for Pong {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut list = reader.read_list()?;
        let to = Endpoint::read(&mut list)?;
        let ping_hash = Hash::read(&mut list)?;
        let expiration = list.read_u64()?;
        let enr_seq = if list.is_empty() {
            None
        } else {
            Some(list.read_u64()?)
        };
        Ok(Self {
            to,
            ping_hash,
            expiration,
            enr_seq,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_list(|list| {
            self.to.write(list);
            self.ping_hash.write(list);
            list.write_u64(self.expiration);
            if let Some(seq) = self.enr_seq {
                list.write_u64(seq);
            }
        });
    }
}

/// FINDNODE message. The target is a public key, not a node id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindNode {
    pub target: [u8; SECP256K1_PUBLIC_KEY_SIZE],
    pub expiration: u64,
}

impl FindNode {
    pub fn new(target: &Secp256k1PublicKey) -> Self {
        Self {
            target: *target.as_bytes(),
            expiration: expiration_from_now(),
        }
    }

    /// Node id the requester is looking for.
    pub fn target_id(&self) -> NodeId {
        crypto::hash(&self.target)
    }
}

impl Serializer for FindNode {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut list = reader.read_list()?;
        let target = list.read_fixed::<SECP256K1_PUBLIC_KEY_SIZE>()?;
        let expiration = list.read_u64()?;
        Ok(Self { target, expiration })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_list(|list| {
            list.write_bytes(&self.target);
            list.write_u64(self.expiration);
        });
    }
}

/// Node entry of a NEIGHBORS message: `[ip, udp, tcp, public_key]`.
///
/// The key is kept as raw bytes; [`NeighborNode::to_node`] validates it, so
/// one bad entry never spoils the rest of the packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborNode {
    pub ip: IpAddr,
    pub udp: u16,
    pub tcp: u16,
    pub public_key: [u8; SECP256K1_PUBLIC_KEY_SIZE],
}

impl NeighborNode {
    pub fn from_node(node: &Node) -> Option<Self> {
        Some(Self {
            ip: node.ip()?,
            udp: node.udp()?,
            tcp: node.tcp().unwrap_or(0),
            public_key: *node.public_key().as_bytes(),
        })
    }

    /// Check the entry and turn it into a node.
    ///
    /// The key must be a curve point, the IP must be a unicast address and
    /// the UDP port must be above the privileged range.
    pub fn to_node(&self) -> DiscoveryResult<Node> {
        let public_key = Secp256k1PublicKey::from_slice(&self.public_key)?;

        if self.ip.is_unspecified() {
            return Err(DiscoveryError::InvalidEndpoint(format!(
                "unspecified address for {}",
                public_key.node_id()
            )));
        }

        if self.ip.is_multicast() {
            return Err(DiscoveryError::InvalidEndpoint(format!(
                "multicast address {}",
                self.ip
            )));
        }

        if self.udp < MIN_NEIGHBOR_PORT {
            return Err(DiscoveryError::InvalidEndpoint(format!(
                "low UDP port {}",
                self.udp
            )));
        }

        Ok(Node::new_unsigned(public_key, self.ip, self.udp, self.tcp))
    }
}

impl Serializer for NeighborNode {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut list = reader.read_list()?;
        let ip = read_ip(&mut list)?;
        let udp = list.read_u16()?;
        let tcp = list.read_u16()?;
        let public_key = list.read_fixed::<SECP256K1_PUBLIC_KEY_SIZE>()?;
        Ok(Self {
            ip,
            udp,
            tcp,
            public_key,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_list(|list| {
            write_ip(list, &self.ip);
            list.write_u16(self.udp);
            list.write_u16(self.tcp);
            list.write_bytes(&self.public_key);
        });
    }
}

/// NEIGHBORS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbors {
    pub nodes: Vec<NeighborNode>,
    pub expiration: u64,
}

impl Neighbors {
    /// Create a NEIGHBORS message, truncating to [`MAX_NEIGHBORS`].
    pub fn new(mut nodes: Vec<NeighborNode>) -> Self {
        nodes.truncate(MAX_NEIGHBORS);
        Self {
            nodes,
            expiration: expiration_from_now(),
        }
    }

    /// Spread nodes over as many packets as needed. Always yields at least one.
    pub fn split(nodes: Vec<NeighborNode>) -> Vec<Self> {
        if nodes.is_empty() {
            return vec![Self::new(Vec::new())];
        }

        nodes
            .chunks(MAX_NEIGHBORS)
            .map(|chunk| Self::new(chunk.to_vec()))
            .collect()
    }
}

impl Serializer for Neighbors {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut list = reader.read_list()?;
        let mut entries = list.read_list()?;
        let mut nodes = Vec::new();
        while !entries.is_empty() {
            nodes.push(NeighborNode::read(&mut entries)?);
        }
        let expiration = list.read_u64()?;
        Ok(Self { nodes, expiration })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_list(|list| {
            list.write_list(|entries| {
                for node in &self.nodes {
                    node.write(entries);
                }
            });
            list.write_u64(self.expiration);
        });
    }
}

/// ENRREQUEST message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrRequest {
    pub expiration: u64,
}

impl EnrRequest {
    pub fn new() -> Self {
        Self {
            expiration: expiration_from_now(),
        }
    }
}

impl Default for EnrRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl Serializer for EnrRequest {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut list = reader.read_list()?;
        let expiration = list.read_u64()?;
        Ok(Self { expiration })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_list(|list| list.write_u64(self.expiration));
    }
}

/// ENRRESPONSE message carrying the encoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrResponse {
    pub request_hash: Hash,
    pub record: Vec<u8>,
}

impl EnrResponse {
    pub fn new(request_hash: Hash, record: &NodeRecord) -> Self {
        Self {
            request_hash,
            record: record.as_bytes().to_vec(),
        }
    }

    /// Decode and verify the carried record.
    pub fn record(&self) -> DiscoveryResult<NodeRecord> {
        NodeRecord::decode_verified(&self.record)
    }
}

impl Serializer for EnrResponse {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        let mut list = reader.read_list()?;
        let request_hash = Hash::read(&mut list)?;
        let record = list.read_raw()?.to_vec();
        Ok(Self {
            request_hash,
            record,
        })
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_list(|list| {
            self.request_hash.write(list);
            list.write_raw(&self.record);
        });
    }
}

/// Discovery message types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    Neighbors(Neighbors),
    EnrRequest(EnrRequest),
    EnrResponse(EnrResponse),
}

impl Message {
    /// Get the message type ID.
    pub fn message_type(&self) -> u8 {
        match self {
            Message::Ping(_) => message_type::PING,
            Message::Pong(_) => message_type::PONG,
            Message::FindNode(_) => message_type::FINDNODE,
            Message::Neighbors(_) => message_type::NEIGHBORS,
            Message::EnrRequest(_) => message_type::ENR_REQUEST,
            Message::EnrResponse(_) => message_type::ENR_RESPONSE,
        }
    }

    pub fn expiration(&self) -> Option<u64> {
        match self {
            Message::Ping(m) => Some(m.expiration),
            Message::Pong(m) => Some(m.expiration),
            Message::FindNode(m) => Some(m.expiration),
            Message::Neighbors(m) => Some(m.expiration),
            Message::EnrRequest(m) => Some(m.expiration),
            Message::EnrResponse(_) => None,
        }
    }

    /// Check if the message has expired (past expiration time).
    pub fn is_expired(&self) -> bool {
        self.expiration()
            .is_some_and(|expiration| expiration < get_current_time_in_seconds())
    }

    /// Decode a message body. Bytes after the rlp list are ignored.
    pub fn decode(message_type: u8, data: &[u8]) -> DiscoveryResult<Self> {
        let mut reader = Reader::new(data);
        let message = match message_type {
            message_type::PING => Message::Ping(Ping::read(&mut reader)?),
            message_type::PONG => Message::Pong(Pong::read(&mut reader)?),
            message_type::FINDNODE => Message::FindNode(FindNode::read(&mut reader)?),
            message_type::NEIGHBORS => Message::Neighbors(Neighbors::read(&mut reader)?),
            message_type::ENR_REQUEST => Message::EnrRequest(EnrRequest::read(&mut reader)?),
            message_type::ENR_RESPONSE => Message::EnrResponse(EnrResponse::read(&mut reader)?),
            other => return Err(DiscoveryError::InvalidMessageType(other)),
        };
        Ok(message)
    }

    fn write_body(&self, writer: &mut Writer) {
        match self {
            Message::Ping(m) => m.write(writer),
            Message::Pong(m) => m.write(writer),
            Message::FindNode(m) => m.write(writer),
            Message::Neighbors(m) => m.write(writer),
            Message::EnrRequest(m) => m.write(writer),
            Message::EnrResponse(m) => m.write(writer),
        }
    }
}

/// A decoded and authenticated packet.
///
/// Packet format:
/// - hash (32 bytes): keccak256 of everything after it
/// - signature (65 bytes): recoverable signature over keccak256(type || body)
/// - message_type (1 byte)
/// - message body (rlp)
#[derive(Debug, Clone)]
pub struct SignedPacket {
    /// Packet hash, echoed by PONG and ENRRESPONSE.
    pub hash: Hash,
    /// Key recovered from the signature.
    pub sender: Secp256k1PublicKey,
    pub message: Message,
}

impl SignedPacket {
    /// Sign and encode a message, returning the packet and its hash.
    pub fn encode(identity: &NodeIdentity, message: &Message) -> DiscoveryResult<(Vec<u8>, Hash)> {
        let mut body = vec![message.message_type()];
        let mut writer = Writer::new(&mut body);
        message.write_body(&mut writer);

        let size = HEADER_SIZE + body.len();
        if size > MAX_PACKET_SIZE {
            return Err(DiscoveryError::PacketTooLarge(size, MAX_PACKET_SIZE));
        }

        let signature = identity.sign(&crypto::hash(&body))?;
        let hash = crypto::hash_all(&[&signature.as_bytes()[..], &body[..]]);

        let mut packet = Vec::with_capacity(size);
        packet.extend_from_slice(hash.as_bytes());
        packet.extend_from_slice(signature.as_bytes());
        packet.extend_from_slice(&body);
        Ok((packet, hash))
    }

    /// Message type byte of a raw packet, if it is long enough to have one.
    pub fn peek_type(data: &[u8]) -> Option<u8> {
        data.get(HEADER_SIZE).copied()
    }

    /// Decode a packet, checking its hash and recovering the sender.
    pub fn decode(data: &[u8]) -> DiscoveryResult<Self> {
        if data.len() < HEADER_SIZE + 1 {
            return Err(DiscoveryError::InvalidPacketSize(HEADER_SIZE + 1, data.len()));
        }

        let (hash_bytes, signed) = data.split_at(HASH_SIZE);
        let hash = crypto::hash(signed);
        if hash.as_bytes() != hash_bytes {
            return Err(DiscoveryError::HashMismatch);
        }

        let (signature_bytes, body) = signed.split_at(RECOVERABLE_SIGNATURE_SIZE);
        let signature = RecoverableSignature::from_slice(signature_bytes)?;
        let sender = signature
            .recover(&crypto::hash(body))
            .map_err(|_| DiscoveryError::InvalidSignature)?;

        let message = Message::decode(body[0], &body[1..])?;
        Ok(Self {
            hash,
            sender,
            message,
        })
    }

    pub fn sender_id(&self) -> NodeId {
        self.sender.node_id()
    }
}
