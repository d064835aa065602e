//! Node identity for the discovery protocol.
//!
//! Each node in the discovery network has a unique identity consisting of:
//! - A secp256k1 key pair for signing packets and node records
//! - A node ID derived from the public key (keccak256 of the uncompressed key)
//!
//! The local node additionally owns the signed record it hands out to peers.

use discmap_common::crypto::{
    Hash, RecoverableSignature, Secp256k1KeyPair, Secp256k1PublicKey, Secp256k1SecretKey,
};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use super::error::{DiscoveryError, DiscoveryResult};
use super::record::{NodeRecord, RecordBuilder};

/// Node ID is a 32-byte hash of the node's public key.
///
/// The node ID is used for:
/// - XOR distance calculations during lookups
/// - Keying the node database
/// - Deduplicating lookup results
pub type NodeId = Hash;

/// Node identity containing the key pair and derived node ID.
#[derive(Clone)]
pub struct NodeIdentity {
    keypair: Secp256k1KeyPair,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generate a new random node identity.
    pub fn generate() -> Self {
        Self::from_keypair(Secp256k1KeyPair::generate())
    }

    pub fn from_keypair(keypair: Secp256k1KeyPair) -> Self {
        let node_id = keypair.node_id();
        Self { keypair, node_id }
    }

    /// Create a node identity from a secret key.
    pub fn from_secret(secret: &Secp256k1SecretKey) -> DiscoveryResult<Self> {
        let keypair = Secp256k1KeyPair::from_secret(secret)?;
        Ok(Self::from_keypair(keypair))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn public_key(&self) -> Secp256k1PublicKey {
        self.keypair.public_key()
    }

    pub fn keypair(&self) -> &Secp256k1KeyPair {
        &self.keypair
    }

    /// Sign a 32-byte digest with this identity's key.
    pub fn sign(&self, digest: &Hash) -> DiscoveryResult<RecoverableSignature> {
        Ok(self.keypair.sign_prehash(digest)?)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .field("public_key", &self.keypair.public_key().to_hex())
            .finish()
    }
}

/// Statically configured external address of the local node.
///
/// A zero port means "keep the port the socket is bound to".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalAddress {
    pub ip: IpAddr,
    pub port: u16,
}

/// Parse an external address given either as a bare IP or as `IP:PORT`.
pub fn parse_external_address(value: &str) -> DiscoveryResult<ExternalAddress> {
    let value = value.trim();
    if let Ok(ip) = value.parse::<IpAddr>() {
        return Ok(ExternalAddress { ip, port: 0 });
    }

    let addr: SocketAddr = value
        .parse()
        .map_err(|_| DiscoveryError::ConfigError(format!("invalid external address '{}'", value)))?;
    Ok(ExternalAddress {
        ip: addr.ip(),
        port: addr.port(),
    })
}

/// Resolve the endpoint advertised in the local record.
///
/// The external address wins for the IP. Its port only wins when nonzero;
/// otherwise the bound port is kept. A wildcard bind is advertised as loopback.
pub fn advertised_endpoint(bound: SocketAddr, external: Option<ExternalAddress>) -> SocketAddr {
    let fallback_ip = if bound.ip().is_unspecified() {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        bound.ip()
    };

    match external {
        Some(external) => {
            let port = if external.port != 0 {
                external.port
            } else {
                bound.port()
            };
            SocketAddr::new(external.ip, port)
        }
        None => SocketAddr::new(fallback_ip, bound.port()),
    }
}

/// The crawler's own node: identity, advertised endpoint and signed record.
#[derive(Debug, Clone)]
pub struct LocalNode {
    identity: NodeIdentity,
    endpoint: SocketAddr,
    record: NodeRecord,
}

impl LocalNode {
    pub fn new(
        identity: NodeIdentity,
        bound: SocketAddr,
        external: Option<ExternalAddress>,
        seq: u64,
    ) -> DiscoveryResult<Self> {
        let endpoint = advertised_endpoint(bound, external);
        let record = RecordBuilder::new()
            .seq(seq)
            .ip(endpoint.ip())
            .udp(endpoint.port())
            .build(identity.keypair())?;

        Ok(Self {
            identity,
            endpoint,
            record,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn node_id(&self) -> &NodeId {
        self.identity.node_id()
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn record(&self) -> &NodeRecord {
        &self.record
    }

    pub fn seq(&self) -> u64 {
        self.record.seq()
    }
}

/// Calculate the XOR distance between two node IDs.
///
/// Nodes with smaller XOR distance are considered "closer". The result
/// compares as a big-endian unsigned integer.
pub fn xor_distance(a: &NodeId, b: &NodeId) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result
        .iter_mut()
        .zip(a.as_bytes().iter().zip(b.as_bytes().iter()))
    {
        *out = x ^ y;
    }
    result
}

/// Calculate the logarithmic distance between two node IDs.
///
/// This returns the index of the highest set bit of the XOR distance,
/// counted from the least significant bit.
///
/// Returns `None` if the IDs are identical (distance is 0).
/// Returns `Some(0)` to `Some(255)` for different IDs.
pub fn log2_distance(a: &NodeId, b: &NodeId) -> Option<u8> {
    let distance = xor_distance(a, b);

    for (i, byte) in distance.iter().enumerate() {
        if *byte != 0 {
            // Bit position counted from the most significant bit overall
            let bit_position = i * 8 + byte.leading_zeros() as usize;
            return Some(255u8.saturating_sub(bit_position as u8));
        }
    }

    None
}

/// Compare two XOR distances.
///
/// Returns:
/// - `Ordering::Less` if `a` is closer to `target` than `b`
/// - `Ordering::Greater` if `b` is closer to `target` than `a`
/// - `Ordering::Equal` if they are equidistant (only when `a == b`)
pub fn compare_distance(target: &NodeId, a: &NodeId, b: &NodeId) -> std::cmp::Ordering {
    xor_distance(target, a).cmp(&xor_distance(target, b))
}
