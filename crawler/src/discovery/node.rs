//! Typed view of a discovered node.
//!
//! A node is known either through a signed record or through an enode URL
//! (as found in NEIGHBORS replies). Either way it has an identity key, a node
//! id and possibly a UDP endpoint.

use discmap_common::crypto::Secp256k1PublicKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use super::error::{DiscoveryError, DiscoveryResult};
use super::identity::NodeId;
use super::record::NodeRecord;
use super::url::{EnodeUrl, ENODE_URL_SCHEME};

#[derive(Clone, PartialEq, Eq)]
pub struct Node {
    id: NodeId,
    public_key: Secp256k1PublicKey,
    ip: Option<IpAddr>,
    udp: Option<u16>,
    tcp: Option<u16>,
    record: Option<NodeRecord>,
}

impl Node {
    /// Node without a signed record.
    pub fn new_unsigned(
        public_key: Secp256k1PublicKey,
        ip: IpAddr,
        udp: u16,
        tcp: u16,
    ) -> Self {
        Self {
            id: public_key.node_id(),
            public_key,
            ip: Some(ip),
            udp: Some(udp),
            tcp: (tcp != 0).then_some(tcp),
            record: None,
        }
    }

    /// Build from a record, checking its signature.
    pub fn from_record(record: NodeRecord) -> DiscoveryResult<Self> {
        let public_key = record.verify()?;
        let (ip, udp, tcp) = record.endpoint();
        Ok(Self {
            id: public_key.node_id(),
            public_key,
            ip,
            udp,
            tcp,
            record: Some(record),
        })
    }

    /// Parse an enode URL or any text form of a record.
    pub fn parse(source: &str) -> DiscoveryResult<Self> {
        let source = source.trim();
        if source.starts_with(ENODE_URL_SCHEME) {
            let url = EnodeUrl::parse(source)?;
            return Ok(Self::new_unsigned(url.public_key, url.ip, url.udp, url.tcp));
        }

        Self::from_record(NodeRecord::parse(source)?)
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn public_key(&self) -> &Secp256k1PublicKey {
        &self.public_key
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip
    }

    pub fn udp(&self) -> Option<u16> {
        self.udp
    }

    pub fn tcp(&self) -> Option<u16> {
        self.tcp
    }

    pub fn record(&self) -> Option<&NodeRecord> {
        self.record.as_ref()
    }

    /// Record sequence number, zero when only the URL form is known.
    pub fn seq(&self) -> u64 {
        self.record.as_ref().map_or(0, NodeRecord::seq)
    }

    /// Address to send discovery packets to.
    pub fn udp_endpoint(&self) -> DiscoveryResult<SocketAddr> {
        match (self.ip, self.udp) {
            (Some(ip), Some(port)) if !ip.is_unspecified() && port != 0 => {
                Ok(SocketAddr::new(ip, port))
            }
            _ => Err(DiscoveryError::InvalidEndpoint(format!(
                "node {} has no UDP endpoint",
                self.id
            ))),
        }
    }

    pub fn to_enode_url(&self) -> Option<EnodeUrl> {
        let ip = self.ip?;
        let udp = self.udp.unwrap_or(0);
        Some(EnodeUrl::new(
            self.public_key,
            ip,
            self.tcp.unwrap_or(0),
            udp,
        ))
    }

    /// Text form kept in the registry: the record when signed, else the URL.
    pub fn to_text(&self) -> String {
        if let Some(record) = &self.record {
            return record.to_text();
        }

        match self.to_enode_url() {
            Some(url) => url.to_string(),
            None => format!("{}{}", ENODE_URL_SCHEME, self.public_key.to_hex()),
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("udp", &self.udp)
            .field("tcp", &self.tcp)
            .field("seq", &self.seq())
            .finish()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

impl FromStr for Node {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Node {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for Node {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
