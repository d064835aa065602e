//! enode:// URL parser.
//!
//! Format: `enode://<public_key_hex>@<ip>:<tcp_port>[?discport=<udp_port>]`
//!
//! The public key is the 64-byte uncompressed secp256k1 key in hex. When
//! `discport` is absent the UDP port equals the TCP port.

use discmap_common::crypto::Secp256k1PublicKey;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use super::error::{DiscoveryError, DiscoveryResult};

/// URL scheme for enode URLs.
pub const ENODE_URL_SCHEME: &str = "enode://";

const DISCPORT_PARAM: &str = "discport";

/// Parsed enode:// URL carrying an identity key and its endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnodeUrl {
    pub public_key: Secp256k1PublicKey,
    pub ip: IpAddr,
    pub tcp: u16,
    pub udp: u16,
}

impl EnodeUrl {
    pub fn new(public_key: Secp256k1PublicKey, ip: IpAddr, tcp: u16, udp: u16) -> Self {
        Self {
            public_key,
            ip,
            tcp,
            udp,
        }
    }

    /// Parse an enode:// URL string.
    ///
    /// # Returns
    /// * `Ok(EnodeUrl)` if parsing succeeds
    /// * `Err(DiscoveryError::InvalidUrl)` if the format is invalid
    /// * `Err(DiscoveryError::Crypto)` if the key is not a curve point
    pub fn parse(s: &str) -> DiscoveryResult<Self> {
        let rest = s.trim().strip_prefix(ENODE_URL_SCHEME).ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must start with '{}', got: {}",
                ENODE_URL_SCHEME, s
            ))
        })?;

        let (key_hex, location) = rest.split_once('@').ok_or_else(|| {
            DiscoveryError::InvalidUrl(format!(
                "URL must contain '@' separator between public key and address: {}",
                s
            ))
        })?;

        if key_hex.len() != 128 {
            return Err(DiscoveryError::InvalidUrl(format!(
                "Public key must be 128 hex characters (64 bytes), got {} characters",
                key_hex.len()
            )));
        }

        let key_bytes = hex::decode(key_hex)
            .map_err(|e| DiscoveryError::InvalidUrl(format!("Invalid public key hex: {}", e)))?;
        let public_key = Secp256k1PublicKey::from_slice(&key_bytes)?;

        let (address_str, query) = match location.split_once('?') {
            Some((address, query)) => (address, Some(query)),
            None => (location, None),
        };

        let address: SocketAddr = address_str.parse().map_err(|e| {
            DiscoveryError::InvalidUrl(format!("Invalid socket address '{}': {}", address_str, e))
        })?;

        let mut udp = address.port();
        if let Some(query) = query {
            for pair in query.split('&').filter(|pair| !pair.is_empty()) {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                if name == DISCPORT_PARAM {
                    udp = value.parse().map_err(|_| {
                        DiscoveryError::InvalidUrl(format!("Invalid discport '{}'", value))
                    })?;
                }
            }
        }

        Ok(Self {
            public_key,
            ip: address.ip(),
            tcp: address.port(),
            udp,
        })
    }
}

impl fmt::Display for EnodeUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}@{}",
            ENODE_URL_SCHEME,
            self.public_key.to_hex(),
            SocketAddr::new(self.ip, self.tcp)
        )?;
        if self.udp != self.tcp {
            write!(f, "?{}={}", DISCPORT_PARAM, self.udp)?;
        }
        Ok(())
    }
}

impl FromStr for EnodeUrl {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
