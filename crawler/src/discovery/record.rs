//! Signed node records.
//!
//! A record is the rlp list `[signature, seq, k1, v1, k2, v2, ...]` with
//! byte-string keys in strictly ascending order. Under the "v4" identity
//! scheme the `secp256k1` key holds the compressed public key and the
//! signature is a 64-byte secp256k1 signature over
//! `keccak256(rlp([seq, k1, v1, ...]))`.
//!
//! Decoding is split in two steps: [`NodeRecord::decode`] checks structure
//! only, [`NodeRecord::verify`] checks the signature. Text input goes through
//! [`NodeRecord::parse`], which accepts `enr:` + base64url, hex with or
//! without `0x`, bare base64url and raw bytes, in that order.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use discmap_common::crypto::{hash, Hash, Secp256k1KeyPair, Secp256k1PublicKey};
use discmap_common::rlp::{Reader, Writer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::error::{DiscoveryError, DiscoveryResult};

/// Maximum encoded size of a record.
pub const MAX_RECORD_SIZE: usize = 300;

/// Prefix of the text form.
pub const RECORD_TEXT_PREFIX: &str = "enr:";

/// The only identity scheme understood.
pub const ID_SCHEME_V4: &str = "v4";

/// Well known record keys.
pub mod keys {
    pub const ID: &str = "id";
    pub const SECP256K1: &str = "secp256k1";
    pub const IP: &str = "ip";
    pub const IP6: &str = "ip6";
    pub const TCP: &str = "tcp";
    pub const TCP6: &str = "tcp6";
    pub const UDP: &str = "udp";
    pub const UDP6: &str = "udp6";
}

fn key_name(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

// Content covered by the signature: rlp([seq, k1, v1, ...])
fn signing_content<'a, I>(seq: u64, pairs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a Vec<u8>, &'a Vec<u8>)>,
{
    let mut bytes = Vec::new();
    let mut writer = Writer::new(&mut bytes);
    writer.write_list(|list| {
        list.write_u64(seq);
        for (key, value) in pairs {
            list.write_bytes(key);
            list.write_raw(value);
        }
    });
    bytes
}

// Attribute value decoders, each expecting exactly one rlp item
fn decode_value<'a>(key: &str, raw: &'a [u8]) -> DiscoveryResult<&'a [u8]> {
    let mut reader = Reader::new(raw);
    reader
        .read_bytes()
        .map_err(|e| DiscoveryError::InvalidAttribute(key.to_string(), e.to_string()))
}

fn decode_port(key: &str, raw: &[u8]) -> DiscoveryResult<u16> {
    let mut reader = Reader::new(raw);
    reader
        .read_u16()
        .map_err(|e| DiscoveryError::InvalidAttribute(key.to_string(), e.to_string()))
}

fn decode_ip4(raw: &[u8]) -> DiscoveryResult<Ipv4Addr> {
    let bytes = decode_value(keys::IP, raw)?;
    let octets: [u8; 4] = bytes.try_into().map_err(|_| {
        DiscoveryError::InvalidAttribute(keys::IP.to_string(), format!("{} bytes", bytes.len()))
    })?;
    Ok(Ipv4Addr::from(octets))
}

fn decode_ip6(raw: &[u8]) -> DiscoveryResult<Ipv6Addr> {
    let bytes = decode_value(keys::IP6, raw)?;
    let octets: [u8; 16] = bytes.try_into().map_err(|_| {
        DiscoveryError::InvalidAttribute(keys::IP6.to_string(), format!("{} bytes", bytes.len()))
    })?;
    Ok(Ipv6Addr::from(octets))
}

/// A node record as found on the wire.
///
/// Values are kept rlp encoded, so unknown keys survive a decode and
/// re-encode untouched.
#[derive(Clone, PartialEq, Eq)]
pub struct NodeRecord {
    seq: u64,
    signature: Vec<u8>,
    pairs: Vec<(Vec<u8>, Vec<u8>)>,
    raw: Vec<u8>,
}

impl NodeRecord {
    /// Decode the binary form without checking the signature.
    pub fn decode(bytes: &[u8]) -> DiscoveryResult<Self> {
        if bytes.is_empty() {
            return Err(DiscoveryError::EmptyRecord);
        }

        if bytes.len() > MAX_RECORD_SIZE {
            return Err(DiscoveryError::RecordTooLarge(bytes.len(), MAX_RECORD_SIZE));
        }

        let mut reader = Reader::new(bytes);
        let mut list = reader.read_list()?;
        if !reader.is_empty() {
            return Err(DiscoveryError::InvalidEncoding(format!(
                "{} bytes after the record",
                reader.size()
            )));
        }

        let signature = list.read_bytes()?.to_vec();
        let seq = list.read_u64()?;

        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        while !list.is_empty() {
            let key = list.read_bytes()?;
            if list.is_empty() {
                return Err(DiscoveryError::InvalidEncoding(format!(
                    "key {} has no value",
                    key_name(key)
                )));
            }
            let value = list.read_raw()?;

            if let Some((previous, _)) = pairs.last() {
                match key.cmp(previous.as_slice()) {
                    std::cmp::Ordering::Greater => {}
                    std::cmp::Ordering::Equal => {
                        return Err(DiscoveryError::DuplicateKey(key_name(key)))
                    }
                    std::cmp::Ordering::Less => {
                        return Err(DiscoveryError::UnsortedKeys(
                            key_name(key),
                            key_name(previous),
                        ))
                    }
                }
            }
            pairs.push((key.to_vec(), value.to_vec()));
        }

        let record = Self {
            seq,
            signature,
            pairs,
            raw: bytes.to_vec(),
        };
        record.check_attributes()?;
        Ok(record)
    }

    // Well known keys must carry well formed values
    fn check_attributes(&self) -> DiscoveryResult<()> {
        for (key, value) in &self.pairs {
            match key.as_slice() {
                k if k == keys::IP.as_bytes() => {
                    decode_ip4(value)?;
                }
                k if k == keys::IP6.as_bytes() => {
                    decode_ip6(value)?;
                }
                k if k == keys::TCP.as_bytes()
                    || k == keys::TCP6.as_bytes()
                    || k == keys::UDP.as_bytes()
                    || k == keys::UDP6.as_bytes() =>
                {
                    decode_port(&key_name(k), value)?;
                }
                k if k == keys::ID.as_bytes() || k == keys::SECP256K1.as_bytes() => {
                    decode_value(&key_name(k), value)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Decode and check the signature.
    pub fn decode_verified(bytes: &[u8]) -> DiscoveryResult<Self> {
        let record = Self::decode(bytes)?;
        record.verify()?;
        Ok(record)
    }

    /// Parse any supported text form and check the signature.
    ///
    /// The first form that decodes structurally is the one verified; a
    /// signature failure there is reported as is, without trying the
    /// remaining forms.
    pub fn parse(source: &str) -> DiscoveryResult<Self> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(DiscoveryError::EmptyRecord);
        }

        let mut first_error = None;
        for payload in Self::candidate_payloads(trimmed) {
            match Self::decode(&payload) {
                Ok(record) => {
                    record.verify()?;
                    return Ok(record);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        Err(first_error.unwrap_or(DiscoveryError::EmptyRecord))
    }

    fn candidate_payloads(source: &str) -> Vec<Vec<u8>> {
        let mut payloads = Vec::with_capacity(4);

        if let Some(encoded) = source.strip_prefix(RECORD_TEXT_PREFIX) {
            if let Ok(bytes) = URL_SAFE_NO_PAD.decode(encoded) {
                payloads.push(bytes);
            }
        }

        let hex_part = source
            .strip_prefix("0x")
            .or_else(|| source.strip_prefix("0X"))
            .unwrap_or(source);
        if let Ok(bytes) = hex::decode(hex_part) {
            payloads.push(bytes);
        }

        if let Ok(bytes) = URL_SAFE_NO_PAD.decode(source) {
            payloads.push(bytes);
        }

        payloads.push(source.as_bytes().to_vec());
        payloads
    }

    /// Check the signature against the identity scheme, returning the signer.
    pub fn verify(&self) -> DiscoveryResult<Secp256k1PublicKey> {
        let scheme = self.id_scheme()?.ok_or(DiscoveryError::MissingIdentityScheme)?;
        if scheme != ID_SCHEME_V4 {
            return Err(DiscoveryError::UnknownIdentityScheme(scheme));
        }

        let public_key = self.public_key()?;
        let digest = hash(&signing_content(
            self.seq,
            self.pairs.iter().map(|(k, v)| (k, v)),
        ));
        public_key
            .verify_prehash(&digest, &self.signature)
            .map_err(|_| DiscoveryError::InvalidSignature)?;
        Ok(public_key)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn signature(&self) -> &[u8] {
        &self.signature
    }

    /// Raw rlp value stored under `key`.
    pub fn get_raw(&self, key: &str) -> Option<&[u8]> {
        self.pairs
            .binary_search_by(|(k, _)| k.as_slice().cmp(key.as_bytes()))
            .ok()
            .map(|index| self.pairs[index].1.as_slice())
    }

    /// Iterate over keys in record order.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.pairs.iter().map(|(k, _)| k.as_slice())
    }

    pub fn id_scheme(&self) -> DiscoveryResult<Option<String>> {
        self.get_raw(keys::ID)
            .map(|raw| decode_value(keys::ID, raw).map(key_name))
            .transpose()
    }

    /// Public key from the `secp256k1` attribute.
    pub fn public_key(&self) -> DiscoveryResult<Secp256k1PublicKey> {
        let raw = self.get_raw(keys::SECP256K1).ok_or_else(|| {
            DiscoveryError::InvalidAttribute(keys::SECP256K1.to_string(), "missing".to_string())
        })?;
        let bytes = decode_value(keys::SECP256K1, raw)?;
        Ok(Secp256k1PublicKey::from_compressed(bytes)?)
    }

    pub fn node_id(&self) -> DiscoveryResult<Hash> {
        Ok(self.public_key()?.node_id())
    }

    // Attributes were validated by decode, so lookups cannot fail here
    pub fn ip4(&self) -> Option<Ipv4Addr> {
        self.get_raw(keys::IP).and_then(|raw| decode_ip4(raw).ok())
    }

    pub fn ip6(&self) -> Option<Ipv6Addr> {
        self.get_raw(keys::IP6).and_then(|raw| decode_ip6(raw).ok())
    }

    fn port(&self, key: &str) -> Option<u16> {
        self.get_raw(key).and_then(|raw| decode_port(key, raw).ok())
    }

    pub fn udp(&self) -> Option<u16> {
        self.port(keys::UDP)
    }

    pub fn tcp(&self) -> Option<u16> {
        self.port(keys::TCP)
    }

    pub fn udp6(&self) -> Option<u16> {
        self.port(keys::UDP6)
    }

    pub fn tcp6(&self) -> Option<u16> {
        self.port(keys::TCP6)
    }

    /// Preferred endpoint: IPv4 with `udp`/`tcp`, else IPv6 with the v6 ports.
    pub fn endpoint(&self) -> (Option<IpAddr>, Option<u16>, Option<u16>) {
        if let Some(ip) = self.ip4() {
            return (Some(IpAddr::V4(ip)), self.udp(), self.tcp());
        }

        if let Some(ip) = self.ip6() {
            return (
                Some(IpAddr::V6(ip)),
                self.udp6().or_else(|| self.udp()),
                self.tcp6().or_else(|| self.tcp()),
            );
        }

        (None, self.udp(), self.tcp())
    }

    /// Encoded form exactly as decoded or built.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    /// `enr:` text form.
    pub fn to_text(&self) -> String {
        format!("{}{}", RECORD_TEXT_PREFIX, URL_SAFE_NO_PAD.encode(&self.raw))
    }
}

impl fmt::Debug for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("NodeRecord");
        debug.field("seq", &self.seq);
        for (key, value) in &self.pairs {
            debug.field(&key_name(key), &hex::encode(value));
        }
        debug.finish()
    }
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_text())
    }
}

/// Builds and signs v4 records.
#[derive(Debug, Clone, Default)]
pub struct RecordBuilder {
    seq: u64,
    pairs: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }

    /// Set an arbitrary byte-string attribute.
    pub fn bytes(mut self, key: &str, value: &[u8]) -> Self {
        let mut raw = Vec::new();
        Writer::new(&mut raw).write_bytes(value);
        self.pairs.insert(key.as_bytes().to_vec(), raw);
        self
    }

    fn port(mut self, key: &str, port: u16) -> Self {
        let mut raw = Vec::new();
        Writer::new(&mut raw).write_u16(port);
        self.pairs.insert(key.as_bytes().to_vec(), raw);
        self
    }

    /// Set `ip` or `ip6` depending on the address family.
    pub fn ip(self, ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => self.bytes(keys::IP, &ip.octets()),
            IpAddr::V6(ip) => self.bytes(keys::IP6, &ip.octets()),
        }
    }

    pub fn udp(self, port: u16) -> Self {
        self.port(keys::UDP, port)
    }

    pub fn tcp(self, port: u16) -> Self {
        self.port(keys::TCP, port)
    }

    pub fn udp6(self, port: u16) -> Self {
        self.port(keys::UDP6, port)
    }

    pub fn tcp6(self, port: u16) -> Self {
        self.port(keys::TCP6, port)
    }

    /// Add the identity attributes and sign.
    pub fn build(self, keypair: &Secp256k1KeyPair) -> DiscoveryResult<NodeRecord> {
        let compressed = keypair.public_key().to_compressed()?;
        let builder = self
            .bytes(keys::ID, ID_SCHEME_V4.as_bytes())
            .bytes(keys::SECP256K1, &compressed);

        let digest = hash(&signing_content(builder.seq, &builder.pairs));
        let signature = keypair.sign_prehash(&digest)?;

        let mut raw = Vec::new();
        let mut writer = Writer::new(&mut raw);
        writer.write_list(|list| {
            list.write_bytes(signature.compact());
            list.write_u64(builder.seq);
            for (key, value) in &builder.pairs {
                list.write_bytes(key);
                list.write_raw(value);
            }
        });

        if raw.len() > MAX_RECORD_SIZE {
            return Err(DiscoveryError::RecordTooLarge(raw.len(), MAX_RECORD_SIZE));
        }

        Ok(NodeRecord {
            seq: builder.seq,
            signature: signature.compact().to_vec(),
            pairs: builder.pairs.into_iter().collect(),
            raw,
        })
    }
}
