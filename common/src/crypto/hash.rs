use crate::rlp::{Reader, ReaderError, Serializer, Writer};
use serde::de::Error as SerdeError;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use std::{
    fmt::{Display, Error, Formatter},
    str::FromStr,
};

use super::CryptoError;

pub const HASH_SIZE: usize = 32; // 32 bytes / 256 bits

#[derive(Eq, PartialEq, PartialOrd, Ord, Clone, Copy, Debug, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    pub const fn zero() -> Self {
        Hash::new([0; HASH_SIZE])
    }

    pub const fn max() -> Self {
        Hash::new([u8::MAX; HASH_SIZE])
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; HASH_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidHashLength {
                    len: slice.len(),
                    expected: HASH_SIZE,
                })?;
        Ok(Hash(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; HASH_SIZE] {
        self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Hash {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
        Hash::from_slice(&bytes)
    }
}

// Hash a byte array using keccak256
#[inline(always)]
pub fn hash(value: &[u8]) -> Hash {
    Hash(Keccak256::digest(value).into())
}

// Hash the concatenation of several byte arrays without copying them
pub fn hash_all(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash(hasher.finalize().into())
}

impl Serializer for Hash {
    fn read(reader: &mut Reader) -> Result<Self, ReaderError> {
        reader.read_fixed::<HASH_SIZE>().map(Hash)
    }

    fn write(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), Error> {
        write!(f, "{}", &self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'a> Deserialize<'a> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'a>,
    {
        let hex = String::deserialize(deserializer)?;
        if hex.len() != HASH_SIZE * 2 {
            return Err(SerdeError::custom("Invalid hex length"));
        }

        hex.parse().map_err(SerdeError::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak_empty() {
        assert_eq!(
            hash(b"").to_hex(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_hash_all_matches_concatenation() {
        assert_eq!(hash_all(&[b"hello ", b"world"]), hash(b"hello world"));
    }

    #[test]
    fn test_from_str_accepts_prefix() {
        let h = hash(b"abc");
        assert_eq!(h.to_hex().parse::<Hash>().unwrap(), h);
        assert_eq!(format!("0x{}", h).parse::<Hash>().unwrap(), h);
        assert!("abcd".parse::<Hash>().is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        let h = hash(b"discovery");
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, format!("\"{}\"", h.to_hex()));
        let back: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn test_rlp_encoding() {
        let h = Hash::max();
        let bytes = Serializer::to_bytes(&h);
        assert_eq!(bytes[0], 0xa0);
        assert_eq!(Hash::from_bytes(&bytes).unwrap(), h);
    }
}
