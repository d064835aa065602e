//! secp256k1 primitives for node identity.
//!
//! Discovery identities are secp256k1 keys. A node id is the keccak256 hash
//! of the 64-byte uncompressed public key (x || y, without the 0x04 tag).
//! Packets carry recoverable signatures so the sender key can be derived
//! from the packet itself, while node records carry plain 64-byte signatures
//! next to the compressed public key.

use k256::ecdsa::{
    signature::hazmat::PrehashVerifier, RecoveryId, Signature as EcdsaSignature, SigningKey,
    VerifyingKey,
};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{hash, CryptoError, Hash};

/// Size of a secp256k1 secret key in bytes.
pub const SECP256K1_SECRET_KEY_SIZE: usize = 32;

/// Size of an uncompressed public key without its tag byte.
pub const SECP256K1_PUBLIC_KEY_SIZE: usize = 64;

/// Size of a compressed public key.
pub const SECP256K1_COMPRESSED_KEY_SIZE: usize = 33;

/// Size of a plain (r || s) signature.
pub const SECP256K1_SIGNATURE_SIZE: usize = 64;

/// Size of a recoverable (r || s || v) signature.
pub const RECOVERABLE_SIGNATURE_SIZE: usize = 65;

fn decode_hex(hex: &str) -> Result<Vec<u8>, CryptoError> {
    let hex = hex.trim();
    let hex = hex.strip_prefix("0x").unwrap_or(hex);
    hex::decode(hex).map_err(|e| CryptoError::InvalidHex(e.to_string()))
}

/// secp256k1 secret key (32 bytes).
///
/// The secret key is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secp256k1SecretKey([u8; SECP256K1_SECRET_KEY_SIZE]);

impl Secp256k1SecretKey {
    pub fn from_bytes(bytes: [u8; SECP256K1_SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != SECP256K1_SECRET_KEY_SIZE {
            return Err(CryptoError::InvalidSecretKeyLength(slice.len()));
        }
        let mut bytes = [0u8; SECP256K1_SECRET_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        Self::from_slice(&decode_hex(hex)?)
    }

    pub fn as_bytes(&self) -> &[u8; SECP256K1_SECRET_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Secp256k1SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secp256k1SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// secp256k1 public key, stored uncompressed without the tag byte.
///
/// Every constructor checks that the point lies on the curve.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Secp256k1PublicKey([u8; SECP256K1_PUBLIC_KEY_SIZE]);

impl Secp256k1PublicKey {
    fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.as_affine().to_encoded_point(false);
        let mut bytes = [0u8; SECP256K1_PUBLIC_KEY_SIZE];
        // Skip the 0x04 tag
        bytes.copy_from_slice(&point.as_bytes()[1..]);
        Self(bytes)
    }

    /// Parse a 64-byte `x || y` key, or the 65-byte SEC1 form with its tag.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let mut tagged = [0u8; SECP256K1_PUBLIC_KEY_SIZE + 1];
        match slice.len() {
            SECP256K1_PUBLIC_KEY_SIZE => {
                tagged[0] = 0x04;
                tagged[1..].copy_from_slice(slice);
            }
            65 if slice[0] == 0x04 => tagged.copy_from_slice(slice),
            len => return Err(CryptoError::InvalidPublicKeyLength(len)),
        }

        let key =
            VerifyingKey::from_sec1_bytes(&tagged).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self::from_verifying_key(&key))
    }

    /// Parse a 33-byte compressed key.
    pub fn from_compressed(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != SECP256K1_COMPRESSED_KEY_SIZE {
            return Err(CryptoError::InvalidPublicKeyLength(slice.len()));
        }

        let key =
            VerifyingKey::from_sec1_bytes(slice).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self::from_verifying_key(&key))
    }

    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        Self::from_slice(&decode_hex(hex)?)
    }

    fn verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        let mut tagged = [0u8; SECP256K1_PUBLIC_KEY_SIZE + 1];
        tagged[0] = 0x04;
        tagged[1..].copy_from_slice(&self.0);
        VerifyingKey::from_sec1_bytes(&tagged).map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn as_bytes(&self) -> &[u8; SECP256K1_PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_compressed(&self) -> Result<[u8; SECP256K1_COMPRESSED_KEY_SIZE], CryptoError> {
        let point = self.verifying_key()?.as_affine().to_encoded_point(true);
        let mut bytes = [0u8; SECP256K1_COMPRESSED_KEY_SIZE];
        bytes.copy_from_slice(point.as_bytes());
        Ok(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Compute the node ID from this public key.
    pub fn node_id(&self) -> Hash {
        hash(&self.0)
    }

    /// Verify a plain 64-byte signature over a 32-byte digest.
    ///
    /// High-S signatures are accepted by normalizing them first.
    pub fn verify_prehash(&self, digest: &Hash, signature: &[u8]) -> Result<(), CryptoError> {
        if signature.len() != SECP256K1_SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignatureLength(signature.len()));
        }

        let signature =
            EcdsaSignature::from_slice(signature).map_err(|_| CryptoError::InvalidSignature)?;
        let signature = signature.normalize_s().unwrap_or(signature);
        self.verifying_key()?
            .verify_prehash(digest.as_bytes(), &signature)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for Secp256k1PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secp256k1PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for Secp256k1PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Secp256k1PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Secp256k1PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Recoverable signature (r || s || v) as carried by discovery packets.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RecoverableSignature([u8; RECOVERABLE_SIGNATURE_SIZE]);

impl RecoverableSignature {
    pub fn from_bytes(bytes: [u8; RECOVERABLE_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != RECOVERABLE_SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignatureLength(slice.len()));
        }
        let mut bytes = [0u8; RECOVERABLE_SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; RECOVERABLE_SIGNATURE_SIZE] {
        &self.0
    }

    /// The r || s part, without the recovery id.
    pub fn compact(&self) -> &[u8] {
        &self.0[..SECP256K1_SIGNATURE_SIZE]
    }

    pub fn recovery_id(&self) -> u8 {
        self.0[SECP256K1_SIGNATURE_SIZE]
    }

    /// Recover the public key that produced this signature over `digest`.
    pub fn recover(&self, digest: &Hash) -> Result<Secp256k1PublicKey, CryptoError> {
        let signature =
            EcdsaSignature::from_slice(self.compact()).map_err(|_| CryptoError::InvalidSignature)?;
        let recovery_id = RecoveryId::from_byte(self.recovery_id())
            .ok_or(CryptoError::InvalidRecoveryId(self.recovery_id()))?;
        let key = VerifyingKey::recover_from_prehash(digest.as_bytes(), &signature, recovery_id)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        Ok(Secp256k1PublicKey::from_verifying_key(&key))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for RecoverableSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoverableSignature({}...)", &self.to_hex()[..16])
    }
}

/// secp256k1 key pair.
#[derive(Clone)]
pub struct Secp256k1KeyPair {
    signing_key: SigningKey,
}

impl Secp256k1KeyPair {
    /// Generate a new random key pair using a cryptographically secure RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret(secret: &Secp256k1SecretKey) -> Result<Self, CryptoError> {
        let signing_key =
            SigningKey::from_slice(secret.as_bytes()).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self { signing_key })
    }

    pub fn secret_key(&self) -> Secp256k1SecretKey {
        let mut bytes = [0u8; SECP256K1_SECRET_KEY_SIZE];
        bytes.copy_from_slice(&self.signing_key.to_bytes());
        let secret = Secp256k1SecretKey::from_bytes(bytes);
        bytes.zeroize();
        secret
    }

    pub fn public_key(&self) -> Secp256k1PublicKey {
        Secp256k1PublicKey::from_verifying_key(self.signing_key.verifying_key())
    }

    /// Sign a 32-byte digest, producing a low-S recoverable signature.
    pub fn sign_prehash(&self, digest: &Hash) -> Result<RecoverableSignature, CryptoError> {
        let (signature, recovery_id) = self
            .signing_key
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|_| CryptoError::SigningFailed)?;

        let mut bytes = [0u8; RECOVERABLE_SIGNATURE_SIZE];
        bytes[..SECP256K1_SIGNATURE_SIZE].copy_from_slice(&signature.to_bytes());
        bytes[SECP256K1_SIGNATURE_SIZE] = recovery_id.to_byte();
        Ok(RecoverableSignature(bytes))
    }

    pub fn node_id(&self) -> Hash {
        self.public_key().node_id()
    }
}

impl fmt::Debug for Secp256k1KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secp256k1KeyPair")
            .field("public_key", &self.public_key())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// Wrapper type for a secp256k1 secret key that can be parsed from CLI arguments.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct WrappedSecp256k1Secret(Secp256k1SecretKey);

impl WrappedSecp256k1Secret {
    pub fn new(secret: Secp256k1SecretKey) -> Self {
        Self(secret)
    }

    pub fn inner(&self) -> &Secp256k1SecretKey {
        &self.0
    }

    pub fn to_keypair(&self) -> Result<Secp256k1KeyPair, CryptoError> {
        Secp256k1KeyPair::from_secret(&self.0)
    }
}

impl std::str::FromStr for WrappedSecp256k1Secret {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secret = Secp256k1SecretKey::from_hex(s)?;
        // Reject scalars outside the curve order up front
        Secp256k1KeyPair::from_secret(&secret)?;
        Ok(Self(secret))
    }
}

impl fmt::Debug for WrappedSecp256k1Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WrappedSecp256k1Secret")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl fmt::Display for WrappedSecp256k1Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for WrappedSecp256k1Secret {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_hex())
    }
}

impl<'de> Deserialize<'de> for WrappedSecp256k1Secret {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
