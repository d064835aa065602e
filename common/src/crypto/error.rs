use thiserror::Error;

use super::secp256k1::{
    RECOVERABLE_SIGNATURE_SIZE, SECP256K1_PUBLIC_KEY_SIZE, SECP256K1_SECRET_KEY_SIZE,
    SECP256K1_SIGNATURE_SIZE,
};

/// Errors that can occur during cryptographic operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid hex string: {0}")]
    InvalidHex(String),

    #[error("Invalid hash length: {len} bytes, expected: {expected} bytes")]
    InvalidHashLength { len: usize, expected: usize },

    #[error(
        "Invalid secret key length: expected {}, got {}",
        SECP256K1_SECRET_KEY_SIZE,
        _0
    )]
    InvalidSecretKeyLength(usize),

    /// Uncompressed keys are 64 bytes (or 65 with the 0x04 tag), compressed keys 33
    #[error(
        "Invalid public key length: expected {} bytes, got {}",
        SECP256K1_PUBLIC_KEY_SIZE,
        _0
    )]
    InvalidPublicKeyLength(usize),

    #[error(
        "Invalid signature length: expected {} or {}, got {}",
        SECP256K1_SIGNATURE_SIZE,
        RECOVERABLE_SIGNATURE_SIZE,
        _0
    )]
    InvalidSignatureLength(usize),

    /// Scalar is zero or not below the curve order
    #[error("Failed to parse secret key")]
    InvalidSecretKey,

    /// Point is not on the curve
    #[error("Failed to parse public key")]
    InvalidPublicKey,

    #[error("Failed to parse signature")]
    InvalidSignature,

    #[error("Invalid recovery id: {0}")]
    InvalidRecoveryId(u8),

    #[error("Signing failed")]
    SigningFailed,

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Public key recovery failed")]
    RecoveryFailed,
}
