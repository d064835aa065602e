//! Error types for the discovery protocol.

use discmap_common::crypto::CryptoError;
use discmap_common::rlp::ReaderError;
use std::io::Error as IoError;
use std::net::AddrParseError;
use thiserror::Error;

/// Coarse classification of a [`DiscoveryError`].
///
/// Callers decide retries and bookkeeping on the kind, never on the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed bytes or text: not a record, not a packet.
    Decode,
    /// Well formed but untrusted: bad signature, unknown scheme, expired.
    Validation,
    /// Socket or database failure.
    Transport,
    /// No reply in time.
    Timeout,
    /// The transport was shut down while waiting.
    Closed,
    /// Invalid local settings.
    Config,
}

/// Error type for discovery protocol operations.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Address parsing error.
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    /// Message or record rlp error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] ReaderError),

    /// Invalid enode URL.
    #[error("Invalid enode URL: {0}")]
    InvalidUrl(String),

    #[error("Empty node record")]
    EmptyRecord,

    #[error("Invalid record encoding: {0}")]
    InvalidEncoding(String),

    #[error("Record too large: {0} bytes exceeds maximum {1}")]
    RecordTooLarge(usize, usize),

    #[error("Duplicate record key: {0}")]
    DuplicateKey(String),

    #[error("Record key {0} is out of order after {1}")]
    UnsortedKeys(String, String),

    #[error("Invalid value for record key {0}: {1}")]
    InvalidAttribute(String, String),

    #[error("Record has no identity scheme")]
    MissingIdentityScheme,

    #[error("Unknown identity scheme: {0}")]
    UnknownIdentityScheme(String),

    /// Key material failed to parse.
    #[error("Invalid key: {0}")]
    Crypto(#[from] CryptoError),

    /// Signature verification failed.
    #[error("Signature verification failed")]
    InvalidSignature,

    /// Invalid node ID.
    #[error("Invalid node ID: expected {0}, got {1}")]
    InvalidNodeId(String, String),

    /// Invalid message type.
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    /// Message has expired.
    #[error("Message expired: expiration {0} is before {1}")]
    MessageExpired(u64, u64),

    /// Invalid packet size.
    #[error("Invalid packet size: expected at least {0} bytes, got {1}")]
    InvalidPacketSize(usize, usize),

    #[error("Packet hash mismatch")]
    HashMismatch,

    /// Neighbor entry that cannot be contacted.
    #[error("Unusable node endpoint: {0}")]
    InvalidEndpoint(String),

    /// Packet too large.
    #[error("Packet too large: {0} bytes exceeds maximum {1}")]
    PacketTooLarge(usize, usize),

    /// Socket bind error.
    #[error("Failed to bind UDP socket on {0}: {1}")]
    BindFailed(String, IoError),

    #[error("Node database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Discovery transport closed")]
    Closed,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl DiscoveryError {
    pub fn kind(&self) -> ErrorKind {
        use DiscoveryError::*;

        match self {
            InvalidAddress(_)
            | Serialization(_)
            | InvalidUrl(_)
            | EmptyRecord
            | InvalidEncoding(_)
            | RecordTooLarge(..)
            | DuplicateKey(_)
            | UnsortedKeys(..)
            | InvalidAttribute(..)
            | InvalidMessageType(_)
            | InvalidPacketSize(..)
            | HashMismatch => ErrorKind::Decode,
            MissingIdentityScheme
            | UnknownIdentityScheme(_)
            | Crypto(_)
            | InvalidSignature
            | InvalidNodeId(..)
            | MessageExpired(..)
            | InvalidEndpoint(_) => ErrorKind::Validation,
            Io(_) | PacketTooLarge(..) | BindFailed(..) | Database(_) => ErrorKind::Transport,
            Timeout(_) => ErrorKind::Timeout,
            Closed => ErrorKind::Closed,
            ConfigError(_) => ErrorKind::Config,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(DiscoveryError::EmptyRecord.kind(), ErrorKind::Decode);
        assert_eq!(
            DiscoveryError::Serialization(ReaderError::NonCanonical).kind(),
            ErrorKind::Decode
        );
        assert_eq!(DiscoveryError::InvalidSignature.kind(), ErrorKind::Validation);
        assert_eq!(
            DiscoveryError::Crypto(CryptoError::InvalidPublicKey).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            DiscoveryError::Timeout("127.0.0.1:30303".into()).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(DiscoveryError::Closed.kind(), ErrorKind::Closed);
        assert!(DiscoveryError::Timeout(String::new()).is_timeout());
        assert!(!DiscoveryError::InvalidSignature.is_timeout());
    }
}
