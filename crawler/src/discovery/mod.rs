//! Node discovery (discv4) client side.
//!
//! Decodes and verifies node records, speaks the discv4 wire protocol over
//! UDP and runs iterative Kademlia lookups to find the neighbors of a node.
//!
//! ## Message Types
//!
//! | Type | ID | Description |
//! |------|-----|-------------|
//! | PING | 0x01 | Liveness check, starts bonding |
//! | PONG | 0x02 | Response to PING |
//! | FINDNODE | 0x03 | Request nodes close to a target key |
//! | NEIGHBORS | 0x04 | Response with up to 12 nodes |
//! | ENRREQUEST | 0x05 | Request the current node record |
//! | ENRRESPONSE | 0x06 | Response with the signed record |
//!
//! ## Node Formats
//!
//! ```text
//! enr:<base64url record>
//! enode://<public_key_hex>@<ip>:<tcp>?discport=<udp>
//! ```
//!
//! ## Constants
//!
//! - Max record size: 300 bytes
//! - Max packet size: 1280 bytes
//! - Message expiration: 20 seconds
//! - Bucket size: 16 nodes
//! - Bond expiration: 12 hours

pub mod candidates;
pub mod config;
pub mod error;
pub mod identity;
pub mod lookup;
pub mod messages;
pub mod node;
pub mod node_db;
pub mod record;
pub mod transport;
pub mod url;

pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryResult, ErrorKind};
pub use identity::{LocalNode, NodeId, NodeIdentity};
pub use lookup::{lookup, DiscoveryRpc, LookupConfig, LookupResult, LookupStatus};
pub use messages::{Message, SignedPacket};
pub use node::Node;
pub use node_db::NodeDb;
pub use record::{NodeRecord, RecordBuilder};
pub use transport::UdpTransport;
pub use url::EnodeUrl;
