//! Configuration for the discovery transport and lookups.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use discmap_common::crypto::WrappedSecp256k1Secret;

use super::candidates::DEFAULT_BUCKET_SIZE;
use super::error::DiscoveryResult;
use super::identity::{parse_external_address, ExternalAddress, NodeIdentity};
use super::lookup::{
    LookupConfig, DEFAULT_FAN_OUT, DEFAULT_MAX_RETRIES, DEFAULT_MAX_ROUNDS,
    DEFAULT_QUERY_TIMEOUT,
};

/// Default bind address: any interface, ephemeral port.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:0";

const fn default_bucket_size() -> usize {
    DEFAULT_BUCKET_SIZE
}

const fn default_fan_out() -> usize {
    DEFAULT_FAN_OUT
}

const fn default_query_timeout_ms() -> u64 {
    DEFAULT_QUERY_TIMEOUT.as_millis() as u64
}

const fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}

const fn default_max_rounds() -> usize {
    DEFAULT_MAX_ROUNDS
}

#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Private key for the crawler identity (hex format, 32 bytes).
    ///
    /// If not provided, a new key is generated on every run.
    #[clap(name = "discovery-private-key", long, env = "DISCOVERY_PRIVATE_KEY")]
    #[serde(default)]
    pub private_key: Option<WrappedSecp256k1Secret>,

    /// Address advertised to peers, as `IP` or `IP:PORT`.
    #[clap(name = "discovery-external-address", long)]
    #[serde(default)]
    pub external_address: Option<String>,

    /// Directory of the node database. Temporary when not set.
    #[clap(name = "discovery-node-db", long)]
    #[serde(default)]
    pub node_db: Option<PathBuf>,

    /// Bind address for the discovery UDP socket.
    ///
    /// If not specified, binds to 0.0.0.0 on an ephemeral port.
    #[clap(name = "discovery-bind-address", long)]
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Number of closest nodes kept per lookup (Kademlia k parameter).
    #[clap(name = "discovery-bucket-size", long, default_value_t = default_bucket_size())]
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,

    /// Concurrent FINDNODE queries per lookup round.
    #[clap(name = "discovery-fan-out", long, default_value_t = default_fan_out())]
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,

    /// Time to wait for a reply, in milliseconds.
    #[clap(name = "discovery-query-timeout-ms", long, default_value_t = default_query_timeout_ms())]
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,

    /// Extra attempts after a query timed out.
    #[clap(name = "discovery-max-retries", long, default_value_t = default_max_retries())]
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Maximum lookup rounds, bootstrap round included.
    #[clap(name = "discovery-max-rounds", long, default_value_t = default_max_rounds())]
    #[serde(default = "default_max_rounds")]
    pub max_rounds: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            external_address: None,
            node_db: None,
            bind_address: None,
            bucket_size: DEFAULT_BUCKET_SIZE,
            fan_out: DEFAULT_FAN_OUT,
            query_timeout_ms: default_query_timeout_ms(),
            max_retries: DEFAULT_MAX_RETRIES,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

impl DiscoveryConfig {
    /// Get the bind address for the UDP socket.
    pub fn get_bind_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string())
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn lookup_config(&self) -> LookupConfig {
        LookupConfig {
            bucket_size: self.bucket_size.max(1),
            fan_out: self.fan_out.max(1),
            query_timeout: self.query_timeout(),
            max_retries: self.max_retries,
            max_rounds: self.max_rounds.max(1),
        }
    }

    pub fn external_address(&self) -> DiscoveryResult<Option<ExternalAddress>> {
        self.external_address
            .as_deref()
            .map(parse_external_address)
            .transpose()
    }

    /// Identity from the configured key, or a fresh one.
    pub fn identity(&self) -> DiscoveryResult<NodeIdentity> {
        match &self.private_key {
            Some(secret) => NodeIdentity::from_secret(secret.inner()),
            None => Ok(NodeIdentity::generate()),
        }
    }
}
