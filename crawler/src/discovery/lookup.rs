//! Iterative lookup of the nodes closest to a target.
//!
//! The first round asks the bootstrap node alone. Each following round asks
//! up to `fan_out` of the closest unqueried candidates concurrently. Once a
//! round brings no candidate closer than the best one known, a last round
//! asks every remaining unqueried candidate and the lookup ends. The round
//! budget includes the bootstrap round.
//!
//! Only candidates that answered with a correctly signed reply are returned.

use async_trait::async_trait;
use discmap_common::crypto::Secp256k1PublicKey;
use futures::stream::{FuturesUnordered, StreamExt};
use log::{debug, trace};
use std::time::Duration;
use tokio::time::timeout;

use super::candidates::{CandidateSet, DEFAULT_BUCKET_SIZE};
use super::error::{DiscoveryError, DiscoveryResult, ErrorKind};
use super::identity::NodeId;
use super::node::Node;
use super::record::NodeRecord;

/// Number of concurrent queries per round.
pub const DEFAULT_FAN_OUT: usize = 16;

/// Time to wait for a reply.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_millis(500);

/// Extra attempts after a timeout.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Round budget, bootstrap round included.
pub const DEFAULT_MAX_ROUNDS: usize = 8;

// A single attempt may bond before querying, so it is allowed several
// reply timeouts before being cut off.
const ATTEMPT_TIMEOUT_FACTOR: u32 = 4;

/// Requests a lookup needs from the network.
#[async_trait]
pub trait DiscoveryRpc: Send + Sync {
    /// Id of the node issuing requests.
    fn local_id(&self) -> NodeId;

    /// Ask `peer` for the nodes it knows closest to `target`.
    async fn find_node(
        &self,
        peer: &Node,
        target: &Secp256k1PublicKey,
    ) -> DiscoveryResult<Vec<Node>>;

    /// Ask `peer` for its current signed record.
    async fn request_record(&self, peer: &Node) -> DiscoveryResult<NodeRecord>;
}

#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Candidate set capacity and result size.
    pub bucket_size: usize,
    pub fan_out: usize,
    pub query_timeout: Duration,
    pub max_retries: usize,
    pub max_rounds: usize,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            fan_out: DEFAULT_FAN_OUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            max_rounds: DEFAULT_MAX_ROUNDS,
        }
    }
}

impl LookupConfig {
    /// Hard ceiling on one query attempt.
    pub fn attempt_timeout(&self) -> Duration {
        self.query_timeout * ATTEMPT_TIMEOUT_FACTOR
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    /// No closer candidates left to ask.
    Converged,
    /// Stopped by the round budget with candidates still unqueried.
    RoundLimit,
    /// The bootstrap node never answered.
    BootstrapUnreachable,
}

#[derive(Debug, Clone)]
pub struct LookupResult {
    pub status: LookupStatus,
    /// Responsive nodes closest to the target, closest first.
    pub nodes: Vec<Node>,
    pub rounds: usize,
    /// FINDNODE exchanges attempted, retries not counted.
    pub queried: usize,
    pub failed: usize,
    /// Why the bootstrap node was unreachable.
    pub bootstrap_error: Option<ErrorKind>,
}

impl LookupResult {
    pub fn is_reachable(&self) -> bool {
        self.status != LookupStatus::BootstrapUnreachable
    }
}

/// Query `peer`, retrying on timeouts only.
pub async fn query_node<R>(
    rpc: &R,
    peer: &Node,
    target: &Secp256k1PublicKey,
    config: &LookupConfig,
) -> DiscoveryResult<Vec<Node>>
where
    R: DiscoveryRpc + ?Sized,
{
    let mut attempt = 0;
    loop {
        let result = match timeout(config.attempt_timeout(), rpc.find_node(peer, target)).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Timeout(peer.id().to_hex())),
        };

        match result {
            Err(e) if e.is_timeout() && attempt < config.max_retries => {
                attempt += 1;
                trace!("Retrying FINDNODE to {} ({}/{})", peer.id(), attempt, config.max_retries);
            }
            other => return other,
        }
    }
}

fn improves(current: Option<[u8; 32]>, best: Option<[u8; 32]>) -> bool {
    match (current, best) {
        (Some(current), Some(best)) => current < best,
        (Some(_), None) => true,
        _ => false,
    }
}

/// State of one lookup.
pub struct Lookup<'a, R: ?Sized> {
    rpc: &'a R,
    config: &'a LookupConfig,
    target: Secp256k1PublicKey,
    candidates: CandidateSet,
    queried: usize,
    failed: usize,
}

impl<'a, R> Lookup<'a, R>
where
    R: DiscoveryRpc + ?Sized,
{
    pub fn new(rpc: &'a R, target: &Node, config: &'a LookupConfig) -> Self {
        Self {
            rpc,
            config,
            target: *target.public_key(),
            candidates: CandidateSet::new(*target.id(), rpc.local_id(), config.bucket_size),
            queried: 0,
            failed: 0,
        }
    }

    // Offer every node of a reply to the candidate set
    fn merge(&mut self, nodes: Vec<Node>) {
        for node in nodes {
            let result = self.candidates.insert(node);
            trace!("Candidate offered: {:?}", result);
        }
    }

    async fn query_round(&mut self, batch: Vec<Node>) {
        let rpc = self.rpc;
        let config = self.config;
        let target = self.target;

        let mut pending: FuturesUnordered<_> = batch
            .into_iter()
            .map(|peer| async move {
                let result = query_node(rpc, &peer, &target, config).await;
                (peer, result)
            })
            .collect();

        while let Some((peer, result)) = pending.next().await {
            self.queried += 1;
            match result {
                Ok(nodes) => {
                    trace!("{} returned {} nodes", peer.id(), nodes.len());
                    self.candidates.mark_responded(&peer);
                    self.merge(nodes);
                }
                Err(e) => {
                    self.failed += 1;
                    if log::log_enabled!(log::Level::Debug) {
                        debug!("FINDNODE to {} failed: {}", peer.id(), e);
                    }
                    self.candidates.mark_failed(peer.id());
                }
            }
        }
    }

    /// Run the lookup starting from `bootstrap`.
    pub async fn run(mut self, bootstrap: &Node) -> LookupResult {
        let mut rounds = 1;
        self.queried += 1;
        let nodes = match query_node(self.rpc, bootstrap, &self.target, self.config).await {
            Ok(nodes) => nodes,
            Err(e) => {
                debug!("Bootstrap node {} unreachable: {}", bootstrap.id(), e);
                return LookupResult {
                    status: LookupStatus::BootstrapUnreachable,
                    nodes: Vec::new(),
                    rounds,
                    queried: self.queried,
                    failed: 1,
                    bootstrap_error: Some(e.kind()),
                };
            }
        };

        self.candidates.mark_responded(bootstrap);
        self.merge(nodes);

        let mut best = self.candidates.closest_distance();
        let mut final_round = false;
        let mut status = LookupStatus::RoundLimit;
        while rounds < self.config.max_rounds {
            let limit = if final_round {
                usize::MAX
            } else {
                self.config.fan_out.max(1)
            };
            let batch = self.candidates.next_to_query(limit);
            if batch.is_empty() {
                status = LookupStatus::Converged;
                break;
            }

            rounds += 1;
            trace!("Lookup round {} querying {} nodes", rounds, batch.len());
            self.query_round(batch).await;

            if final_round {
                status = LookupStatus::Converged;
                break;
            }

            let current = self.candidates.closest_distance();
            if improves(current, best) {
                best = current;
            } else {
                final_round = true;
            }
        }

        if status == LookupStatus::RoundLimit && !self.candidates.has_pending() {
            status = LookupStatus::Converged;
        }

        LookupResult {
            status,
            nodes: self.candidates.responded(),
            rounds,
            queried: self.queried,
            failed: self.failed,
            bootstrap_error: None,
        }
    }
}

/// Find the nodes closest to `target`, starting from `bootstrap`.
pub async fn lookup<R>(
    rpc: &R,
    bootstrap: &Node,
    target: &Node,
    config: &LookupConfig,
) -> LookupResult
where
    R: DiscoveryRpc + ?Sized,
{
    Lookup::new(rpc, target, config).run(bootstrap).await
}
