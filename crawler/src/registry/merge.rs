//! One crawl over the registry.
//!
//! Every entry is looked up with its own node as both the bootstrap node and
//! the target, which yields the neighbors that node reports. Entries run
//! concurrently, each in its own discovery session, and a single writer folds
//! the outcomes back into the registry.

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use std::sync::Arc;

use super::{NeighborMode, Registry, RegistryEntry, RegistryError};
use crate::discovery::{
    lookup, DiscoveryConfig, DiscoveryResult, DiscoveryRpc, ErrorKind, LookupConfig, Node,
    NodeDb, NodeRecord, UdpTransport,
};

/// Default number of entries crawled concurrently.
pub const DEFAULT_WORKERS: usize = 8;

/// Opens discovery sessions, one per crawled entry.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    type Session: DiscoveryRpc;

    async fn open_session(&self) -> DiscoveryResult<Self::Session>;

    /// Release a session and its socket.
    async fn close_session(&self, session: Self::Session) {
        drop(session);
    }
}

/// Sessions over real UDP sockets.
pub struct UdpSessionFactory {
    config: DiscoveryConfig,
    node_db: Arc<NodeDb>,
}

impl UdpSessionFactory {
    pub fn new(config: DiscoveryConfig, node_db: Arc<NodeDb>) -> Self {
        Self { config, node_db }
    }
}

#[async_trait]
impl SessionFactory for UdpSessionFactory {
    type Session = UdpTransport;

    async fn open_session(&self) -> DiscoveryResult<UdpTransport> {
        // A fresh identity per session unless a key was configured
        let identity = self.config.identity()?;
        UdpTransport::open(&self.config, identity, Arc::clone(&self.node_db)).await
    }

    async fn close_session(&self, session: UdpTransport) {
        session.close().await;
    }
}

#[derive(Debug, Clone)]
pub struct MergeConfig {
    pub workers: usize,
    pub neighbor_mode: NeighborMode,
    /// Ask responsive nodes for their current record.
    pub refresh_records: bool,
    pub lookup: LookupConfig,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            neighbor_mode: NeighborMode::default(),
            refresh_records: true,
            lookup: LookupConfig::default(),
        }
    }
}

/// What happened to one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStatus {
    /// The node answered. `refreshed` is set when a newer record replaced
    /// the stored one.
    Responsive { neighbors: usize, refreshed: bool },
    /// The node never produced a valid answer.
    Unreachable(ErrorKind),
    /// The stored record is not a record. Entry left untouched.
    DecodeFailed,
    /// The stored record does not verify. Entry left untouched.
    ValidationFailed,
    /// No session could be opened. Entry left untouched.
    SessionFailed,
}

#[derive(Debug, Clone)]
pub struct EntryReport {
    pub key: String,
    pub status: EntryStatus,
    pub rounds: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub responsive: usize,
    pub unreachable: usize,
    pub decode_failures: usize,
    pub validation_failures: usize,
    pub transport_failures: usize,
    pub neighbors_found: usize,
    pub reports: Vec<EntryReport>,
}

impl RunSummary {
    fn record(&mut self, report: EntryReport) {
        self.processed += 1;
        match &report.status {
            EntryStatus::Responsive { neighbors, .. } => {
                self.responsive += 1;
                self.neighbors_found += neighbors;
            }
            EntryStatus::Unreachable(kind) => {
                self.unreachable += 1;
                match kind {
                    ErrorKind::Validation => self.validation_failures += 1,
                    ErrorKind::Transport => self.transport_failures += 1,
                    _ => {}
                }
            }
            EntryStatus::DecodeFailed => self.decode_failures += 1,
            EntryStatus::ValidationFailed => self.validation_failures += 1,
            EntryStatus::SessionFailed => self.transport_failures += 1,
        }
        self.reports.push(report);
    }

    pub fn report(&self, key: &str) -> Option<&EntryReport> {
        self.reports.iter().find(|r| r.key == key)
    }
}

enum EntryUpdate {
    Responded {
        neighbors: Vec<Node>,
        record: Option<NodeRecord>,
    },
    Unreachable,
}

struct EntryOutcome {
    report: EntryReport,
    update: Option<EntryUpdate>,
}

impl EntryOutcome {
    fn untouched(key: String, status: EntryStatus, error: String) -> Self {
        Self {
            report: EntryReport {
                key,
                status,
                rounds: 0,
                error: Some(error),
            },
            update: None,
        }
    }
}

/// Current time at second precision, as stored in the registry.
pub fn truncated_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

/// Union `fresh` into `stored`, by node id. The higher sequence number wins.
pub fn merge_neighbors(stored: &mut Vec<Node>, fresh: Vec<Node>) {
    for node in fresh {
        match stored.iter_mut().find(|n| n.id() == node.id()) {
            Some(existing) => {
                if node.seq() > existing.seq() {
                    *existing = node;
                }
            }
            None => stored.push(node),
        }
    }
}

fn apply_update(
    entry: &mut RegistryEntry,
    update: EntryUpdate,
    now: DateTime<Utc>,
    mode: NeighborMode,
) {
    entry.last_check = Some(now);
    match update {
        EntryUpdate::Responded { neighbors, record } => {
            entry.score += 1;
            if !neighbors.is_empty() {
                entry.first_response.get_or_insert(now);
                entry.last_response = Some(now);
            }
            match mode {
                NeighborMode::Replace => entry.neighbors = neighbors,
                NeighborMode::Append => merge_neighbors(&mut entry.neighbors, neighbors),
            }
            if let Some(record) = record {
                entry.seq = record.seq();
                entry.record = record.to_text();
            }
        }
        EntryUpdate::Unreachable => {
            entry.score /= 2;
            // No answer is an empty crawl. Append keeps what earlier runs found.
            if mode == NeighborMode::Replace {
                entry.neighbors.clear();
            }
        }
    }
}

pub struct RegistryMerge<F> {
    factory: F,
    config: MergeConfig,
}

impl<F> RegistryMerge<F>
where
    F: SessionFactory,
{
    pub fn new(factory: F, config: MergeConfig) -> Self {
        Self { factory, config }
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    async fn refresh_record(&self, session: &F::Session, target: &Node) -> Option<NodeRecord> {
        match session.request_record(target).await {
            Ok(record) => {
                let same_node = record.node_id().ok().as_ref() == Some(target.id());
                (same_node && record.seq() > target.seq()).then_some(record)
            }
            Err(e) => {
                debug!("Record request to {} failed: {}", target.id(), e);
                None
            }
        }
    }

    async fn check_entry(&self, key: String, record: String) -> EntryOutcome {
        let target = match Node::parse(&record) {
            Ok(node) => node,
            Err(e) => {
                warn!("Skipping entry {}: {}", key, e);
                let status = match e.kind() {
                    ErrorKind::Decode => EntryStatus::DecodeFailed,
                    _ => EntryStatus::ValidationFailed,
                };
                return EntryOutcome::untouched(key, status, e.to_string());
            }
        };

        let session = match self.factory.open_session().await {
            Ok(session) => session,
            Err(e) => {
                warn!("No discovery session for entry {}: {}", key, e);
                return EntryOutcome::untouched(key, EntryStatus::SessionFailed, e.to_string());
            }
        };

        let result = lookup(&session, &target, &target, &self.config.lookup).await;
        if !result.is_reachable() {
            self.factory.close_session(session).await;
            let kind = result.bootstrap_error.unwrap_or(ErrorKind::Timeout);
            return EntryOutcome {
                report: EntryReport {
                    key,
                    status: EntryStatus::Unreachable(kind),
                    rounds: result.rounds,
                    error: None,
                },
                update: Some(EntryUpdate::Unreachable),
            };
        }

        let fresh = if self.config.refresh_records {
            self.refresh_record(&session, &target).await
        } else {
            None
        };
        self.factory.close_session(session).await;

        EntryOutcome {
            report: EntryReport {
                key,
                status: EntryStatus::Responsive {
                    neighbors: result.nodes.len(),
                    refreshed: fresh.is_some(),
                },
                rounds: result.rounds,
                error: None,
            },
            update: Some(EntryUpdate::Responded {
                neighbors: result.nodes,
                record: fresh,
            }),
        }
    }

    /// Crawl every entry and fold the results into `registry`.
    ///
    /// Fails only when no discovery session can be opened at all.
    pub async fn run(&self, registry: &mut Registry) -> Result<RunSummary, RegistryError> {
        let preflight = self
            .factory
            .open_session()
            .await
            .map_err(RegistryError::Transport)?;
        self.factory.close_session(preflight).await;

        let jobs: Vec<(String, String)> = registry
            .iter()
            .map(|(key, entry)| (key.clone(), entry.record.clone()))
            .collect();
        info!(
            "Crawling {} entries with {} workers",
            jobs.len(),
            self.config.workers.max(1)
        );

        let mut outcomes = stream::iter(jobs)
            .map(|(key, record)| self.check_entry(key, record))
            .buffer_unordered(self.config.workers.max(1));

        let mut summary = RunSummary::default();
        while let Some(outcome) = outcomes.next().await {
            let EntryOutcome { report, update } = outcome;
            if let Some(update) = update {
                if let Some(entry) = registry.get_mut(&report.key) {
                    apply_update(entry, update, truncated_now(), self.config.neighbor_mode);
                }
            }

            if let EntryStatus::Responsive { neighbors, .. } = report.status {
                info!(
                    "Runs: {}, {} found {} neighbors",
                    summary.processed + 1,
                    report.key,
                    neighbors
                );
            } else {
                info!(
                    "Runs: {}, {} {:?}",
                    summary.processed + 1,
                    report.key,
                    report.status
                );
            }
            summary.record(report);
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::RecordBuilder;
    use discmap_common::crypto::Secp256k1KeyPair;

    fn signed_node(keypair: &Secp256k1KeyPair, seq: u64) -> Node {
        let record = RecordBuilder::new()
            .seq(seq)
            .ip("10.0.0.1".parse().unwrap())
            .udp(30303)
            .build(keypair)
            .unwrap();
        Node::from_record(record).unwrap()
    }

    #[test]
    fn test_merge_neighbors_dedup() {
        let a = Secp256k1KeyPair::generate();
        let b = Secp256k1KeyPair::generate();

        let mut stored = vec![signed_node(&a, 1)];
        merge_neighbors(&mut stored, vec![signed_node(&a, 4), signed_node(&b, 1)]);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].seq(), 4);

        merge_neighbors(&mut stored, vec![signed_node(&a, 2)]);
        assert_eq!(stored[0].seq(), 4);
    }

    #[test]
    fn test_apply_responsive() {
        let now = truncated_now();
        let neighbor = signed_node(&Secp256k1KeyPair::generate(), 1);
        let mut entry = RegistryEntry::new("enr:x");

        apply_update(
            &mut entry,
            EntryUpdate::Responded {
                neighbors: Vec::new(),
                record: None,
            },
            now,
            NeighborMode::Replace,
        );
        assert_eq!(entry.score, 1);
        assert_eq!(entry.last_check, Some(now));
        assert_eq!(entry.first_response, None);
        assert_eq!(entry.last_response, None);

        apply_update(
            &mut entry,
            EntryUpdate::Responded {
                neighbors: vec![neighbor.clone()],
                record: None,
            },
            now,
            NeighborMode::Replace,
        );
        assert_eq!(entry.score, 2);
        assert_eq!(entry.first_response, Some(now));
        assert_eq!(entry.last_response, Some(now));
        assert_eq!(entry.neighbors, vec![neighbor]);
    }

    #[test]
    fn test_first_response_kept() {
        let earlier = truncated_now() - chrono::Duration::days(3);
        let now = truncated_now();
        let mut entry = RegistryEntry {
            first_response: Some(earlier),
            ..RegistryEntry::new("enr:x")
        };

        apply_update(
            &mut entry,
            EntryUpdate::Responded {
                neighbors: vec![signed_node(&Secp256k1KeyPair::generate(), 1)],
                record: None,
            },
            now,
            NeighborMode::Append,
        );
        assert_eq!(entry.first_response, Some(earlier));
        assert_eq!(entry.last_response, Some(now));
    }

    #[test]
    fn test_apply_unreachable() {
        let now = truncated_now();
        let neighbor = signed_node(&Secp256k1KeyPair::generate(), 1);
        let mut entry = RegistryEntry {
            score: 5,
            neighbors: vec![neighbor.clone()],
            ..RegistryEntry::new("enr:x")
        };

        apply_update(&mut entry, EntryUpdate::Unreachable, now, NeighborMode::Append);
        assert_eq!(entry.score, 2);
        assert_eq!(entry.last_check, Some(now));
        assert_eq!(entry.neighbors, vec![neighbor]);

        apply_update(&mut entry, EntryUpdate::Unreachable, now, NeighborMode::Replace);
        assert_eq!(entry.score, 1);
        assert!(entry.neighbors.is_empty());
        assert_eq!(entry.last_response, None);
    }

    #[test]
    fn test_apply_refreshed_record() {
        let keypair = Secp256k1KeyPair::generate();
        let fresh = signed_node(&keypair, 9);
        let mut entry = RegistryEntry::new(signed_node(&keypair, 1).to_text());

        apply_update(
            &mut entry,
            EntryUpdate::Responded {
                neighbors: Vec::new(),
                record: fresh.record().cloned(),
            },
            truncated_now(),
            NeighborMode::Replace,
        );
        assert_eq!(entry.seq, 9);
        assert_eq!(entry.record, fresh.to_text());
    }

    #[test]
    fn test_summary_counts() {
        let mut summary = RunSummary::default();
        let report = |key: &str, status| EntryReport {
            key: key.to_string(),
            status,
            rounds: 1,
            error: None,
        };

        summary.record(report(
            "a",
            EntryStatus::Responsive {
                neighbors: 3,
                refreshed: false,
            },
        ));
        summary.record(report("b", EntryStatus::Unreachable(ErrorKind::Timeout)));
        summary.record(report("c", EntryStatus::Unreachable(ErrorKind::Validation)));
        summary.record(report("d", EntryStatus::DecodeFailed));
        summary.record(report("e", EntryStatus::SessionFailed));

        assert_eq!(summary.processed, 5);
        assert_eq!(summary.responsive, 1);
        assert_eq!(summary.unreachable, 2);
        assert_eq!(summary.neighbors_found, 3);
        assert_eq!(summary.validation_failures, 1);
        assert_eq!(summary.decode_failures, 1);
        assert_eq!(summary.transport_failures, 1);
        assert_eq!(summary.report("d").unwrap().status, EntryStatus::DecodeFailed);
    }
}
