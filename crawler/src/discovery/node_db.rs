//! Persistent per-peer bookkeeping.
//!
//! Keeps the local record sequence number and, per remote node, the last
//! PING received, the last PONG received and the count of consecutive failed
//! FINDNODE exchanges. Without a path the database lives in a temporary
//! directory removed on drop.

use log::trace;
use sled::{Db, Tree};
use std::path::Path;

use discmap_common::time::{get_current_time_in_seconds, TimestampSeconds};

use super::error::DiscoveryResult;
use super::identity::NodeId;

const LOCAL_TREE: &str = "local";
const PEERS_TREE: &str = "peers";

const LOCAL_SEQ: &[u8] = b"seq";

const FIELD_LAST_PING: u8 = 0;
const FIELD_LAST_PONG: u8 = 1;
const FIELD_FIND_FAILS: u8 = 2;

pub struct NodeDb {
    db: Db,
    local: Tree,
    peers: Tree,
}

impl NodeDb {
    /// Open the database at `path`, or a temporary one.
    pub fn open(path: Option<&Path>) -> DiscoveryResult<Self> {
        let config = match path {
            Some(path) => sled::Config::new().path(path),
            None => sled::Config::new().temporary(true),
        };
        let db = config.open()?;
        let local = db.open_tree(LOCAL_TREE)?;
        let peers = db.open_tree(PEERS_TREE)?;
        Ok(Self { db, local, peers })
    }

    pub fn temporary() -> DiscoveryResult<Self> {
        Self::open(None)
    }

    /// Bump and return the sequence number for the next record signed by
    /// `local`. Starts at 1.
    pub fn next_local_seq(&self, local: &NodeId) -> DiscoveryResult<u64> {
        let mut key = LOCAL_SEQ.to_vec();
        key.extend_from_slice(local.as_bytes());
        let value = self.local.update_and_fetch(key, |old| {
            let next = old.and_then(decode_u64).unwrap_or(0).saturating_add(1);
            Some(next.to_be_bytes().to_vec())
        })?;
        Ok(value.as_deref().and_then(decode_u64).unwrap_or(1))
    }

    fn peer_key(local: &NodeId, remote: &NodeId, field: u8) -> Vec<u8> {
        let mut key = Vec::with_capacity(65);
        key.extend_from_slice(local.as_bytes());
        key.extend_from_slice(remote.as_bytes());
        key.push(field);
        key
    }

    fn load_u64(&self, key: &[u8]) -> DiscoveryResult<Option<u64>> {
        Ok(self.peers.get(key)?.as_deref().and_then(decode_u64))
    }

    fn store_u64(&self, key: &[u8], value: u64) -> DiscoveryResult<()> {
        self.peers.insert(key, &value.to_be_bytes())?;
        Ok(())
    }

    pub fn last_ping_received(
        &self,
        local: &NodeId,
        remote: &NodeId,
    ) -> DiscoveryResult<Option<TimestampSeconds>> {
        self.load_u64(&Self::peer_key(local, remote, FIELD_LAST_PING))
    }

    pub fn update_last_ping_received(
        &self,
        local: &NodeId,
        remote: &NodeId,
        at: TimestampSeconds,
    ) -> DiscoveryResult<()> {
        trace!("PING from {} at {}", remote, at);
        self.store_u64(&Self::peer_key(local, remote, FIELD_LAST_PING), at)
    }

    pub fn last_pong_received(
        &self,
        local: &NodeId,
        remote: &NodeId,
    ) -> DiscoveryResult<Option<TimestampSeconds>> {
        self.load_u64(&Self::peer_key(local, remote, FIELD_LAST_PONG))
    }

    pub fn update_last_pong_received(
        &self,
        local: &NodeId,
        remote: &NodeId,
        at: TimestampSeconds,
    ) -> DiscoveryResult<()> {
        trace!("PONG from {} at {}", remote, at);
        self.store_u64(&Self::peer_key(local, remote, FIELD_LAST_PONG), at)
    }

    pub fn find_fails(&self, local: &NodeId, remote: &NodeId) -> DiscoveryResult<u64> {
        Ok(self
            .load_u64(&Self::peer_key(local, remote, FIELD_FIND_FAILS))?
            .unwrap_or(0))
    }

    pub fn update_find_fails(
        &self,
        local: &NodeId,
        remote: &NodeId,
        fails: u64,
    ) -> DiscoveryResult<()> {
        self.store_u64(&Self::peer_key(local, remote, FIELD_FIND_FAILS), fails)
    }

    /// Whether `remote` pinged us within `window` seconds.
    pub fn is_bonded(
        &self,
        local: &NodeId,
        remote: &NodeId,
        window: TimestampSeconds,
    ) -> DiscoveryResult<bool> {
        let now = get_current_time_in_seconds();
        Ok(self
            .last_ping_received(local, remote)?
            .is_some_and(|at| now.saturating_sub(at) < window))
    }

    pub fn flush(&self) -> DiscoveryResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_u64(bytes: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}
