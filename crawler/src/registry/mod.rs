//! Registry of tracked nodes and their discovered neighbors.
//!
//! The registry is a JSON object keyed by node identity string. Each entry
//! carries the node's record and the bookkeeping of past crawls.

pub mod merge;
pub mod store;

use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use log::debug;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::discovery::{DiscoveryError, Node};

pub use merge::{
    EntryReport, EntryStatus, MergeConfig, RegistryMerge, RunSummary, SessionFactory,
    UdpSessionFactory,
};
pub use store::{load_registry, save_registry};

/// Entries sorted by key.
pub type Registry = BTreeMap<String, RegistryEntry>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    #[serde(default)]
    pub seq: u64,
    /// Node record in any accepted text form.
    #[serde(default)]
    pub record: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default, with = "timestamp")]
    pub first_response: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub last_response: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "deserialize_neighbors")]
    pub neighbors: Vec<Node>,
}

impl RegistryEntry {
    pub fn new(record: impl Into<String>) -> Self {
        Self {
            record: record.into(),
            ..Default::default()
        }
    }
}

/// How a crawl combines fresh neighbors with the stored ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum NeighborMode {
    /// Keep only the neighbors found by the latest crawl.
    #[default]
    Replace,
    /// Union with the stored neighbors.
    Append,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Invalid registry JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Discovery transport unavailable: {0}")]
    Transport(DiscoveryError),
}

// Unparseable neighbors are dropped so one bad string does not reject the file
fn deserialize_neighbors<'de, D>(deserializer: D) -> Result<Vec<Node>, D::Error>
where
    D: Deserializer<'de>,
{
    let values: Option<Vec<String>> = Option::deserialize(deserializer)?;
    Ok(values
        .unwrap_or_default()
        .iter()
        .filter_map(|text| match Node::parse(text) {
            Ok(node) => Some(node),
            Err(e) => {
                debug!("Dropping stored neighbor '{}': {}", text, e);
                None
            }
        })
        .collect())
}

/// RFC 3339 timestamps. Empty, null and year-one values are unset.
mod timestamp {
    use super::*;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(time) => serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        let text = match value.as_deref().map(str::trim) {
            None | Some("") => return Ok(None),
            Some(text) => text,
        };

        let time = DateTime::parse_from_rfc3339(text)
            .map_err(serde::de::Error::custom)?
            .with_timezone(&Utc);
        Ok((time.year() > 1).then_some(time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::RecordBuilder;
    use chrono::TimeZone;
    use discmap_common::crypto::Secp256k1KeyPair;

    fn signed_record() -> String {
        RecordBuilder::new()
            .seq(3)
            .ip("10.0.0.1".parse().unwrap())
            .udp(30303)
            .build(&Secp256k1KeyPair::generate())
            .unwrap()
            .to_text()
    }

    #[test]
    fn test_entry_json_fields() {
        let mut entry = RegistryEntry::new(signed_record());
        entry.seq = 3;
        entry.score = 2;
        entry.last_check = Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["score"], 2);
        assert_eq!(json["firstResponse"], "");
        assert_eq!(json["lastCheck"], "2024-05-01T12:30:00Z");
        assert_eq!(json["neighbors"], serde_json::json!([]));

        let back: RegistryEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_unset_timestamps() {
        let json = serde_json::json!({
            "record": signed_record(),
            "firstResponse": "0001-01-01T00:00:00Z",
            "lastResponse": null,
            "lastCheck": "",
            "neighbors": null,
        });
        let entry: RegistryEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry.first_response, None);
        assert_eq!(entry.last_response, None);
        assert_eq!(entry.last_check, None);
        assert!(entry.neighbors.is_empty());
    }

    #[test]
    fn test_timestamp_with_offset() {
        let json = serde_json::json!({ "lastCheck": "2024-05-01T14:30:00+02:00" });
        let entry: RegistryEntry = serde_json::from_value(json).unwrap();
        assert_eq!(
            entry.last_check,
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_bad_neighbor_dropped() {
        let good = signed_record();
        let json = serde_json::json!({ "neighbors": [good.clone(), "enr:garbage"] });
        let entry: RegistryEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry.neighbors.len(), 1);
        assert_eq!(entry.neighbors[0].to_text(), good);
    }

    #[test]
    fn test_neighbor_mode_names() {
        assert_eq!(
            serde_json::to_string(&NeighborMode::Append).unwrap(),
            "\"append\""
        );
        assert_eq!(NeighborMode::default(), NeighborMode::Replace);
    }
}
