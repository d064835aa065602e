//! Command line configuration of a crawl run.

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::discovery::DiscoveryConfig;
use crate::registry::merge::DEFAULT_WORKERS;
use crate::registry::{MergeConfig, NeighborMode};

pub const DEFAULT_REGISTRY_PATH: &str = "node-list.json";
pub const DEFAULT_OUTPUT_PATH: &str = "finalized-node-list.json";

fn default_jsonpath() -> PathBuf {
    PathBuf::from(DEFAULT_REGISTRY_PATH)
}

fn default_writefile() -> PathBuf {
    PathBuf::from(DEFAULT_OUTPUT_PATH)
}

const fn default_workers() -> usize {
    DEFAULT_WORKERS
}

const fn default_refresh_records() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Parser, Debug, Clone, Serialize, Deserialize)]
#[command(name = "discmap")]
#[command(about = "Crawl a registry of node records and record each node's discovery neighbors")]
#[command(styles = discmap_common::get_cli_styles())]
pub struct CrawlConfig {
    /// Registry file to read.
    #[clap(long, default_value_os_t = default_jsonpath())]
    #[serde(default = "default_jsonpath")]
    pub jsonpath: PathBuf,

    /// File the updated registry is written to.
    #[clap(long, default_value_os_t = default_writefile())]
    #[serde(default = "default_writefile")]
    pub writefile: PathBuf,

    /// Entries crawled concurrently.
    #[clap(long, default_value_t = default_workers())]
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Replace the stored neighbors or add to them.
    #[clap(long, value_enum, default_value_t)]
    #[serde(default)]
    pub neighbor_mode: NeighborMode,

    /// Ask responsive nodes for their latest record.
    #[clap(long, default_value_t = default_refresh_records(), action = clap::ArgAction::Set)]
    #[serde(default = "default_refresh_records")]
    pub refresh_records: bool,

    /// Log level, overridden by RUST_LOG.
    #[clap(long, value_enum, default_value_t)]
    #[serde(default)]
    pub verbosity: LogLevel,

    #[clap(flatten)]
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl CrawlConfig {
    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            workers: self.workers.max(1),
            neighbor_mode: self.neighbor_mode,
            refresh_records: self.refresh_records,
            lookup: self.discovery.lookup_config(),
        }
    }
}
