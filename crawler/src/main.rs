use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use std::net::SocketAddr;
use std::sync::Arc;

use discmap_crawler::config::CrawlConfig;
use discmap_crawler::discovery::NodeDb;
use discmap_crawler::registry::{
    load_registry, save_registry, RegistryMerge, UdpSessionFactory,
};

#[tokio::main]
async fn main() -> Result<()> {
    let config = CrawlConfig::parse();

    let level = log::LevelFilter::from(config.verbosity).to_string();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut registry = load_registry(&config.jsonpath)
        .with_context(|| format!("Failed to load registry {}", config.jsonpath.display()))?;
    info!(
        "Loaded {} entries from {}",
        registry.len(),
        config.jsonpath.display()
    );

    let node_db = NodeDb::open(config.discovery.node_db.as_deref())
        .context("Failed to open node database")?;

    let mut merge_config = config.merge_config();
    // Sessions of a fixed port cannot coexist
    let fixed_port = config
        .discovery
        .get_bind_address()
        .parse::<SocketAddr>()
        .is_ok_and(|addr| addr.port() != 0);
    if fixed_port && merge_config.workers > 1 {
        warn!("Bind address has a fixed port, crawling one entry at a time");
        merge_config.workers = 1;
    }

    let factory = UdpSessionFactory::new(config.discovery.clone(), Arc::new(node_db));
    let merge = RegistryMerge::new(factory, merge_config);
    let summary = merge
        .run(&mut registry)
        .await
        .context("Crawl aborted")?;

    info!(
        "Processed {} entries: {} responsive, {} unreachable, {} neighbors found",
        summary.processed, summary.responsive, summary.unreachable, summary.neighbors_found
    );
    info!(
        "Failures: {} decode, {} validation, {} transport",
        summary.decode_failures, summary.validation_failures, summary.transport_failures
    );

    save_registry(&config.writefile, &registry)
        .with_context(|| format!("Failed to write registry {}", config.writefile.display()))?;
    info!("Wrote {}", config.writefile.display());

    Ok(())
}
