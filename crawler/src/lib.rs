//! Crawler mapping the discovery neighborhoods of a registry of nodes.
//!
//! [`discovery`] holds the protocol side: node records, the discv4 wire
//! format, the UDP transport and the lookup engine. [`registry`] runs a
//! lookup per registry entry and folds the results back in.

pub mod config;
pub mod discovery;
pub mod registry;
