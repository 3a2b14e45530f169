//! Distributed TCP connectivity probe.
//!
//! Every node runs a probe server and periodically probes each peer found
//! through SRV discovery, exporting kernel TCP diagnostics for every probe
//! as Prometheus metrics.

pub mod config;
pub mod diagnostics;
pub mod discovery;
pub mod export;
pub mod fanout;
pub mod identity;
pub mod pacing;
pub mod probe;
pub mod protocol;
pub mod server;
