//! ChainGuard agent library surface.
//!
//! The agent watches configured networks for freshly deployed contracts,
//! runs each through an AI-assisted vulnerability scan, pins the full report
//! to content-addressed storage, mirrors a severity summary into the on-chain
//! security registry, and raises alerts for severe findings. The pipeline is
//! built around one rule: a contract with bytecode always reaches a terminal
//! scan result, no matter which collaborators are down.

pub mod alerts;
pub mod analyzer;
pub mod error;
pub mod explorer;
pub mod orchestrator;
pub mod report_store;
pub mod reporter;
pub mod scan_queue;
pub mod storage;
pub mod utils;
pub mod watcher;

pub mod config {
    pub mod chains;
}
