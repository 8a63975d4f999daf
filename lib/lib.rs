pub mod accounts;
pub mod build_info;
pub mod cli;
pub mod coalescer;
pub mod commands;
pub mod config;
pub mod db;
pub mod graph_client;
pub mod insights;
pub mod logging;
pub mod orchestrator;
pub mod redaction;
pub mod server;
pub mod snapshots;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;
