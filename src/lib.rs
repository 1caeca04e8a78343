//! # keylens - Large-Key Analysis and Safe Command Execution for Redis
//!
//! keylens connects to a Redis deployment (single instance, cluster, or a
//! sentinel-managed master) and answers operational questions about it:
//! which keys are large, what a given key holds, how the logical databases
//! and cluster nodes look. It also runs ad-hoc commands behind a
//! dangerous-command gate.
//!
//! ## Features
//!
//! - **Non-blocking scans**: cursor-based `SCAN`, fanned out across every
//!   shard of a cluster, with a global cap on keys visited
//! - **Per-type sizing**: byte length for strings, element counts for
//!   collections, optional `MEMORY USAGE`
//! - **Safety gate**: configurable dangerous commands are rejected, or run
//!   with a warning when explicitly enabled
//! - **Bounded output**: replies are reshaped into display-safe JSON with
//!   sampling for long lists, large maps and long strings
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                               keylens                                   │
//! │                                                                         │
//! │  ┌──────────────────┐   ┌──────────────────┐   ┌──────────────────┐     │
//! │  │ LargeKeyAnalyzer │   │ CommandExecutor  │   │ Database/Cluster │     │
//! │  │  KeyScanner      │   │  CommandGate     │   │ Admin, ServerInfo│     │
//! │  │  KeyEstimator    │   │  format_reply    │   │                  │     │
//! │  └────────┬─────────┘   └────────┬─────────┘   └────────┬─────────┘     │
//! │           └──────────────────────┼──────────────────────┘               │
//! │                                  ▼                                      │
//! │                     ┌──────────────────────────┐                        │
//! │                     │   dyn Keyspace           │                        │
//! │                     │ single | cluster | sentinel                       │
//! │                     └────────────┬─────────────┘                        │
//! │                                  ▼                                      │
//! │                     ┌──────────────────────────┐                        │
//! │                     │ RESP codec (protocol)    │                        │
//! │                     └──────────────────────────┘                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use keylens::analysis::{AnalyzerOptions, LargeKeyAnalyzer};
//! use keylens::config::Settings;
//! use keylens::connection;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings::load(None)?;
//!     let keyspace = connection::connect(&settings).await?;
//!
//!     let analyzer = LargeKeyAnalyzer::new(keyspace, AnalyzerOptions::from(&settings.analysis));
//!     let report = analyzer.analyze("user:*", Some(10_000), true).await?;
//!     println!("{} large keys", report.large_keys_found);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: RESP parser, command encoding and the [`Reply`] type
//! - [`connection`]: the [`Keyspace`] trait and its topology implementations
//! - [`analysis`]: scanner, estimator and the large-key analysis engine
//! - [`commands`]: safety gate, executor and reply formatting
//! - [`admin`]: database, cluster and server-info operations
//! - [`config`]: settings from TOML and the environment
//! - [`humanize`]: byte and duration rendering

pub mod admin;
pub mod analysis;
pub mod commands;
pub mod config;
pub mod connection;
pub mod humanize;
pub mod protocol;

// Re-export commonly used types for convenience
pub use analysis::{AnalysisReport, KeyRecord, LargeKeyAnalyzer};
pub use commands::{CommandExecutor, CommandGate, CommandOutcome};
pub use config::Settings;
pub use connection::{connect, Keyspace, KeyspaceError, TopologyMode};
pub use protocol::{ParseError, Reply, RespParser, RespValue};

/// Version of keylens
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
