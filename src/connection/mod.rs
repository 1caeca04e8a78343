//! Keyspace Connections
//!
//! Everything above this module talks to Redis through the [`Keyspace`]
//! trait: issue a command, issue a group of commands in one round-trip,
//! report the topology, and enumerate shard handles when the deployment is
//! sharded.
//!
//! ## Architecture
//!
//! ```text
//!                    connect(settings)
//!                           │
//!        ┌──────────────────┼───────────────────┐
//!        │ single           │ sentinel          │ cluster
//!        ▼                  ▼                   ▼
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │ Standalone   │   │ resolve      │   │ ClusterKeyspace  │
//! │ Connection   │<──│ master addr  │   │  slot map        │
//! └──────┬───────┘   └──────────────┘   │  MOVED / ASK     │
//!        │                              └────────┬─────────┘
//!        │                                       │ per node
//!        ▼                                       ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │ NodeConnection: TcpStream + BytesMut + RespParser       │
//! │ every round-trip bounded by the command timeout         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Replies cross this boundary as [`Reply`] values. A top-level error frame
//! from the server becomes [`KeyspaceError::Server`].

pub mod cluster;
pub mod node;
pub mod sentinel;
pub mod slot;
pub mod standalone;

#[cfg(test)]
pub mod fake;

use crate::config::{RedisMode, Settings};
use crate::protocol::{ParseError, Reply};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

pub use cluster::ClusterKeyspace;
pub use node::{NodeConnection, NodeOptions};
pub use standalone::StandaloneConnection;

/// Reply or error for one entry of a pipeline.
pub type PipelineResult = Vec<Result<Reply, KeyspaceError>>;

/// How the connected deployment is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyMode {
    Single,
    Sharded,
    SentinelResolved,
}

impl TopologyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyMode::Single => "single",
            TopologyMode::Sharded => "sharded",
            TopologyMode::SentinelResolved => "sentinel-resolved",
        }
    }
}

impl fmt::Display for TopologyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by keyspace connections.
#[derive(Debug, Error)]
pub enum KeyspaceError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server sent bytes that are not valid RESP
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// The server closed the connection
    #[error("connection closed by server")]
    Disconnected,

    /// A round-trip exceeded the configured command timeout
    #[error("Command timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Establishing a connection exceeded the connect timeout
    #[error("connecting to {addr} timed out after {}s", .timeout.as_secs_f64())]
    ConnectTimeout { addr: String, timeout: Duration },

    /// An error reply from the server, verbatim
    #[error("{0}")]
    Server(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    /// The handle cannot enumerate shards (distinct from "no shards")
    #[error("shard enumeration is not supported by this connection")]
    ShardsUnsupported,

    #[error("{0}")]
    Unsupported(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("too many redirects for slot {0}")]
    TooManyRedirects(u16),

    #[error("unexpected reply to {command}: {detail}")]
    UnexpectedReply { command: String, detail: String },
}

impl KeyspaceError {
    /// True for both round-trip and connect timeouts.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            KeyspaceError::Timeout(_) | KeyspaceError::ConnectTimeout { .. }
        )
    }

    /// True when the underlying TCP connection can no longer be trusted and
    /// must be re-established before the next command.
    pub fn is_connection_broken(&self) -> bool {
        matches!(
            self,
            KeyspaceError::Io(_)
                | KeyspaceError::Protocol(_)
                | KeyspaceError::Disconnected
                | KeyspaceError::Timeout(_)
        )
    }

    pub(crate) fn unexpected(command: &str, reply: &Reply) -> Self {
        KeyspaceError::UnexpectedReply {
            command: command.to_string(),
            detail: format!("{:?}", reply),
        }
    }
}

/// A live handle to a Redis deployment.
#[async_trait]
pub trait Keyspace: Send + Sync {
    /// Issues one command and waits for its reply.
    async fn issue(&self, args: &[Bytes]) -> Result<Reply, KeyspaceError>;

    /// Like [`issue`](Keyspace::issue), also returning the time spent on
    /// the wire. Handles that queue or reconnect before sending exclude
    /// that time.
    async fn issue_timed(&self, args: &[Bytes]) -> (Result<Reply, KeyspaceError>, Duration) {
        let started = Instant::now();
        let reply = self.issue(args).await;
        (reply, started.elapsed())
    }

    /// Issues all commands in one round-trip. Replies come back in order;
    /// a server error answering one entry is kept in that entry. The outer
    /// `Err` means the round-trip itself failed.
    async fn pipeline(&self, commands: &[Vec<Bytes>]) -> Result<PipelineResult, KeyspaceError>;

    fn topology(&self) -> TopologyMode;

    /// Handles to each shard's local keyspace.
    async fn shards(&self) -> Result<Vec<Arc<dyn Keyspace>>, KeyspaceError> {
        Err(KeyspaceError::ShardsUnsupported)
    }

    /// Switches the logical database used by later commands.
    async fn select_database(&self, _db: u32) -> Result<(), KeyspaceError> {
        Err(KeyspaceError::Unsupported(format!(
            "database selection is not available in {} mode",
            self.topology()
        )))
    }

    /// The logical database in use, when the topology has one.
    fn current_database(&self) -> Option<u32> {
        None
    }

    /// Human-readable address of the entry point.
    fn endpoint(&self) -> String;
}

/// Builds an argument vector from anything byte-like.
///
/// ```
/// use keylens::connection::argv;
/// let args = argv(["SCAN", "0", "COUNT", "100"]);
/// assert_eq!(args.len(), 4);
/// ```
pub fn argv<I, A>(parts: I) -> Vec<Bytes>
where
    I: IntoIterator<Item = A>,
    A: AsRef<[u8]>,
{
    parts
        .into_iter()
        .map(|p| Bytes::copy_from_slice(p.as_ref()))
        .collect()
}

/// Opens a handle for the configured topology.
pub async fn connect(settings: &Settings) -> Result<Arc<dyn Keyspace>, KeyspaceError> {
    let options = NodeOptions::from_settings(settings)
        .map_err(|e| KeyspaceError::Topology(e.to_string()))?;

    match settings.redis.mode {
        RedisMode::Single => {
            let endpoint = settings
                .redis
                .endpoint()
                .map_err(|e| KeyspaceError::Topology(e.to_string()))?;
            let addr = format!("{}:{}", endpoint.host, endpoint.port);
            let conn = StandaloneConnection::connect(addr, options, TopologyMode::Single).await?;
            Ok(Arc::new(conn))
        }
        RedisMode::Sentinel => {
            let conn = sentinel::connect_master(
                &settings.redis.sentinel_hosts,
                &settings.redis.sentinel_service,
                options,
            )
            .await?;
            Ok(Arc::new(conn))
        }
        RedisMode::Cluster => {
            let cluster = ClusterKeyspace::connect(&settings.redis.cluster_nodes, options).await?;
            Ok(Arc::new(cluster))
        }
    }
}
