//! Administrative operations: logical databases, cluster topology and
//! server status.
//!
//! These sit beside the analysis and command layers and use the same
//! [`Keyspace`](crate::connection::Keyspace) handle.

pub mod cluster;
pub mod database;
pub mod server;

pub use cluster::{ClusterAdmin, ClusterHealth, ClusterNode, ClusterOverview, KeyNodeMapping};
pub use database::{ClearOutcome, DatabaseAdmin, DatabaseInfo, DatabaseSummary, DatabaseSwitch};
pub use server::{server_info, ServerInfo};

use crate::connection::{KeyspaceError, TopologyMode};
use thiserror::Error;

/// Highest logical database index accepted.
pub const MAX_DATABASE: u32 = 15;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("{operation} is not supported in {mode} mode")]
    UnsupportedMode {
        operation: &'static str,
        mode: TopologyMode,
    },

    #[error("Database number must be between 0 and {max}, got {0}", max = MAX_DATABASE)]
    DatabaseOutOfRange(u32),

    #[error("Confirmation required. Pass confirm to clear the database.")]
    ConfirmationRequired,

    #[error("Database clearing is blocked for safety. Enable dangerous commands to use it.")]
    ClearingBlocked,

    #[error(transparent)]
    Keyspace(#[from] KeyspaceError),
}
