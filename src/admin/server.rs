//! Server status summary built from `INFO`.

use crate::connection::{Keyspace, KeyspaceError, TopologyMode};
use crate::humanize::{format_bytes, format_duration};
use crate::protocol::Reply;
use bytes::Bytes;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Per-database figures from the `# Keyspace` section of `INFO`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KeyspaceStats {
    pub keys: u64,
    pub expires: u64,
    pub avg_ttl: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerDetails {
    pub uptime: String,
    pub role: Option<String>,
    pub tcp_port: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerInfo {
    pub status: &'static str,
    pub connection_mode: TopologyMode,
    pub endpoint: String,
    pub current_database: Option<u32>,
    pub redis_version: Option<String>,
    pub used_memory: String,
    pub connected_clients: Option<i64>,
    pub total_commands_processed: Option<i64>,
    pub keyspace: BTreeMap<String, KeyspaceStats>,
    pub server_info: ServerDetails,
}

/// Collects the headline figures of `INFO` for the connected server.
pub async fn server_info(keyspace: &dyn Keyspace) -> Result<ServerInfo, KeyspaceError> {
    let info = keyspace.issue(&[Bytes::from_static(b"INFO")]).await?;
    if !matches!(info, Reply::Map(_)) {
        return Err(KeyspaceError::unexpected("INFO", &info));
    }

    let text = |name: &str| info.field(name).map(Reply::to_lossy_string);
    let number = |name: &str| info.field(name).and_then(Reply::as_integer);

    let used_memory = number("used_memory").unwrap_or(0).max(0) as u64;
    let uptime = number("uptime_in_seconds").unwrap_or(0).max(0) as u64;

    Ok(ServerInfo {
        status: "connected",
        connection_mode: keyspace.topology(),
        endpoint: keyspace.endpoint(),
        current_database: keyspace.current_database(),
        redis_version: text("redis_version"),
        used_memory: format_bytes(used_memory),
        connected_clients: number("connected_clients"),
        total_commands_processed: number("total_commands_processed"),
        keyspace: keyspace_stats(&info)
            .into_iter()
            .map(|(db, stats)| (format!("db{}", db), stats))
            .collect(),
        server_info: ServerDetails {
            uptime: format_duration(Duration::from_secs(uptime)),
            role: text("role"),
            tcp_port: number("tcp_port"),
        },
    })
}

/// Extracts `dbN:keys=..,expires=..,avg_ttl=..` lines from a shaped `INFO`
/// reply.
pub(crate) fn keyspace_stats(info: &Reply) -> BTreeMap<u32, KeyspaceStats> {
    let Reply::Map(pairs) = info else {
        return BTreeMap::new();
    };
    pairs
        .iter()
        .filter_map(|(name, value)| {
            let db = name.as_str()?.strip_prefix("db")?.parse().ok()?;
            Some((db, parse_keyspace_line(&value.to_lossy_string())))
        })
        .collect()
}

fn parse_keyspace_line(line: &str) -> KeyspaceStats {
    let mut stats = KeyspaceStats::default();
    for (name, value) in line.split(',').filter_map(|kv| kv.split_once('=')) {
        let Ok(value) = value.trim().parse() else {
            continue;
        };
        match name.trim() {
            "keys" => stats.keys = value,
            "expires" => stats.expires = value,
            "avg_ttl" => stats.avg_ttl = value,
            _ => {}
        }
    }
    stats
}
