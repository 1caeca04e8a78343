//! Master resolution through sentinels.

use crate::config::parse_host_port;
use crate::connection::{
    KeyspaceError, NodeConnection, NodeOptions, StandaloneConnection, TopologyMode,
};
use crate::protocol::Reply;
use bytes::Bytes;
use tracing::{info, warn};

/// Asks each sentinel in turn for the master of `service`, then connects
/// to that master.
pub async fn connect_master(
    sentinels: &[String],
    service: &str,
    options: NodeOptions,
) -> Result<StandaloneConnection, KeyspaceError> {
    let addr = resolve_master(sentinels, service, &options).await?;
    StandaloneConnection::connect(addr, options, TopologyMode::SentinelResolved).await
}

/// Returns the `host:port` of the current master of `service`.
pub async fn resolve_master(
    sentinels: &[String],
    service: &str,
    options: &NodeOptions,
) -> Result<String, KeyspaceError> {
    // Sentinels take neither the data password nor a database.
    let sentinel_options = NodeOptions {
        username: None,
        password: None,
        db: 0,
        ..options.clone()
    };

    for sentinel in sentinels {
        let addr = match parse_host_port(sentinel) {
            Ok((host, port)) => format!("{}:{}", host, port),
            Err(e) => {
                warn!(sentinel = %sentinel, error = %e, "Skipping sentinel");
                continue;
            }
        };
        let mut conn = match NodeConnection::connect(&addr, &sentinel_options).await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(sentinel = %addr, error = %e, "Sentinel unreachable");
                continue;
            }
        };
        let reply = conn
            .round_trip(&[
                Bytes::from_static(b"SENTINEL"),
                Bytes::from_static(b"get-master-addr-by-name"),
                Bytes::copy_from_slice(service.as_bytes()),
            ])
            .await;
        match reply.map(|r| master_address(&r)) {
            Ok(Some(master)) => {
                info!(sentinel = %addr, service, master = %master, "Resolved master");
                return Ok(master);
            }
            Ok(None) => warn!(sentinel = %addr, service, "Sentinel does not know the service"),
            Err(e) => warn!(sentinel = %addr, error = %e, "Sentinel query failed"),
        }
    }

    Err(KeyspaceError::Topology(format!(
        "no sentinel could resolve master '{}'",
        service
    )))
}

/// `[host, port]`, or nil when the service is unknown.
fn master_address(reply: &Reply) -> Option<String> {
    let parts = reply.as_list()?;
    let host = parts.first()?.as_str()?;
    let port = parts.get(1)?.as_integer()?;
    Some(format!("{}:{}", host, port))
}
