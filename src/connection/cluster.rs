//! Handle to a sharded deployment.
//!
//! The handle keeps a slot map loaded from `CLUSTER SLOTS` and one
//! [`StandaloneConnection`] per node it has talked to. Keyed commands are
//! routed to the primary owning the key's hash slot; `MOVED` and `ASK`
//! redirects are followed up to [`MAX_REDIRECTS`] hops.
//!
//! ```text
//!   issue(GET user:1)
//!        │ slot = crc16("user:1") % 16384
//!        ▼
//!   slot map ──> primary 10.0.0.2:7001 ──> reply
//!                     │
//!                     ├─ -MOVED 5474 10.0.0.3:7002  refresh map, retry there
//!                     └─ -ASK 5474 10.0.0.3:7002    ASKING + retry once there
//! ```

use crate::connection::slot::key_slot;
use crate::connection::{
    Keyspace, KeyspaceError, NodeOptions, PipelineResult, StandaloneConnection, TopologyMode,
};
use crate::protocol::Reply;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Maximum number of MOVED/ASK redirect hops before giving up.
pub const MAX_REDIRECTS: usize = 5;

/// A contiguous slot range (inclusive) and the nodes serving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotRange {
    pub start: u16,
    pub end: u16,
    pub primary: String,
    pub replicas: Vec<String>,
}

impl SlotRange {
    pub fn contains(&self, slot: u16) -> bool {
        self.start <= slot && slot <= self.end
    }
}

/// Parses a `CLUSTER SLOTS` reply.
///
/// Each entry is `[start, end, [host, port, id?, ...], [replica...]...]`.
/// An empty host means "the node that answered", so `fallback_host` is used.
pub fn parse_cluster_slots(
    reply: &Reply,
    fallback_host: &str,
) -> Result<Vec<SlotRange>, KeyspaceError> {
    let bad = || KeyspaceError::unexpected("CLUSTER SLOTS", reply);
    let entries = reply.as_list().ok_or_else(bad)?;

    let mut ranges = Vec::with_capacity(entries.len());
    for entry in entries {
        let fields = entry.as_list().ok_or_else(bad)?;
        if fields.len() < 3 {
            return Err(bad());
        }
        let start = slot_number(&fields[0]).ok_or_else(bad)?;
        let end = slot_number(&fields[1]).ok_or_else(bad)?;
        let primary = node_address(&fields[2], fallback_host).ok_or_else(bad)?;
        let replicas = fields[3..]
            .iter()
            .filter_map(|node| node_address(node, fallback_host))
            .collect();
        ranges.push(SlotRange {
            start,
            end,
            primary,
            replicas,
        });
    }
    ranges.sort_by_key(|r| r.start);
    Ok(ranges)
}

fn slot_number(reply: &Reply) -> Option<u16> {
    reply.as_integer().and_then(|n| u16::try_from(n).ok())
}

fn node_address(node: &Reply, fallback_host: &str) -> Option<String> {
    let parts = node.as_list()?;
    let host = parts.first()?.as_str()?;
    let port = parts.get(1)?.as_integer()?;
    let host = if host.is_empty() { fallback_host } else { host };
    Some(format!("{}:{}", host, port))
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RedirectKind {
    Moved,
    Ask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Redirect {
    kind: RedirectKind,
    slot: u16,
    addr: String,
}

/// Recognises `MOVED <slot> <addr>` and `ASK <slot> <addr>` error replies.
fn parse_redirect(err: &KeyspaceError) -> Option<Redirect> {
    let KeyspaceError::Server(msg) = err else {
        return None;
    };
    let mut parts = msg.split_whitespace();
    let kind = match parts.next()? {
        "MOVED" => RedirectKind::Moved,
        "ASK" => RedirectKind::Ask,
        _ => return None,
    };
    let slot = parts.next()?.parse().ok()?;
    let addr = parts.next()?.to_string();
    Some(Redirect { kind, slot, addr })
}

/// Position of the routing key in `args`, or `None` for keyless commands.
fn key_position(args: &[Bytes]) -> Option<usize> {
    let name = String::from_utf8_lossy(args.first()?).to_ascii_uppercase();
    let pos = match name.as_str() {
        "PING" | "ECHO" | "INFO" | "DBSIZE" | "TIME" | "CLUSTER" | "CONFIG" | "COMMAND"
        | "SCAN" | "KEYS" | "RANDOMKEY" | "FLUSHDB" | "FLUSHALL" | "CLIENT" | "SLOWLOG"
        | "LASTSAVE" | "ROLE" | "LATENCY" | "MODULE" | "SCRIPT" | "SELECT" | "ASKING"
        | "READONLY" | "AUTH" | "HELLO" | "SHUTDOWN" | "DEBUG" | "MONITOR" | "SYNC"
        | "PSYNC" | "SAVE" | "BGSAVE" | "BGREWRITEAOF" | "ACL" | "PUBLISH" | "SWAPDB" => {
            return None
        }
        // EVAL script numkeys key ...
        "EVAL" | "EVALSHA" | "EVAL_RO" | "EVALSHA_RO" | "FCALL" | "FCALL_RO" => {
            let numkeys: usize = std::str::from_utf8(args.get(2)?).ok()?.parse().ok()?;
            if numkeys == 0 {
                return None;
            }
            3
        }
        // OBJECT ENCODING key, MEMORY USAGE key, XINFO STREAM key
        "OBJECT" | "MEMORY" | "XINFO" => 2,
        "XREAD" | "XREADGROUP" => {
            let streams = args
                .iter()
                .position(|a| a.eq_ignore_ascii_case(b"STREAMS"))?;
            streams + 1
        }
        _ => 1,
    };
    (pos < args.len()).then_some(pos)
}

/// A sharded deployment reached through a set of seed nodes.
pub struct ClusterKeyspace {
    seeds: Vec<String>,
    options: NodeOptions,
    nodes: Mutex<HashMap<String, Arc<StandaloneConnection>>>,
    slots: RwLock<Vec<SlotRange>>,
}

impl ClusterKeyspace {
    /// Loads the slot map from the first seed that answers.
    pub async fn connect(seeds: &[String], options: NodeOptions) -> Result<Self, KeyspaceError> {
        if seeds.is_empty() {
            return Err(KeyspaceError::Topology("no cluster seed nodes given".into()));
        }
        let cluster = Self {
            seeds: seeds.to_vec(),
            // Clusters only have database 0.
            options: NodeOptions { db: 0, ..options },
            nodes: Mutex::new(HashMap::new()),
            slots: RwLock::new(Vec::new()),
        };
        cluster.refresh_slots().await?;
        info!(
            seeds = ?cluster.seeds,
            ranges = cluster.slots.read().await.len(),
            "Cluster slot map loaded"
        );
        Ok(cluster)
    }

    /// Returns the handle for `addr`, connecting on first use.
    async fn node(&self, addr: &str) -> Result<Arc<StandaloneConnection>, KeyspaceError> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get(addr) {
            return Ok(Arc::clone(node));
        }
        let node = Arc::new(
            StandaloneConnection::connect(
                addr.to_string(),
                self.options.clone(),
                TopologyMode::Single,
            )
            .await?,
        );
        nodes.insert(addr.to_string(), Arc::clone(&node));
        Ok(node)
    }

    async fn forget(&self, addr: &str) {
        self.nodes.lock().await.remove(addr);
    }

    /// Reloads the slot map, asking known primaries first, then the seeds.
    pub async fn refresh_slots(&self) -> Result<(), KeyspaceError> {
        let mut candidates = self.primaries().await;
        for seed in &self.seeds {
            if !candidates.contains(seed) {
                candidates.push(seed.clone());
            }
        }

        let mut last_err = None;
        for addr in candidates {
            let node = match self.node(&addr).await {
                Ok(node) => node,
                Err(e) => {
                    debug!(addr = %addr, error = %e, "Node unreachable during refresh");
                    last_err = Some(e);
                    continue;
                }
            };
            match node
                .issue(&[Bytes::from_static(b"CLUSTER"), Bytes::from_static(b"SLOTS")])
                .await
            {
                Ok(reply) => {
                    let host = addr.rsplit_once(':').map_or(addr.as_str(), |(h, _)| h);
                    let ranges = parse_cluster_slots(&reply, host)?;
                    if ranges.is_empty() {
                        return Err(KeyspaceError::Topology(
                            "cluster reports no slot assignments".into(),
                        ));
                    }
                    *self.slots.write().await = ranges;
                    return Ok(());
                }
                Err(e) => {
                    warn!(addr = %addr, error = %e, "CLUSTER SLOTS failed");
                    if e.is_connection_broken() {
                        self.forget(&addr).await;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| KeyspaceError::Topology("no reachable cluster node".into())))
    }

    /// Distinct primary addresses, in slot order.
    pub async fn primaries(&self) -> Vec<String> {
        let slots = self.slots.read().await;
        let mut primaries: Vec<String> = Vec::new();
        for range in slots.iter() {
            if !primaries.contains(&range.primary) {
                primaries.push(range.primary.clone());
            }
        }
        primaries
    }

    async fn addr_for_slot(&self, slot: u16) -> Result<String, KeyspaceError> {
        self.slots
            .read()
            .await
            .iter()
            .find(|r| r.contains(slot))
            .map(|r| r.primary.clone())
            .ok_or_else(|| KeyspaceError::Topology(format!("no node serves slot {}", slot)))
    }

    /// The node a command should go to first, plus the slot it routes by.
    async fn target(&self, args: &[Bytes]) -> Result<(String, Option<u16>), KeyspaceError> {
        match key_position(args) {
            Some(pos) => {
                let slot = key_slot(&args[pos]);
                Ok((self.addr_for_slot(slot).await?, Some(slot)))
            }
            None => {
                let entry = self
                    .primaries()
                    .await
                    .into_iter()
                    .next()
                    .or_else(|| self.seeds.first().cloned())
                    .ok_or_else(|| KeyspaceError::Topology("no cluster node known".into()))?;
                Ok((entry, None))
            }
        }
    }

    /// Issues `args` at `addr`, following redirects.
    async fn route_from(
        &self,
        mut addr: String,
        slot: Option<u16>,
        args: &[Bytes],
    ) -> Result<Reply, KeyspaceError> {
        for _ in 0..MAX_REDIRECTS {
            let node = self.node(&addr).await?;
            let err = match node.issue(args).await {
                Ok(reply) => return Ok(reply),
                Err(e) => e,
            };

            let Some(redirect) = parse_redirect(&err) else {
                return Err(err);
            };
            match redirect.kind {
                RedirectKind::Moved => {
                    debug!(slot = redirect.slot, to = %redirect.addr, "MOVED");
                    if let Err(e) = self.refresh_slots().await {
                        warn!(error = %e, "Slot map refresh after MOVED failed");
                    }
                    addr = redirect.addr;
                }
                RedirectKind::Ask => {
                    debug!(slot = redirect.slot, to = %redirect.addr, "ASK");
                    let target = self.node(&redirect.addr).await?;
                    let mut replies = target
                        .pipeline(&[vec![Bytes::from_static(b"ASKING")], args.to_vec()])
                        .await?;
                    return replies.pop().unwrap_or(Err(KeyspaceError::Disconnected));
                }
            }
        }
        Err(KeyspaceError::TooManyRedirects(slot.unwrap_or_default()))
    }
}

#[async_trait]
impl Keyspace for ClusterKeyspace {
    async fn issue(&self, args: &[Bytes]) -> Result<Reply, KeyspaceError> {
        let (addr, slot) = self.target(args).await?;
        self.route_from(addr, slot, args).await
    }

    /// Sends the whole group to the node owning the first command's key;
    /// entries answered with a redirect are re-issued individually.
    async fn pipeline(&self, commands: &[Vec<Bytes>]) -> Result<PipelineResult, KeyspaceError> {
        let Some(first) = commands.first() else {
            return Ok(Vec::new());
        };
        let (entry, _) = self.target(first).await?;
        let node = self.node(&entry).await?;
        let mut replies = node.pipeline(commands).await?;

        for (args, reply) in commands.iter().zip(replies.iter_mut()) {
            let redirected = match reply {
                Err(e) => parse_redirect(e).is_some(),
                Ok(_) => false,
            };
            if redirected {
                *reply = self.issue(args).await;
            }
        }
        Ok(replies)
    }

    fn topology(&self) -> TopologyMode {
        TopologyMode::Sharded
    }

    /// One handle per reachable primary; each scans only its own keyspace.
    /// Unreachable primaries are left out, unless none can be reached.
    async fn shards(&self) -> Result<Vec<Arc<dyn Keyspace>>, KeyspaceError> {
        let mut shards: Vec<Arc<dyn Keyspace>> = Vec::new();
        let mut last_err = None;
        for addr in self.primaries().await {
            match self.node(&addr).await {
                Ok(node) => shards.push(node),
                Err(e) => {
                    warn!(addr = %addr, error = %e, "Primary unreachable, skipping shard");
                    last_err = Some(e);
                }
            }
        }
        match last_err {
            Some(e) if shards.is_empty() => Err(e),
            _ => Ok(shards),
        }
    }

    fn endpoint(&self) -> String {
        self.seeds.join(",")
    }
}
