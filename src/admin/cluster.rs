//! Cluster topology and health reporting.

use crate::commands::format_reply;
use crate::config::parse_host_port;
use crate::connection::cluster::{parse_cluster_slots, SlotRange};
use crate::connection::{Keyspace, KeyspaceError};
use crate::protocol::Reply;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::error;

/// One line of `CLUSTER NODES`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterNode {
    pub id: String,
    pub address: String,
    pub flags: Vec<String>,
    pub master_id: Option<String>,
    pub ping_sent: u64,
    pub pong_recv: u64,
    pub config_epoch: u64,
    pub link_state: String,
    pub slots: Vec<String>,
}

impl ClusterNode {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    pub fn is_primary(&self) -> bool {
        self.has_flag("master")
    }

    pub fn is_replica(&self) -> bool {
        self.has_flag("slave") || self.has_flag("replica")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterOverview {
    pub cluster_info: Value,
    pub nodes: Vec<ClusterNode>,
    pub total_nodes: usize,
    pub master_nodes: usize,
    pub replica_nodes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    FailedNodes,
    HandshakeNodes,
    MastersWithoutReplicas,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthIssue {
    #[serde(rename = "type")]
    pub kind: IssueKind,
    pub count: usize,
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterHealth {
    pub healthy: bool,
    pub cluster_state: String,
    pub total_nodes: usize,
    pub master_nodes: usize,
    pub replica_nodes: usize,
    pub issues: Vec<HealthIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct KeyNodeMapping {
    pub key: String,
    pub slot: u16,
    pub master_node: String,
    pub replica_nodes: Vec<String>,
}

/// Parses the text of `CLUSTER NODES`. Lines with fewer than eight fields
/// are skipped.
pub fn parse_cluster_nodes(text: &str) -> Vec<ClusterNode> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 8 {
                return None;
            }
            Some(ClusterNode {
                id: parts[0].to_string(),
                address: parts[1].to_string(),
                flags: parts[2].split(',').map(str::to_string).collect(),
                master_id: (parts[3] != "-").then(|| parts[3].to_string()),
                ping_sent: parts[4].parse().unwrap_or(0),
                pong_recv: parts[5].parse().unwrap_or(0),
                config_epoch: parts[6].parse().unwrap_or(0),
                link_state: parts[7].to_string(),
                slots: parts[8..].iter().map(|s| s.to_string()).collect(),
            })
        })
        .collect()
}

/// Problems visible in the node table.
pub fn find_issues(nodes: &[ClusterNode]) -> Vec<HealthIssue> {
    let addresses = |pred: &dyn Fn(&ClusterNode) -> bool| -> Vec<String> {
        nodes
            .iter()
            .filter(|n| pred(n))
            .map(|n| n.address.clone())
            .collect()
    };

    let failed = addresses(&|n: &ClusterNode| n.has_flag("fail"));
    let handshake = addresses(&|n: &ClusterNode| n.has_flag("handshake"));
    let lonely = addresses(&|m: &ClusterNode| {
        m.is_primary()
            && !nodes
                .iter()
                .any(|n| n.master_id.as_deref() == Some(m.id.as_str()))
    });

    [
        (IssueKind::FailedNodes, failed),
        (IssueKind::HandshakeNodes, handshake),
        (IssueKind::MastersWithoutReplicas, lonely),
    ]
    .into_iter()
    .filter(|(_, nodes)| !nodes.is_empty())
    .map(|(kind, nodes)| HealthIssue {
        kind,
        count: nodes.len(),
        nodes,
    })
    .collect()
}

pub struct ClusterAdmin {
    keyspace: Arc<dyn Keyspace>,
}

impl ClusterAdmin {
    pub fn new(keyspace: Arc<dyn Keyspace>) -> Self {
        Self { keyspace }
    }

    /// `CLUSTER INFO` fields plus the parsed node table.
    pub async fn cluster_info(&self) -> Result<ClusterOverview, KeyspaceError> {
        let nodes_reply = self.cluster(&["NODES"]).await?;
        let text = nodes_reply
            .as_str()
            .ok_or_else(|| KeyspaceError::unexpected("CLUSTER NODES", &nodes_reply))?;
        let nodes = parse_cluster_nodes(text);
        let info = self.cluster(&["INFO"]).await?;

        Ok(ClusterOverview {
            cluster_info: format_reply(&info, "CLUSTER"),
            total_nodes: nodes.len(),
            master_nodes: nodes.iter().filter(|n| n.is_primary()).count(),
            replica_nodes: nodes.iter().filter(|n| n.is_replica()).count(),
            nodes,
        })
    }

    pub async fn cluster_slots(&self) -> Result<Vec<SlotRange>, KeyspaceError> {
        let reply = self.cluster(&["SLOTS"]).await?;
        parse_cluster_slots(&reply, &self.entry_host())
    }

    pub async fn check_health(&self) -> Result<ClusterHealth, KeyspaceError> {
        let overview = self.cluster_info().await?;
        let cluster_state = overview
            .cluster_info
            .get("cluster_state")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        Ok(ClusterHealth {
            healthy: cluster_state == "ok",
            cluster_state,
            total_nodes: overview.total_nodes,
            master_nodes: overview.master_nodes,
            replica_nodes: overview.replica_nodes,
            issues: find_issues(&overview.nodes),
        })
    }

    /// The slot of `key` and the nodes serving it, as the server computes
    /// it. `None` when no node currently owns the slot.
    pub async fn key_node_mapping(
        &self,
        key: &str,
    ) -> Result<Option<KeyNodeMapping>, KeyspaceError> {
        let reply = self
            .keyspace
            .issue(&[
                Bytes::from_static(b"CLUSTER"),
                Bytes::from_static(b"KEYSLOT"),
                Bytes::copy_from_slice(key.as_bytes()),
            ])
            .await?;
        let slot = reply
            .as_integer()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| KeyspaceError::unexpected("CLUSTER KEYSLOT", &reply))?;

        let ranges = self.cluster_slots().await?;
        Ok(ranges
            .into_iter()
            .find(|r| r.contains(slot))
            .map(|r| KeyNodeMapping {
                key: key.to_string(),
                slot,
                master_node: r.primary,
                replica_nodes: r.replicas,
            }))
    }

    async fn cluster(&self, sub: &[&'static str]) -> Result<Reply, KeyspaceError> {
        let mut args = vec![Bytes::from_static(b"CLUSTER")];
        args.extend(sub.iter().map(|s| Bytes::from_static(s.as_bytes())));
        self.keyspace.issue(&args).await.map_err(|e| {
            error!(command = %format!("CLUSTER {}", sub.join(" ")), error = %e, "cluster query failed");
            e
        })
    }

    /// Host of the first entry point, used when `CLUSTER SLOTS` reports an
    /// empty host.
    fn entry_host(&self) -> String {
        let endpoint = self.keyspace.endpoint();
        let first = endpoint.split(',').next().unwrap_or_default().trim();
        parse_host_port(first)
            .map(|(host, _)| host)
            .unwrap_or_else(|_| "127.0.0.1".to_string())
    }
}
