//! Per-key size estimation.

use crate::analysis::serialize_lossy;
use crate::connection::{Keyspace, KeyspaceError};
use crate::protocol::Reply;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// The data type of a key, as reported by `TYPE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    String,
    List,
    Set,
    #[serde(rename = "zset")]
    SortedSet,
    Hash,
    Stream,
    Unknown,
}

impl KeyKind {
    /// Maps a `TYPE` reply. `"none"` is handled by the caller.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "string" => KeyKind::String,
            "list" => KeyKind::List,
            "set" => KeyKind::Set,
            "zset" => KeyKind::SortedSet,
            "hash" => KeyKind::Hash,
            "stream" => KeyKind::Stream,
            _ => KeyKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::String => "string",
            KeyKind::List => "list",
            KeyKind::Set => "set",
            KeyKind::SortedSet => "zset",
            KeyKind::Hash => "hash",
            KeyKind::Stream => "stream",
            KeyKind::Unknown => "unknown",
        }
    }

    /// The command returning this kind's size metric: byte length for
    /// strings, element count otherwise.
    fn size_command(&self) -> Option<&'static [u8]> {
        match self {
            KeyKind::String => Some(b"STRLEN"),
            KeyKind::List => Some(b"LLEN"),
            KeyKind::Set => Some(b"SCARD"),
            KeyKind::SortedSet => Some(b"ZCARD"),
            KeyKind::Hash => Some(b"HLEN"),
            KeyKind::Stream => Some(b"XLEN"),
            KeyKind::Unknown => None,
        }
    }
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one estimation found out about one key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyRecord {
    #[serde(serialize_with = "serialize_lossy")]
    pub name: Bytes,
    #[serde(rename = "type")]
    pub kind: KeyKind,
    /// Byte length for strings, element count for everything else.
    pub size: u64,
    /// Seconds to live; `None` when the key does not expire.
    pub ttl: Option<u64>,
    pub encoding: Option<String>,
    pub memory_bytes: Option<u64>,
}

impl KeyRecord {
    pub fn name_lossy(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum EstimateError {
    /// The key was deleted between discovery and inspection.
    #[error("key '{0}' no longer exists")]
    KeyVanished(String),

    #[error(transparent)]
    Keyspace(#[from] KeyspaceError),
}

/// Runs the per-key probes.
pub struct KeyEstimator {
    keyspace: Arc<dyn Keyspace>,
}

impl KeyEstimator {
    pub fn new(keyspace: Arc<dyn Keyspace>) -> Self {
        Self { keyspace }
    }

    /// Probes type, TTL and size; then, best effort, encoding and (when
    /// `include_memory` is set) memory usage.
    pub async fn estimate(
        &self,
        key: &Bytes,
        include_memory: bool,
    ) -> Result<KeyRecord, EstimateError> {
        let vanished = || EstimateError::KeyVanished(String::from_utf8_lossy(key).into_owned());

        let type_reply = self.probe(b"TYPE", key).await?;
        let type_name = type_reply.as_str().unwrap_or("none");
        if type_name == "none" {
            return Err(vanished());
        }
        let kind = KeyKind::from_type_name(type_name);

        let ttl = match self.probe(b"TTL", key).await?.as_integer() {
            Some(-2) => return Err(vanished()),
            Some(secs) if secs >= 0 => Some(secs as u64),
            _ => None,
        };

        let size = match kind.size_command() {
            Some(command) => {
                let reply = self.probe(command, key).await?;
                let size = reply.as_integer().ok_or_else(|| {
                    KeyspaceError::unexpected(&String::from_utf8_lossy(command), &reply)
                })?;
                size.max(0) as u64
            }
            // Approximation: the key name's own length.
            None => key.len() as u64,
        };

        let encoding = match self
            .keyspace
            .issue(&[
                Bytes::from_static(b"OBJECT"),
                Bytes::from_static(b"ENCODING"),
                key.clone(),
            ])
            .await
        {
            Ok(reply) => reply.as_str().map(str::to_string),
            Err(e) => {
                debug!(key = %String::from_utf8_lossy(key), error = %e, "OBJECT ENCODING unavailable");
                None
            }
        };

        let memory_bytes = if include_memory {
            self.memory_usage(key).await
        } else {
            None
        };

        Ok(KeyRecord {
            name: key.clone(),
            kind,
            size,
            ttl,
            encoding,
            memory_bytes,
        })
    }

    async fn probe(&self, command: &'static [u8], key: &Bytes) -> Result<Reply, KeyspaceError> {
        self.keyspace
            .issue(&[Bytes::from_static(command), key.clone()])
            .await
    }

    async fn memory_usage(&self, key: &Bytes) -> Option<u64> {
        let reply = self
            .keyspace
            .issue(&[
                Bytes::from_static(b"MEMORY"),
                Bytes::from_static(b"USAGE"),
                key.clone(),
            ])
            .await;
        match reply {
            Ok(reply) => reply.as_integer().and_then(|n| u64::try_from(n).ok()),
            Err(e) => {
                debug!(key = %String::from_utf8_lossy(key), error = %e, "MEMORY USAGE unavailable");
                None
            }
        }
    }
}
