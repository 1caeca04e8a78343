//! Handle to a single instance (also used for a sentinel-resolved master).
//!
//! Holds at most one [`NodeConnection`] behind an async mutex. When a
//! round-trip breaks the connection (I/O error, disconnect, timeout, protocol
//! error) the connection is dropped and the next command reconnects,
//! re-applying AUTH and the database selected at that time.

use crate::connection::{
    KeyspaceError, Keyspace, NodeConnection, NodeOptions, PipelineResult, TopologyMode,
};
use crate::protocol::Reply;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub struct StandaloneConnection {
    addr: String,
    options: NodeOptions,
    mode: TopologyMode,
    node: Mutex<Option<NodeConnection>>,
    db: AtomicU32,
}

impl StandaloneConnection {
    /// Connects eagerly so that configuration errors surface at startup.
    pub async fn connect(
        addr: String,
        options: NodeOptions,
        mode: TopologyMode,
    ) -> Result<Self, KeyspaceError> {
        let node = NodeConnection::connect(&addr, &options).await?;
        info!(addr = %addr, mode = %mode, "Keyspace connection established");
        Ok(Self {
            db: AtomicU32::new(options.db),
            addr,
            options,
            mode,
            node: Mutex::new(Some(node)),
        })
    }

    async fn ensure<'a>(
        &self,
        slot: &'a mut Option<NodeConnection>,
    ) -> Result<&'a mut NodeConnection, KeyspaceError> {
        if slot.is_none() {
            let options = NodeOptions {
                db: self.db.load(Ordering::Relaxed),
                ..self.options.clone()
            };
            let node = NodeConnection::connect(&self.addr, &options).await?;
            info!(addr = %self.addr, "Reconnected");
            *slot = Some(node);
        }
        slot.as_mut().ok_or(KeyspaceError::Disconnected)
    }

    fn note_failure(&self, slot: &mut Option<NodeConnection>, err: &KeyspaceError) {
        if err.is_connection_broken() {
            warn!(addr = %self.addr, error = %err, "Dropping broken connection");
            *slot = None;
        }
    }

    /// Tracks a `SELECT` issued through `issue` so reconnects land on the
    /// same database.
    fn track_select(&self, args: &[Bytes]) {
        let is_select = args
            .first()
            .is_some_and(|name| name.eq_ignore_ascii_case(b"SELECT"));
        if !is_select {
            return;
        }
        let db = args
            .get(1)
            .and_then(|a| std::str::from_utf8(a).ok())
            .and_then(|s| s.parse::<u32>().ok());
        if let Some(db) = db {
            self.db.store(db, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl Keyspace for StandaloneConnection {
    async fn issue(&self, args: &[Bytes]) -> Result<Reply, KeyspaceError> {
        let mut guard = self.node.lock().await;
        let node = self.ensure(&mut guard).await?;
        let result = node.round_trip(args).await;
        match &result {
            Ok(_) => self.track_select(args),
            Err(e) => self.note_failure(&mut guard, e),
        }
        result
    }

    /// Times `round_trip` alone: waiting for the handle and reconnecting
    /// are not counted.
    async fn issue_timed(&self, args: &[Bytes]) -> (Result<Reply, KeyspaceError>, Duration) {
        let mut guard = self.node.lock().await;
        let node = match self.ensure(&mut guard).await {
            Ok(node) => node,
            Err(e) => return (Err(e), Duration::ZERO),
        };
        let started = Instant::now();
        let result = node.round_trip(args).await;
        let elapsed = started.elapsed();
        match &result {
            Ok(_) => self.track_select(args),
            Err(e) => self.note_failure(&mut guard, e),
        }
        (result, elapsed)
    }

    async fn pipeline(&self, commands: &[Vec<Bytes>]) -> Result<PipelineResult, KeyspaceError> {
        let mut guard = self.node.lock().await;
        let node = self.ensure(&mut guard).await?;
        let result = node.round_trip_many(commands).await;
        match &result {
            Ok(replies) => {
                for (args, reply) in commands.iter().zip(replies) {
                    if reply.is_ok() {
                        self.track_select(args);
                    }
                }
            }
            Err(e) => self.note_failure(&mut guard, e),
        }
        result
    }

    fn topology(&self) -> TopologyMode {
        self.mode
    }

    async fn select_database(&self, db: u32) -> Result<(), KeyspaceError> {
        self.issue(&[Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())])
            .await?;
        Ok(())
    }

    fn current_database(&self) -> Option<u32> {
        Some(self.db.load(Ordering::Relaxed))
    }

    fn endpoint(&self) -> String {
        self.addr.clone()
    }
}
