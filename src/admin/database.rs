//! Logical database management.
//!
//! Only a single-instance deployment has numbered databases that can be
//! switched between; every operation here reports
//! [`AdminError::UnsupportedMode`] on other topologies. Operations that
//! visit another database restore the original selection before returning,
//! including on failure.

use crate::admin::server::keyspace_stats;
use crate::admin::{AdminError, MAX_DATABASE};
use crate::connection::{Keyspace, KeyspaceError, TopologyMode};
use crate::protocol::Reply;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Keys probed when estimating how many keys carry a TTL.
pub const EXPIRY_SAMPLE_LIMIT: u64 = 1000;

const SAMPLE_SCAN_COUNT: &str = "100";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseSwitch {
    pub previous_db: u32,
    pub current_db: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    pub db_number: u32,
    pub key_count: u64,
    /// Server-wide `used_memory`; Redis does not report it per database.
    pub memory_usage: Option<u64>,
    pub expires_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseEntry {
    #[serde(flatten)]
    pub info: DatabaseInfo,
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseSummary {
    pub mode: TopologyMode,
    pub current_database: Option<u32>,
    pub databases: Vec<DatabaseEntry>,
    pub total_databases: usize,
    pub non_empty_databases: usize,
    pub total_keys: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearOutcome {
    pub database: u32,
    pub keys_deleted: u64,
    pub keys_remaining: u64,
}

pub struct DatabaseAdmin {
    keyspace: Arc<dyn Keyspace>,
    allow_dangerous: bool,
}

impl DatabaseAdmin {
    /// `allow_dangerous` gates [`clear_database`](Self::clear_database).
    pub fn new(keyspace: Arc<dyn Keyspace>, allow_dangerous: bool) -> Self {
        Self {
            keyspace,
            allow_dangerous,
        }
    }

    pub async fn switch_database(&self, db: u32) -> Result<DatabaseSwitch, AdminError> {
        let previous_db = self.require_single("Database switching")?;
        if db > MAX_DATABASE {
            return Err(AdminError::DatabaseOutOfRange(db));
        }
        self.keyspace.select_database(db).await.map_err(|e| {
            error!(db, error = %e, "failed to switch database");
            e
        })?;
        info!(from = previous_db, to = db, "switched database");
        Ok(DatabaseSwitch {
            previous_db,
            current_db: db,
        })
    }

    pub fn current_database(&self) -> Result<u32, AdminError> {
        self.require_single("Database selection")
    }

    /// Key counts of every database the server exposes.
    pub async fn list_databases(&self) -> Result<Vec<DatabaseInfo>, AdminError> {
        let original = self.require_single("Database listing")?;

        let info = self.info().await;
        let memory_usage = info.as_ref().and_then(used_memory);
        let stats = info.as_ref().map(keyspace_stats).unwrap_or_default();

        let mut databases = Vec::new();
        for db in 0..=MAX_DATABASE {
            if let Err(e) = self.keyspace.select_database(db).await {
                if is_invalid_index(&e) {
                    break;
                }
                warn!(db, error = %e, "cannot access database");
                continue;
            }
            let key_count = match self.dbsize().await {
                Ok(n) => n,
                Err(e) => {
                    warn!(db, error = %e, "DBSIZE failed");
                    continue;
                }
            };
            let expires_count = match stats.get(&db) {
                Some(s) => Some(s.expires),
                None if key_count == 0 => Some(0),
                None => None,
            };
            databases.push(DatabaseInfo {
                db_number: db,
                key_count,
                memory_usage,
                expires_count,
            });
        }

        self.restore(original).await;
        Ok(databases)
    }

    /// Key count and an expiring-key estimate for `db` (default: current).
    ///
    /// The estimate probes the TTL of at most [`EXPIRY_SAMPLE_LIMIT`] keys
    /// and scales the expiring fraction to the full key count.
    pub async fn database_info(&self, db: Option<u32>) -> Result<DatabaseInfo, AdminError> {
        let original = self.require_single("Database info")?;
        let db = db.unwrap_or(original);
        if db > MAX_DATABASE {
            return Err(AdminError::DatabaseOutOfRange(db));
        }

        let result = self.visit(db, original, self.inspect(db)).await;
        if let Err(e) = &result {
            error!(db, error = %e, "failed to get database info");
        }
        result.map_err(AdminError::from)
    }

    /// Deletes every key of `db` (default: current) with `FLUSHDB`.
    pub async fn clear_database(
        &self,
        db: Option<u32>,
        confirm: bool,
    ) -> Result<ClearOutcome, AdminError> {
        if !confirm {
            return Err(AdminError::ConfirmationRequired);
        }
        let original = self.require_single("Database clearing")?;
        if !self.allow_dangerous {
            return Err(AdminError::ClearingBlocked);
        }
        let db = db.unwrap_or(original);
        if db > MAX_DATABASE {
            return Err(AdminError::DatabaseOutOfRange(db));
        }

        let outcome = self.visit(db, original, self.flush()).await?;
        warn!(db, keys_deleted = outcome.keys_deleted, "cleared database");
        Ok(ClearOutcome {
            database: db,
            ..outcome
        })
    }

    pub async fn database_summary(&self) -> Result<DatabaseSummary, AdminError> {
        let mode = self.keyspace.topology();
        if mode != TopologyMode::Single {
            return Ok(DatabaseSummary {
                mode,
                current_database: None,
                databases: Vec::new(),
                total_databases: 0,
                non_empty_databases: 0,
                total_keys: 0,
                note: Some(format!(
                    "Numbered databases are not available in {} mode",
                    mode
                )),
            });
        }

        let databases = self.list_databases().await?;
        let current = self.current_database()?;
        Ok(DatabaseSummary {
            mode,
            current_database: Some(current),
            total_databases: databases.len(),
            non_empty_databases: databases.iter().filter(|d| d.key_count > 0).count(),
            total_keys: databases.iter().map(|d| d.key_count).sum(),
            databases: databases
                .into_iter()
                .map(|info| DatabaseEntry {
                    is_current: info.db_number == current,
                    info,
                })
                .collect(),
            note: None,
        })
    }

    fn require_single(&self, operation: &'static str) -> Result<u32, AdminError> {
        let mode = self.keyspace.topology();
        match (mode, self.keyspace.current_database()) {
            (TopologyMode::Single, Some(db)) => Ok(db),
            _ => Err(AdminError::UnsupportedMode { operation, mode }),
        }
    }

    /// Runs `work` with `db` selected, then switches back to `original`.
    async fn visit<T>(
        &self,
        db: u32,
        original: u32,
        work: impl std::future::Future<Output = Result<T, KeyspaceError>>,
    ) -> Result<T, KeyspaceError> {
        if db != original {
            self.keyspace.select_database(db).await?;
        }
        let result = work.await;
        if db != original {
            self.restore(original).await;
        }
        result
    }

    async fn restore(&self, original: u32) {
        if let Err(e) = self.keyspace.select_database(original).await {
            error!(db = original, error = %e, "failed to switch back to original database");
        }
    }

    async fn inspect(&self, db: u32) -> Result<DatabaseInfo, KeyspaceError> {
        let key_count = self.dbsize().await?;
        let memory_usage = self.info().await.as_ref().and_then(used_memory);
        let expires_count = if key_count == 0 {
            None
        } else {
            match self.sample_expiring(key_count).await {
                Ok(estimate) => estimate,
                Err(e) => {
                    warn!(db, error = %e, "failed to count expiring keys");
                    None
                }
            }
        };
        Ok(DatabaseInfo {
            db_number: db,
            key_count,
            memory_usage,
            expires_count,
        })
    }

    async fn flush(&self) -> Result<ClearOutcome, KeyspaceError> {
        let keys_deleted = self.dbsize().await?;
        self.keyspace
            .issue(&[Bytes::from_static(b"FLUSHDB")])
            .await?;
        let keys_remaining = self.dbsize().await?;
        Ok(ClearOutcome {
            database: 0,
            keys_deleted,
            keys_remaining,
        })
    }

    async fn sample_expiring(&self, key_count: u64) -> Result<Option<u64>, KeyspaceError> {
        let limit = key_count.min(EXPIRY_SAMPLE_LIMIT);
        let mut cursor = Bytes::from_static(b"0");
        let mut sampled = 0u64;
        let mut expiring = 0u64;

        'scan: loop {
            let reply = self
                .keyspace
                .issue(&[
                    Bytes::from_static(b"SCAN"),
                    cursor.clone(),
                    Bytes::from_static(b"COUNT"),
                    Bytes::from_static(SAMPLE_SCAN_COUNT.as_bytes()),
                ])
                .await?;
            let (next, keys) = match reply.as_list() {
                Some([next, Reply::List(keys)]) => (next, keys),
                _ => return Err(KeyspaceError::unexpected("SCAN", &reply)),
            };
            for key in keys {
                if sampled >= limit {
                    break 'scan;
                }
                let Some(key) = key.as_bytes() else { continue };
                sampled += 1;
                let ttl = self
                    .keyspace
                    .issue(&[Bytes::from_static(b"TTL"), Bytes::copy_from_slice(key)])
                    .await?;
                if ttl.as_integer().is_some_and(|t| t > 0) {
                    expiring += 1;
                }
            }
            match next.as_bytes() {
                Some(b"0") | None => break,
                Some(next) => cursor = Bytes::copy_from_slice(next),
            }
            if sampled >= limit {
                break;
            }
        }

        if sampled == 0 {
            return Ok(None);
        }
        Ok(Some(expiring * key_count / sampled))
    }

    async fn dbsize(&self) -> Result<u64, KeyspaceError> {
        let reply = self
            .keyspace
            .issue(&[Bytes::from_static(b"DBSIZE")])
            .await?;
        reply
            .as_integer()
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| KeyspaceError::unexpected("DBSIZE", &reply))
    }

    async fn info(&self) -> Option<Reply> {
        match self.keyspace.issue(&[Bytes::from_static(b"INFO")]).await {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(error = %e, "INFO unavailable");
                None
            }
        }
    }
}

fn used_memory(info: &Reply) -> Option<u64> {
    info.field("used_memory")
        .and_then(Reply::as_integer)
        .and_then(|n| u64::try_from(n).ok())
}

fn is_invalid_index(e: &KeyspaceError) -> bool {
    match e {
        KeyspaceError::Server(msg) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("invalid db index") || msg.contains("db index is out of range")
        }
        _ => false,
    }
}
