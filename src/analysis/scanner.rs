//! Bounded, lazy keyspace iteration with `SCAN`.
//!
//! A [`KeyScanner`] walks one database, or every shard in turn when the
//! deployment is sharded, and yields at most `cap` key names in total.
//! Each call to [`KeyScanner::next`] either drains the current page or
//! issues the next `SCAN`.
//!
//! ```text
//!  NotStarted ──single──────────────> Single{cursor} ──cursor 0──> Done
//!      │
//!      ├──sharded, shards listed───> Shards{index, cursor} ──last shard──> Done
//!      │                                 (error: skip to next shard)
//!      │
//!      └──sharded, listing unsupported─> Fallback{cursor} ──cursor 0 / error──> Done
//! ```

use crate::connection::{Keyspace, KeyspaceError, TopologyMode};
use crate::protocol::Reply;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

enum ScanState {
    NotStarted,
    Single {
        cursor: u64,
    },
    Shards {
        shards: Vec<Arc<dyn Keyspace>>,
        index: usize,
        cursor: u64,
    },
    /// Sharded deployment that cannot list its shards: scan the entry point
    /// and stop quietly on the first error.
    Fallback {
        cursor: u64,
    },
    Done,
}

/// A single-use key iterator. Cursor state starts at zero on creation and
/// is never shared.
pub struct KeyScanner {
    keyspace: Arc<dyn Keyspace>,
    pattern: Bytes,
    count_hint: u32,
    cap: usize,
    yielded: usize,
    pending: VecDeque<Bytes>,
    state: ScanState,
}

impl KeyScanner {
    pub fn new(keyspace: Arc<dyn Keyspace>, pattern: &str, count_hint: u32, cap: usize) -> Self {
        Self {
            keyspace,
            pattern: Bytes::copy_from_slice(pattern.as_bytes()),
            count_hint: count_hint.max(1),
            cap,
            yielded: 0,
            pending: VecDeque::new(),
            state: ScanState::NotStarted,
        }
    }

    /// Number of keys yielded so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Returns the next key name, or `None` when the scan is over.
    ///
    /// Errors only surface for a single-database scan, or when shard
    /// enumeration itself fails; per-shard errors are logged and skipped.
    pub async fn next(&mut self) -> Result<Option<Bytes>, KeyspaceError> {
        loop {
            if self.yielded >= self.cap {
                self.pending.clear();
                self.state = ScanState::Done;
                return Ok(None);
            }
            if let Some(key) = self.pending.pop_front() {
                self.yielded += 1;
                return Ok(Some(key));
            }

            match std::mem::replace(&mut self.state, ScanState::Done) {
                ScanState::Done => return Ok(None),
                ScanState::NotStarted => self.state = self.start().await?,
                ScanState::Single { cursor } => {
                    let keyspace = Arc::clone(&self.keyspace);
                    let (next, keys) = self.scan_page(keyspace.as_ref(), cursor).await?;
                    self.pending.extend(keys);
                    if next != 0 {
                        self.state = ScanState::Single { cursor: next };
                    }
                }
                ScanState::Fallback { cursor } => {
                    let keyspace = Arc::clone(&self.keyspace);
                    match self.scan_page(keyspace.as_ref(), cursor).await {
                        Ok((next, keys)) => {
                            self.pending.extend(keys);
                            if next != 0 {
                                self.state = ScanState::Fallback { cursor: next };
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "SCAN failed on entry node, stopping");
                        }
                    }
                }
                ScanState::Shards {
                    shards,
                    index,
                    cursor,
                } => {
                    let Some(shard) = shards.get(index).cloned() else {
                        continue;
                    };
                    let (index, cursor) = match self.scan_page(shard.as_ref(), cursor).await {
                        Ok((next, keys)) => {
                            self.pending.extend(keys);
                            if next == 0 {
                                debug!(shard = %shard.endpoint(), "Shard scan complete");
                                (index + 1, 0)
                            } else {
                                (index, next)
                            }
                        }
                        Err(e) => {
                            warn!(shard = %shard.endpoint(), error = %e, "SCAN failed on shard, skipping");
                            (index + 1, 0)
                        }
                    };
                    if index < shards.len() {
                        self.state = ScanState::Shards {
                            shards,
                            index,
                            cursor,
                        };
                    }
                }
            }
        }
    }

    /// Drains the scanner into a vector.
    pub async fn collect(mut self) -> Result<Vec<Bytes>, KeyspaceError> {
        let mut keys = Vec::new();
        while let Some(key) = self.next().await? {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn start(&self) -> Result<ScanState, KeyspaceError> {
        if self.keyspace.topology() != TopologyMode::Sharded {
            return Ok(ScanState::Single { cursor: 0 });
        }
        match self.keyspace.shards().await {
            Ok(shards) if shards.is_empty() => Ok(ScanState::Done),
            Ok(shards) => {
                debug!(shards = shards.len(), "Scanning shards");
                Ok(ScanState::Shards {
                    shards,
                    index: 0,
                    cursor: 0,
                })
            }
            Err(KeyspaceError::ShardsUnsupported) => {
                debug!("Shard listing unsupported, scanning entry node");
                Ok(ScanState::Fallback { cursor: 0 })
            }
            Err(e) => Err(e),
        }
    }

    async fn scan_page(
        &self,
        keyspace: &dyn Keyspace,
        cursor: u64,
    ) -> Result<(u64, Vec<Bytes>), KeyspaceError> {
        let args = [
            Bytes::from_static(b"SCAN"),
            Bytes::from(cursor.to_string()),
            Bytes::from_static(b"MATCH"),
            self.pattern.clone(),
            Bytes::from_static(b"COUNT"),
            Bytes::from(self.count_hint.to_string()),
        ];
        let reply = keyspace.issue(&args).await?;
        parse_scan_reply(reply)
    }
}

/// `[cursor, [key, ...]]`
fn parse_scan_reply(reply: Reply) -> Result<(u64, Vec<Bytes>), KeyspaceError> {
    let bad = |reply: &Reply| KeyspaceError::unexpected("SCAN", reply);
    let parts = match reply {
        Reply::List(parts) if parts.len() == 2 => parts,
        other => return Err(bad(&other)),
    };
    let cursor = parts[0]
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| parts[0].as_integer().and_then(|n| u64::try_from(n).ok()))
        .ok_or_else(|| bad(&parts[0]))?;
    let keys = parts[1]
        .as_list()
        .ok_or_else(|| bad(&parts[1]))?
        .iter()
        .filter_map(|key| match key {
            Reply::Bulk(b) => Some(b.clone()),
            Reply::Text(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            _ => None,
        })
        .collect();
    Ok((cursor, keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::{FakeFailure, FakeKeyspace, FakeValue};

    fn populated(prefix: &str, n: usize) -> FakeKeyspace {
        let fake = FakeKeyspace::named(prefix);
        for i in 0..n {
            fake.insert(&format!("{}:{:03}", prefix, i), FakeValue::text("v"));
        }
        fake
    }

    #[tokio::test]
    async fn test_cap_bounds_yield() {
        for (size, cap, expected) in [(25, 10, 10), (25, 100, 25), (0, 5, 0), (7, 7, 7)] {
            let fake: Arc<dyn Keyspace> = Arc::new(populated("k", size));
            let keys = KeyScanner::new(fake, "*", 4, cap).collect().await.unwrap();
            assert_eq!(keys.len(), expected, "size={} cap={}", size, cap);
        }
    }

    #[tokio::test]
    async fn test_stops_at_cursor_zero() {
        let fake = Arc::new(populated("k", 25));
        let keys = KeyScanner::new(fake.clone(), "*", 10, 1000)
            .collect()
            .await
            .unwrap();
        assert_eq!(keys.len(), 25);
        assert_eq!(fake.calls_named("SCAN"), 3);
    }

    #[tokio::test]
    async fn test_cap_stops_issuing_scans() {
        let fake = Arc::new(populated("k", 100));
        let keys = KeyScanner::new(fake.clone(), "*", 10, 15)
            .collect()
            .await
            .unwrap();
        assert_eq!(keys.len(), 15);
        assert_eq!(fake.calls_named("SCAN"), 2);
    }

    #[tokio::test]
    async fn test_pattern_without_matches_is_empty() {
        let fake = Arc::new(populated("k", 12));
        let keys = KeyScanner::new(fake, "nomatch:*", 5, 100)
            .collect()
            .await
            .unwrap();
        assert!(keys.is_empty());
    }

    #[tokio::test]
    async fn test_scan_command_shape() {
        let fake = Arc::new(populated("k", 1));
        KeyScanner::new(fake.clone(), "user:*", 1000, 10)
            .collect()
            .await
            .unwrap();
        assert_eq!(fake.calls(), vec!["SCAN 0 MATCH user:* COUNT 1000"]);
    }

    #[tokio::test]
    async fn test_single_mode_error_propagates() {
        let fake = Arc::new(populated("k", 3));
        fake.fail("SCAN", FakeFailure::Disconnected);
        let err = KeyScanner::new(fake, "*", 10, 10).collect().await.unwrap_err();
        assert!(matches!(err, KeyspaceError::Disconnected));
    }

    #[tokio::test]
    async fn test_shards_share_global_cap() {
        let a = Arc::new(populated("a", 6));
        let b = Arc::new(populated("b", 6));
        let cluster: Arc<dyn Keyspace> = Arc::new(FakeKeyspace::sharded(vec![a, b]));

        let keys = KeyScanner::new(Arc::clone(&cluster), "*", 4, 100)
            .collect()
            .await
            .unwrap();
        assert_eq!(keys.len(), 12);

        let keys = KeyScanner::new(cluster, "*", 4, 8).collect().await.unwrap();
        assert_eq!(keys.len(), 8);
        assert!(keys[..6].iter().all(|k| k.starts_with(b"a:")));
        assert!(keys[6..].iter().all(|k| k.starts_with(b"b:")));
    }

    #[tokio::test]
    async fn test_failing_shard_does_not_abort() {
        let a = Arc::new(populated("a", 5));
        let b = Arc::new(populated("b", 5));
        let c = Arc::new(populated("c", 5));
        b.fail("SCAN", FakeFailure::Server("LOADING dataset".into()));
        let cluster: Arc<dyn Keyspace> = Arc::new(FakeKeyspace::sharded(vec![a, b, c]));

        let keys = KeyScanner::new(cluster, "*", 10, 100).collect().await.unwrap();
        assert_eq!(keys.len(), 10);
        assert!(!keys.iter().any(|k| k.starts_with(b"b:")));
    }

    #[tokio::test]
    async fn test_fallback_when_shards_unsupported() {
        let entry = FakeKeyspace::sharded_without_listing();
        for i in 0..5 {
            entry.insert(&format!("k{}", i), FakeValue::text("v"));
        }
        let keys = KeyScanner::new(Arc::new(entry), "*", 2, 100)
            .collect()
            .await
            .unwrap();
        assert_eq!(keys.len(), 5);
    }

    #[tokio::test]
    async fn test_fallback_error_stops_quietly() {
        let entry = FakeKeyspace::sharded_without_listing();
        entry.insert("k", FakeValue::text("v"));
        entry.fail("SCAN", FakeFailure::Timeout(std::time::Duration::from_secs(1)));
        let keys = KeyScanner::new(Arc::new(entry), "*", 2, 100)
            .collect()
            .await
            .unwrap();
        assert!(keys.is_empty());
    }

    #[test]
    fn test_parse_scan_reply() {
        let reply = Reply::List(vec![
            Reply::bulk("17"),
            Reply::List(vec![Reply::bulk("a"), Reply::bulk(&b"\xff\x00"[..])]),
        ]);
        let (cursor, keys) = parse_scan_reply(reply).unwrap();
        assert_eq!(cursor, 17);
        assert_eq!(keys[1], Bytes::from(&b"\xff\x00"[..]));
        assert!(parse_scan_reply(Reply::text("OK")).is_err());
    }
}
