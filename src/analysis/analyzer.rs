//! The large-key analysis engine.
//!
//! One call to [`LargeKeyAnalyzer::analyze`] drives a fresh [`KeyScanner`],
//! estimates every yielded key, and aggregates the large ones:
//!
//! - a key is large when `size >= threshold`; the same threshold applies
//!   whether `size` counts bytes (strings) or elements (collections)
//! - `by_type` statistics cover large keys only
//! - `top_by_size` is a stable descending sort, so equal sizes keep
//!   discovery order
//! - keys that fail estimation are not counted in `total_scanned`

use crate::analysis::estimator::{EstimateError, KeyEstimator, KeyKind, KeyRecord};
use crate::analysis::scanner::KeyScanner;
use crate::config::AnalysisSettings;
use crate::connection::{Keyspace, KeyspaceError};
use crate::protocol::Reply;
use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum number of keys kept in `top_by_size`.
pub const TOP_KEYS_LIMIT: usize = 50;

/// Items fetched when sampling a key's contents.
const SAMPLE_ITEMS: usize = 10;

/// Bytes of a string value shown as a preview.
const PREVIEW_BYTES: usize = 100;

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// The scan itself failed; the report would be meaningless.
    #[error("large key analysis failed: {0}")]
    Failed(#[source] KeyspaceError),

    #[error("key '{0}' not found")]
    KeyNotFound(String),
}

/// Analysis tuning taken from the settings.
#[derive(Debug, Clone)]
pub struct AnalyzerOptions {
    pub threshold: u64,
    pub scan_count: u32,
    pub max_scan_keys: usize,
}

impl From<&AnalysisSettings> for AnalyzerOptions {
    fn from(settings: &AnalysisSettings) -> Self {
        Self {
            threshold: settings.large_key_threshold,
            scan_count: settings.scan_count,
            max_scan_keys: settings.max_scan_keys,
        }
    }
}

/// Aggregates for one key kind, over large keys only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeSummary {
    pub count: u64,
    pub total_size: u64,
    pub average_size: f64,
    pub max_size: u64,
    pub min_size: u64,
    pub total_memory_bytes: u64,
}

impl TypeSummary {
    fn first(record: &KeyRecord) -> Self {
        Self {
            count: 1,
            total_size: record.size,
            average_size: record.size as f64,
            max_size: record.size,
            min_size: record.size,
            total_memory_bytes: record.memory_bytes.unwrap_or(0),
        }
    }

    fn add(&mut self, record: &KeyRecord) {
        self.count += 1;
        self.total_size += record.size;
        self.max_size = self.max_size.max(record.size);
        self.min_size = self.min_size.min(record.size);
        self.total_memory_bytes += record.memory_bytes.unwrap_or(0);
        self.average_size = self.total_size as f64 / self.count as f64;
    }
}

/// Result of one analysis pass. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub pattern: String,
    pub threshold: u64,
    pub total_scanned: u64,
    pub large_keys_found: u64,
    pub total_memory_bytes: u64,
    pub elapsed_seconds: f64,
    pub by_type: BTreeMap<KeyKind, TypeSummary>,
    pub top_by_size: Vec<KeyRecord>,
}

/// A key's record plus a small sample of its contents.
#[derive(Debug, Clone, Serialize)]
pub struct KeyDetails {
    #[serde(flatten)]
    pub record: KeyRecord,
    pub is_large: bool,
    pub sample: Option<Value>,
}

pub struct LargeKeyAnalyzer {
    keyspace: Arc<dyn Keyspace>,
    estimator: KeyEstimator,
    options: AnalyzerOptions,
}

impl LargeKeyAnalyzer {
    pub fn new(keyspace: Arc<dyn Keyspace>, options: AnalyzerOptions) -> Self {
        Self {
            estimator: KeyEstimator::new(Arc::clone(&keyspace)),
            keyspace,
            options,
        }
    }

    pub fn options(&self) -> &AnalyzerOptions {
        &self.options
    }

    /// Scans keys matching `pattern` (at most `limit`, defaulting to the
    /// configured maximum) and reports the large ones.
    pub async fn analyze(
        &self,
        pattern: &str,
        limit: Option<usize>,
        include_memory: bool,
    ) -> Result<AnalysisReport, AnalysisError> {
        let started = Instant::now();
        let cap = limit.unwrap_or(self.options.max_scan_keys);
        let threshold = self.options.threshold;
        info!(pattern, cap, threshold, include_memory, "Starting large key analysis");

        let mut scanner = KeyScanner::new(
            Arc::clone(&self.keyspace),
            pattern,
            self.options.scan_count,
            cap,
        );

        let mut total_scanned = 0u64;
        let mut total_memory_bytes = 0u64;
        let mut large: Vec<KeyRecord> = Vec::new();

        while let Some(key) = scanner.next().await.map_err(AnalysisError::Failed)? {
            let record = match self.estimator.estimate(&key, include_memory).await {
                Ok(record) => record,
                Err(EstimateError::KeyVanished(name)) => {
                    debug!(key = %name, "Key vanished before inspection");
                    continue;
                }
                Err(e) => {
                    warn!(key = %String::from_utf8_lossy(&key), error = %e, "Failed to analyze key");
                    continue;
                }
            };

            total_scanned += 1;
            total_memory_bytes += record.memory_bytes.unwrap_or(0);

            if record.size >= threshold {
                debug!(
                    key = %record.name_lossy(),
                    kind = %record.kind,
                    size = record.size,
                    "Found large key"
                );
                large.push(record);
            }
        }

        let mut by_type: BTreeMap<KeyKind, TypeSummary> = BTreeMap::new();
        for record in &large {
            by_type
                .entry(record.kind)
                .and_modify(|summary| summary.add(record))
                .or_insert_with(|| TypeSummary::first(record));
        }

        let large_keys_found = large.len() as u64;
        // sort_by is stable: equal sizes keep discovery order.
        large.sort_by(|a, b| b.size.cmp(&a.size));
        large.truncate(TOP_KEYS_LIMIT);

        let elapsed_seconds = started.elapsed().as_secs_f64();
        info!(
            total_scanned,
            large_keys_found,
            elapsed_ms = (elapsed_seconds * 1000.0) as u64,
            "Large key analysis complete"
        );

        Ok(AnalysisReport {
            pattern: pattern.to_string(),
            threshold,
            total_scanned,
            large_keys_found,
            total_memory_bytes,
            elapsed_seconds,
            by_type,
            top_by_size: large,
        })
    }

    /// Full record of one key, memory included, plus a content sample of
    /// at most ten items.
    pub async fn key_details(&self, key: &str) -> Result<KeyDetails, AnalysisError> {
        let name = Bytes::copy_from_slice(key.as_bytes());
        let record = match self.estimator.estimate(&name, true).await {
            Ok(record) => record,
            Err(EstimateError::KeyVanished(_)) => {
                return Err(AnalysisError::KeyNotFound(key.to_string()))
            }
            Err(EstimateError::Keyspace(e)) => return Err(AnalysisError::Failed(e)),
        };

        let sample = match self.sample(&record).await {
            Ok(sample) => sample,
            Err(e) => {
                debug!(key, error = %e, "Could not sample key contents");
                None
            }
        };

        Ok(KeyDetails {
            is_large: record.size >= self.options.threshold,
            record,
            sample,
        })
    }

    async fn sample(&self, record: &KeyRecord) -> Result<Option<Value>, KeyspaceError> {
        let key = record.name.clone();
        let count = SAMPLE_ITEMS.to_string();
        let last = (SAMPLE_ITEMS - 1).to_string();

        let sample = match record.kind {
            KeyKind::String => {
                let reply = self
                    .issue(&[
                        b"GETRANGE".as_slice(),
                        &key,
                        b"0",
                        (PREVIEW_BYTES - 1).to_string().as_bytes(),
                    ])
                    .await?;
                json!({
                    "preview": reply.to_lossy_string(),
                    "truncated": record.size > PREVIEW_BYTES as u64,
                })
            }
            KeyKind::List => {
                let reply = self
                    .issue(&[b"LRANGE".as_slice(), &key, b"0", last.as_bytes()])
                    .await?;
                json!({ "sample_items": lossy_items(&reply) })
            }
            KeyKind::Set => {
                let reply = self
                    .issue(&[b"SSCAN".as_slice(), &key, b"0", b"COUNT", count.as_bytes()])
                    .await?;
                let mut members = scan_items(&reply);
                members.truncate(SAMPLE_ITEMS);
                json!({ "sample_members": members })
            }
            KeyKind::SortedSet => {
                let reply = self
                    .issue(&[b"ZRANGE".as_slice(), &key, b"0", last.as_bytes(), b"WITHSCORES"])
                    .await?;
                let members: Vec<Value> = lossy_items(&reply)
                    .chunks(2)
                    .filter(|pair| pair.len() == 2)
                    .map(|pair| {
                        let score = pair[1].parse::<f64>().map_or(json!(pair[1]), |s| json!(s));
                        json!({ "member": pair[0], "score": score })
                    })
                    .collect();
                json!({ "sample_members": members })
            }
            KeyKind::Hash => {
                let reply = self
                    .issue(&[b"HSCAN".as_slice(), &key, b"0", b"COUNT", count.as_bytes()])
                    .await?;
                let mut fields = Map::new();
                for pair in scan_items(&reply).chunks(2).take(SAMPLE_ITEMS) {
                    if let [field, value] = pair {
                        fields.insert(field.clone(), json!(value));
                    }
                }
                json!({ "sample_fields": fields })
            }
            KeyKind::Stream => {
                let reply = self
                    .issue(&[b"XRANGE".as_slice(), &key, b"-", b"+", b"COUNT", count.as_bytes()])
                    .await?;
                let entries: Vec<Value> = reply
                    .as_list()
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|entry| {
                        let parts = entry.as_list()?;
                        let id = parts.first()?.to_lossy_string();
                        let mut fields = Map::new();
                        for pair in lossy_items(parts.get(1)?).chunks(2) {
                            if let [field, value] = pair {
                                fields.insert(field.clone(), json!(value));
                            }
                        }
                        Some(json!({ "id": id, "fields": fields }))
                    })
                    .collect();
                json!({ "sample_entries": entries })
            }
            KeyKind::Unknown => return Ok(None),
        };
        Ok(Some(sample))
    }

    async fn issue(&self, parts: &[&[u8]]) -> Result<Reply, KeyspaceError> {
        let args: Vec<Bytes> = parts.iter().map(|p| Bytes::copy_from_slice(p)).collect();
        self.keyspace.issue(&args).await
    }
}

fn lossy_items(reply: &Reply) -> Vec<String> {
    reply
        .as_list()
        .unwrap_or_default()
        .iter()
        .map(Reply::to_lossy_string)
        .collect()
}

/// Items of a `[cursor, [items...]]` reply from SSCAN / HSCAN.
fn scan_items(reply: &Reply) -> Vec<String> {
    reply
        .as_list()
        .and_then(|parts| parts.get(1))
        .map(lossy_items)
        .unwrap_or_default()
}
