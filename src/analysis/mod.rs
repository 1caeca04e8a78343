//! Large-Key Analysis
//!
//! ```text
//!  LargeKeyAnalyzer::analyze(pattern, limit, include_memory)
//!        │
//!        ├──> KeyScanner ──── SCAN cursor MATCH p COUNT n ──> Keyspace
//!        │       (one database, or each shard in turn;       (or each shard)
//!        │        at most `limit` keys in total)
//!        │
//!        └──> KeyEstimator, per key:
//!                TYPE, TTL, STRLEN/LLEN/SCARD/ZCARD/HLEN/XLEN,
//!                OBJECT ENCODING (optional), MEMORY USAGE (optional)
//! ```
//!
//! Per-key failures are logged and skipped. A failure of the scan itself
//! aborts the analysis.

pub mod analyzer;
pub mod estimator;
pub mod scanner;

pub use analyzer::{
    AnalysisError, AnalysisReport, AnalyzerOptions, KeyDetails, LargeKeyAnalyzer, TypeSummary,
    TOP_KEYS_LIMIT,
};
pub use estimator::{EstimateError, KeyEstimator, KeyKind, KeyRecord};
pub use scanner::KeyScanner;

use bytes::Bytes;
use serde::Serializer;

/// Serializes key names as text, replacing invalid UTF-8.
pub(crate) fn serialize_lossy<S: Serializer>(name: &Bytes, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(name))
}
