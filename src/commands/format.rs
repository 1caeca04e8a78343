//! Display formatting for command replies.
//!
//! Turns a [`Reply`] into a JSON value that is safe to print and bounded in
//! size:
//!
//! - bulk payloads decode as UTF-8, or become `<binary data: N bytes>`
//! - lists over 100 items become `{total_items, sample_items, truncated}`,
//!   except for key-listing commands (`KEYS`, `SCAN`), which pass through
//! - maps over 50 fields become `{total_fields, sample_fields, truncated}`
//! - text over 1000 characters becomes `{length, preview, truncated}`
//!
//! Formatting has no error path.

use crate::protocol::Reply;
use serde_json::{json, Map, Value};

pub const MAX_LIST_ITEMS: usize = 100;
pub const MAX_MAP_FIELDS: usize = 50;
pub const MAX_TEXT_CHARS: usize = 1000;
pub const SAMPLE_ITEMS: usize = 10;
pub const PREVIEW_CHARS: usize = 500;

/// Commands whose list replies are key listings and are never truncated.
const KEY_LISTING_COMMANDS: &[&str] = &["KEYS", "SCAN"];

/// Formats `reply` for display. `command` is the issuing command's name
/// (case-insensitive; anything after the first word is ignored).
pub fn format_reply(reply: &Reply, command: &str) -> Value {
    let name = command
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    let bounded = !KEY_LISTING_COMMANDS.contains(&name.as_str());
    to_value(reply, bounded)
}

fn to_value(reply: &Reply, bounded: bool) -> Value {
    match reply {
        Reply::Nil => Value::Null,
        Reply::Integer(n) => json!(n),
        Reply::Text(s) => text_value(s.clone(), bounded),
        Reply::Bulk(b) => match std::str::from_utf8(b) {
            Ok(s) => text_value(s.to_string(), bounded),
            Err(_) => Value::String(format!("<binary data: {} bytes>", b.len())),
        },
        Reply::List(items) if bounded && items.len() > MAX_LIST_ITEMS => json!({
            "total_items": items.len(),
            "sample_items": items
                .iter()
                .take(SAMPLE_ITEMS)
                .map(|item| to_value(item, bounded))
                .collect::<Vec<_>>(),
            "truncated": true,
        }),
        Reply::List(items) => Value::Array(items.iter().map(|item| to_value(item, bounded)).collect()),
        Reply::Map(pairs) if bounded && pairs.len() > MAX_MAP_FIELDS => json!({
            "total_fields": pairs.len(),
            "sample_fields": fields(&pairs[..SAMPLE_ITEMS], bounded),
            "truncated": true,
        }),
        Reply::Map(pairs) => Value::Object(fields(pairs, bounded)),
    }
}

fn fields(pairs: &[(Reply, Reply)], bounded: bool) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (field_name(k), to_value(v, bounded)))
        .collect()
}

fn field_name(key: &Reply) -> String {
    match key {
        Reply::Bulk(b) if std::str::from_utf8(b).is_err() => {
            format!("<binary data: {} bytes>", b.len())
        }
        other => other.to_lossy_string(),
    }
}

fn text_value(s: String, bounded: bool) -> Value {
    if !bounded {
        return Value::String(s);
    }
    let length = s.chars().count();
    if length <= MAX_TEXT_CHARS {
        return Value::String(s);
    }
    let mut preview: String = s.chars().take(PREVIEW_CHARS).collect();
    preview.push_str("...");
    json!({
        "length": length,
        "preview": preview,
        "truncated": true,
    })
}
