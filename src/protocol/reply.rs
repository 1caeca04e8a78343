//! Reply shapes handed to the rest of the crate.
//!
//! The wire frame ([`RespValue`]) carries protocol details such as error
//! frames and RESP3 scalars. Above the connection boundary every reply is one
//! of a closed set of shapes, so formatting and analysis can match on it
//! exhaustively.

use crate::protocol::types::RespValue;
use bytes::Bytes;

/// A server reply after the connection boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Null bulk string, null array or RESP3 null.
    Nil,
    /// Integer replies; RESP3 booleans become 1 / 0.
    Integer(i64),
    /// Status replies and textual RESP3 scalars (doubles, big numbers).
    Text(String),
    /// Binary-safe bulk payload.
    Bulk(Bytes),
    /// A reply naturally listing items.
    List(Vec<Reply>),
    /// A reply shaped as a field mapping, in server order.
    Map(Vec<(Reply, Reply)>),
}

impl Reply {
    /// Converts a top-level frame. An error frame yields its message.
    pub fn from_frame(frame: RespValue) -> Result<Reply, String> {
        match frame {
            RespValue::Error(message) => Err(message),
            other => Ok(Self::from_nested(other)),
        }
    }

    /// Nested error frames (e.g. inside an `EXEC` reply) are kept as text.
    fn from_nested(frame: RespValue) -> Reply {
        match frame {
            RespValue::SimpleString(s) => Reply::Text(s),
            RespValue::Error(s) => Reply::Text(s),
            RespValue::Integer(n) => Reply::Integer(n),
            RespValue::BulkString(b) => Reply::Bulk(b),
            RespValue::Null => Reply::Nil,
            RespValue::Array(items) => {
                Reply::List(items.into_iter().map(Self::from_nested).collect())
            }
            RespValue::Map(pairs) => Reply::Map(
                pairs
                    .into_iter()
                    .map(|(k, v)| (Self::from_nested(k), Self::from_nested(v)))
                    .collect(),
            ),
            RespValue::Boolean(b) => Reply::Integer(i64::from(b)),
            RespValue::Double(d) => Reply::Text(d),
            RespValue::BigNumber(n) => Reply::Text(n),
        }
    }

    /// Creates a bulk reply.
    pub fn bulk(data: impl Into<Bytes>) -> Self {
        Reply::Bulk(data.into())
    }

    /// Creates a status / text reply.
    pub fn text(s: impl Into<String>) -> Self {
        Reply::Text(s.into())
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Reply::Nil)
    }

    /// Returns the reply as UTF-8 text when it is a status or a UTF-8 bulk.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Reply::Text(s) => Some(s),
            Reply::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// Returns the raw bytes of a bulk or status reply.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(b) => Some(b),
            Reply::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Returns an integer, accepting numeric text as well (SCAN cursors are
    /// sent as bulk strings).
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(n) => Some(*n),
            other => other.as_str().and_then(|s| s.trim().parse().ok()),
        }
    }

    pub fn as_list(&self) -> Option<&[Reply]> {
        match self {
            Reply::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_list(self) -> Option<Vec<Reply>> {
        match self {
            Reply::List(items) => Some(items),
            _ => None,
        }
    }

    /// Looks up a field of a mapping reply by textual key.
    pub fn field(&self, name: &str) -> Option<&Reply> {
        match self {
            Reply::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_str() == Some(name))
                .map(|(_, v)| v),
            _ => None,
        }
    }

    /// Lossy text rendering used for log lines and sample values.
    pub fn to_lossy_string(&self) -> String {
        match self {
            Reply::Nil => "(nil)".to_string(),
            Reply::Integer(n) => n.to_string(),
            Reply::Text(s) => s.clone(),
            Reply::Bulk(b) => String::from_utf8_lossy(b).into_owned(),
            Reply::List(items) => format!("(list of {})", items.len()),
            Reply::Map(pairs) => format!("(map of {})", pairs.len()),
        }
    }

    /// Reshapes replies whose natural form is a field mapping.
    ///
    /// - `INFO` / `CLUSTER INFO` text becomes `field -> value`.
    /// - flat pair lists from `HGETALL`, `CONFIG GET` and `HELLO` become maps.
    pub fn shaped_for(self, args: &[Bytes]) -> Reply {
        let name = args
            .first()
            .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
            .unwrap_or_default();
        let sub = args
            .get(1)
            .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
            .unwrap_or_default();

        match (name.as_str(), sub.as_str()) {
            ("INFO", _) | ("CLUSTER", "INFO") => match self.as_str() {
                Some(text) => parse_info_text(text),
                None => self,
            },
            ("HGETALL", _) | ("CONFIG", "GET") | ("HELLO", _) => match self {
                Reply::List(items) if items.len() % 2 == 0 => pair_up(items),
                other => other,
            },
            _ => self,
        }
    }
}

fn pair_up(items: Vec<Reply>) -> Reply {
    let mut pairs = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(k), Some(v)) = (iter.next(), iter.next()) {
        pairs.push((k, v));
    }
    Reply::Map(pairs)
}

/// Parses `field:value` lines, skipping `# Section` headers and blanks.
/// Integer values are kept as integers.
pub fn parse_info_text(text: &str) -> Reply {
    let pairs = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| {
            let value = match v.parse::<i64>() {
                Ok(n) => Reply::Integer(n),
                Err(_) => Reply::Text(v.to_string()),
            };
            (Reply::Text(k.to_string()), value)
        })
        .collect();
    Reply::Map(pairs)
}
