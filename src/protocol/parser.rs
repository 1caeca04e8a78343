//! Zero-Copy RESP Reply Parser
//!
//! This module implements an incremental parser for the frames a Redis
//! server sends back. It understands RESP2 and the RESP3 additions, so a
//! server that answers with maps, doubles or booleans never breaks a reply.
//!
//! ## How the Parser Works
//!
//! The parser reads from a buffer and returns either:
//! - `Ok(Some((value, consumed)))` - Successfully parsed a frame, `consumed` bytes were used
//! - `Ok(None)` - Need more data, the frame is incomplete
//! - `Err(ParseError)` - Invalid protocol data
//!
//! The connection appends socket reads to a buffer, calls `parse()`, and
//! advances the buffer by `consumed` bytes once a frame is complete.

use crate::protocol::types::{prefix, RespValue, CRLF};
use bytes::Bytes;
use std::num::ParseIntError;
use thiserror::Error;

/// Errors that can occur during RESP parsing.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown type prefix byte
    #[error("unknown type prefix: {0:#04x}")]
    UnknownPrefix(u8),

    /// Invalid integer format
    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    /// Invalid UTF-8 in a simple string or error message
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),

    /// Bulk string length is negative (but not -1 for null)
    #[error("invalid bulk string length: {0}")]
    InvalidBulkLength(i64),

    /// Aggregate length is negative (but not -1 for null)
    #[error("invalid aggregate length: {0}")]
    InvalidAggregateLength(i64),

    /// Protocol violation (missing CRLF, etc.)
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// The frame exceeds maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (512 MB, same as Redis)
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum aggregate nesting depth (prevent stack overflow)
pub const MAX_NESTING_DEPTH: usize = 32;

/// An incremental RESP reply parser.
///
/// # Example
///
/// ```
/// use keylens::protocol::parser::RespParser;
/// use keylens::protocol::RespValue;
///
/// let mut parser = RespParser::new();
/// let (value, consumed) = parser.parse(b":42\r\n").unwrap().unwrap();
/// assert_eq!(value, RespValue::Integer(42));
/// assert_eq!(consumed, 5);
/// ```
#[derive(Debug, Default)]
pub struct RespParser {
    /// Current nesting depth (for aggregate parsing)
    depth: usize,
}

impl RespParser {
    /// Creates a new parser instance.
    pub fn new() -> Self {
        Self { depth: 0 }
    }

    /// Attempts to parse one RESP frame from the buffer.
    pub fn parse(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        self.depth = 0;
        self.parse_value(buf)
    }

    fn parse_value(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        if self.depth > MAX_NESTING_DEPTH {
            return Err(ParseError::ProtocolError(format!(
                "maximum nesting depth exceeded: {}",
                MAX_NESTING_DEPTH
            )));
        }

        match buf[0] {
            prefix::SIMPLE_STRING => {
                Ok(read_text_line(buf)?.map(|(s, n)| (RespValue::SimpleString(s), n)))
            }
            prefix::ERROR => Ok(read_text_line(buf)?.map(|(s, n)| (RespValue::Error(s), n))),
            prefix::INTEGER => match read_integer_line(buf)? {
                Some((n, consumed)) => Ok(Some((RespValue::Integer(n), consumed))),
                None => Ok(None),
            },
            prefix::BULK_STRING => self.parse_bulk_string(buf, false),
            prefix::VERBATIM => self.parse_bulk_string(buf, true),
            prefix::ARRAY | prefix::SET | prefix::PUSH => self.parse_array(buf),
            prefix::MAP => self.parse_map(buf),
            prefix::NULL => match find_crlf(&buf[1..]) {
                Some(pos) => Ok(Some((RespValue::Null, 1 + pos + 2))),
                None => Ok(None),
            },
            prefix::BOOLEAN => match read_text_line(buf)? {
                Some((s, consumed)) => match s.as_str() {
                    "t" => Ok(Some((RespValue::Boolean(true), consumed))),
                    "f" => Ok(Some((RespValue::Boolean(false), consumed))),
                    other => Err(ParseError::ProtocolError(format!(
                        "invalid boolean: {}",
                        other
                    ))),
                },
                None => Ok(None),
            },
            prefix::DOUBLE => Ok(read_text_line(buf)?.map(|(s, n)| (RespValue::Double(s), n))),
            prefix::BIG_NUMBER => {
                Ok(read_text_line(buf)?.map(|(s, n)| (RespValue::BigNumber(s), n)))
            }
            other => Err(ParseError::UnknownPrefix(other)),
        }
    }

    /// Parses a bulk string: `$<length>\r\n<data>\r\n`
    ///
    /// Verbatim strings share the layout but carry a `txt:` style format
    /// marker in front of the payload, which is stripped.
    fn parse_bulk_string(
        &mut self,
        buf: &[u8],
        verbatim: bool,
    ) -> ParseResult<Option<(RespValue, usize)>> {
        let (length, header_len) = match read_integer_line(buf)? {
            Some(v) => v,
            None => return Ok(None),
        };

        if length == -1 {
            return Ok(Some((RespValue::Null, header_len)));
        }

        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }

        let length = length as usize;

        if length > MAX_BULK_SIZE {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: MAX_BULK_SIZE,
            });
        }

        let total_needed = header_len + length + 2;
        if buf.len() < total_needed {
            return Ok(None);
        }

        if &buf[header_len + length..total_needed] != CRLF {
            return Err(ParseError::ProtocolError(
                "bulk string missing trailing CRLF".to_string(),
            ));
        }

        let mut payload = &buf[header_len..header_len + length];
        if verbatim {
            if payload.len() < 4 || payload[3] != b':' {
                return Err(ParseError::ProtocolError(
                    "verbatim string missing format marker".to_string(),
                ));
            }
            payload = &payload[4..];
        }

        Ok(Some((
            RespValue::BulkString(Bytes::copy_from_slice(payload)),
            total_needed,
        )))
    }

    /// Parses an array, set or push: `*<count>\r\n<elements...>`
    fn parse_array(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (count, mut consumed) = match self.read_aggregate_header(buf)? {
            AggregateHeader::Null(consumed) => return Ok(Some((RespValue::Null, consumed))),
            AggregateHeader::Count(count, consumed) => (count, consumed),
            AggregateHeader::Incomplete => return Ok(None),
        };

        let mut elements = Vec::with_capacity(count.min(1024));

        self.depth += 1;
        for _ in 0..count {
            match self.parse_value(&buf[consumed..])? {
                Some((value, element_consumed)) => {
                    elements.push(value);
                    consumed += element_consumed;
                }
                None => return Ok(None),
            }
        }
        self.depth -= 1;

        Ok(Some((RespValue::Array(elements), consumed)))
    }

    /// Parses a RESP3 map: `%<count>\r\n<key><value>...`
    fn parse_map(&mut self, buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
        let (count, mut consumed) = match self.read_aggregate_header(buf)? {
            AggregateHeader::Null(consumed) => return Ok(Some((RespValue::Null, consumed))),
            AggregateHeader::Count(count, consumed) => (count, consumed),
            AggregateHeader::Incomplete => return Ok(None),
        };

        let mut pairs = Vec::with_capacity(count.min(1024));

        self.depth += 1;
        for _ in 0..count {
            let key = match self.parse_value(&buf[consumed..])? {
                Some((key, n)) => {
                    consumed += n;
                    key
                }
                None => return Ok(None),
            };
            let value = match self.parse_value(&buf[consumed..])? {
                Some((value, n)) => {
                    consumed += n;
                    value
                }
                None => return Ok(None),
            };
            pairs.push((key, value));
        }
        self.depth -= 1;

        Ok(Some((RespValue::Map(pairs), consumed)))
    }

    fn read_aggregate_header(&self, buf: &[u8]) -> ParseResult<AggregateHeader> {
        let (count, consumed) = match read_integer_line(buf)? {
            Some(v) => v,
            None => return Ok(AggregateHeader::Incomplete),
        };

        if count == -1 {
            return Ok(AggregateHeader::Null(consumed));
        }
        if count < 0 {
            return Err(ParseError::InvalidAggregateLength(count));
        }

        Ok(AggregateHeader::Count(count as usize, consumed))
    }
}

enum AggregateHeader {
    Null(usize),
    Count(usize, usize),
    Incomplete,
}

/// Reads `<prefix><text>\r\n`, returning the text and bytes consumed.
fn read_text_line(buf: &[u8]) -> ParseResult<Option<(String, usize)>> {
    match find_crlf(&buf[1..]) {
        Some(pos) => {
            let s = std::str::from_utf8(&buf[1..1 + pos])
                .map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;
            Ok(Some((s.to_string(), 1 + pos + 2)))
        }
        None => Ok(None),
    }
}

/// Reads `<prefix><integer>\r\n`, returning the integer and bytes consumed.
fn read_integer_line(buf: &[u8]) -> ParseResult<Option<(i64, usize)>> {
    match read_text_line(buf)? {
        Some((s, consumed)) => {
            let n: i64 = s
                .parse()
                .map_err(|e: ParseIntError| ParseError::InvalidInteger(e.to_string()))?;
            Ok(Some((n, consumed)))
        }
        None => Ok(None),
    }
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Helper function to parse a single RESP frame from bytes.
pub fn parse_message(buf: &[u8]) -> ParseResult<Option<(RespValue, usize)>> {
    RespParser::new().parse(buf)
}
