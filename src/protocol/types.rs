//! RESP (Redis Serialization Protocol) Data Types
//!
//! This module defines the frames a Redis server can send back to a client,
//! and the encoding used to send commands to it.
//!
//! ## Protocol Format
//!
//! Each RESP frame starts with a type prefix byte:
//! - `+` Simple String
//! - `-` Error
//! - `:` Integer
//! - `$` Bulk String
//! - `*` Array
//!
//! RESP3 servers may additionally answer with:
//! - `_` Null
//! - `#` Boolean
//! - `,` Double
//! - `(` Big Number
//! - `=` Verbatim String
//! - `%` Map
//! - `~` Set
//! - `>` Push
//!
//! All frames are terminated with CRLF (`\r\n`).
//!
//! ## Commands
//!
//! Clients always send commands as an array of bulk strings:
//! `*2\r\n$3\r\nGET\r\n$4\r\nname\r\n`

use bytes::Bytes;
use std::fmt;

/// The CRLF terminator used in RESP protocol
pub const CRLF: &[u8] = b"\r\n";

/// RESP protocol type prefixes
pub mod prefix {
    pub const SIMPLE_STRING: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK_STRING: u8 = b'$';
    pub const ARRAY: u8 = b'*';

    // RESP3
    pub const NULL: u8 = b'_';
    pub const BOOLEAN: u8 = b'#';
    pub const DOUBLE: u8 = b',';
    pub const BIG_NUMBER: u8 = b'(';
    pub const VERBATIM: u8 = b'=';
    pub const MAP: u8 = b'%';
    pub const SET: u8 = b'~';
    pub const PUSH: u8 = b'>';
}

/// A frame received from (or sent to) a Redis server.
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple strings are used for non-binary safe status replies.
    /// Format: `+<string>\r\n`
    SimpleString(String),

    /// Errors are similar to simple strings but indicate an error condition.
    /// Format: `-<error message>\r\n`
    Error(String),

    /// 64-bit signed integers.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Bulk strings are binary-safe strings up to 512 MB.
    /// Format: `$<length>\r\n<data>\r\n`
    BulkString(Bytes),

    /// Null bulk string, null array, or RESP3 null.
    Null,

    /// Arrays can contain any RESP type, including nested arrays.
    /// Sets and pushes are folded into arrays.
    Array(Vec<RespValue>),

    /// RESP3 map: `%<count>\r\n<key><value>...`
    Map(Vec<(RespValue, RespValue)>),

    /// RESP3 boolean: `#t\r\n` / `#f\r\n`
    Boolean(bool),

    /// RESP3 double, kept as the server printed it.
    Double(String),

    /// RESP3 big number, kept as the server printed it.
    BigNumber(String),
}

impl RespValue {
    /// Creates a new bulk string frame.
    ///
    /// # Example
    /// ```
    /// use keylens::protocol::types::RespValue;
    /// use bytes::Bytes;
    /// let bulk = RespValue::bulk_string(Bytes::from("hello"));
    /// ```
    pub fn bulk_string(data: impl Into<Bytes>) -> Self {
        RespValue::BulkString(data.into())
    }

    /// Creates an array frame.
    pub fn array(values: Vec<RespValue>) -> Self {
        RespValue::Array(values)
    }

    /// Serializes the frame to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the frame into an existing buffer.
    ///
    /// RESP3-only frames are written in their RESP3 form; a client only ever
    /// sends arrays of bulk strings, so this matters for tests and fixtures.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => write_line(buf, prefix::SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(s) => write_line(buf, prefix::ERROR, s.as_bytes()),
            RespValue::Integer(n) => write_line(buf, prefix::INTEGER, n.to_string().as_bytes()),
            RespValue::BulkString(data) => {
                write_line(buf, prefix::BULK_STRING, data.len().to_string().as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF);
            }
            RespValue::Null => write_line(buf, prefix::BULK_STRING, b"-1"),
            RespValue::Array(values) => {
                write_line(buf, prefix::ARRAY, values.len().to_string().as_bytes());
                for value in values {
                    value.serialize_into(buf);
                }
            }
            RespValue::Map(pairs) => {
                write_line(buf, prefix::MAP, pairs.len().to_string().as_bytes());
                for (key, value) in pairs {
                    key.serialize_into(buf);
                    value.serialize_into(buf);
                }
            }
            RespValue::Boolean(b) => write_line(buf, prefix::BOOLEAN, if *b { b"t" } else { b"f" }),
            RespValue::Double(d) => write_line(buf, prefix::DOUBLE, d.as_bytes()),
            RespValue::BigNumber(n) => write_line(buf, prefix::BIG_NUMBER, n.as_bytes()),
        }
    }

    /// Returns true if this value is an error.
    pub fn is_error(&self) -> bool {
        matches!(self, RespValue::Error(_))
    }
}

fn write_line(buf: &mut Vec<u8>, prefix: u8, content: &[u8]) {
    buf.push(prefix);
    buf.extend_from_slice(content);
    buf.extend_from_slice(CRLF);
}

/// Encodes one command as a RESP array of bulk strings.
///
/// # Example
/// ```
/// use keylens::protocol::types::encode_command;
/// use bytes::Bytes;
/// let wire = encode_command(&[Bytes::from("GET"), Bytes::from("name")]);
/// assert_eq!(wire, b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n");
/// ```
pub fn encode_command(args: &[Bytes]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    encode_command_into(args, &mut buf);
    buf
}

/// Appends one encoded command to `buf`. Used to build pipelines.
pub fn encode_command_into(args: &[Bytes], buf: &mut Vec<u8>) {
    write_line(buf, prefix::ARRAY, args.len().to_string().as_bytes());
    for arg in args {
        write_line(buf, prefix::BULK_STRING, arg.len().to_string().as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(CRLF);
    }
}

impl fmt::Display for RespValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RespValue::SimpleString(s) => write!(f, "\"{}\"", s),
            RespValue::Error(s) => write!(f, "(error) {}", s),
            RespValue::Integer(n) => write!(f, "(integer) {}", n),
            RespValue::BulkString(data) => {
                if let Ok(s) = std::str::from_utf8(data) {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "(binary data, {} bytes)", data.len())
                }
            }
            RespValue::Null => write!(f, "(nil)"),
            RespValue::Array(values) => write!(f, "(array of {})", values.len()),
            RespValue::Map(pairs) => write!(f, "(map of {})", pairs.len()),
            RespValue::Boolean(b) => write!(f, "(boolean) {}", b),
            RespValue::Double(d) => write!(f, "(double) {}", d),
            RespValue::BigNumber(n) => write!(f, "(big number) {}", n),
        }
    }
}
