//! RESP Protocol Implementation (client side)
//!
//! This module speaks the Redis Serialization Protocol from the client's
//! seat: commands go out as arrays of bulk strings, replies come back as
//! RESP2 or RESP3 frames and are converted into [`Reply`] values.
//!
//! ## Modules
//!
//! - `types`: the `RespValue` frame and command encoding
//! - `parser`: incremental parser for server replies
//! - `reply`: the closed `Reply` shape used above the connection boundary
//!
//! ## Example
//!
//! ```
//! use keylens::protocol::{encode_command, parse_message, Reply};
//! use bytes::Bytes;
//!
//! let wire = encode_command(&[Bytes::from("GET"), Bytes::from("name")]);
//! assert!(wire.starts_with(b"*2\r\n"));
//!
//! let (frame, _) = parse_message(b"$3\r\nada\r\n").unwrap().unwrap();
//! assert_eq!(Reply::from_frame(frame), Ok(Reply::bulk("ada")));
//! ```

pub mod parser;
pub mod reply;
pub mod types;

// Re-export commonly used types for convenience
pub use parser::{parse_message, ParseError, ParseResult, RespParser};
pub use reply::{parse_info_text, Reply};
pub use types::{encode_command, encode_command_into, RespValue};
