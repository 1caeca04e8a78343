//! One TCP connection to one Redis node.
//!
//! ## Round-trip
//!
//! ```text
//! 1. encode command(s) as RESP arrays
//!        │
//!        ▼
//! 2. write + flush
//!        │
//!        ▼
//! 3. ┌──────────────────────────────┐
//!    │  try to parse a frame from   │
//!    │  the buffer; if incomplete,  │<──┐
//!    │  read more bytes             │───┘
//!    └──────────────────────────────┘
//!        │  (until N frames parsed)
//!        ▼
//! 4. frames -> Reply, shaped by command
//! ```
//!
//! TCP is a stream protocol, so one read may carry a partial reply or many
//! replies; the `BytesMut` buffer accumulates bytes between parses. The
//! whole exchange runs under `tokio::time::timeout`.

use crate::config::{ConfigError, Settings};
use crate::connection::KeyspaceError;
use crate::protocol::{encode_command, encode_command_into, Reply, RespParser, RespValue};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

/// Initial buffer capacity
const INITIAL_BUFFER_SIZE: usize = 4096;

/// Connection parameters shared by every node of a deployment.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Database selected right after connecting; 0 skips `SELECT`.
    pub db: u32,
}

impl NodeOptions {
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let endpoint = settings.redis.endpoint()?;
        Ok(Self {
            connect_timeout: settings.connect_timeout(),
            command_timeout: settings.command_timeout(),
            username: endpoint.username,
            password: endpoint.password,
            db: endpoint.db,
        })
    }
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(30),
            username: None,
            password: None,
            db: 0,
        }
    }
}

/// A connected node plus its read buffer and parser.
pub struct NodeConnection {
    stream: BufWriter<TcpStream>,
    addr: String,
    buffer: BytesMut,
    parser: RespParser,
    command_timeout: Duration,
}

impl NodeConnection {
    /// Connects to `addr` (`host:port`), then authenticates and selects the
    /// configured database.
    pub async fn connect(addr: &str, options: &NodeOptions) -> Result<Self, KeyspaceError> {
        let stream = timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| KeyspaceError::ConnectTimeout {
                addr: addr.to_string(),
                timeout: options.connect_timeout,
            })??;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream: BufWriter::new(stream),
            addr: addr.to_string(),
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
            parser: RespParser::new(),
            command_timeout: options.command_timeout,
        };

        if let Some(password) = &options.password {
            let mut args = vec![Bytes::from_static(b"AUTH")];
            if let Some(username) = &options.username {
                args.push(Bytes::copy_from_slice(username.as_bytes()));
            }
            args.push(Bytes::copy_from_slice(password.as_bytes()));
            conn.round_trip(&args).await.map_err(|e| match e {
                KeyspaceError::Server(msg) => KeyspaceError::Auth(msg),
                other => other,
            })?;
        }

        if options.db != 0 {
            conn.round_trip(&[
                Bytes::from_static(b"SELECT"),
                Bytes::from(options.db.to_string()),
            ])
            .await?;
        }

        info!(addr = %conn.addr, db = options.db, "Connected to node");
        Ok(conn)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one command and reads its reply.
    pub async fn round_trip(&mut self, args: &[Bytes]) -> Result<Reply, KeyspaceError> {
        let wire = encode_command(args);
        let mut frames = self.exchange(&wire, 1).await?;
        let frame = frames.pop().ok_or(KeyspaceError::Disconnected)?;
        reply_for(frame, args)
    }

    /// Sends all commands in one write and reads one reply per command.
    pub async fn round_trip_many(
        &mut self,
        commands: &[Vec<Bytes>],
    ) -> Result<Vec<Result<Reply, KeyspaceError>>, KeyspaceError> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let mut wire = Vec::new();
        for args in commands {
            encode_command_into(args, &mut wire);
        }
        let frames = self.exchange(&wire, commands.len()).await?;
        Ok(frames
            .into_iter()
            .zip(commands)
            .map(|(frame, args)| reply_for(frame, args))
            .collect())
    }

    async fn exchange(
        &mut self,
        wire: &[u8],
        expected: usize,
    ) -> Result<Vec<RespValue>, KeyspaceError> {
        let limit = self.command_timeout;
        timeout(limit, self.exchange_inner(wire, expected))
            .await
            .map_err(|_| KeyspaceError::Timeout(limit))?
    }

    async fn exchange_inner(
        &mut self,
        wire: &[u8],
        expected: usize,
    ) -> Result<Vec<RespValue>, KeyspaceError> {
        self.stream.write_all(wire).await?;
        self.stream.flush().await?;
        trace!(addr = %self.addr, bytes = wire.len(), "Sent command");

        let mut frames = Vec::with_capacity(expected);
        while frames.len() < expected {
            match self.try_parse_frame()? {
                Some(frame) => frames.push(frame),
                None => self.read_more_data().await?,
            }
        }
        Ok(frames)
    }

    fn try_parse_frame(&mut self) -> Result<Option<RespValue>, KeyspaceError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        match self.parser.parse(&self.buffer)? {
            Some((frame, consumed)) => {
                let _ = self.buffer.split_to(consumed);
                Ok(Some(frame))
            }
            None => {
                trace!(
                    addr = %self.addr,
                    buffered = self.buffer.len(),
                    "Incomplete reply, need more data"
                );
                Ok(None)
            }
        }
    }

    async fn read_more_data(&mut self) -> Result<(), KeyspaceError> {
        if self.buffer.capacity() - self.buffer.len() < 1024 {
            self.buffer.reserve(INITIAL_BUFFER_SIZE);
        }
        let n = self.stream.get_mut().read_buf(&mut self.buffer).await?;
        if n == 0 {
            debug!(addr = %self.addr, "Server closed connection");
            return Err(KeyspaceError::Disconnected);
        }
        trace!(addr = %self.addr, bytes = n, "Read data");
        Ok(())
    }
}

fn reply_for(frame: RespValue, args: &[Bytes]) -> Result<Reply, KeyspaceError> {
    Reply::from_frame(frame)
        .map(|reply| reply.shaped_for(args))
        .map_err(KeyspaceError::Server)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::net::TcpListener;

    /// Spawns a server that answers each parsed command with the next
    /// scripted response. Returns its address.
    pub(crate) async fn scripted_server(responses: Vec<&'static [u8]>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut script: VecDeque<&'static [u8]> = responses.into();
            let mut parser = RespParser::new();
            let mut buf = BytesMut::new();
            loop {
                while let Ok(Some((_, consumed))) = parser.parse(&buf) {
                    let _ = buf.split_to(consumed);
                    match script.pop_front() {
                        Some(resp) => socket.write_all(resp).await.unwrap(),
                        None => return,
                    }
                }
                match socket.read_buf(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                }
            }
        });

        addr
    }

    fn options() -> NodeOptions {
        NodeOptions {
            command_timeout: Duration::from_millis(200),
            ..NodeOptions::default()
        }
    }

    #[tokio::test]
    async fn test_round_trip() {
        let addr = scripted_server(vec![b"$3\r\nada\r\n"]).await;
        let mut conn = NodeConnection::connect(&addr, &options()).await.unwrap();
        let reply = conn
            .round_trip(&[Bytes::from("GET"), Bytes::from("name")])
            .await
            .unwrap();
        assert_eq!(reply, Reply::bulk("ada"));
    }

    #[tokio::test]
    async fn test_server_error_reply() {
        let addr = scripted_server(vec![b"-ERR unknown command 'NOPE'\r\n"]).await;
        let mut conn = NodeConnection::connect(&addr, &options()).await.unwrap();
        let err = conn.round_trip(&[Bytes::from("NOPE")]).await.unwrap_err();
        assert!(matches!(err, KeyspaceError::Server(ref m) if m.starts_with("ERR unknown")));
    }

    #[tokio::test]
    async fn test_auth_and_select_on_connect() {
        let addr = scripted_server(vec![b"+OK\r\n", b"+OK\r\n", b":42\r\n"]).await;
        let opts = NodeOptions {
            password: Some("secret".into()),
            db: 3,
            ..options()
        };
        let mut conn = NodeConnection::connect(&addr, &opts).await.unwrap();
        let reply = conn.round_trip(&[Bytes::from("DBSIZE")]).await.unwrap();
        assert_eq!(reply, Reply::Integer(42));
    }

    #[tokio::test]
    async fn test_auth_failure() {
        let addr = scripted_server(vec![b"-WRONGPASS invalid username-password pair\r\n"]).await;
        let opts = NodeOptions {
            password: Some("bad".into()),
            ..options()
        };
        let err = NodeConnection::connect(&addr, &opts).await.err().unwrap();
        assert!(matches!(err, KeyspaceError::Auth(_)));
    }

    #[tokio::test]
    async fn test_pipeline_keeps_per_entry_errors() {
        let addr = scripted_server(vec![b"+OK\r\n", b"-WRONGTYPE nope\r\n", b":1\r\n"]).await;
        let mut conn = NodeConnection::connect(&addr, &options()).await.unwrap();
        let replies = conn
            .round_trip_many(&[
                vec![Bytes::from("SET"), Bytes::from("a"), Bytes::from("1")],
                vec![Bytes::from("LLEN"), Bytes::from("a")],
                vec![Bytes::from("EXISTS"), Bytes::from("a")],
            ])
            .await
            .unwrap();
        assert_eq!(replies.len(), 3);
        assert_eq!(replies[0].as_ref().unwrap(), &Reply::text("OK"));
        assert!(replies[1].is_err());
        assert_eq!(replies[2].as_ref().unwrap(), &Reply::Integer(1));
    }

    #[tokio::test]
    async fn test_timeout() {
        // Script is empty: the server reads the command and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            while let Ok(n) = socket.read(&mut buf).await {
                if n == 0 {
                    break;
                }
            }
        });

        let mut conn = NodeConnection::connect(&addr, &options()).await.unwrap();
        let err = conn.round_trip(&[Bytes::from("PING")]).await.unwrap_err();
        assert!(matches!(err, KeyspaceError::Timeout(d) if d == Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn test_info_reply_is_shaped() {
        let addr = scripted_server(vec![b"$31\r\n# Server\r\nredis_version:7.2.4\r\n\r\n"]).await;
        let mut conn = NodeConnection::connect(&addr, &options()).await.unwrap();
        let reply = conn.round_trip(&[Bytes::from("INFO")]).await.unwrap();
        assert_eq!(reply.field("redis_version"), Some(&Reply::text("7.2.4")));
    }
}
