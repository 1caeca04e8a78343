//! In-memory [`Keyspace`] used by unit tests.
//!
//! Models typed keys with TTLs across 16 databases, cursor-paged `SCAN`
//! with glob `MATCH`, shard handles, and injected failures. Every command
//! that reaches it is recorded, so tests can assert on what was (or was
//! not) sent.

use crate::connection::{Keyspace, KeyspaceError, PipelineResult, TopologyMode};
use crate::protocol::Reply;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const DATABASES: u32 = 16;

/// A typed value held by the fake.
#[derive(Debug, Clone)]
pub enum FakeValue {
    Str(Bytes),
    List(Vec<Bytes>),
    Set(Vec<Bytes>),
    ZSet(Vec<(Bytes, f64)>),
    Hash(Vec<(Bytes, Bytes)>),
    Stream(Vec<(String, Vec<(Bytes, Bytes)>)>),
}

impl FakeValue {
    pub fn text(s: &str) -> Self {
        FakeValue::Str(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// A string value of `len` bytes.
    pub fn blob(len: usize) -> Self {
        FakeValue::Str(Bytes::from(vec![b'x'; len]))
    }

    pub fn list(n: usize) -> Self {
        FakeValue::List((0..n).map(|i| Bytes::from(format!("item-{}", i))).collect())
    }

    pub fn set(n: usize) -> Self {
        FakeValue::Set((0..n).map(|i| Bytes::from(format!("member-{}", i))).collect())
    }

    pub fn zset(n: usize) -> Self {
        FakeValue::ZSet(
            (0..n)
                .map(|i| (Bytes::from(format!("member-{}", i)), i as f64))
                .collect(),
        )
    }

    pub fn hash(n: usize) -> Self {
        FakeValue::Hash(
            (0..n)
                .map(|i| {
                    (
                        Bytes::from(format!("field-{}", i)),
                        Bytes::from(format!("value-{}", i)),
                    )
                })
                .collect(),
        )
    }

    pub fn stream(n: usize) -> Self {
        FakeValue::Stream(
            (0..n)
                .map(|i| {
                    (
                        format!("{}-0", i + 1),
                        vec![(Bytes::from("n"), Bytes::from(i.to_string()))],
                    )
                })
                .collect(),
        )
    }

    fn type_name(&self) -> &'static str {
        match self {
            FakeValue::Str(_) => "string",
            FakeValue::List(_) => "list",
            FakeValue::Set(_) => "set",
            FakeValue::ZSet(_) => "zset",
            FakeValue::Hash(_) => "hash",
            FakeValue::Stream(_) => "stream",
        }
    }

    fn default_encoding(&self) -> &'static str {
        match self {
            FakeValue::Str(b) if b.len() <= 44 => "embstr",
            FakeValue::Str(_) => "raw",
            FakeValue::List(_) => "quicklist",
            FakeValue::Set(_) => "hashtable",
            FakeValue::ZSet(_) => "skiplist",
            FakeValue::Hash(_) => "hashtable",
            FakeValue::Stream(_) => "stream",
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            FakeValue::Str(b) => b.len(),
            FakeValue::List(v) | FakeValue::Set(v) => v.iter().map(Bytes::len).sum(),
            FakeValue::ZSet(v) => v.iter().map(|(m, _)| m.len() + 8).sum(),
            FakeValue::Hash(v) => v.iter().map(|(f, x)| f.len() + x.len()).sum(),
            FakeValue::Stream(v) => v.len() * 32,
        }
    }
}

/// A failure injected for a command.
#[derive(Debug, Clone)]
pub enum FakeFailure {
    Server(String),
    Timeout(Duration),
    Disconnected,
}

impl FakeFailure {
    fn to_error(&self) -> KeyspaceError {
        match self {
            FakeFailure::Server(msg) => KeyspaceError::Server(msg.clone()),
            FakeFailure::Timeout(d) => KeyspaceError::Timeout(*d),
            FakeFailure::Disconnected => KeyspaceError::Disconnected,
        }
    }
}

#[derive(Debug, Clone)]
struct FakeEntry {
    value: FakeValue,
    ttl: Option<i64>,
    memory: Option<i64>,
}

#[derive(Default)]
struct State {
    dbs: HashMap<u32, BTreeMap<Bytes, FakeEntry>>,
    db: u32,
    /// Keys listed by SCAN that no longer exist when probed.
    ghosts: HashSet<Bytes>,
    calls: Vec<Vec<Bytes>>,
    /// (COMMAND, optional key) -> failure
    failures: HashMap<(String, Option<Bytes>), FakeFailure>,
    /// Uppercased argument prefix -> canned reply
    canned: Vec<(Vec<String>, Reply)>,
    pipeline_failure: Option<FakeFailure>,
    memory_unsupported: bool,
    round_trip_time: Option<Duration>,
}

impl State {
    fn keys(&self) -> Option<&BTreeMap<Bytes, FakeEntry>> {
        self.dbs.get(&self.db)
    }

    fn entry(&self, key: &Bytes) -> Option<&FakeEntry> {
        self.keys().and_then(|k| k.get(key))
    }
}

pub struct FakeKeyspace {
    state: Mutex<State>,
    mode: TopologyMode,
    shards: Option<Vec<Arc<FakeKeyspace>>>,
    name: String,
}

impl FakeKeyspace {
    pub fn new() -> Self {
        Self::named("fake:6379")
    }

    pub fn named(name: &str) -> Self {
        Self {
            state: Mutex::new(State::default()),
            mode: TopologyMode::Single,
            shards: None,
            name: name.to_string(),
        }
    }

    /// A sharded entry point that enumerates `shards`.
    pub fn sharded(shards: Vec<Arc<FakeKeyspace>>) -> Self {
        Self {
            mode: TopologyMode::Sharded,
            shards: Some(shards),
            ..Self::named("fake-cluster")
        }
    }

    /// A sharded entry point that cannot enumerate its shards.
    pub fn sharded_without_listing() -> Self {
        Self {
            mode: TopologyMode::Sharded,
            ..Self::named("fake-cluster")
        }
    }

    pub fn with_mode(mut self, mode: TopologyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn insert(&self, key: &str, value: FakeValue) {
        self.insert_bytes(Bytes::copy_from_slice(key.as_bytes()), value);
    }

    pub fn insert_bytes(&self, key: Bytes, value: FakeValue) {
        let mut state = self.state.lock().unwrap();
        let db = state.db;
        state.dbs.entry(db).or_default().insert(
            key,
            FakeEntry {
                value,
                ttl: None,
                memory: None,
            },
        );
    }

    /// Inserts into a database other than the selected one.
    pub fn insert_in(&self, db: u32, key: &str, value: FakeValue) {
        let mut state = self.state.lock().unwrap();
        state.dbs.entry(db).or_default().insert(
            Bytes::copy_from_slice(key.as_bytes()),
            FakeEntry {
                value,
                ttl: None,
                memory: None,
            },
        );
    }

    pub fn set_ttl(&self, key: &str, secs: i64) {
        self.update(key, |e| e.ttl = Some(secs));
    }

    pub fn set_memory(&self, key: &str, bytes: i64) {
        self.update(key, |e| e.memory = Some(bytes));
    }

    fn update(&self, key: &str, f: impl FnOnce(&mut FakeEntry)) {
        let mut state = self.state.lock().unwrap();
        let db = state.db;
        if let Some(entry) = state
            .dbs
            .entry(db)
            .or_default()
            .get_mut(key.as_bytes())
        {
            f(entry);
        }
    }

    /// A key SCAN still lists but every probe reports as gone.
    pub fn ghost(&self, key: &str) {
        self.state
            .lock()
            .unwrap()
            .ghosts
            .insert(Bytes::copy_from_slice(key.as_bytes()));
    }

    /// Fails every call of `command`.
    pub fn fail(&self, command: &str, failure: FakeFailure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((command.to_ascii_uppercase(), None), failure);
    }

    /// Fails `command` only when issued against `key`.
    pub fn fail_key(&self, command: &str, key: &str, failure: FakeFailure) {
        self.state.lock().unwrap().failures.insert(
            (
                command.to_ascii_uppercase(),
                Some(Bytes::copy_from_slice(key.as_bytes())),
            ),
            failure,
        );
    }

    pub fn fail_pipeline(&self, failure: FakeFailure) {
        self.state.lock().unwrap().pipeline_failure = Some(failure);
    }

    /// Reports `elapsed` from `issue_timed` instead of measuring.
    pub fn set_round_trip_time(&self, elapsed: Duration) {
        self.state.lock().unwrap().round_trip_time = Some(elapsed);
    }

    pub fn disable_memory_usage(&self) {
        self.state.lock().unwrap().memory_unsupported = true;
    }

    /// Answers any command starting with `prefix` (case-insensitive) with
    /// `reply`.
    pub fn respond(&self, prefix: &[&str], reply: Reply) {
        let prefix = prefix.iter().map(|p| p.to_ascii_uppercase()).collect();
        self.state.lock().unwrap().canned.push((prefix, reply));
    }

    /// Every command received, as space-joined text.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .map(|args| {
                args.iter()
                    .map(|a| String::from_utf8_lossy(a).into_owned())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    /// Calls whose command name matches `name`.
    pub fn calls_named(&self, name: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|args| args.first().is_some_and(|n| n.eq_ignore_ascii_case(name.as_bytes())))
            .count()
    }

    pub fn selected_db(&self) -> u32 {
        self.state.lock().unwrap().db
    }

    /// The shard holding the command's key, for a sharded entry point.
    fn owner_of(&self, args: &[Bytes]) -> Option<&Arc<FakeKeyspace>> {
        let shards = self.shards.as_ref()?;
        let name = String::from_utf8_lossy(args.first()?).to_ascii_uppercase();
        let key = key_arg(&name, args)?;
        shards.iter().find(|shard| {
            let state = shard.state.lock().unwrap();
            state.ghosts.contains(&key) || state.entry(&key).is_some()
        })
    }

    fn dispatch(&self, args: &[Bytes]) -> Result<Reply, KeyspaceError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(args.to_vec());

        let Some(name) = args.first() else {
            return Err(KeyspaceError::Server("ERR empty command".into()));
        };
        let name = String::from_utf8_lossy(name).to_ascii_uppercase();
        let upper: Vec<String> = args
            .iter()
            .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
            .collect();

        let key = key_arg(&name, args);
        if let Some(failure) = key
            .as_ref()
            .and_then(|k| state.failures.get(&(name.clone(), Some(k.clone()))))
            .or_else(|| state.failures.get(&(name.clone(), None)))
        {
            return Err(failure.to_error());
        }
        if let Some((_, reply)) = state
            .canned
            .iter()
            .find(|(prefix, _)| upper.len() >= prefix.len() && upper[..prefix.len()] == prefix[..])
        {
            return Ok(reply.clone());
        }

        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let int_arg = |i: usize| -> Option<i64> {
            args.get(i)
                .and_then(|a| std::str::from_utf8(a).ok())
                .and_then(|s| s.parse().ok())
        };

        if let Some(k) = &key {
            if state.ghosts.contains(k) {
                return Ok(match name.as_str() {
                    "TYPE" => Reply::text("none"),
                    "TTL" => Reply::Integer(-2),
                    "GET" | "OBJECT" | "MEMORY" => Reply::Nil,
                    _ => Reply::Integer(0),
                });
            }
        }

        match name.as_str() {
            "PING" => Ok(Reply::text("PONG")),
            "SELECT" => match int_arg(1) {
                Some(db) if (0..DATABASES as i64).contains(&db) => {
                    state.db = db as u32;
                    Ok(Reply::text("OK"))
                }
                _ => Err(KeyspaceError::Server("ERR DB index is out of range".into())),
            },
            "DBSIZE" => Ok(Reply::Integer(state.keys().map_or(0, |k| k.len()) as i64)),
            "FLUSHDB" => {
                let db = state.db;
                state.dbs.remove(&db);
                Ok(Reply::text("OK"))
            }
            "FLUSHALL" => {
                state.dbs.clear();
                Ok(Reply::text("OK"))
            }
            "SCAN" => Ok(scan(&state, args)),
            "KEYS" => {
                let pattern = arg(1);
                let keys = state
                    .keys()
                    .map(|keys| {
                        keys.keys()
                            .filter(|k| glob_match(&pattern, k))
                            .map(|k| Reply::Bulk(k.clone()))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Reply::List(keys))
            }
            "SET" => {
                let db = state.db;
                state.dbs.entry(db).or_default().insert(
                    arg(1),
                    FakeEntry {
                        value: FakeValue::Str(arg(2)),
                        ttl: None,
                        memory: None,
                    },
                );
                Ok(Reply::text("OK"))
            }
            "DEL" => {
                let db = state.db;
                let keys = state.dbs.entry(db).or_default();
                let removed = args[1..].iter().filter(|k| keys.remove(*k).is_some()).count();
                Ok(Reply::Integer(removed as i64))
            }
            "TYPE" => Ok(Reply::text(
                state
                    .entry(&arg(1))
                    .map_or("none", |e| e.value.type_name()),
            )),
            "TTL" => Ok(Reply::Integer(match state.entry(&arg(1)) {
                None => -2,
                Some(e) => e.ttl.unwrap_or(-1),
            })),
            "GET" => match state.entry(&arg(1)) {
                None => Ok(Reply::Nil),
                Some(FakeEntry {
                    value: FakeValue::Str(b),
                    ..
                }) => Ok(Reply::Bulk(b.clone())),
                Some(_) => Err(wrongtype()),
            },
            "STRLEN" | "LLEN" | "SCARD" | "ZCARD" | "HLEN" | "XLEN" => {
                let len = match (name.as_str(), state.entry(&arg(1)).map(|e| &e.value)) {
                    (_, None) => 0,
                    ("STRLEN", Some(FakeValue::Str(b))) => b.len(),
                    ("LLEN", Some(FakeValue::List(v))) => v.len(),
                    ("SCARD", Some(FakeValue::Set(v))) => v.len(),
                    ("ZCARD", Some(FakeValue::ZSet(v))) => v.len(),
                    ("HLEN", Some(FakeValue::Hash(v))) => v.len(),
                    ("XLEN", Some(FakeValue::Stream(v))) => v.len(),
                    _ => return Err(wrongtype()),
                };
                Ok(Reply::Integer(len as i64))
            }
            "OBJECT" if upper.get(1).map(String::as_str) == Some("ENCODING") => {
                Ok(state.entry(&arg(2)).map_or(Reply::Nil, |e| {
                    Reply::bulk(e.value.default_encoding())
                }))
            }
            "MEMORY" if upper.get(1).map(String::as_str) == Some("USAGE") => {
                if state.memory_unsupported {
                    return Err(KeyspaceError::Server(
                        "ERR unknown command 'MEMORY'".into(),
                    ));
                }
                Ok(state.entry(&arg(2)).map_or(Reply::Nil, |e| {
                    Reply::Integer(
                        e.memory
                            .unwrap_or(56 + arg(2).len() as i64 + e.value.payload_len() as i64),
                    )
                }))
            }
            "GETRANGE" => match state.entry(&arg(1)).map(|e| &e.value) {
                None => Ok(Reply::bulk("")),
                Some(FakeValue::Str(b)) => {
                    let start = int_arg(2).unwrap_or(0).max(0) as usize;
                    let end = (int_arg(3).unwrap_or(-1).max(0) as usize + 1).min(b.len());
                    Ok(Reply::Bulk(if start < end {
                        b.slice(start..end)
                    } else {
                        Bytes::new()
                    }))
                }
                Some(_) => Err(wrongtype()),
            },
            "LRANGE" => match state.entry(&arg(1)).map(|e| &e.value) {
                None => Ok(Reply::List(Vec::new())),
                Some(FakeValue::List(v)) => {
                    let items = range(v, int_arg(2).unwrap_or(0), int_arg(3).unwrap_or(-1));
                    Ok(Reply::List(items.iter().cloned().map(Reply::Bulk).collect()))
                }
                Some(_) => Err(wrongtype()),
            },
            "ZRANGE" => match state.entry(&arg(1)).map(|e| &e.value) {
                None => Ok(Reply::List(Vec::new())),
                Some(FakeValue::ZSet(v)) => {
                    let with_scores = upper.iter().any(|a| a == "WITHSCORES");
                    let mut out = Vec::new();
                    for (member, score) in range(v, int_arg(2).unwrap_or(0), int_arg(3).unwrap_or(-1)) {
                        out.push(Reply::Bulk(member.clone()));
                        if with_scores {
                            out.push(Reply::bulk(score.to_string()));
                        }
                    }
                    Ok(Reply::List(out))
                }
                Some(_) => Err(wrongtype()),
            },
            "SSCAN" | "HSCAN" => {
                let count = count_arg(&upper, args).unwrap_or(10);
                let items: Vec<Reply> = match state.entry(&arg(1)).map(|e| &e.value) {
                    None => Vec::new(),
                    Some(FakeValue::Set(v)) if name == "SSCAN" => {
                        v.iter().take(count).cloned().map(Reply::Bulk).collect()
                    }
                    Some(FakeValue::Hash(v)) if name == "HSCAN" => v
                        .iter()
                        .take(count)
                        .flat_map(|(f, x)| [Reply::Bulk(f.clone()), Reply::Bulk(x.clone())])
                        .collect(),
                    Some(_) => return Err(wrongtype()),
                };
                Ok(Reply::List(vec![Reply::bulk("0"), Reply::List(items)]))
            }
            "XRANGE" => match state.entry(&arg(1)).map(|e| &e.value) {
                None => Ok(Reply::List(Vec::new())),
                Some(FakeValue::Stream(v)) => {
                    let count = count_arg(&upper, args).unwrap_or(v.len());
                    Ok(Reply::List(
                        v.iter()
                            .take(count)
                            .map(|(id, fields)| {
                                Reply::List(vec![
                                    Reply::bulk(id.clone()),
                                    Reply::List(
                                        fields
                                            .iter()
                                            .flat_map(|(f, x)| {
                                                [Reply::Bulk(f.clone()), Reply::Bulk(x.clone())]
                                            })
                                            .collect(),
                                    ),
                                ])
                            })
                            .collect(),
                    ))
                }
                Some(_) => Err(wrongtype()),
            },
            "INFO" => {
                let keys = state.keys().map_or(0, |k| k.len());
                let text = format!(
                    "# Server\r\nredis_version:7.2.4\r\nuptime_in_seconds:3600\r\ntcp_port:6379\r\n\
                     # Clients\r\nconnected_clients:3\r\n\
                     # Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n\
                     # Stats\r\ntotal_commands_processed:1234\r\n\
                     # Replication\r\nrole:master\r\n\
                     # Keyspace\r\ndb{}:keys={},expires=0,avg_ttl=0\r\n",
                    state.db, keys
                );
                Ok(Reply::bulk(text).shaped_for(args))
            }
            _ => Err(KeyspaceError::Server(format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(&args[0])
            ))),
        }
    }
}

impl Default for FakeKeyspace {
    fn default() -> Self {
        Self::new()
    }
}

fn wrongtype() -> KeyspaceError {
    KeyspaceError::Server(
        "WRONGTYPE Operation against a key holding the wrong kind of value".into(),
    )
}

fn key_arg(name: &str, args: &[Bytes]) -> Option<Bytes> {
    let pos = match name {
        "OBJECT" | "MEMORY" => 2,
        "PING" | "SCAN" | "KEYS" | "DBSIZE" | "SELECT" | "INFO" | "FLUSHDB" | "FLUSHALL"
        | "CLUSTER" | "COMMAND" | "CONFIG" => return None,
        _ => 1,
    };
    args.get(pos).cloned()
}

fn count_arg(upper: &[String], args: &[Bytes]) -> Option<usize> {
    let pos = upper.iter().position(|a| a == "COUNT")?;
    std::str::from_utf8(args.get(pos + 1)?).ok()?.parse().ok()
}

fn range<T>(items: &[T], start: i64, stop: i64) -> &[T] {
    let len = items.len() as i64;
    let norm = |i: i64| if i < 0 { (len + i).max(0) } else { i };
    let start = norm(start);
    let stop = norm(stop).min(len - 1);
    if len == 0 || start > stop {
        return &[];
    }
    &items[start as usize..=stop as usize]
}

/// Cursor is the offset into the sorted key list (ghost keys included).
fn scan(state: &State, args: &[Bytes]) -> Reply {
    let upper: Vec<String> = args
        .iter()
        .map(|a| String::from_utf8_lossy(a).to_ascii_uppercase())
        .collect();
    let cursor: usize = args
        .get(1)
        .and_then(|a| std::str::from_utf8(a).ok())
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let pattern = upper
        .iter()
        .position(|a| a == "MATCH")
        .and_then(|i| args.get(i + 1).cloned())
        .unwrap_or_else(|| Bytes::from_static(b"*"));
    let count = count_arg(&upper, args).unwrap_or(10).max(1);

    let mut all: Vec<Bytes> = state
        .keys()
        .map(|keys| keys.keys().cloned().collect())
        .unwrap_or_default();
    all.extend(state.ghosts.iter().cloned());
    all.sort();
    all.dedup();

    let end = (cursor + count).min(all.len());
    let page = if cursor < end { &all[cursor..end] } else { &[][..] };
    let next = if end >= all.len() { 0 } else { end };
    let keys = page
        .iter()
        .filter(|k| glob_match(&pattern, k))
        .map(|k| Reply::Bulk(k.clone()))
        .collect();
    Reply::List(vec![Reply::bulk(next.to_string()), Reply::List(keys)])
}

/// Glob matching as used by `KEYS` / `SCAN MATCH`: `*`, `?`, `[...]`
/// (with `^` negation and ranges) and `\` escapes.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    if pattern.is_empty() {
        return text.is_empty();
    }
    match pattern[0] {
        b'*' => (0..=text.len()).any(|i| glob_match(&pattern[1..], &text[i..])),
        b'?' => !text.is_empty() && glob_match(&pattern[1..], &text[1..]),
        b'[' => {
            let Some(&c) = text.first() else {
                return false;
            };
            let negate = pattern.get(1) == Some(&b'^');
            let mut i = if negate { 2 } else { 1 };
            let mut matched = false;
            while i < pattern.len() && pattern[i] != b']' {
                if i + 2 < pattern.len() && pattern[i + 1] == b'-' && pattern[i + 2] != b']' {
                    matched |= pattern[i] <= c && c <= pattern[i + 2];
                    i += 3;
                } else {
                    matched |= pattern[i] == c;
                    i += 1;
                }
            }
            i < pattern.len() && matched != negate && glob_match(&pattern[i + 1..], &text[1..])
        }
        b'\\' if pattern.len() > 1 => {
            text.first() == Some(&pattern[1]) && glob_match(&pattern[2..], &text[1..])
        }
        c => text.first() == Some(&c) && glob_match(&pattern[1..], &text[1..]),
    }
}

#[async_trait]
impl Keyspace for FakeKeyspace {
    async fn issue(&self, args: &[Bytes]) -> Result<Reply, KeyspaceError> {
        if let Some(shard) = self.owner_of(args) {
            self.state.lock().unwrap().calls.push(args.to_vec());
            return shard.dispatch(args);
        }
        self.dispatch(args)
    }

    async fn issue_timed(&self, args: &[Bytes]) -> (Result<Reply, KeyspaceError>, Duration) {
        let started = std::time::Instant::now();
        let reply = self.issue(args).await;
        let fixed = self.state.lock().unwrap().round_trip_time;
        (reply, fixed.unwrap_or_else(|| started.elapsed()))
    }

    async fn pipeline(&self, commands: &[Vec<Bytes>]) -> Result<PipelineResult, KeyspaceError> {
        let failure = self.state.lock().unwrap().pipeline_failure.clone();
        if let Some(failure) = failure {
            self.state.lock().unwrap().calls.extend(commands.iter().cloned());
            return Err(failure.to_error());
        }
        Ok(commands.iter().map(|args| self.dispatch(args)).collect())
    }

    fn topology(&self) -> TopologyMode {
        self.mode
    }

    async fn shards(&self) -> Result<Vec<Arc<dyn Keyspace>>, KeyspaceError> {
        match &self.shards {
            Some(shards) => Ok(shards
                .iter()
                .map(|s| Arc::clone(s) as Arc<dyn Keyspace>)
                .collect()),
            None => Err(KeyspaceError::ShardsUnsupported),
        }
    }

    async fn select_database(&self, db: u32) -> Result<(), KeyspaceError> {
        if self.mode == TopologyMode::Sharded {
            return Err(KeyspaceError::Unsupported(
                "database selection is not available in sharded mode".into(),
            ));
        }
        self.dispatch(&[Bytes::from_static(b"SELECT"), Bytes::from(db.to_string())])?;
        Ok(())
    }

    fn current_database(&self) -> Option<u32> {
        match self.mode {
            TopologyMode::Sharded => None,
            _ => Some(self.selected_db()),
        }
    }

    fn endpoint(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::argv;

    #[test]
    fn test_glob_match() {
        assert!(glob_match(b"h*llo", b"hello"));
        assert!(glob_match(b"h*llo", b"hllo"));
        assert!(glob_match(b"h?llo", b"hallo"));
        assert!(!glob_match(b"h?llo", b"hllo"));
        assert!(glob_match(b"h[ae]llo", b"hello"));
        assert!(!glob_match(b"h[ae]llo", b"hillo"));
        assert!(glob_match(b"h[^e]llo", b"hallo"));
        assert!(glob_match(b"user:[0-9]", b"user:7"));
        assert!(glob_match(b"a\\*b", b"a*b"));
        assert!(!glob_match(b"a\\*b", b"axb"));
        assert!(glob_match(b"*", b""));
    }

    #[tokio::test]
    async fn test_scan_pages_through_everything() {
        let fake = FakeKeyspace::new();
        for i in 0..25 {
            fake.insert(&format!("k{:02}", i), FakeValue::text("v"));
        }
        let mut cursor = "0".to_string();
        let mut seen = 0;
        loop {
            let reply = fake
                .issue(&argv(["SCAN", cursor.as_str(), "COUNT", "10"]))
                .await
                .unwrap();
            let parts = reply.into_list().unwrap();
            cursor = parts[0].as_str().unwrap().to_string();
            seen += parts[1].as_list().unwrap().len();
            if cursor == "0" {
                break;
            }
        }
        assert_eq!(seen, 25);
        assert_eq!(fake.calls_named("SCAN"), 3);
    }

    #[tokio::test]
    async fn test_ghost_key_reports_none() {
        let fake = FakeKeyspace::new();
        fake.ghost("gone");
        let reply = fake.issue(&argv(["TYPE", "gone"])).await.unwrap();
        assert_eq!(reply, Reply::text("none"));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let fake = FakeKeyspace::new();
        fake.fail_key("STRLEN", "bad", FakeFailure::Disconnected);
        fake.insert("bad", FakeValue::text("x"));
        fake.insert("good", FakeValue::text("x"));
        assert!(fake.issue(&argv(["STRLEN", "bad"])).await.is_err());
        assert_eq!(
            fake.issue(&argv(["STRLEN", "good"])).await.unwrap(),
            Reply::Integer(1)
        );
    }
}
