//! Settings: loading from TOML, environment overrides, and validation.
//!
//! Resolution order, later wins:
//! 1. built-in defaults
//! 2. the TOML file, if one is given
//! 3. environment variables (`REDIS_HOST`, `LARGE_KEY_THRESHOLD`, ...)
//! 4. command-line flags (applied by the binary)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while building [`Settings`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {name}: '{value}'")]
    InvalidEnv { name: String, value: String },

    #[error("invalid redis url: {0}")]
    InvalidUrl(String),

    #[error("invalid settings: {0}")]
    Invalid(String),
}

/// How the deployment is laid out.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    #[default]
    Single,
    Cluster,
    Sentinel,
}

impl RedisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RedisMode::Single => "single",
            RedisMode::Cluster => "cluster",
            RedisMode::Sentinel => "sentinel",
        }
    }
}

impl fmt::Display for RedisMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedisMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(RedisMode::Single),
            "cluster" => Ok(RedisMode::Cluster),
            "sentinel" => Ok(RedisMode::Sentinel),
            other => Err(format!("unknown redis mode '{}'", other)),
        }
    }
}

/// Connection settings for the target deployment.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RedisSettings {
    /// `redis://[user:pass@]host[:port][/db]`; wins over host/port/db/password.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub db: u32,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub mode: RedisMode,
    /// `host:port` seeds for cluster mode.
    #[serde(default)]
    pub cluster_nodes: Vec<String>,
    /// `host:port` sentinels for sentinel mode.
    #[serde(default)]
    pub sentinel_hosts: Vec<String>,
    #[serde(default = "default_sentinel_service")]
    pub sentinel_service: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: f64,
}

/// Large-key analysis tuning.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AnalysisSettings {
    /// A key is large when its size metric is at least this value. The same
    /// number is compared against byte lengths and element counts.
    #[serde(default = "default_large_key_threshold")]
    pub large_key_threshold: u64,
    /// `COUNT` hint passed to every `SCAN` call.
    #[serde(default = "default_scan_count")]
    pub scan_count: u32,
    /// Default cap on keys visited by one analysis.
    #[serde(default = "default_max_scan_keys")]
    pub max_scan_keys: usize,
}

/// Command execution safety settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CommandSettings {
    #[serde(default = "default_dangerous_commands")]
    pub dangerous_commands: Vec<String>,
    #[serde(default)]
    pub enable_dangerous_commands: bool,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: f64,
}

/// All settings consumed by the tool.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
    #[serde(default)]
    pub commands: CommandSettings,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    6379
}
fn default_sentinel_service() -> String {
    "mymaster".to_string()
}
fn default_connect_timeout_secs() -> f64 {
    5.0
}
fn default_large_key_threshold() -> u64 {
    1024 * 1024 // 1 MB
}
fn default_scan_count() -> u32 {
    1000
}
fn default_max_scan_keys() -> usize {
    100_000
}
fn default_dangerous_commands() -> Vec<String> {
    [
        "FLUSHDB", "FLUSHALL", "SHUTDOWN", "CONFIG", "EVAL", "EVALSHA", "SCRIPT", "DEBUG",
        "MONITOR", "SYNC", "PSYNC",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_command_timeout_secs() -> f64 {
    30.0
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            db: 0,
            username: None,
            password: None,
            mode: RedisMode::default(),
            cluster_nodes: Vec::new(),
            sentinel_hosts: Vec::new(),
            sentinel_service: default_sentinel_service(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            large_key_threshold: default_large_key_threshold(),
            scan_count: default_scan_count(),
            max_scan_keys: default_max_scan_keys(),
        }
    }
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            dangerous_commands: default_dangerous_commands(),
            enable_dangerous_commands: false,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

/// A resolved `host:port/db` target plus credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Settings {
    /// Builds settings from an optional file plus the process environment,
    /// then validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads a TOML settings file. Missing sections and fields take defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded settings file");
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(contents)?)
    }

    /// Applies environment overrides through `lookup`, which maps a variable
    /// name to its value. Taking a closure keeps tests off the real env.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let redis = &mut self.redis;
        if let Some(v) = lookup("REDIS_URL") {
            redis.url = Some(v);
        }
        if let Some(v) = lookup("REDIS_HOST") {
            redis.host = v;
        }
        if let Some(v) = lookup("REDIS_PORT") {
            redis.port = parse_env("REDIS_PORT", &v)?;
        }
        if let Some(v) = lookup("REDIS_DB") {
            redis.db = parse_env("REDIS_DB", &v)?;
        }
        if let Some(v) = lookup("REDIS_USERNAME") {
            redis.username = Some(v);
        }
        if let Some(v) = lookup("REDIS_PASSWORD") {
            redis.password = Some(v);
        }
        if let Some(v) = lookup("REDIS_MODE") {
            redis.mode = parse_env("REDIS_MODE", &v)?;
        }
        if let Some(v) = lookup("REDIS_CLUSTER_NODES") {
            redis.cluster_nodes = split_list(&v);
        }
        if let Some(v) = lookup("REDIS_SENTINEL_HOSTS") {
            redis.sentinel_hosts = split_list(&v);
        }
        if let Some(v) = lookup("REDIS_SENTINEL_SERVICE") {
            redis.sentinel_service = v;
        }
        if let Some(v) = lookup("REDIS_SOCKET_CONNECT_TIMEOUT") {
            redis.connect_timeout_secs = parse_env("REDIS_SOCKET_CONNECT_TIMEOUT", &v)?;
        }

        let analysis = &mut self.analysis;
        if let Some(v) = lookup("LARGE_KEY_THRESHOLD") {
            analysis.large_key_threshold = parse_env("LARGE_KEY_THRESHOLD", &v)?;
        }
        if let Some(v) = lookup("SCAN_COUNT") {
            analysis.scan_count = parse_env("SCAN_COUNT", &v)?;
        }
        if let Some(v) = lookup("MAX_SCAN_KEYS") {
            analysis.max_scan_keys = parse_env("MAX_SCAN_KEYS", &v)?;
        }

        let commands = &mut self.commands;
        if let Some(v) = lookup("DANGEROUS_COMMANDS") {
            commands.dangerous_commands = split_list(&v);
        }
        if let Some(v) = lookup("ENABLE_DANGEROUS_COMMANDS") {
            commands.enable_dangerous_commands = parse_bool("ENABLE_DANGEROUS_COMMANDS", &v)?;
        }
        if let Some(v) = lookup("COMMAND_TIMEOUT") {
            commands.command_timeout_secs = parse_env("COMMAND_TIMEOUT", &v)?;
        }

        Ok(())
    }

    /// Rejects combinations that cannot produce a working connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let redis = &self.redis;
        match redis.mode {
            RedisMode::Cluster if redis.cluster_nodes.is_empty() => {
                return Err(ConfigError::Invalid(
                    "cluster mode requires at least one cluster node".into(),
                ));
            }
            RedisMode::Sentinel if redis.sentinel_hosts.is_empty() => {
                return Err(ConfigError::Invalid(
                    "sentinel mode requires at least one sentinel host".into(),
                ));
            }
            _ => {}
        }
        for node in redis.cluster_nodes.iter().chain(&redis.sentinel_hosts) {
            parse_host_port(node)?;
        }
        if redis.url.is_some() {
            self.redis.endpoint()?;
        }
        if redis.db > 15 {
            return Err(ConfigError::Invalid(format!(
                "database index {} is out of range (0-15)",
                redis.db
            )));
        }
        if !(redis.connect_timeout_secs > 0.0) {
            return Err(ConfigError::Invalid(
                "connect timeout must be positive".into(),
            ));
        }
        if !(self.commands.command_timeout_secs > 0.0) {
            return Err(ConfigError::Invalid(
                "command timeout must be positive".into(),
            ));
        }
        if self.analysis.scan_count == 0 {
            return Err(ConfigError::Invalid("scan count must be positive".into()));
        }
        if self.analysis.max_scan_keys == 0 {
            return Err(ConfigError::Invalid(
                "max scan keys must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.commands.command_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.redis.connect_timeout_secs)
    }
}

impl RedisSettings {
    /// Resolves the single-instance endpoint, letting `url` override the
    /// discrete fields it specifies.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        let mut endpoint = Endpoint {
            host: self.host.clone(),
            port: self.port,
            db: self.db,
            username: self.username.clone(),
            password: self.password.clone(),
        };

        let Some(raw) = &self.url else {
            return Ok(endpoint);
        };

        let parsed = url::Url::parse(raw).map_err(|e| ConfigError::InvalidUrl(e.to_string()))?;
        if parsed.scheme() != "redis" {
            return Err(ConfigError::InvalidUrl(format!(
                "unsupported scheme '{}'",
                parsed.scheme()
            )));
        }
        if let Some(host) = parsed.host_str() {
            endpoint.host = host.to_string();
        }
        if let Some(port) = parsed.port() {
            endpoint.port = port;
        }
        let path = parsed.path().trim_start_matches('/');
        if !path.is_empty() {
            endpoint.db = path
                .parse()
                .map_err(|_| ConfigError::InvalidUrl(format!("invalid database '{}'", path)))?;
        }
        if !parsed.username().is_empty() {
            endpoint.username = Some(parsed.username().to_string());
        }
        if let Some(password) = parsed.password() {
            endpoint.password = Some(password.to_string());
        }
        Ok(endpoint)
    }
}

/// Splits `host:port`, accepting bracketed IPv6 hosts.
pub fn parse_host_port(s: &str) -> Result<(String, u16), ConfigError> {
    let invalid = || ConfigError::Invalid(format!("expected host:port, got '{}'", s));
    let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(invalid());
    }
    let port = port.parse().map_err(|_| invalid())?;
    Ok((host.to_string(), port))
}

fn split_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}
