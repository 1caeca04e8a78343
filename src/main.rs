//! keylens - Large-Key Analysis and Safe Command Execution for Redis
//!
//! Command-line entry point. Every subcommand prints one JSON document to
//! stdout; logs go to stderr (`RUST_LOG`, default `info`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use keylens::admin::{server_info, ClusterAdmin, DatabaseAdmin};
use keylens::analysis::{AnalysisReport, AnalyzerOptions, KeyKind, LargeKeyAnalyzer};
use keylens::commands::{BatchEntry, CommandExecutor};
use keylens::config::{RedisMode, Settings};
use keylens::humanize::{format_bytes, format_duration};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Inspect a Redis deployment: large keys, databases, cluster state, and
/// safety-gated command execution.
#[derive(Parser, Debug)]
#[command(name = "keylens", author, version, about)]
struct Args {
    /// TOML settings file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Redis host (overrides REDIS_URL and REDIS_HOST).
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Redis port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Logical database index.
    #[arg(short = 'n', long)]
    db: Option<u32>,

    /// Topology: single, cluster or sentinel.
    #[arg(short, long)]
    mode: Option<RedisMode>,

    /// Password for AUTH.
    #[arg(short = 'a', long)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Server status and connection details
    Info,

    /// Scan for keys whose size meets the large-key threshold
    Analyze {
        /// Glob pattern passed to SCAN MATCH
        #[arg(long, default_value = "*")]
        pattern: String,

        /// Maximum keys to scan (defaults to the configured maximum)
        #[arg(long)]
        limit: Option<usize>,

        /// Also fetch MEMORY USAGE for every key
        #[arg(long)]
        memory: bool,
    },

    /// Size, TTL and a content sample of one key
    Key { key: String },

    /// Execute one command
    Exec {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Execute several commands, one per argument
    Batch {
        /// Send all commands in one round-trip
        #[arg(long)]
        pipeline: bool,

        /// JSON array of commands (strings or argument arrays)
        #[arg(long, value_name = "FILE", conflicts_with = "commands")]
        file: Option<PathBuf>,

        commands: Vec<String>,
    },

    /// Safety classification and server metadata for a command name
    Describe { command: String },

    /// List the configured dangerous commands
    Dangerous,

    /// Logical database management (single instance only)
    #[command(subcommand)]
    Db(DbCommand),

    /// Cluster topology and health
    #[command(subcommand)]
    Cluster(ClusterCommand),
}

#[derive(Subcommand, Debug)]
enum DbCommand {
    /// Key counts of every database
    List,
    /// The selected database
    Current,
    /// Select another database
    Switch { db: u32 },
    /// Key count and expiring-key estimate
    Info { db: Option<u32> },
    /// Delete every key of a database (FLUSHDB)
    Clear {
        db: Option<u32>,
        /// Required to actually clear
        #[arg(long)]
        confirm: bool,
    },
    /// Overview of all databases
    Summary,
}

#[derive(Subcommand, Debug)]
enum ClusterCommand {
    /// CLUSTER INFO and the node table
    Info,
    /// Slot ranges and the nodes serving them
    Slots,
    /// Failed nodes, handshakes and masters without replicas
    Health,
    /// The slot and nodes responsible for a key
    Keyslot { key: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let settings = load_settings(&args)?;
    let keyspace = keylens::connect(&settings)
        .await
        .context("failed to connect to Redis")?;
    info!(endpoint = %keyspace.endpoint(), mode = %keyspace.topology(), "connected");

    match args.command {
        Command::Info => emit(&server_info(keyspace.as_ref()).await?),
        Command::Analyze {
            pattern,
            limit,
            memory,
        } => {
            let analyzer =
                LargeKeyAnalyzer::new(keyspace, AnalyzerOptions::from(&settings.analysis));
            let report = analyzer.analyze(&pattern, limit, memory).await?;
            emit(&describe_report(&report))
        }
        Command::Key { key } => {
            let analyzer =
                LargeKeyAnalyzer::new(keyspace, AnalyzerOptions::from(&settings.analysis));
            emit(&analyzer.key_details(&key).await?)
        }
        Command::Exec { command, args } => {
            let executor = CommandExecutor::from_settings(keyspace, &settings.commands);
            emit(&executor.execute_one(&command, &args).await)
        }
        Command::Batch {
            pipeline,
            file,
            commands,
        } => {
            let entries = match file {
                Some(path) => read_batch_file(&path)?,
                None => commands.into_iter().map(BatchEntry::Line).collect(),
            };
            let executor = CommandExecutor::from_settings(keyspace, &settings.commands);
            let outcome = if pipeline {
                executor.execute_pipelined(entries).await
            } else {
                executor.execute_batch(entries).await
            };
            emit(&outcome)
        }
        Command::Describe { command } => {
            let executor = CommandExecutor::from_settings(keyspace, &settings.commands);
            emit(&executor.describe_command(&command).await)
        }
        Command::Dangerous => {
            let executor = CommandExecutor::from_settings(keyspace, &settings.commands);
            emit(&executor.dangerous_commands())
        }
        Command::Db(sub) => {
            let admin = DatabaseAdmin::new(keyspace, settings.commands.enable_dangerous_commands);
            match sub {
                DbCommand::List => emit(&admin.list_databases().await?),
                DbCommand::Current => {
                    emit(&json!({ "current_database": admin.current_database()? }))
                }
                DbCommand::Switch { db } => emit(&admin.switch_database(db).await?),
                DbCommand::Info { db } => emit(&admin.database_info(db).await?),
                DbCommand::Clear { db, confirm } => {
                    emit(&admin.clear_database(db, confirm).await?)
                }
                DbCommand::Summary => emit(&admin.database_summary().await?),
            }
        }
        Command::Cluster(sub) => {
            let admin = ClusterAdmin::new(keyspace);
            match sub {
                ClusterCommand::Info => emit(&admin.cluster_info().await?),
                ClusterCommand::Slots => emit(&admin.cluster_slots().await?),
                ClusterCommand::Health => emit(&admin.check_health().await?),
                ClusterCommand::Keyslot { key } => emit(&admin.key_node_mapping(&key).await?),
            }
        }
    }
}

/// File, then environment, then command-line flags; validated last.
fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Settings::default(),
    };
    settings
        .apply_env(|name| std::env::var(name).ok())
        .context("invalid environment override")?;

    let redis = &mut settings.redis;
    if args.host.is_some() || args.port.is_some() || args.db.is_some() {
        // An explicit address wins over REDIS_URL.
        redis.url = None;
    }
    if let Some(host) = &args.host {
        redis.host = host.clone();
    }
    if let Some(port) = args.port {
        redis.port = port;
    }
    if let Some(db) = args.db {
        redis.db = db;
    }
    if let Some(mode) = args.mode {
        redis.mode = mode;
    }
    if let Some(password) = &args.password {
        redis.password = Some(password.clone());
    }

    settings.validate().context("invalid settings")?;
    Ok(settings)
}

fn read_batch_file(path: &Path) -> anyhow::Result<Vec<BatchEntry>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a JSON array of commands", path.display()))
}

/// Report plus human-readable sizes and durations.
fn describe_report(report: &AnalysisReport) -> Value {
    let top_keys: Vec<Value> = report
        .top_by_size
        .iter()
        .map(|record| {
            let size_formatted = match record.kind {
                KeyKind::String => format_bytes(record.size),
                _ => format!("{} items", record.size),
            };
            json!({
                "key": record.name_lossy(),
                "type": record.kind,
                "size": record.size,
                "size_formatted": size_formatted,
                "ttl": record.ttl,
                "encoding": record.encoding,
                "memory_usage": record.memory_bytes.map(format_bytes),
            })
        })
        .collect();

    json!({
        "summary": {
            "total_keys_scanned": report.total_scanned,
            "large_keys_found": report.large_keys_found,
            "total_memory_usage": format_bytes(report.total_memory_bytes),
            "scan_time": format_duration(Duration::from_secs_f64(report.elapsed_seconds)),
            "threshold": format_bytes(report.threshold),
        },
        "top_keys": top_keys,
        "summary_by_type": report.by_type,
        "pattern_used": report.pattern,
    })
}

fn emit<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
