//! Safety-gated command execution.
//!
//! Every entry point returns a structured outcome. Failures of any kind end
//! up inside the outcome; nothing here returns `Err`.

use crate::commands::format::format_reply;
use crate::commands::safety::{Classification, CommandGate};
use crate::config::CommandSettings;
use crate::connection::{Keyspace, KeyspaceError};
use crate::protocol::Reply;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// The result of executing one command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    /// The command and arguments as issued.
    pub command: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Time on the wire for this command; waiting for the connection or
    /// reconnecting is not included.
    pub execution_time_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl CommandOutcome {
    fn failed(command: String, error: String) -> Self {
        Self {
            command,
            success: false,
            result: None,
            execution_time_ms: 0.0,
            error: Some(error),
            warning: None,
        }
    }
}

/// Ordered outcomes of a batch. The counts are derived from `results`.
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<CommandOutcome>,
    pub total_time_ms: f64,
}

impl BatchOutcome {
    fn new(results: Vec<CommandOutcome>, elapsed: Duration) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
            total_time_ms: millis(elapsed),
        }
    }
}

/// One entry of a batch: a command line split on whitespace, or an
/// argument list used as-is.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Line(String),
    Argv(Vec<String>),
}

impl BatchEntry {
    fn into_parts(self) -> Vec<String> {
        match self {
            BatchEntry::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            BatchEntry::Argv(args) => args,
        }
    }
}

impl From<&str> for BatchEntry {
    fn from(line: &str) -> Self {
        BatchEntry::Line(line.to_string())
    }
}

/// What is known about one command name.
#[derive(Debug, Clone, Serialize)]
pub struct CommandDescription {
    pub command: String,
    pub is_dangerous: bool,
    pub is_blocked: bool,
    /// The server's `COMMAND INFO` entry; `None` when the server does not
    /// know the command or could not be asked.
    pub info: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DangerousCommands {
    pub dangerous_commands: Vec<String>,
    pub enabled: bool,
    /// How many commands the gate currently rejects.
    pub blocked_count: usize,
}

/// A pending command: display text plus argument vector. `argv` is empty
/// when the entry had no command name.
struct Prepared {
    text: String,
    argv: Vec<Bytes>,
}

impl Prepared {
    fn new(parts: Vec<String>) -> Self {
        Self {
            text: parts.join(" "),
            argv: parts.into_iter().map(Bytes::from).collect(),
        }
    }

    fn name(&self) -> Option<String> {
        self.argv
            .first()
            .map(|n| String::from_utf8_lossy(n).to_ascii_uppercase())
    }
}

/// Runs commands against a keyspace behind a [`CommandGate`].
pub struct CommandExecutor {
    keyspace: Arc<dyn Keyspace>,
    gate: CommandGate,
    timeout: Duration,
}

impl CommandExecutor {
    /// `timeout` is the bound enforced by the connection; it is only used
    /// to word timeout errors.
    pub fn new(keyspace: Arc<dyn Keyspace>, gate: CommandGate, timeout: Duration) -> Self {
        Self {
            keyspace,
            gate,
            timeout,
        }
    }

    pub fn from_settings(keyspace: Arc<dyn Keyspace>, settings: &CommandSettings) -> Self {
        Self::new(
            keyspace,
            CommandGate::new(
                &settings.dangerous_commands,
                settings.enable_dangerous_commands,
            ),
            Duration::from_secs_f64(settings.command_timeout_secs),
        )
    }

    pub fn gate(&self) -> &CommandGate {
        &self.gate
    }

    /// Executes `command` with `args`.
    pub async fn execute_one(&self, command: &str, args: &[String]) -> CommandOutcome {
        let command = command.trim();
        let parts = if command.is_empty() {
            Vec::new()
        } else {
            std::iter::once(command.to_string())
                .chain(args.iter().cloned())
                .collect()
        };
        self.run(Prepared::new(parts)).await
    }

    /// Executes each entry in order, one round-trip each.
    pub async fn execute_batch(&self, entries: Vec<BatchEntry>) -> BatchOutcome {
        let started = Instant::now();
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            results.push(self.run(Prepared::new(entry.into_parts())).await);
        }
        BatchOutcome::new(results, started.elapsed())
    }

    /// Executes every entry in one grouped round-trip.
    ///
    /// If any entry names a blocked command, nothing is sent and every
    /// entry fails with the same error. Per-entry timings are the group's
    /// elapsed time divided evenly.
    pub async fn execute_pipelined(&self, entries: Vec<BatchEntry>) -> BatchOutcome {
        let started = Instant::now();
        let prepared: Vec<Prepared> = entries
            .into_iter()
            .map(|e| Prepared::new(e.into_parts()))
            .collect();

        let blocked = prepared
            .iter()
            .filter_map(Prepared::name)
            .find(|name| self.gate.classify(name) == Classification::DangerousBlocked);
        if let Some(name) = blocked {
            warn!(command = %name, "pipeline rejected");
            let message = format!("Pipeline contains dangerous command '{}'", name);
            let results = prepared
                .into_iter()
                .map(|p| CommandOutcome::failed(p.text, message.clone()))
                .collect();
            return BatchOutcome::new(results, started.elapsed());
        }

        let warnings: Vec<Option<String>> = prepared
            .iter()
            .map(|p| p.name().and_then(|name| self.warning_for(&name)))
            .collect();
        let commands: Vec<Vec<Bytes>> = prepared
            .iter()
            .filter(|p| !p.argv.is_empty())
            .map(|p| p.argv.clone())
            .collect();

        let round_trip = Instant::now();
        let replies = if commands.is_empty() {
            Ok(Vec::new())
        } else {
            self.keyspace.pipeline(&commands).await
        };
        let elapsed = round_trip.elapsed();
        let per_entry = if commands.is_empty() {
            0.0
        } else {
            millis(elapsed) / commands.len() as f64
        };

        let results = match replies {
            Ok(replies) => {
                let mut replies = replies.into_iter();
                prepared
                    .into_iter()
                    .zip(warnings)
                    .map(|(p, warning)| {
                        if p.argv.is_empty() {
                            return CommandOutcome::failed(p.text, "empty command".into());
                        }
                        let reply = replies.next().unwrap_or(Err(KeyspaceError::Disconnected));
                        let mut outcome = self.outcome(p, reply, per_entry);
                        outcome.warning = warning;
                        outcome
                    })
                    .collect()
            }
            Err(e) => {
                error!(error = %e, commands = commands.len(), "pipeline failed");
                let message = format!("Pipeline execution failed: {}", self.describe_error(&e));
                prepared
                    .into_iter()
                    .zip(warnings)
                    .map(|(p, warning)| {
                        let mut outcome = CommandOutcome::failed(p.text, message.clone());
                        outcome.warning = warning;
                        outcome
                    })
                    .collect()
            }
        };
        info!(
            commands = commands.len(),
            elapsed_ms = millis(elapsed),
            "pipeline executed"
        );
        BatchOutcome::new(results, started.elapsed())
    }

    /// Gate status plus the server's `COMMAND INFO` entry for `name`.
    pub async fn describe_command(&self, name: &str) -> CommandDescription {
        let upper = name.trim().to_ascii_uppercase();
        let classification = self.gate.classify(&upper);
        let mut description = CommandDescription {
            command: upper.clone(),
            is_dangerous: classification != Classification::Safe,
            is_blocked: classification == Classification::DangerousBlocked,
            info: None,
            error: None,
        };

        let args = [
            Bytes::from_static(b"COMMAND"),
            Bytes::from_static(b"INFO"),
            Bytes::from(upper.to_ascii_lowercase()),
        ];
        match self.keyspace.issue(&args).await {
            Ok(reply) => {
                description.info = reply
                    .into_list()
                    .and_then(|entries| entries.into_iter().next())
                    .filter(|entry| !entry.is_nil())
                    .map(|entry| format_reply(&entry, "COMMAND"));
            }
            Err(e) => description.error = Some(self.describe_error(&e)),
        }
        description
    }

    pub fn dangerous_commands(&self) -> DangerousCommands {
        let enabled = self.gate.allows_dangerous();
        DangerousCommands {
            dangerous_commands: self.gate.dangerous_commands().map(str::to_string).collect(),
            enabled,
            blocked_count: if enabled { 0 } else { self.gate.len() },
        }
    }

    async fn run(&self, prepared: Prepared) -> CommandOutcome {
        let Some(name) = prepared.name() else {
            return CommandOutcome::failed(prepared.text, "empty command".into());
        };

        let warning = match self.gate.classify(&name) {
            Classification::DangerousBlocked => {
                warn!(command = %name, "blocked dangerous command");
                let message = format!(
                    "Command '{}' is blocked for safety. Enable dangerous commands to use it.",
                    name
                );
                return CommandOutcome::failed(prepared.text, message);
            }
            Classification::DangerousAllowed => self.warning_for(&name),
            Classification::Safe => None,
        };

        let (reply, round_trip) = self.keyspace.issue_timed(&prepared.argv).await;
        let elapsed = millis(round_trip);

        let mut outcome = self.outcome(prepared, reply, elapsed);
        outcome.warning = warning;
        outcome
    }

    fn warning_for(&self, name: &str) -> Option<String> {
        if self.gate.classify(name) != Classification::DangerousAllowed {
            return None;
        }
        warn!(command = %name, "executing dangerous command");
        Some(format!("Warning: Executing dangerous command '{}'", name))
    }

    fn outcome(
        &self,
        prepared: Prepared,
        reply: Result<Reply, KeyspaceError>,
        elapsed_ms: f64,
    ) -> CommandOutcome {
        match reply {
            Ok(reply) => {
                info!(command = %prepared.text, elapsed_ms, "command executed");
                let result = prepared
                    .name()
                    .map(|name| format_reply(&reply, &name))
                    .unwrap_or(Value::Null);
                CommandOutcome {
                    command: prepared.text,
                    success: true,
                    result: Some(result),
                    execution_time_ms: elapsed_ms,
                    error: None,
                    warning: None,
                }
            }
            Err(e) => {
                error!(command = %prepared.text, error = %e, "command failed");
                CommandOutcome {
                    execution_time_ms: elapsed_ms,
                    ..CommandOutcome::failed(prepared.text, self.describe_error(&e))
                }
            }
        }
    }

    fn describe_error(&self, e: &KeyspaceError) -> String {
        if e.is_timeout() {
            format!("Command timed out after {}s", self.timeout.as_secs_f64())
        } else {
            e.to_string()
        }
    }
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
