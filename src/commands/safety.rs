//! Dangerous-command classification.

use serde::Serialize;
use std::collections::BTreeSet;

/// How the gate treats a command name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Classification {
    Safe,
    DangerousBlocked,
    DangerousAllowed,
}

/// The configured dangerous set plus the allow flag. Names are compared
/// case-insensitively.
#[derive(Debug, Clone)]
pub struct CommandGate {
    dangerous: BTreeSet<String>,
    allow_dangerous: bool,
}

impl CommandGate {
    pub fn new<I, S>(dangerous: I, allow_dangerous: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            dangerous: dangerous
                .into_iter()
                .map(|name| name.as_ref().trim().to_ascii_uppercase())
                .filter(|name| !name.is_empty())
                .collect(),
            allow_dangerous,
        }
    }

    pub fn classify(&self, command: &str) -> Classification {
        if !self.is_dangerous(command) {
            Classification::Safe
        } else if self.allow_dangerous {
            Classification::DangerousAllowed
        } else {
            Classification::DangerousBlocked
        }
    }

    pub fn is_dangerous(&self, command: &str) -> bool {
        self.dangerous.contains(&command.trim().to_ascii_uppercase())
    }

    pub fn allows_dangerous(&self) -> bool {
        self.allow_dangerous
    }

    /// The dangerous set in sorted order.
    pub fn dangerous_commands(&self) -> impl Iterator<Item = &str> {
        self.dangerous.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.dangerous.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dangerous.is_empty()
    }
}
