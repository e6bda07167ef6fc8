//! Invariant Gate
//!
//! Decides whether a single operator command may run. The decision is a pure
//! function of the command text and the load-time [`GateConfig`]:
//! - empty input is refused
//! - chaining metacharacters are refused
//! - destructive programs are refused by name
//!
//! Rules are applied in that order and the first match wins.

use crate::core::config::GateConfig;
use crate::core::error::LedgateError;
use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One line of operator input, captured on arrival.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub raw: String,
    pub received_at: u64,
}

impl Command {
    pub fn new(raw: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            received_at: time::now_epoch_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Ok,
    Empty,
    Metacharacter,
    Destructive,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::Ok => "OK",
            ReasonCode::Empty => "EMPTY",
            ReasonCode::Metacharacter => "METACHARACTER",
            ReasonCode::Destructive => "DESTRUCTIVE",
        }
    }
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub accepted: bool,
    pub reason: ReasonCode,
    pub command: Command,
    /// The metacharacter or destructive entry that triggered a rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched: Option<String>,
}

impl Verdict {
    pub fn message(&self) -> String {
        match (self.reason, self.matched.as_deref()) {
            (ReasonCode::Ok, _) => "accepted".to_string(),
            (ReasonCode::Empty, _) => "rejected: empty command".to_string(),
            (ReasonCode::Metacharacter, Some(m)) => {
                format!("rejected: metacharacter {:?} enables command chaining", m)
            }
            (ReasonCode::Destructive, Some(m)) => {
                format!("rejected: '{}' is a destructive operation", m)
            }
            (reason, None) => format!("rejected: {}", reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvariantGate {
    destructive: Vec<String>,
    metacharacters: Vec<String>,
    metachar_re: Option<Regex>,
}

impl InvariantGate {
    pub fn new(config: &GateConfig) -> Result<Self, LedgateError> {
        let destructive = config
            .destructive
            .iter()
            .filter_map(|d| d.split_whitespace().next())
            .map(|d| d.to_lowercase())
            .collect();

        // Longest alternatives first so `&&` is reported instead of `&`.
        let mut metacharacters: Vec<String> = config
            .metacharacters
            .iter()
            .filter(|m| !m.is_empty())
            .cloned()
            .collect();
        metacharacters.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        metacharacters.dedup();

        let metachar_re = if metacharacters.is_empty() {
            None
        } else {
            let pattern = metacharacters
                .iter()
                .map(|m| regex::escape(m))
                .collect::<Vec<_>>()
                .join("|");
            let re = Regex::new(&pattern).map_err(|e| {
                LedgateError::ConfigError(format!("gate.metacharacters: {}", e))
            })?;
            Some(re)
        };

        Ok(Self {
            destructive,
            metacharacters,
            metachar_re,
        })
    }

    /// Apply the fixed rule order to `command`. No I/O.
    pub fn evaluate(&self, command: Command) -> Verdict {
        let (reason, matched) = self.decide(&command.raw);
        tracing::debug!(command = %command.raw, reason = %reason, "gate verdict");
        Verdict {
            accepted: reason == ReasonCode::Ok,
            reason,
            command,
            matched,
        }
    }

    /// Decision on raw text alone.
    pub fn decide(&self, text: &str) -> (ReasonCode, Option<String>) {
        if text.trim().is_empty() {
            return (ReasonCode::Empty, None);
        }

        if let Some(m) = self.find_metacharacter(text) {
            return (ReasonCode::Metacharacter, Some(m));
        }

        if let Some(program) = program_name(text) {
            let lowered = program.to_lowercase();
            if let Some(entry) = self.destructive.iter().find(|d| **d == lowered) {
                return (ReasonCode::Destructive, Some(entry.clone()));
            }
        }

        (ReasonCode::Ok, None)
    }

    fn find_metacharacter(&self, text: &str) -> Option<String> {
        self.metachar_re
            .as_ref()?
            .find(text)
            .map(|m| m.as_str().to_string())
    }

    pub fn destructive(&self) -> &[String] {
        &self.destructive
    }

    pub fn metacharacters(&self) -> &[String] {
        &self.metacharacters
    }
}

/// Program name as the executor will see it: first token, quotes stripped,
/// directory components dropped (`/bin/RM` -> `RM`).
pub fn program_name(text: &str) -> Option<String> {
    let token = match shlex::split(text) {
        Some(words) => words.into_iter().next()?,
        None => text
            .split_whitespace()
            .next()?
            .trim_matches(|c| c == '"' || c == '\'')
            .to_string(),
    };
    let base = Path::new(&token)
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or(token);
    if base.is_empty() { None } else { Some(base) }
}
