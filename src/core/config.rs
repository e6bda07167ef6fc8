//! Load-time configuration for the gate, executor, model envelope and ledger.
//!
//! Read once from `.ledgate/config.toml` (or an explicit path) and then frozen
//! for the lifetime of a session. Nothing in the core mutates it afterwards.

use crate::core::error::LedgateError;
use crate::core::gate::InvariantGate;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_DIR: &str = ".ledgate";
pub const CONFIG_FILE: &str = "config.toml";
/// Upper bound for both the command and the model timeout.
pub const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub gate: GateConfig,
    pub executor: ExecutorConfig,
    pub model: ModelConfig,
    pub ledger: LedgerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GateConfig {
    /// Program names refused outright, compared case-insensitively.
    pub destructive: Vec<String>,
    /// Substrings that enable command chaining.
    pub metacharacters: Vec<String>,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            destructive: [
                "rm", "rmdir", "shutdown", "reboot", "halt", "poweroff", "mkfs", "format", "dd",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            metacharacters: ["|", "&", ";", "\n", "\r", "&&", "||"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    pub timeout_secs: u64,
    /// Per-stream capture ceiling.
    pub max_output_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_output_bytes: 100 * 1024,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub temperature: f64,
    pub max_tokens: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            timeout_secs: 120,
            temperature: 0.0,
            max_tokens: None,
        }
    }
}

impl ModelConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub dir: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(CONFIG_DIR).join("ledger"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Where per-session diagnostic logs go.
    pub dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(CONFIG_DIR).join("logs"),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, LedgateError> {
        let config: Config =
            toml::from_str(content).map_err(|e| LedgateError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `explicit` if given (it must exist), otherwise from
    /// `<base_dir>/.ledgate/config.toml` when present, otherwise defaults.
    pub fn load(base_dir: &Path, explicit: Option<&Path>) -> Result<Self, LedgateError> {
        let path = match explicit {
            Some(p) => {
                if !p.exists() {
                    return Err(LedgateError::NotFound(format!(
                        "config file {}",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => {
                let p = base_dir.join(CONFIG_DIR).join(CONFIG_FILE);
                if !p.exists() {
                    tracing::debug!(path = %p.display(), "no config file, using defaults");
                    return Ok(Self::default());
                }
                p
            }
        };

        let content = fs::read_to_string(&path).map_err(LedgateError::IoError)?;
        let config = Self::from_toml_str(&content)
            .map_err(|e| LedgateError::ConfigError(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgateError> {
        if self.gate.destructive.is_empty() {
            return Err(LedgateError::ConfigError(
                "gate.destructive must list at least one program".into(),
            ));
        }
        if self.gate.metacharacters.is_empty() {
            return Err(LedgateError::ConfigError(
                "gate.metacharacters must list at least one entry".into(),
            ));
        }
        if self.gate.destructive.iter().any(|d| d.trim().is_empty()) {
            return Err(LedgateError::ConfigError(
                "gate.destructive entries must be non-empty".into(),
            ));
        }
        if self.gate.metacharacters.iter().any(|m| m.is_empty()) {
            return Err(LedgateError::ConfigError(
                "gate.metacharacters entries must be non-empty".into(),
            ));
        }
        if self.executor.timeout_secs == 0 || self.executor.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(LedgateError::ConfigError(format!(
                "executor.timeout_secs must be between 1 and {}",
                MAX_TIMEOUT_SECS
            )));
        }
        if self.executor.max_output_bytes == 0 {
            return Err(LedgateError::ConfigError(
                "executor.max_output_bytes must be positive".into(),
            ));
        }
        if self.model.timeout_secs == 0 || self.model.timeout_secs > MAX_TIMEOUT_SECS {
            return Err(LedgateError::ConfigError(format!(
                "model.timeout_secs must be between 1 and {}",
                MAX_TIMEOUT_SECS
            )));
        }
        // JSON has no NaN or infinity; the ledger must be able to read it back.
        if !self.model.temperature.is_finite() || self.model.temperature < 0.0 {
            return Err(LedgateError::ConfigError(
                "model.temperature must be a finite number >= 0".into(),
            ));
        }
        if self.model.base_url.trim().is_empty() {
            return Err(LedgateError::ConfigError(
                "model.base_url must be set".into(),
            ));
        }
        InvariantGate::new(&self.gate)?;
        Ok(())
    }

    /// Ledger directory resolved against `base_dir` when relative.
    pub fn ledger_dir(&self, base_dir: &Path) -> PathBuf {
        if self.ledger.dir.is_absolute() {
            self.ledger.dir.clone()
        } else {
            base_dir.join(&self.ledger.dir)
        }
    }

    pub fn log_dir(&self, base_dir: &Path) -> PathBuf {
        if self.log.dir.is_absolute() {
            self.log.dir.clone()
        } else {
            base_dir.join(&self.log.dir)
        }
    }

    pub fn to_toml_string(&self) -> Result<String, LedgateError> {
        toml::to_string_pretty(self).map_err(|e| LedgateError::ConfigError(e.to_string()))
    }
}
