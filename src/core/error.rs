use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// The audit trail could not accept a record. Fatal for the session.
    #[error("Ledger write failed at {path}: {source}")]
    LedgerWrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Ledger corrupt at {path}:{line}: {message}")]
    LedgerCorrupt {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("Session halted: {0}")]
    SessionHalted(String),
}

impl LedgateError {
    pub fn ledger_write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::LedgerWrite {
            path: path.into(),
            source,
        }
    }

    /// Errors after which no further command or model processing may happen.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LedgerWrite { .. } | Self::SessionHalted(_))
    }
}
