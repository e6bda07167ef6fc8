//! Protocol Envelope
//!
//! Every model query leaves with the same system preamble and a provenance
//! stamp, and every answer (or failure) comes back stamped as well. Each call
//! is written to the ledger exactly once before the caller sees it. The
//! network call itself runs on a worker thread so no lock is held across it
//! and so the operator can walk away from it.

use crate::core::cancel::CancelToken;
use crate::core::config::ModelConfig;
use crate::core::error::LedgateError;
use crate::core::ledger::{Ledger, LedgerEvent};
use crate::core::model_client::{ModelClient, ModelClientError};
use crate::core::time;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

pub const PROVENANCE_TAG: &str = "ledgate/deterministic-substrate";
pub const PROTOCOL_NAME: &str = "ledgate-envelope";
pub const PROTOCOL_VERSION: &str = "L0";

/// Fixed instruction anchor sent ahead of every query.
pub const SYSTEM_PREAMBLE: &str = "\
You are a tool running inside a deterministic, audited terminal substrate.

- The human operator is the fixed point. You assist; you do not act on your own.
- Every request and response is recorded in an append-only ledger and may be replayed.
- If you cannot support a claim or a step, say so or stop. Prefer halting over guessing.
- Shell commands you suggest are checked by an invariant gate: one program per line,
  no pipes, no `;`, no `&`, and no destructive programs such as rm, shutdown or mkfs.

Answer in concrete, verifiable steps. Use checklists and tables over narrative.
Label assumptions explicitly so the operator can correct them.";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Slack on top of the client's own timeout before the envelope gives up.
const CALL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub tag: String,
    pub protocol: String,
    pub version: String,
    pub direction: Direction,
    pub session_id: String,
    pub generated_by: String,
    pub stamped_at: u64,
}

impl Provenance {
    pub fn stamp(direction: Direction, session_id: &str, generated_by: &str) -> Self {
        Self {
            tag: PROVENANCE_TAG.to_string(),
            protocol: PROTOCOL_NAME.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            direction,
            session_id: session_id.to_string(),
            generated_by: generated_by.to_string(),
            stamped_at: time::now_epoch_ms(),
        }
    }

    pub fn is_fixed_tag(&self) -> bool {
        self.tag == PROVENANCE_TAG
            && self.protocol == PROTOCOL_NAME
            && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub system_preamble: String,
    pub query: String,
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    pub provenance: Provenance,
}

impl ModelRequest {
    /// Text the prompt digest covers.
    pub fn prompt_text(&self) -> String {
        format!("{}\n{}", self.system_preamble, self.query)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelFailureReason {
    ModelUnreachable,
    ModelError,
    ModelTimeout,
    Cancelled,
}

impl ModelFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelFailureReason::ModelUnreachable => "MODEL_UNREACHABLE",
            ModelFailureReason::ModelError => "MODEL_ERROR",
            ModelFailureReason::ModelTimeout => "MODEL_TIMEOUT",
            ModelFailureReason::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for ModelFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&ModelClientError> for ModelFailureReason {
    fn from(e: &ModelClientError) -> Self {
        match e {
            ModelClientError::Unreachable(_) => ModelFailureReason::ModelUnreachable,
            ModelClientError::Timeout(_) => ModelFailureReason::ModelTimeout,
            ModelClientError::Status { .. } | ModelClientError::Malformed(_) => {
                ModelFailureReason::ModelError
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExchangeOutcome {
    Responded {
        text: String,
    },
    Failed {
        reason: ModelFailureReason,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelExchange {
    pub exchange_id: String,
    pub request: ModelRequest,
    pub prompt_sha256: String,
    pub outcome: ExchangeOutcome,
    #[serde(default)]
    pub response_sha256: Option<String>,
    pub response_provenance: Provenance,
    pub started_at: u64,
    pub latency_ms: u64,
}

impl ModelExchange {
    pub fn response_text(&self) -> Option<&str> {
        match &self.outcome {
            ExchangeOutcome::Responded { text } => Some(text),
            ExchangeOutcome::Failed { .. } => None,
        }
    }

    pub fn failure_reason(&self) -> Option<ModelFailureReason> {
        match &self.outcome {
            ExchangeOutcome::Responded { .. } => None,
            ExchangeOutcome::Failed { reason, .. } => Some(*reason),
        }
    }
}

pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub struct ProtocolEnvelope {
    client: Arc<dyn ModelClient>,
    ledger: Arc<Ledger>,
    model: String,
    temperature: f64,
    max_tokens: Option<u32>,
    timeout: Duration,
}

impl ProtocolEnvelope {
    pub fn new(client: Arc<dyn ModelClient>, ledger: Arc<Ledger>, config: &ModelConfig) -> Self {
        Self {
            client,
            ledger,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: config.timeout(),
        }
    }

    pub fn endpoint(&self) -> String {
        self.client.endpoint()
    }

    /// Wrap `query` with the preamble and a request stamp.
    pub fn build_request(&self, query: &str) -> ModelRequest {
        ModelRequest {
            model: self.model.clone(),
            system_preamble: SYSTEM_PREAMBLE.to_string(),
            query: query.to_string(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            provenance: Provenance::stamp(
                Direction::Request,
                self.ledger.session_id(),
                "operator",
            ),
        }
    }

    /// Send one query and record the exchange. Model failures are part of
    /// the returned exchange; only a ledger failure is an `Err`.
    pub fn dispatch(&self, query: &str, cancel: &CancelToken) -> Result<ModelExchange, LedgateError> {
        let request = self.build_request(query);
        let prompt_sha256 = sha256_hex(&request.prompt_text());
        let started_at = time::now_epoch_ms();
        let start = Instant::now();

        let outcome = self.call(&request, cancel);
        let latency_ms = start.elapsed().as_millis() as u64;

        let response_sha256 = match &outcome {
            ExchangeOutcome::Responded { text } => Some(sha256_hex(text)),
            ExchangeOutcome::Failed { reason, message } => {
                tracing::warn!(reason = reason.as_str(), message = %message, "model call failed");
                None
            }
        };
        let exchange = ModelExchange {
            exchange_id: time::new_event_id(),
            request,
            prompt_sha256,
            outcome,
            response_sha256,
            response_provenance: Provenance::stamp(
                Direction::Response,
                self.ledger.session_id(),
                &format!("model:{}", self.model),
            ),
            started_at,
            latency_ms,
        };

        self.ledger.append(LedgerEvent::ModelExchangeRecorded {
            exchange: exchange.clone(),
        })?;
        Ok(exchange)
    }

    fn call(&self, request: &ModelRequest, cancel: &CancelToken) -> ExchangeOutcome {
        let (tx, rx) = mpsc::channel();
        let client = Arc::clone(&self.client);
        let outbound = request.clone();
        let timeout = self.timeout;
        let spawned = thread::Builder::new()
            .name("model-call".to_string())
            .spawn(move || {
                // The receiver may be gone after a cancel; nothing to do then.
                let _ = tx.send(client.complete(&outbound, timeout));
            });
        if let Err(e) = spawned {
            return ExchangeOutcome::Failed {
                reason: ModelFailureReason::ModelError,
                message: format!("could not start model call: {}", e),
            };
        }

        // No deadline when the sum does not fit in an Instant.
        let deadline = self
            .timeout
            .checked_add(CALL_GRACE)
            .and_then(|limit| Instant::now().checked_add(limit));
        loop {
            if cancel.is_cancelled() {
                return ExchangeOutcome::Failed {
                    reason: ModelFailureReason::Cancelled,
                    message: "model call cancelled by operator".to_string(),
                };
            }
            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                return ExchangeOutcome::Failed {
                    reason: ModelFailureReason::ModelTimeout,
                    message: format!("no response within {}s", self.timeout.as_secs()),
                };
            }
            let slice = deadline.map_or(POLL_INTERVAL, |d| POLL_INTERVAL.min(d - now));
            match rx.recv_timeout(slice) {
                Ok(Ok(text)) => return ExchangeOutcome::Responded { text },
                Ok(Err(e)) => {
                    return ExchangeOutcome::Failed {
                        reason: ModelFailureReason::from(&e),
                        message: e.to_string(),
                    };
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return ExchangeOutcome::Failed {
                        reason: ModelFailureReason::ModelError,
                        message: "model call ended without a result".to_string(),
                    };
                }
            }
        }
    }
}
