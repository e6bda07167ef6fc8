//! Session wiring: gate, executor and envelope in front of one ledger.
//!
//! A session processes one operator action at a time. Every command produces
//! exactly one ledger entry (`command_accepted` or `command_rejected`) and
//! every query exactly one `model_exchange_recorded`, written before the
//! result is handed back. Once the ledger fails the session halts and refuses
//! all further actions.

use crate::core::cancel::CancelToken;
use crate::core::config::Config;
use crate::core::envelope::{ModelExchange, ProtocolEnvelope};
use crate::core::error::LedgateError;
use crate::core::executor::{ExecContext, Executor};
use crate::core::gate::{Command, InvariantGate, Verdict};
use crate::core::ledger::{ExecutionOutcome, Ledger, LedgerEntry, LedgerEvent};
use crate::core::model_client::ModelClient;
use crate::core::time;
use std::path::Path;
use std::sync::Arc;

/// What the operator gets back for one command, after it is on record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub seq: u64,
    pub verdict: Verdict,
    /// `None` when the gate rejected the command.
    pub execution: Option<ExecutionOutcome>,
}

pub struct Session {
    id: String,
    gate: InvariantGate,
    executor: Executor,
    envelope: ProtocolEnvelope,
    ledger: Arc<Ledger>,
    context: ExecContext,
    halted: Option<String>,
}

impl Session {
    pub fn new(
        ledger: Arc<Ledger>,
        config: &Config,
        client: Arc<dyn ModelClient>,
        context: ExecContext,
    ) -> Result<Self, LedgateError> {
        Ok(Self {
            id: ledger.session_id().to_string(),
            gate: InvariantGate::new(&config.gate)?,
            executor: Executor::new(&config.executor),
            envelope: ProtocolEnvelope::new(client, Arc::clone(&ledger), &config.model),
            ledger,
            context,
            halted: None,
        })
    }

    /// New session id and a fresh ledger file under the configured directory.
    pub fn open(
        config: &Config,
        base_dir: &Path,
        client: Arc<dyn ModelClient>,
        context: ExecContext,
    ) -> Result<Self, LedgateError> {
        Self::open_as(&time::new_event_id(), config, base_dir, client, context)
    }

    /// Like [`Session::open`] with a caller-chosen id, so the diagnostic log
    /// and the ledger share it.
    pub fn open_as(
        id: &str,
        config: &Config,
        base_dir: &Path,
        client: Arc<dyn ModelClient>,
        context: ExecContext,
    ) -> Result<Self, LedgateError> {
        let ledger = Ledger::create(&config.ledger_dir(base_dir), id)?;
        tracing::info!(session_id = %id, ledger = %ledger.path().display(), "session opened");
        Self::new(Arc::new(ledger), config, client, context)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn envelope(&self) -> &ProtocolEnvelope {
        &self.envelope
    }

    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Gate, run if accepted, record, then report.
    pub fn submit_command(
        &mut self,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<CommandReport, LedgateError> {
        self.ensure_live()?;
        let verdict = self.gate.evaluate(Command::new(text));

        if !verdict.accepted {
            let entry = self.record(LedgerEvent::CommandRejected {
                verdict: verdict.clone(),
            })?;
            return Ok(CommandReport {
                seq: entry.seq,
                verdict,
                execution: None,
            });
        }

        let outcome = match self.executor.run(&verdict.command, &self.context, cancel) {
            Ok(result) => ExecutionOutcome::Finished(result),
            Err(failure) => ExecutionOutcome::Failed(failure),
        };
        let entry = self.record(LedgerEvent::CommandAccepted {
            verdict: verdict.clone(),
            outcome: Some(outcome.clone()),
        })?;
        Ok(CommandReport {
            seq: entry.seq,
            verdict,
            execution: Some(outcome),
        })
    }

    /// Send one query through the envelope.
    pub fn submit_query(
        &mut self,
        text: &str,
        cancel: &CancelToken,
    ) -> Result<ModelExchange, LedgateError> {
        self.ensure_live()?;
        self.envelope
            .dispatch(text, cancel)
            .inspect_err(|e| self.halt_on_fatal(e))
    }

    fn record(&mut self, event: LedgerEvent) -> Result<LedgerEntry, LedgateError> {
        self.ledger.append(event).inspect_err(|e| self.halt_on_fatal(e))
    }

    fn halt_on_fatal(&mut self, e: &LedgateError) {
        if e.is_fatal() && self.halted.is_none() {
            tracing::error!(session_id = %self.id, error = %e, "halting session");
            self.halted = Some(e.to_string());
        }
    }

    fn ensure_live(&self) -> Result<(), LedgateError> {
        match &self.halted {
            Some(reason) => Err(LedgateError::SessionHalted(reason.clone())),
            None => Ok(()),
        }
    }
}
