//! Compact output rendering helpers for CLI surfaces.
//!
//! Keeps operator-facing output bounded and readable while preserving signal.
//! Nothing here is called before the corresponding record is on the ledger.

use crate::core::envelope::{ExchangeOutcome, ModelExchange};
use crate::core::executor::{ExecutionStatus, FailureReason};
use crate::core::gate::Verdict;
use crate::core::ledger::{ExecutionOutcome, LedgerEntry, LedgerEvent};
use crate::core::time;
use colored::Colorize;

/// Collapse newlines/extra whitespace and bound length for terminal display.
pub fn compact_line(input: &str, max_chars: usize) -> String {
    let collapsed = input.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut chars = collapsed.chars();
    let preview: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", preview)
    } else {
        preview
    }
}

/// One-line status for a verdict.
pub fn verdict_line(verdict: &Verdict) -> String {
    if verdict.accepted {
        format!("{} {}", "✓".bright_green(), verdict.reason.as_str().bright_green())
    } else {
        format!(
            "{} {} {}",
            "✗".bright_red(),
            verdict.reason.as_str().bright_red().bold(),
            verdict.message()
        )
    }
}

/// Status line for an executed command; the captured streams are printed
/// separately by the caller.
pub fn execution_line(outcome: &ExecutionOutcome) -> String {
    match outcome {
        ExecutionOutcome::Finished(result) => {
            let status = match result.status {
                ExecutionStatus::Completed if result.exit_code == 0 => {
                    format!("exit {}", result.exit_code).bright_green()
                }
                ExecutionStatus::Completed => format!("exit {}", result.exit_code).bright_yellow(),
                ExecutionStatus::TimedOut | ExecutionStatus::Cancelled => {
                    result.status.as_str().bright_red().bold()
                }
            };
            let mut line = format!("{} ({}ms)", status, result.duration_ms);
            if result.truncated() {
                line.push_str(&format!(" {}", "[output truncated]".bright_yellow()));
            }
            line
        }
        ExecutionOutcome::Failed(failure) => {
            let hint = match failure.reason {
                FailureReason::NotFound => " (no such program on PATH)",
                FailureReason::PermissionDenied => " (not executable)",
                _ => "",
            };
            format!(
                "{} {}{}",
                failure.reason.as_str().bright_red().bold(),
                failure.message,
                hint
            )
        }
    }
}

/// Operator-facing text for a model exchange. Unreachable servers get a
/// message of their own.
pub fn exchange_text(exchange: &ModelExchange, endpoint: &str) -> String {
    match &exchange.outcome {
        ExchangeOutcome::Responded { text } => text.clone(),
        ExchangeOutcome::Failed { reason, message } => {
            use crate::core::envelope::ModelFailureReason as R;
            let headline = match reason {
                R::ModelUnreachable => format!("model server unreachable at {}", endpoint),
                R::ModelTimeout => "model call timed out".to_string(),
                R::Cancelled => "model call cancelled".to_string(),
                R::ModelError => "model returned an error".to_string(),
            };
            format!(
                "{} {}: {}",
                reason.as_str().bright_red().bold(),
                headline,
                compact_line(message, 200)
            )
        }
    }
}

/// Single-line summary of a ledger entry for `ledger show`.
pub fn entry_line(entry: &LedgerEntry, max_chars: usize) -> String {
    let head = format!(
        "#{:<5} {} {:<24}",
        entry.seq,
        time::format_epoch_ms(entry.ts),
        entry.event.kind()
    );
    let tail = match &entry.event {
        LedgerEvent::CommandRejected { verdict } => format!(
            "{:<18} {}",
            verdict.reason.as_str(),
            compact_line(&verdict.command.raw, max_chars)
        ),
        LedgerEvent::CommandAccepted { verdict, outcome } => {
            let status = match outcome {
                Some(ExecutionOutcome::Finished(r)) if r.status == ExecutionStatus::Completed => {
                    format!("exit {}", r.exit_code)
                }
                Some(ExecutionOutcome::Finished(r)) => r.status.as_str().to_string(),
                Some(ExecutionOutcome::Failed(f)) => f.reason.as_str().to_string(),
                None => "-".to_string(),
            };
            format!(
                "{:<18} {}",
                status,
                compact_line(&verdict.command.raw, max_chars)
            )
        }
        LedgerEvent::ModelExchangeRecorded { exchange } => {
            let status = exchange
                .failure_reason()
                .map(|r| r.as_str().to_string())
                .unwrap_or_else(|| format!("{}ms", exchange.latency_ms));
            format!(
                "{:<18} {}",
                status,
                compact_line(&exchange.request.query, max_chars)
            )
        }
    };
    format!("{} {}", head, tail)
}
