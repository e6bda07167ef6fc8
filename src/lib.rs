//! ledgate: an audited gate between a terminal and a local language model.
//!
//! Every shell command the operator types passes an invariant gate before it
//! may run, every model query is wrapped in a fixed provenance envelope, and
//! every action lands in an append-only, hash-chained ledger before its
//! result is shown.
//!
//! # Architecture
//!
//! - [`core::gate`]: pure accept/reject decision with a closed reason code
//! - [`core::executor`]: direct child-process spawn (no shell), bounded
//!   capture, timeout and interrupt handling
//! - [`core::ledger`]: JSON Lines audit trail, fsync per record, torn-tail
//!   tolerant reads and hash-chain verification
//! - [`core::envelope`]: system preamble, provenance stamps and exactly-once
//!   recording of model exchanges
//! - [`core::session`]: one operator action at a time, halting if the
//!   ledger can no longer be written
//!
//! # Examples
//!
//! ```bash
//! # Interactive session; `? question` asks the model
//! ledgate shell
//!
//! # One command through the gate
//! ledgate exec -- ls -la
//!
//! # Inspect and verify the most recent ledger
//! ledgate ledger show
//! ledgate ledger verify
//! ```

pub mod core;

use crate::core::{
    cancel::CancelToken,
    config::Config,
    error,
    executor::ExecContext,
    gate::{Command as GateCommand, InvariantGate},
    ledger::{self, ExecutionOutcome},
    model_client::OllamaClient,
    output,
    session::{CommandReport, Session},
    time,
};

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[clap(
    name = "ledgate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Invariant-gated shell and audited local model access"
)]
struct Cli {
    /// Configuration file (defaults to .ledgate/config.toml when present).
    #[clap(long, global = true)]
    config: Option<PathBuf>,
    /// Override the ledger directory.
    #[clap(long, global = true)]
    ledger_dir: Option<PathBuf>,
    /// Override the model name.
    #[clap(long, global = true)]
    model: Option<String>,
    /// Override the model server base URL.
    #[clap(long, global = true)]
    model_url: Option<String>,
    /// Debug-level diagnostics on stderr.
    #[clap(short, long, global = true)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Interactive session: commands run through the gate, `? text` asks the model
    Shell,

    /// Run one command through the gate and executor
    Exec {
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
        #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Show the gate verdict for a command without running or recording it
    Check {
        #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Send one query to the local model
    Ask {
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
        #[clap(required = true, trailing_var_arg = true)]
        query: Vec<String>,
    },

    /// Inspect audit ledgers
    Ledger(LedgerCli),

    /// Show configuration
    Config(ConfigCli),
}

#[derive(clap::Args, Debug)]
struct LedgerCli {
    #[clap(subcommand)]
    command: LedgerCommand,
}

#[derive(Subcommand, Debug)]
enum LedgerCommand {
    /// List ledger files, oldest first
    List,
    /// Print the entries of a ledger (latest by default)
    Show {
        #[clap(long)]
        path: Option<PathBuf>,
        /// Only the last N entries.
        #[clap(long)]
        limit: Option<usize>,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
    /// Check sequence continuity and the hash chain
    Verify {
        #[clap(long)]
        path: Option<PathBuf>,
        /// Output format: 'text' or 'json'.
        #[clap(long, default_value = "text")]
        format: String,
    },
}

#[derive(clap::Args, Debug)]
struct ConfigCli {
    #[clap(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
}

/// Console diagnostics follow `LEDGATE_LOG`/`RUST_LOG` (default warn, debug
/// with `-v`). The session log file, when given, always gets debug.
fn init_logging(verbose: bool, session_log: Option<File>) {
    let default_level = if verbose { "debug" } else { "warn" };
    let console_filter = EnvFilter::try_from_env("LEDGATE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| default_level.into());
    let console = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .without_time()
        .with_filter(console_filter);
    let file = session_log.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_filter(EnvFilter::new("ledgate=debug"))
    });
    let _ = tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init();
}

/// `<log dir>/ledgate-<session id>.log`, appended to.
fn open_session_log(
    config: &Config,
    base_dir: &Path,
    session_id: &str,
) -> io::Result<(PathBuf, File)> {
    let dir = config.log_dir(base_dir);
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("ledgate-{}.log", session_id));
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

fn load_config(cli: &Cli, base_dir: &Path) -> Result<Config, error::LedgateError> {
    let mut config = Config::load(base_dir, cli.config.as_deref())?;
    if let Some(dir) = &cli.ledger_dir {
        config.ledger.dir = dir.clone();
    }
    if let Some(model) = &cli.model {
        config.model.model = model.clone();
    }
    if let Some(url) = &cli.model_url {
        config.model.base_url = url.clone();
    }
    config.validate()?;
    Ok(config)
}

/// The command line as the operator meant it: one argument verbatim, several
/// re-quoted so their boundaries survive the gate's split.
fn command_text(args: &[String]) -> Result<String, error::LedgateError> {
    match args {
        [single] => Ok(single.clone()),
        _ => shlex::try_join(args.iter().map(String::as_str)).map_err(|e| {
            error::LedgateError::ValidationError(format!("cannot quote command: {}", e))
        }),
    }
}

/// Start logging for a recorded session and open it under the same id. A log
/// file that cannot be created costs diagnostics only, never the session.
fn open_session(
    config: &Config,
    base_dir: &Path,
    verbose: bool,
) -> Result<Session, error::LedgateError> {
    let id = time::new_event_id();
    match open_session_log(config, base_dir, &id) {
        Ok((path, file)) => {
            init_logging(verbose, Some(file));
            tracing::debug!(log = %path.display(), "session log opened");
        }
        Err(e) => {
            init_logging(verbose, None);
            tracing::warn!(error = %e, "session log unavailable, console only");
        }
    }
    let client = Arc::new(OllamaClient::new(&config.model)?);
    Session::open_as(&id, config, base_dir, client, ExecContext::in_dir(base_dir))
}

pub fn run() -> Result<(), error::LedgateError> {
    let cli = Cli::parse();
    let current_dir = std::env::current_dir()?;
    let config = load_config(&cli, &current_dir)?;
    let records = matches!(
        cli.command,
        Command::Shell | Command::Exec { .. } | Command::Ask { .. }
    );
    if !records {
        init_logging(cli.verbose, None);
    }

    match cli.command {
        Command::Shell => {
            let mut session = open_session(&config, &current_dir, cli.verbose)?;
            run_shell(&mut session)
        }
        Command::Exec { format, command } => {
            let mut session = open_session(&config, &current_dir, cli.verbose)?;
            let cancel = CancelToken::new();
            cancel.register_interrupt()?;
            let report = session.submit_command(&command_text(&command)?, &cancel)?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
            } else {
                print_command_report(&report);
            }
            command_exit(&report)
        }
        Command::Check { command } => {
            let gate = InvariantGate::new(&config.gate)?;
            let verdict = gate.evaluate(GateCommand::new(command_text(&command)?));
            println!("{}", output::verdict_line(&verdict));
            if verdict.accepted {
                Ok(())
            } else {
                Err(error::LedgateError::ValidationError(verdict.message()))
            }
        }
        Command::Ask { format, query } => {
            let mut session = open_session(&config, &current_dir, cli.verbose)?;
            let cancel = CancelToken::new();
            cancel.register_interrupt()?;
            let exchange = session.submit_query(&query.join(" "), &cancel)?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&exchange)?);
            } else {
                println!("{}", output::exchange_text(&exchange, &session.envelope().endpoint()));
            }
            match exchange.failure_reason() {
                None => Ok(()),
                Some(reason) => Err(error::LedgateError::ValidationError(format!(
                    "model query failed: {}",
                    reason
                ))),
            }
        }
        Command::Ledger(ledger_cli) => {
            run_ledger_cli(&config.ledger_dir(&current_dir), ledger_cli.command)
        }
        Command::Config(config_cli) => match config_cli.command {
            ConfigCommand::Show => {
                print!("{}", config.to_toml_string()?);
                Ok(())
            }
        },
    }
}

/// Strip the query prefix from a shell line, if it has one.
fn parse_query(line: &str) -> Option<&str> {
    line.strip_prefix('?')
        .or_else(|| line.strip_prefix("ask "))
        .map(str::trim)
}

fn run_shell(session: &mut Session) -> Result<(), error::LedgateError> {
    let cancel = CancelToken::new();
    cancel.register_interrupt()?;

    println!(
        "{} session {} (ledger {})",
        "ledgate".bright_cyan().bold(),
        session.id(),
        session.ledger().path().display()
    );
    println!("Commands run through the gate. `? <question>` asks the model. `exit` quits.");

    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("{} ", "ledgate>".bright_cyan());
        io::stdout().flush()?;

        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                println!();
                continue;
            }
            Err(e) => return Err(e.into()),
        }
        let input = line.trim_end_matches(['\n', '\r']);
        let trimmed = input.trim();
        // A blank line is not an action.
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" || trimmed == "quit" {
            break;
        }

        cancel.reset();
        if let Some(query) = parse_query(trimmed) {
            let exchange = session.submit_query(query, &cancel)?;
            println!("{}", output::exchange_text(&exchange, &session.envelope().endpoint()));
        } else {
            let report = session.submit_command(input, &cancel)?;
            print_command_report(&report);
        }
    }
    Ok(())
}

fn print_command_report(report: &CommandReport) {
    match &report.execution {
        None => eprintln!("{}", output::verdict_line(&report.verdict)),
        Some(outcome) => {
            if let ExecutionOutcome::Finished(result) = outcome {
                print!("{}", result.stdout);
                eprint!("{}", result.stderr);
                if !result.stdout.is_empty() && !result.stdout.ends_with('\n') {
                    println!();
                }
            }
            eprintln!("{} {}", format!("[#{}]", report.seq).dimmed(), output::execution_line(outcome));
        }
    }
}

fn report_json(report: &CommandReport) -> serde_json::Value {
    serde_json::json!({
        "seq": report.seq,
        "verdict": report.verdict,
        "execution": report.execution,
    })
}

fn command_exit(report: &CommandReport) -> Result<(), error::LedgateError> {
    match &report.execution {
        None => Err(error::LedgateError::ValidationError(report.verdict.message())),
        Some(ExecutionOutcome::Failed(failure)) => Err(error::LedgateError::ValidationError(
            failure.to_string(),
        )),
        Some(ExecutionOutcome::Finished(result)) if !result.success() => {
            Err(error::LedgateError::ValidationError(format!(
                "command finished with {} (exit {})",
                result.status.as_str(),
                result.exit_code
            )))
        }
        Some(ExecutionOutcome::Finished(_)) => Ok(()),
    }
}

fn resolve_ledger_path(dir: &Path, path: Option<PathBuf>) -> Result<PathBuf, error::LedgateError> {
    if let Some(p) = path {
        return Ok(p);
    }
    ledger::list_ledgers(dir)?
        .pop()
        .ok_or_else(|| error::LedgateError::NotFound(format!("no ledgers under {}", dir.display())))
}

fn run_ledger_cli(dir: &Path, command: LedgerCommand) -> Result<(), error::LedgateError> {
    match command {
        LedgerCommand::List => {
            for path in ledger::list_ledgers(dir)? {
                println!("{}", path.display());
            }
            Ok(())
        }
        LedgerCommand::Show {
            path,
            limit,
            format,
        } => {
            let path = resolve_ledger_path(dir, path)?;
            let mut entries = ledger::read_entries(&path)?.collect::<Result<Vec<_>, _>>()?;
            if let Some(limit) = limit {
                let skip = entries.len().saturating_sub(limit);
                entries.drain(..skip);
            }
            if format == "json" {
                for entry in &entries {
                    println!("{}", serde_json::to_string(entry)?);
                }
            } else {
                println!("{} {}", "Ledger".bright_cyan().bold(), path.display());
                for entry in &entries {
                    println!("{}", output::entry_line(entry, 80));
                }
            }
            Ok(())
        }
        LedgerCommand::Verify { path, format } => {
            let path = resolve_ledger_path(dir, path)?;
            let report = ledger::verify(&path)?;
            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else if report.is_intact() {
                println!(
                    "{} {} entries, last seq {}{}",
                    "✓ intact:".bright_green().bold(),
                    report.entries,
                    report.last_seq.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                    if report.torn_tail {
                        " (incomplete trailing record ignored)"
                    } else {
                        ""
                    }
                );
            } else {
                println!("{} {}", "✗ broken:".bright_red().bold(), path.display());
                for problem in &report.problems {
                    println!("  - {}", problem);
                }
            }
            if report.is_intact() {
                Ok(())
            } else {
                Err(error::LedgateError::ValidationError(format!(
                    "ledger {} failed verification",
                    path.display()
                )))
            }
        }
    }
}
