use ledgate::core::config::GateConfig;
use ledgate::core::envelope::{
    Direction, ExchangeOutcome, ModelExchange, ModelFailureReason, ModelRequest, Provenance,
    SYSTEM_PREAMBLE, sha256_hex,
};
use ledgate::core::error::LedgateError;
use ledgate::core::executor::{ExecutionFailure, ExecutionResult, ExecutionStatus, FailureReason};
use ledgate::core::gate::{Command, InvariantGate, Verdict};
use ledgate::core::ledger::{
    ExecutionOutcome, GENESIS_HASH, Ledger, LedgerEntry, LedgerEvent, read_entries, verify,
};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

fn verdict(text: &str) -> Verdict {
    InvariantGate::new(&GateConfig::default())
        .unwrap()
        .evaluate(Command::new(text))
}

fn rejected(text: &str) -> LedgerEvent {
    LedgerEvent::CommandRejected {
        verdict: verdict(text),
    }
}

fn accepted(text: &str) -> LedgerEvent {
    LedgerEvent::CommandAccepted {
        verdict: verdict(text),
        outcome: None,
    }
}

fn finished(text: &str, status: ExecutionStatus, exit_code: i32) -> LedgerEvent {
    let verdict = verdict(text);
    LedgerEvent::CommandAccepted {
        outcome: Some(ExecutionOutcome::Finished(ExecutionResult {
            command: verdict.command.clone(),
            status,
            exit_code,
            stdout: "total 0\nünïcödé \"quoted\"\n".to_string(),
            stderr: String::new(),
            stdout_truncated: status == ExecutionStatus::TimedOut,
            stderr_truncated: false,
            duration_ms: 12,
        })),
        verdict,
    }
}

fn spawn_failed(text: &str) -> LedgerEvent {
    let verdict = verdict(text);
    LedgerEvent::CommandAccepted {
        outcome: Some(ExecutionOutcome::Failed(ExecutionFailure {
            command: verdict.command.clone(),
            reason: FailureReason::NotFound,
            message: "failed to start 'nope': No such file or directory".to_string(),
        })),
        verdict,
    }
}

fn exchange(query: &str, outcome: ExchangeOutcome) -> LedgerEvent {
    let request = ModelRequest {
        model: "llama3".to_string(),
        system_preamble: SYSTEM_PREAMBLE.to_string(),
        query: query.to_string(),
        temperature: 0.5,
        max_tokens: Some(256),
        provenance: Provenance::stamp(Direction::Request, "session-test", "operator"),
    };
    let response_sha256 = match &outcome {
        ExchangeOutcome::Responded { text } => Some(sha256_hex(text)),
        ExchangeOutcome::Failed { .. } => None,
    };
    LedgerEvent::ModelExchangeRecorded {
        exchange: ModelExchange {
            exchange_id: format!("x-{}", query.len()),
            prompt_sha256: sha256_hex(&request.prompt_text()),
            request,
            outcome,
            response_sha256,
            response_provenance: Provenance::stamp(
                Direction::Response,
                "session-test",
                "model:llama3",
            ),
            started_at: 1_700_000_000_000,
            latency_ms: 431,
        },
    }
}

/// One event of every shape the ledger records, cycled.
fn event(i: usize) -> LedgerEvent {
    match i % 7 {
        0 => accepted(&format!("echo {}", i)),
        1 => rejected(&format!("echo {} | cat", i)),
        2 => finished(&format!("ls -la {}", i), ExecutionStatus::Completed, 0),
        3 => finished(&format!("sleep {}", i), ExecutionStatus::TimedOut, -1),
        4 => spawn_failed(&format!("nope {}", i)),
        5 => exchange(
            &format!("question {}", i),
            ExchangeOutcome::Responded {
                text: "1. run `ls`\n2. read it".to_string(),
            },
        ),
        _ => exchange(
            &format!("question {}", i),
            ExchangeOutcome::Failed {
                reason: ModelFailureReason::ModelUnreachable,
                message: "connection refused".to_string(),
            },
        ),
    }
}

fn setup(n: usize) -> (TempDir, Ledger, Vec<LedgerEntry>) {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = Ledger::create(tmp.path(), "session-test").unwrap();
    let written = (0..n).map(|i| ledger.append(event(i)).unwrap()).collect();
    (tmp, ledger, written)
}

#[test]
fn read_back_matches_written_entries() {
    let (_tmp, ledger, written) = setup(14);
    let read: Vec<LedgerEntry> = ledger.entries().unwrap().map(|e| e.unwrap()).collect();
    assert_eq!(read, written);
    assert_eq!(read[0].prev_hash, GENESIS_HASH);
    for pair in read.windows(2) {
        assert_eq!(pair[1].seq, pair[0].seq + 1);
        assert_eq!(pair[1].prev_hash, pair[0].hash);
    }
    for entry in &read {
        assert_eq!(entry.compute_hash().unwrap(), entry.hash);
    }
}

#[test]
fn entries_restart_from_the_first_record() {
    let (_tmp, ledger, _written) = setup(3);
    let mut first = ledger.entries().unwrap();
    assert_eq!(first.next().unwrap().unwrap().seq, 1);
    assert_eq!(first.next().unwrap().unwrap().seq, 2);

    let seqs: Vec<u64> = ledger.entries().unwrap().map(|e| e.unwrap().seq).collect();
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[test]
fn torn_final_record_is_ignored() {
    let (_tmp, ledger, written) = setup(8);
    let content = fs::read_to_string(ledger.path()).unwrap();
    let last_line = content.lines().last().unwrap();
    let keep = content.len() - last_line.len() / 2 - 1;
    fs::write(ledger.path(), &content.as_bytes()[..keep]).unwrap();

    let mut reader = read_entries(ledger.path()).unwrap();
    let read: Vec<LedgerEntry> = reader.by_ref().map(|e| e.unwrap()).collect();
    assert_eq!(read, written[..7].to_vec());
    assert!(reader.torn_tail());

    let report = verify(ledger.path()).unwrap();
    assert!(report.is_intact(), "{:?}", report.problems);
    assert!(report.torn_tail);
    assert_eq!(report.last_seq, Some(7));
}

#[test]
fn concurrent_appends_get_gapless_sequence() {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::create(tmp.path(), "session-threads").unwrap());
    let threads = 8;
    let per_thread = 25;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let ledger = Arc::clone(&ledger);
            thread::spawn(move || {
                (0..per_thread)
                    .map(|i| ledger.append(rejected(&format!("t{} & {}", t, i))).unwrap().seq)
                    .collect::<Vec<u64>>()
            })
        })
        .collect();
    for handle in handles {
        let seqs = handle.join().unwrap();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    let seqs: Vec<u64> = ledger.entries().unwrap().map(|e| e.unwrap().seq).collect();
    let expected: Vec<u64> = (1..=(threads * per_thread) as u64).collect();
    assert_eq!(seqs, expected);

    let report = verify(ledger.path()).unwrap();
    assert!(report.is_intact(), "{:?}", report.problems);
    assert_eq!(report.entries, threads * per_thread);
}

#[test]
fn verify_flags_edited_record() {
    let (_tmp, ledger, _written) = setup(3);
    let content = fs::read_to_string(ledger.path()).unwrap();
    let tampered = content.replacen("echo 0", "echo X", 1);
    assert_ne!(tampered, content);
    fs::write(ledger.path(), tampered).unwrap();

    let report = verify(ledger.path()).unwrap();
    assert!(!report.is_intact());
    assert!(
        report
            .problems
            .iter()
            .any(|p| p.starts_with("seq 1:") && p.contains("hash"))
    );
}

#[test]
fn verify_flags_reordered_and_removed_records() {
    let (_tmp, ledger, _written) = setup(4);
    let content = fs::read_to_string(ledger.path()).unwrap();
    let mut lines: Vec<&str> = content.lines().collect();

    lines.swap(1, 2);
    fs::write(ledger.path(), format!("{}\n", lines.join("\n"))).unwrap();
    let report = verify(ledger.path()).unwrap();
    assert!(report.problems.iter().any(|p| p.contains("expected seq")));

    lines.swap(1, 2);
    lines.remove(1);
    fs::write(ledger.path(), format!("{}\n", lines.join("\n"))).unwrap();
    let report = verify(ledger.path()).unwrap();
    assert!(report.problems.iter().any(|p| p.contains("prev_hash")));
}

#[test]
fn garbage_line_is_reported_as_corrupt() {
    let (_tmp, ledger, _written) = setup(2);
    let mut file = OpenOptions::new().append(true).open(ledger.path()).unwrap();
    file.write_all(b"{not json}\n").unwrap();

    let items: Vec<_> = read_entries(ledger.path()).unwrap().collect();
    assert_eq!(items.len(), 3);
    assert!(matches!(
        items[2],
        Err(LedgateError::LedgerCorrupt { line: 3, .. })
    ));

    let report = verify(ledger.path()).unwrap();
    assert_eq!(report.entries, 2);
    assert!(report.problems.iter().any(|p| p.starts_with("line 3:")));
}

#[test]
fn every_record_carries_kind_and_session() {
    let (_tmp, ledger, _written) = setup(2);
    let content = fs::read_to_string(ledger.path()).unwrap();
    let kinds: Vec<String> = content
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).unwrap();
            assert_eq!(value["session_id"], "session-test");
            assert!(value["ts"].as_u64().unwrap() > 0);
            value["kind"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["command_accepted", "command_rejected"]);
}
