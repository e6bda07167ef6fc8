//! Append-only audit ledger.
//!
//! One JSON Lines file per invocation. Every record is self-describing
//! (`kind` tag plus fields) and carries a strictly increasing `seq`, the hash
//! of its predecessor and its own SHA-256 hash, so any edit, removal or
//! reordering after the fact breaks the chain that [`verify`] walks.
//!
//! Appends are serialized behind a mutex covering "assign seq, hash, write,
//! fsync". An append that cannot be made durable is fatal: the writer refuses
//! every later append and the caller must stop processing actions.
//!
//! Readers stream the file lazily and ignore a final record that lacks its
//! newline, which is what a crash mid-write leaves behind.

use crate::core::envelope::ModelExchange;
use crate::core::error::LedgateError;
use crate::core::executor::{ExecutionFailure, ExecutionResult};
use crate::core::gate::Verdict;
use crate::core::time;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use ulid::Ulid;

pub const LEDGER_PREFIX: &str = "ledger-";
pub const LEDGER_EXT: &str = "jsonl";
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What happened to an accepted command once it reached the executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Finished(ExecutionResult),
    Failed(ExecutionFailure),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerEvent {
    CommandAccepted {
        verdict: Verdict,
        #[serde(default)]
        outcome: Option<ExecutionOutcome>,
    },
    CommandRejected {
        verdict: Verdict,
    },
    ModelExchangeRecorded {
        exchange: ModelExchange,
    },
}

impl LedgerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerEvent::CommandAccepted { .. } => "command_accepted",
            LedgerEvent::CommandRejected { .. } => "command_rejected",
            LedgerEvent::ModelExchangeRecorded { .. } => "model_exchange_recorded",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: u64,
    pub ts: u64,
    pub session_id: String,
    #[serde(flatten)]
    pub event: LedgerEvent,
    pub prev_hash: String,
    pub hash: String,
}

impl LedgerEntry {
    /// Recompute this entry's hash from its content.
    pub fn compute_hash(&self) -> Result<String, serde_json::Error> {
        entry_hash(
            self.seq,
            self.ts,
            &self.session_id,
            &self.prev_hash,
            &self.event,
        )
    }
}

#[derive(Serialize)]
struct HashInput<'a> {
    seq: u64,
    ts: u64,
    session_id: &'a str,
    prev_hash: &'a str,
    event: &'a LedgerEvent,
}

fn entry_hash(
    seq: u64,
    ts: u64,
    session_id: &str,
    prev_hash: &str,
    event: &LedgerEvent,
) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(&HashInput {
        seq,
        ts,
        session_id,
        prev_hash,
        event,
    })?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Storage target for serialized records. `write_record` must not return
/// until the record is durable.
pub trait LedgerSink: Send {
    fn write_record(&mut self, record: &[u8]) -> io::Result<()>;
}

impl LedgerSink for File {
    fn write_record(&mut self, record: &[u8]) -> io::Result<()> {
        self.write_all(record)?;
        self.sync_data()
    }
}

struct Writer {
    sink: Box<dyn LedgerSink>,
    next_seq: u64,
    last_hash: String,
    failed: bool,
}

pub struct Ledger {
    path: PathBuf,
    session_id: String,
    writer: Mutex<Writer>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.path)
            .field("session_id", &self.session_id)
            .finish()
    }
}

impl Ledger {
    /// Create a fresh ledger file under `dir` for this invocation.
    pub fn create(dir: &Path, session_id: &str) -> Result<Self, LedgateError> {
        fs::create_dir_all(dir).map_err(|e| LedgateError::ledger_write(dir, e))?;
        let path = dir.join(format!("{}{}.{}", LEDGER_PREFIX, Ulid::new(), LEDGER_EXT));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .map_err(|e| LedgateError::ledger_write(&path, e))?;
        sync_dir(dir);
        tracing::debug!(path = %path.display(), session_id, "ledger created");
        Ok(Self::with_sink(path, session_id, Box::new(file)))
    }

    /// Attach a ledger to an arbitrary sink. `path` is where readers look.
    pub fn with_sink(
        path: impl Into<PathBuf>,
        session_id: &str,
        sink: Box<dyn LedgerSink>,
    ) -> Self {
        Self {
            path: path.into(),
            session_id: session_id.to_string(),
            writer: Mutex::new(Writer {
                sink,
                next_seq: 1,
                last_hash: GENESIS_HASH.to_string(),
                failed: false,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Record `event` durably and return the entry as written.
    pub fn append(&self, event: LedgerEvent) -> Result<LedgerEntry, LedgateError> {
        let mut writer = self.writer.lock().map_err(|_| {
            LedgateError::ledger_write(&self.path, io::Error::other("ledger writer poisoned"))
        })?;
        if writer.failed {
            return Err(LedgateError::ledger_write(
                &self.path,
                io::Error::other("ledger refused append after an earlier write failure"),
            ));
        }

        let seq = writer.next_seq;
        let ts = time::now_epoch_ms();
        let hash = entry_hash(seq, ts, &self.session_id, &writer.last_hash, &event)
            .map_err(|e| LedgateError::ledger_write(&self.path, io::Error::other(e)))?;
        let entry = LedgerEntry {
            seq,
            ts,
            session_id: self.session_id.clone(),
            event,
            prev_hash: writer.last_hash.clone(),
            hash,
        };
        let mut record = serde_json::to_vec(&entry)
            .map_err(|e| LedgateError::ledger_write(&self.path, io::Error::other(e)))?;
        record.push(b'\n');

        if let Err(e) = writer.sink.write_record(&record) {
            // A torn record may now sit at the tail; never write after it.
            writer.failed = true;
            tracing::error!(path = %self.path.display(), seq, error = %e, "ledger append failed");
            return Err(LedgateError::ledger_write(&self.path, e));
        }

        writer.next_seq += 1;
        writer.last_hash = entry.hash.clone();
        tracing::debug!(seq, kind = entry.event.kind(), "ledger append");
        Ok(entry)
    }

    /// Sequence number the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.writer.lock().map(|w| w.next_seq).unwrap_or(0)
    }

    pub fn is_writable(&self) -> bool {
        self.writer.lock().map(|w| !w.failed).unwrap_or(false)
    }

    /// Fresh lazy read from the first record.
    pub fn entries(&self) -> Result<LedgerEntries, LedgateError> {
        read_entries(&self.path)
    }
}

fn sync_dir(dir: &Path) {
    // Persist the new directory entry; not every platform can open a directory.
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

/// Lazy reader over one ledger file.
pub struct LedgerEntries {
    path: PathBuf,
    reader: BufReader<File>,
    buf: Vec<u8>,
    line: usize,
    done: bool,
    torn_tail: bool,
}

impl LedgerEntries {
    /// Whether the read stopped at an incomplete final record.
    pub fn torn_tail(&self) -> bool {
        self.torn_tail
    }
}

impl Iterator for LedgerEntries {
    type Item = Result<LedgerEntry, LedgateError>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            self.buf.clear();
            match self.reader.read_until(b'\n', &mut self.buf) {
                Ok(0) => self.done = true,
                Ok(_) => {
                    self.line += 1;
                    if self.buf.last() != Some(&b'\n') {
                        self.done = true;
                        self.torn_tail = true;
                        tracing::warn!(
                            path = %self.path.display(),
                            line = self.line,
                            "ignoring incomplete trailing ledger record"
                        );
                        continue;
                    }
                    let record = &self.buf[..self.buf.len() - 1];
                    if record.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    return Some(serde_json::from_slice(record).map_err(|e| {
                        LedgateError::LedgerCorrupt {
                            path: self.path.clone(),
                            line: self.line,
                            message: e.to_string(),
                        }
                    }));
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(LedgateError::IoError(e)));
                }
            }
        }
        None
    }
}

pub fn read_entries(path: &Path) -> Result<LedgerEntries, LedgateError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => LedgateError::NotFound(format!("ledger {}", path.display())),
        _ => LedgateError::IoError(e),
    })?;
    Ok(LedgerEntries {
        path: path.to_path_buf(),
        reader: BufReader::new(file),
        buf: Vec::new(),
        line: 0,
        done: false,
        torn_tail: false,
    })
}

/// Ledger files under `dir`, oldest first.
pub fn list_ledgers(dir: &Path) -> Result<Vec<PathBuf>, LedgateError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file()
                && p.extension().and_then(|e| e.to_str()) == Some(LEDGER_EXT)
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(LEDGER_PREFIX))
        })
        .collect();
    // ULID names sort by creation time.
    files.sort();
    Ok(files)
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub path: PathBuf,
    pub entries: usize,
    pub last_seq: Option<u64>,
    pub torn_tail: bool,
    pub problems: Vec<String>,
}

impl VerifyReport {
    pub fn is_intact(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Walk a ledger file checking sequence continuity and the hash chain.
pub fn verify(path: &Path) -> Result<VerifyReport, LedgateError> {
    let mut reader = read_entries(path)?;
    let mut report = VerifyReport {
        path: path.to_path_buf(),
        entries: 0,
        last_seq: None,
        torn_tail: false,
        problems: Vec::new(),
    };
    let mut expected_seq = 1u64;
    let mut expected_prev = Some(GENESIS_HASH.to_string());
    let mut session: Option<String> = None;

    for item in reader.by_ref() {
        let entry = match item {
            Ok(entry) => entry,
            Err(LedgateError::LedgerCorrupt { line, message, .. }) => {
                report
                    .problems
                    .push(format!("line {}: unreadable record: {}", line, message));
                expected_prev = None;
                continue;
            }
            Err(e) => return Err(e),
        };
        report.entries += 1;

        if entry.seq != expected_seq {
            report.problems.push(format!(
                "seq {}: expected seq {}",
                entry.seq, expected_seq
            ));
        }
        if let Some(prev) = &expected_prev {
            if &entry.prev_hash != prev {
                report
                    .problems
                    .push(format!("seq {}: prev_hash does not link to previous record", entry.seq));
            }
        }
        match entry.compute_hash() {
            Ok(hash) if hash == entry.hash => {}
            Ok(_) => report
                .problems
                .push(format!("seq {}: content does not match hash", entry.seq)),
            Err(e) => report
                .problems
                .push(format!("seq {}: cannot rehash: {}", entry.seq, e)),
        }
        match &session {
            None => session = Some(entry.session_id.clone()),
            Some(s) if s != &entry.session_id => report.problems.push(format!(
                "seq {}: session_id {} differs from {}",
                entry.seq, entry.session_id, s
            )),
            Some(_) => {}
        }

        expected_seq = entry.seq.saturating_add(1);
        expected_prev = Some(entry.hash.clone());
        report.last_seq = Some(entry.seq);
    }

    report.torn_tail = reader.torn_tail();
    Ok(report)
}
