use ledgate::core::cancel::CancelToken;
use ledgate::core::config::ModelConfig;
use ledgate::core::envelope::{
    Direction, ExchangeOutcome, ModelFailureReason, ModelRequest, PROVENANCE_TAG,
    ProtocolEnvelope, SYSTEM_PREAMBLE, sha256_hex,
};
use ledgate::core::error::LedgateError;
use ledgate::core::ledger::{Ledger, LedgerEntry, LedgerEvent, LedgerSink};
use ledgate::core::model_client::{ModelClient, ModelClientError, OllamaClient};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Scripted client that records what it was asked.
struct FakeClient {
    reply: Result<String, ModelClientError>,
    delay: Duration,
    seen: Mutex<Vec<ModelRequest>>,
}

impl FakeClient {
    fn answering(text: &str) -> Self {
        Self {
            reply: Ok(text.to_string()),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn failing(error: ModelClientError) -> Self {
        Self {
            reply: Err(error),
            delay: Duration::ZERO,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            reply: Ok("late".to_string()),
            delay,
            seen: Mutex::new(Vec::new()),
        }
    }
}

impl ModelClient for FakeClient {
    fn complete(
        &self,
        request: &ModelRequest,
        _timeout: Duration,
    ) -> Result<String, ModelClientError> {
        self.seen.lock().unwrap().push(request.clone());
        thread::sleep(self.delay);
        self.reply.clone()
    }

    fn endpoint(&self) -> String {
        "fake://model".to_string()
    }
}

struct FailingSink;

impl LedgerSink for FailingSink {
    fn write_record(&mut self, _record: &[u8]) -> io::Result<()> {
        Err(io::Error::other("read-only filesystem"))
    }
}

fn envelope_with(
    client: Arc<dyn ModelClient>,
    config: &ModelConfig,
) -> (TempDir, Arc<Ledger>, ProtocolEnvelope) {
    let tmp = tempfile::tempdir().unwrap();
    let ledger = Arc::new(Ledger::create(tmp.path(), "session-env").unwrap());
    let envelope = ProtocolEnvelope::new(client, Arc::clone(&ledger), config);
    (tmp, ledger, envelope)
}

fn recorded(ledger: &Ledger) -> Vec<LedgerEntry> {
    ledger.entries().unwrap().map(|e| e.unwrap()).collect()
}

#[test]
fn response_is_stamped_hashed_and_recorded_once() {
    let client = Arc::new(FakeClient::answering("1. run ls\n2. read output"));
    let (_tmp, ledger, envelope) = envelope_with(client.clone(), &ModelConfig::default());

    let exchange = envelope.dispatch("how do I list files?", &CancelToken::new()).unwrap();

    assert_eq!(exchange.response_text(), Some("1. run ls\n2. read output"));
    assert_eq!(exchange.request.system_preamble, SYSTEM_PREAMBLE);
    assert_eq!(exchange.request.provenance.tag, PROVENANCE_TAG);
    assert_eq!(exchange.request.provenance.direction, Direction::Request);
    assert!(exchange.response_provenance.is_fixed_tag());
    assert_eq!(exchange.response_provenance.direction, Direction::Response);
    assert_eq!(exchange.response_provenance.session_id, "session-env");
    assert_eq!(exchange.prompt_sha256, sha256_hex(&exchange.request.prompt_text()));
    assert_eq!(
        exchange.response_sha256.as_deref(),
        Some(sha256_hex("1. run ls\n2. read output").as_str())
    );

    let seen = client.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].query, "how do I list files?");
    assert_eq!(seen[0].temperature, 0.0);

    let entries = recorded(&ledger);
    assert_eq!(entries.len(), 1);
    match &entries[0].event {
        LedgerEvent::ModelExchangeRecorded { exchange: logged } => assert_eq!(logged, &exchange),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn preamble_is_identical_across_queries() {
    let client = Arc::new(FakeClient::answering("ok"));
    let (_tmp, ledger, envelope) = envelope_with(client.clone(), &ModelConfig::default());
    let cancel = CancelToken::new();

    let a = envelope.dispatch("first", &cancel).unwrap();
    let b = envelope.dispatch("second", &cancel).unwrap();
    assert_eq!(a.request.system_preamble, b.request.system_preamble);
    assert_ne!(a.prompt_sha256, b.prompt_sha256);
    assert_ne!(a.exchange_id, b.exchange_id);
    assert_eq!(recorded(&ledger).len(), 2);
}

#[test]
fn server_error_is_recorded_as_model_error() {
    let client = Arc::new(FakeClient::failing(ModelClientError::Status {
        status: 404,
        body: "model 'llama3' not found".to_string(),
    }));
    let (_tmp, ledger, envelope) = envelope_with(client, &ModelConfig::default());

    let exchange = envelope.dispatch("hello", &CancelToken::new()).unwrap();
    assert_eq!(exchange.failure_reason(), Some(ModelFailureReason::ModelError));
    assert_eq!(exchange.response_sha256, None);
    match &exchange.outcome {
        ExchangeOutcome::Failed { message, .. } => assert!(message.contains("404")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(recorded(&ledger).len(), 1);
}

#[test]
fn unreachable_server_is_recorded_once() {
    let config = ModelConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        timeout_secs: 5,
        ..ModelConfig::default()
    };
    let client = Arc::new(OllamaClient::new(&config).unwrap());
    let (_tmp, ledger, envelope) = envelope_with(client, &config);

    let exchange = envelope.dispatch("anyone there?", &CancelToken::new()).unwrap();
    assert_eq!(
        exchange.failure_reason(),
        Some(ModelFailureReason::ModelUnreachable)
    );
    let entries = recorded(&ledger);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].event.kind(), "model_exchange_recorded");
}

#[test]
fn cancel_abandons_a_slow_call() {
    let client = Arc::new(FakeClient::slow(Duration::from_secs(3)));
    let (_tmp, ledger, envelope) = envelope_with(client, &ModelConfig::default());
    let cancel = CancelToken::new();
    let remote = cancel.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        remote.cancel();
    });

    let start = Instant::now();
    let exchange = envelope.dispatch("take your time", &cancel).unwrap();
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(exchange.failure_reason(), Some(ModelFailureReason::Cancelled));
    assert_eq!(recorded(&ledger).len(), 1);
}

#[test]
fn silent_model_is_recorded_as_timeout() {
    let client = Arc::new(FakeClient::slow(Duration::from_secs(6)));
    let config = ModelConfig {
        timeout_secs: 1,
        ..ModelConfig::default()
    };
    let (_tmp, ledger, envelope) = envelope_with(client, &config);

    let start = Instant::now();
    let exchange = envelope.dispatch("are you there?", &CancelToken::new()).unwrap();
    let waited = start.elapsed();
    assert!(waited >= Duration::from_secs(1), "gave up after {:?}", waited);
    assert!(waited < Duration::from_secs(5), "waited {:?}", waited);
    assert_eq!(exchange.failure_reason(), Some(ModelFailureReason::ModelTimeout));
    assert_eq!(exchange.response_sha256, None);

    let entries = recorded(&ledger);
    assert_eq!(entries.len(), 1);
    match &entries[0].event {
        LedgerEvent::ModelExchangeRecorded { exchange: logged } => {
            assert_eq!(logged.failure_reason(), Some(ModelFailureReason::ModelTimeout))
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn client_timeout_is_recorded_as_model_timeout() {
    let client = Arc::new(FakeClient::failing(ModelClientError::Timeout(
        "operation timed out".to_string(),
    )));
    let (_tmp, ledger, envelope) = envelope_with(client, &ModelConfig::default());

    let exchange = envelope.dispatch("hello", &CancelToken::new()).unwrap();
    assert_eq!(exchange.failure_reason(), Some(ModelFailureReason::ModelTimeout));
    match &exchange.outcome {
        ExchangeOutcome::Failed { message, .. } => assert!(message.contains("timed out")),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(recorded(&ledger).len(), 1);
}

#[test]
fn ledger_failure_is_an_error() {
    let ledger = Arc::new(Ledger::with_sink(
        "/unwritable/ledger.jsonl",
        "session-env",
        Box::new(FailingSink),
    ));
    let envelope = ProtocolEnvelope::new(
        Arc::new(FakeClient::answering("ok")),
        ledger,
        &ModelConfig::default(),
    );
    let err = envelope.dispatch("hi", &CancelToken::new()).unwrap_err();
    assert!(matches!(err, LedgateError::LedgerWrite { .. }));
}

/// Serve one canned chat completion and hand back the request body.
fn serve_once(body: &'static str) -> (String, thread::JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let base_url = format!("http://{}", listener.local_addr().unwrap());
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut content_length = 0usize;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let header = line.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap();
                }
            }
        }
        let mut request_body = vec![0u8; content_length];
        reader.read_exact(&mut request_body).unwrap();

        let mut stream = stream;
        write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
        .unwrap();
        stream.flush().unwrap();
        String::from_utf8(request_body).unwrap()
    });
    (base_url, handle)
}

#[test]
fn ollama_client_speaks_chat_completions() {
    let (base_url, server) =
        serve_once(r#"{"choices":[{"message":{"role":"assistant","content":"use ls"}}]}"#);
    let config = ModelConfig {
        base_url,
        model: "tinyllama".to_string(),
        timeout_secs: 10,
        ..ModelConfig::default()
    };
    let client = Arc::new(OllamaClient::new(&config).unwrap());
    let (_tmp, _ledger, envelope) = envelope_with(client, &config);

    let exchange = envelope.dispatch("list files", &CancelToken::new()).unwrap();
    assert_eq!(exchange.response_text(), Some("use ls"));

    let sent: serde_json::Value = serde_json::from_str(&server.join().unwrap()).unwrap();
    assert_eq!(sent["model"], "tinyllama");
    assert_eq!(sent["messages"][0]["role"], "system");
    assert_eq!(sent["messages"][0]["content"], SYSTEM_PREAMBLE);
    assert_eq!(sent["messages"][1]["content"], "list files");
    assert_eq!(sent["temperature"], 0.0);
}
