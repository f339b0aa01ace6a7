//! End-to-end runs over a scripted mailbox and a stub model.
//!
//! Each test builds an orchestrator on a fresh temp output directory and
//! checks both the reported outcome and what is left on disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use mail_orders::error::{LlmError, MailboxError};
use mail_orders::extractor::OrderExtractor;
use mail_orders::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
use mail_orders::mailbox::{ListMode, MailboxConnector, MailboxSession, MessageId, RawMessage};
use mail_orders::pipeline::{NoopObserver, Orchestrator, RunEvent, RunOutcome, RunSettings, RunState};

/// Maximum time any run is allowed to take before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const ORDER_BODY: &str = "Proszę o 2 sztuki produktu X";

// ── Fake mailbox ────────────────────────────────────────────────────

struct StoredMessage {
    id: String,
    bytes: Vec<u8>,
    seen: bool,
}

#[derive(Default)]
struct MailboxState {
    messages: Vec<StoredMessage>,
    /// Ids whose fetch fails.
    broken: Vec<String>,
    logouts: AtomicUsize,
    fetches: AtomicUsize,
}

/// Connector over an in-memory folder. Fetching never marks messages seen.
struct FakeConnector {
    state: Arc<MailboxState>,
    refuse: bool,
}

impl FakeConnector {
    fn new(messages: Vec<StoredMessage>) -> Self {
        Self {
            state: Arc::new(MailboxState {
                messages,
                ..Default::default()
            }),
            refuse: false,
        }
    }

    fn with_broken_fetch(messages: Vec<StoredMessage>, broken: &[&str]) -> Self {
        Self {
            state: Arc::new(MailboxState {
                messages,
                broken: broken.iter().map(|id| id.to_string()).collect(),
                ..Default::default()
            }),
            refuse: false,
        }
    }

    fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(Vec::new())
        }
    }
}

impl MailboxConnector for FakeConnector {
    fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        if self.refuse {
            return Err(MailboxError::Connection {
                host: "imap.test.com".into(),
                reason: "NO [AUTHENTICATIONFAILED] Invalid credentials".into(),
            });
        }
        Ok(Box::new(FakeSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeSession {
    state: Arc<MailboxState>,
}

impl MailboxSession for FakeSession {
    fn list_messages(
        &mut self,
        _folder: &str,
        mode: ListMode,
    ) -> Result<Vec<MessageId>, MailboxError> {
        Ok(self
            .state
            .messages
            .iter()
            .filter(|m| mode == ListMode::All || !m.seen)
            .map(|m| MessageId(m.id.clone()))
            .collect())
    }

    fn fetch_raw(&mut self, id: &MessageId) -> Result<RawMessage, MailboxError> {
        self.state.fetches.fetch_add(1, Ordering::SeqCst);
        if self.state.broken.contains(&id.0) {
            return Err(MailboxError::Fetch(format!("FETCH {id} rejected: NO server busy")));
        }
        self.state
            .messages
            .iter()
            .find(|m| m.id == id.0)
            .map(|m| RawMessage {
                id: id.clone(),
                bytes: m.bytes.clone(),
            })
            .ok_or_else(|| MailboxError::Fetch(format!("no message {id}")))
    }

    fn logout(self: Box<Self>) -> Result<(), MailboxError> {
        self.state.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn message(id: &str, subject: &str, body: &str, seen: bool) -> StoredMessage {
    let raw = format!(
        "From: Jan Kowalski <jan@example.pl>\r\n\
         To: orders@example.pl\r\n\
         Date: Mon, 3 Jun 2024 10:15:00 +0200\r\n\
         Subject: {subject}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         \r\n\
         {body}\r\n"
    );
    StoredMessage {
        id: id.into(),
        bytes: raw.into_bytes(),
        seen,
    }
}

fn raw_message(id: &str, raw: &str) -> StoredMessage {
    StoredMessage {
        id: id.into(),
        bytes: raw.as_bytes().to_vec(),
        seen: false,
    }
}

// ── Stub model ──────────────────────────────────────────────────────

/// Answers from a fixed table keyed on a substring of the prompt.
struct StubLlm {
    replies: Vec<(&'static str, Result<&'static str, ()>)>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl StubLlm {
    fn new(replies: Vec<(&'static str, Result<&'static str, ()>)>) -> Self {
        Self {
            replies,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let prompt = request.last_user_message().unwrap_or_default();
        self.prompts.lock().unwrap().push(prompt.to_string());
        let reply = self
            .replies
            .iter()
            .find(|(needle, _)| prompt.contains(needle))
            .map(|(_, reply)| *reply)
            .unwrap_or(Ok("{}"));
        match reply {
            Ok(content) => Ok(CompletionResponse {
                content: content.to_string(),
            }),
            Err(()) => Err(LlmError::RequestFailed {
                provider: "stub".into(),
                reason: "HTTP 500".into(),
            }),
        }
    }
}

fn order_reply() -> (&'static str, Result<&'static str, ()>) {
    (
        "produktu X",
        Ok(r#"{"orders": [{"product": "X", "quantity": "2"}]}"#),
    )
}

// ── Helpers ─────────────────────────────────────────────────────────

fn orchestrator(
    connector: FakeConnector,
    llm: Arc<StubLlm>,
    output_dir: &Path,
    max_parallel: usize,
) -> Orchestrator {
    Orchestrator::new(
        Arc::new(connector),
        Arc::new(OrderExtractor::new(llm)),
        RunSettings {
            folder: "INBOX".into(),
            output_dir: output_dir.to_path_buf(),
            max_parallel,
        },
    )
}

async fn run(orchestrator: &Orchestrator, mode: ListMode) -> RunOutcome {
    timeout(TEST_TIMEOUT, orchestrator.run(mode, &NoopObserver))
        .await
        .expect("run timed out")
}

fn csv_files(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "csv"))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Data rows of a CSV file, header dropped, sorted.
fn data_rows(path: &Path) -> Vec<String> {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.split("\r\n").filter(|l| !l.is_empty());
    assert_eq!(lines.next(), Some("Date,From,Subject,Product,Quantity"));
    let mut rows: Vec<String> = lines.map(str::to_string).collect();
    rows.sort();
    rows
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn single_order_produces_one_row() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(vec![message("1", "Zamówienie", ORDER_BODY, false)]);
    let state = Arc::clone(&connector.state);
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 4);

    let outcome = run(&orch, ListMode::All).await;

    let RunOutcome::Succeeded { path, rows, messages } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(rows, 1);
    assert_eq!(messages, 1);
    let name = path.file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("orders_") && name.ends_with(".csv"), "{name}");
    assert_eq!(
        data_rows(&path),
        vec!["\"Mon, 3 Jun 2024 10:15:00 +0200\",Jan Kowalski <jan@example.pl>,Zamówienie,X,2"]
    );
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_folder_fails_without_file() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(Vec::new());
    let state = Arc::clone(&connector.state);
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 4);

    let outcome = run(&orch, ListMode::All).await;

    assert_eq!(
        outcome,
        RunOutcome::Failed {
            reason: "Brak maili do przetworzenia.".into()
        }
    );
    assert!(csv_files(tmp.path()).is_empty());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn no_orders_anywhere_removes_file() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(vec![
        message("1", "Pytanie", "Kiedy otwieracie sklep?", false),
        message("2", "Dzień dobry", "Pozdrawiam serdecznie", false),
    ]);
    let llm = Arc::new(StubLlm::new(vec![("sklep", Ok(r#"{"orders": []}"#))]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 2);

    let outcome = run(&orch, ListMode::All).await;

    assert_eq!(
        outcome,
        RunOutcome::Failed {
            reason: "Brak danych zamówień do zapisania.".into()
        }
    );
    assert!(csv_files(tmp.path()).is_empty());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn refused_login_fails_before_anything_else() {
    let tmp = tempfile::tempdir().unwrap();
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(FakeConnector::refusing(), Arc::clone(&llm), tmp.path(), 4);

    let outcome = run(&orch, ListMode::All).await;

    assert_eq!(
        outcome,
        RunOutcome::Failed {
            reason: "Nie udało się połączyć z serwerem IMAP.".into()
        }
    );
    assert_eq!(
        outcome.message(),
        "Coś poszło nie tak: Nie udało się połączyć z serwerem IMAP."
    );
    assert!(csv_files(tmp.path()).is_empty());
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bad_replies_only_cost_their_own_message() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(vec![
        message("1", "Zamówienie", ORDER_BODY, false),
        message("2", "Dziwne", "Odpowiedź nie będzie JSON-em", false),
        message("3", "Awaria", "Tu model zwróci błąd", false),
    ]);
    let llm = Arc::new(StubLlm::new(vec![
        order_reply(),
        ("JSON-em", Ok("Przykro mi, nie rozumiem.")),
        ("model zwróci", Err(())),
    ]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 3);

    let outcome = run(&orch, ListMode::All).await;

    let RunOutcome::Succeeded { path, rows, messages } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(rows, 1);
    assert_eq!(messages, 3);
    assert_eq!(data_rows(&path).len(), 1);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn empty_bodies_are_not_sent_to_the_model() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(vec![
        message("1", "Zamówienie", ORDER_BODY, false),
        message("2", "Pusty", "", false),
    ]);
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 2);

    let outcome = run(&orch, ListMode::All).await;

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unread_mode_skips_seen_messages() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(vec![
        message("1", "Stare", ORDER_BODY, true),
        message("2", "Nowe", ORDER_BODY, false),
    ]);
    let state = Arc::clone(&connector.state);
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 2);

    let outcome = run(&orch, ListMode::UnreadOnly).await;

    let RunOutcome::Succeeded { path, rows, .. } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(rows, 1);
    assert!(data_rows(&path)[0].contains(",Nowe,X,2"));
    assert_eq!(state.fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_full_runs_produce_the_same_rows() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(vec![
        message("1", "Zamówienie A", ORDER_BODY, false),
        message("2", "Zamówienie B", ORDER_BODY, true),
        message("3", "Inne", "Bez zamówienia", false),
    ]);
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 2);

    let RunOutcome::Succeeded { path: first, .. } = run(&orch, ListMode::All).await else {
        panic!("first run failed");
    };
    let first_rows = data_rows(&first);

    let RunOutcome::Succeeded { path: second, .. } = run(&orch, ListMode::All).await else {
        panic!("second run failed");
    };
    let second_rows = data_rows(&second);

    assert_eq!(first_rows.len(), 2);
    assert_eq!(first_rows, second_rows);
}

#[tokio::test]
async fn every_message_is_processed_with_one_worker() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(
        (1..=6)
            .map(|i| message(&i.to_string(), &format!("Zamówienie {i}"), ORDER_BODY, false))
            .collect(),
    );
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 1);

    let RunOutcome::Succeeded { path, rows, messages } = run(&orch, ListMode::All).await else {
        panic!("run failed");
    };
    assert_eq!(rows, 6);
    assert_eq!(messages, 6);
    assert_eq!(data_rows(&path).len(), 6);
}

#[tokio::test]
async fn observer_sees_phases_in_order() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::new(vec![message("1", "Zamówienie", ORDER_BODY, false)]);
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, llm, tmp.path(), 1);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = timeout(TEST_TIMEOUT, orch.run(ListMode::All, &tx))
        .await
        .expect("run timed out");
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            RunEvent::StateChanged(RunState::Connecting),
            RunEvent::StateChanged(RunState::Connected),
            RunEvent::StateChanged(RunState::Listing),
            RunEvent::StateChanged(RunState::Dispatching),
            RunEvent::Progress { done: 1, total: 1 },
            RunEvent::StateChanged(RunState::Finalizing),
            RunEvent::StateChanged(RunState::Succeeded),
            RunEvent::Finished(outcome),
        ]
    );
}

#[tokio::test]
async fn observer_sees_failure_after_refused_login() {
    let tmp = tempfile::tempdir().unwrap();
    let llm = Arc::new(StubLlm::new(Vec::new()));
    let orch = orchestrator(FakeConnector::refusing(), llm, tmp.path(), 1);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = timeout(TEST_TIMEOUT, orch.run(ListMode::All, &tx))
        .await
        .expect("run timed out");
    drop(tx);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            RunEvent::StateChanged(RunState::Connecting),
            RunEvent::StateChanged(RunState::Failed),
            RunEvent::Finished(outcome),
        ]
    );
}

#[tokio::test]
async fn unfetchable_and_unparseable_messages_are_skipped() {
    let tmp = tempfile::tempdir().unwrap();
    let connector = FakeConnector::with_broken_fetch(
        vec![
            message("1", "Zamówienie", ORDER_BODY, false),
            message("2", "Niedostępny", ORDER_BODY, false),
            raw_message("3", ""),
        ],
        &["2"],
    );
    let state = Arc::clone(&connector.state);
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 2);

    let outcome = run(&orch, ListMode::All).await;

    let RunOutcome::Succeeded { path, rows, messages } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(messages, 1);
    assert_eq!(rows, 1);
    assert_eq!(data_rows(&path).len(), 1);
    assert_eq!(state.fetches.load(Ordering::SeqCst), 3);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unwritable_output_dir_fails_and_logs_out() {
    let tmp = tempfile::tempdir().unwrap();
    let blocker = tmp.path().join("not-a-dir");
    std::fs::write(&blocker, b"occupied").unwrap();

    let connector = FakeConnector::new(vec![message("1", "Zamówienie", ORDER_BODY, false)]);
    let state = Arc::clone(&connector.state);
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, Arc::clone(&llm), &blocker.join("CSV_files"), 2);

    let outcome = run(&orch, ListMode::All).await;

    assert!(!outcome.is_success(), "{outcome:?}");
    assert_eq!(state.logouts.load(Ordering::SeqCst), 1);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
    assert!(csv_files(tmp.path()).is_empty());
}

#[tokio::test]
async fn attachment_content_never_reaches_the_model() {
    let tmp = tempfile::tempdir().unwrap();
    let raw = "From: Jan Kowalski <jan@example.pl>\r\n\
               Date: Mon, 3 Jun 2024 10:15:00 +0200\r\n\
               Subject: Zamówienie z załącznikiem\r\n\
               MIME-Version: 1.0\r\n\
               Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
               \r\n\
               --XYZ\r\n\
               Content-Type: text/plain; charset=utf-8\r\n\
               \r\n\
               Proszę o 2 sztuki produktu X\r\n\
               --XYZ\r\n\
               Content-Type: text/plain; name=\"cennik.txt\"\r\n\
               Content-Disposition: attachment; filename=\"cennik.txt\"\r\n\
               \r\n\
               Cennik: 100 sztuk produktu Z\r\n\
               --XYZ--\r\n";
    let connector = FakeConnector::new(vec![raw_message("1", raw)]);
    let llm = Arc::new(StubLlm::new(vec![order_reply()]));
    let orch = orchestrator(connector, Arc::clone(&llm), tmp.path(), 1);

    let outcome = run(&orch, ListMode::All).await;

    let RunOutcome::Succeeded { path, rows, .. } = outcome else {
        panic!("expected success, got {outcome:?}");
    };
    assert_eq!(rows, 1);
    assert!(data_rows(&path)[0].ends_with(",Zamówienie z załącznikiem,X,2"));

    let prompts = llm.prompts.lock().unwrap();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].ends_with("\n\nProszę o 2 sztuki produktu X"));
    assert!(!prompts[0].contains("Cennik"));
}
