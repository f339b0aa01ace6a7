//! Terminal form: choose "all" or "unread only", start a run, watch status.
//!
//! The shell never touches pipeline state: it spawns a run and renders the
//! [`RunEvent`]s the orchestrator publishes over a channel.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::error::RunError;
use crate::llm::create_provider;
use crate::mailbox::ListMode;
use crate::pipeline::{Orchestrator, RunEvent, RunOutcome, RunState};

/// Form title.
const TITLE: &str = "Ekstrakcja zamówień z poczty";

/// One line of operator input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Select(ListMode),
    Start,
    Quit,
    Unknown,
}

/// Interpret one input line.
pub fn parse_command(line: &str) -> Command {
    match line.trim().to_lowercase().as_str() {
        "1" | "all" | "wszystkie" => Command::Select(ListMode::All),
        "2" | "unread" | "nieodczytane" => Command::Select(ListMode::UnreadOnly),
        "s" | "start" => Command::Start,
        "q" | "quit" | "exit" | "koniec" => Command::Quit,
        _ => Command::Unknown,
    }
}

/// The option list with the current selection marked.
pub fn render_form(mode: ListMode) -> String {
    let mark = |m: ListMode| if m == mode { "(•)" } else { "( )" };
    format!(
        "{TITLE}\n\
         Wybierz opcję przetwarzania wiadomości:\n  \
         {} [1] Wszystkie maile\n  \
         {} [2] Tylko nieodczytane maile\n\
         [s] Start   [q] Koniec",
        mark(ListMode::All),
        mark(ListMode::UnreadOnly),
    )
}

/// Status line for an event, if it has one.
pub fn render_event(event: &RunEvent) -> Option<String> {
    match event {
        RunEvent::StateChanged(RunState::Failed) => None,
        RunEvent::StateChanged(state) => state.status_text().map(str::to_string),
        RunEvent::Progress { done, total } => Some(format!("Przetworzono {done}/{total} maili")),
        RunEvent::Finished(RunOutcome::Failed { reason }) => {
            Some(format!("Coś poszło nie tak: {reason}"))
        }
        RunEvent::Finished(RunOutcome::Succeeded { .. }) => None,
    }
}

/// End-of-run notification box.
pub fn render_modal(title: &str, message: &str) -> String {
    let width = title.chars().count().max(message.chars().count()) + 2;
    let rule = "─".repeat(width);
    format!(
        "┌{rule}┐\n│ {title:<w$} │\n├{rule}┤\n│ {message:<w$} │\n└{rule}┘",
        w = width - 2
    )
}

/// A run that never started shows its reason alone.
fn blocked_modal(error: &RunError) -> String {
    render_modal("Błąd", &error.to_string())
}

fn outcome_modal(outcome: &RunOutcome) -> String {
    let title = if outcome.is_success() { "Sukces" } else { "Błąd" };
    render_modal(title, &outcome.message())
}

/// Interactive terminal form over one immutable configuration.
pub struct TerminalShell {
    config: Arc<AppConfig>,
}

impl TerminalShell {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    /// Read commands until quit or EOF.
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut mode = ListMode::All;
        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        println!("{}", render_form(mode));
        eprint!("> ");

        while let Some(line) = lines.next_line().await? {
            match parse_command(&line) {
                Command::Select(selected) => {
                    mode = selected;
                    println!("{}", render_form(mode));
                }
                Command::Start => {
                    self.start(mode).await;
                    println!("\n{}", render_form(mode));
                }
                Command::Quit => break,
                Command::Unknown if line.trim().is_empty() => {}
                Command::Unknown => eprintln!("Nieznana opcja: {}", line.trim()),
            }
            eprint!("> ");
        }
        Ok(())
    }

    /// Start one run and render its events until it finishes.
    pub async fn start(&self, mode: ListMode) -> RunOutcome {
        let orchestrator = match self.prepare() {
            Ok(orchestrator) => Arc::new(orchestrator),
            Err(e) => {
                tracing::error!(error = %e, "Run blocked before start");
                println!("{}", blocked_modal(&e));
                return RunOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move { orchestrator.run(mode, &tx).await });

        while let Some(event) = rx.recv().await {
            if let Some(status) = render_event(&event) {
                println!("{status}");
            }
        }

        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Run task panicked");
                RunOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        println!("{}", outcome_modal(&outcome));
        outcome
    }

    /// Check the AI settings and build the orchestrator.
    fn prepare(&self) -> Result<Orchestrator, RunError> {
        self.config.check_ready()?;
        let llm = create_provider(&self.config)?;
        Ok(Orchestrator::from_config(&self.config, llm))
    }
}
