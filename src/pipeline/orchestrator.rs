//! Run orchestrator: owns one run from connect to outcome.
//!
//! Flow:
//! 1. Connect (blocking, off the async runtime)
//! 2. List, fetch and parse every target message on the same thread
//! 3. Create the output file, then dispatch one extraction unit per message
//!    to a bounded task group and wait for all of them
//! 4. Log out, check the file has data rows, report
//!
//! Only a failed connection, an empty listing or an empty result fail the
//! run. A bad message is logged and skipped.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{MailboxError, RunError};
use crate::extractor::OrderExtractor;
use crate::llm::LlmProvider;
use crate::mailbox::{ImapConnector, ListMode, MailboxConnector, MailboxSession};
use crate::parser::{self, ParsedEmail};
use crate::pipeline::state::{RunObserver, RunOutcome, RunState, StateMachine};
use crate::sink::CsvSink;

/// Per-run settings.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub folder: String,
    pub output_dir: PathBuf,
    /// Bound on concurrently running extraction units.
    pub max_parallel: usize,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            folder: config.mail.folder.clone(),
            output_dir: config.output.dir.clone(),
            max_parallel: config.max_parallel,
        }
    }
}

/// Drives runs. Holds no per-run state, so one instance serves many runs.
pub struct Orchestrator {
    connector: Arc<dyn MailboxConnector>,
    extractor: Arc<OrderExtractor>,
    settings: RunSettings,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn MailboxConnector>,
        extractor: Arc<OrderExtractor>,
        settings: RunSettings,
    ) -> Self {
        Self {
            connector,
            extractor,
            settings,
        }
    }

    /// Wire the IMAP connector and an extractor over `llm` from `config`.
    pub fn from_config(config: &AppConfig, llm: Arc<dyn LlmProvider>) -> Self {
        Self::new(
            Arc::new(ImapConnector::new(config.mail.clone())),
            Arc::new(OrderExtractor::new(llm)),
            RunSettings::from_config(config),
        )
    }

    /// Execute one run and report its outcome.
    ///
    /// Never returns an error: every failure becomes `RunOutcome::Failed`,
    /// is logged, and leaves no output file behind.
    pub async fn run(&self, mode: ListMode, observer: &dyn RunObserver) -> RunOutcome {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", %run_id, mode = mode.search_criterion());

        async {
            let mut machine = StateMachine::new(observer);
            let mut sink: Option<CsvSink> = None;

            let outcome = match self.execute(mode, &mut machine, &mut sink).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(state = %machine.state(), error = %e, "Run failed");
                    if let Some(sink) = sink.take()
                        && let Err(remove_err) = sink.remove().await
                    {
                        error!(error = %remove_err, "Failed to remove partial output file");
                    }
                    RunOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };

            if let RunOutcome::Succeeded { path, rows, messages } = &outcome {
                info!(path = %path.display(), rows, messages, "Run succeeded");
            }
            machine.finish(&outcome);
            outcome
        }
        .instrument(span)
        .await
    }

    async fn execute(
        &self,
        mode: ListMode,
        machine: &mut StateMachine<'_>,
        sink_slot: &mut Option<CsvSink>,
    ) -> Result<RunOutcome, RunError> {
        // Connecting
        machine.advance(RunState::Connecting)?;
        let connector = Arc::clone(&self.connector);
        let session = tokio::task::spawn_blocking(move || connector.connect())
            .await
            .map_err(|e| RunError::Internal(format!("connect task failed: {e}")))?
            .map_err(|e| {
                error!(error = %e, "Could not connect to mailbox");
                RunError::Connection(e)
            })?;
        machine.advance(RunState::Connected)?;

        // Listing
        machine.advance(RunState::Listing)?;
        let folder = self.settings.folder.clone();
        let (session, emails) =
            tokio::task::spawn_blocking(move || collect_messages(session, &folder, mode))
                .await
                .map_err(|e| RunError::Internal(format!("listing task failed: {e}")))?;

        if emails.is_empty() {
            logout(session).await;
            return Err(RunError::NoMessages);
        }
        info!(count = emails.len(), "Messages ready for extraction");

        let sink = match CsvSink::create(&self.settings.output_dir, Local::now()).await {
            Ok(sink) => sink,
            Err(e) => {
                logout(session).await;
                return Err(e.into());
            }
        };
        *sink_slot = Some(sink.clone());

        // Dispatching
        machine.advance(RunState::Dispatching)?;
        let messages = emails.len();
        let rows_written = self.dispatch(emails, &sink, machine).await;
        debug!(rows_written, "All extraction units finished");

        // Finalizing
        machine.advance(RunState::Finalizing)?;
        logout(session).await;

        let rows = sink.count_data_rows().await?;
        if rows == 0 {
            return Err(RunError::NoOrders);
        }
        if rows != rows_written {
            warn!(rows, rows_written, "Row count in file differs from rows reported by units");
        }

        *sink_slot = None;
        Ok(RunOutcome::Succeeded {
            path: sink.path().to_path_buf(),
            rows,
            messages,
        })
    }

    /// Run one extraction unit per email, at most `max_parallel` at a time.
    /// Returns the number of rows the units appended.
    async fn dispatch(
        &self,
        emails: Vec<ParsedEmail>,
        sink: &CsvSink,
        machine: &StateMachine<'_>,
    ) -> usize {
        let total = emails.len();
        let permits = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let mut units = JoinSet::new();

        for email in emails {
            let permits = Arc::clone(&permits);
            let extractor = Arc::clone(&self.extractor);
            let sink = sink.clone();
            units.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return 0;
                    };
                    process_email(&extractor, &sink, &email).await
                }
                .in_current_span(),
            );
        }

        let mut rows = 0;
        let mut done = 0;
        while let Some(result) = units.join_next().await {
            done += 1;
            match result {
                Ok(n) => rows += n,
                Err(e) => error!(error = %e, "Extraction unit panicked"),
            }
            machine.progress(done, total);
        }
        rows
    }
}

/// Extraction unit: model call, then append. Returns rows written.
async fn process_email(extractor: &OrderExtractor, sink: &CsvSink, email: &ParsedEmail) -> usize {
    if email.body.is_empty() {
        debug!(subject = %email.subject, "Skipping message with empty body");
        return 0;
    }
    let orders = extractor.extract(&email.body).await;
    if orders.is_empty() {
        return 0;
    }
    sink.append_rows(email, &orders).await
}

/// List, fetch and parse on the session's thread. Failures are logged; a
/// failed listing yields no messages, a failed fetch or parse drops that
/// message only.
fn collect_messages(
    mut session: Box<dyn MailboxSession>,
    folder: &str,
    mode: ListMode,
) -> (Box<dyn MailboxSession>, Vec<ParsedEmail>) {
    let ids = match session.list_messages(folder, mode) {
        Ok(ids) => ids,
        Err(e) => {
            error!(folder, error = %e, "Failed to list messages");
            return (session, Vec::new());
        }
    };

    let mut emails = Vec::with_capacity(ids.len());
    for id in &ids {
        match session.fetch_raw(id) {
            Ok(raw) => {
                if let Some(parsed) = parser::parse(&raw) {
                    emails.push(parsed);
                }
            }
            Err(e) => error!(%id, error = %e, "Failed to fetch message"),
        }
    }

    debug!(listed = ids.len(), parsed = emails.len(), "Collected messages");
    (session, emails)
}

/// Close the session, logging (not propagating) failures.
async fn logout(session: Box<dyn MailboxSession>) {
    let result = tokio::task::spawn_blocking(move || session.logout())
        .await
        .unwrap_or_else(|e| Err(MailboxError::Protocol(format!("logout task failed: {e}"))));
    if let Err(e) = result {
        error!(error = %e, "Mailbox logout failed");
    }
}
