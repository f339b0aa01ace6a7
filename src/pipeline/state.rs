//! Run state machine and the events it publishes.

use std::fmt;
use std::path::PathBuf;

use tokio::sync::mpsc;

use crate::error::RunError;

/// Phase of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Connecting,
    Connected,
    Listing,
    Dispatching,
    Finalizing,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Listing => "listing",
            Self::Dispatching => "dispatching",
            Self::Finalizing => "finalizing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    ///
    /// Every non-terminal state may fail; otherwise the run only moves forward
    /// one phase at a time.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        if next == Self::Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Self::Idle, Self::Connecting)
                | (Self::Connecting, Self::Connected)
                | (Self::Connected, Self::Listing)
                | (Self::Listing, Self::Dispatching)
                | (Self::Dispatching, Self::Finalizing)
                | (Self::Finalizing, Self::Succeeded)
        )
    }

    /// Operator-facing status line for this phase.
    ///
    /// `Failed` has no fixed text; the shell renders it from the outcome.
    pub fn status_text(&self) -> Option<&'static str> {
        match self {
            Self::Idle => None,
            Self::Connecting => Some("Łączenie z serwerem IMAP..."),
            Self::Connected | Self::Listing => {
                Some("Połączono z serwerem IMAP. Pobieranie maili...")
            }
            Self::Dispatching => Some("Przetwarzanie maili..."),
            Self::Finalizing => Some("Zamykanie połączenia i sprawdzanie wyników..."),
            Self::Succeeded => Some("Wszystko poszło w porządku. Plik CSV został wygenerowany."),
            Self::Failed => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Succeeded {
        path: PathBuf,
        /// Data rows in the output file.
        rows: usize,
        /// Messages that were parsed and dispatched.
        messages: usize,
    },
    Failed {
        reason: String,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Text for the end-of-run notification.
    pub fn message(&self) -> String {
        match self {
            Self::Succeeded { path, .. } => format!(
                "Wszystko poszło w porządku. Plik CSV został wygenerowany pod nazwą: {}",
                path.display()
            ),
            Self::Failed { reason } => format!("Coś poszło nie tak: {reason}"),
        }
    }
}

/// Notifications published while a run progresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    StateChanged(RunState),
    /// A dispatched unit finished.
    Progress { done: usize, total: usize },
    Finished(RunOutcome),
}

/// Receives run events. Implementations must not block.
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &RunEvent);
}

impl RunObserver for mpsc::UnboundedSender<RunEvent> {
    fn on_event(&self, event: &RunEvent) {
        // A closed receiver only means nobody is watching any more.
        let _ = self.send(event.clone());
    }
}

/// Observer that drops everything.
pub struct NoopObserver;

impl RunObserver for NoopObserver {
    fn on_event(&self, _event: &RunEvent) {}
}

/// Tracks the current state and publishes every change.
pub(crate) struct StateMachine<'a> {
    state: RunState,
    observer: &'a dyn RunObserver,
}

impl<'a> StateMachine<'a> {
    pub(crate) fn new(observer: &'a dyn RunObserver) -> Self {
        Self {
            state: RunState::Idle,
            observer,
        }
    }

    pub(crate) fn state(&self) -> RunState {
        self.state
    }

    pub(crate) fn advance(&mut self, next: RunState) -> Result<(), RunError> {
        if !self.state.can_transition_to(next) {
            return Err(RunError::Internal(format!(
                "illegal run transition {} -> {}",
                self.state, next
            )));
        }
        tracing::debug!(from = %self.state, to = %next, "Run state changed");
        self.state = next;
        self.observer.on_event(&RunEvent::StateChanged(next));
        Ok(())
    }

    pub(crate) fn progress(&self, done: usize, total: usize) {
        self.observer.on_event(&RunEvent::Progress { done, total });
    }

    /// Enter the terminal state matching `outcome` and publish it.
    pub(crate) fn finish(&mut self, outcome: &RunOutcome) {
        let terminal = if outcome.is_success() {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        if self.state != terminal {
            if self.state.can_transition_to(terminal) {
                self.state = terminal;
                self.observer.on_event(&RunEvent::StateChanged(terminal));
            } else {
                tracing::error!(from = %self.state, to = %terminal, "Illegal terminal transition");
            }
        }
        self.observer.on_event(&RunEvent::Finished(outcome.clone()));
    }
}
