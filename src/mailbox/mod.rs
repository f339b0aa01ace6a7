//! Mailbox client abstraction.
//!
//! All mailbox I/O is blocking and happens on one thread before any
//! per-message work is dispatched, so these traits are synchronous. The
//! orchestrator runs them inside `spawn_blocking`.

pub mod imap;

pub use imap::{ImapConnector, ImapSession};

use std::fmt;

use crate::error::MailboxError;

/// Server-assigned message sequence number, kept as the server sent it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Raw RFC 5322 bytes of one message. Consumed by the parser and dropped.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub id: MessageId,
    pub bytes: Vec<u8>,
}

/// Which messages of a folder to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMode {
    #[default]
    All,
    UnreadOnly,
}

impl ListMode {
    pub fn from_unread_only(unread_only: bool) -> Self {
        if unread_only {
            Self::UnreadOnly
        } else {
            Self::All
        }
    }

    /// IMAP SEARCH criterion for this mode.
    pub fn search_criterion(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::UnreadOnly => "UNSEEN",
        }
    }
}

/// Opens authenticated mailbox sessions. One session per run.
pub trait MailboxConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError>;
}

/// An authenticated session, owned by exactly one run.
pub trait MailboxSession: Send {
    /// Select `folder` and list the ids matching `mode`, in server order.
    fn list_messages(
        &mut self,
        folder: &str,
        mode: ListMode,
    ) -> Result<Vec<MessageId>, MailboxError>;

    /// Fetch the full raw form of one message.
    fn fetch_raw(&mut self, id: &MessageId) -> Result<RawMessage, MailboxError>;

    /// Close the session. The session is unusable afterwards.
    fn logout(self: Box<Self>) -> Result<(), MailboxError>;
}
