//! Error types for mail-orders.
//!
//! Only `RunError` ever reaches the operator. Everything else is logged where
//! it happens and degraded to "skip" or "empty" by the component that caught it.

use std::path::PathBuf;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A setting a run cannot start without. Shown to the operator as is.
    #[error("{0} nie jest określony.")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Mailbox (IMAP) errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    /// Authentication, network or TLS failure while opening the session.
    #[error("Could not connect to {host}: {reason}")]
    Connection { host: String, reason: String },

    /// Failure while selecting, searching or fetching.
    #[error("Fetch failed: {0}")]
    Fetch(String),

    /// The server answered with something we could not interpret.
    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-message parse failures. Always degrade to "drop this message".
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("Message {id} is not a parseable RFC 5322 message")]
    Malformed { id: String },

    #[error("Subject of message {id} could not be decoded")]
    Subject { id: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Order extraction failures. Always degrade to "zero orders".
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("Completion request failed: {0}")]
    Llm(#[from] LlmError),

    /// The reply was not JSON, or not an object carrying `orders`.
    #[error("Malformed model response: {reason}")]
    MalformedResponse { reason: String },
}

/// Output file errors.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Run-level failures surfaced to the operator.
///
/// `Display` renders the operator-facing reason string.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Nie udało się połączyć z serwerem IMAP.")]
    Connection(#[source] MailboxError),

    #[error("Brak maili do przetworzenia.")]
    NoMessages,

    #[error("Brak danych zamówień do zapisania.")]
    NoOrders,

    #[error("{0}")]
    Sink(#[from] SinkError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The model client could not be built.
    #[error("{0}")]
    Llm(#[from] LlmError),

    #[error("{0}")]
    Internal(String),
}
