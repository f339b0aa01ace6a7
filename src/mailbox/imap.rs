//! IMAP4rev1 over TLS: just enough of the protocol to log in, select a
//! folder, search it and fetch whole messages.
//!
//! Messages are fetched with `BODY.PEEK[]`, which leaves the `\Seen` flag
//! untouched, so scanning a mailbox never changes it.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use rustls_pki_types::ServerName;
use secrecy::ExposeSecret;
use tracing::{debug, error};

use crate::config::MailConfig;
use crate::error::MailboxError;
use crate::mailbox::{ListMode, MailboxConnector, MailboxSession, MessageId, RawMessage};

/// Socket read timeout.
const READ_TIMEOUT: Duration = Duration::from_secs(30);

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

// ── Connector ───────────────────────────────────────────────────────

/// Opens TLS-wrapped IMAP sessions using [`MailConfig`].
pub struct ImapConnector {
    config: MailConfig,
}

impl ImapConnector {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    fn connection_error(&self, reason: impl std::fmt::Display) -> MailboxError {
        MailboxError::Connection {
            host: self.config.host.clone(),
            reason: reason.to_string(),
        }
    }
}

impl MailboxConnector for ImapConnector {
    fn connect(&self) -> Result<Box<dyn MailboxSession>, MailboxError> {
        if self.config.host.trim().is_empty() {
            return Err(self.connection_error("IMAP_HOST is not set"));
        }

        let stream = open_tls(&self.config.host, self.config.port)
            .map_err(|e| self.connection_error(e))?;

        let mut session = ImapSession::new(stream);
        session
            .read_greeting()
            .and_then(|_| {
                session.login(&self.config.username, self.config.password.expose_secret())
            })
            .map_err(|e| self.connection_error(e))?;

        debug!(host = %self.config.host, user = %self.config.username, "IMAP login succeeded");
        Ok(Box::new(session))
    }
}

/// Connect TCP and wrap it in rustls with the webpki root set.
fn open_tls(host: &str, port: u16) -> Result<TlsStream, Box<dyn std::error::Error + Send + Sync>> {
    let tcp = TcpStream::connect((host, port))?;
    tcp.set_read_timeout(Some(READ_TIMEOUT))?;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    );
    let server_name = ServerName::try_from(host.to_string())?;
    let conn = rustls::ClientConnection::new(tls_config, server_name)?;
    Ok(rustls::StreamOwned::new(conn, tcp))
}

// ── Response model ──────────────────────────────────────────────────

/// Completion status of a tagged response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    No,
    Bad,
}

/// One logical response line. Literals (`{n}\r\n<n bytes>`) are lifted out
/// into `literals`; `text` keeps the line with the `{n}` markers.
#[derive(Debug, Default)]
struct ResponseLine {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Everything the server sent for one command.
#[derive(Debug)]
struct Response {
    untagged: Vec<ResponseLine>,
    status: Status,
    detail: String,
}

impl Response {
    fn ensure_ok(self, command: &str) -> Result<Self, MailboxError> {
        match self.status {
            Status::Ok => Ok(self),
            Status::No | Status::Bad => Err(MailboxError::Fetch(format!(
                "{command} rejected: {}",
                self.detail
            ))),
        }
    }
}

// ── Session ─────────────────────────────────────────────────────────

/// An IMAP session over any byte stream (TLS in production, scripted in tests).
pub struct ImapSession<S: Read + Write> {
    stream: BufReader<S>,
    next_tag: u32,
}

impl<S: Read + Write> ImapSession<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
            next_tag: 1,
        }
    }

    /// Consume the server greeting. `* BYE` means the server refused us.
    pub fn read_greeting(&mut self) -> Result<(), MailboxError> {
        let greeting = self.read_logical_line()?;
        if greeting.text.starts_with("* OK") || greeting.text.starts_with("* PREAUTH") {
            Ok(())
        } else {
            Err(MailboxError::Protocol(format!(
                "unexpected greeting: {}",
                greeting.text
            )))
        }
    }

    /// `LOGIN` with quoted credentials.
    pub fn login(&mut self, user: &str, password: &str) -> Result<(), MailboxError> {
        let response = self.command(&format!(
            "LOGIN {} {}",
            quote(user)?,
            quote(password)?
        ))?;
        if response.status != Status::Ok {
            return Err(MailboxError::Protocol(format!(
                "login failed: {}",
                response.detail
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    fn command(&mut self, command: &str) -> Result<Response, MailboxError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let writer = self.stream.get_mut();
        writer.write_all(format!("{tag} {command}\r\n").as_bytes())?;
        writer.flush()?;

        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let line = self.read_logical_line()?;
            if let Some(rest) = line.text.strip_prefix(&prefix) {
                let (status, detail) = parse_status(rest)?;
                return Ok(Response {
                    untagged,
                    status,
                    detail,
                });
            }
            untagged.push(line);
        }
    }

    fn read_raw_line(&mut self) -> Result<String, MailboxError> {
        let mut buf = Vec::new();
        let n = self.stream.read_until(b'\n', &mut buf)?;
        if n == 0 {
            return Err(MailboxError::Protocol("connection closed by server".into()));
        }
        let line = String::from_utf8_lossy(&buf);
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    fn read_logical_line(&mut self) -> Result<ResponseLine, MailboxError> {
        let mut line = ResponseLine::default();
        loop {
            let segment = self.read_raw_line()?;
            let literal = literal_len(&segment);
            line.text.push_str(&segment);
            match literal {
                Some(len) => {
                    let mut buf = vec![0u8; len];
                    self.stream.read_exact(&mut buf)?;
                    line.literals.push(buf);
                }
                None => return Ok(line),
            }
        }
    }
}

impl<S: Read + Write + Send> MailboxSession for ImapSession<S> {
    fn list_messages(
        &mut self,
        folder: &str,
        mode: ListMode,
    ) -> Result<Vec<MessageId>, MailboxError> {
        self.command(&format!("SELECT {}", quote(folder)?))?
            .ensure_ok("SELECT")?;

        let response = self
            .command(&format!("SEARCH {}", mode.search_criterion()))?
            .ensure_ok("SEARCH")?;

        let ids: Vec<MessageId> = response
            .untagged
            .iter()
            .filter_map(|line| line.text.strip_prefix("* SEARCH"))
            .flat_map(|rest| rest.split_whitespace())
            .map(MessageId::from)
            .collect();

        debug!(folder, mode = mode.search_criterion(), count = ids.len(), "Listed messages");
        Ok(ids)
    }

    fn fetch_raw(&mut self, id: &MessageId) -> Result<RawMessage, MailboxError> {
        let response = self
            .command(&format!("FETCH {id} BODY.PEEK[]"))?
            .ensure_ok("FETCH")?;

        let bytes = response
            .untagged
            .into_iter()
            .filter(|line| line.text.contains("FETCH"))
            .find_map(|line| line.literals.into_iter().next())
            .ok_or_else(|| MailboxError::Fetch(format!("no message body returned for {id}")))?;

        Ok(RawMessage {
            id: id.clone(),
            bytes,
        })
    }

    fn logout(mut self: Box<Self>) -> Result<(), MailboxError> {
        match self.command("LOGOUT") {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(error = %e, "IMAP logout failed");
                Err(e)
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Parse `OK [..] text` / `NO text` / `BAD text` after the tag.
fn parse_status(rest: &str) -> Result<(Status, String), MailboxError> {
    let (word, detail) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = match word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        "BAD" => Status::Bad,
        other => {
            return Err(MailboxError::Protocol(format!(
                "unknown completion status '{other}'"
            )));
        }
    };
    Ok((status, detail.to_string()))
}

/// Length of a trailing literal marker `{n}`, if the line ends with one.
fn literal_len(line: &str) -> Option<usize> {
    let body = line.strip_suffix('}')?;
    let start = body.rfind('{')?;
    body[start + 1..].trim_end_matches('+').parse().ok()
}

/// Render an IMAP quoted string.
fn quote(value: &str) -> Result<String, MailboxError> {
    if value.contains(['\r', '\n']) {
        return Err(MailboxError::Protocol(
            "line breaks are not allowed in IMAP quoted strings".into(),
        ));
    }
    Ok(format!(
        "\"{}\"",
        value.replace('\\', "\\\\").replace('"', "\\\"")
    ))
}
