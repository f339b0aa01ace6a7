//! Message parser: turns raw RFC 5322 bytes into a [`ParsedEmail`].
//!
//! MIME decoding (transfer encodings, charsets, RFC 2047 subjects) is left to
//! `mail-parser`, which replaces undecodable bytes instead of failing.

use mail_parser::{MessageParser, MimeHeaders, PartType};
use tracing::{debug, error};

use crate::error::ParseError;
use crate::mailbox::RawMessage;

/// Note added when at least one part is an attachment.
pub const ATTACHMENT_NOTE: &str = "Mail zawiera załączniki.";

/// Note added when at least one part is an image.
pub const IMAGE_NOTE: &str = "Mail zawiera obrazy lub inne niesparsowane elementy.";

/// A decoded email, reduced to what the order pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEmail {
    pub subject: String,
    pub from: String,
    /// `Date` header exactly as the sender wrote it.
    pub date: String,
    /// Concatenated plain-text parts.
    pub body: String,
    /// Empty, or a description of content that was not text-extracted.
    pub note: String,
}

/// Parse a raw message, logging and dropping it on failure.
pub fn parse(raw: &RawMessage) -> Option<ParsedEmail> {
    match try_parse(raw) {
        Ok(parsed) => {
            debug!(id = %raw.id, subject = %parsed.subject, "Parsed message");
            Some(parsed)
        }
        Err(e) => {
            error!(id = %raw.id, error = %e, "Failed to parse message");
            None
        }
    }
}

/// Parse a raw message.
pub fn try_parse(raw: &RawMessage) -> Result<ParsedEmail, ParseError> {
    let message = MessageParser::default()
        .parse(&raw.bytes)
        .ok_or_else(|| ParseError::Malformed {
            id: raw.id.to_string(),
        })?;

    let headers = raw_headers(&raw.bytes);

    let subject = match (message.subject(), get_header(&headers, "subject")) {
        (Some(subject), _) => subject.to_string(),
        (None, Some(raw_subject)) if !raw_subject.trim().is_empty() => {
            return Err(ParseError::Subject {
                id: raw.id.to_string(),
            });
        }
        _ => String::new(),
    };

    let from = message
        .from()
        .and_then(|addr| addr.first())
        .map(|a| match (a.name(), a.address()) {
            (Some(name), Some(address)) => format!("{name} <{address}>"),
            (None, Some(address)) => address.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        })
        .filter(|s| !s.is_empty())
        .or_else(|| get_header(&headers, "from"))
        .unwrap_or_default();

    let date = get_header(&headers, "date").unwrap_or_default();

    let content = extract_content(&message);

    Ok(ParsedEmail {
        subject,
        from,
        date,
        body: content.body.trim().to_string(),
        note: build_note(content.has_attachment, content.has_image),
    })
}

/// Body text plus flags for content that was skipped.
#[derive(Debug, Default)]
struct ExtractedContent {
    body: String,
    has_attachment: bool,
    has_image: bool,
}

/// Walk the MIME tree.
///
/// - multipart: concatenate every non-attachment `text/plain` part; any
///   `attachment` disposition sets the attachment flag, any `image/*` type
///   sets the image flag
/// - single part: the decoded payload is the body as-is
fn extract_content(message: &mail_parser::Message<'_>) -> ExtractedContent {
    let mut content = ExtractedContent::default();

    let Some(root) = message.parts.first() else {
        return content;
    };

    if !matches!(root.body, PartType::Multipart(_)) {
        content.body = part_text(root);
        return content;
    }

    for part in &message.parts {
        if matches!(part.body, PartType::Multipart(_)) {
            continue;
        }

        let (ctype, subtype) = match part.content_type() {
            Some(ct) => (
                ct.ctype().to_ascii_lowercase(),
                ct.subtype().unwrap_or("").to_ascii_lowercase(),
            ),
            // RFC 2045 default
            None => ("text".to_string(), "plain".to_string()),
        };

        let is_attachment = part
            .content_disposition()
            .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"));

        if is_attachment {
            content.has_attachment = true;
        } else if ctype == "text" && subtype == "plain" {
            content.body.push_str(&part_text(part));
        }

        if ctype == "image" {
            content.has_image = true;
        }
    }

    content
}

/// Decoded text of one part; binary payloads are read as lossy UTF-8.
fn part_text(part: &mail_parser::MessagePart<'_>) -> String {
    match part.text_contents() {
        Some(text) => text.to_string(),
        None => String::from_utf8_lossy(part.contents()).into_owned(),
    }
}

/// Attachment note first, then image note; empty when neither flag is set.
pub fn build_note(has_attachment: bool, has_image: bool) -> String {
    let mut note = String::new();
    if has_attachment {
        note.push_str(ATTACHMENT_NOTE);
    }
    if has_image {
        note.push_str(IMAGE_NOTE);
    }
    note
}

// ── Raw header access ───────────────────────────────────────────────

/// Unfolded `(lowercase_name, value)` pairs of the top-level header block.
fn raw_headers(bytes: &[u8]) -> Vec<(String, String)> {
    let end = find_header_end(bytes).unwrap_or(bytes.len());
    let text = String::from_utf8_lossy(&bytes[..end]);

    let mut headers: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_lowercase(), value.trim().to_string()));
        }
    }
    headers
}

fn get_header(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

/// Byte offset of the blank line ending the header block.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(2)
        .position(|w| w == b"\n\n")
        .into_iter()
        .chain(data.windows(4).position(|w| w == b"\r\n\r\n"))
        .min()
}
