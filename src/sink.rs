//! Result sink: the per-run CSV file.
//!
//! The header is written once when the file is created. Each message's rows
//! are then written with one open-append-close sequence, as a single buffer,
//! so rows of concurrently finishing messages interleave per message and not
//! per byte on file systems with atomic small appends.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::error::SinkError;
use crate::extractor::OrderLine;
use crate::parser::ParsedEmail;

/// Column names, in output order.
pub const HEADER: [&str; 5] = ["Date", "From", "Subject", "Product", "Quantity"];

/// Record terminator.
const LINE_END: &str = "\r\n";

/// File name for a run started at `started_at`.
pub fn output_file_name(started_at: DateTime<Local>) -> String {
    format!("orders_{}.csv", started_at.format("%Y%m%d_%H%M%S"))
}

/// The CSV file of one run.
#[derive(Debug, Clone)]
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    /// Create `dir` if needed, then create the run file and write its header.
    pub async fn create(dir: &Path, started_at: DateTime<Local>) -> Result<Self, SinkError> {
        fs::create_dir_all(dir)
            .await
            .map_err(|source| SinkError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;

        let sink = Self {
            path: dir.join(output_file_name(started_at)),
        };
        sink.write_header().await?;
        Ok(sink)
    }

    /// Use an existing path without touching the file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create or truncate the file and write the header row.
    pub async fn write_header(&self) -> Result<(), SinkError> {
        let line = format_record(&HEADER);
        fs::write(&self.path, line.as_bytes())
            .await
            .map_err(|source| self.write_error(source))?;
        debug!(path = %self.path.display(), "Wrote CSV header");
        Ok(())
    }

    /// Append one row per order line. Errors are logged and yield 0 rows.
    pub async fn append_rows(&self, email: &ParsedEmail, orders: &[OrderLine]) -> usize {
        match self.try_append_rows(email, orders).await {
            Ok(n) => n,
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to append order rows");
                0
            }
        }
    }

    /// Append one row per order line, returning how many were written.
    pub async fn try_append_rows(
        &self,
        email: &ParsedEmail,
        orders: &[OrderLine],
    ) -> Result<usize, SinkError> {
        if orders.is_empty() {
            return Ok(0);
        }

        let mut buf = String::new();
        for order in orders {
            buf.push_str(&format_record(&[
                email.date.as_str(),
                email.from.as_str(),
                email.subject.as_str(),
                order.product.as_str(),
                order.quantity.as_str(),
            ]));
        }

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| self.write_error(source))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|source| self.write_error(source))?;
        file.flush().await.map_err(|source| self.write_error(source))?;

        Ok(orders.len())
    }

    /// Number of records after the header.
    pub async fn count_data_rows(&self) -> Result<usize, SinkError> {
        let text = fs::read_to_string(&self.path)
            .await
            .map_err(|source| SinkError::Read {
                path: self.path.clone(),
                source,
            })?;
        Ok(count_records(&text).saturating_sub(1))
    }

    /// Delete the file. A file that is already gone is not an error.
    pub async fn remove(&self) -> Result<(), SinkError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.write_error(source)),
        }
    }

    fn write_error(&self, source: std::io::Error) -> SinkError {
        SinkError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

// ── CSV encoding ────────────────────────────────────────────────────

/// One CSV record including its terminator.
fn format_record(fields: &[&str]) -> String {
    let mut line = fields
        .iter()
        .map(|f| csv_escape(f))
        .collect::<Vec<_>>()
        .join(",");
    line.push_str(LINE_END);
    line
}

/// Escape a value for CSV (RFC 4180).
///
/// Wraps in double quotes if the value contains commas, quotes, or newlines.
fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Count complete records: terminated by a line break outside quotes and
/// holding exactly one field per header column. A fragment left by a failed
/// append, or a line it merged into, is not counted.
fn count_records(text: &str) -> usize {
    let mut records = 0;
    let mut in_quotes = false;
    let mut fields = 1;
    let mut line_has_content = false;

    for ch in text.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                line_has_content = true;
            }
            ',' if !in_quotes => {
                fields += 1;
                line_has_content = true;
            }
            '\n' if !in_quotes => {
                if line_has_content && fields == HEADER.len() {
                    records += 1;
                }
                fields = 1;
                line_has_content = false;
            }
            '\r' if !in_quotes => {}
            _ => line_has_content = true,
        }
    }
    records
}
