//! Mail Orders: pull order lines out of an IMAP mailbox into CSV.

pub mod config;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod mailbox;
pub mod parser;
pub mod pipeline;
pub mod shell;
pub mod sink;
