//! Order pipeline.
//!
//! Every run flows one way:
//! 1. `mailbox`: connect, list, fetch raw messages
//! 2. `parser`: decode into `ParsedEmail`
//! 3. `extractor`: LLM turns each body into order lines (concurrently)
//! 4. `sink`: rows appended to the run's CSV file
//!
//! The shell only observes; it never reaches into a running pipeline.

pub mod orchestrator;
pub mod state;

pub use orchestrator::{Orchestrator, RunSettings};
pub use state::{NoopObserver, RunEvent, RunObserver, RunOutcome, RunState};
