//! Runtime — drives one provisioning run: probe, plan, execute, report.
//!
//! Also owns the run state machine, the cooperative cancel checkpoint and
//! the JSON-lines action journal.

pub mod journal;
pub mod reconciler;
pub mod types;

pub use journal::{JournalRecord, RunJournal};
pub use reconciler::Reconciler;
pub use types::*;
