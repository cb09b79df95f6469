#[cfg(feature = "rusqlite")]
mod sqlite;

#[cfg(feature = "rusqlite")]
pub use sqlite::SqliteLedger;

use crate::job::{Job, JobState};
use std::{path::Path, time::Duration};
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[cfg(feature = "rusqlite")]
    #[error("SQLite error: {0}")]
    SQLite(#[from] rusqlite::Error),
    #[error("simq was built without ledger support")]
    Unsupported,
}

/// One terminal outcome of a stage (or of a resume skip)
#[derive(Debug, Clone)]
pub struct LedgerEntry<'a> {
    pub job: &'a Job,
    // "prepare", "compute", "extract" or "resume"
    pub step: &'a str,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
}

/// Persistent history of a run, the result file stays the authoritative "done" signal
pub trait Ledger: Send + Sync {
    fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError>;

    /// most recent step and state recorded for `job`, if any
    fn latest(&self, job: &Job) -> Result<Option<(String, JobState)>, LedgerError>;
}

/// Default ledger that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullLedger;

impl Ledger for NullLedger {
    fn record(&self, _entry: &LedgerEntry) -> Result<(), LedgerError> {
        Ok(())
    }

    fn latest(&self, _job: &Job) -> Result<Option<(String, JobState)>, LedgerError> {
        Ok(None)
    }
}

/// open the configured ledger, falling back to `NullLedger` when none is configured
pub fn open(path: Option<&Path>) -> Result<Box<dyn Ledger>, LedgerError> {
    match path {
        None => Ok(Box::new(NullLedger)),
        #[cfg(feature = "rusqlite")]
        Some(path) => Ok(Box::new(SqliteLedger::open(path)?)),
        #[cfg(not(feature = "rusqlite"))]
        Some(path) => {
            error!(path = ?path, "A ledger was configured but simq was built without the `ledger` feature");

            Err(LedgerError::Unsupported)
        }
    }
}

/// record an entry, a broken ledger must never fail a job
pub fn record_or_log(ledger: &dyn Ledger, entry: &LedgerEntry) {
    if let Err(error) = ledger.record(entry) {
        error!(job = %entry.job.name, step = entry.step, error = ?error, "Failed to write ledger entry");
    }
}
