use super::{Ledger, LedgerEntry, LedgerError};
use crate::{
    job::{Job, JobState},
    report::{unix_seconds, HOSTNAME},
};
use parking_lot::FairMutex;
use rusqlite::{params, Connection};
use std::{path::Path, sync::Arc, time::SystemTime};
use tracing::{error, info};

pub const SQL_SCHEMA: [&str; 2] = [
    "create table if not exists stage_runs (
    id integer primary key autoincrement,
    host text not null,
    job text not null,
    work_dir text not null,
    step text not null,
    state integer not null,
    attempt integer not null,
    exit_code integer,
    elapsed_ms integer not null,
    finished_at integer not null
);",
    "create index if not exists stage_runs_job on stage_runs (work_dir, job);",
];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over a SQLite connection, shared by all groups
pub struct SqliteLedger(Arc<FairMutex<Connection>>);

impl SqliteLedger {
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        Self::init(Connection::open(path)?)
    }

    #[cfg(test)]
    pub fn in_memory() -> Result<Self, LedgerError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(connection: Connection) -> Result<Self, LedgerError> {
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            match connection.execute(table, []) {
                Ok(_) => info!(
                    "Applied ledger schema ({}/{SQL_SCHEMA_NUMBER})",
                    counter + 1
                ),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply ledger schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                    return Err(LedgerError::SQLite(error));
                }
            }
        }

        Ok(Self(Arc::new(FairMutex::new(connection))))
    }
}

impl Ledger for SqliteLedger {
    fn record(&self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let connection = self.0.lock();

        connection
            .prepare_cached(
                "insert into stage_runs (host, job, work_dir, step, state, attempt, exit_code, elapsed_ms, finished_at)
                values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?
            .execute(params![
                HOSTNAME.as_str(),
                entry.job.name,
                entry.job.work_dir.to_string_lossy().into_owned(),
                entry.step,
                entry.state as i8,
                entry.job.attempt,
                entry.exit_code,
                entry.elapsed.as_millis() as i64,
                unix_seconds(SystemTime::now()) as i64,
            ])?;

        Ok(())
    }

    fn latest(&self, job: &Job) -> Result<Option<(String, JobState)>, LedgerError> {
        let connection = self.0.lock();
        let mut statement = connection.prepare_cached(
            "select step, state from stage_runs where work_dir = ? and job = ? order by id desc limit 1",
        )?;
        let mut rows = statement.query_map(
            params![job.work_dir.to_string_lossy().into_owned(), job.name],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i8>(1)?)),
        )?;

        let latest = match rows.next() {
            Some(row) => {
                let (step, state) = row?;
                JobState::try_from(state).ok().map(|state| (step, state))
            }
            None => None,
        };

        Ok(latest)
    }
}
