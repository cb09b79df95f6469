mod local;
pub mod template;

pub use local::{LocalExecutor, LocalHandle};

use crate::{
    job::{Job, Stage},
    poller::Clock,
};
use std::{io, path::PathBuf, time::Duration};
use thiserror::Error;

/// Failures that happen before a stage runs at all
/// the outcome of a running stage is never reported through this type
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Job directory {0} does not exist")]
    MissingWorkDir(PathBuf),
    #[error("{stage} script {path} does not exist")]
    MissingScript { stage: Stage, path: PathBuf },
    #[error("Command template for the {0} stage is empty")]
    EmptyTemplate(Stage),
    #[error("Executable {0} was not found")]
    ExecutableNotFound(String),
    #[error("Failed to open stage log {path}: {source}")]
    StageLog {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A launched external process
pub trait StageHandle: Send {
    fn id(&self) -> Option<u32>;

    /// block for at most `interval`, returns the exit code once the process has exited
    /// after the exit was observed every further call just sleeps on `clock`
    fn wait_tick(&mut self, interval: Duration, clock: &dyn Clock) -> io::Result<Option<i32>>;
}

/// Starts the command of a stage for a job and returns without waiting for it
pub trait StageExecutor: Send + Sync {
    fn launch(&self, stage: Stage, job: &Job) -> Result<Box<dyn StageHandle>, LaunchError>;
}
