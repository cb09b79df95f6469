use crate::job::{Job, JobState, Stage};
use itertools::Itertools;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{error, info};

pub static HOSTNAME: Lazy<String> = Lazy::new(|| {
    nix::unistd::gethostname()
        .map(|hostname| hostname.to_string_lossy().into_owned())
        .unwrap_or_else(|_| String::from("unknown"))
});

pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

/// Outcome of one group, job names bucketed by terminal state
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupReport {
    pub group: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
    pub cancelled: Vec<String>,
    // where the failure logs of this group went
    pub log_dir: PathBuf,
}

impl GroupReport {
    pub fn new(group: &str, log_dir: &Path) -> Self {
        Self {
            group: group.to_owned(),
            log_dir: log_dir.to_path_buf(),
            ..Default::default()
        }
    }

    /// file a job under its state, non terminal jobs count as cancelled
    pub fn record(&mut self, job: &Job) {
        let name = job.name.clone();

        match job.state {
            JobState::Succeeded => self.succeeded.push(name),
            JobState::Failed => self.failed.push(name),
            JobState::TimedOut => self.timed_out.push(name),
            JobState::Cancelled | JobState::Pending | JobState::Launched | JobState::Running => {
                self.cancelled.push(name)
            }
        }
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len() + self.timed_out.len() + self.cancelled.len()
    }
}

/// Aggregated outcome of one orchestrator run
#[derive(Serialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub host: String,
    pub groups: Vec<GroupReport>,
}

impl Report {
    pub fn new(groups: Vec<GroupReport>) -> Self {
        Self {
            host: HOSTNAME.clone(),
            groups,
        }
    }

    pub fn succeeded(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flat_map(|group| group.succeeded.iter().map(String::as_str))
            .collect_vec()
    }

    pub fn failed(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flat_map(|group| group.failed.iter().map(String::as_str))
            .collect_vec()
    }

    pub fn timed_out(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flat_map(|group| group.timed_out.iter().map(String::as_str))
            .collect_vec()
    }

    pub fn cancelled(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flat_map(|group| group.cancelled.iter().map(String::as_str))
            .collect_vec()
    }

    pub fn log_summary(&self) {
        for group in self.groups.iter() {
            info!(
                group = %group.group,
                succeeded = group.succeeded.len(),
                failed = group.failed.len(),
                timed_out = group.timed_out.len(),
                cancelled = group.cancelled.len(),
                logs = ?group.log_dir,
                "Group finished"
            );
        }
    }

    pub fn write_yaml(&self, path: &Path) -> io::Result<()> {
        let content = serde_yaml::to_string(self)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;

        fs::write(path, content)
    }
}

/// Append-only per stage failure logs shared by all groups of a run
#[derive(Debug)]
pub struct FailureLog {
    dir: PathBuf,
    // serializes appends from concurrent groups
    lock: Mutex<()>,
}

impl FailureLog {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, stage: Stage) -> PathBuf {
        self.dir.join(stage.failure_log())
    }

    /// one tab separated line: time, job, state, attempt, job directory, detail
    pub fn append(&self, stage: Stage, job: &Job, state: JobState, detail: &str) {
        let path = self.path(stage);
        let line = format!(
            "{}\t{}\t{}\t{}\t{}\t{}\n",
            unix_seconds(SystemTime::now()),
            job.name,
            state,
            job.attempt,
            job.work_dir.to_string_lossy(),
            detail
        );

        let _guard = self.lock.lock();
        let result = fs::create_dir_all(&self.dir).and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| file.write_all(line.as_bytes()))
        });

        if let Err(error) = result {
            error!(path = ?path, error = ?error, job = %job.name, "Failed to append to failure log");
        }
    }
}
