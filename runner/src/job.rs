use crate::config::Naming;
use std::{
    fmt,
    path::{Path, PathBuf},
    time::SystemTime,
};

/// One of the three pipeline steps applied to a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Prepare,
    Compute,
    Extract,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Compute => "compute",
            Self::Extract => "extract",
        }
    }

    /// name of the append-only failure log for this stage
    pub fn failure_log(&self) -> &'static str {
        match self {
            Self::Prepare => "failed_prepare.log",
            Self::Compute => "failed_compute.log",
            Self::Extract => "failed_extract.log",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a job (and of each stage the poller drives)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum JobState {
    Pending = 0,
    Launched = 1,
    Running = 2,
    Succeeded = 3,
    Failed = -1,
    TimedOut = -2,
    Cancelled = -3,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Launched => "launched",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl TryFrom<i8> for JobState {
    type Error = i8;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Launched),
            2 => Ok(Self::Running),
            3 => Ok(Self::Succeeded),
            -1 => Ok(Self::Failed),
            -2 => Ok(Self::TimedOut),
            -3 => Ok(Self::Cancelled),
            other => Err(other),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker files of a single job, see `Naming` for how they are derived
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArtifactSet {
    /// present while the engine holds the job open
    pub lock_file: PathBuf,
    /// engine native result, large, removed after extraction
    pub output_file: PathBuf,
    /// engine scratch directory, removed after extraction
    pub work_folder: PathBuf,
    /// small extracted result, authoritative "done" signal
    pub result_file: PathBuf,
}

impl ArtifactSet {
    pub fn new(work_dir: &Path, name: &str, naming: &Naming) -> Self {
        Self {
            lock_file: work_dir.join(format!("{name}{}", naming.lock_suffix)),
            output_file: work_dir.join(format!("{name}{}", naming.output_suffix)),
            work_folder: work_dir.join(format!("{name}{}", naming.work_suffix)),
            result_file: work_dir.join(&naming.result_file),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Job {
    pub name: String,
    pub work_dir: PathBuf,
    pub prepare_script: PathBuf,
    // produced by the prepare stage, might not exist at discovery time
    pub compute_script: PathBuf,
    pub extract_script: PathBuf,
    pub artifacts: ArtifactSet,
    pub state: JobState,
    pub attempt: u32,
    pub started_at: Option<SystemTime>,
    pub finished_at: Option<SystemTime>,
}

impl Job {
    pub fn new(name: &str, work_dir: &Path, naming: &Naming) -> Self {
        Self {
            name: name.to_owned(),
            work_dir: work_dir.to_path_buf(),
            prepare_script: work_dir.join(format!("{name}{}", naming.prepare_suffix)),
            compute_script: work_dir.join(format!("{name}{}", naming.compute_suffix)),
            extract_script: work_dir.join(format!("{name}{}", naming.extract_suffix)),
            artifacts: ArtifactSet::new(work_dir, name, naming),
            state: JobState::Pending,
            attempt: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn script(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Prepare => &self.prepare_script,
            Stage::Compute => &self.compute_script,
            Stage::Extract => &self.extract_script,
        }
    }

    /// per stage log file the executor redirects stdout/ stderr into
    pub fn stage_log(&self, stage: Stage) -> PathBuf {
        self.work_dir.join(format!("{}_{stage}.log", self.name))
    }

    pub fn mark_started(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(SystemTime::now());
        }
    }

    pub fn finish(&mut self, state: JobState) {
        self.state = state;
        self.finished_at = Some(SystemTime::now());
    }
}

/// Ordered set of jobs sharing one concurrency lane and one control script
#[derive(Clone, Debug)]
pub struct JobGroup {
    name: String,
    jobs: Vec<Job>,
}

impl JobGroup {
    pub fn new(name: impl Into<String>, jobs: Vec<Job>) -> Self {
        Self {
            name: name.into(),
            jobs,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn jobs(&self) -> &[Job] {
        &self.jobs
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn into_jobs(self) -> Vec<Job> {
        self.jobs
    }
}
