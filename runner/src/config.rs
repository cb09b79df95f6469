use crate::registry::Grouping;
use crate::script::QueueHeader;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    io::Error,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{error, warn};

// check if a file is executable
pub fn check_executable(path: &Path) -> Result<bool, ConfigErrors> {
    if !path.is_file() {
        Err(ConfigErrors::FileNotFound(path.to_path_buf()))
    } else {
        match File::open(path).map(|file| file.metadata()) {
            Ok(Ok(metadata)) => Ok((metadata.mode() & 0o111) != 0),
            Ok(Err(e)) | Err(e) => Err(ConfigErrors::MetadataNotFound(e)),
        }
    }
}

/// resolve a program the same way the shell would, either a path or a lookup in $PATH
pub fn find_executable(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);

    if candidate.components().count() > 1 {
        return check_executable(candidate)
            .ok()
            .filter(|executable| *executable)
            .map(|_| candidate.to_path_buf());
    }

    env::var_os("PATH").and_then(|paths| {
        env::split_paths(&paths)
            .map(|dir| dir.join(program))
            .find(|path| matches!(check_executable(path), Ok(true)))
    })
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("File not found: {0}")]
    FileNotFound(PathBuf),
    #[error("Metadata not found")]
    MetadataNotFound(#[from] Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct SimqConfig {
    // directory searched for job scripts
    pub root: PathBuf,
    #[serde(default)]
    pub naming: Naming,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub result: ResultCheck,
    #[serde(default)]
    pub grouping: Grouping,
    // header for generated control scripts, only needed when submitting to a cluster queue
    pub queue: Option<QueueHeader>,
    // failure logs and the run report, relative paths are resolved against `root`
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    // optional SQLite ledger of stage outcomes
    pub ledger: Option<PathBuf>,
}

/// File name conventions that tie a job to its scripts and marker files
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct Naming {
    pub prepare_suffix: String,
    pub compute_suffix: String,
    pub extract_suffix: String,
    pub lock_suffix: String,
    pub output_suffix: String,
    pub work_suffix: String,
    pub result_file: String,
}

impl Default for Naming {
    fn default() -> Self {
        Self {
            prepare_suffix: "_prepare.py".into(),
            compute_suffix: ".inp".into(),
            extract_suffix: "_extract.py".into(),
            lock_suffix: ".lck".into(),
            output_suffix: ".odb".into(),
            work_suffix: ".abq".into(),
            result_file: "result.txt".into(),
        }
    }
}

/// Command line templates for the engine, see `executors::template` for placeholders
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    pub prepare: Vec<String>,
    pub compute: Vec<String>,
    pub extract: Vec<String>,
    // parallelism hint handed to the compute stage
    pub cpus: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prepare: vec!["abaqus".into(), "cae".into(), "noGUI={script}".into()],
            compute: vec![
                "abaqus".into(),
                "job={job}".into(),
                "input={input}".into(),
                "cpus={cpus}".into(),
                "interactive".into(),
            ],
            extract: vec!["abaqus".into(), "cae".into(), "noGUI={script}".into()],
            cpus: 8,
        }
    }
}

/// Timing knobs of the scheduler, all values in seconds
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields, default)]
pub struct SchedulerConfig {
    pub poll_interval: u64,
    pub progress_interval: u64,
    pub stage_timeout: u64,
    pub stagger_delay: u64,
    pub max_retries: u32,
    pub retry_delay: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: 30,
            progress_interval: 300,
            stage_timeout: 48 * 3600,
            stagger_delay: 30,
            max_retries: 2,
            retry_delay: 2,
        }
    }
}

/// What makes a result file count as a finished job
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct ResultCheck {
    pub min_size: u64,
    // any of these has to show up in the file, empty disables the content check
    pub markers: Vec<String>,
}

impl Default for ResultCheck {
    fn default() -> Self {
        Self {
            min_size: 2000,
            markers: Vec::new(),
        }
    }
}

/// Immutable settings of one orchestrator invocation
#[derive(Clone, Debug)]
pub struct RunConfig {
    pub poll_interval: Duration,
    pub progress_interval: Duration,
    pub stage_timeout: Duration,
    pub stagger_delay: Duration,
    pub retry_delay: Duration,
    pub max_retries: u32,
    pub result: ResultCheck,
    pub log_dir: PathBuf,
}

impl SimqConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        if !path.is_file() {
            return Err(ConfigErrors::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;

        Ok(serde_yaml::from_str(&content)?)
    }

    /// always absolute, control scripts `cd` into job directories before appending to it
    pub fn log_dir(&self) -> PathBuf {
        let log_dir = if self.log_dir.is_absolute() {
            self.log_dir.clone()
        } else {
            self.root.join(&self.log_dir)
        };

        if log_dir.is_absolute() {
            return log_dir;
        }

        match env::current_dir() {
            Ok(cwd) => cwd.join(log_dir),
            Err(error) => {
                warn!(error = ?error, path = ?log_dir, "Failed to resolve the log directory, keeping it relative");

                log_dir
            }
        }
    }

    pub fn run_config(&self) -> RunConfig {
        RunConfig {
            poll_interval: Duration::from_secs(self.scheduler.poll_interval),
            progress_interval: Duration::from_secs(self.scheduler.progress_interval),
            stage_timeout: Duration::from_secs(self.scheduler.stage_timeout),
            stagger_delay: Duration::from_secs(self.scheduler.stagger_delay),
            retry_delay: Duration::from_secs(self.scheduler.retry_delay),
            max_retries: self.scheduler.max_retries,
            result: self.result.clone(),
            log_dir: self.log_dir(),
        }
    }

    /// validate the config, returns true if any error was found
    /// every problem is logged before returning to make debugging easier for users
    pub fn preflight_checks(&self, require_engine: bool) -> bool {
        let mut contains_error = false;

        if !self.root.is_dir() {
            error!(
                "root {} is not a directory, unable to discover jobs",
                self.root.to_string_lossy()
            );
            contains_error = true;
        }

        let suffixes = [
            ("prepare_suffix", &self.naming.prepare_suffix),
            ("compute_suffix", &self.naming.compute_suffix),
            ("extract_suffix", &self.naming.extract_suffix),
            ("lock_suffix", &self.naming.lock_suffix),
            ("output_suffix", &self.naming.output_suffix),
            ("work_suffix", &self.naming.work_suffix),
        ];

        for (key, suffix) in suffixes.iter() {
            if suffix.is_empty() {
                error!("naming.{key} cannot be empty");
                contains_error = true;
            }
        }

        if suffixes.iter().map(|(_, suffix)| suffix).unique().count() != suffixes.len() {
            error!("naming suffixes must be distinct, otherwise marker files overlap with scripts");
            contains_error = true;
        }

        if self.naming.result_file.is_empty() {
            error!("naming.result_file cannot be empty");
            contains_error = true;
        }

        for (stage, template, placeholder) in [
            ("prepare", &self.engine.prepare, "{script}"),
            ("compute", &self.engine.compute, "{input}"),
            ("extract", &self.engine.extract, "{script}"),
        ] {
            match template.first() {
                None => {
                    error!("engine.{stage} needs at least a program to run");
                    contains_error = true;
                }
                Some(program) => {
                    if !template.iter().any(|arg| arg.contains(placeholder)) {
                        warn!("engine.{stage} does not reference {placeholder}, every job will run the same command");
                    }

                    if require_engine && find_executable(program).is_none() {
                        error!(
                            "engine.{stage} program '{program}' was not found or is not executable"
                        );
                        contains_error = true;
                    }
                }
            }
        }

        if self.engine.cpus == 0 {
            error!("engine.cpus cannot be 0");
            contains_error = true;
        }

        if self.scheduler.poll_interval == 0 {
            error!("scheduler.poll_interval cannot be 0, this would busy wait on the filesystem");
            contains_error = true;
        }

        if self.scheduler.stage_timeout == 0 {
            error!("scheduler.stage_timeout cannot be 0");
            contains_error = true;
        } else if self.scheduler.stage_timeout < self.scheduler.poll_interval {
            warn!("scheduler.stage_timeout is shorter than scheduler.poll_interval, stages time out after a single poll");
        }

        if self.scheduler.progress_interval < self.scheduler.poll_interval {
            warn!("scheduler.progress_interval is shorter than scheduler.poll_interval, progress is logged on every poll");
        }

        if let Grouping::Lanes { count: 0 } = self.grouping {
            error!("grouping.count cannot be 0");
            contains_error = true;
        }

        if let Some(queue) = &self.queue {
            contains_error |= queue.preflight_checks();
        }

        if self.result.min_size == 0 && self.result.markers.is_empty() {
            warn!("result.min_size is 0 and no markers are set, an empty result file counts as done");
        }

        contains_error
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
