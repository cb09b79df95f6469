use crate::{config::ResultCheck, job::Job};
use std::{
    fs::{self, File},
    io::{BufRead, BufReader},
};
use tracing::debug;

/// Filesystem predicates over a job's marker files
///
/// Implementations must not cache: the engine mutates the filesystem outside of our control,
/// every call has to look at the current state.
pub trait ArtifactProbe: Send + Sync {
    /// the engine still holds the job open
    fn is_locked(&self, job: &Job) -> bool;

    /// the engine wrote a non-empty output file
    fn has_output(&self, job: &Job) -> bool;

    /// the prepare stage produced the compute input
    fn has_input(&self, job: &Job) -> bool;

    /// a result file exists and passes size and marker checks
    /// an invalid result counts as absent, the job is re-run
    fn has_valid_result(&self, job: &Job, check: &ResultCheck) -> bool;
}

/// Probe working on the real filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl ArtifactProbe for FsProbe {
    fn is_locked(&self, job: &Job) -> bool {
        job.artifacts.lock_file.exists()
    }

    fn has_output(&self, job: &Job) -> bool {
        fs::metadata(&job.artifacts.output_file)
            .map(|metadata| metadata.is_file() && metadata.len() > 0)
            .unwrap_or(false)
    }

    fn has_input(&self, job: &Job) -> bool {
        job.compute_script.is_file()
    }

    fn has_valid_result(&self, job: &Job, check: &ResultCheck) -> bool {
        let path = &job.artifacts.result_file;
        let size = match fs::metadata(path) {
            Ok(metadata) if metadata.is_file() => metadata.len(),
            _ => return false,
        };

        if size < check.min_size {
            debug!(
                job = %job.name,
                size,
                min_size = check.min_size,
                "Result file is invalid or incomplete, will rerun"
            );

            return false;
        }

        if check.markers.is_empty() {
            return true;
        }

        let found = match File::open(path) {
            Ok(file) => contains_marker(BufReader::new(file), &check.markers),
            Err(error) => {
                debug!(job = %job.name, error = ?error, "Failed to read result file");

                false
            }
        };

        if !found {
            debug!(job = %job.name, "Result file has no result marker, will rerun");
        }

        found
    }
}

/// scan line by line, result files are small but we don't want to assume utf-8
pub fn contains_marker<R: BufRead>(mut reader: R, markers: &[String]) -> bool {
    let mut line = Vec::new();

    loop {
        line.clear();

        match reader.read_until(b'\n', &mut line) {
            Ok(0) | Err(_) => return false,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);

                if markers.iter().any(|marker| text.contains(marker.as_str())) {
                    return true;
                }
            }
        }
    }
}
