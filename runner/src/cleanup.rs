use crate::{config::ResultCheck, job::Job, probe::ArtifactProbe};
use std::{fs, io, path::Path};
use tracing::{debug, info, warn};

/// What a cleanup pass actually removed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Reclaimed {
    pub output_file: bool,
    pub work_folder: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// a valid result exists, nothing to launch
    Done(Reclaimed),
    Run,
}

fn remove(path: &Path, result: io::Result<()>) -> bool {
    match result {
        Ok(()) => {
            debug!(path = ?path, "Removed");
            true
        }
        Err(error) if error.kind() == io::ErrorKind::NotFound => false,
        Err(error) => {
            warn!(path = ?path, error = ?error, "Failed to remove intermediate artifact");
            false
        }
    }
}

/// delete the output file and work folder of a job, missing files are fine
pub fn reclaim(job: &Job) -> Reclaimed {
    let output = &job.artifacts.output_file;
    let folder = &job.artifacts.work_folder;

    Reclaimed {
        output_file: remove(output, fs::remove_file(output)),
        work_folder: remove(folder, fs::remove_dir_all(folder)),
    }
}

/// remove a lock file left behind by an earlier, interrupted run
/// only call this while no compute stage of the job is in flight
pub fn remove_stale_lock(job: &Job) -> bool {
    let lock = &job.artifacts.lock_file;
    let removed = remove(lock, fs::remove_file(lock));

    if removed {
        info!(job = %job.name, "Removed stale lock file");
    }

    removed
}

/// skip jobs that already have a valid result, cleaning up what a previous run left behind
pub fn resume(job: &Job, probe: &dyn ArtifactProbe, check: &ResultCheck) -> Resume {
    if !probe.has_valid_result(job, check) {
        return Resume::Run;
    }

    let reclaimed = reclaim(job);
    info!(
        job = %job.name,
        output_removed = reclaimed.output_file,
        work_folder_removed = reclaimed.work_folder,
        "Valid result exists, skipping"
    );

    Resume::Done(reclaimed)
}
