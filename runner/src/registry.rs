use crate::{
    config::Naming,
    job::{Job, JobGroup},
};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Job root {0} is not a readable directory")]
    RootNotFound(PathBuf),
    #[error("Failed to build script globs")]
    InvalidGlobs(#[from] globset::Error),
    #[error("No jobs were discovered under {0}")]
    NoJobs(PathBuf),
}

/// How discovered jobs are split into concurrency lanes
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(tag = "by", rename_all = "lowercase", deny_unknown_fields)]
pub enum Grouping {
    /// every job in one lane
    #[default]
    Single,
    /// one lane per parent of the job directory, i.e. per structural family
    Parent,
    /// round robin over a fixed number of lanes
    Lanes { count: usize },
}

impl Grouping {
    /// split jobs (already in discovery order) into groups, order inside a group is kept
    pub fn apply(&self, jobs: Vec<Job>) -> Vec<JobGroup> {
        if jobs.is_empty() {
            return Vec::new();
        }

        match self {
            Self::Single => vec![JobGroup::new("all", jobs)],
            Self::Parent => {
                let mut families: BTreeMap<PathBuf, Vec<Job>> = BTreeMap::new();

                for job in jobs {
                    let family = job
                        .work_dir
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| job.work_dir.clone());

                    families.entry(family).or_default().push(job);
                }

                families
                    .into_iter()
                    .map(|(family, jobs)| {
                        let name = family
                            .file_name()
                            .map(|name| name.to_string_lossy().into_owned())
                            .unwrap_or_else(|| family.to_string_lossy().into_owned());

                        JobGroup::new(name, jobs)
                    })
                    .collect_vec()
            }
            Self::Lanes { count } => {
                let lanes = (*count).clamp(1, jobs.len());
                let mut buckets: Vec<Vec<Job>> = (0..lanes).map(|_| Vec::new()).collect();

                for (index, job) in jobs.into_iter().enumerate() {
                    buckets[index % lanes].push(job);
                }

                buckets
                    .into_iter()
                    .enumerate()
                    .map(|(index, jobs)| JobGroup::new(format!("lane-{}", index + 1), jobs))
                    .collect_vec()
            }
        }
    }
}

#[derive(Debug, Default)]
struct Found {
    prepare: bool,
    compute: bool,
}

fn suffix_glob(suffix: &str) -> Result<globset::Glob, globset::Error> {
    GlobBuilder::new(&format!("*{}", globset::escape(suffix)))
        .literal_separator(true)
        .build()
}

fn script_globs(naming: &Naming) -> Result<GlobSet, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    // index 0: prepare, index 1: compute
    builder.add(suffix_glob(&naming.prepare_suffix)?);
    builder.add(suffix_glob(&naming.compute_suffix)?);

    builder.build()
}

/// find all jobs below `root`, sorted by path, and split them into groups
pub fn discover(
    root: &Path,
    naming: &Naming,
    grouping: &Grouping,
) -> Result<Vec<JobGroup>, DiscoveryError> {
    let jobs = discover_jobs(root, naming)?;

    if jobs.is_empty() {
        return Err(DiscoveryError::NoJobs(root.to_path_buf()));
    }

    let groups = grouping.apply(jobs);
    info!(
        groups = groups.len(),
        jobs = groups.iter().map(JobGroup::len).sum::<usize>(),
        "Discovered jobs"
    );

    Ok(groups)
}

/// walk `root` for script pairs, jobs without a prepare script are excluded
pub fn discover_jobs(root: &Path, naming: &Naming) -> Result<Vec<Job>, DiscoveryError> {
    let root = fs::canonicalize(root)
        .ok()
        .filter(|root| root.is_dir())
        .ok_or_else(|| DiscoveryError::RootNotFound(root.to_path_buf()))?;
    let globs = script_globs(naming)?;
    let mut found: BTreeMap<(PathBuf, String), Found> = BTreeMap::new();

    let walker = WalkBuilder::new(&root)
        .standard_filters(false)
        .follow_links(false)
        .sort_by_file_path(|a, b| a.cmp(b))
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                warn!(error = ?error, "Failed to search for job scripts");
                continue;
            }
        };

        if !entry.file_type().map_or(false, |kind| kind.is_file()) {
            continue;
        }

        let file_name = entry.file_name().to_string_lossy();
        let (suffix, is_prepare) = match globs.matches(&*file_name).first().copied() {
            Some(0) => (&naming.prepare_suffix, true),
            Some(_) => (&naming.compute_suffix, false),
            None => continue,
        };

        let name = &file_name[..file_name.len() - suffix.len()];
        let dir = entry.path().parent().unwrap_or(&root).to_path_buf();

        if name.is_empty() {
            warn!(path = ?entry.path(), "Script has no job name in front of its suffix, excluded");
            continue;
        }

        let slot = found.entry((dir, name.to_owned())).or_default();
        if is_prepare {
            slot.prepare = true;
        } else {
            slot.compute = true;
        }
    }

    let mut jobs = Vec::with_capacity(found.len());

    for ((dir, name), scripts) in found {
        if !scripts.prepare {
            warn!(
                job = %name,
                dir = ?dir,
                "Found a compute script without a prepare script, excluded from the run"
            );
            continue;
        }

        debug!(job = %name, dir = ?dir, has_compute = scripts.compute, "Registered job");
        jobs.push(Job::new(&name, &dir, naming));
    }

    Ok(jobs)
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod registry_test;
