use crate::{
    cleanup::{self, Resume},
    config::RunConfig,
    executors::StageExecutor,
    job::{Job, JobGroup, JobState, Stage},
    ledger::{self, Ledger, LedgerEntry},
    poller::{minutes, Clock, Poller, StageOutcome},
    probe::ArtifactProbe,
    report::{FailureLog, GroupReport},
    sync::CancelToken,
};
use std::{sync::mpsc::SyncSender, time::Duration};
use tracing::{error, info, instrument, warn};

/// Runs one group through Phase 1 (all prepares) and Phase 2 (compute, extract and cleanup per
/// job), strictly one stage at a time
pub struct Scheduler<'a> {
    executor: &'a dyn StageExecutor,
    probe: &'a dyn ArtifactProbe,
    clock: &'a dyn Clock,
    config: &'a RunConfig,
    cancel: &'a CancelToken,
    failures: &'a FailureLog,
    ledger: &'a dyn Ledger,
    // fired once, right after the first successful launch of this group
    first_launch: Option<SyncSender<()>>,
}

impl<'a> Scheduler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: &'a dyn StageExecutor,
        probe: &'a dyn ArtifactProbe,
        clock: &'a dyn Clock,
        config: &'a RunConfig,
        cancel: &'a CancelToken,
        failures: &'a FailureLog,
        ledger: &'a dyn Ledger,
    ) -> Self {
        Self {
            executor,
            probe,
            clock,
            config,
            cancel,
            failures,
            ledger,
            first_launch: None,
        }
    }

    /// notify `sender` once this group has launched its first stage
    /// the sender is dropped when the scheduler returns, so waiting on it never hangs
    pub fn with_launch_signal(mut self, sender: SyncSender<()>) -> Self {
        self.first_launch = Some(sender);
        self
    }

    fn notify_launch(&mut self) {
        if let Some(sender) = self.first_launch.take() {
            // the receiving side may already be gone, nothing to do about it
            let _ = sender.send(());
        }
    }

    fn record(&self, job: &Job, step: &str, state: JobState, outcome: Option<&StageOutcome>) {
        ledger::record_or_log(
            self.ledger,
            &LedgerEntry {
                job,
                step,
                state,
                exit_code: outcome.and_then(|outcome| outcome.exit_code),
                elapsed: outcome.map_or(Duration::ZERO, |outcome| outcome.elapsed),
            },
        );
    }

    /// skip a job with a valid result, returns true if it was skipped
    fn try_resume(&self, job: &mut Job) -> bool {
        match cleanup::resume(job, self.probe, &self.config.result) {
            Resume::Done(_) => {
                job.finish(JobState::Succeeded);
                self.record(job, "resume", JobState::Succeeded, None);

                true
            }
            Resume::Run => false,
        }
    }

    /// launch and poll a single stage, relaunching failed attempts up to `max_retries` times
    fn run_stage(&mut self, stage: Stage, job: &mut Job) -> JobState {
        job.attempt = 0;

        loop {
            job.attempt += 1;

            if stage == Stage::Compute {
                // nothing of this job is in flight, any lock file is left over
                cleanup::remove_stale_lock(job);
            }

            let handle = match self.executor.launch(stage, job) {
                Ok(handle) => handle,
                Err(launch_error) => {
                    error!(job = %job.name, %stage, error = %launch_error, "Failed to launch stage");
                    self.failures
                        .append(stage, job, JobState::Failed, &launch_error.to_string());
                    self.record(job, stage.as_str(), JobState::Failed, None);

                    return JobState::Failed;
                }
            };

            self.notify_launch();
            job.mark_started();
            job.state = JobState::Running;
            info!(job = %job.name, %stage, attempt = job.attempt, pid = ?handle.id(), "launched");

            let outcome =
                Poller::new(self.probe, self.clock, self.config, self.cancel).poll(stage, job, handle);
            self.record(job, stage.as_str(), outcome.state, Some(&outcome));

            match outcome.state {
                JobState::Succeeded => {
                    info!(
                        job = %job.name,
                        %stage,
                        "succeeded ({:.1} min)",
                        minutes(outcome.elapsed)
                    );

                    return JobState::Succeeded;
                }
                JobState::Failed
                    if job.attempt <= self.config.max_retries && !self.cancel.is_cancelled() =>
                {
                    warn!(
                        job = %job.name,
                        %stage,
                        attempt = job.attempt,
                        exit_code = ?outcome.exit_code,
                        "failed, retrying in {}s",
                        self.config.retry_delay.as_secs()
                    );
                    self.clock.sleep(self.config.retry_delay);
                }
                JobState::Failed => {
                    warn!(job = %job.name, %stage, exit_code = ?outcome.exit_code, "failed");
                    let detail = match outcome.exit_code {
                        Some(code) => format!("exit code {code}"),
                        None => String::from("no exit code observed"),
                    };
                    self.failures.append(stage, job, JobState::Failed, &detail);

                    return JobState::Failed;
                }
                JobState::TimedOut => {
                    // distinct from a failure: the engine might be slow rather than broken
                    warn!(
                        job = %job.name,
                        %stage,
                        locked = self.probe.is_locked(job),
                        "timed out after {:.1} min, the process is left running",
                        minutes(outcome.elapsed)
                    );
                    let detail = format!(
                        "no completion after {:.1} min (lock file present: {})",
                        minutes(outcome.elapsed),
                        self.probe.is_locked(job)
                    );
                    self.failures.append(stage, job, JobState::TimedOut, &detail);

                    return JobState::TimedOut;
                }
                state => {
                    info!(job = %job.name, %stage, %state, "stopped waiting");

                    return state;
                }
            }
        }
    }

    /// Phase 1: every prepare back to back so the license is held as briefly as possible
    fn prepare_all(&mut self, jobs: &mut [Job]) {
        let total = jobs.len();
        info!(jobs = total, "Phase 1: prepare");

        for (index, job) in jobs.iter_mut().enumerate() {
            if self.cancel.is_cancelled() {
                warn!("Run cancelled, stopping Phase 1");
                break;
            }

            if self.try_resume(job) {
                continue;
            }

            info!(job = %job.name, "[{}/{total}] prepare", index + 1);

            match self.run_stage(Stage::Prepare, job) {
                // stays non terminal, picked up by Phase 2
                JobState::Succeeded => {}
                state => job.finish(state),
            }
        }
    }

    /// Phase 2: compute, extract and cleanup as one unit per job, caps disk usage at one
    /// job's intermediate artifacts
    fn compute_all(&mut self, jobs: &mut [Job]) {
        let total = jobs.iter().filter(|job| !job.state.is_terminal()).count();
        info!(jobs = total, "Phase 2: compute and extract");

        for (index, job) in jobs
            .iter_mut()
            .filter(|job| !job.state.is_terminal())
            .enumerate()
        {
            if self.cancel.is_cancelled() {
                job.finish(JobState::Cancelled);
                continue;
            }

            if self.try_resume(job) {
                continue;
            }

            info!(job = %job.name, "[{}/{total}] compute", index + 1);

            let state = match self.run_stage(Stage::Compute, job) {
                JobState::Succeeded => self.run_stage(Stage::Extract, job),
                state => state,
            };

            if state == JobState::Cancelled {
                // the engine is still running on these files, the next run cleans up
                job.finish(state);
                continue;
            }

            let reclaimed = cleanup::reclaim(job);
            job.finish(state);

            info!(
                job = %job.name,
                state = %job.state,
                output_removed = reclaimed.output_file,
                work_folder_removed = reclaimed.work_folder,
                "finished"
            );
        }
    }

    #[instrument(skip_all, fields(group = %group.name()))]
    pub fn run(mut self, group: JobGroup) -> GroupReport {
        let mut report = GroupReport::new(group.name(), self.failures.dir());
        let mut jobs = group.into_jobs();

        self.prepare_all(&mut jobs);
        self.compute_all(&mut jobs);

        for job in jobs.iter() {
            report.record(job);
        }

        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            cancelled = report.cancelled.len(),
            "Group done"
        );

        report
    }
}

#[cfg(test)]
#[path = "scheduler_test.rs"]
mod scheduler_test;
