use crate::{
    config::RunConfig,
    executors::StageHandle,
    job::{Job, JobState, Stage},
    probe::ArtifactProbe,
    sync::CancelToken,
};
use std::{
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Time source of the poller, swapped for a virtual clock in tests
pub trait Clock: Send + Sync {
    /// monotonic time since an arbitrary, fixed epoch
    fn now(&self) -> Duration;

    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration)
    }
}

/// elapsed time in minutes, the unit operators think in for engine runs
pub fn minutes(duration: Duration) -> f64 {
    duration.as_secs_f64() / 60.0
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub stage: Stage,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub elapsed: Duration,
    // every state the stage went through, starting at `Launched`
    pub history: Vec<JobState>,
}

/// Blocking wait loop that turns filesystem state into a stage result
pub struct Poller<'a> {
    probe: &'a dyn ArtifactProbe,
    clock: &'a dyn Clock,
    config: &'a RunConfig,
    cancel: &'a CancelToken,
}

impl<'a> Poller<'a> {
    pub fn new(
        probe: &'a dyn ArtifactProbe,
        clock: &'a dyn Clock,
        config: &'a RunConfig,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            probe,
            clock,
            config,
            cancel,
        }
    }

    /// decide on a terminal state for the current tick, `None` keeps waiting
    fn evaluate(
        &self,
        stage: Stage,
        job: &Job,
        exit: Option<i32>,
        ticks_since_exit: u32,
    ) -> Option<JobState> {
        match stage {
            Stage::Compute => {
                let has_output = self.probe.has_output(job);
                let locked = self.probe.is_locked(job);

                if has_output && !locked {
                    return Some(JobState::Succeeded);
                }

                match exit {
                    Some(code) if code != 0 && !has_output => Some(JobState::Failed),
                    // clean exit, nothing written and nothing held open: give the filesystem
                    // one more tick before calling it
                    Some(0) if !has_output && !locked && ticks_since_exit > 1 => {
                        warn!(job = %job.name, "Engine exited cleanly without writing an output file");

                        Some(JobState::Failed)
                    }
                    _ => None,
                }
            }
            Stage::Extract => match exit {
                Some(0) => {
                    if self.probe.has_valid_result(job, &self.config.result) {
                        Some(JobState::Succeeded)
                    } else {
                        warn!(job = %job.name, "Extract finished but the result file is missing or invalid");

                        Some(JobState::Failed)
                    }
                }
                Some(_) => Some(JobState::Failed),
                None => None,
            },
            Stage::Prepare => match exit {
                Some(0) => {
                    if self.probe.has_input(job) {
                        Some(JobState::Succeeded)
                    } else {
                        warn!(
                            job = %job.name,
                            input = ?job.compute_script,
                            "Prepare finished but produced no compute input"
                        );

                        Some(JobState::Failed)
                    }
                }
                Some(_) => Some(JobState::Failed),
                None => None,
            },
        }
    }

    /// wait for a launched stage until it succeeds, fails, times out or the run is cancelled
    /// the process is never killed, a timed out engine may still finish on its own
    pub fn poll(&self, stage: Stage, job: &Job, mut handle: Box<dyn StageHandle>) -> StageOutcome {
        let started = self.clock.now();
        let mut last_progress = started;
        let mut history = vec![JobState::Launched];
        let mut exit: Option<i32> = None;
        let mut ticks_since_exit = 0;

        loop {
            if self.cancel.is_cancelled() {
                history.push(JobState::Cancelled);
                debug!(job = %job.name, %stage, "Stopped waiting, run was cancelled");

                return StageOutcome {
                    stage,
                    state: JobState::Cancelled,
                    exit_code: exit,
                    elapsed: self.clock.now().saturating_sub(started),
                    history,
                };
            }

            match handle.wait_tick(self.config.poll_interval, self.clock) {
                Ok(Some(code)) => {
                    if exit.is_none() {
                        debug!(job = %job.name, %stage, pid = ?handle.id(), code, "Stage process exited");
                        exit = Some(code);
                    }
                    ticks_since_exit += 1;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(job = %job.name, %stage, error = ?error, "Failed to check stage process, relying on marker files");
                    self.clock.sleep(self.config.poll_interval);
                }
            }

            if history.last() == Some(&JobState::Launched) {
                history.push(JobState::Running);
            }

            let now = self.clock.now();
            let elapsed = now.saturating_sub(started);

            if let Some(state) = self.evaluate(stage, job, exit, ticks_since_exit) {
                history.push(state);

                return StageOutcome {
                    stage,
                    state,
                    exit_code: exit,
                    elapsed,
                    history,
                };
            }

            if elapsed > self.config.stage_timeout {
                history.push(JobState::TimedOut);

                return StageOutcome {
                    stage,
                    state: JobState::TimedOut,
                    exit_code: exit,
                    elapsed,
                    history,
                };
            }

            if now.saturating_sub(last_progress) >= self.config.progress_interval {
                info!(
                    job = %job.name,
                    %stage,
                    "Running ... ({:.1} min elapsed)",
                    minutes(elapsed)
                );
                last_progress = now;
            }
        }
    }
}

#[cfg(test)]
#[path = "poller_test.rs"]
mod poller_test;
