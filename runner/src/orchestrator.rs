use crate::{
    config::RunConfig,
    executors::StageExecutor,
    job::JobGroup,
    ledger::Ledger,
    poller::Clock,
    probe::ArtifactProbe,
    report::{FailureLog, GroupReport, Report},
    scheduler::Scheduler,
    sync::CancelToken,
};
use parking_lot::Mutex;
use rayon::ThreadPoolBuilder;
use std::sync::mpsc::sync_channel;
use tracing::{debug, info, instrument, warn};
use tracing_unwrap::ResultExt;

/// Runs one scheduler per group concurrently, staggering their first license checkout
pub struct Orchestrator<'a> {
    executor: &'a dyn StageExecutor,
    probe: &'a dyn ArtifactProbe,
    clock: &'a dyn Clock,
    config: &'a RunConfig,
    cancel: &'a CancelToken,
    failures: &'a FailureLog,
    ledger: &'a dyn Ledger,
}

impl<'a> Orchestrator<'a> {
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
        }
    }

    /// sleep for the stagger delay in poll sized slices so a cancel is not held up
    fn stagger(&self) {
        let deadline = self.clock.now() + self.config.stagger_delay;

        while !self.cancel.is_cancelled() {
            let now = self.clock.now();
            if now >= deadline {
                break;
            }

            self.clock
                .sleep((deadline - now).min(self.config.poll_interval));
        }
    }

    fn cancelled_report(&self, group: &JobGroup) -> GroupReport {
        let mut report = GroupReport::new(group.name(), self.failures.dir());
        report.cancelled = group.jobs().iter().map(|job| job.name.clone()).collect();

        report
    }

    /// run all groups to completion and collect their reports in input order
    ///
    /// Group g+1 starts `stagger_delay` after group g launched its first stage. A group that
    /// finishes without launching anything (everything already done) does not delay the next.
    #[instrument(skip_all, fields(groups = groups.len()))]
    pub fn run_groups(&self, groups: Vec<JobGroup>) -> Report {
        let count = groups.len();

        if count == 0 {
            warn!("No groups to run");
            return Report::new(Vec::new());
        }

        // one thread per group plus the one handing out the staggered starts
        let pool = ThreadPoolBuilder::new()
            .num_threads(count + 1)
            .thread_name(|index| format!("simq-group-{index}"))
            .build()
            .expect_or_log("Failed to start the group thread pool");
        let reports: Mutex<Vec<(usize, GroupReport)>> = Mutex::new(Vec::with_capacity(count));

        pool.scope(|scope| {
            let mut previous_launched = false;

            for (index, group) in groups.into_iter().enumerate() {
                if previous_launched {
                    debug!(
                        "Staggering next group by {}s",
                        self.config.stagger_delay.as_secs_f64()
                    );
                    self.stagger();
                }

                if self.cancel.is_cancelled() {
                    warn!(group = %group.name(), "Run cancelled before the group started");
                    reports.lock().push((index, self.cancelled_report(&group)));
                    continue;
                }

                info!(group = %group.name(), jobs = group.len(), "Starting group");

                let (sender, receiver) = sync_channel(1);
                let reports = &reports;

                scope.spawn(move |_| {
                    let report = Scheduler::new(
                        self.executor,
                        self.probe,
                        self.clock,
                        self.config,
                        self.cancel,
                        self.failures,
                        self.ledger,
                    )
                    .with_launch_signal(sender)
                    .run(group);

                    reports.lock().push((index, report));
                });

                // returns once the group launched a stage, or errors once it finished without
                previous_launched = receiver.recv().is_ok();
            }
        });

        let mut reports = reports.into_inner();
        reports.sort_by_key(|(index, _)| *index);

        let report = Report::new(reports.into_iter().map(|(_, report)| report).collect());
        report.log_summary();

        report
    }
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod orchestrator_test;
