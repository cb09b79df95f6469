//! Fakes shared by the poller, scheduler and orchestrator tests

use crate::{
    config::{ResultCheck, RunConfig},
    executors::{LaunchError, StageExecutor, StageHandle},
    job::{Job, JobGroup, Stage},
    poller::Clock,
    probe::ArtifactProbe,
};
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub const RESULT_MARKER: &str = "RESULT";

/// Virtual time, `sleep` only moves the clock forward
#[derive(Debug, Default)]
pub struct FakeClock {
    now: Mutex<Duration>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration) {
        *self.now.lock() += duration;
    }
}

pub fn test_config(log_dir: &Path) -> RunConfig {
    RunConfig {
        poll_interval: Duration::from_secs(30),
        progress_interval: Duration::from_secs(300),
        stage_timeout: Duration::from_secs(3600),
        stagger_delay: Duration::from_secs(30),
        retry_delay: Duration::from_secs(2),
        max_retries: 0,
        result: ResultCheck {
            min_size: 16,
            markers: vec![RESULT_MARKER.to_string()],
        },
        log_dir: log_dir.to_path_buf(),
    }
}

/// In-memory sink for formatted log lines
#[derive(Clone, Debug, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    pub fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        let sink = self.clone();

        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || sink.clone())
            .finish()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// write a result file that passes `test_config`'s check
pub fn write_valid_result(job: &Job) {
    fs::write(
        &job.artifacts.result_file,
        format!("{RESULT_MARKER}\nstiffness 1.0e3\nyield 42.0\n"),
    )
    .unwrap();
}

/// one directory per job below `root`, with prepare and extract scripts in place
pub fn make_group(root: &Path, group: &str, names: &[&str]) -> JobGroup {
    let jobs = names
        .iter()
        .map(|name| {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            let job = Job::new(name, &dir, &Default::default());
            fs::write(&job.prepare_script, "# prepare\n").unwrap();
            fs::write(&job.extract_script, "# extract\n").unwrap();

            job
        })
        .collect();

    JobGroup::new(group, jobs)
}

/// Probe driven by flags instead of files
#[derive(Debug, Default)]
pub struct FakeProbe {
    pub locked: AtomicBool,
    pub output: AtomicBool,
    pub input: AtomicBool,
    pub valid_result: AtomicBool,
}

impl ArtifactProbe for FakeProbe {
    fn is_locked(&self, _job: &Job) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    fn has_output(&self, _job: &Job) -> bool {
        self.output.load(Ordering::SeqCst)
    }

    fn has_input(&self, _job: &Job) -> bool {
        self.input.load(Ordering::SeqCst)
    }

    fn has_valid_result(&self, _job: &Job, _check: &ResultCheck) -> bool {
        self.valid_result.load(Ordering::SeqCst)
    }
}

type Effect = Box<dyn FnOnce() + Send>;

/// Process that exits with `code` on its `exit_after`-th tick, `None` never exits
pub struct FakeHandle {
    exit_after: Option<u32>,
    code: i32,
    ticks: u32,
    on_exit: Option<Effect>,
    in_flight: Option<Arc<AtomicUsize>>,
}

impl FakeHandle {
    pub fn new(exit_after: Option<u32>, code: i32) -> Self {
        Self {
            exit_after,
            code,
            ticks: 0,
            on_exit: None,
            in_flight: None,
        }
    }

    /// run `effect` right before the exit is reported, like an engine writing its files
    pub fn on_exit(mut self, effect: impl FnOnce() + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(effect));
        self
    }

    fn track(mut self, in_flight: Arc<AtomicUsize>) -> Self {
        self.in_flight = Some(in_flight);
        self
    }
}

impl Drop for FakeHandle {
    fn drop(&mut self) {
        if let Some(in_flight) = &self.in_flight {
            in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl StageHandle for FakeHandle {
    fn id(&self) -> Option<u32> {
        None
    }

    fn wait_tick(&mut self, interval: Duration, clock: &dyn Clock) -> io::Result<Option<i32>> {
        clock.sleep(interval);
        self.ticks += 1;

        match self.exit_after {
            Some(after) if self.ticks >= after => {
                if let Some(effect) = self.on_exit.take() {
                    effect();
                }

                Ok(Some(self.code))
            }
            _ => Ok(None),
        }
    }
}

/// How the fake engine behaves for one (job, stage)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// writes what the real engine writes and exits 0
    Succeed,
    /// exits with the code without producing anything
    Fail(i32),
    /// fails the first n attempts, then succeeds
    FailTimes(u32),
    /// holds the lock and never exits
    Hang,
    /// cannot even be started
    Unlaunchable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Launch {
    pub job: String,
    pub stage: Stage,
    pub at: Duration,
}

/// Executor simulating the engine's filesystem side effects in the job directories
pub struct FakeExecutor {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    behaviour: HashMap<(String, Stage), Engine>,
    ticks: u32,
    pub launches: Mutex<Vec<Launch>>,
    in_flight: Arc<AtomicUsize>,
    pub max_in_flight: AtomicUsize,
    // most engine outputs present on disk at any compute launch
    pub max_outputs_on_disk: AtomicUsize,
}

impl FakeExecutor {
    pub fn new(root: &Path, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.to_path_buf(),
            clock,
            behaviour: HashMap::new(),
            ticks: 2,
            launches: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: AtomicUsize::new(0),
            max_outputs_on_disk: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, job: &str, stage: Stage, engine: Engine) -> Self {
        self.behaviour.insert((job.to_owned(), stage), engine);
        self
    }

    pub fn launched(&self) -> Vec<(String, Stage)> {
        self.launches
            .lock()
            .iter()
            .map(|launch| (launch.job.clone(), launch.stage))
            .collect()
    }

    pub fn launch_count(&self) -> usize {
        self.launches.lock().len()
    }

    fn outputs_on_disk(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };

        entries
            .filter_map(Result::ok)
            .filter_map(|dir| fs::read_dir(dir.path()).ok())
            .flatten()
            .filter_map(Result::ok)
            .filter(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.ends_with(".odb") || name.ends_with(".abq")
            })
            .map(|entry| entry.path().with_extension(""))
            .collect::<std::collections::HashSet<_>>()
            .len()
    }
}

impl StageExecutor for FakeExecutor {
    fn launch(&self, stage: Stage, job: &Job) -> Result<Box<dyn StageHandle>, LaunchError> {
        let engine = self
            .behaviour
            .get(&(job.name.clone(), stage))
            .copied()
            .unwrap_or(Engine::Succeed);

        if engine == Engine::Unlaunchable {
            return Err(LaunchError::ExecutableNotFound("fake-engine".into()));
        }

        let attempt = {
            let mut launches = self.launches.lock();
            launches.push(Launch {
                job: job.name.clone(),
                stage,
                at: self.clock.now(),
            });
            launches
                .iter()
                .filter(|launch| launch.job == job.name && launch.stage == stage)
                .count() as u32
        };

        if stage == Stage::Compute {
            self.max_outputs_on_disk
                .fetch_max(self.outputs_on_disk(), Ordering::SeqCst);
            fs::write(&job.artifacts.lock_file, "locked").unwrap();
        }

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let succeed = match engine {
            Engine::Succeed => true,
            Engine::FailTimes(times) => attempt > times,
            _ => false,
        };
        let job = job.clone();

        let handle = match engine {
            Engine::Hang => FakeHandle::new(None, 0),
            _ if succeed => FakeHandle::new(Some(self.ticks), 0).on_exit(move || match stage {
                Stage::Prepare => fs::write(&job.compute_script, "*Heading\n").unwrap(),
                Stage::Compute => {
                    fs::create_dir_all(&job.artifacts.work_folder).unwrap();
                    fs::write(&job.artifacts.output_file, vec![0u8; 4096]).unwrap();
                    fs::remove_file(&job.artifacts.lock_file).unwrap();
                }
                Stage::Extract => write_valid_result(&job),
            }),
            Engine::Fail(code) => FakeHandle::new(Some(self.ticks), code).on_exit(move || {
                if stage == Stage::Compute {
                    let _ = fs::remove_file(&job.artifacts.lock_file);
                }
            }),
            _ => FakeHandle::new(Some(self.ticks), 1).on_exit(move || {
                if stage == Stage::Compute {
                    let _ = fs::remove_file(&job.artifacts.lock_file);
                }
            }),
        };

        Ok(Box::new(handle.track(self.in_flight.clone())))
    }
}
